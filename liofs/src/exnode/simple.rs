//! JSON exnode descriptors.
//!
//! A flat stand-in for the full exnode format: a list of segments with their
//! sizes plus the id of the default view.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DeserializeOptions, Exnode, ExnodeService, Segment};
use crate::error::{LioError, Result};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub id: u64,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub size: u64,
}

fn default_kind() -> String {
    "linear".to_string()
}

impl Segment for SegmentDescriptor {
    fn id(&self) -> u64 {
        self.id
    }

    fn size(&self) -> u64 {
        self.size
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExnodeDescriptor {
    pub id: u64,
    #[serde(default)]
    pub default: Option<u64>,
    #[serde(default)]
    pub segments: Vec<SegmentDescriptor>,
}

impl ExnodeDescriptor {
    /// One segment of `size` bytes, set as the default view.
    pub fn single(id: u64, size: u64) -> Self {
        Self {
            id,
            default: Some(id + 1),
            segments: vec![SegmentDescriptor {
                id: id + 1,
                kind: default_kind(),
                size,
            }],
        }
    }

    pub fn to_text(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| LioError::Exnode(e.to_string()))
    }
}

#[derive(Default)]
struct ServiceState {
    /// Segment ids registered in the shared cache.
    cached: Mutex<HashSet<u64>>,
    clone_delay: Option<Duration>,
}

/// [`ExnodeService`] over [`ExnodeDescriptor`] JSON text.
#[derive(Clone, Default)]
pub struct SimpleExnodeService {
    state: Arc<ServiceState>,
}

impl SimpleExnodeService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slows down every structural clone, for exercising clone timeouts.
    pub fn with_clone_delay(delay: Duration) -> Self {
        Self {
            state: Arc::new(ServiceState {
                clone_delay: Some(delay),
                ..Default::default()
            }),
        }
    }

    pub fn cached_segments(&self) -> usize {
        self.state
            .cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl ExnodeService for SimpleExnodeService {
    fn deserialize(&self, text: &str, opts: DeserializeOptions) -> Result<Box<dyn Exnode>> {
        let desc: ExnodeDescriptor = serde_json::from_str(text)
            .map_err(|e| LioError::Exnode(format!("unparseable exnode: {e}")))?;
        if let Some(default) = desc.default {
            if !desc.segments.iter().any(|s| s.id == default) {
                return Err(LioError::Exnode(format!(
                    "default view {default} is not a segment of exnode {}",
                    desc.id
                )));
            }
        }
        if !opts.no_cache {
            let mut cached = self
                .state
                .cached
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cached.extend(desc.segments.iter().map(|s| s.id));
        }
        Ok(Box::new(SimpleExnode {
            desc,
            service: self.clone(),
        }))
    }

    fn generate_id(&self) -> u64 {
        Uuid::new_v4().as_u64_pair().0
    }
}

struct SimpleExnode {
    desc: ExnodeDescriptor,
    service: SimpleExnodeService,
}

#[async_trait]
impl Exnode for SimpleExnode {
    fn default_segment(&self) -> Option<&dyn Segment> {
        let default = self.desc.default?;
        self.desc
            .segments
            .iter()
            .find(|s| s.id == default)
            .map(|s| s as &dyn Segment)
    }

    async fn clone_structure(&self) -> Result<Box<dyn Exnode>> {
        if let Some(delay) = self.service.state.clone_delay {
            tokio::time::sleep(delay).await;
        }
        let mut desc = self.desc.clone();
        desc.id = self.service.generate_id();
        for seg in desc.segments.iter_mut() {
            let fresh = self.service.generate_id();
            if desc.default == Some(seg.id) {
                desc.default = Some(fresh);
            }
            seg.id = fresh;
        }
        debug!("cloned exnode {} as {}", self.desc.id, desc.id);
        Ok(Box::new(SimpleExnode {
            desc,
            service: self.service.clone(),
        }))
    }

    fn serialize(&self) -> Result<String> {
        self.desc.to_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clone_keeps_layout_with_new_ids() {
        let svc = SimpleExnodeService::new();
        let text = ExnodeDescriptor::single(10, 4096).to_text().unwrap();
        let ex = svc.deserialize(&text, DeserializeOptions::no_cache()).unwrap();
        assert_eq!(ex.default_segment().map(|s| s.size()), Some(4096));
        assert_eq!(svc.cached_segments(), 0);

        let clone = ex.clone_structure().await.unwrap();
        let seg = clone.default_segment().unwrap();
        assert_eq!(seg.size(), 4096);
        assert_ne!(seg.id(), 11);

        let back: ExnodeDescriptor = serde_json::from_str(&clone.serialize().unwrap()).unwrap();
        assert_ne!(back.id, 10);
        assert_eq!(back.segments.len(), 1);
    }

    #[test]
    fn test_deserialize_rejects_bad_text() {
        let svc = SimpleExnodeService::new();
        assert!(svc.deserialize("not json", DeserializeOptions::default()).is_err());
        assert!(
            svc.deserialize(
                r#"{"id":1,"default":9,"segments":[]}"#,
                DeserializeOptions::default()
            )
            .is_err()
        );

        let ex = svc
            .deserialize(r#"{"id":1}"#, DeserializeOptions::default())
            .unwrap();
        assert!(ex.default_segment().is_none());
    }

    #[test]
    fn test_cache_registration() {
        let svc = SimpleExnodeService::new();
        let text = ExnodeDescriptor::single(1, 1).to_text().unwrap();
        svc.deserialize(&text, DeserializeOptions::default()).unwrap();
        assert_eq!(svc.cached_segments(), 1);
    }
}
