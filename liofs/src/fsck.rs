//! Metadata consistency check and repair.
//!
//! Every object is expected to carry four system attributes: an owner, an
//! inode number, an exnode and (for non-directories) the size of the
//! exnode's default view. A check inspects them in that order and, depending
//! on the [`FsckPolicy`], flags, repairs or deletes. The result is an
//! [`FsckOutcome`] bitmask carried in the check operation's error code.

use std::sync::Arc;

use async_trait::async_trait;
use bitflags::bitflags;
use futures::Stream;
use libopque::{OpStatus, Operation, Pipeline, PipelineEvent, WorkProducer};
use log::{debug, error, info, warn};

use crate::attrs::{get_attr, get_multiple_attrs, set_attr};
use crate::context::LioContext;
use crate::error::{LioError, Result};
use crate::exnode::{DeserializeOptions, Exnode};
use crate::namespace::{exists, remove_object};
use crate::os::{AttrValue, ObjectIter, ObjectQuery, ObjectType, PathPattern, path_split};

pub const OWNER_KEY: &str = "system.owner";
pub const INODE_KEY: &str = "system.inode";
pub const EXNODE_KEY: &str = "system.exnode";
pub const EXNODE_SIZE_KEY: &str = "system.exnode.size";

/// Attributes a check looks at, in record order.
pub const FSCK_KEYS: [&str; 4] = [OWNER_KEY, INODE_KEY, EXNODE_KEY, EXNODE_SIZE_KEY];

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct FsckOutcome: i32 {
        const MISSING_OWNER = 1;
        const MISSING_INODE = 2;
        const MISSING_EXNODE = 4;
        const MISSING_EXNODE_SIZE = 8;
        /// The object itself does not exist.
        const MISSING = 16;
    }
}

impl FsckOutcome {
    pub const GOOD: FsckOutcome = FsckOutcome::empty();

    pub fn is_good(&self) -> bool {
        self.is_empty()
    }
}

/// What to do about a missing attribute.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FsckMode {
    /// Report only.
    #[default]
    Manual,
    /// Take the value from the parent directory.
    InheritFromParent,
    /// Use the value supplied in the policy.
    AssignFixed,
    /// Remove the object and stop checking it.
    Delete,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsckPolicy {
    /// Applies to the owner and the inode.
    pub owner_mode: FsckMode,
    /// Owner written in [`FsckMode::AssignFixed`].
    pub owner: Option<String>,
    pub exnode_mode: FsckMode,
    /// Rewrite a missing or stale size instead of reporting it.
    pub repair_size: bool,
}

impl FsckPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.owner_mode == FsckMode::AssignFixed && self.owner.is_none() {
            return Err(LioError::InvalidConfig(
                "owner mode AssignFixed needs an owner".to_string(),
            ));
        }
        Ok(())
    }
}

/// The four checked attribute values of one object.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FsckRecord {
    pub owner: AttrValue,
    pub inode: AttrValue,
    pub exnode: AttrValue,
    pub size: AttrValue,
}

impl FsckRecord {
    /// Builds a record from values fetched for [`FSCK_KEYS`].
    pub fn from_values(values: Vec<AttrValue>) -> Self {
        let mut values = values.into_iter();
        let mut next = || values.next().flatten().filter(|v| !v.is_empty());
        Self {
            owner: next(),
            inode: next(),
            exnode: next(),
            size: next(),
        }
    }
}

enum Flow {
    Continue,
    /// The object was deleted or cannot be checked further.
    Stop,
}

struct Check<'a> {
    lc: &'a LioContext,
    path: &'a str,
    ftype: ObjectType,
    policy: &'a FsckPolicy,
    outcome: FsckOutcome,
}

impl Check<'_> {
    /// Writes a repaired value; a failed write leaves `flag` raised.
    async fn repair(&mut self, key: &str, value: &str, flag: FsckOutcome) {
        if let Err(e) = set_attr(self.lc, self.path, None, key, Some(value)).await {
            warn!("fsck could not repair {key} on {}: {e}", self.path);
            self.outcome |= flag;
        }
    }

    async fn delete(&mut self, flag: FsckOutcome) -> Flow {
        info!("fsck deleting {}", self.path);
        if let Err(e) = remove_object(self.lc, self.path).await {
            error!("fsck could not delete {}: {e}", self.path);
            self.outcome |= flag;
        }
        Flow::Stop
    }

    async fn parent_attr(&self, key: &str) -> AttrValue {
        let (parent, _) = path_split(self.path);
        match get_attr(self.lc, &parent, None, key).await {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                debug!("fsck could not read {key} of parent {parent}: {e}");
                None
            }
        }
    }

    async fn owner(&mut self, owner: &AttrValue) -> Flow {
        if owner.is_some() {
            return Flow::Continue;
        }
        let policy = self.policy;
        match policy.owner_mode {
            FsckMode::Manual => self.outcome |= FsckOutcome::MISSING_OWNER,
            FsckMode::InheritFromParent => match self.parent_attr(OWNER_KEY).await {
                Some(owner) => {
                    self.repair(OWNER_KEY, &owner, FsckOutcome::MISSING_OWNER)
                        .await
                }
                None => self.outcome |= FsckOutcome::MISSING_OWNER,
            },
            FsckMode::AssignFixed => match policy.owner.as_deref() {
                Some(owner) => {
                    self.repair(OWNER_KEY, owner, FsckOutcome::MISSING_OWNER)
                        .await
                }
                None => self.outcome |= FsckOutcome::MISSING_OWNER,
            },
            FsckMode::Delete => return self.delete(FsckOutcome::MISSING_OWNER).await,
        }
        Flow::Continue
    }

    async fn inode(&mut self, inode: &AttrValue) -> Flow {
        if inode.is_some() {
            return Flow::Continue;
        }
        match self.policy.owner_mode {
            FsckMode::Manual => self.outcome |= FsckOutcome::MISSING_INODE,
            FsckMode::InheritFromParent | FsckMode::AssignFixed => {
                let ino = self.lc.exnodes().generate_id().to_string();
                self.repair(INODE_KEY, &ino, FsckOutcome::MISSING_INODE)
                    .await;
            }
            FsckMode::Delete => return self.delete(FsckOutcome::MISSING_INODE).await,
        }
        Flow::Continue
    }

    /// Loads the exnode, inheriting the parent's when allowed. `None` means
    /// the check stops here.
    async fn exnode(&mut self, stored: Option<String>) -> Option<Box<dyn Exnode>> {
        let (text, inherited) = match stored {
            Some(text) => (text, false),
            None => match self.policy.exnode_mode {
                FsckMode::Manual | FsckMode::AssignFixed => {
                    self.outcome |= FsckOutcome::MISSING_EXNODE;
                    return None;
                }
                FsckMode::InheritFromParent => match self.parent_attr(EXNODE_KEY).await {
                    Some(text) => (text, true),
                    None => {
                        self.outcome |= FsckOutcome::MISSING_EXNODE;
                        return None;
                    }
                },
                FsckMode::Delete => {
                    self.delete(FsckOutcome::MISSING_EXNODE).await;
                    return None;
                }
            },
        };

        // several copies of one exnode may be live, keep them out of the
        // shared segment cache
        let ex = match self
            .lc
            .exnodes()
            .deserialize(&text, DeserializeOptions::no_cache())
        {
            Ok(ex) => ex,
            Err(e) => {
                warn!("fsck found a bad exnode on {}: {e}", self.path);
                self.outcome |= FsckOutcome::MISSING_EXNODE;
                return None;
            }
        };
        if !inherited {
            return Some(ex);
        }

        let timeout = self.lc.config().timeout();
        let cloned = match tokio::time::timeout(timeout, ex.clone_structure()).await {
            Ok(Ok(cloned)) => cloned,
            Ok(Err(e)) => {
                warn!("fsck could not clone parent exnode for {}: {e}", self.path);
                self.outcome |= FsckOutcome::MISSING_EXNODE;
                return None;
            }
            Err(_) => {
                warn!(
                    "fsck timed out cloning parent exnode for {} after {timeout:?}",
                    self.path
                );
                self.outcome |= FsckOutcome::MISSING_EXNODE;
                return None;
            }
        };
        match cloned.serialize() {
            Ok(text) => {
                self.repair(EXNODE_KEY, &text, FsckOutcome::MISSING_EXNODE)
                    .await
            }
            Err(e) => {
                warn!("fsck could not serialize exnode for {}: {e}", self.path);
                self.outcome |= FsckOutcome::MISSING_EXNODE;
            }
        }
        Some(cloned)
    }

    async fn size(&mut self, ex: &dyn Exnode, stored: Option<&str>) {
        let Some(seg) = ex.default_segment() else {
            self.outcome |= FsckOutcome::MISSING_EXNODE;
            return;
        };
        let actual = seg.size();
        if stored.and_then(|s| s.trim().parse::<u64>().ok()) == Some(actual) {
            return;
        }
        if !self.policy.repair_size {
            self.outcome |= FsckOutcome::MISSING_EXNODE_SIZE;
            return;
        }
        debug!(
            "fsck setting size of {} to {actual} (was {stored:?})",
            self.path
        );
        self.repair(
            EXNODE_SIZE_KEY,
            &actual.to_string(),
            FsckOutcome::MISSING_EXNODE_SIZE,
        )
        .await;
    }
}

/// Checks one object against `record` and applies `policy`.
///
/// Each repair is attempted once; the write primitive does its own retry.
pub async fn check_object(
    lc: &LioContext,
    path: &str,
    ftype: ObjectType,
    policy: &FsckPolicy,
    record: FsckRecord,
) -> FsckOutcome {
    let mut check = Check {
        lc,
        path,
        ftype,
        policy,
        outcome: FsckOutcome::GOOD,
    };

    if let Flow::Stop = check.owner(&record.owner).await {
        return check.outcome;
    }
    if let Flow::Stop = check.inode(&record.inode).await {
        return check.outcome;
    }
    let Some(ex) = check.exnode(record.exnode).await else {
        return check.outcome;
    };
    if !check.ftype.is_dir() {
        check.size(ex.as_ref(), record.size.as_deref()).await;
    }
    debug!("fsck {path}: {:?}", check.outcome);
    check.outcome
}

/// Checks `path`, reading its attributes first. An empty `ftype` is looked
/// up. Fails with [`FsckOutcome::MISSING`] when the object does not exist.
pub fn fsck_object(
    lc: &Arc<LioContext>,
    path: &str,
    ftype: ObjectType,
    policy: FsckPolicy,
) -> Operation {
    let ctx = lc.clone();
    let path = path.to_string();
    Operation::new(lc.tpc_unlimited(), async move {
        let missing = OpStatus::failure_with(FsckOutcome::MISSING.bits());
        let ftype = if ftype.is_empty() {
            match exists(&ctx, &path).await {
                Ok(ftype) => ftype,
                Err(e) => {
                    warn!("fsck could not stat {path}: {e}");
                    return missing;
                }
            }
        } else {
            ftype
        };
        if ftype.is_empty() {
            return missing;
        }

        let record = match get_multiple_attrs(&ctx, &path, None, &FSCK_KEYS).await {
            Ok(values) => FsckRecord::from_values(values),
            Err(e) if e.is_not_found() => return missing,
            Err(e) => {
                // nothing is repaired on an unreadable object
                warn!("fsck could not read attributes of {path}: {e}");
                let unknown = FsckOutcome::MISSING_OWNER
                    | FsckOutcome::MISSING_INODE
                    | FsckOutcome::MISSING_EXNODE
                    | FsckOutcome::MISSING_EXNODE_SIZE;
                return OpStatus::failure_with(unknown.bits());
            }
        };
        let outcome = check_object(&ctx, &path, ftype, &policy, record).await;
        OpStatus::success_with(outcome.bits())
    })
}

/// Checks `path` against attributes the caller already fetched.
pub fn fsck_object_full(
    lc: &Arc<LioContext>,
    path: &str,
    ftype: ObjectType,
    policy: FsckPolicy,
    record: FsckRecord,
) -> Operation {
    let ctx = lc.clone();
    let path = path.to_string();
    Operation::new(lc.tpc_unlimited(), async move {
        let outcome = check_object(&ctx, &path, ftype, &policy, record).await;
        OpStatus::success_with(outcome.bits())
    })
}

/// An object that failed its check.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BadObject {
    pub outcome: FsckOutcome,
    pub path: String,
    pub ftype: ObjectType,
}

struct FsckTask {
    path: String,
    ftype: ObjectType,
    record: FsckRecord,
}

/// Listing errors in a row after which a walk is given up.
const MAX_CONSECUTIVE_LISTING_ERRORS: u32 = 8;

struct FsckProducer {
    ctx: Arc<LioContext>,
    policy: FsckPolicy,
    it: Box<dyn ObjectIter>,
    listing_errors: u64,
    abandoned: bool,
}

#[async_trait]
impl WorkProducer for FsckProducer {
    type Item = FsckTask;

    async fn next_item(&mut self) -> Option<FsckTask> {
        let mut in_a_row = 0;
        loop {
            match self.it.next_object().await {
                Ok(Some(entry)) => {
                    return Some(FsckTask {
                        record: FsckRecord::from_values(entry.attrs),
                        path: entry.path,
                        ftype: entry.ftype,
                    });
                }
                Ok(None) => return None,
                Err(e) => {
                    self.listing_errors += 1;
                    in_a_row += 1;
                    if in_a_row >= MAX_CONSECUTIVE_LISTING_ERRORS {
                        error!("fsck object listing keeps failing, giving up: {e}");
                        self.abandoned = true;
                        return None;
                    }
                    warn!("fsck object listing failed, skipping entry: {e}");
                }
            }
        }
    }

    fn launch(&self, task: &FsckTask) -> Operation {
        fsck_object_full(
            &self.ctx,
            &task.path,
            task.ftype,
            self.policy.clone(),
            task.record.clone(),
        )
    }
}

/// Walks a subtree and yields the objects that fail their check.
///
/// Up to `parallel_task_count` checks run at once. Results are reported one
/// at a time in completion order; good objects are counted but not returned.
pub struct FsckIter {
    pipeline: Pipeline<FsckProducer>,
    visited: u64,
}

impl FsckIter {
    pub fn create(lc: &Arc<LioContext>, path: &str, policy: FsckPolicy) -> Result<Self> {
        policy.validate()?;
        let query = ObjectQuery {
            pattern: PathPattern::from_glob(path)?,
            object_pattern: None,
            types: ObjectType::ANY,
            recurse_depth: lc.config().fsck_recurse_depth,
            prefetch: FSCK_KEYS.iter().map(|k| k.to_string()).collect(),
            max_attr_size: lc.config().max_attr_size,
        };
        let it = lc.os().create_object_iter(query).inspect_err(|e| {
            error!("fsck failed to create object iterator for {path}: {e}");
        })?;
        let producer = FsckProducer {
            ctx: lc.clone(),
            policy,
            it,
            listing_errors: 0,
            abandoned: false,
        };
        info!("fsck started on {path}");
        Ok(Self {
            pipeline: Pipeline::new(producer, lc.config().parallel_task_count),
            visited: 0,
        })
    }

    /// Next object with a non-good outcome, `None` once the walk is over.
    ///
    /// Listing errors do not end the walk; check [`FsckIter::listing_failed`]
    /// afterwards to learn whether objects may have been missed.
    pub async fn next(&mut self) -> Option<BadObject> {
        loop {
            match self.pipeline.next().await {
                PipelineEvent::Completed { item, status } => {
                    self.visited += 1;
                    let outcome = FsckOutcome::from_bits_truncate(status.error_code);
                    if outcome.is_good() {
                        continue;
                    }
                    debug!("fsck flagged {} as {outcome:?}", item.path);
                    return Some(BadObject {
                        outcome,
                        path: item.path,
                        ftype: item.ftype,
                    });
                }
                PipelineEvent::Finished => {
                    let producer = self.pipeline.producer();
                    if producer.listing_errors > 0 {
                        warn!(
                            "fsck finished after {} objects with {} listing errors{}",
                            self.visited,
                            producer.listing_errors,
                            if producer.abandoned { ", walk abandoned" } else { "" }
                        );
                    } else {
                        debug!("fsck finished after {} objects", self.visited);
                    }
                    return None;
                }
            }
        }
    }

    /// Objects whose check has completed so far.
    pub fn visited_count(&self) -> u64 {
        self.visited
    }

    /// Errors the object listing reported so far. Each one may stand for an
    /// object that was never checked.
    pub fn listing_errors(&self) -> u64 {
        self.pipeline.producer().listing_errors
    }

    /// True once the listing reported an error or was given up.
    pub fn listing_failed(&self) -> bool {
        let producer = self.pipeline.producer();
        producer.listing_errors > 0 || producer.abandoned
    }

    /// The remaining bad objects as a stream.
    pub fn into_stream(self) -> impl Stream<Item = BadObject> {
        futures::stream::unfold(self, |mut it| async move {
            let bad = it.next().await?;
            Some((bad, it))
        })
    }

    /// Waits for checks still in flight and releases the iterator.
    pub async fn destroy(self) {
        let visited = self.visited;
        self.pipeline.drain().await;
        info!("fsck iterator released after {visited} objects");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_bits() {
        assert!(FsckOutcome::GOOD.is_good());
        let all = FsckOutcome::MISSING_OWNER | FsckOutcome::MISSING_INODE;
        assert_eq!(all.bits(), 3);
        assert_eq!(FsckOutcome::MISSING.bits(), 16);
        assert_eq!(
            FsckOutcome::from_bits_truncate(4 | 8),
            FsckOutcome::MISSING_EXNODE | FsckOutcome::MISSING_EXNODE_SIZE
        );
    }

    #[test]
    fn test_policy_validation() {
        assert!(FsckPolicy::default().validate().is_ok());
        let fixed = FsckPolicy {
            owner_mode: FsckMode::AssignFixed,
            ..Default::default()
        };
        assert!(fixed.validate().is_err());
        let fixed = FsckPolicy {
            owner: Some("root".to_string()),
            ..fixed
        };
        assert!(fixed.validate().is_ok());
    }

    #[test]
    fn test_record_treats_empty_as_missing() {
        let record = FsckRecord::from_values(vec![
            Some("alice".to_string()),
            Some(String::new()),
            None,
        ]);
        assert_eq!(record.owner.as_deref(), Some("alice"));
        assert_eq!(record.inode, None);
        assert_eq!(record.exnode, None);
        assert_eq!(record.size, None);
    }
}
