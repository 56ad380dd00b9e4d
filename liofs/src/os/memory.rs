//! In-process [`ObjectStore`] with a call log.
//!
//! Objects live in a sorted map keyed by absolute path, so parents always
//! sort before their children. Every store call is appended to a log that
//! tests inspect to assert on call order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use regex::Regex;

use super::{
    AttrIter, AttrValue, ObjectEntry, ObjectFd, ObjectIter, ObjectQuery, ObjectStore, ObjectType,
    OpenMode, path_split,
};
use crate::error::{LioError, Result};

/// One recorded store call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OsCall {
    Exists(String),
    Open(String),
    Close(String),
    GetAttrs(String, Vec<String>),
    SetAttrs(String, Vec<(String, Option<String>)>),
    Create(String),
    Remove(String),
    Move(String, String),
    Symlink(String, String),
    Hardlink(String, String),
    Listed(String),
    AttrIter(String),
}

impl OsCall {
    pub fn path(&self) -> &str {
        match self {
            OsCall::Exists(p)
            | OsCall::Open(p)
            | OsCall::Close(p)
            | OsCall::GetAttrs(p, _)
            | OsCall::SetAttrs(p, _)
            | OsCall::Create(p)
            | OsCall::Remove(p)
            | OsCall::Listed(p)
            | OsCall::AttrIter(p) => p,
            OsCall::Move(_, dest) | OsCall::Symlink(_, dest) | OsCall::Hardlink(_, dest) => dest,
        }
    }

    pub fn is_attr_call(&self) -> bool {
        matches!(self, OsCall::GetAttrs(..) | OsCall::SetAttrs(..))
    }
}

#[derive(Clone, Debug)]
struct MemObject {
    ftype: ObjectType,
    attrs: HashMap<String, String>,
}

impl MemObject {
    fn new(ftype: ObjectType) -> Self {
        Self {
            ftype,
            attrs: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<String, MemObject>,
    calls: Vec<OsCall>,
    open_fds: HashMap<u64, String>,
    next_fd: u64,
    /// Remaining `set_attrs` calls that fail with a backend error.
    fail_set_attrs: u32,
    set_attrs_delay: Option<Duration>,
    /// Listing position at which the next object iterator reports an error.
    fail_listing_at: Option<usize>,
}

impl MemState {
    fn has_children(&self, path: &str) -> bool {
        let prefix = child_prefix(path);
        self.objects
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(p, _)| p.starts_with(&prefix))
    }

    fn require_parent_dir(&self, path: &str) -> Result<()> {
        let (parent, _) = path_split(path);
        match self.objects.get(&parent) {
            Some(obj) if obj.ftype.is_dir() => Ok(()),
            Some(_) => Err(LioError::InvalidPath(format!("{parent} is not a directory"))),
            None => Err(LioError::NotFound(parent)),
        }
    }

    fn insert_with_parents(&mut self, path: &str, ftype: ObjectType) {
        let mut parent = path_split(path).0;
        let mut missing = Vec::new();
        while !self.objects.contains_key(&parent) {
            missing.push(parent.clone());
            parent = path_split(&parent).0;
        }
        for dir in missing {
            self.objects.insert(dir, MemObject::new(ObjectType::DIR));
        }
        self.objects
            .entry(path.to_string())
            .or_insert_with(|| MemObject::new(ftype))
            .ftype = ftype;
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{path}/")
    }
}

fn normalize(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(LioError::InvalidPath(format!("{path} is not absolute")));
    }
    if path.len() > 1 {
        Ok(path.trim_end_matches('/').to_string())
    } else {
        Ok(path.to_string())
    }
}

fn truncate(mut value: String, max_size: usize) -> String {
    if value.len() > max_size {
        let mut end = max_size;
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        value.truncate(end);
    }
    value
}

#[derive(Clone)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<MemState>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    /// An empty namespace holding only the root directory.
    pub fn new() -> Self {
        let mut state = MemState::default();
        state
            .objects
            .insert("/".to_string(), MemObject::new(ObjectType::DIR));
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an object, creating missing parent directories. Not logged.
    pub fn insert(&self, path: &str, ftype: ObjectType) {
        self.state().insert_with_parents(path, ftype);
    }

    /// Builder form of [`MemoryObjectStore::insert`] that also sets attributes.
    pub fn with_object(self, path: &str, ftype: ObjectType, attrs: &[(&str, &str)]) -> Self {
        {
            let mut state = self.state();
            state.insert_with_parents(path, ftype);
            if let Some(obj) = state.objects.get_mut(path) {
                for (k, v) in attrs {
                    obj.attrs.insert(k.to_string(), v.to_string());
                }
            }
        }
        self
    }

    /// Current value of an attribute, bypassing the call log.
    pub fn attr(&self, path: &str, key: &str) -> Option<String> {
        self.state()
            .objects
            .get(path)
            .and_then(|obj| obj.attrs.get(key).cloned())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.state().objects.contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<OsCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Makes the next `n` attribute writes fail.
    pub fn fail_next_set_attrs(&self, n: u32) {
        self.state().fail_set_attrs = n;
    }

    /// Stalls every attribute write for `delay` before it is applied.
    pub fn delay_set_attrs(&self, delay: Duration) {
        self.state().set_attrs_delay = Some(delay);
    }

    /// Makes the next object iterator report one error after `listed`
    /// objects. The walk carries on afterwards.
    pub fn fail_listing_after(&self, listed: usize) {
        self.state().fail_listing_at = Some(listed);
    }

    /// Handles opened and not yet closed.
    pub fn open_handles(&self) -> usize {
        self.state().open_fds.len()
    }

    fn fd_path(state: &MemState, fd: &ObjectFd) -> Result<String> {
        match state.open_fds.get(&fd.handle) {
            Some(path) => Ok(path.clone()),
            None => Err(LioError::Backend(format!(
                "stale handle {} for {}",
                fd.handle, fd.path
            ))),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, path: &str) -> Result<ObjectType> {
        let path = normalize(path)?;
        let mut state = self.state();
        state.calls.push(OsCall::Exists(path.clone()));
        Ok(state
            .objects
            .get(&path)
            .map(|obj| obj.ftype)
            .unwrap_or_default())
    }

    async fn open_object(
        &self,
        path: &str,
        _mode: OpenMode,
        _id: Option<&str>,
    ) -> Result<ObjectFd> {
        let path = normalize(path)?;
        let mut state = self.state();
        state.calls.push(OsCall::Open(path.clone()));
        if !state.objects.contains_key(&path) {
            return Err(LioError::NotFound(path));
        }
        state.next_fd += 1;
        let handle = state.next_fd;
        state.open_fds.insert(handle, path.clone());
        Ok(ObjectFd { path, handle })
    }

    async fn close_object(&self, fd: ObjectFd) -> Result<()> {
        let mut state = self.state();
        state.calls.push(OsCall::Close(fd.path.clone()));
        match state.open_fds.remove(&fd.handle) {
            Some(_) => Ok(()),
            None => Err(LioError::Backend(format!("double close of {}", fd.path))),
        }
    }

    async fn get_attrs(
        &self,
        fd: &ObjectFd,
        keys: &[&str],
        max_size: usize,
    ) -> Result<Vec<AttrValue>> {
        let mut state = self.state();
        state.calls.push(OsCall::GetAttrs(
            fd.path.clone(),
            keys.iter().map(|k| k.to_string()).collect(),
        ));
        let path = Self::fd_path(&state, fd)?;
        let obj = state
            .objects
            .get(&path)
            .ok_or_else(|| LioError::NotFound(path.clone()))?;
        Ok(keys
            .iter()
            .map(|k| obj.attrs.get(*k).cloned().map(|v| truncate(v, max_size)))
            .collect())
    }

    async fn set_attrs(&self, fd: &ObjectFd, attrs: &[(&str, Option<&str>)]) -> Result<()> {
        let delay = self.state().set_attrs_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state();
        state.calls.push(OsCall::SetAttrs(
            fd.path.clone(),
            attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.map(str::to_string)))
                .collect(),
        ));
        if state.fail_set_attrs > 0 {
            state.fail_set_attrs -= 1;
            return Err(LioError::Backend(format!(
                "injected set_attrs failure on {}",
                fd.path
            )));
        }
        let path = Self::fd_path(&state, fd)?;
        let obj = state
            .objects
            .get_mut(&path)
            .ok_or_else(|| LioError::NotFound(path.clone()))?;
        for (k, v) in attrs {
            match v {
                Some(v) => obj.attrs.insert(k.to_string(), v.to_string()),
                None => obj.attrs.remove(*k),
            };
        }
        Ok(())
    }

    async fn create_object(&self, path: &str, ftype: ObjectType, _id: Option<&str>) -> Result<()> {
        let path = normalize(path)?;
        let mut state = self.state();
        state.calls.push(OsCall::Create(path.clone()));
        if state.objects.contains_key(&path) {
            return Err(LioError::Exists(path));
        }
        state.require_parent_dir(&path)?;
        state.objects.insert(path, MemObject::new(ftype));
        Ok(())
    }

    async fn remove_object(&self, path: &str) -> Result<()> {
        let path = normalize(path)?;
        let mut state = self.state();
        state.calls.push(OsCall::Remove(path.clone()));
        if path == "/" {
            return Err(LioError::InvalidPath("cannot remove the root".to_string()));
        }
        let Some(obj) = state.objects.get(&path) else {
            return Err(LioError::NotFound(path));
        };
        if obj.ftype.is_dir() && state.has_children(&path) {
            return Err(LioError::NotEmpty(path));
        }
        state.objects.remove(&path);
        debug!("memory store removed {path}");
        Ok(())
    }

    async fn move_object(&self, src: &str, dest: &str) -> Result<()> {
        let src = normalize(src)?;
        let dest = normalize(dest)?;
        let mut state = self.state();
        state.calls.push(OsCall::Move(src.clone(), dest.clone()));
        if !state.objects.contains_key(&src) {
            return Err(LioError::NotFound(src));
        }
        if state.objects.contains_key(&dest) {
            return Err(LioError::Exists(dest));
        }
        state.require_parent_dir(&dest)?;

        let prefix = child_prefix(&src);
        let moved: Vec<String> = state
            .objects
            .keys()
            .filter(|p| **p == src || p.starts_with(&prefix))
            .cloned()
            .collect();
        for old in moved {
            if let Some(obj) = state.objects.remove(&old) {
                let new = format!("{dest}{}", &old[src.len()..]);
                state.objects.insert(new, obj);
            }
        }
        Ok(())
    }

    async fn symlink_object(&self, src: &str, dest: &str, _id: Option<&str>) -> Result<()> {
        let dest = normalize(dest)?;
        let mut state = self.state();
        state.calls.push(OsCall::Symlink(src.to_string(), dest.clone()));
        if state.objects.contains_key(&dest) {
            return Err(LioError::Exists(dest));
        }
        state.require_parent_dir(&dest)?;
        // dangling links are allowed
        let target = state
            .objects
            .get(src)
            .map(|obj| obj.ftype & !ObjectType::HARDLINK)
            .unwrap_or(ObjectType::FILE);
        state
            .objects
            .insert(dest, MemObject::new(target | ObjectType::SYMLINK));
        Ok(())
    }

    async fn hardlink_object(&self, src: &str, dest: &str, _id: Option<&str>) -> Result<()> {
        let src = normalize(src)?;
        let dest = normalize(dest)?;
        let mut state = self.state();
        state.calls.push(OsCall::Hardlink(src.clone(), dest.clone()));
        let Some(obj) = state.objects.get(&src).cloned() else {
            return Err(LioError::NotFound(src));
        };
        if obj.ftype.is_dir() {
            return Err(LioError::InvalidPath(format!(
                "cannot hardlink directory {src}"
            )));
        }
        if state.objects.contains_key(&dest) {
            return Err(LioError::Exists(dest));
        }
        state.require_parent_dir(&dest)?;
        let mut linked = obj;
        linked.ftype |= ObjectType::HARDLINK;
        state.objects.insert(dest, linked);
        Ok(())
    }

    fn create_object_iter(&self, query: ObjectQuery) -> Result<Box<dyn ObjectIter>> {
        let mut state = self.state();
        let matches: Vec<String> = state
            .objects
            .iter()
            .filter(|(path, obj)| query.admits(path, obj.ftype))
            .map(|(path, _)| path.clone())
            .collect();
        let fail_at = state.fail_listing_at.take();
        drop(state);
        debug!(
            "memory iterator over {} matched {} objects",
            query.pattern.glob(),
            matches.len()
        );
        Ok(Box::new(MemoryObjectIter {
            state: self.state.clone(),
            prefix_len: query.pattern.literal_prefix().len(),
            pending: matches.into_iter(),
            listed: 0,
            fail_at,
            query,
        }))
    }

    async fn create_attr_iter(
        &self,
        path: &str,
        key_pattern: &Regex,
        max_size: usize,
    ) -> Result<Box<dyn AttrIter>> {
        let path = normalize(path)?;
        let mut state = self.state();
        state.calls.push(OsCall::AttrIter(path.clone()));
        let Some(obj) = state.objects.get(&path) else {
            return Err(LioError::NotFound(path));
        };
        let mut pairs: Vec<(String, String)> = obj
            .attrs
            .iter()
            .filter(|(k, _)| key_pattern.is_match(k))
            .map(|(k, v)| (k.clone(), truncate(v.clone(), max_size)))
            .collect();
        pairs.sort();
        Ok(Box::new(MemoryAttrIter {
            pending: pairs.into_iter(),
        }))
    }
}

struct MemoryAttrIter {
    pending: std::vec::IntoIter<(String, String)>,
}

#[async_trait]
impl AttrIter for MemoryAttrIter {
    async fn next_attr(&mut self) -> Result<Option<(String, String)>> {
        Ok(self.pending.next())
    }
}

struct MemoryObjectIter {
    state: Arc<Mutex<MemState>>,
    query: ObjectQuery,
    prefix_len: usize,
    pending: std::vec::IntoIter<String>,
    listed: usize,
    fail_at: Option<usize>,
}

#[async_trait]
impl ObjectIter for MemoryObjectIter {
    async fn next_object(&mut self) -> Result<Option<ObjectEntry>> {
        if self.fail_at == Some(self.listed) {
            self.fail_at = None;
            return Err(LioError::Backend(format!(
                "injected listing failure after {} objects",
                self.listed
            )));
        }
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for path in self.pending.by_ref() {
            // objects removed since the listing are skipped
            let Some(obj) = state.objects.get(&path) else {
                continue;
            };
            let attrs = self
                .query
                .prefetch
                .iter()
                .map(|k| {
                    obj.attrs
                        .get(k)
                        .cloned()
                        .map(|v| truncate(v, self.query.max_attr_size))
                })
                .collect();
            let entry = ObjectEntry {
                path: path.clone(),
                ftype: obj.ftype,
                prefix_len: self.prefix_len,
                attrs,
            };
            state.calls.push(OsCall::Listed(path));
            self.listed += 1;
            return Ok(Some(entry));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::PathPattern;

    fn query(glob: &str, types: ObjectType, depth: usize) -> ObjectQuery {
        ObjectQuery {
            pattern: PathPattern::from_glob(glob).unwrap(),
            object_pattern: None,
            types,
            recurse_depth: depth,
            prefetch: vec!["k".to_string()],
            max_attr_size: 1024,
        }
    }

    #[tokio::test]
    async fn test_attr_round_trip_and_log() {
        let os = MemoryObjectStore::new().with_object("/a/f", ObjectType::FILE, &[("k", "v")]);
        assert_eq!(os.exists("/a").await.unwrap(), ObjectType::DIR);
        assert!(os.exists("/nope").await.unwrap().is_empty());

        let fd = os.open_object("/a/f", OpenMode::ReadImmediate, None).await.unwrap();
        os.set_attrs(&fd, &[("x", Some("1")), ("k", None)])
            .await
            .unwrap();
        let values = os.get_attrs(&fd, &["x", "k"], 1024).await.unwrap();
        assert_eq!(values, vec![Some("1".to_string()), None]);
        os.close_object(fd).await.unwrap();

        let calls = os.calls();
        assert_eq!(calls[2], OsCall::Open("/a/f".to_string()));
        assert!(matches!(calls.last(), Some(OsCall::Close(_))));
    }

    #[tokio::test]
    async fn test_open_missing_and_injected_failure() {
        let os = MemoryObjectStore::new().with_object("/f", ObjectType::FILE, &[]);
        assert!(
            os.open_object("/g", OpenMode::ReadImmediate, None)
                .await
                .unwrap_err()
                .is_not_found()
        );

        os.fail_next_set_attrs(1);
        let fd = os.open_object("/f", OpenMode::ReadImmediate, None).await.unwrap();
        assert!(os.set_attr(&fd, "k", Some("v")).await.is_err());
        os.set_attr(&fd, "k", Some("v")).await.unwrap();
        assert_eq!(os.get_attr(&fd, "k", 1).await.unwrap().as_deref(), Some("v"));
        os.close_object(fd).await.unwrap();
    }

    #[tokio::test]
    async fn test_namespace_mutations() {
        let os = MemoryObjectStore::new()
            .with_object("/d/a", ObjectType::FILE, &[("k", "1")])
            .with_object("/e", ObjectType::DIR, &[]);

        assert!(matches!(
            os.remove_object("/d").await,
            Err(LioError::NotEmpty(_))
        ));
        assert!(matches!(
            os.create_object("/missing/x", ObjectType::FILE, None).await,
            Err(LioError::NotFound(_))
        ));
        os.create_object("/d/b", ObjectType::FILE, None).await.unwrap();
        assert!(matches!(
            os.create_object("/d/b", ObjectType::FILE, None).await,
            Err(LioError::Exists(_))
        ));

        os.move_object("/d", "/e/d").await.unwrap();
        assert!(os.contains("/e/d/a"));
        assert!(!os.contains("/d/a"));

        os.hardlink_object("/e/d/a", "/e/h", None).await.unwrap();
        assert_eq!(os.attr("/e/h", "k").as_deref(), Some("1"));
        os.symlink_object("/e/d/a", "/e/s", None).await.unwrap();
        assert!(os.exists("/e/s").await.unwrap().contains(ObjectType::SYMLINK));
    }

    #[tokio::test]
    async fn test_iterator_honors_type_and_depth() {
        let os = MemoryObjectStore::new()
            .with_object("/t/a", ObjectType::FILE, &[("k", "va")])
            .with_object("/t/sub/b", ObjectType::FILE, &[])
            .with_object("/t/sub/deep/c", ObjectType::FILE, &[]);

        let mut it = os
            .create_object_iter(query("/t", ObjectType::FILE, 2))
            .unwrap();
        let mut seen = Vec::new();
        while let Some(entry) = it.next_object().await.unwrap() {
            assert_eq!(entry.prefix_len, 2);
            seen.push((entry.path, entry.attrs));
        }
        assert_eq!(
            seen,
            vec![
                ("/t/a".to_string(), vec![Some("va".to_string())]),
                ("/t/sub/b".to_string(), vec![None]),
            ]
        );

        let mut it = os
            .create_object_iter(query("/t/*", ObjectType::DIR, 0))
            .unwrap();
        let entry = it.next_object().await.unwrap().unwrap();
        assert_eq!(entry.path, "/t/sub");
        assert!(it.next_object().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_listing_failure_is_transient() {
        let os = MemoryObjectStore::new()
            .with_object("/t/a", ObjectType::FILE, &[])
            .with_object("/t/b", ObjectType::FILE, &[]);
        os.fail_listing_after(1);

        let mut it = os
            .create_object_iter(query("/t/*", ObjectType::FILE, 0))
            .unwrap();
        assert_eq!(it.next_object().await.unwrap().unwrap().path, "/t/a");
        assert!(it.next_object().await.is_err());
        assert_eq!(it.next_object().await.unwrap().unwrap().path, "/t/b");
        assert!(it.next_object().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attr_iter_filters_keys() {
        let os = MemoryObjectStore::new().with_object(
            "/f",
            ObjectType::FILE,
            &[("user.b", "2"), ("system.x", "long value"), ("user.a", "1")],
        );
        let re = Regex::new("^user\\.").unwrap();
        let mut it = os.create_attr_iter("/f", &re, 1024).await.unwrap();
        let mut seen = Vec::new();
        while let Some(pair) = it.next_attr().await.unwrap() {
            seen.push(pair);
        }
        assert_eq!(
            seen,
            vec![
                ("user.a".to_string(), "1".to_string()),
                ("user.b".to_string(), "2".to_string()),
            ]
        );

        let all = Regex::new("").unwrap();
        let mut it = os.create_attr_iter("/f", &all, 4).await.unwrap();
        assert_eq!(
            it.next_attr().await.unwrap(),
            Some(("system.x".to_string(), "long".to_string()))
        );
        assert!(os.create_attr_iter("/g", &all, 4).await.is_err());
    }
}
