//! Object store interface.
//!
//! The namespace itself (path resolution, attribute storage, iteration) lives
//! behind [`ObjectStore`]. `memory` holds an in-process implementation used by
//! tests and local tooling.

pub mod memory;

use async_trait::async_trait;
use bitflags::bitflags;
use regex::Regex;

use crate::error::{LioError, Result};

pub use memory::{MemoryObjectStore, OsCall};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ObjectType: u32 {
        const FILE = 1;
        const DIR = 2;
        const SYMLINK = 4;
        const HARDLINK = 8;
        const ANY = Self::FILE.bits()
            | Self::DIR.bits()
            | Self::SYMLINK.bits()
            | Self::HARDLINK.bits();
    }
}

impl ObjectType {
    pub fn is_dir(&self) -> bool {
        self.contains(ObjectType::DIR)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Open without waiting on pending writers, used by attribute calls.
    ReadImmediate,
}

/// Open object handle returned by [`ObjectStore::open_object`].
#[derive(Debug, PartialEq, Eq)]
pub struct ObjectFd {
    pub path: String,
    pub handle: u64,
}

/// Attribute value; `None` means the attribute does not exist.
pub type AttrValue = Option<String>;

/// Which objects an iterator walks.
#[derive(Clone, Debug)]
pub struct ObjectQuery {
    pub pattern: PathPattern,
    /// Filter on the leaf name of every object the walk returns.
    pub object_pattern: Option<PathPattern>,
    pub types: ObjectType,
    /// Levels below a matching object that are still visited.
    pub recurse_depth: usize,
    /// Attributes fetched alongside every object, in this order.
    pub prefetch: Vec<String>,
    pub max_attr_size: usize,
}

impl ObjectQuery {
    /// True when an object of type `ftype` at `path` belongs to the walk.
    pub fn admits(&self, path: &str, ftype: ObjectType) -> bool {
        if !ftype.intersects(self.types)
            || !self.pattern.matches_within(path, self.recurse_depth)
        {
            return false;
        }
        match &self.object_pattern {
            Some(object) => object.is_match(&path_split(path).1),
            None => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectEntry {
    pub path: String,
    pub ftype: ObjectType,
    /// Length of the literal (wildcard free) part of the pattern.
    pub prefix_len: usize,
    /// Values of the query's prefetch keys.
    pub attrs: Vec<AttrValue>,
}

#[async_trait]
pub trait ObjectIter: Send {
    async fn next_object(&mut self) -> Result<Option<ObjectEntry>>;
}

/// Walks the attributes of one object.
#[async_trait]
pub trait AttrIter: Send {
    /// Next `(key, value)` pair, `None` once every matching key was returned.
    async fn next_attr(&mut self) -> Result<Option<(String, String)>>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Type of the object at `path`; empty when it does not exist.
    async fn exists(&self, path: &str) -> Result<ObjectType>;

    async fn open_object(&self, path: &str, mode: OpenMode, id: Option<&str>)
    -> Result<ObjectFd>;

    async fn close_object(&self, fd: ObjectFd) -> Result<()>;

    async fn get_attrs(
        &self,
        fd: &ObjectFd,
        keys: &[&str],
        max_size: usize,
    ) -> Result<Vec<AttrValue>>;

    /// Writes attributes; a `None` value removes the key.
    async fn set_attrs(&self, fd: &ObjectFd, attrs: &[(&str, Option<&str>)]) -> Result<()>;

    async fn get_attr(&self, fd: &ObjectFd, key: &str, max_size: usize) -> Result<AttrValue> {
        let mut values = self.get_attrs(fd, &[key], max_size).await?;
        Ok(values.pop().flatten())
    }

    async fn set_attr(&self, fd: &ObjectFd, key: &str, value: Option<&str>) -> Result<()> {
        self.set_attrs(fd, &[(key, value)]).await
    }

    async fn create_object(&self, path: &str, ftype: ObjectType, id: Option<&str>) -> Result<()>;

    async fn remove_object(&self, path: &str) -> Result<()>;

    async fn move_object(&self, src: &str, dest: &str) -> Result<()>;

    async fn symlink_object(&self, src: &str, dest: &str, id: Option<&str>) -> Result<()>;

    async fn hardlink_object(&self, src: &str, dest: &str, id: Option<&str>) -> Result<()>;

    fn create_object_iter(&self, query: ObjectQuery) -> Result<Box<dyn ObjectIter>>;

    /// Iterates the attributes of `path` whose key matches `key_pattern`.
    /// Values are cut to `max_size` bytes.
    async fn create_attr_iter(
        &self,
        path: &str,
        key_pattern: &Regex,
        max_size: usize,
    ) -> Result<Box<dyn AttrIter>>;
}

/// Splits `path` into its parent directory and leaf name.
pub fn path_split(path: &str) -> (String, String) {
    let trimmed = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    match trimmed.rfind('/') {
        Some(0) => ("/".to_string(), trimmed[1..].to_string()),
        Some(i) => (trimmed[..i].to_string(), trimmed[i + 1..].to_string()),
        None => (".".to_string(), trimmed.to_string()),
    }
}

/// Shell style path glob compiled to an anchored regex.
///
/// `*` and `?` never match across a `/`; everything else is literal.
#[derive(Clone, Debug)]
pub struct PathPattern {
    glob: String,
    regex: Regex,
    literal_prefix: String,
}

impl PathPattern {
    pub fn from_glob(glob: &str) -> Result<Self> {
        if glob.is_empty() {
            return Err(LioError::InvalidPath("empty path glob".to_string()));
        }
        let glob = if glob.len() > 1 {
            glob.trim_end_matches('/')
        } else {
            glob
        };

        let mut re = String::with_capacity(glob.len() * 2 + 2);
        re.push('^');
        for c in glob.chars() {
            match c {
                '*' => re.push_str("[^/]*"),
                '?' => re.push_str("[^/]"),
                c => re.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
            }
        }
        re.push('$');

        let literal_prefix = match glob.find(['*', '?']) {
            Some(i) => match glob[..i].rfind('/') {
                Some(0) => "/".to_string(),
                Some(j) => glob[..j].to_string(),
                None => String::new(),
            },
            None => glob.to_string(),
        };

        Ok(Self {
            glob: glob.to_string(),
            regex: Regex::new(&re)?,
            literal_prefix,
        })
    }

    pub fn glob(&self) -> &str {
        &self.glob
    }

    /// Directory part of the glob before the first wildcard.
    pub fn literal_prefix(&self) -> &str {
        &self.literal_prefix
    }

    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// True when `path` matches or lies at most `recurse_depth` levels below
    /// a matching path.
    pub fn matches_within(&self, path: &str, recurse_depth: usize) -> bool {
        let mut candidate = path;
        for _ in 0..=recurse_depth {
            if self.regex.is_match(candidate) {
                return true;
            }
            candidate = match candidate.rfind('/') {
                Some(0) if candidate.len() > 1 => "/",
                Some(i) if i > 0 => &candidate[..i],
                _ => return false,
            };
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_split() {
        assert_eq!(path_split("/a/b/c"), ("/a/b".into(), "c".into()));
        assert_eq!(path_split("/a"), ("/".into(), "a".into()));
        assert_eq!(path_split("/a/b/"), ("/a".into(), "b".into()));
        assert_eq!(path_split("name"), (".".into(), "name".into()));
    }

    #[test]
    fn test_glob_matching() {
        let p = PathPattern::from_glob("/data/*.dat").unwrap();
        assert!(p.is_match("/data/x.dat"));
        assert!(!p.is_match("/data/sub/x.dat"));
        assert!(!p.is_match("/data/x.dat2"));
        assert_eq!(p.literal_prefix(), "/data");

        let p = PathPattern::from_glob("/a?c").unwrap();
        assert!(p.is_match("/abc"));
        assert!(!p.is_match("/a/c"));
        assert_eq!(p.literal_prefix(), "/");

        let p = PathPattern::from_glob("/plain/dir/").unwrap();
        assert!(p.is_match("/plain/dir"));
        assert_eq!(p.literal_prefix(), "/plain/dir");
        assert!(PathPattern::from_glob("").is_err());
    }

    #[test]
    fn test_matches_within_depth() {
        let p = PathPattern::from_glob("/top").unwrap();
        assert!(p.matches_within("/top", 0));
        assert!(!p.matches_within("/top/a", 0));
        assert!(p.matches_within("/top/a", 1));
        assert!(!p.matches_within("/top/a/b", 1));
        assert!(p.matches_within("/top/a/b", 5));
        assert!(!p.matches_within("/other/a", 5));

        let root = PathPattern::from_glob("/").unwrap();
        assert!(root.matches_within("/x/y", 2));
        assert!(!root.matches_within("/x/y", 1));
    }

    #[test]
    fn test_query_object_pattern_checks_leaf() {
        let mut query = ObjectQuery {
            pattern: PathPattern::from_glob("/data").unwrap(),
            object_pattern: Some(PathPattern::from_glob("*.dat").unwrap()),
            types: ObjectType::FILE,
            recurse_depth: 2,
            prefetch: Vec::new(),
            max_attr_size: 64,
        };
        assert!(query.admits("/data/a.dat", ObjectType::FILE));
        assert!(query.admits("/data/sub/b.dat", ObjectType::FILE));
        assert!(!query.admits("/data/a.txt", ObjectType::FILE));
        // the leaf name alone is matched, not the directories above it
        assert!(!query.admits("/data/x.dat/c", ObjectType::FILE));
        assert!(!query.admits("/data/d.dat", ObjectType::DIR));

        query.object_pattern = None;
        assert!(query.admits("/data/a.txt", ObjectType::FILE));
    }
}
