//! One object iterator over either the namespace or the local filesystem.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use walkdir::WalkDir;

use crate::context::LioContext;
use crate::error::Result;
use crate::os::{ObjectEntry, ObjectIter, ObjectQuery, ObjectType, PathPattern};
use crate::path::LioPath;

fn component_count(path: &str) -> usize {
    path.split('/').filter(|c| !c.is_empty() && *c != ".").count()
}

/// Drops leading `./` components; walked paths are reported without them.
fn strip_current_dir(mut glob: &str) -> &str {
    while let Some(rest) = glob.strip_prefix("./") {
        glob = rest.trim_start_matches('/');
    }
    glob
}

/// Walks the local filesystem below the literal part of a glob.
pub struct LocalObjectIter {
    walker: walkdir::IntoIter,
    root: PathBuf,
    query: ObjectQuery,
}

impl LocalObjectIter {
    pub fn new(mut query: ObjectQuery) -> Result<Self> {
        let stripped = strip_current_dir(query.pattern.glob()).to_string();
        if stripped.len() != query.pattern.glob().len() {
            let glob = if stripped.is_empty() { "." } else { stripped.as_str() };
            query.pattern = PathPattern::from_glob(glob)?;
        }
        let prefix = query.pattern.literal_prefix();
        let root = if prefix.is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(prefix)
        };
        let glob_depth = component_count(query.pattern.glob()) - component_count(prefix);
        let walker = WalkDir::new(&root)
            .follow_links(false)
            .max_depth(glob_depth + query.recurse_depth)
            .sort_by_file_name()
            .into_iter();
        Ok(Self {
            walker,
            root,
            query,
        })
    }

    fn object_type(entry: &walkdir::DirEntry) -> ObjectType {
        let ft = entry.file_type();
        if ft.is_symlink() {
            // classify by what the link points at; dangling links count as files
            return match std::fs::metadata(entry.path()) {
                Ok(meta) if meta.is_dir() => ObjectType::SYMLINK | ObjectType::DIR,
                _ => ObjectType::SYMLINK | ObjectType::FILE,
            };
        }
        if ft.is_dir() {
            return ObjectType::DIR;
        }
        match entry.metadata() {
            Ok(meta) if meta.nlink() > 1 => ObjectType::FILE | ObjectType::HARDLINK,
            _ => ObjectType::FILE,
        }
    }

    fn display_path(&self, path: &Path) -> Option<String> {
        if self.root == Path::new(".") && path == Path::new(".") {
            return None;
        }
        let text = path.to_str()?;
        Some(text.strip_prefix("./").unwrap_or(text).to_string())
    }

    pub fn next_object(&mut self) -> Result<Option<ObjectEntry>> {
        while let Some(next) = self.walker.next() {
            let entry = match next {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => return Err(e.into()),
                Err(e) => {
                    warn!("skipping unreadable local entry: {e}");
                    continue;
                }
            };
            let Some(path) = self.display_path(entry.path()) else {
                continue;
            };
            let ftype = Self::object_type(&entry);
            if !self.query.admits(&path, ftype) {
                continue;
            }
            return Ok(Some(ObjectEntry {
                path,
                ftype,
                prefix_len: self.query.pattern.literal_prefix().len(),
                // no attributes on local files
                attrs: vec![None; self.query.prefetch.len()],
            }));
        }
        Ok(None)
    }
}

/// Object iterator whose backend is picked once, from the path's origin.
pub enum UnifiedObjectIter {
    Lio(Box<dyn ObjectIter>),
    Local(LocalObjectIter),
}

impl UnifiedObjectIter {
    pub fn create(
        lc: &LioContext,
        path: &LioPath,
        object_pattern: Option<PathPattern>,
        types: ObjectType,
        recurse_depth: usize,
    ) -> Result<Self> {
        let query = ObjectQuery {
            pattern: PathPattern::from_glob(path.path_or_root())?,
            object_pattern,
            types,
            recurse_depth,
            prefetch: Vec::new(),
            max_attr_size: lc.config().max_attr_size,
        };
        if path.is_lio {
            Ok(UnifiedObjectIter::Lio(lc.os().create_object_iter(query)?))
        } else {
            Ok(UnifiedObjectIter::Local(LocalObjectIter::new(query)?))
        }
    }

    pub async fn next_object(&mut self) -> Result<Option<ObjectEntry>> {
        let next = match self {
            UnifiedObjectIter::Lio(it) => it.next_object().await,
            UnifiedObjectIter::Local(it) => it.next_object(),
        };
        if let Ok(Some(entry)) = &next {
            debug!("next object {} ({:?})", entry.path, entry.ftype);
        }
        next
    }

    pub fn is_lio(&self) -> bool {
        matches!(self, UnifiedObjectIter::Lio(_))
    }

    pub fn destroy(self) {
        match self {
            UnifiedObjectIter::Lio(_) => debug!("released namespace object iterator"),
            UnifiedObjectIter::Local(it) => {
                debug!("released local object iterator at {}", it.root.display())
            }
        }
    }
}
