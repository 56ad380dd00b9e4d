//! lio client core.
//!
//! Attribute and namespace calls against an [`ObjectStore`], each available
//! both as a plain `async fn` and as a deferred [`libopque::Operation`]
//! (`gop_*`), plus the bulk drivers built on them: glob removal and the
//! metadata consistency checker ([`FsckIter`]).

pub mod attrs;
pub mod config;
pub mod context;
pub mod error;
pub mod exnode;
pub mod fsck;
pub mod iter;
pub mod namespace;
pub mod os;
pub mod path;
pub mod rm;

pub use config::LioConfig;
pub use context::LioContext;
pub use error::{LioError, Result};
pub use fsck::{
    BadObject, FSCK_KEYS, FsckIter, FsckMode, FsckOutcome, FsckPolicy, FsckRecord, check_object,
    fsck_object, fsck_object_full,
};
pub use iter::{LocalObjectIter, UnifiedObjectIter};
pub use os::{
    AttrIter, MemoryObjectStore, ObjectEntry, ObjectIter, ObjectQuery, ObjectStore, ObjectType,
    OsCall, PathPattern, path_split,
};
pub use path::{LioPath, Timestamp};
pub use rm::{RemoveReport, remove_paths};
