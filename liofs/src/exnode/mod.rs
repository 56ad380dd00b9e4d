//! Exnode and segment collaborators.
//!
//! An exnode maps an object's byte stream onto data segments. FSCK only needs
//! to parse one, clone its structure, write it back out and ask its default
//! view for a length, so that is all these traits expose.

pub mod simple;

use async_trait::async_trait;

use crate::error::Result;

pub use simple::{ExnodeDescriptor, SegmentDescriptor, SimpleExnodeService};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeserializeOptions {
    /// Skip registering the exnode's segments in the shared segment cache.
    /// Set whenever several copies of one exnode may be live at once.
    pub no_cache: bool,
}

impl DeserializeOptions {
    pub fn no_cache() -> Self {
        Self { no_cache: true }
    }
}

pub trait Segment: Send + Sync {
    fn id(&self) -> u64;

    /// Authoritative length of the data behind this segment.
    fn size(&self) -> u64;
}

#[async_trait]
pub trait Exnode: Send + Sync {
    /// The view used for plain reads and size queries, if one is set.
    fn default_segment(&self) -> Option<&dyn Segment>;

    /// Copies the segment layout under fresh ids without copying data.
    async fn clone_structure(&self) -> Result<Box<dyn Exnode>>;

    fn serialize(&self) -> Result<String>;
}

pub trait ExnodeService: Send + Sync {
    fn deserialize(&self, text: &str, opts: DeserializeOptions) -> Result<Box<dyn Exnode>>;

    /// Globally unique id, used for fresh inode numbers.
    fn generate_id(&self) -> u64;
}
