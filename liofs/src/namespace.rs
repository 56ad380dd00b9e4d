//! Namespace calls: existence checks, object creation and removal, links,
//! and the glob-driven compound operations built on top of them.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use libopque::{OpStatus, Operation, Pipeline, PipelineEvent, WorkProducer, WorkerPool};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::attrs::{AttrPairs, borrow_pairs, set_multiple_attrs};
use crate::context::LioContext;
use crate::error::{LioError, Result, op_status};
use crate::os::{ObjectIter, ObjectQuery, ObjectType, PathPattern};

fn gop_unit<F>(lc: &Arc<LioContext>, what: &'static str, work: F) -> Operation
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    Operation::new(lc.tpc_unlimited(), async move {
        let res = work.await;
        op_status(what, &res)
    })
}

/// Type of the object at `path`, empty if there is none.
pub async fn exists(lc: &LioContext, path: &str) -> Result<ObjectType> {
    lc.os().exists(path).await
}

/// Operation form of [`exists`]: succeeds with the type bits as error code.
pub fn gop_exists(lc: &Arc<LioContext>, path: &str) -> Operation {
    let ctx = lc.clone();
    let path = path.to_string();
    Operation::new(lc.tpc_unlimited(), async move {
        match exists(&ctx, &path).await {
            Ok(ftype) => OpStatus::success_with(ftype.bits() as i32),
            Err(e) => {
                warn!("exists check on {path} failed: {e}");
                OpStatus::failure_with(e.code())
            }
        }
    })
}

pub async fn create_object(
    lc: &LioContext,
    path: &str,
    ftype: ObjectType,
    id: Option<&str>,
) -> Result<()> {
    lc.os().create_object(path, ftype, id).await
}

pub fn gop_create_object(
    lc: &Arc<LioContext>,
    path: &str,
    ftype: ObjectType,
    id: Option<&str>,
) -> Operation {
    let ctx = lc.clone();
    let path = path.to_string();
    let id = id.map(str::to_string);
    gop_unit(lc, "create object", async move {
        create_object(&ctx, &path, ftype, id.as_deref()).await
    })
}

pub async fn remove_object(lc: &LioContext, path: &str) -> Result<()> {
    lc.os().remove_object(path).await
}

pub fn gop_remove_object(lc: &Arc<LioContext>, path: &str) -> Operation {
    let ctx = lc.clone();
    let path = path.to_string();
    gop_unit(lc, "remove object", async move {
        remove_object(&ctx, &path).await
    })
}

pub async fn move_object(lc: &LioContext, src: &str, dest: &str) -> Result<()> {
    lc.os().move_object(src, dest).await
}

pub fn gop_move_object(lc: &Arc<LioContext>, src: &str, dest: &str) -> Operation {
    let ctx = lc.clone();
    let (src, dest) = (src.to_string(), dest.to_string());
    gop_unit(lc, "move object", async move {
        move_object(&ctx, &src, &dest).await
    })
}

pub async fn symlink_object(
    lc: &LioContext,
    src: &str,
    dest: &str,
    id: Option<&str>,
) -> Result<()> {
    lc.os().symlink_object(src, dest, id).await
}

pub fn gop_symlink_object(
    lc: &Arc<LioContext>,
    src: &str,
    dest: &str,
    id: Option<&str>,
) -> Operation {
    let ctx = lc.clone();
    let (src, dest) = (src.to_string(), dest.to_string());
    let id = id.map(str::to_string);
    gop_unit(lc, "symlink object", async move {
        symlink_object(&ctx, &src, &dest, id.as_deref()).await
    })
}

pub async fn hardlink_object(
    lc: &LioContext,
    src: &str,
    dest: &str,
    id: Option<&str>,
) -> Result<()> {
    lc.os().hardlink_object(src, dest, id).await
}

pub fn gop_hardlink_object(
    lc: &Arc<LioContext>,
    src: &str,
    dest: &str,
    id: Option<&str>,
) -> Operation {
    let ctx = lc.clone();
    let (src, dest) = (src.to_string(), dest.to_string());
    let id = id.map(str::to_string);
    gop_unit(lc, "hardlink object", async move {
        hardlink_object(&ctx, &src, &dest, id.as_deref()).await
    })
}

/// Feeds non-directory paths to the remove pipeline and sets directories
/// aside, so they can be removed once they are empty.
struct RemoveProducer {
    ctx: Arc<LioContext>,
    pool: WorkerPool,
    it: Box<dyn ObjectIter>,
    dirs: Vec<String>,
    iter_failed: bool,
}

#[async_trait]
impl WorkProducer for RemoveProducer {
    type Item = String;

    async fn next_item(&mut self) -> Option<String> {
        loop {
            match self.it.next_object().await {
                Ok(Some(entry)) if entry.ftype.is_dir() => self.dirs.push(entry.path),
                Ok(Some(entry)) => return Some(entry.path),
                Ok(None) => return None,
                Err(e) => {
                    error!("object listing for remove failed: {e}");
                    self.iter_failed = true;
                    return None;
                }
            }
        }
    }

    fn launch(&self, path: &String) -> Operation {
        let ctx = self.ctx.clone();
        let path = path.clone();
        Operation::new(&self.pool, async move {
            let res = remove_object(&ctx, &path).await;
            op_status("remove object", &res)
        })
    }
}

async fn remove_regex(
    ctx: Arc<LioContext>,
    pattern: PathPattern,
    object_pattern: Option<PathPattern>,
    types: ObjectType,
    recurse_depth: usize,
    np: usize,
) -> OpStatus {
    let query = ObjectQuery {
        pattern,
        object_pattern,
        types,
        recurse_depth,
        prefetch: Vec::new(),
        max_attr_size: ctx.config().max_attr_size,
    };
    let glob = query.pattern.glob().to_string();
    let it = match ctx.os().create_object_iter(query) {
        Ok(it) => it,
        Err(e) => {
            error!("cannot list {glob} for removal: {e}");
            return OpStatus::failure_with(e.code());
        }
    };

    let producer = RemoveProducer {
        pool: ctx.tpc_limited().clone(),
        ctx: ctx.clone(),
        it,
        dirs: Vec::new(),
        iter_failed: false,
    };
    let mut pipeline = Pipeline::new(producer, np.max(1));
    let mut failed = 0;
    let mut removed = 0;
    while let PipelineEvent::Completed { item, status } = pipeline.next().await {
        if status.is_success() {
            removed += 1;
        } else {
            warn!("failed to remove {item}");
            failed += 1;
        }
    }
    let mut producer = pipeline.drain().await;
    if producer.iter_failed {
        failed += 1;
    }

    // children before parents
    producer
        .dirs
        .sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
    for dir in &producer.dirs {
        match remove_object(&ctx, dir).await {
            Ok(()) => removed += 1,
            Err(e) => {
                warn!("failed to remove directory {dir}: {e}");
                failed += 1;
            }
        }
    }

    info!("removed {removed} objects matching {glob}, {failed} failures");
    if failed == 0 {
        OpStatus::success()
    } else {
        OpStatus::failure_with(failed)
    }
}

/// Removes every object matching `pattern` and, down to `recurse_depth`
/// levels, everything below it. With an `object_pattern` only objects whose
/// leaf name matches it are removed. Plain objects go through a pipeline of
/// width `np` on the bounded pool; directories are removed afterwards,
/// deepest first. Fails with the number of objects left behind.
pub fn gop_remove_regex_object(
    lc: &Arc<LioContext>,
    pattern: PathPattern,
    object_pattern: Option<PathPattern>,
    types: ObjectType,
    recurse_depth: usize,
    np: usize,
) -> Operation {
    let ctx = lc.clone();
    Operation::new(
        lc.tpc_unlimited(),
        remove_regex(ctx, pattern, object_pattern, types, recurse_depth, np),
    )
}

/// A running glob attribute set and the token that aborts it.
pub struct RegexSetAttrs {
    pub op: Operation,
    abort: CancellationToken,
}

impl RegexSetAttrs {
    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

/// Writes `attrs` on every object matching `pattern` (and `object_pattern`,
/// when given). The operation fails with the number of objects that could
/// not be updated, or with `ECANCELED` once aborted.
///
/// An abort is honored between objects. A write already started runs to
/// completion, so every opened object is closed again.
pub fn gop_regex_object_set_multiple_attrs(
    lc: &Arc<LioContext>,
    id: Option<&str>,
    pattern: PathPattern,
    object_pattern: Option<PathPattern>,
    types: ObjectType,
    recurse_depth: usize,
    attrs: AttrPairs,
) -> RegexSetAttrs {
    let ctx = lc.clone();
    let id = id.map(str::to_string);
    let abort = CancellationToken::new();
    let token = abort.clone();
    let op = Operation::new(lc.tpc_unlimited(), async move {
        let query = ObjectQuery {
            pattern,
            object_pattern,
            types,
            recurse_depth,
            prefetch: Vec::new(),
            max_attr_size: ctx.config().max_attr_size,
        };
        let mut it = match ctx.os().create_object_iter(query) {
            Ok(it) => it,
            Err(e) => return OpStatus::failure_with(e.code()),
        };
        let pairs = borrow_pairs(&attrs);
        let mut failed = 0;
        loop {
            let entry = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                next = it.next_object() => Some(next),
            };
            let path = match entry {
                None => {
                    info!("glob attribute set aborted");
                    return OpStatus::failure_with(LioError::Aborted.code());
                }
                Some(Ok(Some(entry))) => entry.path,
                Some(Ok(None)) => break,
                Some(Err(e)) => {
                    error!("object listing for attribute set failed: {e}");
                    failed += 1;
                    break;
                }
            };
            match set_multiple_attrs(&ctx, &path, id.as_deref(), &pairs).await {
                Ok(()) => debug!("attributes set on {path}"),
                Err(e) => {
                    warn!("failed to set attributes on {path}: {e}");
                    failed += 1;
                }
            }
            if token.is_cancelled() {
                info!("glob attribute set aborted after {path}");
                return OpStatus::failure_with(LioError::Aborted.code());
            }
        }
        if failed == 0 {
            OpStatus::success()
        } else {
            OpStatus::failure_with(failed)
        }
    });
    RegexSetAttrs { op, abort }
}

/// Aborts a glob attribute set. Objects already updated keep their values.
pub fn gop_abort_regex_object_set_multiple_attrs(
    lc: &Arc<LioContext>,
    target: &RegexSetAttrs,
) -> Operation {
    let token = target.abort.clone();
    Operation::new(lc.tpc_unlimited(), async move {
        token.cancel();
        OpStatus::success()
    })
}
