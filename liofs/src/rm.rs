use std::sync::Arc;

use libopque::{IterProducer, OpStatus, Operation, Pipeline, PipelineEvent};
use log::{info, warn};

use crate::context::LioContext;
use crate::namespace::gop_remove_regex_object;
use crate::os::{ObjectType, PathPattern};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RemoveReport {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

impl RemoveReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Removes every path glob in `paths`, keeping at most
/// `parallel_task_count` globs in flight. Each glob is reported as removed
/// or failed as a whole.
pub async fn remove_paths<I>(
    lc: &Arc<LioContext>,
    paths: I,
    obj_types: ObjectType,
    recurse_depth: usize,
) -> RemoveReport
where
    I: IntoIterator<Item = String>,
    I::IntoIter: Send,
{
    let np = lc.config().parallel_task_count;
    let ctx = lc.clone();
    let producer = IterProducer::new(paths.into_iter(), move |path: &String| {
        match PathPattern::from_glob(path) {
            Ok(pattern) => {
                gop_remove_regex_object(&ctx, pattern, None, obj_types, recurse_depth, np)
            }
            Err(e) => {
                warn!("skipping {path}: {e}");
                Operation::completed(OpStatus::failure_with(e.code()))
            }
        }
    });

    let mut report = RemoveReport::default();
    let mut pipeline = Pipeline::new(producer, np);
    while let PipelineEvent::Completed { item, status } = pipeline.next().await {
        if status.is_success() {
            report.removed.push(item);
        } else {
            warn!("error removing {item} ({} left behind)", status.error_code);
            report.failed.push(item);
        }
    }
    info!(
        "rm finished: {} removed, {} failed",
        report.removed.len(),
        report.failed.len()
    );
    report
}
