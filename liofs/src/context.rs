use std::sync::Arc;

use libopque::WorkerPool;
use log::info;

use crate::config::LioConfig;
use crate::error::{LioError, Result};
use crate::exnode::ExnodeService;
use crate::os::ObjectStore;

/// Everything an lio call needs: settings, the two collaborators and the
/// worker pools operations run on.
pub struct LioContext {
    config: LioConfig,
    os: Arc<dyn ObjectStore>,
    exnodes: Arc<dyn ExnodeService>,
    /// Metadata calls and compound operations.
    tpc_unlimited: WorkerPool,
    /// Bulk per-object work, capped at `parallel_task_count`.
    tpc_limited: WorkerPool,
}

impl LioContext {
    /// Must be called from within a tokio runtime; the pools bind to it.
    pub fn new(
        config: LioConfig,
        os: Arc<dyn ObjectStore>,
        exnodes: Arc<dyn ExnodeService>,
    ) -> Result<Arc<Self>> {
        if config.parallel_task_count == 0 {
            return Err(LioError::InvalidConfig(
                "parallel_task_count must be at least 1".to_string(),
            ));
        }
        let tpc_unlimited = WorkerPool::unbounded("lio-unlimited")?;
        let tpc_limited = WorkerPool::bounded("lio-limited", config.parallel_task_count)?;
        info!(
            "lio context ready: parallel_task_count={} max_attr_size={}",
            config.parallel_task_count, config.max_attr_size
        );
        Ok(Arc::new(Self {
            config,
            os,
            exnodes,
            tpc_unlimited,
            tpc_limited,
        }))
    }

    pub fn config(&self) -> &LioConfig {
        &self.config
    }

    pub fn os(&self) -> &Arc<dyn ObjectStore> {
        &self.os
    }

    pub fn exnodes(&self) -> &Arc<dyn ExnodeService> {
        &self.exnodes
    }

    pub fn tpc_unlimited(&self) -> &WorkerPool {
        &self.tpc_unlimited
    }

    pub fn tpc_limited(&self) -> &WorkerPool {
        &self.tpc_limited
    }
}
