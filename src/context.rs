//! Application context: the pool and orchestrator, built and torn down
//! explicitly.

use std::sync::Arc;

use tracing::info;

use crate::config::PoolConfig;
use crate::error::Error;
use crate::pool::{PoolHandle, ShutdownReport};
use crate::session::{SessionOrchestrator, SkillCatalog, StaticSkillCatalog};
use crate::worker::{ProcessLauncher, WorkerLauncher};

/// Everything a front end needs, created once at startup.
pub struct AppContext {
    pub config: PoolConfig,
    pub pool: PoolHandle,
    pub orchestrator: Arc<SessionOrchestrator>,
}

impl AppContext {
    /// Start a pool of worker processes and an orchestrator on top of it.
    pub async fn init(config: PoolConfig) -> Result<Self, Error> {
        let launcher = Arc::new(ProcessLauncher::from_config(&config));
        Self::with_launcher(config, launcher, Arc::new(StaticSkillCatalog::default())).await
    }

    /// Same as [`init`](Self::init) with a custom launcher and skill catalog.
    pub async fn with_launcher(
        config: PoolConfig,
        launcher: Arc<dyn WorkerLauncher>,
        skills: Arc<dyn SkillCatalog>,
    ) -> Result<Self, Error> {
        let pool = PoolHandle::spawn(&config, launcher);
        if let Err(e) = pool.start().await {
            let _ = pool.stop().await;
            return Err(e.into());
        }
        info!(
            pool_size = config.pool_size,
            engine = config.engine.kind.as_str(),
            "Agent pool ready"
        );

        let orchestrator = SessionOrchestrator::new(pool.clone(), skills);
        Ok(Self {
            config,
            pool,
            orchestrator,
        })
    }

    /// Stop the pool. Running turns end, and later dispatches are rejected.
    pub async fn shutdown(self) -> Result<ShutdownReport, Error> {
        let report = self.pool.stop().await?;
        info!(
            acknowledged = report.acknowledged,
            killed = report.killed,
            "Agent pool shut down"
        );
        Ok(report)
    }
}
