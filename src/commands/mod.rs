//! CLI commands implementation

pub mod build;
pub mod documents;
pub mod init;
pub mod jobs;
pub mod project;
pub mod status;
pub mod worker;

pub use build::*;
pub use documents::*;
pub use init::*;
pub use jobs::*;
pub use project::*;
pub use status::*;
pub use worker::*;

use crate::config::Config;
use crate::error::Result;
use crate::extraction::create_client;
use crate::jobs::{RetryPolicies, SqliteJobQueue, WorkerPool};
use crate::meta::MetaDb;
use crate::pipeline::{Pipeline, PipelineDeps};
use crate::progress::{BroadcastReporter, FanoutReporter, TracingReporter};
use std::sync::Arc;

/// Database, queue and pipeline wired from one config
pub struct Runtime {
    pub config: Config,
    pub db: MetaDb,
    pub queue: SqliteJobQueue,
    pub pipeline: Arc<Pipeline>,
    pub progress: BroadcastReporter,
}

impl Runtime {
    pub async fn open(config: Config) -> Result<Self> {
        let db = MetaDb::connect(&config).await?;
        let client = create_client(&config.service)?;
        let queue = SqliteJobQueue::new(db.clone(), RetryPolicies::from_config(&config));
        let progress = BroadcastReporter::new(64);
        let reporter = FanoutReporter::new()
            .with(Arc::new(progress.clone()))
            .with(Arc::new(TracingReporter));

        let deps = PipelineDeps {
            db: db.clone(),
            client,
            scheduler: Arc::new(queue.clone()),
            reporter: Arc::new(reporter),
        };
        let pipeline = Arc::new(Pipeline::new(deps, &config));

        Ok(Self {
            config,
            db,
            queue,
            pipeline,
            progress,
        })
    }

    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.queue.clone(),
            self.pipeline.clone(),
            self.config.worker.clone(),
        )
    }
}
