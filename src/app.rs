//! Composition root (A4): wires every component into a running service.
//!
//! Grounded on the teacher's `app.rs` — a single `App` owning `Arc`'d
//! collaborators, constructed once at startup and then driven by one
//! long-running task (there, `identity_committer.start().await`; here,
//! `scheduler.start(anchor_service).await`). The HTTP surface the teacher's
//! `App` also serves (`insert_identity`, `inclusion_proof`, ...) belongs to
//! the ingestion server, out of scope for this crate (§1 Non-goals).

use std::sync::Arc;

use aws_sdk_sqs::Client as SqsClient;
use tracing::info;

use crate::anchor_service::AnchorService;
use crate::blob::{BlobStore, MemoryBlobStore, S3BlobStore};
use crate::blockchain::{BlockchainClient, EthBlockchainClient};
use crate::config::{BlobConfig, Config};
use crate::database::Database;
use crate::scheduler::Scheduler;
use crate::shutdown::Shutdown;

/// Owns every long-lived dependency and the scheduler loop that drives
/// anchoring. Dropping or calling [`App::shutdown`] stops that loop.
pub struct App {
    pub database: Arc<Database>,
    pub anchor_service: Arc<AnchorService>,
    pub scheduler: Arc<Scheduler>,
    shutdown: Shutdown,
}

impl App {
    pub async fn new(config: Config, shutdown: Shutdown) -> anyhow::Result<Self> {
        let database = Arc::new(Database::new(&config.database).await?);

        let blockchain: Arc<dyn BlockchainClient> =
            Arc::new(EthBlockchainClient::new(&config.chain).await?);

        let blob_store: Arc<dyn BlobStore> = match &config.blob {
            BlobConfig::Memory => Arc::new(MemoryBlobStore::new()),
            BlobConfig::S3 { bucket, region, endpoint } => Arc::new(
                S3BlobStore::from_config(bucket.clone(), region.clone(), endpoint.clone()).await,
            ),
        };

        let queue: Option<Arc<dyn queue_client::Queue>> = match &config.queue {
            Some(queue_config) => {
                let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                let client = SqsClient::new(&aws_config);
                Some(Arc::new(queue_client::SqsQueueClient::new(
                    client,
                    queue_config.queue_url.clone(),
                )))
            }
            None => None,
        };

        let anchor_service = Arc::new(AnchorService::new(
            database.clone(),
            blockchain,
            blob_store,
            queue,
            config.batch,
            config.merkle,
            config.chain.use_smart_contract_anchors,
        ));

        let scheduler = Arc::new(Scheduler::new(config.scheduler.interval, shutdown.clone()));

        Ok(Self { database, anchor_service, scheduler, shutdown })
    }

    /// Starts the scheduler loop. Blocks until [`App::shutdown`] is called
    /// (from a signal handler or elsewhere) and the in-flight tick drains.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.scheduler.start(self.anchor_service.clone()).await;
        info!("anchor service running");
        self.shutdown.await_shutdown().await;
        self.scheduler.stop().await;
        Ok(())
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }
}

