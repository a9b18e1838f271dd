//! Anchor Service (C10): orchestrates one batch end to end — select
//! candidates, build the Merkle tree, submit the root on-chain, write
//! anchor commits, and persist the outcome (§4.6).
//!
//! Grounded on the teacher's `task_monitor` task shape (`Arc<Database>`
//! held directly rather than behind a store trait object, so the persist
//! step can open its own transaction) and `app/mod.rs`'s composition-root
//! style of holding already-constructed `Arc<dyn Trait>` collaborators for
//! everything that isn't the database.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cid::Cid;
use ethers::types::H256;
use once_cell::sync::Lazy;
use prometheus::{register_histogram, register_int_counter, Histogram, IntCounter};
use queue_client::{Message, Queue};
use sqlx::{Postgres, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::blob::BlobStore;
use crate::blockchain::BlockchainClient;
use crate::candidate::{self, sort_for_tree};
use crate::config::{BatchConfig, MerkleConfig};
use crate::database::anchor_store::NewAnchor;
use crate::database::{self, Database};
use crate::merkle::{self, car, proof};
use crate::shutdown::Shutdown;
use crate::types::{Candidate, Request, RequestStatus};

static BATCH_SIZE: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!("anchor_batch_size", "Number of candidates in an anchored batch.").unwrap()
});
static ANCHOR_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "anchor_duration_seconds",
        "Wall-clock time for one anchorRequests invocation."
    )
    .unwrap()
});
static LONG_ANCHOR_ALERTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "anchor_long_running_total",
        "Number of anchor invocations exceeding the long-anchor alert threshold."
    )
    .unwrap()
});

const MUTEX_ATTEMPTS: u32 = 5;
const MUTEX_WAIT: Duration = Duration::from_millis(100);
const PERSIST_RETRY_SLEEP: Duration = Duration::from_millis(100);

/// One batch's worth of work, tagged with the in-flight queue message (queue
/// mode) or nothing (DB mode), so the caller knows whether to ack/nack or
/// whether to revert request status on failure.
struct Batch {
    requests: Vec<Request>,
    message: Option<Box<dyn Message>>,
}

impl Batch {
    fn is_queue_mode(&self) -> bool {
        self.message.is_some()
    }
}

pub struct AnchorService {
    database: Arc<Database>,
    blockchain: Arc<dyn BlockchainClient>,
    blob_store: Arc<dyn BlobStore>,
    queue: Option<Arc<dyn Queue>>,
    batch: BatchConfig,
    merkle: MerkleConfig,
    use_smart_contract_anchors: bool,
    queue_visibility_timeout: Duration,
    alert_on_long_anchor: Duration,
}

impl AnchorService {
    pub fn new(
        database: Arc<Database>,
        blockchain: Arc<dyn BlockchainClient>,
        blob_store: Arc<dyn BlobStore>,
        queue: Option<Arc<dyn Queue>>,
        batch: BatchConfig,
        merkle: MerkleConfig,
        use_smart_contract_anchors: bool,
    ) -> Self {
        let alert_on_long_anchor = batch.alert_on_long_anchor;
        Self {
            database,
            blockchain,
            blob_store,
            queue,
            batch,
            merkle,
            use_smart_contract_anchors,
            queue_visibility_timeout: Duration::from_secs(30),
            alert_on_long_anchor,
        }
    }

    /// Runs one full batch cycle. Returns `true` if a batch was anchored,
    /// `false` on every no-op path (nothing to do, nothing eligible).
    #[instrument(skip(self, shutdown))]
    pub async fn anchor_requests(&self, shutdown: &Shutdown) -> anyhow::Result<bool> {
        let start = Instant::now();
        let result = self.anchor_requests_inner(shutdown).await;
        let elapsed = start.elapsed();
        ANCHOR_DURATION.observe(elapsed.as_secs_f64());
        if elapsed >= self.alert_on_long_anchor {
            LONG_ANCHOR_ALERTS.inc();
            warn!(?elapsed, "anchor cycle exceeded the long-anchor alert threshold");
        }
        result
    }

    async fn anchor_requests_inner(&self, shutdown: &Shutdown) -> anyhow::Result<bool> {
        let Some(batch) = self.obtain_batch(shutdown).await? else {
            return Ok(false);
        };

        if batch.requests.is_empty() {
            info!("no requests available for this anchor cycle");
            if let Some(message) = batch.message {
                message.ack().await?;
            }
            return Ok(false);
        }

        let groups = candidate::select_candidates(
            batch.requests,
            self.batch.candidate_limit,
            self.database.as_ref(),
            self.database.as_ref(),
        )
        .await?;

        if !groups.failed.is_empty() {
            let ids: Vec<Uuid> = groups.failed.iter().map(|r| r.id).collect();
            self.database
                .update_requests_status(None, &ids, RequestStatus::Failed, None)
                .await?;
        }

        if !groups.already_anchored.is_empty() {
            let ids: Vec<Uuid> = groups.already_anchored.iter().map(|c| c.request.id).collect();
            self.database
                .update_requests_status(None, &ids, RequestStatus::Completed, Some(true))
                .await?;
        }

        if !groups.unprocessed.is_empty() {
            // Truncated by candidate_limit: give these back to READY so the
            // next cycle picks them up instead of leaving them stranded in
            // PROCESSING.
            let ids: Vec<Uuid> = groups.unprocessed.iter().map(|r| r.id).collect();
            self.database
                .update_requests_status(None, &ids, RequestStatus::Ready, None)
                .await?;
        }

        let mut candidates = groups.accepted;
        if candidates.is_empty() {
            info!("no eligible candidates in this batch");
            if let Some(message) = batch.message {
                message.ack().await?;
            }
            return Ok(false);
        }

        sort_for_tree(&mut candidates);
        BATCH_SIZE.observe(candidates.len() as f64);

        let tree = match merkle::build_tree(&candidates, self.merkle.depth_limit) {
            Ok(tree) => tree,
            Err(err) => {
                self.revert_on_failure(batch.is_queue_mode(), &candidates).await;
                if let Some(message) = batch.message {
                    let _ = message.nack().await;
                }
                return Err(err.into());
            }
        };

        let queue_mode = batch.is_queue_mode();

        let tx_record = {
            let root = tree.root;
            let result = self
                .database
                .with_transaction_mutex(MUTEX_ATTEMPTS, MUTEX_WAIT, || {
                    let blockchain = self.blockchain.clone();
                    let shutdown = shutdown.clone();
                    async move { Ok(blockchain.anchor_root(&root, &shutdown).await) }
                })
                .await;

            match result {
                Ok(Ok(record)) => record,
                Ok(Err(submission_err)) => {
                    self.revert_on_failure(queue_mode, &candidates).await;
                    if let Some(message) = batch.message {
                        let _ = message.nack().await;
                    }
                    return Err(submission_err.into());
                }
                Err(mutex_err) => {
                    // Mutex unavailable: in DB mode leave request status
                    // untouched (the tick simply no-ops and PROCESSING_TIMEOUT
                    // re-promotion picks the batch back up) instead of
                    // bouncing PROCESSING -> PENDING -> PROCESSING on every
                    // contended tick; in queue mode, nack so another worker
                    // retries (§4.6 step 6).
                    if let Some(message) = batch.message {
                        let _ = message.nack().await;
                    }
                    return Err(mutex_err.into());
                }
            }
        };

        match self
            .finish_batch(&tree, &candidates, &tx_record.chain, tx_record.tx_hash)
            .await
        {
            Ok(()) => {
                if let Some(message) = batch.message {
                    message.ack().await?;
                }
                Ok(true)
            }
            Err(err) => {
                self.revert_on_failure(queue_mode, &candidates).await;
                if let Some(message) = batch.message {
                    let _ = message.nack().await;
                }
                Err(err)
            }
        }
    }

    /// Steps 7-11: anchor proof, per-leaf anchor commits, Merkle/witness CAR
    /// storage, and the transactional persist step.
    async fn finish_batch(
        &self,
        tree: &merkle::MerkleTree,
        candidates: &[Candidate],
        chain: &str,
        tx_hash: H256,
    ) -> anyhow::Result<()> {
        let tx_type = self
            .use_smart_contract_anchors
            .then(|| "f(bytes32)".to_string());

        let anchor_proof = proof::AnchorProof {
            root: tree.root,
            chain_id: chain.to_string(),
            tx_hash: proof::tx_hash_to_cid(tx_hash),
            tx_type,
        };
        let (proof_cid, proof_bytes) = anchor_proof.to_block()?;

        let mut merkle_blocks = tree.blocks.clone();
        merkle_blocks.push((proof_cid, proof_bytes.clone()));

        struct LeafAnchor {
            new_anchor: NewAnchor,
            commit_cid: Cid,
            commit_bytes: Vec<u8>,
        }

        let mut leaves = Vec::with_capacity(candidates.len());
        for (index, candidate) in candidates.iter().enumerate() {
            let path = tree.path_string(index);
            let commit = proof::AnchorCommit {
                id: proof::stream_id_to_cid(&candidate.stream_id),
                prev: candidate.cid,
                proof: proof_cid,
                path: path.clone(),
            };
            let (commit_cid, commit_bytes) = commit.to_block()?;
            merkle_blocks.push((commit_cid, commit_bytes.clone()));

            leaves.push(LeafAnchor {
                new_anchor: NewAnchor {
                    request_id: candidate.request.id,
                    path,
                    cid: commit_cid.to_string(),
                    proof_cid: proof_cid.to_string(),
                },
                commit_cid,
                commit_bytes,
            });
        }

        let merkle_car = car::write_car(Vec::new(), &merkle_blocks).await?;
        self.blob_store.put(&proof_cid.to_string(), merkle_car).await?;

        for (index, leaf) in leaves.iter().enumerate() {
            let mut witness_blocks = vec![
                (leaf.commit_cid, leaf.commit_bytes.clone()),
                (proof_cid, proof_bytes.clone()),
            ];
            let mut seen: HashSet<Cid> = HashSet::new();
            seen.insert(leaf.commit_cid);
            seen.insert(proof_cid);

            if let Some(root_bytes) = tree.block_bytes(&tree.root) {
                if seen.insert(tree.root) {
                    witness_blocks.push((tree.root, root_bytes.to_vec()));
                }
            }
            for ancestor in tree.path_nodes(index) {
                if !seen.insert(*ancestor) {
                    continue;
                }
                if let Some(bytes) = tree.block_bytes(ancestor) {
                    witness_blocks.push((*ancestor, bytes.to_vec()));
                }
            }

            let witness_car = car::write_car(vec![leaf.commit_cid], &witness_blocks).await?;
            self.blob_store.put(&leaf.commit_cid.to_string(), witness_car).await?;
        }

        let new_anchors: Vec<NewAnchor> = leaves.into_iter().map(|l| l.new_anchor).collect();
        let request_ids: Vec<Uuid> = candidates.iter().map(|c| c.request.id).collect();
        self.persist_batch(&new_anchors, &request_ids).await
    }

    /// §4.6 step 11: insert anchors and complete requests in one
    /// transaction, retrying the whole step on a serialization conflict.
    async fn persist_batch(&self, anchors: &[NewAnchor], request_ids: &[Uuid]) -> anyhow::Result<()> {
        loop {
            let mut tx = self.database.pool().begin().await?;

            match self.try_persist(&mut tx, anchors, request_ids).await {
                Ok(()) => {
                    tx.commit().await?;
                    return Ok(());
                }
                Err(database::Error::Internal(err)) if database::is_serialization_failure(&err) => {
                    warn!("persist step hit a serialization conflict, retrying");
                    tokio::time::sleep(PERSIST_RETRY_SLEEP).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    async fn try_persist(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        anchors: &[NewAnchor],
        request_ids: &[Uuid],
    ) -> database::Result<()> {
        self.database.create_anchors(Some(tx), anchors).await?;
        self.database
            .update_requests_status(Some(tx), request_ids, RequestStatus::Completed, Some(true))
            .await?;
        Ok(())
    }

    /// DB mode reverts accepted candidates back to PENDING so they are
    /// re-promoted on a future cycle; queue mode leaves status untouched
    /// and relies on the caller nacking the message for redelivery.
    async fn revert_on_failure(&self, queue_mode: bool, candidates: &[Candidate]) {
        if queue_mode || candidates.is_empty() {
            return;
        }
        let ids: Vec<Uuid> = candidates.iter().map(|c| c.request.id).collect();
        if let Err(err) = self
            .database
            .update_requests_status(None, &ids, RequestStatus::Pending, None)
            .await
        {
            warn!(%err, "failed to revert batch to PENDING after an anchoring error");
        }
    }

    /// §4.6 step 2: acquires one batch's worth of requests, either from the
    /// queue (queue mode) or by promoting/draining READY rows (DB mode).
    async fn obtain_batch(&self, shutdown: &Shutdown) -> anyhow::Result<Option<Batch>> {
        if let Some(queue) = &self.queue {
            let Some(message) = queue.receive(self.queue_visibility_timeout).await? else {
                return Ok(None);
            };

            let descriptor = message.data().clone();
            let mut requests = self.database.find_by_ids(&descriptor.request_ids).await?;
            requests.retain(|r| r.status != RequestStatus::Replaced);

            return Ok(Some(Batch { requests, message: Some(message) }));
        }

        if shutdown.is_shutting_down() {
            return Ok(None);
        }

        let ready_count = self.database.count_by_status(RequestStatus::Ready).await?;
        if ready_count == 0 {
            self.database
                .find_and_mark_ready(
                    2 * self.batch.max_stream_limit as i64,
                    self.batch.min_stream_limit as i64,
                    self.batch.max_anchoring_delay,
                    self.batch.processing_timeout,
                    self.batch.failure_retry_window,
                )
                .await?;
        }

        let requests = self
            .database
            .batch_processing(self.batch.max_stream_limit as i64)
            .await?;

        Ok(Some(Batch { requests, message: None }))
    }

    /// Secondary entry point for non-worker instances (§4.6): surfaces
    /// whether a batch is ready to be anchored without actually anchoring
    /// one, resetting any expired READY rows along the way.
    #[instrument(skip(self))]
    pub async fn emit_anchor_event_if_ready(&self) -> anyhow::Result<bool> {
        self.database
            .update_expiring_ready_requests(self.batch.ready_timeout)
            .await?;

        let ready_count = self.database.count_by_status(RequestStatus::Ready).await?;
        if ready_count > 0 {
            info!(ready_count, "requests already READY");
            return Ok(true);
        }

        let promoted = self
            .database
            .find_and_mark_ready(
                2 * self.batch.max_stream_limit as i64,
                self.batch.min_stream_limit as i64,
                self.batch.max_anchoring_delay,
                self.batch.processing_timeout,
                self.batch.failure_retry_window,
            )
            .await?;

        if !promoted.is_empty() {
            info!(promoted = promoted.len(), "promoted requests to READY");
        }

        Ok(!promoted.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_is_queue_mode_iff_it_carries_a_message() {
        let db_mode = Batch { requests: Vec::new(), message: None };
        assert!(!db_mode.is_queue_mode());
    }
}

#[cfg(test)]
mod integration_tests {
    use std::sync::Mutex as StdMutex;

    use chrono::Utc;
    use queue_client::{BatchDescriptor, InMemoryQueue};
    use testcontainers::clients::Cli;

    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::config::{BatchConfig, DatabaseConfig, MerkleConfig};
    use crate::database::request_store::NewRequest;
    use crate::merkle::node::cid_for;
    use crate::types::{RequestStatus, TransactionRecord};

    /// A [`BlockchainClient`] stub that always succeeds with a fixed record,
    /// or always fails, depending on how the test constructs it.
    struct StubBlockchain {
        outcome: StdMutex<Option<Result<TransactionRecord, crate::blockchain::Error>>>,
    }

    impl StubBlockchain {
        fn succeeding() -> Self {
            Self {
                outcome: StdMutex::new(Some(Ok(TransactionRecord {
                    chain: "eip155:1337".to_string(),
                    tx_hash: H256::zero(),
                    block_number: 1,
                    block_timestamp: Utc::now(),
                }))),
            }
        }

        fn failing() -> Self {
            Self {
                outcome: StdMutex::new(Some(Err(crate::blockchain::Error::Cancelled))),
            }
        }
    }

    #[async_trait::async_trait]
    impl BlockchainClient for StubBlockchain {
        async fn anchor_root(
            &self,
            _root: &Cid,
            _shutdown: &Shutdown,
        ) -> crate::blockchain::Result<TransactionRecord> {
            self.outcome
                .lock()
                .unwrap()
                .take()
                .expect("anchor_root called more than once in this test")
        }
    }

    fn batch_config() -> BatchConfig {
        BatchConfig {
            max_stream_limit: 100,
            min_stream_limit: 1,
            candidate_limit: 0,
            max_anchoring_delay: Duration::from_secs(600),
            processing_timeout: Duration::from_secs(300),
            ready_timeout: Duration::from_secs(300),
            failure_retry_window: Duration::from_secs(3600),
            alert_on_long_anchor: Duration::from_secs(3600),
        }
    }

    async fn test_db(docker: &Cli) -> (Arc<Database>, postgres_docker_utils::DockerContainerGuard) {
        let container = postgres_docker_utils::setup().await.unwrap();
        let _ = docker;
        let config = DatabaseConfig {
            database_url: format!("postgres://postgres@localhost:{}/postgres", container.port()),
            migrate: true,
            max_connections: 5,
        };
        let db = Database::new(&config).await.unwrap();
        (Arc::new(db), container)
    }

    async fn new_request(db: &Database, stream_id: &str, cid_label: &str) -> Request {
        db.create_or_update(NewRequest {
            cid: cid_for(cid_label.as_bytes()).to_string(),
            stream_id: stream_id.to_string(),
            message: None,
            pinned: false,
            origin: None,
            timestamp: Utc::now(),
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn db_mode_anchors_a_ready_batch_end_to_end() {
        let docker = Cli::default();
        let (db, _container) = test_db(&docker).await;

        let r1 = new_request(&db, "stream-a", "cid-a").await;
        let r2 = new_request(&db, "stream-b", "cid-b").await;

        let service = AnchorService::new(
            db.clone(),
            Arc::new(StubBlockchain::succeeding()),
            Arc::new(MemoryBlobStore::new()),
            None,
            batch_config(),
            MerkleConfig { depth_limit: 0 },
            false,
        );

        let shutdown = Shutdown::new();
        let anchored = service.anchor_requests(&shutdown).await.unwrap();
        assert!(anchored);

        let updated1 = db.find_by_cid(&r1.cid).await.unwrap().unwrap();
        let updated2 = db.find_by_cid(&r2.cid).await.unwrap().unwrap();
        assert_eq!(updated1.status, RequestStatus::Completed);
        assert_eq!(updated2.status, RequestStatus::Completed);
        assert!(updated1.pinned);
        assert!(updated2.pinned);

        let anchor1 = db.find_anchor_by_request(&updated1).await.unwrap().unwrap();
        assert!(!anchor1.proof_cid.is_empty());
    }

    #[tokio::test]
    async fn db_mode_reverts_to_pending_when_submission_fails() {
        let docker = Cli::default();
        let (db, _container) = test_db(&docker).await;

        let r1 = new_request(&db, "stream-a", "cid-a").await;

        let service = AnchorService::new(
            db.clone(),
            Arc::new(StubBlockchain::failing()),
            Arc::new(MemoryBlobStore::new()),
            None,
            batch_config(),
            MerkleConfig { depth_limit: 0 },
            false,
        );

        let shutdown = Shutdown::new();
        let result = service.anchor_requests(&shutdown).await;
        assert!(result.is_err());

        let reverted = db.find_by_cid(&r1.cid).await.unwrap().unwrap();
        assert_eq!(reverted.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn queue_mode_acks_on_success_and_does_not_touch_request_status_on_failure() {
        let docker = Cli::default();
        let (db, _container) = test_db(&docker).await;

        let r1 = new_request(&db, "stream-a", "cid-a").await;
        db.update_requests_status(None, &[r1.id], RequestStatus::Ready, None)
            .await
            .unwrap();

        let queue = InMemoryQueue::new();
        queue.push(BatchDescriptor { batch_id: "b1".to_string(), request_ids: vec![r1.id] });

        let service = AnchorService::new(
            db.clone(),
            Arc::new(StubBlockchain::failing()),
            Arc::new(MemoryBlobStore::new()),
            Some(Arc::new(queue.clone())),
            batch_config(),
            MerkleConfig { depth_limit: 0 },
            false,
        );

        let shutdown = Shutdown::new();
        let result = service.anchor_requests(&shutdown).await;
        assert!(result.is_err());

        // Queue mode never mutates request status on failure — redelivery
        // via nack is what drives retry, not a PENDING revert.
        let untouched = db.find_by_cid(&r1.cid).await.unwrap().unwrap();
        assert_eq!(untouched.status, RequestStatus::Ready);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn emit_anchor_event_if_ready_promotes_when_min_streams_met() {
        let docker = Cli::default();
        let (db, _container) = test_db(&docker).await;

        new_request(&db, "stream-a", "cid-a").await;

        let service = AnchorService::new(
            db.clone(),
            Arc::new(StubBlockchain::succeeding()),
            Arc::new(MemoryBlobStore::new()),
            None,
            batch_config(),
            MerkleConfig { depth_limit: 0 },
            false,
        );

        let ready = service.emit_anchor_event_if_ready().await.unwrap();
        assert!(ready);
        assert_eq!(db.count_by_status(RequestStatus::Ready).await.unwrap(), 1);
    }
}
