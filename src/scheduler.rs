//! Scheduler (C12): a single cooperative loop that ticks the Anchor Service
//! on a timer (§4.8).
//!
//! The teacher's `task_monitor/mod.rs` drives several independent long-lived
//! tasks via a `FuturesUnordered` fan-out (tree init, queue monitor, batch
//! creation, finalization...), each with its own backoff. This component is
//! one periodic tick, not several tasks, so it is built instead as a single
//! `tokio::select!` loop: a `tokio::time::interval` (first tick fires
//! immediately) raced against the shutdown signal, with an `AtomicBool`
//! flag marking whether a tick is currently running so `stop()` — and
//! anything else that cares — can tell a tick apart from idle wait.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn};

use crate::anchor_service::AnchorService;
use crate::shutdown::Shutdown;

static TICKS: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("scheduler_ticks_total", "Scheduler ticks run.").unwrap());
static TICK_ERRORS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "scheduler_tick_errors_total",
        "Scheduler ticks that returned an error."
    )
    .unwrap()
});

/// Drives `AnchorService::anchor_requests` on a fixed interval. `start` may
/// only be called once per instance; a second call is a programmer error.
pub struct Scheduler {
    interval: Duration,
    shutdown: Shutdown,
    tick_in_flight: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            interval,
            shutdown,
            tick_in_flight: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// Spawns the loop. Returns immediately; the first tick runs on the
    /// spawned task shortly after.
    #[instrument(skip(self, anchor_service))]
    pub async fn start(&self, anchor_service: Arc<AnchorService>) {
        let mut slot = self.handle.lock().await;
        assert!(slot.is_none(), "Scheduler::start called more than once");

        let interval = self.interval;
        let shutdown = self.shutdown.clone();
        let tick_in_flight = self.tick_in_flight.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;

                    () = shutdown.await_shutdown() => {
                        info!("scheduler stopping");
                        break;
                    }
                    _ = ticker.tick() => {
                        // A tick never overlaps the previous one: the loop
                        // only returns to `select!` — and so only schedules
                        // the next tick — once this one's task() has fully
                        // resolved. `MissedTickBehavior::Skip` drops any
                        // ticks the interval queued up while we were busy,
                        // rather than firing them back to back.
                        tick_in_flight.store(true, Ordering::SeqCst);
                        TICKS.inc();
                        if let Err(err) = anchor_service.anchor_requests(&shutdown).await {
                            TICK_ERRORS.inc();
                            warn!(%err, "anchor cycle failed, will retry next tick");
                        }
                        tick_in_flight.store(false, Ordering::SeqCst);
                    }
                }
            }
        });

        *slot = Some(handle);
    }

    /// True while a tick's `anchor_requests` call is running.
    pub fn is_tick_in_flight(&self) -> bool {
        self.tick_in_flight.load(Ordering::SeqCst)
    }

    /// Signals the loop to stop and waits for the in-flight tick (if any)
    /// to finish before returning.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        self.shutdown.shutdown();
        let handle = self.handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(%err, "scheduler task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_in_flight_starts_false() {
        let scheduler = Scheduler::new(Duration::from_secs(1), Shutdown::new());
        assert!(!scheduler.is_tick_in_flight());
    }

    #[tokio::test]
    async fn stop_without_start_returns_immediately() {
        let scheduler = Scheduler::new(Duration::from_millis(10), Shutdown::new());
        scheduler.stop().await;
        assert!(scheduler.handle.lock().await.is_none());
    }

}

#[cfg(test)]
mod integration_tests {
    use chrono::Utc;
    use testcontainers::clients::Cli;

    use super::*;
    use crate::anchor_service::AnchorService;
    use crate::blob::MemoryBlobStore;
    use crate::blockchain::BlockchainClient;
    use crate::config::{BatchConfig, DatabaseConfig, MerkleConfig};
    use crate::database::request_store::NewRequest;
    use crate::database::Database;
    use crate::merkle::node::cid_for;
    use crate::types::TransactionRecord;

    struct StubBlockchain;

    #[async_trait::async_trait]
    impl BlockchainClient for StubBlockchain {
        async fn anchor_root(
            &self,
            _root: &cid::Cid,
            _shutdown: &Shutdown,
        ) -> crate::blockchain::Result<TransactionRecord> {
            Ok(TransactionRecord {
                chain: "eip155:1337".to_string(),
                tx_hash: ethers::types::H256::zero(),
                block_number: 1,
                block_timestamp: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn start_then_stop_runs_at_least_one_tick_and_joins_cleanly() {
        let container = postgres_docker_utils::setup().await.unwrap();
        let db = Database::new(&DatabaseConfig {
            database_url: format!("postgres://postgres@localhost:{}/postgres", container.port()),
            migrate: true,
            max_connections: 5,
        })
        .await
        .unwrap();
        let db = Arc::new(db);

        db.create_or_update(NewRequest {
            cid: cid_for(b"cid-a").to_string(),
            stream_id: "stream-a".to_string(),
            message: None,
            pinned: false,
            origin: None,
            timestamp: Utc::now(),
        })
        .await
        .unwrap();

        let anchor_service = Arc::new(AnchorService::new(
            db.clone(),
            Arc::new(StubBlockchain),
            Arc::new(MemoryBlobStore::new()),
            None,
            BatchConfig {
                max_stream_limit: 100,
                min_stream_limit: 1,
                candidate_limit: 0,
                max_anchoring_delay: Duration::from_secs(600),
                processing_timeout: Duration::from_secs(300),
                ready_timeout: Duration::from_secs(300),
                failure_retry_window: Duration::from_secs(3600),
                alert_on_long_anchor: Duration::from_secs(3600),
            },
            MerkleConfig { depth_limit: 0 },
            false,
        ));

        let shutdown = Shutdown::new();
        let scheduler = Scheduler::new(Duration::from_millis(20), shutdown);
        scheduler.start(anchor_service).await;

        // Give the first (immediate) tick time to complete the full
        // select→anchor→persist round trip before we ask it to stop.
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.stop().await;

        assert!(!scheduler.is_tick_in_flight());
        assert!(scheduler.handle.lock().await.is_none());
        assert_eq!(
            db.count_by_status(crate::types::RequestStatus::Completed).await.unwrap(),
            1
        );
    }
}
