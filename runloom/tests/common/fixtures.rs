//! Shared fixtures: a coordinator over memory backends with deterministic
//! provider, jitter, and sleeper injection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::Mutex;
use runloom::agent::{JitterSource, Provider, Sleeper, Tool};
use runloom::audit::MemoryAuditStore;
use runloom::config::RuntimeSettings;
use runloom::coordinator::Coordinator;
use runloom::graph::{install_builtins, Workflow};
use runloom::ledger::MemoryLedger;
use runloom::observe::{EventSink, MemorySink, MultiSink, StoreSink};
use runloom::queue::MemoryQueue;
use runloom::registry::Registry;
use runloom::store::{MemoryStateStore, Run, RunStatus, StateStore};

/// Settings tuned for test speed: millisecond heartbeats and backoffs.
pub fn fast_settings() -> RuntimeSettings {
    let mut settings = RuntimeSettings::default();
    settings.heartbeat_interval = Duration::from_millis(20);
    settings.heartbeat_timeout = Duration::from_millis(100);
    settings.task_visibility = Duration::from_millis(500);
    settings.retry.base_backoff = Duration::from_millis(20);
    settings.retry.max_backoff = Duration::from_millis(200);
    settings
}

pub struct Harness {
    pub store: Arc<MemoryStateStore>,
    pub ledger: Arc<MemoryLedger>,
    pub queue: Arc<MemoryQueue>,
    pub sink: Arc<MemorySink>,
    pub audit: Arc<MemoryAuditStore>,
    pub coordinator: Coordinator,
}

impl Harness {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self::with_settings(provider, fast_settings())
    }

    pub fn with_settings(provider: Arc<dyn Provider>, settings: RuntimeSettings) -> Self {
        let store = Arc::new(MemoryStateStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let queue = Arc::new(MemoryQueue::new(settings.task_visibility));
        let sink = Arc::new(MemorySink::new());
        let audit = Arc::new(MemoryAuditStore::new());
        // Production shape: fan out to the live sink and the store-backed
        // replay log.
        let events: Arc<dyn EventSink> = Arc::new(MultiSink::new(vec![
            sink.clone() as Arc<dyn EventSink>,
            Arc::new(StoreSink::new(store.clone() as Arc<dyn StateStore>)),
        ]));
        let workflows = Arc::new(Registry::<Workflow>::new("workflow"));
        install_builtins(&workflows, provider.clone()).expect("builtins register");
        let tools: Arc<Registry<Arc<dyn Tool>>> = Arc::new(Registry::new("tool"));
        let coordinator = Coordinator::new(
            store.clone(),
            ledger.clone(),
            queue.clone(),
            events,
            audit.clone(),
            workflows,
            tools,
            provider,
            settings,
        );
        Self {
            store,
            ledger,
            queue,
            sink,
            audit,
            coordinator,
        }
    }

    /// Step one worker until the run reaches a terminal status (bounded).
    pub async fn drive_to_terminal(&self, worker: &runloom::coordinator::Worker, run_id: &str) -> Run {
        for _ in 0..200 {
            let _ = worker.run_once(Duration::from_millis(30)).await;
            let run = self.store.get_run(run_id).await.expect("run exists");
            if run.status.is_terminal() {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run {run_id} did not reach a terminal status");
    }

    pub async fn run_status(&self, run_id: &str) -> RunStatus {
        self.store.get_run(run_id).await.expect("run exists").status
    }
}

/// Sleeper that records requested delays and returns immediately.
#[derive(Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().clone()
    }

    pub fn as_sleeper(&self) -> Sleeper {
        let delays = self.delays.clone();
        Arc::new(move |d| {
            delays.lock().push(d);
            async {}.boxed()
        })
    }
}

/// Jitter pinned to the midpoint: no jitter applied.
pub fn fixed_jitter() -> JitterSource {
    Arc::new(|| 0.5)
}
