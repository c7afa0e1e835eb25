//! Submit a run and drive it with an in-process worker.
//!
//! Uses memory backends and a scripted provider so the example runs
//! without external services:
//!
//! ```bash
//! cargo run --example submit_and_work -- "Investigate auth service token validation failures"
//! ```

use std::sync::Arc;
use std::time::Duration;

use runloom::agent::{ScriptedProvider, Tool};
use runloom::audit::MemoryAuditStore;
use runloom::config::RuntimeSettings;
use runloom::coordinator::{Coordinator, SubmitRequest};
use runloom::graph::{install_builtins, Workflow};
use runloom::ledger::MemoryLedger;
use runloom::observe::{AsyncSink, EventSink, MultiSink, StoreSink, TracingSink};
use runloom::queue::MemoryQueue;
use runloom::registry::Registry;
use runloom::store::{MemoryStateStore, RunMode, StateStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let input = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let input = if input.trim().is_empty() {
        "Investigate auth service token validation failures and DB timeouts".to_string()
    } else {
        input
    };

    let settings = RuntimeSettings::from_env();
    let provider = Arc::new(ScriptedProvider::always(
        "Token validation fails because the JWKS cache expired; DB timeouts are a red herring.",
    ));

    let store = Arc::new(MemoryStateStore::new());
    let ledger = Arc::new(MemoryLedger::new());
    let queue = Arc::new(MemoryQueue::new(settings.task_visibility));
    let audit = Arc::new(MemoryAuditStore::new());

    let downstream: Arc<dyn EventSink> = Arc::new(MultiSink::new(vec![
        Arc::new(TracingSink),
        Arc::new(StoreSink::new(store.clone() as Arc<dyn StateStore>)),
    ]));
    let events = Arc::new(AsyncSink::new(downstream, settings.event_buffer));

    let workflows = Arc::new(Registry::<Workflow>::new("workflow"));
    install_builtins(&workflows, provider.clone())?;
    let tools: Arc<Registry<Arc<dyn Tool>>> = Arc::new(Registry::new("tool"));

    let coordinator = Coordinator::new(
        store.clone(),
        ledger,
        queue,
        events.clone(),
        audit,
        workflows,
        tools,
        provider,
        settings,
    );

    let receipt = coordinator
        .submit(SubmitRequest {
            input,
            mode: RunMode::Run,
            workflow: Some("basic".to_string()),
            flow: None,
            session_id: None,
            provider: None,
            max_attempts: Some(3),
            metadata: Default::default(),
            delivery: None,
        })
        .await?;
    println!(
        "submitted run_id={} session_id={} task_id={}",
        receipt.run_id, receipt.session_id, receipt.task_id
    );

    let stats = coordinator.queue_stats().await?;
    println!(
        "queue stats: stream_length={} pending={} dlq_length={}",
        stats.stream_length, stats.pending, stats.dlq_length
    );

    let worker = coordinator.worker("w1");
    loop {
        worker.run_once(Duration::from_millis(100)).await?;
        let run = coordinator.get_run(&receipt.run_id).await?;
        if run.status.is_terminal() {
            println!("run finished: status={} output={:?}", run.status, run.output);
            break;
        }
    }

    events.close().await;
    Ok(())
}
