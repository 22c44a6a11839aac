use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use tracing::info;

use pagepulse_core_types::ManualClock;
use pagepulse_dispatch::{Dispatcher, RecordingSink, SinkCall};
use pagepulse_ingest_client::{IngestClient, IngestConfig};
use pagepulse_kv_store::{JsonFileStore, KvBackend, MemoryStore};

use crate::config::Config;
use crate::runtime::{ensure_visitor_id, Runtime};

#[derive(Args, Clone, Debug)]
pub struct ReplayArgs {
    /// JSON event log (array of page event records)
    pub log: PathBuf,

    /// Deliver to the configured ingestion endpoint instead of the
    /// dry-run summary
    #[arg(long)]
    pub live: bool,
}

pub async fn cmd_replay(args: ReplayArgs, config: &Config) -> Result<()> {
    let store: Arc<dyn KvBackend> = match &config.storage.path {
        Some(path) => Arc::new(JsonFileStore::open(path)),
        None => Arc::new(MemoryStore::new()),
    };
    let clock = Arc::new(ManualClock::new(0));

    let recording = RecordingSink::new();
    let dispatcher = if args.live {
        let visitor = ensure_visitor_id(store.as_ref(), clock.as_ref());
        let ingest = IngestClient::new(IngestConfig {
            server_url: config.thinking_data.server_url.clone(),
            endpoint_path: config.thinking_data.endpoint_path.clone(),
            app_id: config.thinking_data.app_id.clone(),
            distinct_id: visitor.0,
            batch_size: config.thinking_data.batch_size,
            debug_mode: config.debug,
            timeout_ms: config.thinking_data.timeout_ms,
        })?;
        Dispatcher::with_sink(ingest)
    } else {
        Dispatcher::with_sink(recording.clone())
    };

    let runtime = Runtime::for_replay(config, clock, store, dispatcher);
    runtime.start().await;
    let replayed = runtime.replay_file(&args.log).await?;
    runtime.shutdown().await;
    info!(replayed, "event log replayed");

    println!("Replayed {replayed} events from {}", args.log.display());
    if !args.live {
        print_summary(&recording.calls());
    }
    Ok(())
}

fn print_summary(calls: &[SinkCall]) {
    let mut tracked = std::collections::BTreeMap::<String, usize>::new();
    let mut user_ops = 0usize;
    for call in calls {
        match call {
            SinkCall::Track { event, .. } => *tracked.entry(event.clone()).or_default() += 1,
            _ => user_ops += 1,
        }
    }
    println!("Dry-run dispatch summary:");
    for (event, count) in &tracked {
        println!("- {event}: {count}");
    }
    println!("- visitor attribute updates: {user_ops}");
}
