use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use docket_core::domain::{CostRates, OwnerId, TaskKind};
use docket_core::impls::{
    ChannelConnection, FileTaskStore, FileWorkQueue, ScriptedProvider,
};
use docket_core::ports::{Clock, SystemClock};
use docket_core::{AppBuilder, OrchestratorConfig};
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One task of every kind, as a client would submit them.
fn demo_tasks() -> Vec<(TaskKind, serde_json::Value)> {
    vec![
        (
            TaskKind::DocumentParse,
            json!({
                "document_id": "doc-100",
                "file_name": "quality-manual.docx",
                "content": "1 Scope\n2 Normative references\n3 Terms and definitions",
            }),
        ),
        (
            TaskKind::DocumentReview,
            json!({
                "document_id": "doc-100",
                "template_id": "iso-9001",
                "content": "4.1 The organization shall determine external and internal issues",
            }),
        ),
        (
            TaskKind::DocumentGenerate,
            json!({
                "template_id": "iso-27001",
                "customer_id": "cust-42",
                "instructions": "Draft the access control policy",
            }),
        ),
        (
            TaskKind::TemplateReview,
            json!({
                "template_id": "iso-14001",
                "content": "6.1.2 Environmental aspects",
            }),
        ),
    ]
}

/// Print every relayed message as one JSON line.
async fn print_messages(mut rx: mpsc::Receiver<docket_core::domain::ProgressMessage>) {
    while let Some(message) = rx.recv().await {
        match serde_json::to_string(&message) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "could not encode progress message"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    // .env があれば読む（無くてもよい）
    let _ = dotenvy::dotenv();
    let config = OrchestratorConfig::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // 単価は 100 万単位あたり $3 / $15 相当
    let provider = Arc::new(
        ScriptedProvider::new("local", "scripted-1")
            .with_rates(CostRates::new(Decimal::new(3, 6), Decimal::new(15, 6)))
            .with_step_delay(Duration::from_millis(250)),
    );

    let builder = AppBuilder::new(config.clone())
        .with_clock(clock.clone())
        .with_provider(provider);
    let builder = match std::env::var("DOCKET_DATA_DIR") {
        Ok(dir) => {
            let dir = PathBuf::from(dir);
            tokio::fs::create_dir_all(&dir).await?;
            info!(dir = %dir.display(), "using file journals");
            let store = FileTaskStore::open(dir.join("tasks.jsonl"), clock.clone()).await?;
            let queue =
                FileWorkQueue::open(dir.join("queue.jsonl"), config.queue.claim_timeout, clock)
                    .await?;
            builder
                .with_store(Arc::new(store))
                .with_queue(Arc::new(queue))
        }
        Err(_) => builder.in_memory(),
    };
    let app = builder.build()?;

    let pool = app.start_workers();
    let reaper = app.start_reaper();

    let owner = OwnerId::new("demo-user");
    let mut relays = Vec::new();
    let mut printers = Vec::new();
    for (kind, payload) in demo_tasks() {
        let record = app.enqueue(kind, owner.clone(), payload).await?;
        let (conn, rx) = ChannelConnection::pair(64);
        relays.push(app.subscribe(record.task_id, Arc::new(conn)).await?);
        printers.push(tokio::spawn(print_messages(rx)));
    }

    // 最後の 1 件はすぐにキャンセルしてみせる
    if let Some(last) = relays.last() {
        app.cancel(last.task_id(), &owner).await?;
    }

    for relay in relays {
        let task_id = relay.task_id();
        let exit = relay.join().await?;
        info!(task_id = %task_id, exit = ?exit, "relay closed");
    }
    for printer in printers {
        printer.await?;
    }

    let counts = app.counts().await?;
    println!("{}", serde_json::to_string(&counts)?);

    pool.shutdown_and_join().await;
    reaper.shutdown_and_join().await;
    Ok(())
}
