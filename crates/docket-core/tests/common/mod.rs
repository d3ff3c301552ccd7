//! Shared helpers for the orchestration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use docket_core::app::TaskView;
use docket_core::domain::{ProgressMessage, TaskId};
use docket_core::impls::{ChannelConnection, ScriptedProvider};
use docket_core::{App, AppBuilder, OrchestratorConfig};
use serde_json::json;
use tokio::sync::mpsc;

const WAIT: Duration = Duration::from_secs(5);

/// Short timeouts so redelivery and polling happen within a test run.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.queue.claim_timeout = Duration::from_millis(400);
    config.queue.block_timeout = Duration::from_millis(50);
    config.gateway.call_timeout = Duration::from_millis(300);
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(10);
    config.relay.store_poll_interval = Duration::from_millis(20);
    config
}

pub fn in_memory_app(config: OrchestratorConfig, provider: Arc<ScriptedProvider>) -> App {
    AppBuilder::new(config)
        .in_memory()
        .with_provider(provider)
        .build()
        .expect("app builds")
}

pub fn parse_payload() -> serde_json::Value {
    json!({
        "document_id": "doc-1",
        "file_name": "procedures.docx",
        "content": "4.1 Understanding the organization and its context",
    })
}

pub async fn attach(app: &App, task_id: TaskId) -> mpsc::Receiver<ProgressMessage> {
    let (conn, rx) = ChannelConnection::pair(64);
    app.subscribe(task_id, Arc::new(conn))
        .await
        .expect("relay attaches");
    rx
}

pub async fn next_message(rx: &mut mpsc::Receiver<ProgressMessage>) -> ProgressMessage {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("message before timeout")
        .expect("relay still open")
}

/// Everything the relay sends, up to and including the terminal message.
pub async fn until_terminal(rx: &mut mpsc::Receiver<ProgressMessage>) -> Vec<ProgressMessage> {
    let mut seen = Vec::new();
    loop {
        let message = next_message(rx).await;
        let done = message.is_terminal();
        seen.push(message);
        if done {
            return seen;
        }
    }
}

pub fn live_progress(messages: &[ProgressMessage]) -> Vec<u8> {
    messages
        .iter()
        .filter_map(|m| match m {
            ProgressMessage::Progress(p) => Some(p.progress),
            _ => None,
        })
        .collect()
}

/// Poll the status query until `pred` holds.
pub async fn wait_for(app: &App, task_id: TaskId, pred: impl Fn(&TaskView) -> bool) -> TaskView {
    tokio::time::timeout(WAIT, async {
        loop {
            let view = app.status(task_id).await.expect("task exists");
            if pred(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached before timeout")
}
