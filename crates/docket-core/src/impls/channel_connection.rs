//! ClientConnection over a tokio mpsc channel.
//!
//! The receiving half stands in for the socket: the CLI prints from it,
//! tests assert on it, and dropping it closes the connection.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::domain::ProgressMessage;
use crate::error::ConnectionClosed;
use crate::ports::ClientConnection;

#[derive(Debug, Clone)]
pub struct ChannelConnection {
    tx: mpsc::Sender<ProgressMessage>,
}

impl ChannelConnection {
    pub fn pair(buffer: usize) -> (Self, mpsc::Receiver<ProgressMessage>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ClientConnection for ChannelConnection {
    async fn send(&self, message: &ProgressMessage) -> Result<(), ConnectionClosed> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| ConnectionClosed)
    }

    async fn closed(&self) {
        self.tx.closed().await
    }
}
