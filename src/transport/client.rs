//! UNIX-socket JSON-lines client (used by bridges and in tests).
//!
//! Reconnects with bounded exponential backoff after an unexpected
//! close; an explicit [`UnixSocketClient::disconnect`] suppresses
//! reconnection.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
};

use super::protocol::{BridgeFrame, GatewayFrame};

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Client-side connection events.
#[derive(Debug)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    Message(GatewayFrame),
}

// ─── UnixSocketClient ─────────────────────────────────────────────────────────

pub struct UnixSocketClient {
    path: PathBuf,
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Read half parked here between `establish` and the read loop.
    pending_reader: Mutex<Option<OwnedReadHalf>>,
    connected: AtomicBool,
    should_reconnect: AtomicBool,
    events: mpsc::Sender<ClientEvent>,
}

impl UnixSocketClient {
    /// Connect to `path` and start the reconnect-capable read loop.
    pub async fn connect(
        path: impl AsRef<Path>,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ClientEvent>), String> {
        let (events_tx, events_rx) = mpsc::channel(256);
        let client = Arc::new(Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
            pending_reader: Mutex::new(None),
            connected: AtomicBool::new(false),
            should_reconnect: AtomicBool::new(true),
            events: events_tx,
        });

        // First connection is synchronous so the caller learns about a
        // bad socket path immediately.
        client.establish().await?;

        let loop_client = Arc::clone(&client);
        tokio::spawn(async move { loop_client.read_loop().await });

        Ok((client, events_rx))
    }

    async fn establish(&self) -> Result<(), String> {
        let stream = UnixStream::connect(&self.path)
            .await
            .map_err(|e| format!("failed to connect to {:?}: {e}", self.path))?;
        let (read_half, write_half) = stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.pending_reader.lock().await = Some(read_half);
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events.send(ClientEvent::Connected).await;
        Ok(())
    }

    async fn read_loop(self: Arc<Self>) {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            let read_half = { self.pending_reader.lock().await.take() };
            if let Some(read_half) = read_half {
                backoff = INITIAL_BACKOFF;
                let mut lines = BufReader::new(read_half).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if line.trim().is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<GatewayFrame>(&line) {
                                Ok(frame) => {
                                    let _ = self.events.send(ClientEvent::Message(frame)).await;
                                }
                                Err(e) => log::warn!("client: invalid frame: {e}"),
                            }
                        }
                        Ok(None) | Err(_) => break,
                    }
                }
                self.connected.store(false, Ordering::SeqCst);
                *self.writer.lock().await = None;
                let _ = self.events.send(ClientEvent::Disconnected).await;
            }

            if !self.should_reconnect.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            if self.establish().await.is_ok() {
                log::info!("client: reconnected to {:?}", self.path);
            }
        }
    }

    /// Send one frame.  Errors when disconnected.
    pub async fn send(&self, frame: &BridgeFrame) -> Result<(), String> {
        let mut line =
            serde_json::to_string(frame).map_err(|e| format!("frame serialise error: {e}"))?;
        line.push('\n');
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => w
                .write_all(line.as_bytes())
                .await
                .map_err(|e| format!("send error: {e}")),
            None => Err("not connected".to_string()),
        }
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Close and suppress reconnection.
    pub async fn disconnect(&self) {
        self.should_reconnect.store(false, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        *self.writer.lock().await = None;
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
