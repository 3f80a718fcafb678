//! UNIX-socket JSON-lines server.
//!
//! Accepts multiple concurrent bridge clients, assigns each an opaque
//! client id, and surfaces inbound frames plus connect/disconnect events
//! on one mpsc channel.  Outbound frames go through a bounded per-client
//! buffer: on overflow the oldest non-critical frame is dropped, and if
//! every buffered frame is critical the client is disconnected instead.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{UnixListener, UnixStream},
    sync::{Notify, mpsc},
};

use super::protocol::{BridgeFrame, GatewayFrame};

/// Opaque id for one connected bridge client.
pub type ClientId = u64;

/// Server-side connection events.
#[derive(Debug)]
pub enum ServerEvent {
    Connection(ClientId),
    Disconnection(ClientId),
    Message {
        client_id: ClientId,
        frame: BridgeFrame,
    },
}

// ─── Outbound buffering ───────────────────────────────────────────────────────

pub(crate) enum EnqueueOutcome {
    Queued,
    DroppedNonCritical,
    MustDisconnect,
}

/// Push `frame`, enforcing the bounded-buffer policy.
pub(crate) fn enqueue(
    buffer: &mut VecDeque<GatewayFrame>,
    capacity: usize,
    frame: GatewayFrame,
) -> EnqueueOutcome {
    if buffer.len() < capacity {
        buffer.push_back(frame);
        return EnqueueOutcome::Queued;
    }
    // Full: sacrifice the oldest non-critical frame.
    if let Some(pos) = buffer.iter().position(|f| !f.is_critical()) {
        buffer.remove(pos);
        buffer.push_back(frame);
        return EnqueueOutcome::DroppedNonCritical;
    }
    // Everything buffered is critical; losing any frame is worse than
    // losing the client.
    EnqueueOutcome::MustDisconnect
}

struct ClientHandle {
    buffer: Arc<Mutex<VecDeque<GatewayFrame>>>,
    notify: Arc<Notify>,
    /// Setting this true makes the writer task exit.
    closed: Arc<Mutex<bool>>,
}

// ─── UnixSocketServer ─────────────────────────────────────────────────────────

pub struct UnixSocketServer {
    path: PathBuf,
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
    next_client: AtomicU64,
    send_buffer: usize,
    events: mpsc::Sender<ServerEvent>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UnixSocketServer {
    /// Bind the socket (removing a stale file), start accepting, and
    /// return the server plus its event stream.
    pub async fn start(
        path: impl AsRef<Path>,
        send_buffer: usize,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ServerEvent>), String> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| format!("failed to remove stale socket {path:?}: {e}"))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create socket dir: {e}"))?;
        }

        let listener = UnixListener::bind(&path)
            .map_err(|e| format!("failed to bind socket {path:?}: {e}"))?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let server = Arc::new(Self {
            path,
            clients: Mutex::new(HashMap::new()),
            next_client: AtomicU64::new(1),
            send_buffer,
            events: events_tx,
            accept_task: Mutex::new(None),
        });

        let accept_server = Arc::clone(&server);
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => accept_server.attach_client(stream).await,
                    Err(e) => {
                        log::warn!("transport: accept error: {e}");
                        break;
                    }
                }
            }
        });
        *server.accept_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);

        log::info!("transport: listening on {:?}", server.path);
        Ok((server, events_rx))
    }

    async fn attach_client(self: &Arc<Self>, stream: UnixStream) {
        let client_id = self.next_client.fetch_add(1, Ordering::SeqCst);
        let (read_half, mut write_half) = stream.into_split();

        let handle = ClientHandle {
            buffer: Arc::new(Mutex::new(VecDeque::new())),
            notify: Arc::new(Notify::new()),
            closed: Arc::new(Mutex::new(false)),
        };
        let buffer = Arc::clone(&handle.buffer);
        let notify = Arc::clone(&handle.notify);
        let closed = Arc::clone(&handle.closed);
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(client_id, handle);

        let _ = self.events.send(ServerEvent::Connection(client_id)).await;
        log::info!("transport: client {client_id} connected");

        // Writer task: drain the bounded buffer onto the socket.
        tokio::spawn(async move {
            loop {
                let frame = {
                    let mut guard = buffer.lock().unwrap_or_else(|e| e.into_inner());
                    guard.pop_front()
                };
                match frame {
                    Some(frame) => {
                        let mut line = match serde_json::to_string(&frame) {
                            Ok(s) => s,
                            Err(e) => {
                                log::error!("transport: frame serialise error: {e}");
                                continue;
                            }
                        };
                        line.push('\n');
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        if *closed.lock().unwrap_or_else(|e| e.into_inner()) {
                            break;
                        }
                        notify.notified().await;
                    }
                }
            }
        });

        // Reader task: one JSON frame per line.
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<BridgeFrame>(&line) {
                            Ok(frame) => {
                                let _ = server
                                    .events
                                    .send(ServerEvent::Message { client_id, frame })
                                    .await;
                            }
                            Err(e) => {
                                log::warn!(
                                    "transport: client {client_id} sent invalid frame: {e}"
                                );
                            }
                        }
                    }
                    // EOF or a non-UTF-8 byte stream both end the connection.
                    Ok(None) | Err(_) => break,
                }
            }
            server.drop_client(client_id).await;
        });
    }

    async fn drop_client(&self, client_id: ClientId) {
        let removed = self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&client_id);
        if let Some(handle) = removed {
            *handle.closed.lock().unwrap_or_else(|e| e.into_inner()) = true;
            handle.notify.notify_one();
            let _ = self.events.send(ServerEvent::Disconnection(client_id)).await;
            log::info!("transport: client {client_id} disconnected");
        }
    }

    /// Queue a frame for one client.
    pub async fn send(&self, client_id: ClientId, frame: GatewayFrame) -> Result<(), String> {
        let outcome = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            let handle = clients
                .get(&client_id)
                .ok_or_else(|| format!("unknown client {client_id}"))?;
            let outcome = enqueue(
                &mut handle.buffer.lock().unwrap_or_else(|e| e.into_inner()),
                self.send_buffer,
                frame,
            );
            handle.notify.notify_one();
            outcome
        };
        match outcome {
            EnqueueOutcome::Queued => Ok(()),
            EnqueueOutcome::DroppedNonCritical => {
                log::warn!("transport: client {client_id} backpressure, dropped a notification");
                Ok(())
            }
            EnqueueOutcome::MustDisconnect => {
                log::warn!("transport: client {client_id} cannot keep up, disconnecting");
                self.drop_client(client_id).await;
                Err(format!("client {client_id} disconnected under backpressure"))
            }
        }
    }

    /// Queue a frame for every connected client.
    pub async fn broadcast(&self, frame: GatewayFrame) {
        let ids: Vec<ClientId> = self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        for id in ids {
            let _ = self.send(id, frame.clone()).await;
        }
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop accepting and remove the socket file.
    pub async fn stop(&self) {
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        let ids: Vec<ClientId> = self
            .clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        for id in ids {
            self.drop_client(id).await;
        }
        let _ = std::fs::remove_file(&self.path);
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
