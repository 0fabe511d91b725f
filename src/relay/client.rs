//! Relay client
//!
//! Used by peers that cannot reach each other directly. Connects to the
//! relay over WebSocket, authenticates with a signed token and exposes the
//! pairing and data requests. Events from the relay arrive on a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::error::{RelayError, RelayResult};
use crate::relay::protocol::{RelayAuth, RelayEvent, RelayRequest};

// Client constants (avoiding magic numbers)
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 10;
const CLOSE_TIMEOUT_SECS: u64 = 1;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(CLOSE_TIMEOUT_SECS);

/// Default interval between heartbeats, well inside the server's timeout
pub const DEFAULT_RELAY_HEARTBEAT: Duration = Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS);

/// Connection to a relay server
pub struct RelayClient {
    peer_id: String,
    outbound: mpsc::UnboundedSender<Message>,
    events: Mutex<Option<mpsc::UnboundedReceiver<RelayEvent>>>,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RelayClient {
    /// Connects and authenticates, sending heartbeats at the default interval
    pub async fn connect(url: &str, peer_id: &str, secret: &str) -> RelayResult<Self> {
        Self::connect_with(url, peer_id, secret, Some(DEFAULT_RELAY_HEARTBEAT)).await
    }

    /// Connects and authenticates; `heartbeat: None` disables keepalives
    pub async fn connect_with(
        url: &str,
        peer_id: &str,
        secret: &str,
        heartbeat: Option<Duration>,
    ) -> RelayResult<Self> {
        let (ws, _response) = connect_async(url).await?;
        let (mut write, mut read) = ws.split();

        let auth = RelayAuth::signed(peer_id, secret).encode()?;
        write.send(Message::Text(auth)).await?;
        info!("Connected to relay {} as {}", url, peer_id);

        let connected = Arc::new(AtomicBool::new(true));
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = write.send(message).await {
                    debug!("Relay write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        }));

        let reader_connected = connected.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match RelayEvent::decode(&text) {
                        Ok(event) => {
                            let _ = event_tx.send(event);
                        }
                        Err(e) => warn!("Invalid relay event: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        match frame {
                            Some(frame) if frame.code == CloseCode::Policy => {
                                error!("Relay rejected the session: {}", frame.reason)
                            }
                            Some(frame) => info!("Relay closed the session: {}", frame.reason),
                            None => info!("Relay closed the session"),
                        }
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Relay connection error: {}", e);
                        break;
                    }
                }
            }
            reader_connected.store(false, Ordering::SeqCst);
        }));

        if let Some(interval) = heartbeat {
            let heartbeat_tx = outbound_tx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
                loop {
                    ticker.tick().await;
                    let Ok(text) = (RelayRequest::Heartbeat { timestamp: None }).encode() else {
                        break;
                    };
                    if heartbeat_tx.send(Message::Text(text)).is_err() {
                        break;
                    }
                }
            }));
        }

        Ok(Self {
            peer_id: peer_id.to_string(),
            outbound: outbound_tx,
            events: Mutex::new(Some(event_rx)),
            connected,
            tasks,
        })
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// False once the relay closed the connection
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Takes the event receiver; only the first call gets it
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<RelayEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    /// Asks the relay to pair with `target_id`
    pub fn connect_peer(&self, target_id: &str) -> RelayResult<()> {
        self.request(&RelayRequest::Connect {
            target_id: target_id.to_string(),
        })
    }

    /// Undoes a pairing
    pub fn disconnect_peer(&self, target_id: &str) -> RelayResult<()> {
        self.request(&RelayRequest::Disconnect {
            target_id: target_id.to_string(),
        })
    }

    /// Sends an opaque payload to a paired peer
    pub fn send_data(&self, target_id: &str, data: Value) -> RelayResult<()> {
        self.request(&RelayRequest::Data {
            target_id: target_id.to_string(),
            data,
        })
    }

    /// Sends one heartbeat immediately
    pub fn heartbeat(&self) -> RelayResult<()> {
        self.request(&RelayRequest::Heartbeat { timestamp: None })
    }

    fn request(&self, request: &RelayRequest) -> RelayResult<()> {
        if !self.is_connected() {
            return Err(RelayError::Closed);
        }
        let text = request.encode()?;
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| RelayError::Closed)
    }

    /// Closes the WebSocket and stops background tasks
    pub async fn close(mut self) {
        let _ = self.outbound.send(Message::Close(None));
        self.connected.store(false, Ordering::SeqCst);

        // Writer and reader finish on their own once the close handshake ends
        let mut tasks = std::mem::take(&mut self.tasks).into_iter();
        for task in tasks.by_ref().take(2) {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                debug!("Relay client task for {} did not stop in time", self.peer_id);
                abort.abort();
            }
        }
        for task in tasks {
            task.abort();
        }
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
