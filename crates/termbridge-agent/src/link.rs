//! Cloud link: the single duplex WebSocket channel to the termbridge
//! server. Reconnects with exponential backoff, registers on every open,
//! keeps the connection alive with pings, and exposes a non-blocking
//! bounded send queue that survives disconnection.

use crate::config::Config;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use libtermbridge::{system, BridgeError, Messenger};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use termbridge_protocol::{AgentEvent, SEND_QUEUE_CAPACITY};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// WebSocket-level keep-alive ping cadence.
const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Read deadline, refreshed by every inbound frame (pongs included).
const READ_DEADLINE: Duration = Duration::from_secs(40);
/// Upper bound on a single frame write.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_BACKOFF_SECS: u64 = 60;
const INBOUND_QUEUE_CAPACITY: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Error, Debug)]
enum LinkError {
    #[error("websocket dial failed: {0}")]
    Dial(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("write failed: {0}")]
    Send(String),
}

/// One inbound envelope: the extracted `type` discriminant plus the raw
/// JSON text for the dispatcher to decode fully.
#[derive(Debug, Clone)]
pub struct Frame {
    pub msg_type: String,
    pub raw: String,
}

/// Receiver ends handed to the supervisor: inbound frames for the
/// dispatcher, and a signal per successful open for the resync responder.
pub struct LinkChannels {
    pub inbound: mpsc::Receiver<Frame>,
    pub opened: mpsc::Receiver<()>,
}

pub struct CloudLink {
    url: String,
    user_agent: String,
    register_payload: String,
    send_tx: mpsc::Sender<String>,
    send_rx: StdMutex<Option<mpsc::Receiver<String>>>,
    inbound_tx: mpsc::Sender<Frame>,
    opened_tx: mpsc::Sender<()>,
    dropped: AtomicU64,
}

impl CloudLink {
    pub fn new(cfg: &Config, version: &str) -> (Arc<Self>, LinkChannels) {
        let register = AgentEvent::Register {
            machine_id: cfg.machine_id.clone(),
            name: cfg.machine_name.clone(),
            os: system::os_ident().to_string(),
            hostname: system::hostname(),
            version: version.to_string(),
        };
        let register_payload =
            serde_json::to_string(&register).expect("register message serialises");

        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (opened_tx, opened) = mpsc::channel(1);

        let link = Arc::new(Self {
            url: cfg.websocket_url(),
            user_agent: format!("termbridge-agent/{version}"),
            register_payload,
            send_tx,
            send_rx: StdMutex::new(Some(send_rx)),
            inbound_tx,
            opened_tx,
            dropped: AtomicU64::new(0),
        });
        (link, LinkChannels { inbound, opened })
    }

    /// Serialise and enqueue one message. Never blocks; a full queue drops
    /// the message with a warning. Safe to call from any context, whether
    /// or not the link is currently open.
    pub fn send_json<T: serde::Serialize>(&self, message: &T) -> libtermbridge::Result<()> {
        let data = serde_json::to_string(message).map_err(std::io::Error::other)?;
        match self.send_tx.try_send(data) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("send buffer full, dropping message");
                Err(BridgeError::SendBufferFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("link driver stopped, dropping message");
                Err(BridgeError::SendBufferFull)
            }
        }
    }

    /// Messages dropped because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drive the connection until cancelled. Delay before attempt n is
    /// `min(2^(n-1), 60)` seconds; the counter resets on every successful
    /// open.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut send_rx = self
            .send_rx
            .lock()
            .expect("send queue lock poisoned")
            .take()
            .expect("link driver started twice");

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let delay = backoff_delay(attempt);
            if attempt > 0 {
                info!(attempt, delay_secs = delay.as_secs(), "reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => break,
                }
            }

            let (opened, result) = self.connect_once(&mut send_rx, &cancel).await;
            match result {
                Ok(()) => attempt = 0,
                Err(err) => {
                    warn!(%err, attempt, "connection failed");
                    attempt = if opened { 1 } else { attempt.saturating_add(1) };
                }
            }
        }
        info!("cloud link stopped");
    }

    /// One connection lifetime: dial, register, then pump frames both ways
    /// until disconnect or cancellation. Returns whether the connection
    /// reached the open state.
    async fn connect_once(
        &self,
        send_rx: &mut mpsc::Receiver<String>,
        cancel: &CancellationToken,
    ) -> (bool, Result<(), LinkError>) {
        info!("connecting to cloud");
        let request = match self.client_request() {
            Ok(request) => request,
            Err(err) => return (false, Err(err)),
        };

        let ws = tokio::select! {
            res = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(request)) => match res {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(err)) => return (false, Err(LinkError::Dial(err.to_string()))),
                Err(_) => return (false, Err(LinkError::Dial("handshake timed out".to_string()))),
            },
            _ = cancel.cancelled() => return (false, Ok(())),
        };
        let (mut sink, mut stream) = ws.split();

        // Register must be the first application frame on every connection;
        // failure here counts as a failed attempt.
        if let Err(err) = send_frame(
            &mut sink,
            Message::Text(self.register_payload.clone().into()),
        )
        .await
        {
            return (false, Err(err));
        }
        info!("connected and registered");
        let _ = self.opened_tx.try_send(());

        let mut ping = tokio::time::interval_at(
            tokio::time::Instant::now() + PING_INTERVAL,
            PING_INTERVAL,
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.drain_and_close(&mut sink, send_rx).await;
                    return (true, Ok(()));
                }
                received = tokio::time::timeout(READ_DEADLINE, stream.next()) => match received {
                    Err(_) => {
                        return (true, Err(LinkError::Transport("read deadline exceeded".to_string())));
                    }
                    Ok(None) => {
                        info!("server closed the connection");
                        return (true, Ok(()));
                    }
                    Ok(Some(Err(err))) => {
                        return (true, Err(LinkError::Transport(err.to_string())));
                    }
                    Ok(Some(Ok(message))) => {
                        if !self.handle_message(message).await {
                            info!("server closed the connection");
                            return (true, Ok(()));
                        }
                    }
                },
                queued = send_rx.recv() => {
                    let Some(data) = queued else {
                        return (true, Ok(()));
                    };
                    if let Err(err) = send_frame(&mut sink, Message::Text(data.into())).await {
                        return (true, Err(err));
                    }
                }
                _ = ping.tick() => {
                    if let Err(err) = send_frame(&mut sink, Message::Ping(Vec::new().into())).await {
                        return (true, Err(err));
                    }
                }
            }
        }
    }

    /// Returns false when the server closed the connection.
    async fn handle_message(&self, message: Message) -> bool {
        match message {
            Message::Text(text) => {
                self.deliver(text.as_str()).await;
                true
            }
            Message::Close(_) => false,
            // Pings are answered by the library; pongs only refresh the
            // read deadline, which the timeout wrapper already did.
            _ => true,
        }
    }

    async fn deliver(&self, raw: &str) {
        #[derive(serde::Deserialize)]
        struct Envelope {
            #[serde(rename = "type")]
            msg_type: String,
        }
        let envelope: Envelope = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(%err, "malformed message from server");
                return;
            }
        };
        debug!(msg_type = %envelope.msg_type, "message received");
        let frame = Frame {
            msg_type: envelope.msg_type,
            raw: raw.to_string(),
        };
        if self.inbound_tx.send(frame).await.is_err() {
            warn!("inbound consumer gone, dropping message");
        }
    }

    /// Flush whatever is still queued, then say goodbye properly.
    async fn drain_and_close(&self, sink: &mut WsSink, send_rx: &mut mpsc::Receiver<String>) {
        while let Ok(data) = send_rx.try_recv() {
            if send_frame(sink, Message::Text(data.into())).await.is_err() {
                return;
            }
        }
        let close = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "agent shutdown".into(),
        }));
        let _ = tokio::time::timeout(WRITE_TIMEOUT, sink.send(close)).await;
    }

    fn client_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, LinkError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| LinkError::Dial(e.to_string()))?;
        let user_agent =
            HeaderValue::from_str(&self.user_agent).map_err(|e| LinkError::Dial(e.to_string()))?;
        request.headers_mut().insert(USER_AGENT, user_agent);
        Ok(request)
    }
}

impl Messenger for CloudLink {
    fn send_json(&self, payload: serde_json::Value) -> libtermbridge::Result<()> {
        CloudLink::send_json(self, &payload)
    }
}

async fn send_frame(sink: &mut WsSink, message: Message) -> Result<(), LinkError> {
    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(LinkError::Send(err.to_string())),
        Err(_) => Err(LinkError::Send("write timed out".to_string())),
    }
}

/// Delay before reconnect attempt n: 0, 1s, 2s, 4s, ... capped at 60s.
fn backoff_delay(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let secs = 1u64 << (attempt - 1).min(6);
    Duration::from_secs(secs.min(MAX_BACKOFF_SECS))
}
