//! OneBot 11 WebSocket transport (§4.1, §6).
//!
//! Grounded on the `serve`/accept-loop/`BridgeHandle` shape in
//! `examples/G-structure-rat_attack/src/lib.rs`: one accept loop spawned
//! off a `TcpListener`, a `oneshot` shutdown signal, and a dedicated
//! per-connection read loop built on `accept_async`/`WebSocketStream`.
//! That reference answers ACP JSON-RPC requests from the WS peer; this
//! transport instead speaks OneBot's event/API-call dialect: inbound
//! `message` events are handed to the dispatcher over a channel, and
//! outbound API calls are correlated to their `status` reply by an
//! auto-incrementing `echo` id.
//!
//! Per the Non-goals (no multiplexing of multiple transport clients), only
//! one peer is serviced at a time; a new connection simply replaces
//! whichever sink is currently registered.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{info, warn};

use crate::converter::ReplyPart;
use crate::onebot::{self, InboundFrame, MessageEvent};

#[derive(Clone, Debug)]
pub struct TransportConfig {
    pub bind_addr: SocketAddr,
    pub api_call_timeout: Duration,
}

#[derive(Debug)]
pub enum TransportError {
    /// No client is currently connected (bot id unknown or sink absent).
    NotConnected,
    /// The peer never acknowledged the API call within the timeout.
    Timeout,
    WebSocket(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::NotConnected => write!(f, "no transport client connected"),
            TransportError::Timeout => write!(f, "api call timed out waiting for peer ack"),
            TransportError::WebSocket(msg) => write!(f, "websocket error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

struct ClientLink {
    sink: Mutex<WsSink>,
}

struct OutboundState {
    next_echo: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

/// The OneBot transport's shared, cloneable handle: the dispatcher and
/// prompt runner hold an `Arc<Transport>` to send replies and issue API
/// calls without caring which physical connection is currently live.
pub struct Transport {
    bot_id: AtomicI64,
    client: Mutex<Option<Arc<ClientLink>>>,
    outbound: OutboundState,
    api_call_timeout: Duration,
}

/// Handle returned by [`Transport::serve`]; dropping or calling
/// [`TransportHandle::shutdown`] stops the accept loop.
pub struct TransportHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

/// Notifications the transport raises for the bridge to react to, distinct
/// from ordinary inbound chat messages.
pub enum TransportEvent {
    Message(MessageEvent),
    /// The single peer connection dropped; agent connections should be torn
    /// down (§4.1 Failure).
    PeerDisconnected,
}

const BOT_ID_UNSET: i64 = i64::MIN;

impl Transport {
    fn new(api_call_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            bot_id: AtomicI64::new(BOT_ID_UNSET),
            client: Mutex::new(None),
            outbound: OutboundState {
                next_echo: AtomicU64::new(1),
                pending: Mutex::new(HashMap::new()),
            },
            api_call_timeout,
        })
    }

    /// Binds `config.bind_addr` and starts the accept loop. Returns the
    /// transport handle, the shared [`Transport`] for sending replies, and
    /// a channel of [`TransportEvent`]s for the bridge's dispatch loop.
    pub async fn serve(
        config: TransportConfig,
    ) -> std::io::Result<(TransportHandle, Arc<Transport>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let transport = Transport::new(config.api_call_timeout);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let join_handle = spawn_accept_loop(listener, shutdown_rx, transport.clone(), event_tx);

        Ok((
            TransportHandle {
                local_addr,
                shutdown: Some(shutdown_tx),
                join_handle: Some(join_handle),
            },
            transport,
            event_rx,
        ))
    }

    /// The bot's own QQ id, learned from the lifecycle-connect meta event;
    /// `None` until the peer has sent one.
    pub fn bot_id(&self) -> Option<i64> {
        match self.bot_id.load(Ordering::SeqCst) {
            BOT_ID_UNSET => None,
            id => Some(id),
        }
    }

    /// Sends a single text segment to `chat_id`.
    pub async fn send_text(&self, chat_id: &str, text: &str) -> Result<(), TransportError> {
        self.send_content(chat_id, &[ReplyPart::Text(text.to_string())]).await
    }

    /// Sends ordered reply parts to `chat_id` as `send_private_msg` or
    /// `send_group_msg`, waiting for the peer's acknowledgement (bounded
    /// by `api_call_timeout`).
    pub async fn send_content(&self, chat_id: &str, parts: &[ReplyPart]) -> Result<(), TransportError> {
        if self.bot_id().is_none() {
            warn!(chat_id, "dropping reply: bot id not yet known from lifecycle connect");
            return Err(TransportError::NotConnected);
        }

        let (action, params) = action_for_chat(chat_id, parts)?;
        self.call_api(&action, params).await.map(|_| ())
    }

    /// Issues an outbound OneBot API call and awaits its correlated reply.
    async fn call_api(&self, action: &str, params: Value) -> Result<Value, TransportError> {
        let client = self.client.lock().await.clone().ok_or(TransportError::NotConnected)?;

        let echo = self.outbound.next_echo.fetch_add(1, Ordering::SeqCst).to_string();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outbound.pending.lock().await.insert(echo.clone(), reply_tx);

        let envelope = onebot::build_api_call(action, params, &echo);
        let text = serde_json::to_string(&envelope).expect("api call envelope always serializes");

        {
            let mut sink = client.sink.lock().await;
            if let Err(err) = sink.send(Message::Text(text)).await {
                self.outbound.pending.lock().await.remove(&echo);
                return Err(TransportError::WebSocket(err.to_string()));
            }
        }

        match tokio::time::timeout(self.api_call_timeout, reply_rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(TransportError::NotConnected),
            Err(_) => {
                self.outbound.pending.lock().await.remove(&echo);
                Err(TransportError::Timeout)
            }
        }
    }

    /// Fails every pending outbound call (peer went away) so callers awaiting
    /// `send_text`/`send_content` don't hang forever.
    async fn fail_all_pending(&self) {
        let mut pending = self.outbound.pending.lock().await;
        pending.clear();
    }
}

fn action_for_chat(chat_id: &str, parts: &[ReplyPart]) -> Result<(String, Value), TransportError> {
    let segments = crate::converter::reply_parts_to_onebot(parts);
    let (kind, id) = chat_id.split_once(':').ok_or(TransportError::NotConnected)?;
    let id: i64 = id.parse().map_err(|_| TransportError::NotConnected)?;
    match kind {
        "private" => Ok((
            "send_private_msg".to_string(),
            serde_json::json!({"user_id": id, "message": segments}),
        )),
        "group" => Ok((
            "send_group_msg".to_string(),
            serde_json::json!({"group_id": id, "message": segments}),
        )),
        _ => Err(TransportError::NotConnected),
    }
}

fn spawn_accept_loop(
    listener: TcpListener,
    mut shutdown_rx: oneshot::Receiver<()>,
    transport: Arc<Transport>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accept_result = listener.accept() => {
                    let (stream, peer_addr) = match accept_result {
                        Ok(pair) => pair,
                        Err(err) => {
                            warn!(error = %err, "failed to accept transport connection");
                            continue;
                        }
                    };
                    let transport = transport.clone();
                    let event_tx = event_tx.clone();
                    tokio::spawn(async move {
                        info!(%peer_addr, "transport client connected");
                        let (link, result) =
                            handle_client(stream, transport.clone(), event_tx.clone()).await;
                        if let Err(err) = result {
                            warn!(%peer_addr, error = %err, "transport connection closed with error");
                        }

                        // A newer connection may have already replaced this one in
                        // `transport.client` by the time this read loop ends (e.g. a
                        // stale socket closing after a reconnect); only tear down
                        // state and raise `PeerDisconnected` if this was still the
                        // registered client, so a stale connection's teardown can't
                        // clobber a live one.
                        let mut current = transport.client.lock().await;
                        let is_current = link
                            .as_ref()
                            .is_some_and(|l| current.as_ref().is_some_and(|c| Arc::ptr_eq(l, c)));
                        if is_current {
                            *current = None;
                        }
                        drop(current);
                        if is_current {
                            transport.fail_all_pending().await;
                            let _ = event_tx.send(TransportEvent::PeerDisconnected);
                        }
                    });
                }
            }
        }
    })
}

/// Drives one WebSocket connection's read loop. Returns the [`ClientLink`]
/// it registered (`None` if the handshake itself failed, before any link
/// existed) alongside the loop's outcome, so the caller can tell whether
/// this connection is still the one registered in `transport.client`
/// before tearing anything down.
async fn handle_client(
    stream: TcpStream,
    transport: Arc<Transport>,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
) -> (Option<Arc<ClientLink>>, Result<(), tokio_tungstenite::tungstenite::Error>) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(err) => return (None, Err(err)),
    };
    let (sink, mut source) = ws_stream.split();
    let link = Arc::new(ClientLink { sink: Mutex::new(sink) });
    *transport.client.lock().await = Some(link.clone());

    loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => return (Some(link), Err(err)),
            None => break,
        };
        match message {
            Message::Text(text) => route_inbound(&transport, &event_tx, &text).await,
            Message::Binary(bytes) => {
                if let Ok(text) = String::from_utf8(bytes) {
                    route_inbound(&transport, &event_tx, &text).await;
                }
            }
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
            Message::Frame(_) => {}
        }
    }
    (Some(link), Ok(()))
}

async fn route_inbound(
    transport: &Arc<Transport>,
    event_tx: &mpsc::UnboundedSender<TransportEvent>,
    raw: &str,
) {
    match onebot::parse_inbound(raw) {
        InboundFrame::LifecycleConnect { self_id } => {
            info!(self_id, "learned bot id from lifecycle connect");
            transport.bot_id.store(self_id, Ordering::SeqCst);
        }
        InboundFrame::Message(event) => {
            // `@bot` resolution needs `bot_id`, which only the transport
            // tracks; the conversion to `ParsedMessage` happens downstream
            // once the event reaches the dispatcher, alongside `bot_id()`.
            let _ = event_tx.send(TransportEvent::Message(event));
        }
        InboundFrame::ApiResult { echo, payload } => {
            if let Some(tx) = transport.outbound.pending.lock().await.remove(&echo) {
                let _ = tx.send(payload);
            } else {
                warn!(echo, "api result for unknown or already-resolved echo");
            }
        }
        InboundFrame::Ignored => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_for_private_chat() {
        let (action, params) =
            action_for_chat("private:111", &[ReplyPart::Text("hi".into())]).unwrap();
        assert_eq!(action, "send_private_msg");
        assert_eq!(params["user_id"], 111);
    }

    #[test]
    fn action_for_group_chat() {
        let (action, params) =
            action_for_chat("group:222", &[ReplyPart::Text("hi".into())]).unwrap();
        assert_eq!(action, "send_group_msg");
        assert_eq!(params["group_id"], 222);
    }

    #[test]
    fn malformed_chat_id_is_rejected() {
        assert!(action_for_chat("weird", &[]).is_err());
    }
}
