use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use super::config::SyncClientConfig;
use crate::crdt::sync::{AuthMessage, ControlMessage, Message, SyncMessage, SyncProtocol};
use crate::crdt::{GraphDoc, REMOTE_ORIGIN};
use crate::error::{AgoraError, Result};
use crate::presence::{Awareness, AwarenessChange, AwarenessProvider};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Floor for the keep-alive and presence renewal periods.
const MIN_TICK: Duration = Duration::from_millis(10);

/// Connection lifecycle, observable through [`SyncClient::subscribe_state`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Notices from the server that are not document or presence data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// An update was refused and not persisted
    UpdateRejected { reason: String },
    /// The server refused a write for this connection's role
    PermissionDenied { reason: String },
}

/// WebSocket sync client for one document.
pub struct SyncClient {
    config: SyncClientConfig,
    doc: Arc<GraphDoc>,
    awareness: Arc<Awareness>,
    write_gate: Option<watch::Receiver<bool>>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ClientEvent>,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    task: Option<JoinHandle<()>>,
    doc_subscription: Option<yrs::Subscription>,
    awareness_observer: Option<u64>,
}

impl SyncClient {
    /// Create a disconnected client.
    ///
    /// Presence is marked unavailable until the first connection succeeds.
    pub fn new(config: SyncClientConfig, doc: Arc<GraphDoc>, awareness: Arc<Awareness>) -> Self {
        awareness.set_available(false);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(16);
        Self {
            config,
            doc,
            awareness,
            write_gate: None,
            state: Arc::new(state),
            events,
            outgoing: None,
            task: None,
            doc_subscription: None,
            awareness_observer: None,
        }
    }

    /// Only send local updates while `gate` holds `true` (e.g. an
    /// [`ArbiterHandle`](crate::presence::ArbiterHandle) subscription).
    pub fn with_write_gate(mut self, gate: watch::Receiver<bool>) -> Self {
        self.write_gate = Some(gate);
        self
    }

    pub fn doc(&self) -> &Arc<GraphDoc> {
        &self.doc
    }

    pub fn awareness(&self) -> &Arc<Awareness> {
        &self.awareness
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Whether a local update would be sent right now.
    pub fn can_send_updates(&self) -> bool {
        self.config.role.can_write() && self.write_gate.as_ref().is_none_or(|gate| *gate.borrow())
    }

    /// Connect and wait for the connected status.
    ///
    /// Gives up after the configured connect timeout, leaving the client in
    /// the `Error` state. Once connected, dropped connections are retried in
    /// the background.
    pub async fn connect(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let url = self.config.sync_url()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.install_observers(tx.clone())?;
        self.outgoing = Some(tx);

        let mut state_rx = self.state.subscribe();
        let task = ConnectionTask {
            url,
            config: self.config.clone(),
            doc: Arc::clone(&self.doc),
            awareness: Arc::clone(&self.awareness),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        };
        self.task = Some(tokio::spawn(task.run(rx)));

        let timeout = self.config.tuning.connect_timeout();
        let connected = tokio::time::timeout(
            timeout,
            state_rx.wait_for(|state| *state == ConnectionState::Connected),
        )
        .await;

        match connected {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => {
                self.teardown();
                Err(AgoraError::Transport("Connection task ended".to_string()))
            }
            Err(_) => {
                self.teardown();
                let ms = timeout.as_millis() as u64;
                self.state
                    .send_replace(ConnectionState::Error(format!("Timed out after {} ms", ms)));
                Err(AgoraError::ConnectTimeout(ms))
            }
        }
    }

    /// Close the connection and stop reconnecting.
    pub fn disconnect(&mut self) {
        self.teardown();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Ask the server for the complete document state.
    pub fn resync(&self) -> Result<()> {
        let frame = SyncProtocol::new(&self.doc).create_full_request();
        self.send_frame(frame)
    }

    /// Queue a raw frame for the server.
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let Some(outgoing) = &self.outgoing else {
            return Err(AgoraError::Transport("Not connected".to_string()));
        };
        outgoing
            .send(frame)
            .map_err(|_| AgoraError::Transport("Connection task has stopped".to_string()))
    }

    fn install_observers(&mut self, tx: mpsc::UnboundedSender<Vec<u8>>) -> Result<()> {
        let role_can_write = self.config.role.can_write();
        let gate = self.write_gate.clone();
        let updates_tx = tx.clone();
        let subscription = self.doc.observe_updates(move |origin, update| {
            if origin == REMOTE_ORIGIN || !role_can_write {
                return;
            }
            if gate.as_ref().is_some_and(|gate| !*gate.borrow()) {
                log::debug!("Holding back local update: another session is writing");
                return;
            }
            let frame = Message::Sync(SyncMessage::Update(update.to_vec())).encode();
            let _ = updates_tx.send(frame);
        })?;
        self.doc_subscription = Some(subscription);

        let awareness = Arc::downgrade(&self.awareness);
        let observer = self.awareness.observe(Arc::new(move |change: &AwarenessChange| {
            if change.remote || change.is_empty() {
                return;
            }
            let Some(awareness) = awareness.upgrade() else {
                return;
            };
            let touched: Vec<u64> = change.touched().collect();
            match awareness.encode_update(&touched) {
                Ok(update) => {
                    let _ = tx.send(Message::Awareness(update).encode());
                }
                Err(e) => log::warn!("Failed to encode awareness update: {}", e),
            }
        }));
        self.awareness_observer = Some(observer);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(observer) = self.awareness_observer.take() {
            self.awareness.unobserve(observer);
        }
        self.doc_subscription = None;
        self.outgoing = None;
        self.awareness.set_available(false);
        self.awareness.clear_remote_states();
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("doc_id", &self.config.doc_id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

enum SessionEnd {
    Closed,
    Failed(String),
    Shutdown,
}

/// Background connect/read/write loop.
struct ConnectionTask {
    url: Url,
    config: SyncClientConfig,
    doc: Arc<GraphDoc>,
    awareness: Arc<Awareness>,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<ClientEvent>,
}

impl ConnectionTask {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn run(self, mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>) {
        let mut attempt = 0u32;
        loop {
            self.set_state(ConnectionState::Connecting);
            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => {
                    log::info!("[Sync] Connected to {}", self.url);
                    attempt = 0;
                    self.awareness.set_available(true);
                    self.set_state(ConnectionState::Connected);

                    let end = self.session(ws, &mut outgoing).await;

                    self.awareness.set_available(false);
                    self.awareness.clear_remote_states();
                    match end {
                        SessionEnd::Closed => self.set_state(ConnectionState::Disconnected),
                        SessionEnd::Failed(reason) => self.set_state(ConnectionState::Error(reason)),
                        SessionEnd::Shutdown => {
                            self.set_state(ConnectionState::Disconnected);
                            return;
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[Sync] Connection to {} failed: {}", self.url, e);
                    self.set_state(ConnectionState::Error(e.to_string()));
                }
            }

            if attempt >= self.config.max_reconnect_attempts {
                log::warn!("[Sync] Giving up after {} reconnect attempts", attempt);
                self.set_state(ConnectionState::Error(format!(
                    "Gave up after {} reconnect attempts",
                    attempt
                )));
                return;
            }
            let delay = self.config.backoff_delay(attempt);
            attempt += 1;
            log::debug!("[Sync] Reconnecting in {:?} (attempt {})", delay, attempt);
            tokio::time::sleep(delay).await;
        }
    }

    async fn session(
        &self,
        ws: WsStream,
        outgoing: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws.split();

        // The relay bumped our clock when the last connection dropped
        let mut handshake = vec![SyncProtocol::new(&self.doc).create_sync_step1()];
        handshake.extend(self.renewed_presence());
        for frame in handshake {
            if let Err(e) = write.send(WsMessage::Binary(frame.into())).await {
                return SessionEnd::Failed(e.to_string());
            }
        }

        let ping_interval = self.config.ping_interval.max(MIN_TICK);
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        let presence_period = (self.config.tuning.presence_timeout() / 2).max(MIN_TICK);
        let mut presence =
            tokio::time::interval_at(Instant::now() + presence_period, presence_period);

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        if let Some(reply) = self.handle_frame(&data)
                            && let Err(e) = write.send(WsMessage::Binary(reply.into())).await
                        {
                            return SessionEnd::Failed(e.to_string());
                        }
                    }
                    Some(Ok(WsMessage::Text(text))) => self.handle_control(text.as_str()),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::info!("[Sync] Connection closed by server");
                        return SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("[Sync] WebSocket error: {}", e);
                        return SessionEnd::Failed(e.to_string());
                    }
                },
                frame = outgoing.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = write.send(WsMessage::Binary(frame.into())).await {
                            return SessionEnd::Failed(e.to_string());
                        }
                    }
                    None => {
                        let _ = write.close().await;
                        return SessionEnd::Shutdown;
                    }
                },
                _ = ping.tick() => {
                    if let Err(e) = write.send(WsMessage::Ping(Vec::new().into())).await {
                        return SessionEnd::Failed(e.to_string());
                    }
                }
                _ = presence.tick() => {
                    if let Some(frame) = self.renewed_presence()
                        && let Err(e) = write.send(WsMessage::Binary(frame.into())).await
                    {
                        return SessionEnd::Failed(e.to_string());
                    }
                    self.awareness
                        .remove_outdated(self.config.tuning.presence_timeout());
                }
            }
        }
    }

    /// Renew our presence and encode it, if we have any.
    fn renewed_presence(&self) -> Option<Vec<u8>> {
        self.awareness.renew_local_state()?;
        match self.awareness.encode_update(&[self.awareness.client_id()]) {
            Ok(update) => Some(Message::Awareness(update).encode()),
            Err(e) => {
                log::warn!("[Sync] Failed to encode awareness: {}", e);
                None
            }
        }
    }

    /// Apply one binary frame, returning a reply if the protocol needs one.
    fn handle_frame(&self, data: &[u8]) -> Option<Vec<u8>> {
        match Message::decode(data) {
            Ok(Some(Message::Sync(_))) => match SyncProtocol::new(&self.doc).handle_message(data) {
                Ok(reply) => reply,
                Err(e) => {
                    log::warn!("[Sync] Bad sync frame: {}", e);
                    None
                }
            },
            Ok(Some(Message::Awareness(update))) => {
                if let Err(e) = self.awareness.apply_update(&update) {
                    log::warn!("[Sync] Bad awareness frame: {}", e);
                }
                None
            }
            Ok(Some(Message::QueryAwareness)) => match self.awareness.encode_full_update() {
                Ok(update) => Some(Message::Awareness(update).encode()),
                Err(e) => {
                    log::warn!("[Sync] Failed to encode awareness: {}", e);
                    None
                }
            },
            Ok(Some(Message::Auth(AuthMessage::PermissionDenied { reason }))) => {
                log::warn!("[Sync] Permission denied: {}", reason);
                let _ = self.events.send(ClientEvent::PermissionDenied { reason });
                None
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("[Sync] Undecodable frame ({} bytes): {}", data.len(), e);
                None
            }
        }
    }

    fn handle_control(&self, text: &str) {
        match ControlMessage::parse(text) {
            Ok(ControlMessage::UpdateRejected { reason }) => {
                log::warn!("[Sync] Server rejected an update: {}", reason);
                let _ = self.events.send(ClientEvent::UpdateRejected { reason });
            }
            Ok(ControlMessage::Unknown) => {}
            Err(e) => log::debug!("[Sync] Ignoring text frame: {}", e),
        }
    }
}
