//! Interactive participants.
//!
//! A peer is split in two halves: [`Peer`], the room-owned handle carrying
//! the signaling state machine and the ledgers of engine objects, and
//! [`PeerSession`], the WebSocket actor that owns the wire connection.
//! The actor talks to the handle through an actix [`Recipient`], so engine
//! callbacks running on other threads can notify or request the client
//! without touching the connection directly.

use crate::error::SignalingError;
use crate::protocol::{
    self, ClientMessage, ClientRequest, PeerInfo, SctpCapabilities, ServerNotification,
    ServerRequest, TransportAppData, TransportDirection,
};
use crate::room::Room;
use actix::{Actor, ActorContext, AsyncContext, Handler, Recipient, StreamHandler};
use actix_web_actors::ws;
use async_io::Timer;
use event_listener_primitives::{BagOnce, HandlerId};
use futures_lite::future;
use log::{debug, info, warn};
use mediasoup::prelude::*;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// A peer must send `join` within this long after attaching, otherwise the
/// session is closed.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a room-initiated request may stay unacknowledged.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Opaque peer identifier, scoped to its room. Supplied by the client in the
/// connection URL.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl PeerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Commands delivered to the WebSocket session actor.
#[derive(actix::Message)]
#[rtype(result = "()")]
pub enum SessionCommand {
    /// Send a fire-and-forget notification to the client.
    Notify(ServerNotification),
    /// Send a request to the client; the responder is fulfilled with the
    /// client's acknowledgement (or an error).
    Request {
        id: u32,
        request: ServerRequest,
        responder: async_oneshot::Sender<Result<Value, SignalingError>>,
    },
    /// Forget an in-flight request (the caller gave up on the ack); a late
    /// response for this id is ignored.
    AbortRequest { id: u32 },
    /// Answer a client request previously dispatched to the room.
    Respond {
        id: u32,
        result: Result<Value, SignalingError>,
    },
    /// Close the wire connection.
    Close,
}

struct Shared {
    display_name: String,
    device: Value,
    rtp_capabilities: Option<RtpCapabilities>,
    sctp_capabilities: Option<SctpCapabilities>,
    transports: HashMap<TransportId, WebRtcTransport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
    data_producers: HashMap<DataProducerId, DataProducer>,
    data_consumers: HashMap<DataConsumerId, DataConsumer>,
    // Engine event subscriptions that must not outlive this peer.
    attached_handlers: Vec<HandlerId>,
}

#[derive(Default)]
struct Handlers {
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: PeerId,
    remote_addr: String,
    session: Recipient<SessionCommand>,
    joined: AtomicBool,
    closed: AtomicBool,
    next_request_id: AtomicU32,
    shared: Mutex<Shared>,
    handlers: Handlers,
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("peer {} closed", self.id);

            {
                let mut shared = self.shared.lock();
                // Dropping the engine objects closes them; downstream
                // cleanup runs through their close observers.
                shared.consumers.clear();
                shared.data_consumers.clear();
                shared.producers.clear();
                shared.data_producers.clear();
                shared.transports.clear();
                shared.attached_handlers.clear();
            }

            self.handlers.close.call_simple();
            let _ = self.session.do_send(SessionCommand::Close);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Room-owned handle to an interactive participant.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<Inner>,
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("joined", &self.inner.joined)
            .field("closed", &self.inner.closed)
            .finish()
    }
}

impl Peer {
    pub fn new(id: PeerId, remote_addr: String, session: Recipient<SessionCommand>) -> Self {
        debug!("new peer {id} [address:{remote_addr}]");

        Self {
            inner: Arc::new(Inner {
                id,
                remote_addr,
                session,
                joined: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                next_request_id: AtomicU32::new(0),
                shared: Mutex::new(Shared {
                    display_name: String::new(),
                    device: Value::Null,
                    rtp_capabilities: None,
                    sctp_capabilities: None,
                    transports: HashMap::new(),
                    producers: HashMap::new(),
                    consumers: HashMap::new(),
                    data_producers: HashMap::new(),
                    data_consumers: HashMap::new(),
                    attached_handlers: Vec::new(),
                }),
                handlers: Handlers::default(),
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    pub fn joined(&self) -> bool {
        self.inner.joined.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Promote the peer to joined, storing its descriptor and declared
    /// receive capabilities.
    pub fn set_joined(
        &self,
        display_name: String,
        device: Value,
        rtp_capabilities: Option<RtpCapabilities>,
        sctp_capabilities: Option<SctpCapabilities>,
    ) {
        let mut shared = self.inner.shared.lock();
        shared.display_name = display_name;
        shared.device = device;
        shared.rtp_capabilities = rtp_capabilities;
        shared.sctp_capabilities = sctp_capabilities;
        drop(shared);

        self.inner.joined.store(true, Ordering::SeqCst);
    }

    pub fn display_name(&self) -> String {
        self.inner.shared.lock().display_name.clone()
    }

    /// Replace the display name, returning the previous one.
    pub fn set_display_name(&self, display_name: String) -> String {
        std::mem::replace(&mut self.inner.shared.lock().display_name, display_name)
    }

    pub fn rtp_capabilities(&self) -> Option<RtpCapabilities> {
        self.inner.shared.lock().rtp_capabilities.clone()
    }

    pub fn sctp_capabilities(&self) -> Option<SctpCapabilities> {
        self.inner.shared.lock().sctp_capabilities
    }

    pub fn info(&self) -> PeerInfo {
        let shared = self.inner.shared.lock();

        PeerInfo {
            id: self.inner.id.clone(),
            display_name: shared.display_name.clone(),
            device: shared.device.clone(),
        }
    }

    pub fn add_transport(&self, transport: WebRtcTransport) {
        self.inner
            .shared
            .lock()
            .transports
            .insert(transport.id(), transport);
    }

    pub fn transport(&self, transport_id: &TransportId) -> Option<WebRtcTransport> {
        self.inner.shared.lock().transports.get(transport_id).cloned()
    }

    /// The transport media is consumed through, if the client created one
    /// already.
    pub fn recv_transport(&self) -> Option<WebRtcTransport> {
        self.inner
            .shared
            .lock()
            .transports
            .values()
            .find(|transport| {
                transport
                    .app_data()
                    .downcast_ref::<TransportAppData>()
                    .map(|app_data| app_data.direction == TransportDirection::Recv)
                    .unwrap_or(false)
            })
            .cloned()
    }

    pub fn add_producer(&self, producer: Producer) {
        self.inner
            .shared
            .lock()
            .producers
            .insert(producer.id(), producer);
    }

    pub fn producer(&self, producer_id: &ProducerId) -> Option<Producer> {
        self.inner.shared.lock().producers.get(producer_id).cloned()
    }

    pub fn remove_producer(&self, producer_id: &ProducerId) -> Option<Producer> {
        self.inner.shared.lock().producers.remove(producer_id)
    }

    pub fn producers(&self) -> Vec<Producer> {
        self.inner.shared.lock().producers.values().cloned().collect()
    }

    pub fn add_consumer(&self, consumer: Consumer) {
        self.inner
            .shared
            .lock()
            .consumers
            .insert(consumer.id(), consumer);
    }

    pub fn consumer(&self, consumer_id: &ConsumerId) -> Option<Consumer> {
        self.inner.shared.lock().consumers.get(consumer_id).cloned()
    }

    pub fn remove_consumer(&self, consumer_id: &ConsumerId) -> Option<Consumer> {
        self.inner.shared.lock().consumers.remove(consumer_id)
    }

    pub fn add_data_producer(&self, data_producer: DataProducer) {
        self.inner
            .shared
            .lock()
            .data_producers
            .insert(data_producer.id(), data_producer);
    }

    pub fn data_producer(&self, data_producer_id: &DataProducerId) -> Option<DataProducer> {
        self.inner
            .shared
            .lock()
            .data_producers
            .get(data_producer_id)
            .cloned()
    }

    pub fn remove_data_producer(
        &self,
        data_producer_id: &DataProducerId,
    ) -> Option<DataProducer> {
        self.inner
            .shared
            .lock()
            .data_producers
            .remove(data_producer_id)
    }

    pub fn data_producers(&self) -> Vec<DataProducer> {
        self.inner
            .shared
            .lock()
            .data_producers
            .values()
            .cloned()
            .collect()
    }

    pub fn add_data_consumer(&self, data_consumer: DataConsumer) {
        self.inner
            .shared
            .lock()
            .data_consumers
            .insert(data_consumer.id(), data_consumer);
    }

    pub fn data_consumer(&self, data_consumer_id: &DataConsumerId) -> Option<DataConsumer> {
        self.inner
            .shared
            .lock()
            .data_consumers
            .get(data_consumer_id)
            .cloned()
    }

    pub fn remove_data_consumer(
        &self,
        data_consumer_id: &DataConsumerId,
    ) -> Option<DataConsumer> {
        self.inner
            .shared
            .lock()
            .data_consumers
            .remove(data_consumer_id)
    }

    /// Keep an engine event subscription alive for as long as this peer.
    pub fn keep_handler(&self, handler_id: HandlerId) {
        self.inner.shared.lock().attached_handlers.push(handler_id);
    }

    /// Send a fire-and-forget notification. Errors are never surfaced to the
    /// peer; a dead session simply drops the message.
    pub fn notify(&self, notification: ServerNotification) {
        let _ = self.inner.session.do_send(SessionCommand::Notify(notification));
    }

    /// Send a request to the client and await its acknowledgement.
    pub async fn request(&self, request: ServerRequest) -> Result<Value, SignalingError> {
        if self.closed() {
            return Err(SignalingError::InvalidState("peer is closed".to_string()));
        }

        let id = self.inner.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (responder, response) = async_oneshot::oneshot();
        self.inner
            .session
            .do_send(SessionCommand::Request {
                id,
                request,
                responder,
            })
            .map_err(|_| SignalingError::InvalidState("peer session is gone".to_string()))?;

        let response = async move {
            response
                .await
                .map_err(|_| SignalingError::InvalidState("peer session closed".to_string()))?
        };
        let timeout = async {
            Timer::after(REQUEST_TIMEOUT).await;
            Err(SignalingError::Server("peer request timed out".to_string()))
        };

        match future::or(response, timeout).await {
            Ok(data) => Ok(data),
            Err(error) => {
                // The ack never came (or the session refused it); make sure
                // the session is not left waiting on this id.
                let _ = self
                    .inner
                    .session
                    .do_send(SessionCommand::AbortRequest { id });

                Err(error)
            }
        }
    }

    /// Close the peer. Idempotent; fires the close handlers exactly once.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.close.add(Box::new(callback))
    }

    pub fn downgrade(&self) -> WeakPeer {
        WeakPeer {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning peer handle used by engine event subscriptions.
#[derive(Clone)]
pub struct WeakPeer {
    inner: Weak<Inner>,
}

impl WeakPeer {
    pub fn upgrade(&self) -> Option<Peer> {
        self.inner.upgrade().map(|inner| Peer { inner })
    }
}

/// WebSocket actor representing one signaling connection.
///
/// Inbound frames are parsed into protocol messages; requests and
/// notifications are dispatched to the room on a background task, responses
/// fulfill the pending request they acknowledge.
pub struct PeerSession {
    peer_id: PeerId,
    remote_addr: String,
    room: Room,
    peer: Option<Peer>,
    // In-flight room-initiated requests, keyed by request id. Entries are
    // removed by the matching response or an abort, and dropped wholesale
    // when the session stops.
    pending: HashMap<u32, async_oneshot::Sender<Result<Value, SignalingError>>>,
}

impl PeerSession {
    pub fn new(peer_id: PeerId, remote_addr: String, room: Room) -> Self {
        Self {
            peer_id,
            remote_addr,
            room,
            peer: None,
            pending: HashMap::new(),
        }
    }
}

impl Actor for PeerSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(
            "peer {} connected to room {} [address:{}]",
            self.peer_id,
            self.room.id(),
            self.remote_addr
        );

        let peer = Peer::new(
            self.peer_id.clone(),
            self.remote_addr.clone(),
            ctx.address().recipient(),
        );

        if let Err(error) = self.room.attach_peer(&peer) {
            warn!("rejecting peer {}: {error}", self.peer_id);
            ctx.stop();
            return;
        }

        peer.notify(ServerNotification::MediasoupVersion {
            version: env!("CARGO_PKG_VERSION").to_string(),
        });
        self.peer = Some(peer);

        // The join timer: a peer that never joins is dropped without any
        // `disconnected` signal towards the room.
        ctx.run_later(JOIN_TIMEOUT, |act, ctx| {
            let joined = act.peer.as_ref().map(Peer::joined).unwrap_or(true);
            if !joined {
                info!("peer {} did not join in time, closing", act.peer_id);
                ctx.stop();
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("peer {} session closed", self.peer_id);

        if let Some(peer) = self.peer.take() {
            peer.close();
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for PeerSession {
    fn handle(&mut self, message: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match message {
            Ok(ws::Message::Ping(payload)) => {
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(_)) => {
                warn!("peer {}: unexpected binary message", self.peer_id);
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => ctx.stop(),
        }
    }
}

impl PeerSession {
    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let message = match protocol::parse_client_message(text) {
            Ok(message) => message,
            Err(error) => {
                warn!("peer {}: {error}", self.peer_id);
                return;
            }
        };

        match message {
            ClientMessage::Request { id, request } => {
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                let room = self.room.clone();
                let address = ctx.address();
                let is_join = matches!(request, ClientRequest::Join { .. });

                actix::spawn(async move {
                    let result = room.handle_request(&peer, request).await;
                    let joined = is_join && result.is_ok();
                    address.do_send(SessionCommand::Respond { id, result });

                    // Only once the join response is on its way may the
                    // existing producers be fanned out to the newcomer.
                    if joined {
                        room.after_peer_joined(&peer);
                    }
                });
            }
            ClientMessage::Notification(notification) => {
                let Some(peer) = self.peer.clone() else {
                    return;
                };
                let room = self.room.clone();

                actix::spawn(async move {
                    if let Err(error) = room.handle_notification(&peer, notification).await {
                        // Notification errors are logged, never surfaced.
                        warn!("peer {} notification failed: {error}", peer.id());
                    }
                });
            }
            ClientMessage::Response { id, result } => {
                if let Some(mut responder) = self.pending.remove(&id) {
                    let _ = responder.send(result);
                } else {
                    warn!("peer {}: response for unknown request {id}", self.peer_id);
                }
            }
        }
    }
}

impl Handler<SessionCommand> for PeerSession {
    type Result = ();

    fn handle(&mut self, command: SessionCommand, ctx: &mut Self::Context) {
        match command {
            SessionCommand::Notify(notification) => {
                ctx.text(protocol::notification_envelope(&notification));
            }
            SessionCommand::Request {
                id,
                request,
                responder,
            } => {
                self.pending.insert(id, responder);
                ctx.text(protocol::request_envelope(id, &request));
            }
            SessionCommand::AbortRequest { id } => {
                self.pending.remove(&id);
            }
            SessionCommand::Respond { id, result } => match result {
                Ok(data) => ctx.text(protocol::ok_response_envelope(id, &data)),
                Err(error) => ctx.text(protocol::error_response_envelope(id, &error)),
            },
            SessionCommand::Close => {
                ctx.close(None);
                ctx.stop();
            }
        }
    }
}
