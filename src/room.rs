//! Rooms group peers around a pair of mediasoup routers and coordinate the
//! engine objects created on their behalf.
//!
//! With pipe transports disabled both router handles point at the same
//! router on one worker. With pipe transports enabled the producer and
//! consumer routers live on two different workers and every producer (and
//! data producer) is piped from the former into the latter before anyone
//! consumes it.
//!
//! The room owns the peer registries and drives the media fan-out: whenever
//! a peer joins or a producer appears, the matching set of consumers is
//! created on every other peer's consuming transport. Per (target, producer)
//! pair the `newConsumer` acknowledgement always precedes the engine-side
//! `resume()`; across pairs everything runs concurrently.

use crate::bot::Bot;
use crate::broadcaster::Broadcaster;
use crate::config::Config;
use crate::error::SignalingError;
use crate::peer::{Peer, PeerId};
use crate::protocol::{
    ClientNotification, ClientRequest, DataAppData, DataChannel, MediaAppData, PeerInfo,
    PeerVolume, ServerNotification, ServerRequest, TransportAppData, TransportDirection,
};
use crate::server::WorkerSlot;
use crate::throttle::{ThrottleCoordinator, ThrottleProfile};
use async_executor::Executor;
use event_listener_primitives::{BagOnce, HandlerId};
use log::{debug, info, warn};
use mediasoup::data_structures::{DtlsState, IceState};
use mediasoup::prelude::*;
use mediasoup::router::NewTransport;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU16;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Opaque room identifier, supplied by clients in the connection URL.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl From<String> for RoomId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An entry removed from the registries; remembers which registry held it.
pub(crate) enum RegistryEntry {
    Peer { peer: Peer, joined: bool },
    Broadcaster { broadcaster: Broadcaster },
}

impl RegistryEntry {
    fn close(&self) {
        match self {
            Self::Peer { peer, .. } => peer.close(),
            Self::Broadcaster { broadcaster } => broadcaster.close(),
        }
    }
}

/// The four peer registries of a room. A participant id is present in at
/// most one of them at any time.
#[derive(Default)]
pub(crate) struct PeerRegistries {
    joining_peers: HashMap<PeerId, Peer>,
    peers: HashMap<PeerId, Peer>,
    joining_broadcasters: HashMap<PeerId, Broadcaster>,
    broadcasters: HashMap<PeerId, Broadcaster>,
}

impl PeerRegistries {
    pub(crate) fn contains(&self, id: &PeerId) -> bool {
        self.joining_peers.contains_key(id)
            || self.peers.contains_key(id)
            || self.joining_broadcasters.contains_key(id)
            || self.broadcasters.contains_key(id)
    }

    /// Remove the participant with the given id from whichever registry
    /// holds it.
    pub(crate) fn take(&mut self, id: &PeerId) -> Option<RegistryEntry> {
        if let Some(peer) = self.joining_peers.remove(id) {
            return Some(RegistryEntry::Peer {
                peer,
                joined: false,
            });
        }
        if let Some(peer) = self.peers.remove(id) {
            return Some(RegistryEntry::Peer { peer, joined: true });
        }
        if let Some(broadcaster) = self.joining_broadcasters.remove(id) {
            return Some(RegistryEntry::Broadcaster { broadcaster });
        }
        if let Some(broadcaster) = self.broadcasters.remove(id) {
            return Some(RegistryEntry::Broadcaster { broadcaster });
        }

        None
    }

    pub(crate) fn insert_joining_peer(&mut self, peer: Peer) -> Result<(), SignalingError> {
        if self.contains(peer.id()) {
            return Err(SignalingError::InvalidState(format!(
                "participant with id \"{}\" already exists",
                peer.id()
            )));
        }
        self.joining_peers.insert(peer.id().clone(), peer);

        Ok(())
    }

    pub(crate) fn insert_joining_broadcaster(
        &mut self,
        broadcaster: Broadcaster,
    ) -> Result<(), SignalingError> {
        if self.contains(broadcaster.id()) {
            return Err(SignalingError::InvalidState(format!(
                "participant with id \"{}\" already exists",
                broadcaster.id()
            )));
        }
        self.joining_broadcasters
            .insert(broadcaster.id().clone(), broadcaster);

        Ok(())
    }

    pub(crate) fn promote_peer(&mut self, id: &PeerId) -> Option<Peer> {
        let peer = self.joining_peers.remove(id)?;
        self.peers.insert(id.clone(), peer.clone());

        Some(peer)
    }

    pub(crate) fn promote_broadcaster(&mut self, id: &PeerId) -> Option<Broadcaster> {
        let broadcaster = self.joining_broadcasters.remove(id)?;
        self.broadcasters.insert(id.clone(), broadcaster.clone());

        Some(broadcaster)
    }

    pub(crate) fn joined_peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub(crate) fn joined_broadcasters(&self) -> impl Iterator<Item = &Broadcaster> {
        self.broadcasters.values()
    }

    pub(crate) fn broadcaster(&self, id: &PeerId) -> Option<Broadcaster> {
        self.broadcasters
            .get(id)
            .or_else(|| self.joining_broadcasters.get(id))
            .cloned()
    }

    /// Remove a broadcaster from whichever broadcaster registry holds it.
    /// Interactive peers are never touched by this.
    pub(crate) fn take_broadcaster(&mut self, id: &PeerId) -> Option<Broadcaster> {
        self.joining_broadcasters
            .remove(id)
            .or_else(|| self.broadcasters.remove(id))
    }

    /// Interactive peers in the joining or joined state. Broadcasters do not
    /// count: the room lives and dies with its interactive participants.
    pub(crate) fn live_peer_count(&self) -> usize {
        self.joining_peers.len() + self.peers.len()
    }

    fn drain(&mut self) -> (Vec<Peer>, Vec<Broadcaster>) {
        let peers = self
            .joining_peers
            .drain()
            .chain(self.peers.drain())
            .map(|(_, peer)| peer)
            .collect();
        let broadcasters = self
            .joining_broadcasters
            .drain()
            .chain(self.broadcasters.drain())
            .map(|(_, broadcaster)| broadcaster)
            .collect();

        (peers, broadcasters)
    }
}

// Retains the engine objects backing a producer piped between the two
// routers; dropping them tears the pipe down.
enum PipePair {
    Media(PipeProducerToRouterPair),
    Data(PipeDataProducerToRouterPair),
}

struct Shared {
    registries: PeerRegistries,
    // Producers seen on the producer router, fed by its transport observers.
    observed_producers: HashMap<ProducerId, WeakProducer>,
    pipes: Vec<PipePair>,
    attached_handlers: Vec<HandlerId>,
}

#[derive(Default)]
struct Handlers {
    close: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    id: RoomId,
    config: Arc<Config>,
    executor: Arc<Executor<'static>>,
    throttle: ThrottleCoordinator,
    producer_router: Router,
    consumer_router: Router,
    producer_webrtc_server: WebRtcServer,
    consumer_webrtc_server: WebRtcServer,
    audio_level_observer: AudioLevelObserver,
    active_speaker_observer: ActiveSpeakerObserver,
    bot: Bot,
    consumer_replicas: u32,
    pipe_mode: bool,
    created_at: Instant,
    closed: AtomicBool,
    shared: parking_lot::Mutex<Shared>,
    handlers: Handlers,
}

impl Inner {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(
                "room {} closed after {:?}",
                self.id,
                self.created_at.elapsed()
            );

            let (peers, broadcasters) = {
                let mut shared = self.shared.lock();
                shared.observed_producers.clear();
                shared.pipes.clear();
                shared.attached_handlers.clear();
                shared.registries.drain()
            };

            for peer in peers {
                peer.close();
            }
            for broadcaster in broadcasters {
                broadcaster.close();
            }

            self.handlers.close.call_simple();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

/// A scoping boundary owning a pair of routers and a set of peers.
#[derive(Clone)]
pub struct Room {
    inner: Arc<Inner>,
}

impl fmt::Debug for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Room")
            .field("id", &self.inner.id)
            .field("pipe_mode", &self.inner.pipe_mode)
            .field("closed", &self.inner.closed)
            .finish()
    }
}

impl Room {
    pub(crate) async fn new(
        id: RoomId,
        slots: Vec<WorkerSlot>,
        consumer_replicas: u32,
        pipe_mode: bool,
        config: Arc<Config>,
        executor: Arc<Executor<'static>>,
        throttle: ThrottleCoordinator,
    ) -> Result<Self, SignalingError> {
        let producer_slot = slots
            .first()
            .ok_or_else(|| SignalingError::Server("no worker slot available".to_string()))?;
        let consumer_slot = slots.last().unwrap_or(producer_slot);

        let media_codecs = config.mediasoup.router_options.media_codecs.clone();
        let producer_router = producer_slot
            .worker
            .create_router(RouterOptions::new(media_codecs.clone()))
            .await
            .map_err(SignalingError::engine)?;
        let consumer_router = if pipe_mode {
            consumer_slot
                .worker
                .create_router(RouterOptions::new(media_codecs))
                .await
                .map_err(SignalingError::engine)?
        } else {
            producer_router.clone()
        };

        let audio_level_observer = producer_router
            .create_audio_level_observer({
                let mut options = AudioLevelObserverOptions::default();
                options.max_entries = NonZeroU16::new(1).unwrap();
                options.threshold = -80;
                options.interval = 800;
                options
            })
            .await
            .map_err(SignalingError::engine)?;
        let active_speaker_observer = producer_router
            .create_active_speaker_observer({
                let mut options = ActiveSpeakerObserverOptions::default();
                options.interval = 300;
                options
            })
            .await
            .map_err(SignalingError::engine)?;

        let bot = Bot::new(&consumer_router).await?;

        info!(
            "room {id} created [pipeMode:{pipe_mode}, workers:{}/{}]",
            producer_slot.index, consumer_slot.index
        );

        let room = Self {
            inner: Arc::new(Inner {
                id,
                config,
                executor,
                throttle,
                producer_router,
                consumer_router,
                producer_webrtc_server: producer_slot.webrtc_server.clone(),
                consumer_webrtc_server: consumer_slot.webrtc_server.clone(),
                audio_level_observer,
                active_speaker_observer,
                bot,
                consumer_replicas,
                pipe_mode,
                created_at: Instant::now(),
                closed: AtomicBool::new(false),
                shared: parking_lot::Mutex::new(Shared {
                    registries: PeerRegistries::default(),
                    observed_producers: HashMap::new(),
                    pipes: Vec::new(),
                    attached_handlers: Vec::new(),
                }),
                handlers: Handlers::default(),
            }),
        };

        room.wire_engine_events();

        Ok(room)
    }

    pub fn id(&self) -> &RoomId {
        &self.inner.id
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Capabilities clients negotiate against. In pipe mode consumers
    /// negotiate with the consumer router even though observers are wired on
    /// the producer router.
    pub fn router_rtp_capabilities(&self) -> &RtpCapabilitiesFinalized {
        self.inner.consumer_router.rtp_capabilities()
    }

    pub fn on_close<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.close.add(Box::new(callback))
    }

    pub fn close(&self) {
        self.inner.close();
    }

    pub fn downgrade(&self) -> WeakRoom {
        WeakRoom {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Register the engine observers: producer bookkeeping on the producer
    /// router, the dominant speaker pipeline, and the close cascades for
    /// routers and WebRTC servers (the room closes if either server goes).
    fn wire_engine_events(&self) {
        let mut handlers = Vec::new();
        let room_weak = self.downgrade();

        handlers.push(self.inner.producer_router.on_new_transport({
            let room_weak = room_weak.clone();

            move |new_transport| match new_transport {
                NewTransport::WebRtc(transport) => {
                    observe_transport_producers(&room_weak, |callback| {
                        transport.on_new_producer(callback)
                    });
                }
                NewTransport::Plain(transport) => {
                    observe_transport_producers(&room_weak, |callback| {
                        transport.on_new_producer(callback)
                    });
                }
                _ => {}
            }
        }));

        handlers.push(self.inner.audio_level_observer.on_volumes({
            let room_weak = room_weak.clone();

            move |volumes| {
                let Some(room) = room_weak.upgrade() else {
                    return;
                };
                let peer_volumes = volumes
                    .iter()
                    .filter_map(|entry| {
                        entry
                            .producer
                            .app_data()
                            .downcast_ref::<MediaAppData>()
                            .map(|app_data| PeerVolume {
                                peer_id: app_data.peer_id.clone(),
                                volume: entry.volume,
                            })
                    })
                    .collect();

                room.broadcast(
                    ServerNotification::SpeakingPeers { peer_volumes },
                    None,
                );
            }
        }));

        handlers.push(self.inner.audio_level_observer.on_silence({
            let room_weak = room_weak.clone();

            move || {
                let Some(room) = room_weak.upgrade() else {
                    return;
                };
                room.broadcast(
                    ServerNotification::SpeakingPeers {
                        peer_volumes: Vec::new(),
                    },
                    None,
                );
                room.broadcast(ServerNotification::ActiveSpeaker { peer_id: None }, None);
            }
        }));

        handlers.push(self.inner.active_speaker_observer.on_dominant_speaker({
            let room_weak = room_weak.clone();

            move |dominant_speaker| {
                let Some(room) = room_weak.upgrade() else {
                    return;
                };
                let peer_id = dominant_speaker
                    .producer
                    .app_data()
                    .downcast_ref::<MediaAppData>()
                    .map(|app_data| app_data.peer_id.clone());

                room.broadcast(ServerNotification::ActiveSpeaker { peer_id }, None);
            }
        }));

        handlers.push(self.inner.producer_router.on_close({
            let room_weak = room_weak.clone();
            move || {
                if let Some(room) = room_weak.upgrade() {
                    warn!("producer router closed, closing room {}", room.id());
                    room.close();
                }
            }
        }));
        handlers.push(self.inner.consumer_router.on_close({
            let room_weak = room_weak.clone();
            move || {
                if let Some(room) = room_weak.upgrade() {
                    warn!("consumer router closed, closing room {}", room.id());
                    room.close();
                }
            }
        }));
        handlers.push(self.inner.producer_webrtc_server.on_close({
            let room_weak = room_weak.clone();
            move || {
                if let Some(room) = room_weak.upgrade() {
                    warn!("producer WebRTC server closed, closing room {}", room.id());
                    room.close();
                }
            }
        }));
        handlers.push(self.inner.consumer_webrtc_server.on_close({
            let room_weak = room_weak.clone();
            move || {
                if let Some(room) = room_weak.upgrade() {
                    warn!("consumer WebRTC server closed, closing room {}", room.id());
                    room.close();
                }
            }
        }));

        self.inner.shared.lock().attached_handlers.extend(handlers);
    }

    /// Attach a freshly connected peer in the joining state. An existing
    /// participant with the same id is superseded: it is closed first and
    /// the new session takes its place.
    pub fn attach_peer(&self, peer: &Peer) -> Result<(), SignalingError> {
        if self.closed() {
            return Err(SignalingError::InvalidState("room is closed".to_string()));
        }

        let existing = self.inner.shared.lock().registries.take(peer.id());
        if let Some(entry) = existing {
            warn!(
                "participant with id \"{}\" already exists, closing it",
                peer.id()
            );
            entry.close();
        }

        self.inner
            .shared
            .lock()
            .registries
            .insert_joining_peer(peer.clone())?;

        peer.on_close({
            let room_weak = self.downgrade();
            let peer_id = peer.id().clone();

            move || {
                if let Some(room) = room_weak.upgrade() {
                    room.handle_peer_close(&peer_id);
                }
            }
        })
        .detach();

        Ok(())
    }

    /// Peer-level `closed` already ran (its ledgers dropped); this is the
    /// room-level `disconnected` half: registry removal, the `peerClosed`
    /// broadcast, and the liveness check.
    fn handle_peer_close(&self, peer_id: &PeerId) {
        if self.closed() {
            return;
        }

        let (was_joined, live_count) = {
            let mut shared = self.inner.shared.lock();
            let Some(entry) = shared.registries.take(peer_id) else {
                return;
            };
            let was_joined = matches!(entry, RegistryEntry::Peer { joined: true, .. });

            (was_joined, shared.registries.live_peer_count())
        };

        debug!("peer {peer_id} left room {}", self.inner.id);

        if was_joined {
            self.broadcast(
                ServerNotification::PeerClosed {
                    peer_id: peer_id.clone(),
                },
                None,
            );
        }

        if live_count == 0 {
            // Close on the next scheduler turn, not inline: the caller may
            // still hold peer state up the stack.
            let room = self.clone();
            self.inner
                .executor
                .spawn(async move {
                    room.close_if_empty();
                })
                .detach();
        }
    }

    fn close_if_empty(&self) {
        if self.closed() {
            return;
        }
        if self.inner.shared.lock().registries.live_peer_count() == 0 {
            info!("last peer left room {}, closing it", self.inner.id);
            self.close();
        }
    }

    /// Send a notification to every joined peer, optionally excluding one.
    pub(crate) fn broadcast(&self, notification: ServerNotification, except: Option<&PeerId>) {
        let peers: Vec<Peer> = {
            let shared = self.inner.shared.lock();
            shared
                .registries
                .joined_peers()
                .filter(|peer| Some(peer.id()) != except)
                .cloned()
                .collect()
        };

        for peer in peers {
            peer.notify(notification.clone());
        }
    }

    // ===== Request / notification handling ==================================

    pub async fn handle_request(
        &self,
        peer: &Peer,
        request: ClientRequest,
    ) -> Result<Value, SignalingError> {
        match request {
            ClientRequest::GetRouterRtpCapabilities => {
                serde_json::to_value(self.router_rtp_capabilities())
                    .map_err(SignalingError::engine)
            }
            ClientRequest::Join {
                display_name,
                device,
                rtp_capabilities,
                sctp_capabilities,
            } => {
                if peer.joined() {
                    return Err(SignalingError::InvalidState(
                        "peer already joined".to_string(),
                    ));
                }

                peer.set_joined(display_name, device, rtp_capabilities, sctp_capabilities);

                let snapshot: Vec<PeerInfo> = {
                    let mut shared = self.inner.shared.lock();
                    if shared.registries.promote_peer(peer.id()).is_none() {
                        return Err(SignalingError::InvalidState(
                            "peer is not in the joining state".to_string(),
                        ));
                    }

                    shared
                        .registries
                        .joined_peers()
                        .filter(|other| other.id() != peer.id())
                        .map(Peer::info)
                        .chain(shared.registries.joined_broadcasters().map(Broadcaster::info))
                        .collect()
                };

                info!("peer {} joined room {}", peer.id(), self.inner.id);

                Ok(json!({ "peers": snapshot }))
            }
            ClientRequest::CreateWebRtcTransport {
                direction,
                force_tcp,
                sctp_capabilities,
            } => {
                let (router, webrtc_server) = match direction {
                    TransportDirection::Send => (
                        &self.inner.producer_router,
                        &self.inner.producer_webrtc_server,
                    ),
                    TransportDirection::Recv => (
                        &self.inner.consumer_router,
                        &self.inner.consumer_webrtc_server,
                    ),
                };

                let transport_config = &self.inner.config.webrtc_transport_options;
                let mut options = WebRtcTransportOptions::new_with_server(webrtc_server.clone());
                options.enable_sctp = sctp_capabilities.is_some();
                if let Some(sctp_capabilities) = sctp_capabilities {
                    options.num_sctp_streams = sctp_capabilities.num_streams;
                }
                options.max_sctp_message_size = transport_config.max_sctp_message_size;
                options.initial_available_outgoing_bitrate =
                    transport_config.initial_available_outgoing_bitrate;
                if force_tcp {
                    options.enable_udp = false;
                    options.enable_tcp = true;
                }
                options.app_data = AppData::new(TransportAppData { direction });

                let transport = router
                    .create_webrtc_transport(options)
                    .await
                    .map_err(SignalingError::engine)?;

                self.monitor_transport(peer, &transport, direction);
                peer.add_transport(transport.clone());

                if let Some(max_incoming_bitrate) = transport_config.max_incoming_bitrate {
                    if let Err(error) = transport.set_max_incoming_bitrate(max_incoming_bitrate).await
                    {
                        warn!("failed to set max incoming bitrate: {error}");
                    }
                }

                Ok(json!({
                    "id": transport.id(),
                    "iceParameters": transport.ice_parameters(),
                    "iceCandidates": transport.ice_candidates(),
                    "dtlsParameters": transport.dtls_parameters(),
                    "sctpParameters": transport.sctp_parameters(),
                }))
            }
            ClientRequest::ConnectWebRtcTransport {
                transport_id,
                dtls_parameters,
            } => {
                let transport = peer.transport(&transport_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "transport with id \"{transport_id}\" not found"
                    ))
                })?;

                transport
                    .connect(WebRtcTransportRemoteParameters { dtls_parameters })
                    .await
                    .map_err(SignalingError::engine)?;

                Ok(json!({}))
            }
            ClientRequest::RestartIce { transport_id } => {
                let transport = peer.transport(&transport_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "transport with id \"{transport_id}\" not found"
                    ))
                })?;

                let ice_parameters = transport
                    .restart_ice()
                    .await
                    .map_err(SignalingError::engine)?;

                Ok(json!({ "iceParameters": ice_parameters }))
            }
            ClientRequest::Produce {
                transport_id,
                kind,
                rtp_parameters,
                app_data,
            } => {
                if !peer.joined() {
                    return Err(SignalingError::InvalidState(
                        "peer not yet joined".to_string(),
                    ));
                }

                let transport = peer.transport(&transport_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "transport with id \"{transport_id}\" not found"
                    ))
                })?;

                let mut options = ProducerOptions::new(kind, rtp_parameters);
                options.app_data = AppData::new(MediaAppData {
                    peer_id: peer.id().clone(),
                    source: app_data.source,
                });

                let producer = transport
                    .produce(options)
                    .await
                    .map_err(SignalingError::engine)?;
                peer.add_producer(producer.clone());

                let producer_id = producer.id();
                producer
                    .on_score({
                        let peer_weak = peer.downgrade();
                        move |score| {
                            if let Some(peer) = peer_weak.upgrade() {
                                peer.notify(ServerNotification::ProducerScore {
                                    producer_id,
                                    score: serde_json::to_value(score).unwrap_or(Value::Null),
                                });
                            }
                        }
                    })
                    .detach();
                producer
                    .on_transport_close({
                        let peer_weak = peer.downgrade();
                        move || {
                            if let Some(peer) = peer_weak.upgrade() {
                                peer.remove_producer(&producer_id);
                            }
                        }
                    })
                    .detach();

                // Fan the new producer out to everyone else.
                {
                    let room = self.clone();
                    let source = peer.id().clone();
                    let producer = producer.clone();
                    self.inner
                        .executor
                        .spawn(async move {
                            room.fan_out_producer(&source, producer).await;
                        })
                        .detach();
                }

                Ok(json!({ "id": producer.id() }))
            }
            ClientRequest::ProduceData {
                transport_id,
                label,
                protocol,
                sctp_stream_parameters,
            } => {
                if !peer.joined() {
                    return Err(SignalingError::InvalidState(
                        "peer not yet joined".to_string(),
                    ));
                }

                let channel = DataChannel::from_label(&label).ok_or_else(|| {
                    SignalingError::TypeError(format!("unknown data channel label \"{label}\""))
                })?;

                let transport = peer.transport(&transport_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "transport with id \"{transport_id}\" not found"
                    ))
                })?;

                let mut options = DataProducerOptions::new_sctp(sctp_stream_parameters);
                options.label = label;
                options.protocol = protocol;
                options.app_data = AppData::new(DataAppData {
                    peer_id: Some(peer.id().clone()),
                    channel,
                });

                let data_producer = transport
                    .produce_data(options)
                    .await
                    .map_err(SignalingError::engine)?;
                peer.add_data_producer(data_producer.clone());

                let data_producer_id = data_producer.id();
                data_producer
                    .on_transport_close({
                        let peer_weak = peer.downgrade();
                        move || {
                            if let Some(peer) = peer_weak.upgrade() {
                                peer.remove_data_producer(&data_producer_id);
                            }
                        }
                    })
                    .detach();

                {
                    let room = self.clone();
                    let source = peer.clone();
                    let data_producer = data_producer.clone();
                    self.inner
                        .executor
                        .spawn(async move {
                            room.fan_out_data_producer(&source, data_producer, channel).await;
                        })
                        .detach();
                }

                Ok(json!({ "id": data_producer.id() }))
            }
            ClientRequest::GetTransportStats { transport_id } => {
                let transport = peer.transport(&transport_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "transport with id \"{transport_id}\" not found"
                    ))
                })?;
                let stats = transport
                    .get_stats()
                    .await
                    .map_err(SignalingError::engine)?;

                serde_json::to_value(&stats).map_err(SignalingError::engine)
            }
            ClientRequest::GetProducerStats { producer_id } => {
                let producer = peer.producer(&producer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "producer with id \"{producer_id}\" not found"
                    ))
                })?;
                let stats = producer.get_stats().await.map_err(SignalingError::engine)?;

                serde_json::to_value(&stats).map_err(SignalingError::engine)
            }
            ClientRequest::GetConsumerStats { consumer_id } => {
                let consumer = peer.consumer(&consumer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "consumer with id \"{consumer_id}\" not found"
                    ))
                })?;
                let stats = consumer.get_stats().await.map_err(SignalingError::engine)?;

                serde_json::to_value(&stats).map_err(SignalingError::engine)
            }
            ClientRequest::GetDataProducerStats { data_producer_id } => {
                let data_producer = peer.data_producer(&data_producer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "data producer with id \"{data_producer_id}\" not found"
                    ))
                })?;
                let stats = data_producer
                    .get_stats()
                    .await
                    .map_err(SignalingError::engine)?;

                serde_json::to_value(&stats).map_err(SignalingError::engine)
            }
            ClientRequest::GetDataConsumerStats { data_consumer_id } => {
                let data_consumer = peer.data_consumer(&data_consumer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "data consumer with id \"{data_consumer_id}\" not found"
                    ))
                })?;
                let stats = data_consumer
                    .get_stats()
                    .await
                    .map_err(SignalingError::engine)?;

                serde_json::to_value(&stats).map_err(SignalingError::engine)
            }
            ClientRequest::ApplyNetworkThrottle {
                secret,
                uplink,
                downlink,
                rtt,
                packet_loss,
            } => {
                let profile = ThrottleProfile {
                    uplink,
                    downlink,
                    rtt,
                    packet_loss,
                };
                self.inner
                    .throttle
                    .apply(&self.inner.id, secret.as_deref(), &profile)
                    .await?;

                Ok(json!({}))
            }
            ClientRequest::StopNetworkThrottle { secret } => {
                self.inner.throttle.stop(secret.as_deref()).await?;

                Ok(json!({}))
            }
        }
    }

    pub async fn handle_notification(
        &self,
        peer: &Peer,
        notification: ClientNotification,
    ) -> Result<(), SignalingError> {
        match notification {
            ClientNotification::CloseProducer { producer_id } => {
                peer.remove_producer(&producer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "producer with id \"{producer_id}\" not found"
                    ))
                })?;

                Ok(())
            }
            ClientNotification::PauseProducer { producer_id } => {
                let producer = peer.producer(&producer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "producer with id \"{producer_id}\" not found"
                    ))
                })?;

                producer.pause().await.map_err(SignalingError::engine)
            }
            ClientNotification::ResumeProducer { producer_id } => {
                let producer = peer.producer(&producer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "producer with id \"{producer_id}\" not found"
                    ))
                })?;

                producer.resume().await.map_err(SignalingError::engine)
            }
            ClientNotification::PauseConsumer { consumer_id } => {
                let consumer = peer.consumer(&consumer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "consumer with id \"{consumer_id}\" not found"
                    ))
                })?;

                consumer.pause().await.map_err(SignalingError::engine)
            }
            ClientNotification::ResumeConsumer { consumer_id } => {
                let consumer = peer.consumer(&consumer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "consumer with id \"{consumer_id}\" not found"
                    ))
                })?;

                consumer.resume().await.map_err(SignalingError::engine)
            }
            ClientNotification::SetConsumerPreferredLayers {
                consumer_id,
                spatial_layer,
                temporal_layer,
            } => {
                let consumer = peer.consumer(&consumer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "consumer with id \"{consumer_id}\" not found"
                    ))
                })?;

                consumer
                    .set_preferred_layers(ConsumerLayers {
                        spatial_layer,
                        temporal_layer,
                    })
                    .await
                    .map_err(SignalingError::engine)
            }
            ClientNotification::SetConsumerPriority {
                consumer_id,
                priority,
            } => {
                let consumer = peer.consumer(&consumer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "consumer with id \"{consumer_id}\" not found"
                    ))
                })?;

                consumer
                    .set_priority(priority)
                    .await
                    .map_err(SignalingError::engine)
            }
            ClientNotification::RequestConsumerKeyFrame { consumer_id } => {
                let consumer = peer.consumer(&consumer_id).ok_or_else(|| {
                    SignalingError::NotFound(format!(
                        "consumer with id \"{consumer_id}\" not found"
                    ))
                })?;

                consumer
                    .request_key_frame()
                    .await
                    .map_err(SignalingError::engine)
            }
            ClientNotification::ChangeDisplayName { display_name } => {
                let old_display_name = peer.set_display_name(display_name.clone());

                self.broadcast(
                    ServerNotification::PeerDisplayNameChanged {
                        peer_id: peer.id().clone(),
                        display_name,
                        old_display_name,
                    },
                    Some(peer.id()),
                );

                Ok(())
            }
        }
    }

    /// Run once the join response was put on the wire: create consumers for
    /// everything that already exists in the room and announce the newcomer.
    pub fn after_peer_joined(&self, peer: &Peer) {
        let (other_peers, broadcasters) = {
            let shared = self.inner.shared.lock();
            let other_peers: Vec<Peer> = shared
                .registries
                .joined_peers()
                .filter(|other| other.id() != peer.id())
                .cloned()
                .collect();
            let broadcasters: Vec<Broadcaster> =
                shared.registries.joined_broadcasters().cloned().collect();

            (other_peers, broadcasters)
        };

        for other in &other_peers {
            for producer in other.producers() {
                self.spawn_consumer_creation(peer.clone(), producer);
            }
        }
        for broadcaster in &broadcasters {
            for producer in broadcaster.producers() {
                self.spawn_consumer_creation(peer.clone(), producer);
            }
        }

        // Chat data producers of the other peers, then the bot's own.
        for other in &other_peers {
            for data_producer in other.data_producers() {
                let is_chat = data_producer
                    .app_data()
                    .downcast_ref::<DataAppData>()
                    .map(|app_data| app_data.channel == DataChannel::Chat)
                    .unwrap_or(false);
                if is_chat {
                    self.spawn_data_consumer_creation(peer.clone(), data_producer);
                }
            }
        }
        self.spawn_data_consumer_creation(peer.clone(), self.inner.bot.data_producer());

        self.broadcast(
            {
                let info = peer.info();
                ServerNotification::NewPeer {
                    id: info.id,
                    display_name: info.display_name,
                    device: info.device,
                }
            },
            Some(peer.id()),
        );
    }

    /// A new media producer appeared (from a peer or a broadcaster): pipe it
    /// if needed, then create consumers on every other joined peer.
    pub(crate) async fn fan_out_producer(&self, source: &PeerId, producer: Producer) {
        if self.inner.pipe_mode {
            match self
                .inner
                .producer_router
                .pipe_producer_to_router(
                    producer.id(),
                    PipeToRouterOptions::new(self.inner.consumer_router.clone()),
                )
                .await
            {
                Ok(pipe) => {
                    self.inner.shared.lock().pipes.push(PipePair::Media(pipe));
                }
                Err(error) => {
                    warn!(
                        "failed to pipe producer {} into consumer router: {error}",
                        producer.id()
                    );
                    return;
                }
            }
        }

        let targets: Vec<Peer> = {
            let shared = self.inner.shared.lock();
            shared
                .registries
                .joined_peers()
                .filter(|target| target.id() != source)
                .cloned()
                .collect()
        };

        for target in targets {
            self.spawn_consumer_creation(target, producer.clone());
        }
    }

    /// A new data producer appeared on a peer: pipe it if needed, hand it to
    /// the bot, and (for the chat channel) create data consumers on every
    /// other joined peer.
    pub(crate) async fn fan_out_data_producer(
        &self,
        source: &Peer,
        data_producer: DataProducer,
        channel: DataChannel,
    ) {
        if self.inner.pipe_mode {
            match self
                .inner
                .producer_router
                .pipe_data_producer_to_router(
                    data_producer.id(),
                    PipeToRouterOptions::new(self.inner.consumer_router.clone()),
                )
                .await
            {
                Ok(pipe) => {
                    self.inner.shared.lock().pipes.push(PipePair::Data(pipe));
                }
                Err(error) => {
                    warn!(
                        "failed to pipe data producer {} into consumer router: {error}",
                        data_producer.id()
                    );
                    return;
                }
            }
        }

        if let Err(error) = self
            .inner
            .bot
            .handle_peer_data_producer(data_producer.id(), source.downgrade())
            .await
        {
            warn!("bot failed to consume data producer: {error}");
        }

        if channel == DataChannel::Chat {
            let targets: Vec<Peer> = {
                let shared = self.inner.shared.lock();
                shared
                    .registries
                    .joined_peers()
                    .filter(|target| target.id() != source.id())
                    .cloned()
                    .collect()
            };

            for target in targets {
                self.spawn_data_consumer_creation(target, data_producer.clone());
            }
        }
    }

    fn spawn_consumer_creation(&self, target: Peer, producer: Producer) {
        let room = self.clone();
        self.inner
            .executor
            .spawn(async move {
                room.create_consumers_for(&target, &producer);
            })
            .detach();
    }

    fn spawn_data_consumer_creation(&self, target: Peer, data_producer: DataProducer) {
        let room = self.clone();
        self.inner
            .executor
            .spawn(async move {
                if let Err(error) = room.create_data_consumer(&target, &data_producer).await {
                    warn!(
                        "failed to create data consumer [peerId:{}, dataProducerId:{}]: {error}",
                        target.id(),
                        data_producer.id()
                    );
                }
            })
            .detach();
    }

    /// Create `1 + consumer_replicas` consumers towards `target`, each one
    /// independently going through paused-create → `newConsumer` → ack →
    /// resume. Per-target failures never fail the surrounding fan-out.
    fn create_consumers_for(&self, target: &Peer, producer: &Producer) {
        // A peer without declared capabilities is never consume-capable, and
        // one without a consuming transport is reconsumed when it joins.
        let Some(rtp_capabilities) = target.rtp_capabilities() else {
            return;
        };
        let Some(transport) = target.recv_transport() else {
            return;
        };

        if !self
            .inner
            .consumer_router
            .can_consume(&producer.id(), &rtp_capabilities)
        {
            warn!(
                "peer {} cannot consume producer {}",
                target.id(),
                producer.id()
            );
            return;
        }

        for _ in 0..(1 + self.inner.consumer_replicas) {
            let room = self.clone();
            let target = target.clone();
            let producer = producer.clone();
            let transport = transport.clone();
            let rtp_capabilities = rtp_capabilities.clone();

            self.inner
                .executor
                .spawn(async move {
                    if let Err(error) = room
                        .create_consumer_replica(&target, &producer, &transport, rtp_capabilities)
                        .await
                    {
                        warn!(
                            "failed to create consumer [peerId:{}, producerId:{}]: {error}",
                            target.id(),
                            producer.id()
                        );
                    }
                })
                .detach();
        }
    }

    async fn create_consumer_replica(
        &self,
        target: &Peer,
        producer: &Producer,
        transport: &WebRtcTransport,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(), SignalingError> {
        let app_data = producer
            .app_data()
            .downcast_ref::<MediaAppData>()
            .cloned()
            .ok_or_else(|| {
                SignalingError::Server("producer carries no media app data".to_string())
            })?;

        let mut options = ConsumerOptions::new(producer.id(), rtp_capabilities);
        options.paused = true;
        options.ignore_dtx = true;
        options.app_data = AppData::new(app_data.clone());

        let consumer = transport
            .consume(options)
            .await
            .map_err(SignalingError::engine)?;
        target.add_consumer(consumer.clone());

        let consumer_id = consumer.id();
        consumer
            .on_producer_close({
                let target_weak = target.downgrade();
                move || {
                    if let Some(peer) = target_weak.upgrade() {
                        peer.remove_consumer(&consumer_id);
                        peer.notify(ServerNotification::ConsumerClosed { consumer_id });
                    }
                }
            })
            .detach();
        consumer
            .on_transport_close({
                let target_weak = target.downgrade();
                move || {
                    if let Some(peer) = target_weak.upgrade() {
                        peer.remove_consumer(&consumer_id);
                    }
                }
            })
            .detach();
        consumer
            .on_producer_pause({
                let target_weak = target.downgrade();
                move || {
                    if let Some(peer) = target_weak.upgrade() {
                        peer.notify(ServerNotification::ConsumerPaused { consumer_id });
                    }
                }
            })
            .detach();
        consumer
            .on_producer_resume({
                let target_weak = target.downgrade();
                move || {
                    if let Some(peer) = target_weak.upgrade() {
                        peer.notify(ServerNotification::ConsumerResumed { consumer_id });
                    }
                }
            })
            .detach();
        consumer
            .on_score({
                let target_weak = target.downgrade();
                move |score| {
                    if let Some(peer) = target_weak.upgrade() {
                        peer.notify(ServerNotification::ConsumerScore {
                            consumer_id,
                            score: serde_json::to_value(score).unwrap_or(Value::Null),
                        });
                    }
                }
            })
            .detach();
        consumer
            .on_layers_change({
                let target_weak = target.downgrade();
                move |layers| {
                    if let Some(peer) = target_weak.upgrade() {
                        peer.notify(ServerNotification::ConsumerLayersChanged {
                            consumer_id,
                            layers: serde_json::to_value(layers).unwrap_or(Value::Null),
                        });
                    }
                }
            })
            .detach();

        let request = ServerRequest::NewConsumer {
            peer_id: app_data.peer_id.clone(),
            producer_id: producer.id(),
            id: consumer.id(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters().clone(),
            r#type: consumer.r#type(),
            app_data,
            producer_paused: consumer.producer_paused(),
        };

        // Resume strictly after the client acknowledged the consumer; an
        // unacked consumer stays paused and is cleaned up by its close
        // observers when the transport or peer goes away.
        target.request(request).await?;
        consumer.resume().await.map_err(SignalingError::engine)?;

        Ok(())
    }

    async fn create_data_consumer(
        &self,
        target: &Peer,
        data_producer: &DataProducer,
    ) -> Result<(), SignalingError> {
        // Data consumption requires declared SCTP capabilities.
        if target.sctp_capabilities().is_none() {
            return Ok(());
        }
        let Some(transport) = target.recv_transport() else {
            return Ok(());
        };

        let app_data = data_producer
            .app_data()
            .downcast_ref::<DataAppData>()
            .cloned()
            .ok_or_else(|| {
                SignalingError::Server("data producer carries no app data".to_string())
            })?;

        let data_consumer = transport
            .consume_data(DataConsumerOptions::new_sctp(data_producer.id()))
            .await
            .map_err(SignalingError::engine)?;
        target.add_data_consumer(data_consumer.clone());

        let data_consumer_id = data_consumer.id();
        data_consumer
            .on_data_producer_close({
                let target_weak = target.downgrade();
                move || {
                    if let Some(peer) = target_weak.upgrade() {
                        peer.remove_data_consumer(&data_consumer_id);
                        peer.notify(ServerNotification::DataConsumerClosed { data_consumer_id });
                    }
                }
            })
            .detach();
        data_consumer
            .on_transport_close({
                let target_weak = target.downgrade();
                move || {
                    if let Some(peer) = target_weak.upgrade() {
                        peer.remove_data_consumer(&data_consumer_id);
                    }
                }
            })
            .detach();

        let request = ServerRequest::NewDataConsumer {
            peer_id: app_data.peer_id.clone(),
            data_producer_id: data_producer.id(),
            id: data_consumer.id(),
            sctp_stream_parameters: data_consumer.sctp_stream_parameters(),
            label: data_consumer.label().to_string(),
            protocol: data_consumer.protocol().to_string(),
            app_data,
        };

        target.request(request).await?;

        Ok(())
    }

    fn monitor_transport(
        &self,
        peer: &Peer,
        transport: &WebRtcTransport,
        direction: TransportDirection,
    ) {
        // A fatal transport state closes the peer; if it was joined, the
        // close cascade surfaces room-wide as `peerClosed`.
        {
            let peer_weak = peer.downgrade();
            let handler = transport.on_dtls_state_change(move |state| {
                if matches!(state, DtlsState::Failed | DtlsState::Closed) {
                    if let Some(peer) = peer_weak.upgrade() {
                        warn!(
                            "DTLS state became {state:?} on peer {} transport, closing peer",
                            peer.id()
                        );
                        peer.close();
                    }
                }
            });
            peer.keep_handler(handler);
        }

        if direction == TransportDirection::Recv {
            let peer_weak = peer.downgrade();
            let handler = transport.on_ice_state_change(move |state| {
                if matches!(state, IceState::Disconnected | IceState::Closed) {
                    if let Some(peer) = peer_weak.upgrade() {
                        warn!(
                            "ICE state became {state:?} on peer {} consuming transport, closing peer",
                            peer.id()
                        );
                        peer.close();
                    }
                }
            });
            peer.keep_handler(handler);
        }
    }

    // ===== Broadcaster operations ==========================================

    pub fn create_broadcaster(
        &self,
        id: PeerId,
        display_name: String,
        device: Value,
    ) -> Result<Vec<PeerInfo>, SignalingError> {
        if self.closed() {
            return Err(SignalingError::InvalidState("room is closed".to_string()));
        }

        let broadcaster = Broadcaster::new(id, display_name, device);

        let mut shared = self.inner.shared.lock();
        shared
            .registries
            .insert_joining_broadcaster(broadcaster)?;

        Ok(shared.registries.joined_peers().map(Peer::info).collect())
    }

    pub fn join_broadcaster(&self, id: &PeerId) -> Result<Vec<PeerInfo>, SignalingError> {
        let mut shared = self.inner.shared.lock();

        let broadcaster = match shared.registries.promote_broadcaster(id) {
            Some(broadcaster) => broadcaster,
            None if shared.registries.contains(id) => {
                return Err(SignalingError::InvalidState(format!(
                    "broadcaster \"{id}\" already joined"
                )));
            }
            None => {
                return Err(SignalingError::NotFound(format!(
                    "broadcaster with id \"{id}\" not found"
                )));
            }
        };
        broadcaster.set_joined();

        Ok(shared
            .registries
            .joined_peers()
            .map(Peer::info)
            .chain(
                shared
                    .registries
                    .joined_broadcasters()
                    .filter(|other| other.id() != id)
                    .map(Broadcaster::info),
            )
            .collect())
    }

    /// Interactive peers are not managed through this surface; an id that is
    /// not a broadcaster is simply not found here.
    pub fn delete_broadcaster(&self, id: &PeerId) -> Result<(), SignalingError> {
        let broadcaster = self
            .inner
            .shared
            .lock()
            .registries
            .take_broadcaster(id)
            .ok_or_else(|| {
                SignalingError::NotFound(format!("broadcaster with id \"{id}\" not found"))
            })?;

        broadcaster.close();

        Ok(())
    }

    fn broadcaster(&self, id: &PeerId) -> Result<Broadcaster, SignalingError> {
        self.inner
            .shared
            .lock()
            .registries
            .broadcaster(id)
            .ok_or_else(|| {
                SignalingError::NotFound(format!("broadcaster with id \"{id}\" not found"))
            })
    }

    fn joined_broadcaster(&self, id: &PeerId) -> Result<Broadcaster, SignalingError> {
        let broadcaster = self.broadcaster(id)?;
        if !broadcaster.joined() {
            return Err(SignalingError::InvalidState(format!(
                "broadcaster \"{id}\" has not joined"
            )));
        }

        Ok(broadcaster)
    }

    pub async fn broadcaster_create_transport(
        &self,
        id: &PeerId,
        direction: TransportDirection,
        comedia: bool,
        rtcp_mux: bool,
    ) -> Result<Value, SignalingError> {
        let broadcaster = self.broadcaster(id)?;

        let router = match direction {
            TransportDirection::Send => &self.inner.producer_router,
            TransportDirection::Recv => &self.inner.consumer_router,
        };

        let plain_config = &self.inner.config.plain_transport_options;
        let mut options = PlainTransportOptions::new(plain_config.listen_info.listen_info(0));
        options.comedia = comedia;
        options.rtcp_mux = rtcp_mux;
        options.max_sctp_message_size = plain_config.max_sctp_message_size;
        options.app_data = AppData::new(TransportAppData { direction });

        let transport = router
            .create_plain_transport(options)
            .await
            .map_err(SignalingError::engine)?;
        broadcaster.add_transport(transport.clone());

        // The tuple layout varies with the engine's address representation,
        // go through JSON to pick the local side out.
        let tuple = serde_json::to_value(transport.tuple()).map_err(SignalingError::engine)?;
        let rtcp_tuple = transport
            .rtcp_tuple()
            .map(|tuple| serde_json::to_value(tuple))
            .transpose()
            .map_err(SignalingError::engine)?;

        Ok(json!({
            "transportId": transport.id(),
            "ip": tuple.get("localAddress").or_else(|| tuple.get("localIp")).cloned().unwrap_or(Value::Null),
            "port": tuple.get("localPort").cloned().unwrap_or(Value::Null),
            "rtcpPort": rtcp_tuple
                .as_ref()
                .and_then(|tuple| tuple.get("localPort"))
                .cloned()
                .unwrap_or(Value::Null),
        }))
    }

    pub async fn broadcaster_connect_transport(
        &self,
        id: &PeerId,
        transport_id: &TransportId,
        ip: std::net::IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
    ) -> Result<(), SignalingError> {
        let broadcaster = self.broadcaster(id)?;
        let transport = broadcaster.transport(transport_id).ok_or_else(|| {
            SignalingError::NotFound(format!("transport with id \"{transport_id}\" not found"))
        })?;

        transport
            .connect(PlainTransportRemoteParameters {
                ip: Some(ip),
                port: Some(port),
                rtcp_port,
                srtp_parameters: None,
            })
            .await
            .map_err(SignalingError::engine)
    }

    pub async fn broadcaster_produce(
        &self,
        id: &PeerId,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        source: crate::protocol::MediaSource,
    ) -> Result<ProducerId, SignalingError> {
        let broadcaster = self.joined_broadcaster(id)?;
        let transport = broadcaster.transport(transport_id).ok_or_else(|| {
            SignalingError::NotFound(format!("transport with id \"{transport_id}\" not found"))
        })?;

        let mut options = ProducerOptions::new(kind, rtp_parameters);
        options.app_data = AppData::new(MediaAppData {
            peer_id: id.clone(),
            source,
        });

        let producer = transport
            .produce(options)
            .await
            .map_err(SignalingError::engine)?;
        broadcaster.add_producer(producer.clone());

        {
            let room = self.clone();
            let source_id = id.clone();
            let producer = producer.clone();
            self.inner
                .executor
                .spawn(async move {
                    room.fan_out_producer(&source_id, producer).await;
                })
                .detach();
        }

        Ok(producer.id())
    }

    pub async fn broadcaster_consume(
        &self,
        id: &PeerId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerId, SignalingError> {
        let broadcaster = self.joined_broadcaster(id)?;
        let transport = broadcaster.transport(transport_id).ok_or_else(|| {
            SignalingError::NotFound(format!("transport with id \"{transport_id}\" not found"))
        })?;

        let producer = self
            .inner
            .shared
            .lock()
            .observed_producers
            .get(producer_id)
            .and_then(WeakProducer::upgrade)
            .ok_or_else(|| {
                SignalingError::NotFound(format!("producer with id \"{producer_id}\" not found"))
            })?;

        if !self
            .inner
            .consumer_router
            .can_consume(producer_id, &rtp_capabilities)
        {
            return Err(SignalingError::Unsupported(format!(
                "cannot consume producer \"{producer_id}\" with the given capabilities"
            )));
        }

        let app_data = producer.app_data().downcast_ref::<MediaAppData>().cloned();

        let mut options = ConsumerOptions::new(*producer_id, rtp_capabilities);
        options.paused = paused;
        if let Some(app_data) = app_data {
            options.app_data = AppData::new(app_data);
        }

        let consumer = transport
            .consume(options)
            .await
            .map_err(SignalingError::engine)?;
        broadcaster.add_consumer(consumer.clone());

        let consumer_id = consumer.id();
        consumer
            .on_producer_close({
                let broadcaster_weak = broadcaster.downgrade();
                move || {
                    if let Some(broadcaster) = broadcaster_weak.upgrade() {
                        broadcaster.remove_consumer(&consumer_id);
                    }
                }
            })
            .detach();
        consumer
            .on_transport_close({
                let broadcaster_weak = broadcaster.downgrade();
                move || {
                    if let Some(broadcaster) = broadcaster_weak.upgrade() {
                        broadcaster.remove_consumer(&consumer_id);
                    }
                }
            })
            .detach();

        Ok(consumer_id)
    }

    pub async fn broadcaster_resume_consumer(
        &self,
        id: &PeerId,
        consumer_id: &ConsumerId,
    ) -> Result<(), SignalingError> {
        let broadcaster = self.joined_broadcaster(id)?;
        let consumer = broadcaster.consumer(consumer_id).ok_or_else(|| {
            SignalingError::NotFound(format!("consumer with id \"{consumer_id}\" not found"))
        })?;

        consumer.resume().await.map_err(SignalingError::engine)
    }
}

/// Non-owning room handle for engine event subscriptions.
#[derive(Clone)]
pub struct WeakRoom {
    inner: Weak<Inner>,
}

impl WeakRoom {
    pub fn upgrade(&self) -> Option<Room> {
        self.inner.upgrade().map(|inner| Room { inner })
    }
}

/// Subscribe to new producers on one transport of the producer router,
/// keeping the room's producer registry and the audio observers fed.
fn observe_transport_producers(
    room_weak: &WeakRoom,
    subscribe: impl FnOnce(Arc<dyn Fn(&Producer) + Send + Sync + 'static>) -> HandlerId,
) {
    let room_weak = room_weak.clone();

    subscribe(Arc::new(move |producer| {
        let Some(room) = room_weak.upgrade() else {
            return;
        };
        let producer_id = producer.id();

        room.inner
            .shared
            .lock()
            .observed_producers
            .insert(producer_id, producer.downgrade());

        producer
            .on_close({
                let room_weak = room_weak.clone();
                move || {
                    if let Some(room) = room_weak.upgrade() {
                        room.inner
                            .shared
                            .lock()
                            .observed_producers
                            .remove(&producer_id);
                    }
                }
            })
            .detach();

        // Only audio producers feed the speaker observers; failures are
        // swallowed, the observer layer tolerates missing entries.
        if producer.kind() == MediaKind::Audio {
            let audio_level_observer = room.inner.audio_level_observer.clone();
            let active_speaker_observer = room.inner.active_speaker_observer.clone();
            room.inner
                .executor
                .spawn(async move {
                    if let Err(error) = audio_level_observer
                        .add_producer(RtpObserverAddProducerOptions::new(producer_id))
                        .await
                    {
                        debug!("failed to add producer to audio level observer: {error}");
                    }
                    if let Err(error) = active_speaker_observer
                        .add_producer(RtpObserverAddProducerOptions::new(producer_id))
                        .await
                    {
                        debug!("failed to add producer to active speaker observer: {error}");
                    }
                })
                .detach();
        }
    }))
    .detach();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::SessionCommand;
    use actix::{Actor, Context, Handler};

    struct NullSession;

    impl Actor for NullSession {
        type Context = Context<Self>;
    }

    impl Handler<SessionCommand> for NullSession {
        type Result = ();

        fn handle(&mut self, _command: SessionCommand, _ctx: &mut Self::Context) {}
    }

    fn peer(id: &str) -> Peer {
        Peer::new(
            PeerId::from(id.to_string()),
            "127.0.0.1:1234".to_string(),
            NullSession.start().recipient(),
        )
    }

    fn broadcaster(id: &str) -> Broadcaster {
        Broadcaster::new(
            PeerId::from(id.to_string()),
            "Automation".to_string(),
            Value::Null,
        )
    }

    #[actix_rt::test]
    async fn peer_id_is_unique_across_all_registries() {
        let mut registries = PeerRegistries::default();

        registries.insert_joining_peer(peer("alice")).unwrap();
        assert!(registries.insert_joining_peer(peer("alice")).is_err());
        assert!(registries.insert_joining_broadcaster(broadcaster("alice")).is_err());

        registries.promote_peer(&PeerId::from("alice".to_string())).unwrap();
        assert!(registries.insert_joining_peer(peer("alice")).is_err());
    }

    #[actix_rt::test]
    async fn take_reports_whether_the_peer_had_joined() {
        let mut registries = PeerRegistries::default();
        let alice = PeerId::from("alice".to_string());
        let bob = PeerId::from("bob".to_string());

        registries.insert_joining_peer(peer("alice")).unwrap();
        registries.insert_joining_peer(peer("bob")).unwrap();
        registries.promote_peer(&alice).unwrap();

        assert!(matches!(
            registries.take(&alice),
            Some(RegistryEntry::Peer { joined: true, .. })
        ));
        assert!(matches!(
            registries.take(&bob),
            Some(RegistryEntry::Peer { joined: false, .. })
        ));
        assert!(registries.take(&alice).is_none());
    }

    #[actix_rt::test]
    async fn broadcasters_do_not_count_towards_liveness() {
        let mut registries = PeerRegistries::default();
        let alice = PeerId::from("alice".to_string());

        registries.insert_joining_broadcaster(broadcaster("rtp-bot")).unwrap();
        registries
            .promote_broadcaster(&PeerId::from("rtp-bot".to_string()))
            .unwrap();
        assert_eq!(registries.live_peer_count(), 0);

        registries.insert_joining_peer(peer("alice")).unwrap();
        assert_eq!(registries.live_peer_count(), 1);

        registries.promote_peer(&alice).unwrap();
        assert_eq!(registries.live_peer_count(), 1);

        registries.take(&alice);
        assert_eq!(registries.live_peer_count(), 0);
    }

    #[actix_rt::test]
    async fn take_broadcaster_never_touches_interactive_peers() {
        let mut registries = PeerRegistries::default();
        let alice = PeerId::from("alice".to_string());
        let bot_id = PeerId::from("rtp-bot".to_string());

        registries.insert_joining_peer(peer("alice")).unwrap();
        registries
            .insert_joining_broadcaster(broadcaster("rtp-bot"))
            .unwrap();

        assert!(registries.take_broadcaster(&alice).is_none());
        assert!(registries.contains(&alice));

        assert!(registries.take_broadcaster(&bot_id).is_some());
        assert!(!registries.contains(&bot_id));

        registries.promote_peer(&alice).unwrap();
        assert!(registries.take_broadcaster(&alice).is_none());
        assert!(registries.contains(&alice));
    }

    #[actix_rt::test]
    async fn promote_requires_the_joining_state() {
        let mut registries = PeerRegistries::default();
        let alice = PeerId::from("alice".to_string());

        assert!(registries.promote_peer(&alice).is_none());

        registries.insert_joining_peer(peer("alice")).unwrap();
        assert!(registries.promote_peer(&alice).is_some());
        // A second promotion has nothing left to move.
        assert!(registries.promote_peer(&alice).is_none());
    }
}
