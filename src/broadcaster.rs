//! Automation participants driven by the HTTP API.
//!
//! A broadcaster is a peer without a message channel: it holds plain RTP
//! transports instead of WebRTC ones, joins through an explicit HTTP call
//! rather than a timed request, and never counts towards room liveness.

use crate::peer::PeerId;
use crate::protocol::PeerInfo;
use log::debug;
use mediasoup::prelude::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

struct Shared {
    transports: HashMap<TransportId, PlainTransport>,
    producers: HashMap<ProducerId, Producer>,
    consumers: HashMap<ConsumerId, Consumer>,
}

struct Inner {
    id: PeerId,
    display_name: String,
    device: Value,
    joined: AtomicBool,
    closed: AtomicBool,
    shared: Mutex<Shared>,
}

#[derive(Clone)]
pub struct Broadcaster {
    inner: Arc<Inner>,
}

impl fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broadcaster")
            .field("id", &self.inner.id)
            .field("joined", &self.inner.joined)
            .finish()
    }
}

impl Broadcaster {
    pub fn new(id: PeerId, display_name: String, device: Value) -> Self {
        debug!("new broadcaster {id}");

        Self {
            inner: Arc::new(Inner {
                id,
                display_name,
                device,
                joined: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shared: Mutex::new(Shared {
                    transports: HashMap::new(),
                    producers: HashMap::new(),
                    consumers: HashMap::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.inner.id
    }

    pub fn joined(&self) -> bool {
        self.inner.joined.load(Ordering::SeqCst)
    }

    pub fn set_joined(&self) {
        self.inner.joined.store(true, Ordering::SeqCst);
    }

    pub fn closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            id: self.inner.id.clone(),
            display_name: self.inner.display_name.clone(),
            device: self.inner.device.clone(),
        }
    }

    pub fn add_transport(&self, transport: PlainTransport) {
        self.inner
            .shared
            .lock()
            .transports
            .insert(transport.id(), transport);
    }

    pub fn transport(&self, transport_id: &TransportId) -> Option<PlainTransport> {
        self.inner.shared.lock().transports.get(transport_id).cloned()
    }

    pub fn add_producer(&self, producer: Producer) {
        self.inner
            .shared
            .lock()
            .producers
            .insert(producer.id(), producer);
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

    /// Drop every engine object owned by this broadcaster. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            debug!("broadcaster {} closed", self.inner.id);

            let mut shared = self.inner.shared.lock();
            shared.consumers.clear();
            shared.producers.clear();
            shared.transports.clear();
        }
    }

    pub fn downgrade(&self) -> WeakBroadcaster {
        WeakBroadcaster {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Non-owning broadcaster handle for engine event subscriptions.
#[derive(Clone)]
pub struct WeakBroadcaster {
    inner: std::sync::Weak<Inner>,
}

impl WeakBroadcaster {
    pub fn upgrade(&self) -> Option<Broadcaster> {
        self.inner.upgrade().map(|inner| Broadcaster { inner })
    }
}
