//! Per-room chat bot.
//!
//! The bot is a direct-transport data producer that every joined peer
//! consumes. Data producers created by peers are routed into the bot over
//! the same direct transport; each text message is echoed back through the
//! bot's own data producer (and from there fanned out to every consuming
//! peer). The bot has no close method of its own, its engine objects go
//! away when the room's routers close.

use crate::error::SignalingError;
use crate::peer::WeakPeer;
use crate::protocol::{DataAppData, DataChannel};
use log::{debug, warn};
use mediasoup::prelude::*;
use parking_lot::Mutex;
use std::borrow::Cow;
use std::sync::Arc;

struct Inner {
    transport: DirectTransport,
    data_producer: DataProducer,
    // Data consumers reading from peers; kept here so they stay alive for
    // as long as the room does.
    data_consumers: Mutex<Vec<DataConsumer>>,
}

#[derive(Clone)]
pub struct Bot {
    inner: Arc<Inner>,
}

impl Bot {
    pub async fn new(router: &Router) -> Result<Self, SignalingError> {
        let transport = router
            .create_direct_transport(DirectTransportOptions::default())
            .await
            .map_err(SignalingError::engine)?;

        let mut options = DataProducerOptions::new_direct();
        options.label = DataChannel::Bot.label().to_string();
        options.app_data = AppData::new(DataAppData {
            peer_id: None,
            channel: DataChannel::Bot,
        });

        let data_producer = transport
            .produce_data(options)
            .await
            .map_err(SignalingError::engine)?;

        debug!("bot data producer created [dataProducerId:{}]", data_producer.id());

        Ok(Self {
            inner: Arc::new(Inner {
                transport,
                data_producer,
                data_consumers: Mutex::new(Vec::new()),
            }),
        })
    }

    /// The data producer peers consume the bot through.
    pub fn data_producer(&self) -> DataProducer {
        self.inner.data_producer.clone()
    }

    /// Consume a peer's data producer over the direct transport and start
    /// echoing its text messages. Only string payloads (SCTP PPID 51) are
    /// answered, anything else is ignored.
    pub async fn handle_peer_data_producer(
        &self,
        data_producer_id: DataProducerId,
        peer: WeakPeer,
    ) -> Result<(), SignalingError> {
        let data_consumer = self
            .inner
            .transport
            .consume_data(DataConsumerOptions::new_direct(data_producer_id, None))
            .await
            .map_err(SignalingError::engine)?;

        data_consumer
            .on_message({
                let inner_weak = Arc::downgrade(&self.inner);

                move |message| match message {
                    WebRtcMessage::String(payload) => {
                        let Some(inner) = inner_weak.upgrade() else {
                            return;
                        };
                        let Some(peer) = peer.upgrade() else {
                            return;
                        };

                        let text = String::from_utf8_lossy(payload);
                        let reply = format!("{} told me: '{}'", peer.display_name(), text);

                        if let DataProducer::Direct(direct) = &inner.data_producer {
                            if let Err(error) =
                                direct.send(WebRtcMessage::String(Cow::Owned(reply.into_bytes())), None, None)
                            {
                                warn!("bot failed to send message: {error}");
                            }
                        }
                    }
                    _ => {}
                }
            })
            .detach();

        self.inner.data_consumers.lock().push(data_consumer);

        Ok(())
    }
}
