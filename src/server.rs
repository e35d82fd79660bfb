//! Top-level supervisor.
//!
//! Owns the worker pool (one mediasoup worker + WebRTC server per slot), the
//! room map, and the throttle coordinator. Room creation is serialized
//! through a single async mutex held across the whole creation, which gives
//! FIFO ordering and exactly-once semantics per room id: two concurrent
//! callers asking for the same id observe one creation.

use crate::config::Config;
use crate::error::SignalingError;
use crate::room::{Room, RoomId};
use crate::throttle::{NetworkShaper, ThrottleCoordinator};
use async_executor::Executor;
use async_lock::Mutex as AsyncMutex;
use event_listener_primitives::{Bag, BagOnce, HandlerId};
use futures_lite::future;
use log::{debug, error, info};
use mediasoup::prelude::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One worker of the pool together with the WebRTC server bound to its slot
/// port (base port + slot index).
#[derive(Clone)]
pub struct WorkerSlot {
    pub index: usize,
    pub worker: Worker,
    pub webrtc_server: WebRtcServer,
}

#[derive(Default)]
struct Handlers {
    new_room: Bag<Arc<dyn Fn(&Room) + Send + Sync>, Room>,
    died: BagOnce<Box<dyn FnOnce() + Send>>,
}

struct Inner {
    config: Arc<Config>,
    executor: Arc<Executor<'static>>,
    // Dropped together with the server, which stops the executor thread.
    _stop_sender: async_oneshot::Sender<()>,
    _worker_manager: WorkerManager,
    slots: Vec<WorkerSlot>,
    cursor: parking_lot::Mutex<usize>,
    rooms: AsyncMutex<HashMap<RoomId, Room>>,
    stopped: AtomicBool,
    throttle: ThrottleCoordinator,
    handlers: Handlers,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub async fn new(
        config: Config,
        shaper: Box<dyn NetworkShaper>,
    ) -> Result<Self, SignalingError> {
        let config = Arc::new(config);

        // Engine-side background work (fan-out continuations, close
        // cascades) runs on its own executor thread.
        let executor = Arc::new(Executor::new());
        let (stop_sender, stop_receiver) = async_oneshot::oneshot::<()>();
        std::thread::spawn({
            let executor = Arc::clone(&executor);

            move || {
                let _ = future::block_on(executor.run(stop_receiver));
            }
        });

        let worker_manager = WorkerManager::new();
        let num_workers = config.mediasoup.num_workers.max(1);
        let mut slots = Vec::with_capacity(num_workers);

        for index in 0..num_workers {
            let worker = worker_manager
                .create_worker(config.mediasoup.worker_settings.worker_settings())
                .await
                .map_err(SignalingError::engine)?;

            let mut listen_infos = config
                .mediasoup
                .webrtc_server_options
                .listen_infos
                .iter()
                .map(|info| info.listen_info(index as u16));
            let first = listen_infos.next().ok_or_else(|| {
                SignalingError::Server("no WebRTC server listen infos configured".to_string())
            })?;
            let listen_infos = listen_infos
                .fold(WebRtcServerListenInfos::new(first), |infos, info| {
                    infos.insert(info)
                });

            let webrtc_server = worker
                .create_webrtc_server(WebRtcServerOptions::new(listen_infos))
                .await
                .map_err(SignalingError::engine)?;

            debug!("worker {index} launched");

            slots.push(WorkerSlot {
                index,
                worker,
                webrtc_server,
            });
        }

        let server = Self {
            inner: Arc::new(Inner {
                config,
                executor,
                _stop_sender: stop_sender,
                _worker_manager: worker_manager,
                slots,
                cursor: parking_lot::Mutex::new(0),
                rooms: AsyncMutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                throttle: ThrottleCoordinator::from_env(shaper),
                handlers: Handlers::default(),
            }),
        };

        for slot in &server.inner.slots {
            let index = slot.index;
            slot.worker
                .on_dead({
                    let inner_weak = Arc::downgrade(&server.inner);

                    move |reason| {
                        error!("worker {index} died: {reason:?}");
                        if let Some(inner) = inner_weak.upgrade() {
                            Server { inner }.handle_worker_death();
                        }
                    }
                })
                .detach();
        }

        info!("server started with {num_workers} workers");

        Ok(server)
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn throttle(&self) -> &ThrottleCoordinator {
        &self.inner.throttle
    }

    /// Resolve a room, creating it on demand. Creation is serialized; the
    /// arguments only matter for the caller that actually creates the room.
    pub async fn get_or_create_room(
        &self,
        room_id: RoomId,
        consumer_replicas: u32,
        use_pipe_transports: bool,
    ) -> Result<Room, SignalingError> {
        let mut rooms = self.inner.rooms.lock().await;

        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SignalingError::InvalidState(
                "server is shutting down".to_string(),
            ));
        }

        if let Some(room) = rooms.get(&room_id) {
            return Ok(room.clone());
        }

        let slots = self.pick_slots(use_pipe_transports)?;
        let room = Room::new(
            room_id.clone(),
            slots,
            consumer_replicas,
            use_pipe_transports,
            Arc::clone(&self.inner.config),
            Arc::clone(&self.inner.executor),
            self.inner.throttle.clone(),
        )
        .await?;

        rooms.insert(room_id.clone(), room.clone());

        room.on_close({
            let inner_weak = Arc::downgrade(&self.inner);
            let room_id = room_id.clone();

            move || {
                if let Some(inner) = inner_weak.upgrade() {
                    let executor = Arc::clone(&inner.executor);
                    executor
                        .spawn(async move {
                            inner.rooms.lock().await.remove(&room_id);
                            inner.throttle.release_room(&room_id).await;
                        })
                        .detach();
                }
            }
        })
        .detach();

        self.inner.handlers.new_room.call_simple(&room);

        Ok(room)
    }

    /// Look up an existing room without creating one.
    pub async fn room(&self, room_id: &RoomId) -> Option<Room> {
        self.inner.rooms.lock().await.get(room_id).cloned()
    }

    fn pick_slots(&self, use_pipe_transports: bool) -> Result<Vec<WorkerSlot>, SignalingError> {
        let mut cursor = self.inner.cursor.lock();
        let indices = pick_slot_indices(&mut cursor, self.inner.slots.len(), use_pipe_transports)?;

        Ok(indices
            .into_iter()
            .map(|index| self.inner.slots[index].clone())
            .collect())
    }

    /// A dead worker is fatal: every room closes, the scheduler refuses new
    /// work, and `died` fires for the process-level caller.
    fn handle_worker_death(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let server = self.clone();
        self.inner
            .executor
            .spawn(async move {
                let rooms: Vec<Room> = server
                    .inner
                    .rooms
                    .lock()
                    .await
                    .drain()
                    .map(|(_, room)| room)
                    .collect();

                for room in rooms {
                    room.close();
                }

                server.inner.handlers.died.call_simple();
            })
            .detach();
    }

    pub fn on_new_room<F: Fn(&Room) + Send + Sync + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.new_room.add(Arc::new(callback))
    }

    pub fn on_died<F: FnOnce() + Send + 'static>(&self, callback: F) -> HandlerId {
        self.inner.handlers.died.add(Box::new(callback))
    }
}

/// Advance the rotating cursor and return the slot indices for a new room:
/// one slot normally, two consecutive slots in pipe mode. Pipe mode needs at
/// least two workers.
fn pick_slot_indices(
    cursor: &mut usize,
    slot_count: usize,
    use_pipe_transports: bool,
) -> Result<Vec<usize>, SignalingError> {
    if slot_count == 0 {
        return Err(SignalingError::Server("no workers available".to_string()));
    }
    if use_pipe_transports && slot_count < 2 {
        return Err(SignalingError::InvalidState(
            "pipe transports require at least two workers".to_string(),
        ));
    }

    let count = if use_pipe_transports { 2 } else { 1 };
    let indices = (0..count)
        .map(|_| {
            let index = *cursor % slot_count;
            *cursor = (*cursor + 1) % slot_count;
            index
        })
        .collect();

    Ok(indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_rotates_and_wraps() {
        let mut cursor = 0;

        assert_eq!(pick_slot_indices(&mut cursor, 3, false).unwrap(), vec![0]);
        assert_eq!(pick_slot_indices(&mut cursor, 3, false).unwrap(), vec![1]);
        assert_eq!(pick_slot_indices(&mut cursor, 3, false).unwrap(), vec![2]);
        assert_eq!(pick_slot_indices(&mut cursor, 3, false).unwrap(), vec![0]);
    }

    #[test]
    fn pipe_mode_draws_two_consecutive_slots() {
        let mut cursor = 2;

        assert_eq!(
            pick_slot_indices(&mut cursor, 3, true).unwrap(),
            vec![2, 0]
        );
        assert_eq!(
            pick_slot_indices(&mut cursor, 3, true).unwrap(),
            vec![1, 2]
        );
    }

    #[test]
    fn pipe_mode_requires_two_workers() {
        let mut cursor = 0;

        let result = pick_slot_indices(&mut cursor, 1, true);

        assert!(matches!(result, Err(SignalingError::InvalidState(_))));
        // The cursor did not move.
        assert_eq!(cursor, 0);
    }
}
