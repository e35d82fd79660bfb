//! Process-wide network throttle coordinator.
//!
//! A single network shaper (the `throttle` CLI) is shared by the whole
//! process, so start/stop operations are serialized through one async mutex
//! and gated behind a shared secret configured out-of-band via the
//! `NETWORK_THROTTLE_SECRET` environment variable. The coordinator records
//! which room enabled the shaper and releases it when that room closes.

use crate::error::SignalingError;
use crate::room::RoomId;
use async_lock::Mutex as AsyncMutex;
use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shaping profile applied to the host network stack. Values follow the
/// `throttle` CLI conventions: kbps for rates, milliseconds for rtt, percent
/// for packet loss.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottleProfile {
    pub uplink: Option<u32>,
    pub downlink: Option<u32>,
    pub rtt: Option<u32>,
    pub packet_loss: Option<u32>,
}

/// The external shaper. Production uses [`ThrottleCli`]; tests substitute a
/// recording mock.
#[async_trait]
pub trait NetworkShaper: Send + Sync {
    async fn start(&self, profile: &ThrottleProfile) -> Result<(), String>;

    /// Stop shaping. `localhost` selects the loopback-scoped ruleset.
    async fn stop(&self, localhost: bool) -> Result<(), String>;
}

/// Shells out to the `throttle` CLI.
pub struct ThrottleCli;

#[async_trait]
impl NetworkShaper for ThrottleCli {
    async fn start(&self, profile: &ThrottleProfile) -> Result<(), String> {
        let mut command = async_process::Command::new("throttle");
        if let Some(uplink) = profile.uplink {
            command.arg("--up").arg(uplink.to_string());
        }
        if let Some(downlink) = profile.downlink {
            command.arg("--down").arg(downlink.to_string());
        }
        if let Some(rtt) = profile.rtt {
            command.arg("--rtt").arg(rtt.to_string());
        }
        if let Some(packet_loss) = profile.packet_loss {
            command.arg("--packetLoss").arg(packet_loss.to_string());
        }

        run(command).await
    }

    async fn stop(&self, localhost: bool) -> Result<(), String> {
        let mut command = async_process::Command::new("throttle");
        if localhost {
            command.arg("--localhost");
        }
        command.arg("--stop");

        run(command).await
    }
}

async fn run(mut command: async_process::Command) -> Result<(), String> {
    let status = command
        .status()
        .await
        .map_err(|error| format!("failed to spawn throttle: {error}"))?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("throttle exited with {status}"))
    }
}

#[derive(Debug, Default, Clone)]
struct ThrottleState {
    enabled: bool,
    enabled_by: Option<RoomId>,
}

struct Inner {
    secret: Option<String>,
    shaper: Box<dyn NetworkShaper>,
    // One throttle operation at a time; the async mutex doubles as the FIFO.
    state: AsyncMutex<ThrottleState>,
}

#[derive(Clone)]
pub struct ThrottleCoordinator {
    inner: Arc<Inner>,
}

impl ThrottleCoordinator {
    /// `secret` comes from `NETWORK_THROTTLE_SECRET`; when it is unset the
    /// whole feature is disabled and every request is rejected.
    pub fn new(secret: Option<String>, shaper: Box<dyn NetworkShaper>) -> Self {
        Self {
            inner: Arc::new(Inner {
                secret,
                shaper,
                state: AsyncMutex::new(ThrottleState::default()),
            }),
        }
    }

    pub fn from_env(shaper: Box<dyn NetworkShaper>) -> Self {
        Self::new(std::env::var("NETWORK_THROTTLE_SECRET").ok(), shaper)
    }

    fn check_secret(&self, provided: Option<&str>) -> Result<(), SignalingError> {
        let expected = self.inner.secret.as_deref().ok_or_else(|| {
            SignalingError::Forbidden("network throttle is disabled".to_string())
        })?;

        if provided == Some(expected) {
            Ok(())
        } else {
            Err(SignalingError::Forbidden(
                "wrong network throttle secret".to_string(),
            ))
        }
    }

    /// Apply a shaping profile on behalf of `room_id`. An already enabled
    /// shaper is stopped first.
    pub async fn apply(
        &self,
        room_id: &RoomId,
        secret: Option<&str>,
        profile: &ThrottleProfile,
    ) -> Result<(), SignalingError> {
        self.check_secret(secret)?;

        let mut state = self.inner.state.lock().await;

        if state.enabled {
            if let Err(error) = self.inner.shaper.stop(false).await {
                warn!("failed to stop throttle before restart: {error}");
            }
            state.enabled = false;
            state.enabled_by = None;
        }

        self.inner
            .shaper
            .start(profile)
            .await
            .map_err(SignalingError::Server)?;

        state.enabled = true;
        state.enabled_by = Some(room_id.clone());
        debug!("network throttle enabled by room {room_id} [profile:{profile:?}]");

        Ok(())
    }

    pub async fn stop(&self, secret: Option<&str>) -> Result<(), SignalingError> {
        self.check_secret(secret)?;

        let mut state = self.inner.state.lock().await;
        self.stop_locked(&mut state).await
    }

    /// Disable the shaper and run both stop scopes. On failure the prior
    /// state is restored and the last error surfaced.
    async fn stop_locked(&self, state: &mut ThrottleState) -> Result<(), SignalingError> {
        let prior = state.clone();
        state.enabled = false;
        state.enabled_by = None;

        let mut last_error = None;
        if let Err(error) = self.inner.shaper.stop(false).await {
            last_error = Some(error);
        }
        if let Err(error) = self.inner.shaper.stop(true).await {
            last_error = Some(error);
        }

        match last_error {
            Some(error) => {
                *state = prior;
                Err(SignalingError::Server(error))
            }
            None => {
                debug!("network throttle disabled");
                Ok(())
            }
        }
    }

    /// Called when a room closes. If that room enabled the shaper, stop it
    /// and clear the record; a stop failure is logged but the record is
    /// cleared anyway since the owning room no longer exists.
    pub async fn release_room(&self, room_id: &RoomId) {
        let mut state = self.inner.state.lock().await;

        if state.enabled && state.enabled_by.as_ref() == Some(room_id) {
            if let Err(error) = self.stop_locked(&mut state).await {
                warn!("failed to stop network throttle for closed room {room_id}: {error}");
                state.enabled = false;
                state.enabled_by = None;
            }
        }
    }

    /// Whether the shaper is currently enabled (used by tests and dumps).
    pub async fn enabled(&self) -> bool {
        self.inner.state.lock().await.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_lite::future;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Start,
        Stop { localhost: bool },
    }

    struct MockShaper {
        calls: Mutex<Vec<Call>>,
        fail_stop: Mutex<bool>,
    }

    impl MockShaper {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail_stop: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl NetworkShaper for Arc<MockShaper> {
        async fn start(&self, _profile: &ThrottleProfile) -> Result<(), String> {
            self.calls.lock().push(Call::Start);
            Ok(())
        }

        async fn stop(&self, localhost: bool) -> Result<(), String> {
            self.calls.lock().push(Call::Stop { localhost });
            if *self.fail_stop.lock() {
                Err("tc failed".to_string())
            } else {
                Ok(())
            }
        }
    }

    fn coordinator(shaper: Arc<MockShaper>) -> ThrottleCoordinator {
        ThrottleCoordinator::new(Some("sesame".to_string()), Box::new(shaper))
    }

    #[test]
    fn wrong_secret_is_forbidden_and_state_unchanged() {
        future::block_on(async {
            let shaper = MockShaper::new();
            let coordinator = coordinator(Arc::clone(&shaper));
            let room_id = RoomId::from("r1".to_string());

            let result = coordinator
                .apply(&room_id, Some("nope"), &ThrottleProfile::default())
                .await;

            assert!(matches!(result, Err(SignalingError::Forbidden(_))));
            assert!(!coordinator.enabled().await);
            assert!(shaper.calls.lock().is_empty());
        });
    }

    #[test]
    fn missing_secret_configuration_disables_the_feature() {
        future::block_on(async {
            let shaper = MockShaper::new();
            let coordinator = ThrottleCoordinator::new(None, Box::new(Arc::clone(&shaper)));
            let room_id = RoomId::from("r1".to_string());

            let result = coordinator
                .apply(&room_id, Some("anything"), &ThrottleProfile::default())
                .await;

            assert!(matches!(result, Err(SignalingError::Forbidden(_))));
        });
    }

    #[test]
    fn apply_then_stop_round_trips_to_initial_state() {
        future::block_on(async {
            let shaper = MockShaper::new();
            let coordinator = coordinator(Arc::clone(&shaper));
            let room_id = RoomId::from("r1".to_string());

            coordinator
                .apply(&room_id, Some("sesame"), &ThrottleProfile::default())
                .await
                .unwrap();
            assert!(coordinator.enabled().await);

            coordinator.stop(Some("sesame")).await.unwrap();
            assert!(!coordinator.enabled().await);

            assert_eq!(
                *shaper.calls.lock(),
                vec![
                    Call::Start,
                    Call::Stop { localhost: false },
                    Call::Stop { localhost: true },
                ]
            );
        });
    }

    #[test]
    fn reapply_stops_previous_shaping_first() {
        future::block_on(async {
            let shaper = MockShaper::new();
            let coordinator = coordinator(Arc::clone(&shaper));
            let room_id = RoomId::from("r1".to_string());

            let profile = ThrottleProfile {
                uplink: Some(1000),
                ..ThrottleProfile::default()
            };
            coordinator
                .apply(&room_id, Some("sesame"), &profile)
                .await
                .unwrap();
            coordinator
                .apply(&room_id, Some("sesame"), &profile)
                .await
                .unwrap();

            assert_eq!(
                *shaper.calls.lock(),
                vec![Call::Start, Call::Stop { localhost: false }, Call::Start]
            );
        });
    }

    #[test]
    fn stop_failure_restores_prior_state() {
        future::block_on(async {
            let shaper = MockShaper::new();
            let coordinator = coordinator(Arc::clone(&shaper));
            let room_id = RoomId::from("r1".to_string());

            coordinator
                .apply(&room_id, Some("sesame"), &ThrottleProfile::default())
                .await
                .unwrap();
            *shaper.fail_stop.lock() = true;

            let result = coordinator.stop(Some("sesame")).await;

            assert!(matches!(result, Err(SignalingError::Server(_))));
            assert!(coordinator.enabled().await);
        });
    }

    #[test]
    fn closing_the_enabling_room_releases_the_throttle() {
        future::block_on(async {
            let shaper = MockShaper::new();
            let coordinator = coordinator(Arc::clone(&shaper));
            let room_id = RoomId::from("r1".to_string());
            let other_room = RoomId::from("r2".to_string());

            coordinator
                .apply(&room_id, Some("sesame"), &ThrottleProfile::default())
                .await
                .unwrap();

            coordinator.release_room(&other_room).await;
            assert!(coordinator.enabled().await);

            coordinator.release_room(&room_id).await;
            assert!(!coordinator.enabled().await);
        });
    }
}
