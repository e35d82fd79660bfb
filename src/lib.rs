//! Signaling and orchestration core of a multiparty conferencing service.
//!
//! Interactive participants connect over a WebSocket request/notification
//! protocol, automation participants (RTP broadcasters) over a plain HTTP
//! API. Both are grouped into [`room::Room`]s which own a pair of mediasoup
//! routers and coordinate transports, producers and consumers inside the
//! media engine.

pub mod bot;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod room;
pub mod server;
pub mod signaling;
pub mod throttle;
