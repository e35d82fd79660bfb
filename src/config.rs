//! Server configuration.
//!
//! Configuration is read from the JSON file named by the `CONFIG_FILE`
//! environment variable; every section has deployment defaults so a missing
//! file (or a partial one) still yields a working local setup.

use log::warn;
use mediasoup::data_structures::{ListenInfo, Protocol};
use mediasoup::prelude::*;
use mediasoup::rtp_parameters::RtpCodecParametersParametersValue;
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel, WorkerLogTag};
use serde::Deserialize;
use std::env;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Expected value of the `Origin` header on every HTTP request and
    /// WebSocket upgrade.
    pub domain: String,
    pub http: HttpConfig,
    pub mediasoup: MediasoupConfig,
    pub webrtc_transport_options: WebRtcTransportConfig,
    pub plain_transport_options: PlainTransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            http: HttpConfig::default(),
            mediasoup: MediasoupConfig::default(),
            webrtc_transport_options: WebRtcTransportConfig::default(),
            plain_transport_options: PlainTransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: 4443,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MediasoupConfig {
    /// Number of mediasoup workers launched at boot.
    pub num_workers: usize,
    pub worker_settings: WorkerConfig,
    pub router_options: RouterConfig,
    pub webrtc_server_options: WebRtcServerConfig,
}

impl Default for MediasoupConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            worker_settings: WorkerConfig::default(),
            router_options: RouterConfig::default(),
            webrtc_server_options: WebRtcServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub log_level: String,
    pub log_tags: Vec<String>,
    pub dtls_certificate_file: Option<PathBuf>,
    pub dtls_private_key_file: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_tags: vec![
                "info".to_string(),
                "ice".to_string(),
                "dtls".to_string(),
                "rtp".to_string(),
                "srtp".to_string(),
                "rtcp".to_string(),
            ],
            dtls_certificate_file: None,
            dtls_private_key_file: None,
        }
    }
}

impl WorkerConfig {
    /// Build engine worker settings out of the configured strings. Unknown
    /// log tags are skipped with a warning rather than rejected, so a config
    /// written for a different engine version still boots.
    pub fn worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = match self.log_level.as_str() {
            "debug" => WorkerLogLevel::Debug,
            "warn" => WorkerLogLevel::Warn,
            "error" => WorkerLogLevel::Error,
            "none" => WorkerLogLevel::None,
            other => {
                warn!("unknown worker log level \"{other}\", using \"warn\"");
                WorkerLogLevel::Warn
            }
        };

        settings.log_tags = self
            .log_tags
            .iter()
            .filter_map(|tag| match tag.as_str() {
                "info" => Some(WorkerLogTag::Info),
                "ice" => Some(WorkerLogTag::Ice),
                "dtls" => Some(WorkerLogTag::Dtls),
                "rtp" => Some(WorkerLogTag::Rtp),
                "srtp" => Some(WorkerLogTag::Srtp),
                "rtcp" => Some(WorkerLogTag::Rtcp),
                "rtx" => Some(WorkerLogTag::Rtx),
                "bwe" => Some(WorkerLogTag::Bwe),
                "score" => Some(WorkerLogTag::Score),
                "simulcast" => Some(WorkerLogTag::Simulcast),
                "svc" => Some(WorkerLogTag::Svc),
                "sctp" => Some(WorkerLogTag::Sctp),
                "message" => Some(WorkerLogTag::Message),
                other => {
                    warn!("unknown worker log tag \"{other}\", skipping");
                    None
                }
            })
            .collect();

        if let (Some(certificate), Some(private_key)) = (
            self.dtls_certificate_file.clone(),
            self.dtls_private_key_file.clone(),
        ) {
            settings.dtls_files = Some(WorkerDtlsFiles {
                certificate,
                private_key,
            });
        }

        settings
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    #[serde(default = "media_codecs")]
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: media_codecs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebRtcServerConfig {
    /// One listen info per protocol; the port is incremented by the worker
    /// slot index so every worker's WebRTC server binds its own port.
    pub listen_infos: Vec<ListenInfoConfig>,
}

impl Default for WebRtcServerConfig {
    fn default() -> Self {
        Self {
            listen_infos: vec![
                ListenInfoConfig {
                    protocol: "udp".to_string(),
                    ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    announced_address: None,
                    port: 44444,
                },
                ListenInfoConfig {
                    protocol: "tcp".to_string(),
                    ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    announced_address: None,
                    port: 44444,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenInfoConfig {
    pub protocol: String,
    pub ip: IpAddr,
    pub announced_address: Option<String>,
    pub port: u16,
}

impl ListenInfoConfig {
    /// Port 0 means "let the engine pick"; a configured port is shifted by
    /// the worker slot index.
    pub fn listen_info(&self, port_increment: u16) -> ListenInfo {
        ListenInfo {
            protocol: if self.protocol == "tcp" {
                Protocol::Tcp
            } else {
                Protocol::Udp
            },
            ip: self.ip,
            announced_address: self.announced_address.clone(),
            expose_internal_ip: false,
            port: if self.port == 0 {
                None
            } else {
                Some(self.port + port_increment)
            },
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebRtcTransportConfig {
    pub initial_available_outgoing_bitrate: u32,
    /// Carried for operators; the engine exposes no setter for a minimum,
    /// the initial bitrate above is the knob that is actually applied.
    pub minimum_available_outgoing_bitrate: u32,
    pub max_sctp_message_size: u32,
    /// Applied with `set_max_incoming_bitrate()` after transport creation.
    pub max_incoming_bitrate: Option<u32>,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            initial_available_outgoing_bitrate: 1_000_000,
            minimum_available_outgoing_bitrate: 600_000,
            max_sctp_message_size: 262_144,
            max_incoming_bitrate: Some(1_500_000),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlainTransportConfig {
    pub listen_info: ListenInfoConfig,
    pub max_sctp_message_size: u32,
}

impl Default for PlainTransportConfig {
    fn default() -> Self {
        Self {
            listen_info: ListenInfoConfig {
                protocol: "udp".to_string(),
                ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                announced_address: None,
                port: 0,
            },
            max_sctp_message_size: 262_144,
        }
    }
}

impl Config {
    /// Load configuration from the file named by `CONFIG_FILE`, falling back
    /// to defaults when the variable is unset. A present but unreadable or
    /// invalid file is an error: silently running with defaults in that case
    /// would hide a deployment mistake.
    pub fn load() -> Result<Self, String> {
        match env::var("CONFIG_FILE") {
            Ok(path) => {
                let contents = fs::read_to_string(&path)
                    .map_err(|error| format!("failed to read config file {path}: {error}"))?;
                serde_json::from_str(&contents)
                    .map_err(|error| format!("failed to parse config file {path}: {error}"))
            }
            Err(_) => Ok(Self::default()),
        }
    }
}

/// Media codecs accepted from clients, in preference order.
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(48000).unwrap(),
            channels: NonZeroU8::new(2).unwrap(),
            parameters: RtpCodecParametersParameters::from([("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::from([(
                "x-google-start-bitrate",
                1000_u32.into(),
            )]),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp9,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::from([(
                "x-google-start-bitrate",
                1000_u32.into(),
            )]),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: None,
            clock_rate: NonZeroU32::new(90000).unwrap(),
            parameters: RtpCodecParametersParameters::from([
                ("packetization-mode", 1_u32.into()),
                (
                    "profile-level-id",
                    RtpCodecParametersParametersValue::String("42e01f".to_string()),
                ),
                ("level-asymmetry-allowed", 1_u32.into()),
                ("x-google-start-bitrate", 1000_u32.into()),
            ]),
            rtcp_feedback: vec![
                RtcpFeedback::Nack,
                RtcpFeedback::NackPli,
                RtcpFeedback::CcmFir,
                RtcpFeedback::GoogRemb,
                RtcpFeedback::TransportCc,
            ],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::default();

        assert_eq!(config.domain, "localhost");
        assert!(config.mediasoup.num_workers >= 1);
        assert!(!config.mediasoup.router_options.media_codecs.is_empty());
        assert_eq!(config.http.listen_port, 4443);
    }

    #[test]
    fn listen_info_port_increments_per_worker() {
        let config = WebRtcServerConfig::default();

        let first = config.listen_infos[0].listen_info(0);
        let third = config.listen_infos[0].listen_info(2);

        assert_eq!(first.port, Some(44444));
        assert_eq!(third.port, Some(44446));
    }

    #[test]
    fn unknown_log_tags_are_skipped() {
        let worker_config = WorkerConfig {
            log_tags: vec!["ice".to_string(), "no-such-tag".to_string()],
            ..WorkerConfig::default()
        };

        let settings = worker_config.worker_settings();

        assert_eq!(settings.log_tags, vec![WorkerLogTag::Ice]);
    }

    #[test]
    fn partial_config_file_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{ "domain": "conference.example.com" }"#).unwrap();

        assert_eq!(config.domain, "conference.example.com");
        assert_eq!(config.http.listen_port, 4443);
    }
}
