//! Client configuration.
//!
//! Loaded from environment variables with defaults matching the relay's
//! stock deployment.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::media::{MediaConstraints, VideoConstraints};
use crate::signaling::{ReconnectPolicy, RequestPolicy};

pub const DEFAULT_SERVER_URL: &str = "ws://127.0.0.1:3001";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_DELAY_MAX_MS: u64 = 5_000;
pub const DEFAULT_RECONNECT_JITTER: f64 = 0.5;
pub const DEFAULT_ICE_SERVERS: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay websocket URL.
    pub server_url: String,
    pub request_timeout: Duration,
    /// Retries after a timed-out request (0 = single attempt).
    pub request_retries: u32,
    pub retry_backoff: Duration,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
    /// Randomization factor in `[0, 1]` applied to every reconnection delay.
    pub reconnect_jitter: f64,
    /// ICE server URLs appended to every transport's parameters.
    pub ice_servers: Vec<String>,
    /// `None` disables transport statistics polling.
    pub stats_interval: Option<Duration>,
    pub media: MediaConstraints,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            request_retries: DEFAULT_REQUEST_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            reconnect_delay: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MS),
            reconnect_delay_max: Duration::from_millis(DEFAULT_RECONNECT_DELAY_MAX_MS),
            reconnect_jitter: DEFAULT_RECONNECT_JITTER,
            ice_servers: split_list(DEFAULT_ICE_SERVERS),
            stats_interval: Some(Duration::from_millis(DEFAULT_STATS_INTERVAL_MS)),
            media: MediaConstraints::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let server_url = vars
            .get("MEET_SERVER_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string());

        if !(server_url.starts_with("ws://") || server_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "MEET_SERVER_URL must be a ws:// or wss:// URL, got '{server_url}'"
            )));
        }

        let request_timeout = Duration::from_millis(parse_or(
            vars,
            "MEET_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
        )?);
        if request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "MEET_REQUEST_TIMEOUT_MS must be greater than zero".to_string(),
            ));
        }

        let request_retries = parse_or(vars, "MEET_REQUEST_RETRIES", DEFAULT_REQUEST_RETRIES)?;
        let retry_backoff = Duration::from_millis(parse_or(
            vars,
            "MEET_RETRY_BACKOFF_MS",
            DEFAULT_RETRY_BACKOFF_MS,
        )?);
        let reconnect_delay = Duration::from_millis(parse_or(
            vars,
            "MEET_RECONNECT_DELAY_MS",
            DEFAULT_RECONNECT_DELAY_MS,
        )?);
        let reconnect_delay_max = Duration::from_millis(parse_or(
            vars,
            "MEET_RECONNECT_DELAY_MAX_MS",
            DEFAULT_RECONNECT_DELAY_MAX_MS,
        )?);
        if reconnect_delay_max < reconnect_delay {
            return Err(ConfigError::InvalidValue(
                "MEET_RECONNECT_DELAY_MAX_MS must not be below MEET_RECONNECT_DELAY_MS".to_string(),
            ));
        }

        let reconnect_jitter: f64 =
            parse_or(vars, "MEET_RECONNECT_JITTER", DEFAULT_RECONNECT_JITTER)?;
        if !(0.0..=1.0).contains(&reconnect_jitter) {
            return Err(ConfigError::InvalidValue(format!(
                "MEET_RECONNECT_JITTER must be within [0, 1], got {reconnect_jitter}"
            )));
        }

        let ice_servers = split_list(
            vars.get("MEET_ICE_SERVERS")
                .map(String::as_str)
                .unwrap_or(DEFAULT_ICE_SERVERS),
        );

        let stats_interval_ms = parse_or(vars, "MEET_STATS_INTERVAL_MS", DEFAULT_STATS_INTERVAL_MS)?;
        let stats_interval = (stats_interval_ms > 0).then(|| Duration::from_millis(stats_interval_ms));

        let stock = VideoConstraints::default();
        let video_constraints = VideoConstraints {
            ideal_width: parse_or(vars, "MEET_VIDEO_WIDTH", stock.ideal_width)?,
            ideal_height: parse_or(vars, "MEET_VIDEO_HEIGHT", stock.ideal_height)?,
            ideal_frame_rate: parse_or(vars, "MEET_VIDEO_FRAME_RATE", stock.ideal_frame_rate)?,
            ..stock
        }
        .with_floors_capped();
        let media = MediaConstraints {
            audio: parse_or(vars, "MEET_AUDIO", true)?,
            video: parse_or(vars, "MEET_VIDEO", true)?,
            video_constraints,
        };

        Ok(Self {
            server_url,
            request_timeout,
            request_retries,
            retry_backoff,
            reconnect_delay,
            reconnect_delay_max,
            reconnect_jitter,
            ice_servers,
            stats_interval,
            media,
        })
    }

    pub fn request_policy(&self) -> RequestPolicy {
        RequestPolicy {
            timeout: self.request_timeout,
            retries: self.request_retries,
            backoff: self.retry_backoff,
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: self.reconnect_delay,
            max_delay: self.reconnect_delay_max,
            jitter: self.reconnect_jitter,
        }
    }

    /// ICE servers in the shape the media engine binding expects.
    pub fn rtc_ice_servers(&self) -> Vec<RTCIceServer> {
        if self.ice_servers.is_empty() {
            return Vec::new();
        }
        vec![RTCIceServer {
            urls: self.ice_servers.clone(),
            ..Default::default()
        }]
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{key}='{raw}'"))),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.server_url, DEFAULT_SERVER_URL);
        assert_eq!(config.request_timeout, Duration::from_secs(10));
        assert_eq!(config.request_retries, 3);
        assert_eq!(config.ice_servers, vec!["stun:stun.l.google.com:19302"]);
        assert_eq!(config.stats_interval, Some(Duration::from_secs(5)));
        assert!(config.media.audio);
        assert!(config.media.video);
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_vars(&vars(&[
            ("MEET_SERVER_URL", "wss://relay.example.com/ws"),
            ("MEET_REQUEST_TIMEOUT_MS", "2500"),
            ("MEET_REQUEST_RETRIES", "0"),
            ("MEET_ICE_SERVERS", "stun:a.example:3478, turn:b.example:3478"),
            ("MEET_STATS_INTERVAL_MS", "0"),
            ("MEET_VIDEO", "false"),
        ]))
        .unwrap();

        assert_eq!(config.server_url, "wss://relay.example.com/ws");
        assert_eq!(config.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.request_retries, 0);
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.stats_interval, None);
        assert!(!config.media.video);
        assert_eq!(config.media.video_constraints, VideoConstraints::default());

        let servers = config.rtc_ice_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls[1], "turn:b.example:3478");
    }

    #[test]
    fn test_video_capture_size() {
        let config = ClientConfig::from_vars(&vars(&[
            ("MEET_VIDEO_WIDTH", "640"),
            ("MEET_VIDEO_HEIGHT", "360"),
            ("MEET_VIDEO_FRAME_RATE", "15"),
        ]))
        .unwrap();

        let video = config.media.video_constraints;
        assert_eq!((video.ideal_width, video.ideal_height), (640, 360));
        assert_eq!((video.min_width, video.min_height), (640, 360));
        assert_eq!((video.ideal_frame_rate, video.min_frame_rate), (15, 15));

        assert!(ClientConfig::from_vars(&vars(&[("MEET_VIDEO_WIDTH", "wide")])).is_err());
    }

    #[test]
    fn test_invalid_values() {
        assert!(ClientConfig::from_vars(&vars(&[("MEET_REQUEST_RETRIES", "many")])).is_err());
        assert!(ClientConfig::from_vars(&vars(&[("MEET_SERVER_URL", "http://x")])).is_err());
        assert!(ClientConfig::from_vars(&vars(&[("MEET_RECONNECT_JITTER", "1.5")])).is_err());
        assert!(ClientConfig::from_vars(&vars(&[("MEET_REQUEST_TIMEOUT_MS", "0")])).is_err());
        assert!(ClientConfig::from_vars(&vars(&[
            ("MEET_RECONNECT_DELAY_MS", "9000"),
            ("MEET_RECONNECT_DELAY_MAX_MS", "1000"),
        ]))
        .is_err());
    }
}
