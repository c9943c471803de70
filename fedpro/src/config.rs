//! Session configuration.
//!
//! Built with `SessionConfig::new().with_*()`, deserialized from JSON, or read
//! from `FEDPRO_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::callback::DeliveryMode;
use crate::wire::DEFAULT_MAX_FRAME_LENGTH;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Periodic heartbeat and liveness detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between heartbeats sent to the RTI.
    #[serde(rename = "interval_ms", with = "duration_ms")]
    pub interval: Duration,
    /// Connection is declared lost after this long without any inbound frame.
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
}

impl HeartbeatConfig {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// What the engine does after the connection is lost.
///
/// Reconnection always re-enters at Disconnected → Connecting and ends in
/// Connected: federation membership and unresolved calls are never restored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Stay Disconnected; the federate decides.
    #[default]
    Never,
    /// Redial the last endpoint, waiting `delay * attempt` before each attempt.
    Retry {
        attempts: u32,
        #[serde(rename = "delay_ms", with = "duration_ms")]
        delay: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(rename = "connect_timeout_ms", with = "duration_ms")]
    pub connect_timeout: Duration,
    /// Default deadline for calls that do not pass their own.
    #[serde(rename = "call_timeout_ms", with = "duration_ms")]
    pub call_timeout: Duration,
    /// How long `disconnect`/`close` wait for the RTI to confirm termination.
    #[serde(rename = "terminate_timeout_ms", with = "duration_ms")]
    pub terminate_timeout: Duration,
    pub heartbeat: Option<HeartbeatConfig>,
    pub max_frame_length: usize,
    pub delivery_mode: DeliveryMode,
    /// Send a Reply to the RTI after every handled callback.
    pub acknowledge_callbacks: bool,
    /// Permit `EvokeBudget::forever()`.
    pub allow_unbounded_evoke: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(60),
            terminate_timeout: Duration::from_secs(5),
            heartbeat: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            delivery_mode: DeliveryMode::Immediate,
            acknowledge_callbacks: true,
            allow_unbounded_evoke: false,
            reconnect: ReconnectPolicy::Never,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_terminate_timeout(mut self, timeout: Duration) -> Self {
        self.terminate_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }

    pub fn with_delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    pub fn with_callback_acknowledgement(mut self, enabled: bool) -> Self {
        self.acknowledge_callbacks = enabled;
        self
    }

    pub fn with_unbounded_evoke(mut self, allowed: bool) -> Self {
        self.allow_unbounded_evoke = allowed;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Read `FEDPRO_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "FEDPRO_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FEDPRO_CALL_TIMEOUT_MS")? {
            config.call_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FEDPRO_TERMINATE_TIMEOUT_MS")? {
            config.terminate_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<usize>(&lookup, "FEDPRO_MAX_FRAME_LENGTH")? {
            config.max_frame_length = max;
        }
        if let Some(enabled) = parse_var::<bool>(&lookup, "FEDPRO_ACKNOWLEDGE_CALLBACKS")? {
            config.acknowledge_callbacks = enabled;
        }
        if let Some(allowed) = parse_var::<bool>(&lookup, "FEDPRO_ALLOW_UNBOUNDED_EVOKE")? {
            config.allow_unbounded_evoke = allowed;
        }

        if let Some(value) = lookup("FEDPRO_CALLBACK_MODEL") {
            config.delivery_mode = match value.to_ascii_lowercase().as_str() {
                "immediate" | "hla_immediate" => DeliveryMode::Immediate,
                "evoked" | "hla_evoked" => DeliveryMode::Evoked,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "FEDPRO_CALLBACK_MODEL",
                        value,
                        reason: "expected immediate or evoked".to_string(),
                    });
                }
            };
        }

        // Interval 0 disables heartbeats; timeout defaults to three missed intervals.
        if let Some(ms) = parse_var::<u64>(&lookup, "FEDPRO_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat = (ms > 0).then(|| {
                let interval = Duration::from_millis(ms);
                HeartbeatConfig::new(interval, interval * 3)
            });
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "FEDPRO_HEARTBEAT_TIMEOUT_MS")? {
            match config.heartbeat.as_mut() {
                Some(heartbeat) => heartbeat.timeout = Duration::from_millis(ms),
                None => {
                    return Err(ConfigError::Invalid {
                        key: "FEDPRO_HEARTBEAT_TIMEOUT_MS",
                        value: ms.to_string(),
                        reason: "requires FEDPRO_HEARTBEAT_INTERVAL_MS > 0".to_string(),
                    });
                }
            }
        }

        if let Some(attempts) = parse_var::<u32>(&lookup, "FEDPRO_RECONNECT_ATTEMPTS")? {
            let delay = parse_var::<u64>(&lookup, "FEDPRO_RECONNECT_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(1));
            config.reconnect = if attempts == 0 {
                ReconnectPolicy::Never
            } else {
                ReconnectPolicy::Retry { attempts, delay }
            };
        }

        Ok(config)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    value
        .trim()
        .parse::<T>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        })
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
