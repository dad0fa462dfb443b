//! Configuration types for the tunnel client.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Platforms where path-MTU discovery probing is worth running.
pub(crate) const PMTUD_SUPPORTED: bool = cfg!(any(target_os = "linux", target_os = "windows"));

/// QUIC transport tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "defaults::idle_timeout", with = "secs")]
    pub idle_timeout: Duration,

    #[serde(default = "defaults::keep_alive", with = "option_secs")]
    pub keep_alive_interval: Option<Duration>,

    #[serde(default = "defaults::max_bidi_streams")]
    pub max_concurrent_bidi_streams: u32,

    #[serde(default = "defaults::max_uni_streams")]
    pub max_concurrent_uni_streams: u32,

    /// OR'd with the platform capability; the effective value disables
    /// quinn's MTU probing when true.
    #[serde(default)]
    pub disable_mtu_discovery: bool,
}

impl TransportConfig {
    pub(crate) fn mtu_discovery_disabled(&self) -> bool {
        self.disable_mtu_discovery || !PMTUD_SUPPORTED
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            idle_timeout: defaults::idle_timeout(),
            keep_alive_interval: defaults::keep_alive(),
            max_concurrent_bidi_streams: defaults::max_bidi_streams(),
            max_concurrent_uni_streams: defaults::max_uni_streams(),
            disable_mtu_discovery: false,
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server as `"host:port"`. The host doubles as the SNI unless
    /// `server_name` overrides it.
    pub server_addr: String,

    pub server_name: Option<String>,

    /// Opaque credentials passed through to the server.
    #[serde(default)]
    pub auth: Vec<u8>,

    /// Send rate the client announces, bits per second.
    pub send_bps: u64,

    /// Receive rate the client asks for, bits per second.
    pub recv_bps: u64,

    #[serde(default = "defaults::alpn")]
    pub alpn: Vec<String>,

    #[serde(default)]
    pub skip_cert_verify: bool,

    /// Deadline for opening the control stream on a fresh connection.
    #[serde(default = "defaults::protocol_timeout", with = "secs")]
    pub protocol_timeout: Duration,

    #[serde(default)]
    pub transport: TransportConfig,
}

impl ClientConfig {
    pub fn new(
        server_addr: impl Into<String>,
        auth: impl Into<Vec<u8>>,
        send_bps: u64,
        recv_bps: u64,
    ) -> Self {
        Self {
            server_addr: server_addr.into(),
            server_name: None,
            auth: auth.into(),
            send_bps,
            recv_bps,
            alpn: defaults::alpn(),
            skip_cert_verify: false,
            protocol_timeout: defaults::protocol_timeout(),
            transport: TransportConfig::default(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn idle_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn keep_alive() -> Option<Duration> {
        Some(Duration::from_secs(10))
    }

    pub fn max_bidi_streams() -> u32 {
        100
    }

    pub fn max_uni_streams() -> u32 {
        100
    }

    pub fn alpn() -> Vec<String> {
        vec!["h3".to_string()]
    }

    pub fn protocol_timeout() -> Duration {
        Duration::from_secs(10)
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

mod option_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt = Option::<u64>::deserialize(deserializer)?;
        Ok(opt.map(Duration::from_secs))
    }
}
