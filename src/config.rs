//! Evasion configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty file is a valid
//! configuration that fragments TLS ClientHellos on port 443 at the SNI
//! midpoint.

use crate::error::MangleError;
use crate::quic::CacheLimits;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration, read-only while packets are processed
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvasionConfig {
    /// Rewrite the TCP window of the real packet (0 = leave as is)
    #[serde(default)]
    pub tcp_window_override: u16,

    /// Pause between consecutive crafted packets
    #[serde(default, with = "humantime_serde")]
    pub inter_segment_delay: Duration,

    /// TLS matching
    #[serde(default)]
    pub tls: TlsConfig,

    /// Decoy injection
    #[serde(default)]
    pub faking: FakingConfig,

    /// Fragmentation of the real packet
    #[serde(default)]
    pub fragmentation: FragmentationConfig,

    /// QUIC reassembly cache limits
    #[serde(default)]
    pub quic: CacheLimits,

    #[serde(skip)]
    domain_predicate: Option<DomainPredicate>,
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Enable ClientHello mangling
    pub enabled: bool,

    /// Destination port to act on
    pub port: u16,

    /// Domains to act on; empty means every hostname
    pub domains: Vec<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 443,
            domains: Vec::new(),
        }
    }
}

/// Decoy payload source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FakePayloadKind {
    /// Built-in ClientHello for `fake_sni`
    Default,
    /// Bytes from `template`
    Custom,
    /// Random bytes, as many as the real payload
    Random,
}

/// How decoys are kept away from the real server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FakingStrategy {
    /// Low TTL so the decoy expires after the middlebox
    Ttl,
    /// Broken TCP checksum (UDP for QUIC decoys) so the server drops it
    TcpCheck,
    /// Send as is (rely on the sequence offset alone)
    None,
}

/// Sequence number given to decoys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceOffset {
    /// Same sequence number as the real packet
    Original,
    /// Random offset from the real sequence number
    Random,
    /// Before the real sequence number, as already acknowledged data
    Past,
}

/// Decoy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FakingConfig {
    /// Send decoys before the real packet
    pub enabled: bool,

    pub payload: FakePayloadKind,

    /// Hex payload for `payload = "custom"`
    #[serde(with = "hex_bytes", skip_serializing_if = "Option::is_none")]
    pub template: Option<Vec<u8>>,

    /// Hostname carried by the default decoy
    pub fake_sni: String,

    /// Number of decoys per packet
    pub count: u32,

    pub strategy: FakingStrategy,

    /// TTL for the `ttl` strategy
    pub ttl: u8,

    pub seq_offset: SequenceOffset,
}

impl Default for FakingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            payload: FakePayloadKind::Default,
            template: None,
            fake_sni: "www.google.com".to_string(),
            count: 1,
            strategy: FakingStrategy::Ttl,
            ttl: 8,
            seq_offset: SequenceOffset::Original,
        }
    }
}

/// Where the real packet is split
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentationStrategy {
    /// Send the packet whole
    None,
    /// Split into TCP segments; QUIC datagrams fall back to IPv4 fragments
    Tcp,
    /// Split into IPv4 fragments
    Ip,
}

/// Fragmentation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentationConfig {
    pub strategy: FragmentationStrategy,

    /// Send later byte ranges first
    pub reverse: bool,

    /// Split in the middle of the hostname
    pub sni_midpoint: bool,

    /// Fixed split position in the TCP or UDP payload (0 = disabled)
    pub position: usize,
}

impl Default for FragmentationConfig {
    fn default() -> Self {
        Self {
            strategy: FragmentationStrategy::Tcp,
            reverse: false,
            sni_midpoint: true,
            position: 0,
        }
    }
}

/// Upper bound on decoys per packet
pub const MAX_FAKE_COUNT: u32 = 64;

/// Hostname predicate supplied by library users
#[derive(Clone)]
pub struct DomainPredicate(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl std::fmt::Debug for DomainPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DomainPredicate(..)")
    }
}

impl EvasionConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self, MangleError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, MangleError> {
        let config: Self = toml::from_str(contents)?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<(), MangleError> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, MangleError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Replace the `domains` list with an arbitrary predicate
    pub fn with_domain_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.domain_predicate = Some(DomainPredicate(Arc::new(predicate)));
        self
    }

    /// Whether any hostname filter is configured
    pub fn has_domain_filter(&self) -> bool {
        self.domain_predicate.is_some() || !self.tls.domains.is_empty()
    }

    /// Whether `hostname` passes the filter; true when there is none.
    ///
    /// A listed domain matches itself and its subdomains, ignoring ASCII case.
    pub fn matches_domain(&self, hostname: &str) -> bool {
        if let Some(DomainPredicate(predicate)) = &self.domain_predicate {
            return predicate(hostname);
        }
        if self.tls.domains.is_empty() {
            return true;
        }
        let host = hostname.trim_end_matches('.');
        self.tls.domains.iter().any(|domain| {
            let domain = domain.trim_start_matches('.');
            if host.len() == domain.len() {
                host.eq_ignore_ascii_case(domain)
            } else if host.len() > domain.len() {
                let split = host.len() - domain.len();
                host.is_char_boundary(split)
                    && host.as_bytes()[split - 1] == b'.'
                    && host[split..].eq_ignore_ascii_case(domain)
            } else {
                false
            }
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), MangleError> {
        let invalid = |msg: &str| Err(MangleError::InvalidConfig(msg.to_string()));

        if self.faking.enabled {
            if self.faking.count > MAX_FAKE_COUNT {
                return invalid("faking.count must be at most 64");
            }
            if self.faking.payload == FakePayloadKind::Custom
                && self.faking.template.as_ref().map_or(true, |t| t.is_empty())
            {
                return invalid("faking.template is required for the custom payload");
            }
            if self.faking.strategy == FakingStrategy::Ttl && self.faking.ttl == 0 {
                return invalid("faking.ttl must be nonzero for the ttl strategy");
            }
        }

        if self.quic.ttl.is_zero() || self.quic.sweep_interval.is_zero() {
            return invalid("quic.ttl and quic.sweep_interval must be nonzero");
        }
        if self.quic.max_entries == 0 {
            return invalid("quic.max_entries must be nonzero");
        }

        Ok(())
    }
}

/// Optional byte string serialised as hex
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&hex::encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text = Option::<String>::deserialize(d)?;
        text.map(|t| {
            let cleaned: String = t.chars().filter(|c| !c.is_ascii_whitespace()).collect();
            hex::decode(cleaned).map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}
