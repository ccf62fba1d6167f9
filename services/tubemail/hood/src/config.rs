//! Hood configuration.
//!
//! A [`HoodConfig`] is assembled through [`HoodConfig::builder`]. Key
//! material is validated when the builder finishes, so a config that exists
//! is one the hood can start with.

use crate::discovery::Discovery;
use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tubemail_session::{fingerprint, CertInfo, TlsIdentity};

/// Ports tried when nothing else is configured
pub const DEFAULT_PORTS: [u16; 4] = [4816, 4817, 4818, 4819];

/// Time allowed for each handshake stage and for TLS setup
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Period of re-announcing a lost neighbour
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// How long a lost neighbour is re-announced
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Ordered list of ports to try when binding.
///
/// Deserializes from a number, a numeric string, an array of numbers or a
/// `{from, to}` range. Anything else, including an empty list or an inverted
/// range, yields [`DEFAULT_PORTS`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "PortSpec")]
pub struct PortCandidates(Vec<u16>);

#[derive(Deserialize)]
#[serde(untagged)]
enum PortSpec {
    Number(u16),
    Text(String),
    List(Vec<u16>),
    Range { from: u16, to: u16 },
    Other(serde::de::IgnoredAny),
}

impl From<PortSpec> for PortCandidates {
    fn from(spec: PortSpec) -> Self {
        match spec {
            PortSpec::Number(port) => Self::single(port),
            PortSpec::Text(text) => Self::parse(&text),
            PortSpec::List(ports) => Self::list(ports),
            PortSpec::Range { from, to } => Self::range(from, to),
            PortSpec::Other(_) => Self::default(),
        }
    }
}

impl PortCandidates {
    /// Exactly one port; 0 lets the OS pick
    pub fn single(port: u16) -> Self {
        Self(vec![port])
    }

    /// Ports in the given order
    pub fn list(ports: Vec<u16>) -> Self {
        if ports.is_empty() {
            return Self::default();
        }
        Self(ports)
    }

    /// Every port from `from` to `to`, both included
    pub fn range(from: u16, to: u16) -> Self {
        if from > to {
            return Self::default();
        }
        Self((from..=to).collect())
    }

    /// A single port written as text
    pub fn parse(text: &str) -> Self {
        text.trim()
            .parse()
            .map(Self::single)
            .unwrap_or_default()
    }

    /// Candidates in trial order
    pub fn ports(&self) -> &[u16] {
        &self.0
    }
}

impl Default for PortCandidates {
    fn default() -> Self {
        Self(DEFAULT_PORTS.to_vec())
    }
}

impl From<u16> for PortCandidates {
    fn from(port: u16) -> Self {
        Self::single(port)
    }
}

impl From<Vec<u16>> for PortCandidates {
    fn from(ports: Vec<u16>) -> Self {
        Self::list(ports)
    }
}

/// Validated hood configuration
pub struct HoodConfig {
    pub(crate) identity: TlsIdentity,
    pub(crate) info: CertInfo,
    pub(crate) fingerprint: String,
    pub(crate) ports: PortCandidates,
    pub(crate) listen_addr: IpAddr,
    pub(crate) discovery: Vec<Box<dyn Discovery>>,
    pub(crate) reconnect_interval: Duration,
    pub(crate) reconnect_timeout: Duration,
    pub(crate) handshake_timeout: Duration,
}

impl HoodConfig {
    /// Start a new configuration
    pub fn builder() -> HoodConfigBuilder {
        HoodConfigBuilder::default()
    }

    /// Our own certificate
    pub fn info(&self) -> &CertInfo {
        &self.info
    }

    /// Mesh fingerprint derived from the CA
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Debug for HoodConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HoodConfig")
            .field("info", &self.info.to_string())
            .field("fingerprint", &self.fingerprint)
            .field("ports", &self.ports)
            .field("listen_addr", &self.listen_addr)
            .field("discovery", &self.discovery.len())
            .field("reconnect_interval", &self.reconnect_interval)
            .field("reconnect_timeout", &self.reconnect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .finish()
    }
}

/// Builder for [`HoodConfig`]
pub struct HoodConfigBuilder {
    key: Option<Vec<u8>>,
    cert: Option<Vec<u8>>,
    ca: Option<Vec<u8>>,
    ports: PortCandidates,
    listen_addr: IpAddr,
    discovery: Vec<Box<dyn Discovery>>,
    reconnect_interval: Duration,
    reconnect_timeout: Duration,
    handshake_timeout: Duration,
}

impl Default for HoodConfigBuilder {
    fn default() -> Self {
        Self {
            key: None,
            cert: None,
            ca: None,
            ports: PortCandidates::default(),
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            discovery: Vec::new(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl HoodConfigBuilder {
    /// PEM private key
    pub fn key(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.key = Some(pem.into());
        self
    }

    /// PEM certificate issued by the mesh CA
    pub fn cert(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.cert = Some(pem.into());
        self
    }

    /// PEM certificate of the mesh CA
    pub fn ca(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca = Some(pem.into());
        self
    }

    /// Ports to try, in order
    pub fn port(mut self, ports: impl Into<PortCandidates>) -> Self {
        self.ports = ports.into();
        self
    }

    /// Local address to bind, `0.0.0.0` by default
    pub fn listen_addr(mut self, addr: IpAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Add a discovery plugin
    pub fn discovery(mut self, discovery: impl Discovery) -> Self {
        self.discovery.push(Box::new(discovery));
        self
    }

    /// Period of re-announcing lost neighbours; zero disables reconnecting
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    /// How long lost neighbours are re-announced; zero disables reconnecting
    pub fn reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    /// Time allowed for each handshake stage
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Validate the key material and finish
    pub fn build(self) -> Result<HoodConfig, ConfigError> {
        let key = self.key.ok_or(ConfigError::Missing("key"))?;
        let cert = self.cert.ok_or(ConfigError::Missing("cert"))?;
        let ca = self.ca.ok_or(ConfigError::Missing("ca"))?;

        let info = CertInfo::from_pem(&cert)
            .map_err(|source| ConfigError::Certificate { what: "cert", source })?;
        let fingerprint =
            fingerprint(&ca).map_err(|source| ConfigError::Certificate { what: "ca", source })?;
        let identity = TlsIdentity::new(&key, &cert, &ca)?;

        Ok(HoodConfig {
            identity,
            info,
            fingerprint,
            ports: self.ports,
            listen_addr: self.listen_addr,
            discovery: self.discovery,
            reconnect_interval: self.reconnect_interval,
            reconnect_timeout: self.reconnect_timeout,
            handshake_timeout: self.handshake_timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ports(json: &str) -> Vec<u16> {
        serde_json::from_str::<PortCandidates>(json)
            .unwrap()
            .ports()
            .to_vec()
    }

    #[test]
    fn test_port_spec_forms() {
        assert_eq!(ports("5000"), vec![5000]);
        assert_eq!(ports("\"5001\""), vec![5001]);
        assert_eq!(ports("[5002, 5004]"), vec![5002, 5004]);
        assert_eq!(ports(r#"{"from": 5005, "to": 5007}"#), vec![5005, 5006, 5007]);
    }

    #[test]
    fn test_port_spec_fallbacks() {
        let defaults = DEFAULT_PORTS.to_vec();
        assert_eq!(ports("null"), defaults);
        assert_eq!(ports("[]"), defaults);
        assert_eq!(ports("\"not a port\""), defaults);
        assert_eq!(ports(r#"{"from": 10, "to": 9}"#), defaults);
        assert_eq!(ports("true"), defaults);
    }

    #[test]
    fn test_port_spec_from_yaml() {
        let parsed: PortCandidates = serde_yaml::from_str("from: 4900\nto: 4901\n").unwrap();
        assert_eq!(parsed.ports(), &[4900, 4901]);
    }

    #[test]
    fn test_missing_material() {
        let err = HoodConfig::builder().build().unwrap_err();
        assert_eq!(err.to_string(), "key is missing");

        let err = HoodConfig::builder().key("k").build().unwrap_err();
        assert_eq!(err.to_string(), "cert is missing");

        let err = HoodConfig::builder().key("k").cert("c").build().unwrap_err();
        assert_eq!(err.to_string(), "ca is missing");
    }

    #[test]
    fn test_malformed_cert() {
        let err = HoodConfig::builder()
            .key("k")
            .cert("not a certificate")
            .ca("c")
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Certificate { what: "cert", .. }));
    }
}
