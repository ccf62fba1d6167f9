//! Configuration handling for the peer binary.
//!
//! Settings come from an optional YAML file, are then overridden by
//! `TUBEMAIL_*` environment variables and finally by command line flags.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tubemail_hood::{HoodConfig, PortCandidates, StaticPeer};

/// Peer configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PeerConfig {
    /// Key material
    pub tls: TlsFiles,
    /// Port candidates
    pub port: Option<PortCandidates>,
    /// Local address to bind
    pub listen: Option<IpAddr>,
    /// Peers to announce statically
    pub peers: Vec<PeerEntry>,
    /// Reconnect settings
    pub reconnect: ReconnectConfig,
    /// Time allowed for each handshake stage
    #[serde(deserialize_with = "opt_duration")]
    pub handshake_timeout: Option<Duration>,
}

/// Paths to PEM files
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TlsFiles {
    /// Private key
    pub key_file: Option<PathBuf>,
    /// Certificate issued by the mesh CA
    pub cert_file: Option<PathBuf>,
    /// Mesh CA certificate
    pub ca_file: Option<PathBuf>,
}

/// A statically known peer
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PeerEntry {
    /// Host name or IP literal
    pub host: String,
    /// Listen port
    pub port: u16,
    /// Re-announcement period, announce once when absent
    #[serde(default, deserialize_with = "opt_duration")]
    pub interval: Option<Duration>,
}

/// Reconnect settings
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectConfig {
    /// Re-announcement period of lost neighbours
    #[serde(deserialize_with = "opt_duration")]
    pub interval: Option<Duration>,
    /// How long lost neighbours are re-announced
    #[serde(deserialize_with = "opt_duration")]
    pub timeout: Option<Duration>,
}

/// Durations are written the humantime way, e.g. `10s` or `2m`
fn opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)?
        .map(|text| humantime::parse_duration(&text).map_err(serde::de::Error::custom))
        .transpose()
}

/// Parse `host:port`, with IPv6 hosts in brackets
pub fn parse_peer(text: &str) -> Result<PeerEntry> {
    let Some((host, port)) = text.rsplit_once(':') else {
        bail!("peer {:?} lacks a port", text);
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        bail!("peer {:?} lacks a host", text);
    }
    let port = port
        .parse()
        .with_context(|| format!("invalid port in peer {:?}", text))?;
    Ok(PeerEntry {
        host: host.to_string(),
        port,
        interval: None,
    })
}

fn parse_duration(name: &str, text: &str) -> Result<Duration> {
    humantime::parse_duration(text).with_context(|| format!("invalid {}: {:?}", name, text))
}

impl PeerConfig {
    /// Load from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {:?}", path))?;
        info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Apply `TUBEMAIL_*` environment variables
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup("TUBEMAIL_KEY") {
            self.tls.key_file = Some(path.into());
        }
        if let Some(path) = lookup("TUBEMAIL_CERT") {
            self.tls.cert_file = Some(path.into());
        }
        if let Some(path) = lookup("TUBEMAIL_CA") {
            self.tls.ca_file = Some(path.into());
        }
        if let Some(port) = lookup("TUBEMAIL_PORT") {
            self.port = Some(PortCandidates::parse(&port));
            info!("Port overridden by environment: {}", port);
        }
        if let Some(listen) = lookup("TUBEMAIL_LISTEN") {
            let addr = listen
                .parse()
                .with_context(|| format!("invalid TUBEMAIL_LISTEN: {:?}", listen))?;
            self.listen = Some(addr);
        }
        if let Some(peers) = lookup("TUBEMAIL_PEERS") {
            for peer in peers.split(',').map(str::trim).filter(|p| !p.is_empty()) {
                self.peers.push(parse_peer(peer)?);
            }
        }
        if let Some(interval) = lookup("TUBEMAIL_RECONNECT_INTERVAL") {
            self.reconnect.interval = Some(parse_duration("TUBEMAIL_RECONNECT_INTERVAL", &interval)?);
        }
        if let Some(timeout) = lookup("TUBEMAIL_RECONNECT_TIMEOUT") {
            self.reconnect.timeout = Some(parse_duration("TUBEMAIL_RECONNECT_TIMEOUT", &timeout)?);
        }
        Ok(())
    }

    /// Fill key material paths not set elsewhere from the peer name:
    /// `hood.<name>.key`, `hood.<name>.crt` and `hood.crt`
    pub fn default_files(&mut self, name: &str) {
        let tls = &mut self.tls;
        tls.key_file
            .get_or_insert_with(|| PathBuf::from(format!("hood.{}.key", name)));
        tls.cert_file
            .get_or_insert_with(|| PathBuf::from(format!("hood.{}.crt", name)));
        tls.ca_file.get_or_insert_with(|| PathBuf::from("hood.crt"));
    }

    /// Read the key material and build the hood configuration
    pub fn into_hood_config(self) -> Result<HoodConfig> {
        let read = |what: &str, path: Option<PathBuf>| -> Result<Vec<u8>> {
            let path = path.with_context(|| format!("no {} file configured", what))?;
            std::fs::read(&path).with_context(|| format!("failed to read {} file {:?}", what, path))
        };

        let mut builder = HoodConfig::builder()
            .key(read("key", self.tls.key_file)?)
            .cert(read("cert", self.tls.cert_file)?)
            .ca(read("ca", self.tls.ca_file)?);
        if let Some(port) = self.port {
            builder = builder.port(port);
        }
        if let Some(listen) = self.listen {
            builder = builder.listen_addr(listen);
        }
        if let Some(interval) = self.reconnect.interval {
            builder = builder.reconnect_interval(interval);
        }
        if let Some(timeout) = self.reconnect.timeout {
            builder = builder.reconnect_timeout(timeout);
        }
        if let Some(timeout) = self.handshake_timeout {
            builder = builder.handshake_timeout(timeout);
        }
        for peer in self.peers {
            let interval = peer.interval.unwrap_or_default();
            builder = builder.discovery(StaticPeer::new(peer.host, peer.port).every(interval));
        }

        builder.build().context("invalid key material")
    }
}
