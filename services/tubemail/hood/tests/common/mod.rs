//! Shared fixtures for hood integration tests.

#![allow(dead_code)]

use rcgen::{BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::time::timeout;
use tubemail_hood::{Hood, HoodConfig, HoodConfigBuilder, HoodEvent, HoodEvents};

pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
pub const WAIT: Duration = Duration::from_secs(10);

/// Certificate authority of one test mesh
pub struct Pki {
    pub ca_pem: String,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

/// Key material of one peer
pub struct Peer {
    pub name: String,
    pub key_pem: String,
    pub cert_pem: String,
    pub ca_pem: String,
}

impl Pki {
    pub fn new(name: &str) -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        let ca_cert = params.self_signed(&ca_key).unwrap();
        Self {
            ca_pem: ca_cert.pem(),
            ca_cert,
            ca_key,
        }
    }

    pub fn issue(&self, name: &str) -> Peer {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
        Peer {
            name: name.to_string(),
            key_pem: key.serialize_pem(),
            cert_pem: cert.pem(),
            ca_pem: self.ca_pem.clone(),
        }
    }
}

impl Peer {
    /// Loopback config on an ephemeral port
    pub fn config(&self) -> HoodConfigBuilder {
        HoodConfig::builder()
            .key(self.key_pem.as_bytes())
            .cert(self.cert_pem.as_bytes())
            .ca(self.ca_pem.as_bytes())
            .listen_addr(LOCALHOST)
            .port(0u16)
            .handshake_timeout(Duration::from_secs(5))
    }
}

/// Wait until `hood` has exactly `count` neighbours
pub async fn wait_for_neighbours(hood: &Hood, count: usize) {
    let mut watch = hood.watch_neighbours();
    timeout(WAIT, watch.wait_for(|n| n.len() == count))
        .await
        .unwrap_or_else(|_| panic!("{} never reached {} neighbours", hood.info(), count))
        .map(|_| ())
        .expect("hood is gone");
}

/// Skip events until one matches
pub async fn expect_event<F>(events: &mut HoodEvents, mut matches: F) -> HoodEvent
where
    F: FnMut(&HoodEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("hood events ended"),
            }
        }
    })
    .await
    .expect("timed out waiting for a hood event")
}
