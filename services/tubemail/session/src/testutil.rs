//! Throwaway certificate authorities for tests.

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, IsCa, KeyPair,
};

/// A CA able to issue peer certificates
pub(crate) struct TestPki {
    pub ca_pem: String,
    pub ca_der: Vec<u8>,
    ca_cert: Certificate,
    ca_key: KeyPair,
}

/// Key material of one peer, PEM encoded
#[derive(Clone)]
pub(crate) struct TestPeer {
    pub key_pem: String,
    pub cert_pem: String,
    pub ca_pem: String,
}

impl TestPki {
    pub fn new() -> Self {
        let ca_key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params
            .distinguished_name
            .push(DnType::CommonName, "tubemail test ca");
        let ca_cert = params.self_signed(&ca_key).unwrap();

        Self {
            ca_pem: ca_cert.pem(),
            ca_der: ca_cert.der().to_vec(),
            ca_cert,
            ca_key,
        }
    }

    pub fn issue(&self, name: &str) -> TestPeer {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params
            .distinguished_name
            .push(DnType::OrganizationName, "tubemail");
        let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();

        TestPeer {
            key_pem: key.serialize_pem(),
            cert_pem: cert.pem(),
            ca_pem: self.ca_pem.clone(),
        }
    }
}
