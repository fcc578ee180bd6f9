// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

use std::error::Error;
use std::fs::File;
use std::io::Read;

use grpcio::{
    CertificateRequestType, Channel, ChannelBuilder, ChannelCredentialsBuilder, ServerBuilder,
    ServerCredentialsBuilder,
};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct SecurityConfig {
    pub ca_path: String,
    pub cert_path: String,
    pub key_path: String,
    // Test purpose only.
    #[serde(skip)]
    pub override_ssl_target: String,
}

/// Checks and opens key file. Returns `Ok(None)` if the path is empty.
fn check_key_file(tag: &str, path: &str) -> Result<Option<File>, Box<dyn Error>> {
    if path.is_empty() {
        return Ok(None);
    }
    match File::open(path) {
        Err(e) => Err(format!("failed to open {} to load {}: {:?}", path, tag, e).into()),
        Ok(f) => Ok(Some(f)),
    }
}

/// Loads key file content. Returns `Ok(vec![])` if the path is empty.
fn load_key(tag: &str, path: &str) -> Result<Vec<u8>, Box<dyn Error>> {
    let mut key = vec![];
    match check_key_file(tag, path)? {
        None => return Ok(vec![]),
        Some(mut f) => {
            if let Err(e) = f.read_to_end(&mut key) {
                return Err(format!("failed to load {} from path {}: {:?}", tag, path, e).into());
            }
        }
    }
    Ok(key)
}

impl SecurityConfig {
    /// Validates ca, cert and private key.
    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        check_key_file("ca key", &self.ca_path)?;
        check_key_file("cert key", &self.cert_path)?;
        check_key_file("private key", &self.key_path)?;
        if (!self.ca_path.is_empty() || !self.cert_path.is_empty() || !self.key_path.is_empty())
            && (self.ca_path.is_empty() || self.cert_path.is_empty() || self.key_path.is_empty())
        {
            return Err("ca, cert and private key should be all configured.".into());
        }
        Ok(())
    }
}

#[derive(Default)]
struct Certs {
    ca: Vec<u8>,
    cert: Vec<u8>,
    key: Vec<u8>,
}

#[derive(Default)]
pub struct SecurityManager {
    certs: Certs,
    override_ssl_target: String,
}

impl SecurityManager {
    pub fn new(cfg: &SecurityConfig) -> Result<SecurityManager, Box<dyn Error>> {
        Ok(SecurityManager {
            certs: Certs {
                ca: load_key("CA", &cfg.ca_path)?,
                cert: load_key("certificate", &cfg.cert_path)?,
                key: load_key("private key", &cfg.key_path)?,
            },
            override_ssl_target: cfg.override_ssl_target.clone(),
        })
    }

    pub fn connect(&self, mut cb: ChannelBuilder, addr: &str) -> Channel {
        let addr = addr
            .trim_start_matches("http://")
            .trim_start_matches("https://");
        if self.certs.ca.is_empty() {
            cb.connect(addr)
        } else {
            if !self.override_ssl_target.is_empty() {
                cb = cb.override_ssl_target(self.override_ssl_target.clone());
            }
            let cred = ChannelCredentialsBuilder::new()
                .root_cert(self.certs.ca.clone())
                .cert(self.certs.cert.clone(), self.certs.key.clone())
                .build();
            cb.secure_connect(addr, cred)
        }
    }

    pub fn bind(&self, sb: ServerBuilder, addr: &str, port: u16) -> ServerBuilder {
        if self.certs.ca.is_empty() {
            sb.bind(addr, port)
        } else {
            let cred = ServerCredentialsBuilder::new()
                .root_cert(
                    self.certs.ca.clone(),
                    CertificateRequestType::RequestAndRequireClientCertificateAndVerify,
                )
                .add_cert(self.certs.cert.clone(), self.certs.key.clone())
                .build();
            sb.bind_with_cred(addr, port, cred)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_security_config() {
        let cfg = SecurityConfig::default();
        cfg.validate().unwrap();
        let mgr = SecurityManager::new(&cfg).unwrap();
        assert!(mgr.certs.ca.is_empty());

        let temp = tempfile::Builder::new().prefix("test_cred").tempdir().unwrap();
        let ca = temp.path().join("ca");
        let cert = temp.path().join("cert");
        let key = temp.path().join("key");
        for (id, f) in [&ca, &cert, &key].iter().enumerate() {
            fs::write(f, [id as u8]).unwrap();
        }

        let mut c = cfg.clone();
        c.cert_path = format!("{}", cert.display());
        c.key_path = format!("{}", key.display());
        // incomplete configuration.
        c.validate().unwrap_err();

        c.ca_path = format!("{}", ca.display());
        c.validate().unwrap();
        let mgr = SecurityManager::new(&c).unwrap();
        assert_eq!(mgr.certs.ca, vec![0]);
        assert_eq!(mgr.certs.cert, vec![1]);
        assert_eq!(mgr.certs.key, vec![2]);
    }
}
