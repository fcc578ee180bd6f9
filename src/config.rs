// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

use std::collections::HashMap;

use crate::security::SecurityConfig;
use crate::util::ReadableDuration;
use crate::{Error, Result};

/// Configuration of the frontend.
///
/// Only knobs the routing layer itself owns live here. Cluster topology,
/// allocator behavior and storage are owned by the external collaborators.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// URLs this member answers on. Requests forwarded to one of these are
    /// treated as local.
    pub client_urls: Vec<String>,
    /// Advertised URLs, if they differ from the bind URLs.
    pub advertise_client_urls: Vec<String>,

    /// Timeout of dialing a delegate connection.
    pub dial_timeout: ReadableDuration,
    /// Timeout of a guarded receive from a downstream TSO stream.
    pub tso_proxy_recv_timeout: ReadableDuration,
    /// Timeout of one merged batch on the upstream TSO stream.
    pub tso_proxy_batch_timeout: ReadableDuration,
    /// Idle time after which a TSO proxy queue shuts down.
    pub tso_proxy_idle_timeout: ReadableDuration,
    /// How often a region heartbeat stream is re-bound to its store.
    pub heartbeat_stream_bind_interval: ReadableDuration,

    /// Enables the per-RPC concurrency limiter.
    pub enable_grpc_rate_limit: bool,
    /// Per-RPC-name concurrency limits; unset names are unlimited.
    pub grpc_rate_limits: HashMap<String, usize>,

    pub security: SecurityConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            client_urls: vec!["127.0.0.1:2379".to_owned()],
            advertise_client_urls: vec![],
            dial_timeout: ReadableDuration::secs(3),
            tso_proxy_recv_timeout: ReadableDuration::secs(3),
            tso_proxy_batch_timeout: ReadableDuration::secs(3),
            tso_proxy_idle_timeout: ReadableDuration::minutes(5),
            heartbeat_stream_bind_interval: ReadableDuration::minutes(1),
            enable_grpc_rate_limit: false,
            grpc_rate_limits: HashMap::new(),
            security: SecurityConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.client_urls.is_empty() {
            return Err(Error::InvalidValue("client-urls must not be empty".to_owned()));
        }
        if self.tso_proxy_batch_timeout.0 > self.tso_proxy_idle_timeout.0 {
            return Err(Error::InvalidValue(
                "tso-proxy-batch-timeout must not exceed tso-proxy-idle-timeout".to_owned(),
            ));
        }
        self.security
            .validate()
            .map_err(|e| Error::InvalidValue(format!("{}", e)))?;
        Ok(())
    }

    /// The URL set that identifies this member for loop-free forwarding.
    pub fn local_urls(&self) -> Vec<String> {
        let mut urls = self.client_urls.clone();
        urls.extend(self.advertise_client_urls.iter().cloned());
        urls
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        let mut cfg = Config::default();
        cfg.validate().unwrap();

        cfg.client_urls.clear();
        cfg.validate().unwrap_err();

        let mut cfg = Config::default();
        cfg.tso_proxy_batch_timeout = ReadableDuration::minutes(10);
        cfg.validate().unwrap_err();
    }

    #[test]
    fn test_local_urls() {
        let mut cfg = Config::default();
        cfg.client_urls = vec!["http://pd-0:2379".to_owned()];
        cfg.advertise_client_urls = vec!["http://lb:2379".to_owned()];
        assert_eq!(
            cfg.local_urls(),
            vec!["http://pd-0:2379".to_owned(), "http://lb:2379".to_owned()]
        );
    }
}
