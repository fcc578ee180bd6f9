// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The delegate connection pool: one lazily dialed channel per peer URL,
//! shared by every forwarder in the process. Eviction is caller driven, a
//! forwarder that hits a need-rebuild error closes the entry so the next
//! request dials afresh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grpcio::{Channel, ChannelBuilder, Environment};

use crate::security::SecurityManager;

pub struct ConnPool {
    env: Arc<Environment>,
    security_mgr: Arc<SecurityManager>,
    conns: Mutex<HashMap<String, Channel>>,
}

impl ConnPool {
    pub fn new(env: Arc<Environment>, security_mgr: Arc<SecurityManager>) -> ConnPool {
        ConnPool {
            env,
            security_mgr,
            conns: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the channel for `url`, dialing on first demand. Concurrent
    /// callers for the same URL observe one shared channel; a racing loser's
    /// channel is dropped before anyone else can see it.
    pub fn get(&self, url: &str) -> Channel {
        if let Some(ch) = self.conns.lock().unwrap().get(url) {
            return ch.clone();
        }
        let cb = ChannelBuilder::new(self.env.clone())
            .keepalive_time(Duration::from_secs(10))
            .keepalive_timeout(Duration::from_secs(3));
        let ch = self.security_mgr.connect(cb, url);
        let mut conns = self.conns.lock().unwrap();
        match conns.get(url) {
            // Another caller won the race; keep its channel.
            Some(winner) => winner.clone(),
            None => {
                debug!("dialed delegate connection"; "url" => url);
                conns.insert(url.to_owned(), ch.clone());
                ch
            }
        }
    }

    /// Removes and closes the channel for `url`. Called when a peer answered
    /// with a need-rebuild error.
    pub fn close(&self, url: &str) {
        if self.conns.lock().unwrap().remove(url).is_some() {
            info!("evicted delegate connection"; "url" => url);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.conns.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use grpcio::EnvBuilder;

    use super::*;

    fn pool() -> Arc<ConnPool> {
        let env = Arc::new(EnvBuilder::new().cq_count(1).build());
        let mgr = Arc::new(SecurityManager::default());
        Arc::new(ConnPool::new(env, mgr))
    }

    #[test]
    fn test_get_is_deduplicated() {
        let pool = pool();
        // Channels are lazy, no listener is needed.
        let _a = pool.get("127.0.0.1:41000");
        let _b = pool.get("127.0.0.1:41000");
        let _c = pool.get("127.0.0.1:41001");
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_concurrent_get_returns_shared_channel() {
        let pool = pool();
        let mut handles = vec![];
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || pool.get("127.0.0.1:41002")));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_close_evicts() {
        let pool = pool();
        let _ = pool.get("127.0.0.1:41003");
        pool.close("127.0.0.1:41003");
        assert_eq!(pool.len(), 0);
        // Closing an unknown URL is a no-op.
        pool.close("127.0.0.1:41003");
    }
}
