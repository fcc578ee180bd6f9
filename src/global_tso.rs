// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Single-shot retrieval of a recent global timestamp, used by the RPCs that
//! anchor safepoints and external timestamps. In direct mode the local
//! allocator answers; in proxy mode one long-lived locked stream per TSO
//! primary is kept, retried with primary-watcher invalidation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use grpcio::{ClientDuplexReceiver, ClientDuplexSender, WriteFlags};
use kvproto::pdpb::Timestamp;
use kvproto::tsopb::{self, TsoClient};
use tokio::sync::{Mutex, RwLock};

use crate::cluster::{ServiceWatcher, TsoAllocator};
use crate::conn::ConnPool;
use crate::util;
use crate::{box_err, Error, Result};

const MAX_RETRY_TIMES: usize = 6;
const RETRY_INTERVAL: Duration = Duration::from_millis(500);
const GLOBAL_DC_LOCATION: &str = "global";

struct TsoStream {
    tx: ClientDuplexSender<tsopb::TsoRequest>,
    rx: ClientDuplexReceiver<tsopb::TsoResponse>,
}

/// The retrieval path for "a recent timestamp".
pub enum GlobalTsoClient {
    /// The allocator lives in this process.
    Direct(Arc<dyn TsoAllocator>),
    /// Timestamps come from an independent TSO service.
    Proxy(ProxyTsoClient),
}

impl GlobalTsoClient {
    pub fn direct(allocator: Arc<dyn TsoAllocator>) -> GlobalTsoClient {
        GlobalTsoClient::Direct(allocator)
    }

    pub fn proxy(
        cluster_id: u64,
        watcher: Arc<dyn ServiceWatcher>,
        pool: Arc<ConnPool>,
    ) -> GlobalTsoClient {
        GlobalTsoClient::Proxy(ProxyTsoClient {
            cluster_id,
            watcher,
            pool,
            streams: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get_global_tso(&self) -> Result<Timestamp> {
        match self {
            GlobalTsoClient::Direct(allocator) => allocator.handle_request(1).await,
            GlobalTsoClient::Proxy(proxy) => proxy.get_global_tso().await,
        }
    }
}

pub struct ProxyTsoClient {
    cluster_id: u64,
    watcher: Arc<dyn ServiceWatcher>,
    pool: Arc<ConnPool>,
    streams: RwLock<HashMap<String, Arc<Mutex<TsoStream>>>>,
}

impl ProxyTsoClient {
    async fn get_global_tso(&self) -> Result<Timestamp> {
        let mut last_err = box_err!("failed to get global tso");
        for i in 0..MAX_RETRY_TIMES {
            if i > 0 {
                util::delay(RETRY_INTERVAL).await;
            }
            let primary = match self.watcher.primary() {
                Some(addr) if !addr.is_empty() => addr,
                _ => return Err(Error::NotFoundTsoAddr),
            };
            let stream = match self.load_or_create_stream(&primary).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("create tso stream failed"; "primary" => %primary, "err" => ?e);
                    last_err = e;
                    continue;
                }
            };
            match self.request_once(&stream).await {
                Ok(ts) => return Ok(ts),
                Err(e) => {
                    warn!("get global tso failed"; "primary" => %primary, "err" => ?e);
                    if e.is_peer_not_leader() {
                        self.watcher.force_load();
                    }
                    if e.need_rebuild_connection() {
                        self.streams.write().await.remove(&primary);
                        self.pool.close(&primary);
                    }
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn load_or_create_stream(&self, primary: &str) -> Result<Arc<Mutex<TsoStream>>> {
        if let Some(stream) = self.streams.read().await.get(primary) {
            return Ok(stream.clone());
        }
        let mut streams = self.streams.write().await;
        if let Some(stream) = streams.get(primary) {
            return Ok(stream.clone());
        }
        let client = TsoClient::new(self.pool.get(primary));
        let (tx, rx) = client.tso()?;
        let stream = Arc::new(Mutex::new(TsoStream { tx, rx }));
        streams.insert(primary.to_owned(), stream.clone());
        Ok(stream)
    }

    /// One single-count request under the stream lock, so send and receive
    /// stay paired.
    async fn request_once(&self, stream: &Arc<Mutex<TsoStream>>) -> Result<Timestamp> {
        let mut req = tsopb::TsoRequest::default();
        req.mut_header().set_cluster_id(self.cluster_id);
        req.set_count(1);
        req.set_dc_location(GLOBAL_DC_LOCATION.to_owned());

        let mut stream = stream.lock().await;
        stream
            .tx
            .send((req, WriteFlags::default().buffer_hint(false)))
            .await?;
        let resp = match stream.rx.next().await {
            Some(resp) => resp?,
            None => return Err(Error::StreamClosed),
        };
        if resp.get_header().has_error() {
            return Err(box_err!(resp.get_header().get_error().get_message()));
        }
        if !resp.has_timestamp() {
            return Err(box_err!("no timestamp in tso response"));
        }
        Ok(resp.get_timestamp().clone())
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::MockTsoAllocator;

    use super::*;

    #[tokio::test]
    async fn test_direct_mode() {
        let allocator = Arc::new(MockTsoAllocator::new(100, 8));
        let client = GlobalTsoClient::direct(allocator);
        let ts = client.get_global_tso().await.unwrap();
        assert_eq!(ts.get_physical(), 100);
        assert_eq!(ts.get_logical(), 9);
    }

    #[tokio::test]
    async fn test_proxy_mode_without_primary() {
        struct NoPrimary;
        impl ServiceWatcher for NoPrimary {
            fn primary(&self) -> Option<String> {
                None
            }
            fn service_addrs(&self) -> Vec<String> {
                vec![]
            }
            fn force_load(&self) {}
        }
        let env = Arc::new(grpcio::EnvBuilder::new().cq_count(1).build());
        let pool = Arc::new(ConnPool::new(
            env,
            Arc::new(crate::security::SecurityManager::default()),
        ));
        let client = GlobalTsoClient::proxy(7, Arc::new(NoPrimary), pool);
        match client.get_global_tso().await {
            Err(Error::NotFoundTsoAddr) => {}
            other => panic!("unexpected {:?}", other),
        }
    }
}
