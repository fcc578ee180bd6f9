// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Request metadata of the forwarding protocol, and the cached client to the
//! scheduling service.
//!
//! A request carrying `pd-forwarded-host` names the peer that should process
//! it. The outbound leg of a forward never re-attaches the header, so a
//! forwarded request can hop at most once.

use std::sync::{Arc, Mutex};

use grpcio::RpcContext;
use kvproto::schedulingpb::SchedulingClient;

use crate::cluster::ServiceWatcher;
use crate::conn::ConnPool;
use crate::{Error, Result, FOLLOWER_HANDLE_KEY, FORWARDED_HOST_KEY};

/// What the admission layer reads out of the request context.
#[derive(Clone, Debug, Default)]
pub struct RequestMeta {
    pub forwarded_host: Option<String>,
    pub follower_handle: bool,
}

impl RequestMeta {
    pub fn from_ctx(ctx: &RpcContext<'_>) -> RequestMeta {
        let mut meta = RequestMeta::default();
        for (key, value) in ctx.request_headers().iter() {
            if key.eq_ignore_ascii_case(FORWARDED_HOST_KEY) {
                if let Ok(host) = std::str::from_utf8(value) {
                    if !host.is_empty() {
                        meta.forwarded_host = Some(host.to_owned());
                    }
                }
            } else if key.eq_ignore_ascii_case(FOLLOWER_HANDLE_KEY) {
                meta.follower_handle =
                    std::str::from_utf8(value).map_or(false, |v| v.eq_ignore_ascii_case("true"));
            }
        }
        meta
    }

    /// The forwarded host, unless it already points at this member. A local
    /// forwarded host is served locally, never re-forwarded.
    pub fn nonlocal_forwarded_host(&self, local_urls: &[String]) -> Option<&str> {
        match &self.forwarded_host {
            Some(host) if !local_urls.iter().any(|u| u == host) => Some(host),
            _ => None,
        }
    }
}

/// The scheduling-service client record. The embedded stub is always the one
/// dialed against `primary`; an empty record is the reset sentinel.
pub struct SchedulingStub {
    client: Option<SchedulingClient>,
    primary: String,
}

impl SchedulingStub {
    fn empty() -> SchedulingStub {
        SchedulingStub {
            client: None,
            primary: String::new(),
        }
    }

    pub fn client(&self) -> Option<&SchedulingClient> {
        self.client.as_ref()
    }

    pub fn primary(&self) -> &str {
        &self.primary
    }
}

/// Process-wide cache of the scheduling client. Readers replace a stale
/// record atomically; a failing caller swaps in the empty sentinel so the
/// next caller rebuilds.
pub struct SchedulingClientCache {
    watcher: Option<Arc<dyn ServiceWatcher>>,
    cached: Mutex<Arc<SchedulingStub>>,
}

impl SchedulingClientCache {
    pub fn new(watcher: Option<Arc<dyn ServiceWatcher>>) -> SchedulingClientCache {
        SchedulingClientCache {
            watcher,
            cached: Mutex::new(Arc::new(SchedulingStub::empty())),
        }
    }

    /// Whether scheduling runs as an independent service at all.
    pub fn is_independent(&self) -> bool {
        self.watcher.is_some()
    }

    /// Returns a record whose primary matches the watcher's current one,
    /// dialing a new client when the cached record is stale.
    pub fn update(&self, pool: &ConnPool) -> Result<Arc<SchedulingStub>> {
        let watcher = self.watcher.as_ref().ok_or(Error::NotFoundSchedulingAddr)?;
        let primary = match watcher.primary() {
            Some(addr) if !addr.is_empty() => addr,
            _ => return Err(Error::NotFoundSchedulingAddr),
        };

        let mut cached = self.cached.lock().unwrap();
        if cached.primary == primary && cached.client.is_some() {
            return Ok(cached.clone());
        }
        let channel = pool.get(&primary);
        let stub = Arc::new(SchedulingStub {
            client: Some(SchedulingClient::new(channel)),
            primary: primary.clone(),
        });
        info!("update scheduling client";
            "old-forwarded-host" => %cached.primary,
            "new-forwarded-host" => %primary);
        *cached = stub.clone();
        Ok(stub)
    }

    /// Resets the cache to the empty sentinel, but only if `observed` is
    /// still the current record; a record replaced in the meantime stays.
    pub fn reset_on_failure(&self, observed: &Arc<SchedulingStub>) {
        let mut cached = self.cached.lock().unwrap();
        if Arc::ptr_eq(&cached, observed) {
            *cached = Arc::new(SchedulingStub::empty());
        }
    }
}
