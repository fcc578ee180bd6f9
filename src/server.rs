// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Assembly of the frontend: collaborator wiring, the worker runtime the
//! stream tasks run on, and the gRPC server itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use grpcio::{EnvBuilder, Environment, Server as GrpcioServer, ServerBuilder};
use kvproto::pdpb::{create_pd, ErrorType, RequestHeader, ResponseHeader};

use crate::cluster::{
    ElectionMember, GcSafePointManager, RaftCluster, RegionSyncer, ServiceWatcher, TsoAllocator,
};
use crate::config::Config;
use crate::conn::ConnPool;
use crate::errors::error_header;
use crate::forward::{RequestMeta, SchedulingClientCache};
use crate::global_config::MetaStore;
use crate::global_tso::GlobalTsoClient;
use crate::hbstream::HeartbeatStreams;
use crate::ratelimit::RateLimiter;
use crate::security::SecurityManager;
use crate::service::GrpcService;
use crate::tso_proxy::TsoProxyDispatcher;
use crate::util::CancelContext;
use crate::{box_err, Error, Result};

/// The external collaborators a frontend routes into.
pub struct Collaborators {
    pub member: Arc<dyn ElectionMember>,
    pub cluster: Arc<dyn RaftCluster>,
    pub allocator: Arc<dyn TsoAllocator>,
    pub gc: Arc<dyn GcSafePointManager>,
    pub syncer: Arc<dyn RegionSyncer>,
    pub meta_store: Arc<dyn MetaStore>,
    /// Present iff the TSO service runs independently of this member.
    pub tso_watcher: Option<Arc<dyn ServiceWatcher>>,
    /// Present iff the scheduling service runs independently.
    pub scheduling_watcher: Option<Arc<dyn ServiceWatcher>>,
}

pub struct PdServer {
    pub cfg: Config,
    cluster_id: u64,
    pub local_urls: Vec<String>,
    closed: AtomicBool,
    ctx: CancelContext,
    env: Arc<Environment>,
    security_mgr: Arc<SecurityManager>,
    pub pool: Arc<ConnPool>,

    pub member: Arc<dyn ElectionMember>,
    pub cluster: Arc<dyn RaftCluster>,
    pub allocator: Arc<dyn TsoAllocator>,
    pub gc: Arc<dyn GcSafePointManager>,
    pub syncer: Arc<dyn RegionSyncer>,
    pub meta_store: Arc<dyn MetaStore>,
    tso_watcher: Option<Arc<dyn ServiceWatcher>>,

    pub scheduling_cache: SchedulingClientCache,
    pub tso_dispatcher: TsoProxyDispatcher,
    pub global_tso: GlobalTsoClient,
    pub hb_streams: HeartbeatStreams,
    pub limiter: RateLimiter,

    runtime_handle: tokio::runtime::Handle,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    grpc_server: Mutex<Option<GrpcioServer>>,
}

impl PdServer {
    pub fn new(cfg: Config, cluster_id: u64, collaborators: Collaborators) -> Result<Arc<PdServer>> {
        cfg.validate()?;
        let security_mgr =
            Arc::new(SecurityManager::new(&cfg.security).map_err(|e| box_err!(e))?);
        let env = Arc::new(EnvBuilder::new().name_prefix("grpc-pd").build());
        let pool = Arc::new(ConnPool::new(env.clone(), security_mgr.clone()));
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("pd-stream-worker")
            .build()
            .map_err(Error::Io)?;
        let ctx = CancelContext::new();

        let tso_dispatcher = TsoProxyDispatcher::new(
            ctx.clone(),
            runtime.handle().clone(),
            pool.clone(),
            collaborators.tso_watcher.clone(),
            cluster_id,
            cfg.tso_proxy_batch_timeout.0,
            cfg.tso_proxy_idle_timeout.0,
        );
        let global_tso = match &collaborators.tso_watcher {
            Some(watcher) => GlobalTsoClient::proxy(cluster_id, watcher.clone(), pool.clone()),
            None => GlobalTsoClient::direct(collaborators.allocator.clone()),
        };
        let (hb_streams, hb_runner) =
            HeartbeatStreams::new(ctx.clone(), cluster_id, collaborators.cluster.clone());
        runtime.spawn(hb_runner);
        let limiter = RateLimiter::new(cfg.enable_grpc_rate_limit, &cfg.grpc_rate_limits);
        let runtime_handle = runtime.handle().clone();

        Ok(Arc::new(PdServer {
            local_urls: cfg.local_urls(),
            cluster_id,
            closed: AtomicBool::new(false),
            ctx,
            env,
            security_mgr,
            pool,
            member: collaborators.member,
            cluster: collaborators.cluster,
            allocator: collaborators.allocator,
            gc: collaborators.gc,
            syncer: collaborators.syncer,
            meta_store: collaborators.meta_store,
            tso_watcher: collaborators.tso_watcher,
            scheduling_cache: SchedulingClientCache::new(collaborators.scheduling_watcher),
            tso_dispatcher,
            global_tso,
            hb_streams,
            limiter,
            runtime_handle,
            runtime: Mutex::new(Some(runtime)),
            grpc_server: Mutex::new(None),
            cfg,
        }))
    }

    /// Binds and starts the gRPC server on every configured client URL.
    pub fn start(self: &Arc<Self>) -> Result<Vec<(String, u16)>> {
        let service = create_pd(GrpcService::new(self.clone()));
        let mut sb = ServerBuilder::new(self.env.clone()).register_service(service);
        for url in &self.cfg.client_urls {
            let url = url
                .trim_start_matches("http://")
                .trim_start_matches("https://");
            let (host, port) = url
                .rsplit_once(':')
                .ok_or_else(|| Error::InvalidValue(format!("invalid client url {:?}", url)))?;
            let port: u16 = port
                .parse()
                .map_err(|_| Error::InvalidValue(format!("invalid port in {:?}", url)))?;
            sb = self.security_mgr.bind(sb, host, port);
        }
        let mut server = sb.build()?;
        server.start();
        let addrs: Vec<_> = server
            .bind_addrs()
            .map(|(host, port)| (host.clone(), port))
            .collect();
        info!("pd frontend is started"; "addrs" => ?addrs);
        *self.grpc_server.lock().unwrap() = Some(server);
        Ok(addrs)
    }

    /// Stops serving: cancels every stream task and shuts the gRPC server
    /// down. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down pd frontend");
        self.ctx.cancel("server is closed");
        if let Some(mut server) = self.grpc_server.lock().unwrap().take() {
            let _ = server.shutdown();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn ctx(&self) -> &CancelContext {
        &self.ctx
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        &self.runtime_handle
    }

    pub fn is_tso_service_independent(&self) -> bool {
        self.tso_watcher.is_some()
    }

    pub fn tso_service_addrs(&self) -> Vec<String> {
        self.tso_watcher
            .as_ref()
            .map(|w| w.service_addrs())
            .unwrap_or_default()
    }

    pub fn dial_timeout(&self) -> Duration {
        self.cfg.dial_timeout.0
    }

    // Response header builders.

    pub fn header(&self) -> ResponseHeader {
        if self.cluster_id == 0 {
            return self.wrap_error(ErrorType::NotBootstrapped, "cluster id is not ready");
        }
        let mut header = ResponseHeader::default();
        header.set_cluster_id(self.cluster_id);
        header
    }

    pub fn wrap_error(&self, err_type: ErrorType, message: impl Into<String>) -> ResponseHeader {
        error_header(self.cluster_id, err_type, message)
    }

    pub fn not_bootstrapped_header(&self) -> ResponseHeader {
        self.wrap_error(ErrorType::NotBootstrapped, "cluster is not bootstrapped")
    }

    pub fn region_not_found_header(&self) -> ResponseHeader {
        self.wrap_error(ErrorType::RegionNotFound, "region not found")
    }

    pub fn invalid_value_header(&self, message: impl Into<String>) -> ResponseHeader {
        self.wrap_error(ErrorType::InvalidValue, message)
    }

    pub fn incompatible_version_header(&self, tag: &str) -> ResponseHeader {
        self.wrap_error(
            ErrorType::IncompatibleVersion,
            format!(
                "{} incompatible with current cluster version {}",
                tag,
                self.cluster.cluster_version()
            ),
        )
    }

    // Admission.

    /// Checks server liveness, leader role (honoring follower opt-in when the
    /// RPC permits it) and the cluster id, in that order.
    pub fn validate_role(
        &self,
        meta: &RequestMeta,
        header: &RequestHeader,
        mut allow_follower: Option<&mut bool>,
    ) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotStarted);
        }
        if !self.member.is_leader() {
            match allow_follower.as_deref_mut() {
                None => return Err(Error::NotLeader),
                Some(follower) => {
                    if !meta.follower_handle {
                        return Err(Error::FollowerHandlingNotAllowed);
                    }
                    *follower = true;
                }
            }
        }
        if header.get_cluster_id() != self.cluster_id {
            return Err(Error::ClusterMismatch {
                expect: self.cluster_id,
                got: header.get_cluster_id(),
            });
        }
        Ok(())
    }

    /// Admission of peer-to-peer RPCs: the sender must be the leader when
    /// flagged. Cluster-id mismatch is intentionally not re-checked here.
    pub fn validate_internal(&self, header: &RequestHeader, only_allow_leader: bool) -> Result<()> {
        if self.is_closed() {
            return Err(Error::NotStarted);
        }
        if only_allow_leader {
            let leader_id = self.member.leader().map_or(0, |m| m.get_member_id());
            if leader_id != header.get_sender_id() {
                return Err(Error::MismatchLeader {
                    expect: leader_id,
                    got: header.get_sender_id(),
                });
            }
        }
        Ok(())
    }
}

impl Drop for PdServer {
    fn drop(&mut self) {
        self.shutdown();
        // The last reference may be dropped from inside a worker task, so
        // the runtime must not be torn down in place.
        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            runtime.shutdown_background();
        }
    }
}
