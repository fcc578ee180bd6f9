// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The `Pd` gRPC service: admission, local handling and forwarding for every
//! RPC of the cluster surface.
//!
//! Unary requests run through the same middleware the original exposes: rate
//! limit, then the forwarded-host check (a non-local forwarded host makes
//! this member a relay), then role and cluster-id validation. Long-lived
//! streams get a dedicated task on the server runtime with guarded
//! send/receive and per-stream forwarding state.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use grpcio::{
    CallOption, ClientDuplexSender, ClientStreamingSink, DuplexSink, RequestStream, RpcContext,
    ServerStreamingSink, UnarySink,
};
use kvproto::pdpb::{self, ErrorType, Pd, PdClient};
use kvproto::{metapb, schedulingpb};
use tokio::sync::mpsc;

use crate::cluster::RegionRecord;
use crate::forward::RequestMeta;
use crate::global_config;
use crate::guard::{
    self, with_flags, GuardKind, GuardedClientStreamSink, GuardedReceiver, DEFAULT_SEND_TIMEOUT,
};
use crate::hbstream::HeartbeatStream;
use crate::metrics::*;
use crate::min_ts;
use crate::server::PdServer;
use crate::tso_proxy::{ProxiedTsoRequest, TsoResponseSink};
use crate::util::{self, compose_ts, CancelContext};
use crate::{box_err, Error, Result};

/// Admits one request of `$name`, answering rate-limit denials in the
/// response header the way unary handlers must.
macro_rules! rate_limit {
    ($server:expr, $name:literal, $resp:ty) => {
        let _rate_guard = match $server.limiter.allow($name) {
            Ok(guard) => guard,
            Err(e) => {
                let mut resp = <$resp>::default();
                resp.set_header($server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                return Ok(resp);
            }
        };
    };
}

/// Relays the request to the forwarded host and returns its reply verbatim.
/// The outgoing call carries no forwarded-host header, so the hop count is
/// bounded at one.
macro_rules! forward_unary {
    ($server:expr, $meta:expr, $req:expr, $method:ident) => {
        if let Some(host) = $meta.nonlocal_forwarded_host(&$server.local_urls) {
            let client = PdClient::new($server.pool.get(host));
            let resp = match client.$method(&$req, CallOption::default()) {
                Ok(receiver) => receiver.await,
                Err(e) => Err(e),
            };
            match resp {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    let e = Error::from(e);
                    if e.need_rebuild_connection() {
                        $server.pool.close(host);
                    }
                    return Err(e);
                }
            }
        }
    };
}

/// Answers `NOT_BOOTSTRAPPED` when the cluster state is not running here.
macro_rules! cluster_or_return {
    ($server:expr, $resp:ty) => {
        if !$server.cluster.is_running() {
            let mut resp = <$resp>::default();
            resp.set_header($server.not_bootstrapped_header());
            return Ok(resp);
        }
    };
}

/// Service handles the RPC messages for the `Pd` service.
#[derive(Clone)]
pub struct GrpcService {
    server: Arc<PdServer>,
}

impl GrpcService {
    pub fn new(server: Arc<PdServer>) -> GrpcService {
        GrpcService { server }
    }

    /// Drives a unary handler future and maps its outcome onto the sink.
    fn handle_unary<R: Send + 'static>(
        &self,
        ctx: &RpcContext<'_>,
        tag: &'static str,
        sink: UnarySink<R>,
        fut: impl std::future::Future<Output = Result<R>> + Send + 'static,
    ) {
        ctx.spawn(async move {
            let res = match fut.await {
                Ok(resp) => sink.success(resp).await,
                Err(e) => sink.fail(e.rpc_status()).await,
            };
            if let Err(e) = res {
                debug!("rpc failed to reply"; "request" => tag, "err" => ?e);
            }
        });
    }

    /// Spawns a long-lived stream task on the server runtime.
    fn spawn_stream(
        &self,
        tag: &'static str,
        fut: impl std::future::Future<Output = Result<()>> + Send + 'static,
    ) {
        self.server.handle().spawn(util::log_panic(tag, async move {
            if let Err(e) = fut.await {
                warn!("stream rpc terminated"; "request" => tag, "err" => ?e);
            }
        }));
    }
}

/// Tombstone check shared by the store-facing handlers. `None` means the
/// store may proceed (including stores this member does not know).
fn check_store(server: &PdServer, store_id: u64) -> Option<pdpb::ResponseHeader> {
    let store = server.cluster.get_store(store_id)?;
    if store.get_node_state() == metapb::NodeState::Removed {
        return Some(server.wrap_error(ErrorType::StoreTombstone, "store is tombstone"));
    }
    None
}

/// Schedules remove-peer operators for every damaged region a store names.
/// Failures are logged, the heartbeat itself never fails on them.
fn handle_damaged_store(server: &PdServer, stats: &pdpb::StoreStats) {
    for region_id in stats.get_damaged_regions_id() {
        match server
            .cluster
            .add_remove_peer_operator(*region_id, stats.get_store_id())
        {
            Ok(()) => {
                info!("added remove peer operator due to damaged region";
                    "region-id" => *region_id, "store-id" => stats.get_store_id());
            }
            Err(e) => {
                warn!("store damaged but can't add remove peer operator";
                    "region-id" => *region_id, "store-id" => stats.get_store_id(),
                    "err" => ?e);
            }
        }
    }
}

fn fill_region_resp(
    server: &PdServer,
    resp: &mut pdpb::GetRegionResponse,
    record: RegionRecord,
    need_buckets: bool,
) {
    resp.set_header(server.header());
    resp.set_region(record.region);
    if let Some(leader) = record.leader {
        resp.set_leader(leader);
    }
    resp.set_down_peers(record.down_peers.into());
    resp.set_pending_peers(record.pending_peers.into());
    if need_buckets {
        if let Some(buckets) = record.buckets {
            resp.set_buckets(buckets);
        }
    }
}

/// Buckets ride in region responses only on the leader path, on request,
/// with the bucket feature enabled.
fn buckets_wanted(server: &PdServer, follower: bool, need_buckets: bool) -> bool {
    !follower && need_buckets && server.cluster.is_region_bucket_enabled()
}

fn convert_sched_header(header: &schedulingpb::ResponseHeader) -> pdpb::ResponseHeader {
    let mut out = pdpb::ResponseHeader::default();
    out.set_cluster_id(header.get_cluster_id());
    if header.has_error() && header.get_error().get_field_type() == schedulingpb::ErrorType::Unknown
    {
        let err_type = if header.get_error().get_message().contains("region not found") {
            ErrorType::RegionNotFound
        } else {
            ErrorType::Unknown
        };
        let mut err = pdpb::Error::default();
        err.set_field_type(err_type);
        err.set_message(header.get_error().get_message().to_owned());
        out.set_error(err);
    }
    out
}

/// Calls to the scheduling peer are bounded by the dial timeout; the caller
/// resets the cached client on failure anyway.
fn sched_call_opt(server: &PdServer) -> CallOption {
    CallOption::default().timeout(server.dial_timeout())
}

fn sched_request_header(header: &pdpb::RequestHeader) -> schedulingpb::RequestHeader {
    let mut out = schedulingpb::RequestHeader::default();
    out.set_cluster_id(header.get_cluster_id());
    out.set_sender_id(header.get_sender_id());
    out
}

fn convert_sched_hb_resp(
    mut resp: schedulingpb::RegionHeartbeatResponse,
) -> pdpb::RegionHeartbeatResponse {
    let mut out = pdpb::RegionHeartbeatResponse::default();
    let mut header = pdpb::ResponseHeader::default();
    header.set_cluster_id(resp.get_header().get_cluster_id());
    out.set_header(header);
    out.set_region_id(resp.get_region_id());
    if resp.has_region_epoch() {
        out.set_region_epoch(resp.take_region_epoch());
    }
    if resp.has_target_peer() {
        out.set_target_peer(resp.take_target_peer());
    }
    if resp.has_change_peer() {
        out.set_change_peer(resp.take_change_peer());
    }
    if resp.has_transfer_leader() {
        out.set_transfer_leader(resp.take_transfer_leader());
    }
    if resp.has_merge() {
        out.set_merge(resp.take_merge());
    }
    if resp.has_split_region() {
        out.set_split_region(resp.take_split_region());
    }
    if resp.has_change_peer_v2() {
        out.set_change_peer_v2(resp.take_change_peer_v2());
    }
    if resp.has_switch_witnesses() {
        out.set_switch_witnesses(resp.take_switch_witnesses());
    }
    out
}

fn sched_hb_request(req: &pdpb::RegionHeartbeatRequest) -> schedulingpb::RegionHeartbeatRequest {
    let mut out = schedulingpb::RegionHeartbeatRequest::default();
    out.set_header(sched_request_header(req.get_header()));
    out.set_region(req.get_region().clone());
    out.set_leader(req.get_leader().clone());
    out.set_down_peers(req.get_down_peers().to_vec().into());
    out.set_pending_peers(req.get_pending_peers().to_vec().into());
    out.set_bytes_written(req.get_bytes_written());
    out.set_bytes_read(req.get_bytes_read());
    out.set_keys_written(req.get_keys_written());
    out.set_keys_read(req.get_keys_read());
    out.set_approximate_size(req.get_approximate_size());
    out.set_approximate_keys(req.get_approximate_keys());
    out.set_interval(req.get_interval().clone());
    out.set_term(req.get_term());
    out.set_query_stats(req.get_query_stats().clone());
    out
}

/// Per-stream state of one upstream forward for heartbeat-class streams.
struct StreamForward<Req> {
    host: String,
    sink: ClientDuplexSender<Req>,
    err_rx: mpsc::Receiver<Error>,
    cancel: CancelContext,
}

impl<Req> StreamForward<Req> {
    /// The non-blocking error-channel probe done after every relayed send.
    fn take_error(&mut self) -> Option<Error> {
        self.err_rx.try_recv().ok()
    }
}

impl<Req> Drop for StreamForward<Req> {
    fn drop(&mut self) {
        self.cancel.cancel("forward stream is replaced or finished");
    }
}

impl Pd for GrpcService {
    // ---- id-learning RPCs: no cluster-id check on purpose, clients learn
    // the id from these.

    fn get_members(
        &mut self,
        ctx: RpcContext<'_>,
        _req: pdpb::GetMembersRequest,
        sink: UnarySink<pdpb::GetMembersResponse>,
    ) {
        let server = self.server.clone();
        self.handle_unary(&ctx, "get_members", sink, async move {
            rate_limit!(server, "GetMembers", pdpb::GetMembersResponse);
            if server.is_closed() {
                let mut resp = pdpb::GetMembersResponse::default();
                resp.set_header(server.wrap_error(ErrorType::Unknown, "server not started"));
                return Ok(resp);
            }
            let mut resp = pdpb::GetMembersResponse::default();
            let members = match server.member.members() {
                Ok(members) => members,
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                    return Ok(resp);
                }
            };
            let etcd_leader_id = server.member.etcd_leader_id();
            if let Some(etcd_leader) = members.iter().find(|m| m.get_member_id() == etcd_leader_id)
            {
                resp.set_etcd_leader(etcd_leader.clone());
            }
            if let Some(leader) = server.member.leader() {
                if let Some(member) = members
                    .iter()
                    .find(|m| m.get_member_id() == leader.get_member_id())
                {
                    resp.set_leader(member.clone());
                }
            }
            resp.set_tso_allocator_leaders(server.member.tso_allocator_leaders());
            resp.set_members(members.into());
            resp.set_header(server.header());
            Ok(resp)
        });
    }

    fn get_cluster_info(
        &mut self,
        ctx: RpcContext<'_>,
        _req: pdpb::GetClusterInfoRequest,
        sink: UnarySink<pdpb::GetClusterInfoResponse>,
    ) {
        let server = self.server.clone();
        self.handle_unary(&ctx, "get_cluster_info", sink, async move {
            let mut resp = pdpb::GetClusterInfoResponse::default();
            if server.is_closed() {
                resp.set_header(server.wrap_error(ErrorType::Unknown, "server not started"));
                return Ok(resp);
            }
            if server.is_tso_service_independent() {
                resp.set_service_modes(vec![pdpb::ServiceMode::ApiSvcMode]);
                resp.set_tso_urls(server.tso_service_addrs().into());
            } else {
                resp.set_service_modes(vec![pdpb::ServiceMode::PdSvcMode]);
            }
            resp.set_header(server.header());
            Ok(resp)
        });
    }

    // ---- ordinary unary RPCs.

    fn bootstrap(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::BootstrapRequest,
        sink: UnarySink<pdpb::BootstrapResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "bootstrap", sink, async move {
            rate_limit!(server, "Bootstrap", pdpb::BootstrapResponse);
            forward_unary!(server, meta, req, bootstrap_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let mut resp = pdpb::BootstrapResponse::default();
            if server.cluster.is_running() {
                resp.set_header(server.wrap_error(
                    ErrorType::AlreadyBootstrapped,
                    "cluster is already bootstrapped",
                ));
                return Ok(resp);
            }
            if let Err(e) = server.cluster.bootstrap(&req) {
                resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                return Ok(resp);
            }
            resp.set_header(server.header());
            Ok(resp)
        });
    }

    fn is_bootstrapped(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::IsBootstrappedRequest,
        sink: UnarySink<pdpb::IsBootstrappedResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "is_bootstrapped", sink, async move {
            rate_limit!(server, "IsBootstrapped", pdpb::IsBootstrappedResponse);
            forward_unary!(server, meta, req, is_bootstrapped_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let mut resp = pdpb::IsBootstrappedResponse::default();
            resp.set_header(server.header());
            resp.set_bootstrapped(server.cluster.is_running());
            Ok(resp)
        });
    }

    fn alloc_id(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::AllocIdRequest,
        sink: UnarySink<pdpb::AllocIdResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "alloc_id", sink, async move {
            rate_limit!(server, "AllocID", pdpb::AllocIdResponse);
            forward_unary!(server, meta, req, alloc_id_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let mut resp = pdpb::AllocIdResponse::default();
            match server.cluster.alloc_id() {
                Ok(id) => {
                    resp.set_header(server.header());
                    resp.set_id(id);
                }
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                }
            }
            Ok(resp)
        });
    }

    fn is_snapshot_recovering(
        &mut self,
        ctx: RpcContext<'_>,
        _req: pdpb::IsSnapshotRecoveringRequest,
        sink: UnarySink<pdpb::IsSnapshotRecoveringResponse>,
    ) {
        let server = self.server.clone();
        self.handle_unary(&ctx, "is_snapshot_recovering", sink, async move {
            rate_limit!(server, "IsSnapshotRecovering", pdpb::IsSnapshotRecoveringResponse);
            if server.is_closed() {
                return Err(Error::NotStarted);
            }
            // The recovering mark lives in the external store directly,
            // there is no need to forward.
            let mut resp = pdpb::IsSnapshotRecoveringResponse::default();
            match server.cluster.is_snapshot_recovering() {
                Ok(marked) => {
                    resp.set_header(server.header());
                    resp.set_marked(marked);
                }
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                }
            }
            Ok(resp)
        });
    }

    fn get_store(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetStoreRequest,
        sink: UnarySink<pdpb::GetStoreResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_store", sink, async move {
            rate_limit!(server, "GetStore", pdpb::GetStoreResponse);
            forward_unary!(server, meta, req, get_store_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::GetStoreResponse);

            let mut resp = pdpb::GetStoreResponse::default();
            match server.cluster.get_store(req.get_store_id()) {
                Some(store) => {
                    resp.set_header(server.header());
                    resp.set_store(store);
                }
                None => {
                    resp.set_header(server.wrap_error(
                        ErrorType::Unknown,
                        format!("invalid store ID {}, not found", req.get_store_id()),
                    ));
                }
            }
            Ok(resp)
        });
    }

    fn put_store(
        &mut self,
        ctx: RpcContext<'_>,
        mut req: pdpb::PutStoreRequest,
        sink: UnarySink<pdpb::PutStoreResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "put_store", sink, async move {
            rate_limit!(server, "PutStore", pdpb::PutStoreResponse);
            forward_unary!(server, meta, req, put_store_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::PutStoreResponse);

            let mut resp = pdpb::PutStoreResponse::default();
            let store = req.take_store();
            if let Some(header) = check_store(&server, store.get_id()) {
                resp.set_header(header);
                return Ok(resp);
            }
            if let Err(e) = server.cluster.put_store(store.clone()) {
                resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                return Ok(resp);
            }
            info!("put store ok"; "store" => ?store);
            resp.set_header(server.header());
            Ok(resp)
        });
    }

    fn get_all_stores(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetAllStoresRequest,
        sink: UnarySink<pdpb::GetAllStoresResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_all_stores", sink, async move {
            rate_limit!(server, "GetAllStores", pdpb::GetAllStoresResponse);
            forward_unary!(server, meta, req, get_all_stores_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::GetAllStoresResponse);

            let mut stores = server.cluster.get_stores();
            if req.get_exclude_tombstone_stores() {
                stores.retain(|s| s.get_node_state() != metapb::NodeState::Removed);
            }
            let mut resp = pdpb::GetAllStoresResponse::default();
            resp.set_header(server.header());
            resp.set_stores(stores.into());
            Ok(resp)
        });
    }

    fn store_heartbeat(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::StoreHeartbeatRequest,
        sink: UnarySink<pdpb::StoreHeartbeatResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "store_heartbeat", sink, async move {
            rate_limit!(server, "StoreHeartbeat", pdpb::StoreHeartbeatResponse);
            forward_unary!(server, meta, req, store_heartbeat_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            if !req.has_stats() {
                return Err(box_err!("invalid store heartbeat command"));
            }
            cluster_or_return!(server, pdpb::StoreHeartbeatResponse);

            let mut resp = pdpb::StoreHeartbeatResponse::default();
            let store_id = req.get_stats().get_store_id();
            if let Some(header) = check_store(&server, store_id) {
                resp.set_header(header);
                return Ok(resp);
            }
            if server.cluster.get_store(store_id).is_none() {
                resp.set_header(server.wrap_error(
                    ErrorType::Unknown,
                    format!("store {} not found", store_id),
                ));
                return Ok(resp);
            }

            resp.set_header(server.header());
            if !req.has_store_report() {
                let start = Instant::now();
                if let Err(e) = server.cluster.handle_store_heartbeat(&req, &mut resp) {
                    let mut failed = pdpb::StoreHeartbeatResponse::default();
                    failed.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                    return Ok(failed);
                }
                handle_damaged_store(&server, req.get_stats());
                STORE_HEARTBEAT_HANDLE_DURATION_HISTOGRAM
                    .observe(start.elapsed().as_secs_f64());

                if server.scheduling_cache.is_independent() {
                    if let Ok(stub) = server.scheduling_cache.update(&server.pool) {
                        if let Some(cli) = stub.client() {
                            let mut sched_req = schedulingpb::StoreHeartbeatRequest::default();
                            sched_req.set_header(sched_request_header(req.get_header()));
                            sched_req.set_stats(req.get_stats().clone());
                            let res = match cli
                                .store_heartbeat_async_opt(&sched_req, sched_call_opt(&server))
                            {
                                Ok(receiver) => receiver.await.map(|_| ()),
                                Err(e) => Err(e),
                            };
                            if let Err(e) = res {
                                FORWARD_FAIL_COUNTER_VEC
                                    .with_label_values(&["store_heartbeat", "send"])
                                    .inc();
                                debug!("forward store heartbeat failed"; "err" => ?e);
                                // Reset to let it be updated in the next request.
                                server.scheduling_cache.reset_on_failure(&stub);
                            }
                        }
                    }
                }
            }
            resp.set_cluster_version(server.cluster.cluster_version());
            Ok(resp)
        });
    }

    // ---- region reads: follower handling permitted on opt-in.

    fn get_region(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetRegionRequest,
        sink: UnarySink<pdpb::GetRegionResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_region", sink, async move {
            rate_limit!(server, "GetRegion", pdpb::GetRegionResponse);
            forward_unary!(server, meta, req, get_region_async_opt);
            let mut follower = false;
            server.validate_role(&meta, req.get_header(), Some(&mut follower))?;

            let mut resp = pdpb::GetRegionResponse::default();
            if follower {
                if !server.cluster.is_syncer_running() {
                    resp.set_header(server.region_not_found_header());
                    return Ok(resp);
                }
            } else if !server.cluster.is_running() {
                resp.set_header(server.not_bootstrapped_header());
                return Ok(resp);
            }
            match server.cluster.get_region_by_key(req.get_region_key()) {
                Some(record) => {
                    let with_buckets = buckets_wanted(&server, follower, req.get_need_buckets());
                    fill_region_resp(&server, &mut resp, record, with_buckets);
                }
                None => {
                    warn!("get region nil"; "follower" => follower);
                    if follower {
                        resp.set_header(server.region_not_found_header());
                    } else {
                        resp.set_header(server.header());
                    }
                }
            }
            Ok(resp)
        });
    }

    fn get_prev_region(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetRegionRequest,
        sink: UnarySink<pdpb::GetRegionResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_prev_region", sink, async move {
            rate_limit!(server, "GetPrevRegion", pdpb::GetRegionResponse);
            forward_unary!(server, meta, req, get_prev_region_async_opt);
            let mut follower = false;
            server.validate_role(&meta, req.get_header(), Some(&mut follower))?;

            let mut resp = pdpb::GetRegionResponse::default();
            if follower {
                if !server.cluster.is_syncer_running() {
                    resp.set_header(server.region_not_found_header());
                    return Ok(resp);
                }
            } else if !server.cluster.is_running() {
                resp.set_header(server.not_bootstrapped_header());
                return Ok(resp);
            }
            match server.cluster.get_prev_region_by_key(req.get_region_key()) {
                Some(record) => {
                    let with_buckets = buckets_wanted(&server, follower, req.get_need_buckets());
                    fill_region_resp(&server, &mut resp, record, with_buckets);
                }
                None => {
                    if follower {
                        resp.set_header(server.region_not_found_header());
                    } else {
                        resp.set_header(server.header());
                    }
                }
            }
            Ok(resp)
        });
    }

    fn get_region_by_id(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetRegionByIdRequest,
        sink: UnarySink<pdpb::GetRegionResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_region_by_id", sink, async move {
            rate_limit!(server, "GetRegionByID", pdpb::GetRegionResponse);
            forward_unary!(server, meta, req, get_region_by_id_async_opt);
            let mut follower = false;
            server.validate_role(&meta, req.get_header(), Some(&mut follower))?;

            let mut resp = pdpb::GetRegionResponse::default();
            if follower {
                if !server.cluster.is_syncer_running() {
                    resp.set_header(server.region_not_found_header());
                    return Ok(resp);
                }
            } else if !server.cluster.is_running() {
                resp.set_header(server.region_not_found_header());
                return Ok(resp);
            }
            match server.cluster.get_region_by_id(req.get_region_id()) {
                Some(record) => {
                    let with_buckets = buckets_wanted(&server, follower, req.get_need_buckets());
                    fill_region_resp(&server, &mut resp, record, with_buckets);
                }
                None => {
                    if follower {
                        resp.set_header(server.region_not_found_header());
                    } else {
                        resp.set_header(server.header());
                    }
                }
            }
            Ok(resp)
        });
    }

    fn scan_regions(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::ScanRegionsRequest,
        sink: UnarySink<pdpb::ScanRegionsResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "scan_regions", sink, async move {
            rate_limit!(server, "ScanRegions", pdpb::ScanRegionsResponse);
            forward_unary!(server, meta, req, scan_regions_async_opt);
            let mut follower = false;
            server.validate_role(&meta, req.get_header(), Some(&mut follower))?;

            let mut resp = pdpb::ScanRegionsResponse::default();
            if follower {
                if !server.cluster.is_syncer_running() {
                    resp.set_header(server.region_not_found_header());
                    return Ok(resp);
                }
            } else if !server.cluster.is_running() {
                resp.set_header(server.not_bootstrapped_header());
                return Ok(resp);
            }
            let records = server.cluster.scan_regions(
                req.get_start_key(),
                req.get_end_key(),
                req.get_limit() as usize,
            );
            if follower && records.is_empty() {
                resp.set_header(server.region_not_found_header());
                return Ok(resp);
            }
            resp.set_header(server.header());
            for record in records {
                let leader = record.leader.clone().unwrap_or_default();
                // Fill the deprecated flat fields to stay compatible with
                // old clients.
                resp.mut_region_metas().push(record.region.clone());
                resp.mut_leaders().push(leader);
                resp.mut_regions().push(record.to_pdpb_region(false));
            }
            Ok(resp)
        });
    }

    fn batch_scan_regions(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::BatchScanRegionsRequest,
        sink: UnarySink<pdpb::BatchScanRegionsResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "batch_scan_regions", sink, async move {
            rate_limit!(server, "BatchScanRegions", pdpb::BatchScanRegionsResponse);
            forward_unary!(server, meta, req, batch_scan_regions_async_opt);
            let mut follower = false;
            server.validate_role(&meta, req.get_header(), Some(&mut follower))?;

            let mut resp = pdpb::BatchScanRegionsResponse::default();
            if follower {
                if !server.cluster.is_syncer_running() {
                    resp.set_header(server.region_not_found_header());
                    return Ok(resp);
                }
            } else if !server.cluster.is_running() {
                resp.set_header(server.not_bootstrapped_header());
                return Ok(resp);
            }

            let ranges = req.get_ranges();
            let mut key_ranges = Vec::with_capacity(ranges.len());
            for (i, range) in ranges.iter().enumerate() {
                if i > 0 && range.get_start_key() < ranges[i - 1].get_end_key() {
                    resp.set_header(server.wrap_error(
                        ErrorType::Unknown,
                        "invalid key range, ranges overlapped",
                    ));
                    return Ok(resp);
                }
                if !range.get_end_key().is_empty() && range.get_start_key() > range.get_end_key() {
                    resp.set_header(server.wrap_error(
                        ErrorType::Unknown,
                        "invalid key range, start key > end key",
                    ));
                    return Ok(resp);
                }
                key_ranges.push((range.get_start_key().to_vec(), range.get_end_key().to_vec()));
            }

            let with_buckets = buckets_wanted(&server, follower, req.get_need_buckets());
            let records = match server.cluster.batch_scan_regions(
                &key_ranges,
                req.get_limit() as usize,
                req.get_contain_all_key_range(),
            ) {
                Ok(records) => records,
                Err(Error::RegionsNotContainAllKeyRange(msg)) => {
                    resp.set_header(
                        server.wrap_error(ErrorType::RegionsNotContainAllKeyRange, msg),
                    );
                    return Ok(resp);
                }
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                    return Ok(resp);
                }
            };
            if follower && records.is_empty() {
                resp.set_header(server.region_not_found_header());
                return Ok(resp);
            }
            resp.set_header(server.header());
            for record in records {
                resp.mut_regions().push(record.to_pdpb_region(with_buckets));
            }
            Ok(resp)
        });
    }

    // ---- split and scatter.

    fn ask_split(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::AskSplitRequest,
        sink: UnarySink<pdpb::AskSplitResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "ask_split", sink, async move {
            rate_limit!(server, "AskSplit", pdpb::AskSplitResponse);
            forward_unary!(server, meta, req, ask_split_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::AskSplitResponse);

            let mut resp = pdpb::AskSplitResponse::default();
            if !req.has_region() {
                resp.set_header(
                    server.wrap_error(ErrorType::RegionNotFound, "missing region for split"),
                );
                return Ok(resp);
            }
            match server.cluster.handle_ask_split(&req) {
                Ok(split) => {
                    resp.set_header(server.header());
                    resp.set_new_region_id(split.new_region_id);
                    resp.set_new_peer_ids(split.new_peer_ids);
                }
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                }
            }
            Ok(resp)
        });
    }

    fn ask_batch_split(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::AskBatchSplitRequest,
        sink: UnarySink<pdpb::AskBatchSplitResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "ask_batch_split", sink, async move {
            rate_limit!(server, "AskBatchSplit", pdpb::AskBatchSplitResponse);
            cluster_or_return!(server, pdpb::AskBatchSplitResponse);

            if server.scheduling_cache.is_independent() {
                let mut resp = pdpb::AskBatchSplitResponse::default();
                let stub = match server.scheduling_cache.update(&server.pool) {
                    Ok(stub) => stub,
                    Err(e) => {
                        resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                        return Ok(resp);
                    }
                };
                if let Some(cli) = stub.client() {
                    let mut sched_req = schedulingpb::AskBatchSplitRequest::default();
                    sched_req.set_header(sched_request_header(req.get_header()));
                    sched_req.set_region(req.get_region().clone());
                    sched_req.set_split_count(req.get_split_count());
                    let res = match cli.ask_batch_split_async_opt(&sched_req, sched_call_opt(&server))
                    {
                        Ok(receiver) => receiver.await,
                        Err(e) => Err(e),
                    };
                    match res {
                        Ok(sched_resp) => {
                            resp.set_header(convert_sched_header(sched_resp.get_header()));
                            resp.set_ids(sched_resp.get_ids().to_vec().into());
                            return Ok(resp);
                        }
                        Err(e) => {
                            // Reset to let it be updated in the next request.
                            server.scheduling_cache.reset_on_failure(&stub);
                            return Err(e.into());
                        }
                    }
                }
            }

            forward_unary!(server, meta, req, ask_batch_split_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let mut resp = pdpb::AskBatchSplitResponse::default();
            if !server.cluster.is_feature_supported("batch_split") {
                resp.set_header(server.incompatible_version_header("batch_split"));
                return Ok(resp);
            }
            if !req.has_region() {
                resp.set_header(
                    server.wrap_error(ErrorType::RegionNotFound, "missing region for split"),
                );
                return Ok(resp);
            }
            match server.cluster.handle_ask_batch_split(&req) {
                Ok(splits) => {
                    resp.set_header(server.header());
                    for split in splits {
                        let mut id = pdpb::SplitId::default();
                        id.set_new_region_id(split.new_region_id);
                        id.set_new_peer_ids(split.new_peer_ids);
                        resp.mut_ids().push(id);
                    }
                }
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                }
            }
            Ok(resp)
        });
    }

    fn report_split(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::ReportSplitRequest,
        sink: UnarySink<pdpb::ReportSplitResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "report_split", sink, async move {
            rate_limit!(server, "ReportSplit", pdpb::ReportSplitResponse);
            forward_unary!(server, meta, req, report_split_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::ReportSplitResponse);

            let mut resp = pdpb::ReportSplitResponse::default();
            match server.cluster.handle_report_split(&req) {
                Ok(()) => resp.set_header(server.header()),
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)))
                }
            }
            Ok(resp)
        });
    }

    fn report_batch_split(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::ReportBatchSplitRequest,
        sink: UnarySink<pdpb::ReportBatchSplitResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "report_batch_split", sink, async move {
            rate_limit!(server, "ReportBatchSplit", pdpb::ReportBatchSplitResponse);
            forward_unary!(server, meta, req, report_batch_split_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::ReportBatchSplitResponse);

            let mut resp = pdpb::ReportBatchSplitResponse::default();
            match server.cluster.handle_report_batch_split(&req) {
                Ok(()) => resp.set_header(server.header()),
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)))
                }
            }
            Ok(resp)
        });
    }

    fn scatter_region(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::ScatterRegionRequest,
        sink: UnarySink<pdpb::ScatterRegionResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "scatter_region", sink, async move {
            rate_limit!(server, "ScatterRegion", pdpb::ScatterRegionResponse);
            cluster_or_return!(server, pdpb::ScatterRegionResponse);

            if server.scheduling_cache.is_independent() {
                let mut resp = pdpb::ScatterRegionResponse::default();
                let stub = match server.scheduling_cache.update(&server.pool) {
                    Ok(stub) => stub,
                    Err(e) => {
                        resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                        return Ok(resp);
                    }
                };
                if let Some(cli) = stub.client() {
                    let regions_id = if req.get_region_id() != 0 {
                        vec![req.get_region_id()]
                    } else {
                        req.get_regions_id().to_vec()
                    };
                    if regions_id.is_empty() {
                        resp.set_header(server.invalid_value_header("regions id is required"));
                        return Ok(resp);
                    }
                    let mut sched_req = schedulingpb::ScatterRegionsRequest::default();
                    sched_req.set_header(sched_request_header(req.get_header()));
                    sched_req.set_regions_id(regions_id);
                    sched_req.set_group(req.get_group().to_owned());
                    sched_req.set_retry_limit(req.get_retry_limit());
                    sched_req.set_skip_store_limit(req.get_skip_store_limit());
                    let res = match cli.scatter_regions_async_opt(&sched_req, sched_call_opt(&server))
                    {
                        Ok(receiver) => receiver.await,
                        Err(e) => Err(e),
                    };
                    match res {
                        Ok(sched_resp) => {
                            resp.set_header(convert_sched_header(sched_resp.get_header()));
                            resp.set_finished_percentage(sched_resp.get_finished_percentage());
                            return Ok(resp);
                        }
                        Err(e) => {
                            FORWARD_FAIL_COUNTER_VEC
                                .with_label_values(&["scatter_region", "send"])
                                .inc();
                            server.scheduling_cache.reset_on_failure(&stub);
                            return Err(e.into());
                        }
                    }
                }
            }

            forward_unary!(server, meta, req, scatter_region_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let mut resp = pdpb::ScatterRegionResponse::default();
            if !req.get_regions_id().is_empty() {
                let percentage = server.cluster.scatter_regions(
                    req.get_regions_id(),
                    req.get_group(),
                    req.get_retry_limit() as usize,
                    req.get_skip_store_limit(),
                )?;
                resp.set_header(server.header());
                resp.set_finished_percentage(percentage);
                return Ok(resp);
            }

            // The deprecated single-region form.
            let region_id = req.get_region_id();
            if server.cluster.get_region_by_id(region_id).is_none() && !req.has_region() {
                resp.set_header(
                    server.wrap_error(ErrorType::RegionNotFound, "region not found"),
                );
                return Ok(resp);
            }
            let percentage = server.cluster.scatter_regions(
                &[region_id],
                req.get_group(),
                req.get_retry_limit() as usize,
                req.get_skip_store_limit(),
            )?;
            resp.set_header(server.header());
            resp.set_finished_percentage(percentage);
            Ok(resp)
        });
    }

    fn split_regions(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::SplitRegionsRequest,
        sink: UnarySink<pdpb::SplitRegionsResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "split_regions", sink, async move {
            rate_limit!(server, "SplitRegions", pdpb::SplitRegionsResponse);
            cluster_or_return!(server, pdpb::SplitRegionsResponse);

            if server.scheduling_cache.is_independent() {
                let mut resp = pdpb::SplitRegionsResponse::default();
                let stub = match server.scheduling_cache.update(&server.pool) {
                    Ok(stub) => stub,
                    Err(e) => {
                        resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                        return Ok(resp);
                    }
                };
                if let Some(cli) = stub.client() {
                    let mut sched_req = schedulingpb::SplitRegionsRequest::default();
                    sched_req.set_header(sched_request_header(req.get_header()));
                    sched_req.set_split_keys(req.get_split_keys().to_vec().into());
                    sched_req.set_retry_limit(req.get_retry_limit());
                    let res = match cli.split_regions_async_opt(&sched_req, sched_call_opt(&server))
                    {
                        Ok(receiver) => receiver.await,
                        Err(e) => Err(e),
                    };
                    match res {
                        Ok(sched_resp) => {
                            resp.set_header(convert_sched_header(sched_resp.get_header()));
                            resp.set_finished_percentage(sched_resp.get_finished_percentage());
                            return Ok(resp);
                        }
                        Err(e) => {
                            FORWARD_FAIL_COUNTER_VEC
                                .with_label_values(&["split_regions", "send"])
                                .inc();
                            server.scheduling_cache.reset_on_failure(&stub);
                            return Err(e.into());
                        }
                    }
                }
            }

            forward_unary!(server, meta, req, split_regions_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let (percentage, new_region_ids) = server
                .cluster
                .split_regions(req.get_split_keys(), req.get_retry_limit() as usize);
            let mut resp = pdpb::SplitRegionsResponse::default();
            resp.set_header(server.header());
            resp.set_regions_id(new_region_ids);
            resp.set_finished_percentage(percentage);
            Ok(resp)
        });
    }

    fn split_and_scatter_regions(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::SplitAndScatterRegionsRequest,
        sink: UnarySink<pdpb::SplitAndScatterRegionsResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "split_and_scatter_regions", sink, async move {
            rate_limit!(
                server,
                "SplitAndScatterRegions",
                pdpb::SplitAndScatterRegionsResponse
            );
            forward_unary!(server, meta, req, split_and_scatter_regions_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::SplitAndScatterRegionsResponse);

            let (split_percentage, new_region_ids) = server
                .cluster
                .split_regions(req.get_split_keys(), req.get_retry_limit() as usize);
            let scatter_percentage = server.cluster.scatter_regions(
                &new_region_ids,
                req.get_group(),
                req.get_retry_limit() as usize,
                false,
            )?;
            let mut resp = pdpb::SplitAndScatterRegionsResponse::default();
            resp.set_header(server.header());
            resp.set_regions_id(new_region_ids);
            resp.set_split_finished_percentage(split_percentage);
            resp.set_scatter_finished_percentage(scatter_percentage);
            Ok(resp)
        });
    }

    fn get_operator(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetOperatorRequest,
        sink: UnarySink<pdpb::GetOperatorResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_operator", sink, async move {
            rate_limit!(server, "GetOperator", pdpb::GetOperatorResponse);
            cluster_or_return!(server, pdpb::GetOperatorResponse);

            if server.scheduling_cache.is_independent() {
                let mut resp = pdpb::GetOperatorResponse::default();
                let stub = match server.scheduling_cache.update(&server.pool) {
                    Ok(stub) => stub,
                    Err(e) => {
                        resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                        return Ok(resp);
                    }
                };
                if let Some(cli) = stub.client() {
                    let mut sched_req = schedulingpb::GetOperatorRequest::default();
                    sched_req.set_header(sched_request_header(req.get_header()));
                    sched_req.set_region_id(req.get_region_id());
                    let res = match cli.get_operator_async_opt(&sched_req, sched_call_opt(&server)) {
                        Ok(receiver) => receiver.await,
                        Err(e) => Err(e),
                    };
                    match res {
                        Ok(mut sched_resp) => {
                            resp.set_header(convert_sched_header(sched_resp.get_header()));
                            resp.set_region_id(sched_resp.get_region_id());
                            resp.set_desc(sched_resp.take_desc());
                            resp.set_kind(sched_resp.take_kind());
                            resp.set_status(sched_resp.get_status());
                            return Ok(resp);
                        }
                        Err(e) => {
                            FORWARD_FAIL_COUNTER_VEC
                                .with_label_values(&["get_operator", "send"])
                                .inc();
                            server.scheduling_cache.reset_on_failure(&stub);
                            return Err(e.into());
                        }
                    }
                }
            }

            forward_unary!(server, meta, req, get_operator_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let mut resp = pdpb::GetOperatorResponse::default();
            match server.cluster.get_operator(req.get_region_id()) {
                Some(record) => {
                    resp.set_header(server.header());
                    resp.set_region_id(record.region_id);
                    resp.set_desc(record.desc);
                    resp.set_kind(record.kind);
                    resp.set_status(record.status);
                }
                None => {
                    resp.set_header(server.wrap_error(ErrorType::RegionNotFound, "Not Found"));
                }
            }
            Ok(resp)
        });
    }

    // ---- cluster config.

    fn get_cluster_config(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetClusterConfigRequest,
        sink: UnarySink<pdpb::GetClusterConfigResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_cluster_config", sink, async move {
            rate_limit!(server, "GetClusterConfig", pdpb::GetClusterConfigResponse);
            forward_unary!(server, meta, req, get_cluster_config_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::GetClusterConfigResponse);

            let mut resp = pdpb::GetClusterConfigResponse::default();
            resp.set_header(server.header());
            resp.set_cluster(server.cluster.get_cluster_config());
            Ok(resp)
        });
    }

    fn put_cluster_config(
        &mut self,
        ctx: RpcContext<'_>,
        mut req: pdpb::PutClusterConfigRequest,
        sink: UnarySink<pdpb::PutClusterConfigResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "put_cluster_config", sink, async move {
            rate_limit!(server, "PutClusterConfig", pdpb::PutClusterConfigResponse);
            forward_unary!(server, meta, req, put_cluster_config_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::PutClusterConfigResponse);

            let mut resp = pdpb::PutClusterConfigResponse::default();
            let conf = req.take_cluster();
            if let Err(e) = server.cluster.put_cluster_config(conf.clone()) {
                resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                return Ok(resp);
            }
            info!("put cluster config ok"; "config" => ?conf);
            resp.set_header(server.header());
            Ok(resp)
        });
    }

    // ---- GC safepoints.

    fn get_gc_safe_point(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetGcSafePointRequest,
        sink: UnarySink<pdpb::GetGcSafePointResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_gc_safe_point", sink, async move {
            rate_limit!(server, "GetGCSafePoint", pdpb::GetGcSafePointResponse);
            forward_unary!(server, meta, req, get_gc_safe_point_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::GetGcSafePointResponse);

            let safe_point = server.gc.load_gc_safe_point()?;
            let mut resp = pdpb::GetGcSafePointResponse::default();
            resp.set_header(server.header());
            resp.set_safe_point(safe_point);
            Ok(resp)
        });
    }

    fn update_gc_safe_point(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::UpdateGcSafePointRequest,
        sink: UnarySink<pdpb::UpdateGcSafePointResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "update_gc_safe_point", sink, async move {
            rate_limit!(server, "UpdateGCSafePoint", pdpb::UpdateGcSafePointResponse);
            forward_unary!(server, meta, req, update_gc_safe_point_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::UpdateGcSafePointResponse);

            let mut new_safe_point = req.get_safe_point();
            let old_safe_point = server.gc.update_gc_safe_point(new_safe_point)?;
            if new_safe_point > old_safe_point {
                info!("updated gc safe point"; "safe-point" => new_safe_point);
            } else if new_safe_point < old_safe_point {
                warn!("trying to update gc safe point";
                    "old-safe-point" => old_safe_point, "new-safe-point" => new_safe_point);
                new_safe_point = old_safe_point;
            }
            let mut resp = pdpb::UpdateGcSafePointResponse::default();
            resp.set_header(server.header());
            resp.set_new_safe_point(new_safe_point);
            Ok(resp)
        });
    }

    fn update_service_gc_safe_point(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::UpdateServiceGcSafePointRequest,
        sink: UnarySink<pdpb::UpdateServiceGcSafePointResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "update_service_gc_safe_point", sink, async move {
            rate_limit!(
                server,
                "UpdateServiceGCSafePoint",
                pdpb::UpdateServiceGcSafePointResponse
            );
            forward_unary!(server, meta, req, update_service_gc_safe_point_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::UpdateServiceGcSafePointResponse);

            let service_id = String::from_utf8_lossy(req.get_service_id()).into_owned();
            if req.get_ttl() <= 0 {
                server.gc.remove_service_gc_safe_point(&service_id)?;
            }
            let now_ts = server.global_tso.get_global_tso().await?;
            let now_unix = now_ts.get_physical() / 1000;
            let (min, updated) = server.gc.update_service_gc_safe_point(
                service_id.clone(),
                req.get_safe_point(),
                req.get_ttl(),
                now_unix,
            )?;
            if updated {
                info!("update service GC safe point";
                    "service-id" => %service_id,
                    "expire-at" => now_unix + req.get_ttl(),
                    "safepoint" => req.get_safe_point());
            }
            let mut resp = pdpb::UpdateServiceGcSafePointResponse::default();
            resp.set_header(server.header());
            resp.set_service_id(min.service_id.into_bytes());
            resp.set_ttl(min.expired_at - now_unix);
            resp.set_min_safe_point(min.safe_point);
            Ok(resp)
        });
    }

    // ---- resolved/external timestamps.

    fn report_min_resolved_ts(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::ReportMinResolvedTsRequest,
        sink: UnarySink<pdpb::ReportMinResolvedTsResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "report_min_resolved_ts", sink, async move {
            rate_limit!(server, "ReportMinResolvedTS", pdpb::ReportMinResolvedTsResponse);
            forward_unary!(server, meta, req, report_min_resolved_ts_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;
            cluster_or_return!(server, pdpb::ReportMinResolvedTsResponse);

            server
                .cluster
                .set_min_resolved_ts(req.get_store_id(), req.get_min_resolved_ts())?;
            debug!("updated min resolved-ts";
                "store" => req.get_store_id(),
                "min-resolved-ts" => req.get_min_resolved_ts());
            let mut resp = pdpb::ReportMinResolvedTsResponse::default();
            resp.set_header(server.header());
            Ok(resp)
        });
    }

    fn set_external_timestamp(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::SetExternalTimestampRequest,
        sink: UnarySink<pdpb::SetExternalTimestampResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "set_external_timestamp", sink, async move {
            rate_limit!(
                server,
                "SetExternalTimestamp",
                pdpb::SetExternalTimestampResponse
            );
            forward_unary!(server, meta, req, set_external_timestamp_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let now_ts = server.global_tso.get_global_tso().await?;
            let global_ts = compose_ts(&now_ts);
            let external_ts = req.get_timestamp();
            debug!("try to set external timestamp";
                "external-ts" => external_ts, "global-ts" => global_ts);
            let mut resp = pdpb::SetExternalTimestampResponse::default();
            match server.cluster.set_external_timestamp(external_ts, global_ts) {
                Ok(()) => resp.set_header(server.header()),
                Err(e) => resp.set_header(server.invalid_value_header(format!("{}", e))),
            }
            Ok(resp)
        });
    }

    fn get_external_timestamp(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetExternalTimestampRequest,
        sink: UnarySink<pdpb::GetExternalTimestampResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_external_timestamp", sink, async move {
            rate_limit!(
                server,
                "GetExternalTimestamp",
                pdpb::GetExternalTimestampResponse
            );
            forward_unary!(server, meta, req, get_external_timestamp_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let mut resp = pdpb::GetExternalTimestampResponse::default();
            resp.set_header(server.header());
            resp.set_timestamp(server.cluster.get_external_timestamp());
            Ok(resp)
        });
    }

    fn get_min_ts(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetMinTsRequest,
        sink: UnarySink<pdpb::GetMinTsResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        self.handle_unary(&ctx, "get_min_ts", sink, async move {
            rate_limit!(server, "GetMinTS", pdpb::GetMinTsResponse);
            forward_unary!(server, meta, req, get_min_ts_async_opt);
            server.validate_role(&meta, req.get_header(), None)?;

            let mut resp = pdpb::GetMinTsResponse::default();
            let min_ts = if server.is_tso_service_independent() {
                let addrs = server.tso_service_addrs();
                min_ts::get_min_ts_from_tso_service(&server.pool, server.cluster_id(), &addrs)
                    .await
            } else {
                let start = Instant::now();
                let ts = server.allocator.handle_request(1).await;
                if ts.is_ok() {
                    TSO_HANDLE_DURATION_HISTOGRAM.observe(start.elapsed().as_secs_f64());
                }
                ts
            };
            match min_ts {
                Ok(ts) => {
                    resp.set_header(server.header());
                    resp.set_timestamp(ts);
                }
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                }
            }
            Ok(resp)
        });
    }

    // ---- internal peer-to-peer RPCs.

    fn sync_max_ts(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::SyncMaxTsRequest,
        sink: UnarySink<pdpb::SyncMaxTsResponse>,
    ) {
        let server = self.server.clone();
        self.handle_unary(&ctx, "sync_max_ts", sink, async move {
            server.validate_internal(req.get_header(), true)?;
            rate_limit!(server, "SyncMaxTS", pdpb::SyncMaxTsResponse);

            let max_ts = if req.has_max_ts() {
                Some(req.get_max_ts().clone())
            } else {
                None
            };
            let mut resp = pdpb::SyncMaxTsResponse::default();
            match server
                .allocator
                .sync_max_ts(max_ts, req.get_skip_check())
                .await
            {
                Ok(synced) => {
                    resp.set_header(server.header());
                    if let Some(max_local_ts) = synced.max_local_ts {
                        resp.set_max_local_ts(max_local_ts);
                    }
                    resp.set_synced_dcs(synced.synced_dcs.into());
                }
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                }
            }
            Ok(resp)
        });
    }

    fn get_dc_location_info(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::GetDcLocationInfoRequest,
        sink: UnarySink<pdpb::GetDcLocationInfoResponse>,
    ) {
        let server = self.server.clone();
        self.handle_unary(&ctx, "get_dc_location_info", sink, async move {
            server.validate_internal(req.get_header(), false)?;
            if !server.member.is_leader() {
                return Err(Error::NotLeader);
            }
            rate_limit!(server, "GetDCLocationInfo", pdpb::GetDcLocationInfoResponse);

            let mut resp = pdpb::GetDcLocationInfoResponse::default();
            match server.allocator.dc_location_info(req.get_dc_location()).await {
                Ok(Some(info)) => {
                    resp.set_header(server.header());
                    resp.set_suffix(info.suffix);
                    resp.set_max_ts(info.max_ts);
                }
                Ok(None) => {
                    resp.set_header(server.wrap_error(
                        ErrorType::Unknown,
                        format!("dc-location {} is not found", req.get_dc_location()),
                    ));
                }
                Err(e) => {
                    resp.set_header(server.wrap_error(ErrorType::Unknown, format!("{}", e)));
                }
            }
            Ok(resp)
        });
    }

    // ---- global config.

    fn store_global_config(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::StoreGlobalConfigRequest,
        sink: UnarySink<pdpb::StoreGlobalConfigResponse>,
    ) {
        let server = self.server.clone();
        self.handle_unary(&ctx, "store_global_config", sink, async move {
            let _rate_guard = match server.limiter.allow("StoreGlobalConfig") {
                Ok(guard) => guard,
                Err(e) => {
                    let mut resp = pdpb::StoreGlobalConfigResponse::default();
                    let mut err = pdpb::Error::default();
                    err.set_field_type(ErrorType::Unknown);
                    err.set_message(format!("{}", e));
                    resp.set_error(err);
                    return Ok(resp);
                }
            };
            let path = global_config::config_path(req.get_config_path()).to_owned();
            global_config::store_global_config(&*server.meta_store, &path, req.get_changes())
                .await?;
            Ok(pdpb::StoreGlobalConfigResponse::default())
        });
    }

    fn load_global_config(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::LoadGlobalConfigRequest,
        sink: UnarySink<pdpb::LoadGlobalConfigResponse>,
    ) {
        let server = self.server.clone();
        self.handle_unary(&ctx, "load_global_config", sink, async move {
            let _rate_guard = server.limiter.allow("LoadGlobalConfig")?;
            let path = global_config::config_path(req.get_config_path()).to_owned();
            let mut resp = pdpb::LoadGlobalConfigResponse::default();
            if !req.get_names().is_empty() {
                for name in req.get_names() {
                    let mut item = pdpb::GlobalConfigItem::default();
                    item.set_name(name.clone());
                    match server
                        .meta_store
                        .get(&global_config::join_path(&path, name))
                        .await
                    {
                        Ok(Some(value)) => {
                            item.set_kind(pdpb::EventType::Put);
                            item.set_payload(value);
                        }
                        Ok(None) => {
                            let mut err = pdpb::Error::default();
                            err.set_field_type(ErrorType::GlobalConfigNotFound);
                            err.set_message(format!("key {} not found", name));
                            item.set_error(err);
                        }
                        Err(e) => {
                            let mut err = pdpb::Error::default();
                            err.set_field_type(ErrorType::Unknown);
                            err.set_message(format!("{}", e));
                            item.set_error(err);
                        }
                    }
                    resp.mut_items().push(item);
                }
                return Ok(resp);
            }
            let (kvs, revision) = server.meta_store.get_prefix(&path).await?;
            for kv in kvs {
                resp.mut_items().push(global_config::kv_to_item(kv));
            }
            resp.set_revision(revision);
            Ok(resp)
        });
    }

    fn watch_global_config(
        &mut self,
        ctx: RpcContext<'_>,
        req: pdpb::WatchGlobalConfigRequest,
        mut sink: ServerStreamingSink<pdpb::WatchGlobalConfigResponse>,
    ) {
        let server = self.server.clone();
        let rate_guard = match server.limiter.allow("WatchGlobalConfig") {
            Ok(guard) => guard,
            Err(e) => {
                ctx.spawn(async move {
                    let _ = sink.fail(e.rpc_status()).await;
                });
                return;
            }
        };
        self.spawn_stream("watch_global_config", async move {
            let _rate_guard = rate_guard;
            let path = global_config::config_path(req.get_config_path()).to_owned();
            let revision = req.get_revision();
            let mut watch = server.meta_store.watch(&path, revision);
            loop {
                tokio::select! {
                    batch = watch.next() => match batch {
                        Some(Ok(batch)) => {
                            let items = global_config::events_to_items(batch.events);
                            if !items.is_empty() {
                                let mut resp = pdpb::WatchGlobalConfigResponse::default();
                                resp.set_changes(items.into());
                                resp.set_revision(batch.revision);
                                sink.send(with_flags(resp)).await?;
                            }
                        }
                        Some(Err(Error::DataCompacted { required, compact })) => {
                            // The client must reload everything before it can
                            // keep watching.
                            let mut resp = pdpb::WatchGlobalConfigResponse::default();
                            resp.set_header(server.wrap_error(
                                ErrorType::DataCompacted,
                                format!(
                                    "required watch revision: {} is smaller than current compact/min revision {}",
                                    required, compact
                                ),
                            ));
                            sink.send(with_flags(resp)).await?;
                            break;
                        }
                        Some(Err(e)) => {
                            let mut resp = pdpb::WatchGlobalConfigResponse::default();
                            resp.set_header(server.wrap_error(
                                ErrorType::Unknown,
                                format!("watch channel meet other error {}", e),
                            ));
                            sink.send(with_flags(resp)).await?;
                            break;
                        }
                        None => break,
                    },
                    _ = server.ctx().done() => break,
                }
            }
            sink.close().await?;
            Ok(())
        });
    }

    // ---- streams.

    fn tso(
        &mut self,
        ctx: RpcContext<'_>,
        stream: RequestStream<pdpb::TsoRequest>,
        sink: DuplexSink<pdpb::TsoResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        let rate_guard = match server.limiter.allow("Tso") {
            Ok(guard) => guard,
            Err(e) => {
                ctx.spawn(async move {
                    let _ = sink.fail(e.rpc_status()).await;
                });
                return;
            }
        };
        let recv_timeout = server.cfg.tso_proxy_recv_timeout.0;
        self.spawn_stream("tso", async move {
            let _rate_guard = rate_guard;
            let (tx, mut rx) = guard::guard(
                GuardKind::Tso,
                sink,
                stream.map(|r| r.map_err(Error::from)),
                DEFAULT_SEND_TIMEOUT,
                Some(recv_timeout),
            );
            let downstream: Arc<dyn TsoResponseSink> = Arc::new(tx.clone());
            let mut proxy_ctx: Option<CancelContext> = None;
            loop {
                // Once requests are being proxied the dispatcher may fail
                // while the client is quiet, so its scope is watched too.
                let request = match &proxy_ctx {
                    Some(pctx) => {
                        tokio::select! {
                            request = rx.recv() => request,
                            cause = pctx.done() => {
                                let e = box_err!(cause);
                                let _ = tx.fail(e.rpc_status()).await;
                                return Err(e);
                            }
                        }
                    }
                    None => rx.recv().await,
                };
                let request = match request {
                    Ok(Some(request)) => request,
                    Ok(None) => {
                        let _ = tx.finish().await;
                        return Ok(());
                    }
                    Err(e) => {
                        let _ = tx.fail(e.rpc_status()).await;
                        return Err(e);
                    }
                };

                // TSO uses leader lease to determine validity, there is no
                // leader check here.
                if server.is_closed() {
                    let e = Error::NotStarted;
                    let _ = tx.fail(e.rpc_status()).await;
                    return Err(e);
                }

                if let Some(host) = meta.nonlocal_forwarded_host(&server.local_urls) {
                    let proxied = ProxiedTsoRequest {
                        forwarded_host: host.to_owned(),
                        request,
                        downstream: downstream.clone(),
                    };
                    proxy_ctx = Some(server.tso_dispatcher.dispatch(proxied).await);
                    continue;
                }

                if request.get_header().get_cluster_id() != server.cluster_id() {
                    let e = Error::ClusterMismatch {
                        expect: server.cluster_id(),
                        got: request.get_header().get_cluster_id(),
                    };
                    let _ = tx.fail(e.rpc_status()).await;
                    return Err(e);
                }
                let count = request.get_count();
                let start = Instant::now();
                let ts = match server.allocator.handle_request(count).await {
                    Ok(ts) => ts,
                    Err(e) => {
                        let _ = tx.fail(e.rpc_status()).await;
                        return Err(e);
                    }
                };
                TSO_HANDLE_DURATION_HISTOGRAM.observe(start.elapsed().as_secs_f64());
                let mut resp = pdpb::TsoResponse::default();
                resp.set_header(server.header());
                resp.set_timestamp(ts);
                resp.set_count(count);
                tx.send(with_flags(resp)).await?;
            }
        });
    }

    fn region_heartbeat(
        &mut self,
        ctx: RpcContext<'_>,
        stream: RequestStream<pdpb::RegionHeartbeatRequest>,
        sink: DuplexSink<pdpb::RegionHeartbeatResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        let rate_guard = match server.limiter.allow("RegionHeartbeat") {
            Ok(guard) => guard,
            Err(e) => {
                ctx.spawn(async move {
                    let _ = sink.fail(e.rpc_status()).await;
                });
                return;
            }
        };
        let bind_interval = server.cfg.heartbeat_stream_bind_interval.0;
        self.spawn_stream("region_heartbeat", async move {
            let _rate_guard = rate_guard;
            let (tx, mut rx) = guard::guard(
                GuardKind::Heartbeat,
                sink,
                stream.map(|r| r.map_err(Error::from)),
                DEFAULT_SEND_TIMEOUT,
                None,
            );
            let hb_stream: Arc<dyn HeartbeatStream> = Arc::new(tx.clone());
            let mut forward: Option<StreamForward<pdpb::RegionHeartbeatRequest>> = None;
            let mut sched_forward: Option<StreamForward<schedulingpb::RegionHeartbeatRequest>> =
                None;
            let mut last_bind: Option<Instant> = None;

            loop {
                let request = match rx.recv().await {
                    Ok(Some(request)) => request,
                    Ok(None) => {
                        let _ = tx.finish().await;
                        return Ok(());
                    }
                    Err(e) => {
                        let _ = tx.fail(e.rpc_status()).await;
                        return Err(e);
                    }
                };

                if let Some(host) = meta.nonlocal_forwarded_host(&server.local_urls) {
                    let stale = forward
                        .as_ref()
                        .map_or(true, |f| f.host != host || f.cancel.is_cancelled());
                    if stale {
                        forward.take();
                        info!("create region heartbeat forward stream"; "forwarded-host" => host);
                        let client = PdClient::new(server.pool.get(host));
                        let (fwd_tx, fwd_rx) = match client.region_heartbeat() {
                            Ok(halves) => halves,
                            Err(e) => {
                                let e = Error::from(e);
                                let _ = tx.fail(e.rpc_status()).await;
                                return Err(e);
                            }
                        };
                        let cancel = CancelContext::new();
                        let (err_tx, err_rx) = mpsc::channel(1);
                        let relay_tx = tx.clone();
                        let relay_cancel = cancel.clone();
                        server.handle().spawn(util::log_panic("hb-forward-relay", async move {
                            let mut fwd_rx = fwd_rx;
                            loop {
                                tokio::select! {
                                    item = fwd_rx.next() => {
                                        let err = match item {
                                            Some(Ok(resp)) => {
                                                match relay_tx.send(with_flags(resp)).await {
                                                    Ok(()) => continue,
                                                    Err(e) => e,
                                                }
                                            }
                                            Some(Err(e)) => Error::from(e),
                                            None => Error::StreamClosed,
                                        };
                                        let _ = err_tx.try_send(err);
                                        return;
                                    }
                                    _ = relay_cancel.done() => return,
                                }
                            }
                        }));
                        forward = Some(StreamForward {
                            host: host.to_owned(),
                            sink: fwd_tx,
                            err_rx,
                            cancel,
                        });
                    }
                    let fwd = forward.as_mut().unwrap();
                    if let Err(e) = fwd.sink.send(with_flags(request)).await {
                        let e = Error::from(e);
                        let _ = tx.fail(e.rpc_status()).await;
                        return Err(e);
                    }
                    if let Some(e) = fwd.take_error() {
                        let _ = tx.fail(e.rpc_status()).await;
                        return Err(e);
                    }
                    continue;
                }

                if !server.cluster.is_running() {
                    let mut resp = pdpb::RegionHeartbeatResponse::default();
                    resp.set_header(server.not_bootstrapped_header());
                    tx.send(with_flags(resp)).await?;
                    let _ = tx.finish().await;
                    return Ok(());
                }
                if let Err(e) = server.validate_role(&meta, request.get_header(), None) {
                    let _ = tx.fail(e.rpc_status()).await;
                    return Err(e);
                }

                let store_id = request.get_leader().get_store_id();
                let store_label = store_id.to_string();
                if server.cluster.get_store(store_id).is_none() {
                    let e = box_err!("invalid store ID {}, not found", store_id);
                    let _ = tx.fail(e.rpc_status()).await;
                    return Err(e);
                }
                REGION_HEARTBEAT_COUNTER_VEC
                    .with_label_values(&[&store_label, "report", "recv"])
                    .inc();

                if last_bind.map_or(true, |t| t.elapsed() > bind_interval) {
                    REGION_HEARTBEAT_COUNTER_VEC
                        .with_label_values(&[&store_label, "report", "bind"])
                        .inc();
                    server.hb_streams.bind_stream(store_id, hb_stream.clone()).await;
                    last_bind = Some(Instant::now());
                }

                if !request.has_leader() {
                    error!("invalid request, the leader is nil");
                    REGION_HEARTBEAT_COUNTER_VEC
                        .with_label_values(&[&store_label, "report", "invalid-leader"])
                        .inc();
                    continue;
                }
                if request.get_region().get_id() == 0 {
                    REGION_HEARTBEAT_COUNTER_VEC
                        .with_label_values(&[&store_label, "report", "invalid-region"])
                        .inc();
                    server
                        .hb_streams
                        .send_err(
                            ErrorType::Unknown,
                            format!("invalid request region, {:?}", request),
                            request.get_leader().clone(),
                        )
                        .await;
                    continue;
                }
                if request.get_region().get_peers().is_empty() {
                    warn!("invalid region, zero region peer count";
                        "region-id" => request.get_region().get_id());
                    REGION_HEARTBEAT_COUNTER_VEC
                        .with_label_values(&[&store_label, "report", "no-peer"])
                        .inc();
                    server
                        .hb_streams
                        .send_err(
                            ErrorType::Unknown,
                            format!(
                                "invalid region, zero region peer count: {}",
                                request.get_region().get_id()
                            ),
                            request.get_leader().clone(),
                        )
                        .await;
                    continue;
                }

                if let Err(e) = server.cluster.handle_region_heartbeat(&request) {
                    REGION_HEARTBEAT_COUNTER_VEC
                        .with_label_values(&[&store_label, "report", "err"])
                        .inc();
                    server
                        .hb_streams
                        .send_err(
                            ErrorType::Unknown,
                            format!("{}", e),
                            request.get_leader().clone(),
                        )
                        .await;
                    continue;
                }
                REGION_HEARTBEAT_COUNTER_VEC
                    .with_label_values(&[&store_label, "report", "ok"])
                    .inc();

                // Tee to the scheduling service when it runs independently.
                if server.scheduling_cache.is_independent() {
                    if let Some(fwd) = sched_forward.as_mut() {
                        if let Some(e) = fwd.take_error() {
                            error!("meet error and need to re-establish the stream"; "err" => ?e);
                            sched_forward.take();
                        }
                    }
                    let sched_host = match server.scheduling_cache.update(&server.pool) {
                        Ok(stub) => stub.primary().to_owned(),
                        Err(_) => {
                            debug!("failed to find scheduling service primary address");
                            sched_forward.take();
                            continue;
                        }
                    };
                    let stale = sched_forward
                        .as_ref()
                        .map_or(true, |f| f.host != sched_host || f.cancel.is_cancelled());
                    if stale {
                        sched_forward.take();
                        let client =
                            schedulingpb::SchedulingClient::new(server.pool.get(&sched_host));
                        let (fwd_tx, fwd_rx) = match client.region_heartbeat() {
                            Ok(halves) => halves,
                            Err(e) => {
                                FORWARD_FAIL_COUNTER_VEC
                                    .with_label_values(&["region_heartbeat", "stream"])
                                    .inc();
                                debug!("failed to create stream"; "err" => ?e);
                                continue;
                            }
                        };
                        debug!("create scheduling forwarding stream";
                            "forwarded-host" => %sched_host);
                        let cancel = CancelContext::new();
                        let (err_tx, err_rx) = mpsc::channel(1);
                        let relay_tx = tx.clone();
                        let relay_cancel = cancel.clone();
                        server.handle().spawn(util::log_panic(
                            "sched-hb-relay",
                            async move {
                                let mut fwd_rx = fwd_rx;
                                loop {
                                    tokio::select! {
                                        item = fwd_rx.next() => {
                                            let err = match item {
                                                Some(Ok(resp)) => {
                                                    let resp = convert_sched_hb_resp(resp);
                                                    match relay_tx.send(with_flags(resp)).await {
                                                        Ok(()) => continue,
                                                        Err(e) => e,
                                                    }
                                                }
                                                Some(Err(e)) => Error::from(e),
                                                None => Error::StreamClosed,
                                            };
                                            let _ = err_tx.try_send(err);
                                            return;
                                        }
                                        _ = relay_cancel.done() => return,
                                    }
                                }
                            },
                        ));
                        sched_forward = Some(StreamForward {
                            host: sched_host.clone(),
                            sink: fwd_tx,
                            err_rx,
                            cancel,
                        });
                    }
                    let fwd = sched_forward.as_mut().unwrap();
                    let sched_req = sched_hb_request(&request);
                    if let Err(e) = fwd.sink.send(with_flags(sched_req)).await {
                        let e = Error::from(e);
                        if e.need_rebuild_connection() {
                            server.pool.close(&fwd.host);
                        }
                        FORWARD_FAIL_COUNTER_VEC
                            .with_label_values(&["region_heartbeat", "send"])
                            .inc();
                        error!("failed to send request to scheduling service"; "err" => ?e);
                        sched_forward.take();
                        continue;
                    }
                    if let Some(e) = fwd.take_error() {
                        FORWARD_FAIL_COUNTER_VEC
                            .with_label_values(&["region_heartbeat", "recv"])
                            .inc();
                        error!("failed to receive response from scheduling service"; "err" => ?e);
                        sched_forward.take();
                    }
                }
            }
        });
    }

    fn report_buckets(
        &mut self,
        ctx: RpcContext<'_>,
        stream: RequestStream<pdpb::ReportBucketsRequest>,
        sink: ClientStreamingSink<pdpb::ReportBucketsResponse>,
    ) {
        let server = self.server.clone();
        let meta = RequestMeta::from_ctx(&ctx);
        let rate_guard = match server.limiter.allow("ReportBuckets") {
            Ok(guard) => guard,
            Err(e) => {
                ctx.spawn(async move {
                    let _ = sink.fail(e.rpc_status()).await;
                });
                return;
            }
        };
        self.spawn_stream("report_buckets", async move {
            let _rate_guard = rate_guard;
            let closed = Arc::new(AtomicBool::new(false));
            let mut tx =
                GuardedClientStreamSink::new(sink, closed.clone(), DEFAULT_SEND_TIMEOUT);
            let mut rx = GuardedReceiver::new(
                GuardKind::Heartbeat,
                stream.map(|r| r.map_err(Error::from)),
                closed,
                None,
            );
            let mut forward: Option<ForwardBuckets> = None;

            struct ForwardBuckets {
                host: String,
                sink: grpcio::ClientCStreamSender<pdpb::ReportBucketsRequest>,
                resp_rx: mpsc::Receiver<Result<pdpb::ReportBucketsResponse>>,
                cancel: CancelContext,
            }

            impl Drop for ForwardBuckets {
                fn drop(&mut self) {
                    self.cancel.cancel("forward stream is replaced or finished");
                }
            }

            loop {
                let request = match rx.recv().await {
                    Ok(Some(request)) => request,
                    Ok(None) => {
                        // On a forwarded stream the closing response comes
                        // from the upstream once its side is closed too.
                        if let Some(mut fwd) = forward.take() {
                            let _ = fwd.sink.close().await;
                            match fwd.resp_rx.recv().await {
                                Some(Ok(resp)) => {
                                    tx.send_and_close(resp).await?;
                                    return Ok(());
                                }
                                Some(Err(e)) => {
                                    let _ = tx.fail(e.rpc_status()).await;
                                    return Err(e);
                                }
                                None => {}
                            }
                        }
                        let mut resp = pdpb::ReportBucketsResponse::default();
                        resp.set_header(server.header());
                        let _ = tx.send_and_close(resp).await;
                        return Ok(());
                    }
                    Err(e) => {
                        let _ = tx.fail(e.rpc_status()).await;
                        return Err(e);
                    }
                };

                if let Some(host) = meta.nonlocal_forwarded_host(&server.local_urls) {
                    let stale = forward
                        .as_ref()
                        .map_or(true, |f| f.host != host || f.cancel.is_cancelled());
                    if stale {
                        forward.take();
                        info!("create bucket report forward stream"; "forwarded-host" => host);
                        let client = PdClient::new(server.pool.get(host));
                        let (fwd_tx, fwd_rx) = match client.report_buckets() {
                            Ok(halves) => halves,
                            Err(e) => {
                                let e = Error::from(e);
                                let _ = tx.fail(e.rpc_status()).await;
                                return Err(e);
                            }
                        };
                        let cancel = CancelContext::new();
                        let (resp_tx, resp_rx) = mpsc::channel(1);
                        let relay_cancel = cancel.clone();
                        server.handle().spawn(util::log_panic(
                            "bucket-forward-relay",
                            async move {
                                tokio::select! {
                                    // The upstream answers once, when the
                                    // report stream ends.
                                    resp = fwd_rx => {
                                        let _ = resp_tx.try_send(resp.map_err(Error::from));
                                    }
                                    _ = relay_cancel.done() => {}
                                }
                            },
                        ));
                        forward = Some(ForwardBuckets {
                            host: host.to_owned(),
                            sink: fwd_tx,
                            resp_rx,
                            cancel,
                        });
                    }
                    let fwd = forward.as_mut().unwrap();
                    if let Err(e) = fwd.sink.send(with_flags(request)).await {
                        let e = Error::from(e);
                        let _ = tx.fail(e.rpc_status()).await;
                        return Err(e);
                    }
                    match fwd.resp_rx.try_recv() {
                        Ok(Ok(resp)) => {
                            tx.send_and_close(resp).await?;
                            return Ok(());
                        }
                        Ok(Err(e)) => {
                            let _ = tx.fail(e.rpc_status()).await;
                            return Err(e);
                        }
                        Err(_) => {}
                    }
                    continue;
                }

                if !server.cluster.is_running() {
                    let mut resp = pdpb::ReportBucketsResponse::default();
                    resp.set_header(server.not_bootstrapped_header());
                    tx.send_and_close(resp).await?;
                    return Ok(());
                }
                if let Err(e) = server.validate_role(&meta, request.get_header(), None) {
                    let _ = tx.fail(e.rpc_status()).await;
                    return Err(e);
                }

                let buckets = request.get_buckets();
                if buckets.get_keys().is_empty() {
                    continue;
                }
                let store = server
                    .cluster
                    .get_leader_store_by_region_id(buckets.get_region_id());
                let store_label = match &store {
                    Some(store) => store.get_id().to_string(),
                    None => {
                        // Bucket reports may precede the first heartbeat of a
                        // new region, so an unknown leader store is tolerated.
                        warn!("the store of the bucket in region is not found";
                            "region-id" => buckets.get_region_id());
                        String::new()
                    }
                };
                BUCKET_REPORT_COUNTER_VEC
                    .with_label_values(&[&store_label, "recv"])
                    .inc();
                if server
                    .cluster
                    .handle_report_buckets(buckets.clone())
                    .is_err()
                {
                    BUCKET_REPORT_COUNTER_VEC
                        .with_label_values(&[&store_label, "err"])
                        .inc();
                    continue;
                }
                BUCKET_REPORT_COUNTER_VEC
                    .with_label_values(&[&store_label, "ok"])
                    .inc();
            }
        });
    }

    fn sync_regions(
        &mut self,
        ctx: RpcContext<'_>,
        stream: RequestStream<pdpb::SyncRegionRequest>,
        sink: DuplexSink<pdpb::SyncRegionResponse>,
    ) {
        let server = self.server.clone();
        if server.is_closed() {
            ctx.spawn(async move {
                let _ = sink.fail(Error::NotStarted.rpc_status()).await;
            });
            return;
        }
        let rate_guard = match server.limiter.allow("SyncRegions") {
            Ok(guard) => guard,
            Err(e) => {
                ctx.spawn(async move {
                    let _ = sink.fail(e.rpc_status()).await;
                });
                return;
            }
        };
        self.spawn_stream("sync_regions", async move {
            let _rate_guard = rate_guard;
            server.syncer.sync(stream, sink).await
        });
    }
}
