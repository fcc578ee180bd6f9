// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Mock collaborators for tests: an in-memory cluster registry, allocator,
//! election member, service watcher and meta store, plus a mock upstream PD
//! the forwarding paths can be driven against.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{self, BoxStream, StreamExt};
use futures::SinkExt;
use grpcio::{
    DuplexSink, EnvBuilder, RequestStream, RpcContext, Server as GrpcioServer, ServerBuilder,
    UnarySink, WriteFlags,
};
use kvproto::pdpb::{
    self, AskBatchSplitRequest, AskSplitRequest, BootstrapRequest, Pd, RegionHeartbeatRequest,
    ReportBatchSplitRequest, ReportSplitRequest, StoreHeartbeatRequest, StoreHeartbeatResponse,
    SyncRegionRequest, SyncRegionResponse, Timestamp,
};
use kvproto::{metapb, tsopb};

use crate::cluster::{
    DcLocationInfo, ElectionMember, GcSafePointManager, OperatorRecord, RaftCluster, RegionRecord,
    RegionSyncer, ServiceSafePoint, ServiceWatcher, SplitIds, SyncedMaxTs, TsoAllocator,
};
use crate::global_config::{KeyValue, MetaOp, MetaStore, WatchBatch, WatchEvent};
use crate::{Error, PdFuture, Result};

// ---- cluster ----

#[derive(Default)]
struct MockClusterState {
    stores: HashMap<u64, metapb::Store>,
    regions: Vec<RegionRecord>,
    operators: HashMap<u64, OperatorRecord>,
    cluster_config: metapb::Cluster,
    remove_peer_ops: Vec<(u64, u64)>,
    min_resolved_ts: HashMap<u64, u64>,
    region_heartbeats: Vec<RegionHeartbeatRequest>,
    bucket_reports: Vec<metapb::Buckets>,
    store_heartbeats: u64,
}

/// An in-memory stand-in for the Raft-backed cluster state.
#[derive(Default)]
pub struct MockCluster {
    state: Mutex<MockClusterState>,
    running: AtomicBool,
    syncer_running: AtomicBool,
    bucket_enabled: AtomicBool,
    id_alloc: AtomicU64,
    external_ts: AtomicU64,
}

impl MockCluster {
    pub fn running() -> MockCluster {
        let cluster = MockCluster::default();
        cluster.set_running(true);
        cluster
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn set_syncer_running(&self, running: bool) {
        self.syncer_running.store(running, Ordering::SeqCst);
    }

    pub fn set_bucket_enabled(&self, enabled: bool) {
        self.bucket_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn add_store(&self, store_id: u64) {
        let mut store = metapb::Store::default();
        store.set_id(store_id);
        store.set_address(format!("store-{}", store_id));
        self.state.lock().unwrap().stores.insert(store_id, store);
    }

    pub fn add_tombstone_store(&self, store_id: u64) {
        let mut store = metapb::Store::default();
        store.set_id(store_id);
        store.set_node_state(metapb::NodeState::Removed);
        self.state.lock().unwrap().stores.insert(store_id, store);
    }

    pub fn add_region(&self, record: RegionRecord) {
        self.state.lock().unwrap().regions.push(record);
    }

    pub fn remove_peer_ops(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().remove_peer_ops.clone()
    }

    pub fn region_heartbeat_count(&self) -> usize {
        self.state.lock().unwrap().region_heartbeats.len()
    }

    pub fn bucket_report_count(&self) -> usize {
        self.state.lock().unwrap().bucket_reports.len()
    }

    fn region_contains(record: &RegionRecord, key: &[u8]) -> bool {
        let region = &record.region;
        region.get_start_key() <= key
            && (region.get_end_key().is_empty() || key < region.get_end_key())
    }
}

impl RaftCluster for MockCluster {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn is_syncer_running(&self) -> bool {
        self.syncer_running.load(Ordering::SeqCst)
    }

    fn bootstrap(&self, _req: &BootstrapRequest) -> Result<()> {
        self.set_running(true);
        Ok(())
    }

    fn alloc_id(&self) -> Result<u64> {
        Ok(self.id_alloc.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn get_store(&self, store_id: u64) -> Option<metapb::Store> {
        self.state.lock().unwrap().stores.get(&store_id).cloned()
    }

    fn get_stores(&self) -> Vec<metapb::Store> {
        self.state.lock().unwrap().stores.values().cloned().collect()
    }

    fn put_store(&self, store: metapb::Store) -> Result<()> {
        self.state.lock().unwrap().stores.insert(store.get_id(), store);
        Ok(())
    }

    fn handle_store_heartbeat(
        &self,
        _req: &StoreHeartbeatRequest,
        _resp: &mut StoreHeartbeatResponse,
    ) -> Result<()> {
        self.state.lock().unwrap().store_heartbeats += 1;
        Ok(())
    }

    fn handle_region_heartbeat(&self, req: &RegionHeartbeatRequest) -> Result<()> {
        self.state.lock().unwrap().region_heartbeats.push(req.clone());
        Ok(())
    }

    fn handle_report_buckets(&self, buckets: metapb::Buckets) -> Result<()> {
        self.state.lock().unwrap().bucket_reports.push(buckets);
        Ok(())
    }

    fn get_region_by_key(&self, key: &[u8]) -> Option<RegionRecord> {
        self.state
            .lock()
            .unwrap()
            .regions
            .iter()
            .find(|r| Self::region_contains(r, key))
            .cloned()
    }

    fn get_prev_region_by_key(&self, key: &[u8]) -> Option<RegionRecord> {
        let state = self.state.lock().unwrap();
        let pos = state.regions.iter().position(|r| Self::region_contains(r, key))?;
        pos.checked_sub(1).map(|prev| state.regions[prev].clone())
    }

    fn get_region_by_id(&self, region_id: u64) -> Option<RegionRecord> {
        self.state
            .lock()
            .unwrap()
            .regions
            .iter()
            .find(|r| r.region.get_id() == region_id)
            .cloned()
    }

    fn scan_regions(&self, start_key: &[u8], end_key: &[u8], limit: usize) -> Vec<RegionRecord> {
        self.state
            .lock()
            .unwrap()
            .regions
            .iter()
            .filter(|r| {
                r.region.get_start_key() >= start_key
                    && (end_key.is_empty() || r.region.get_start_key() < end_key)
            })
            .take(if limit == 0 { usize::MAX } else { limit })
            .cloned()
            .collect()
    }

    fn batch_scan_regions(
        &self,
        ranges: &[(Vec<u8>, Vec<u8>)],
        limit: usize,
        _contain_all_key_range: bool,
    ) -> Result<Vec<RegionRecord>> {
        let mut out = vec![];
        for (start, end) in ranges {
            out.extend(self.scan_regions(start, end, limit));
        }
        Ok(out)
    }

    fn handle_ask_split(&self, _req: &AskSplitRequest) -> Result<SplitIds> {
        Ok(SplitIds {
            new_region_id: self.alloc_id()?,
            new_peer_ids: vec![self.alloc_id()?],
        })
    }

    fn handle_ask_batch_split(&self, req: &AskBatchSplitRequest) -> Result<Vec<SplitIds>> {
        (0..req.get_split_count())
            .map(|_| self.handle_ask_split(&AskSplitRequest::default()))
            .collect()
    }

    fn handle_report_split(&self, _req: &ReportSplitRequest) -> Result<()> {
        Ok(())
    }

    fn handle_report_batch_split(&self, _req: &ReportBatchSplitRequest) -> Result<()> {
        Ok(())
    }

    fn get_cluster_config(&self) -> metapb::Cluster {
        self.state.lock().unwrap().cluster_config.clone()
    }

    fn put_cluster_config(&self, cluster: metapb::Cluster) -> Result<()> {
        self.state.lock().unwrap().cluster_config = cluster;
        Ok(())
    }

    fn scatter_regions(
        &self,
        _region_ids: &[u64],
        _group: &str,
        _retry_limit: usize,
        _skip_store_limit: bool,
    ) -> Result<u64> {
        Ok(100)
    }

    fn split_regions(&self, split_keys: &[Vec<u8>], _retry_limit: usize) -> (u64, Vec<u64>) {
        let ids = split_keys
            .iter()
            .map(|_| self.alloc_id().unwrap_or_default())
            .collect();
        (100, ids)
    }

    fn get_operator(&self, region_id: u64) -> Option<OperatorRecord> {
        self.state.lock().unwrap().operators.get(&region_id).cloned()
    }

    fn add_remove_peer_operator(&self, region_id: u64, store_id: u64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .remove_peer_ops
            .push((region_id, store_id));
        Ok(())
    }

    fn set_min_resolved_ts(&self, store_id: u64, min_resolved_ts: u64) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .min_resolved_ts
            .insert(store_id, min_resolved_ts);
        Ok(())
    }

    fn get_leader_store_by_region_id(&self, region_id: u64) -> Option<metapb::Store> {
        let leader_store = self
            .get_region_by_id(region_id)?
            .leader
            .map(|l| l.get_store_id())?;
        self.get_store(leader_store)
    }

    fn is_region_bucket_enabled(&self) -> bool {
        self.bucket_enabled.load(Ordering::SeqCst)
    }

    fn is_feature_supported(&self, _feature: &str) -> bool {
        true
    }

    fn cluster_version(&self) -> String {
        "8.1.0".to_owned()
    }

    fn set_external_timestamp(&self, ts: u64, global_ts: u64) -> Result<()> {
        if ts > global_ts {
            return Err(Error::InvalidValue(
                "external timestamp is newer than global tso".to_owned(),
            ));
        }
        self.external_ts.store(ts, Ordering::SeqCst);
        Ok(())
    }

    fn get_external_timestamp(&self) -> u64 {
        self.external_ts.load(Ordering::SeqCst)
    }

    fn is_snapshot_recovering(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Builds a region record covering `[start_key, end_key)` led from `store_id`.
pub fn region_record(region_id: u64, start_key: &[u8], end_key: &[u8], store_id: u64) -> RegionRecord {
    let mut region = metapb::Region::default();
    region.set_id(region_id);
    region.set_start_key(start_key.to_vec());
    region.set_end_key(end_key.to_vec());
    let mut peer = metapb::Peer::default();
    peer.set_id(region_id + 100);
    peer.set_store_id(store_id);
    region.mut_peers().push(peer.clone());
    RegionRecord::new(region, Some(peer))
}

// ---- allocator ----

/// Hands out monotonically increasing logical timestamps under one physical.
pub struct MockTsoAllocator {
    physical: i64,
    logical: AtomicI64,
    pub synced: Mutex<Option<SyncedMaxTs>>,
    pub dc_info: Mutex<HashMap<String, DcLocationInfo>>,
}

impl MockTsoAllocator {
    pub fn new(physical: i64, logical_start: i64) -> MockTsoAllocator {
        MockTsoAllocator {
            physical,
            logical: AtomicI64::new(logical_start),
            synced: Mutex::new(None),
            dc_info: Mutex::new(HashMap::new()),
        }
    }
}

impl TsoAllocator for MockTsoAllocator {
    fn handle_request(&self, count: u32) -> PdFuture<Timestamp> {
        let logical = self.logical.fetch_add(count as i64, Ordering::SeqCst) + count as i64;
        let mut ts = Timestamp::default();
        ts.set_physical(self.physical);
        ts.set_logical(logical);
        Box::pin(futures::future::ready(Ok(ts)))
    }

    fn sync_max_ts(&self, max_ts: Option<Timestamp>, _skip_check: bool) -> PdFuture<SyncedMaxTs> {
        let out = self.synced.lock().unwrap().clone().unwrap_or(SyncedMaxTs {
            max_local_ts: max_ts,
            synced_dcs: vec!["global".to_owned()],
        });
        Box::pin(futures::future::ready(Ok(out)))
    }

    fn dc_location_info(&self, dc_location: &str) -> PdFuture<Option<DcLocationInfo>> {
        let info = self.dc_info.lock().unwrap().get(dc_location).cloned();
        Box::pin(futures::future::ready(Ok(info)))
    }
}

// ---- gc ----

#[derive(Default)]
pub struct MockGcManager {
    safe_point: AtomicU64,
    services: Mutex<BTreeMap<String, ServiceSafePoint>>,
}

impl GcSafePointManager for MockGcManager {
    fn load_gc_safe_point(&self) -> Result<u64> {
        Ok(self.safe_point.load(Ordering::SeqCst))
    }

    fn update_gc_safe_point(&self, safe_point: u64) -> Result<u64> {
        let old = self.safe_point.load(Ordering::SeqCst);
        if safe_point > old {
            self.safe_point.store(safe_point, Ordering::SeqCst);
        }
        Ok(old)
    }

    fn update_service_gc_safe_point(
        &self,
        service_id: String,
        safe_point: u64,
        ttl: i64,
        now_unix: i64,
    ) -> Result<(ServiceSafePoint, bool)> {
        let mut services = self.services.lock().unwrap();
        if ttl > 0 {
            services.insert(
                service_id.clone(),
                ServiceSafePoint {
                    service_id,
                    expired_at: now_unix + ttl,
                    safe_point,
                },
            );
        }
        let min = services
            .values()
            .min_by_key(|s| s.safe_point)
            .cloned()
            .unwrap_or_default();
        Ok((min, ttl > 0))
    }

    fn remove_service_gc_safe_point(&self, service_id: &str) -> Result<()> {
        self.services.lock().unwrap().remove(service_id);
        Ok(())
    }
}

// ---- member ----

pub struct MockMember {
    is_leader: AtomicBool,
    leader: Mutex<Option<pdpb::Member>>,
    members: Mutex<Vec<pdpb::Member>>,
}

impl MockMember {
    pub fn new(member_id: u64, client_url: &str) -> MockMember {
        let mut member = pdpb::Member::default();
        member.set_member_id(member_id);
        member.set_name(format!("pd-{}", member_id));
        member.mut_client_urls().push(client_url.to_owned());
        MockMember {
            is_leader: AtomicBool::new(true),
            leader: Mutex::new(Some(member.clone())),
            members: Mutex::new(vec![member]),
        }
    }

    pub fn demote(&self) {
        self.is_leader.store(false, Ordering::SeqCst);
    }
}

impl ElectionMember for MockMember {
    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn leader(&self) -> Option<pdpb::Member> {
        self.leader.lock().unwrap().clone()
    }

    fn members(&self) -> Result<Vec<pdpb::Member>> {
        Ok(self.members.lock().unwrap().clone())
    }

    fn etcd_leader_id(&self) -> u64 {
        self.leader
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |l| l.get_member_id())
    }
}

// ---- syncer ----

/// Drains the follower sync stream and closes it; the real syncer lives in
/// the cluster-state collaborator.
#[derive(Default)]
pub struct MockSyncer;

impl RegionSyncer for MockSyncer {
    fn sync(
        &self,
        stream: RequestStream<SyncRegionRequest>,
        mut sink: DuplexSink<SyncRegionResponse>,
    ) -> PdFuture<()> {
        Box::pin(async move {
            let mut stream = stream;
            while stream.next().await.is_some() {}
            sink.close().await?;
            Ok(())
        })
    }
}

// ---- service watcher ----

#[derive(Default)]
pub struct MockWatcher {
    primary: Mutex<Option<String>>,
    addrs: Mutex<Vec<String>>,
    force_loads: AtomicU64,
}

impl MockWatcher {
    pub fn with_primary(primary: &str) -> MockWatcher {
        let watcher = MockWatcher::default();
        watcher.set_primary(Some(primary.to_owned()));
        watcher
    }

    pub fn set_primary(&self, primary: Option<String>) {
        let mut addrs = self.addrs.lock().unwrap();
        addrs.clear();
        addrs.extend(primary.clone());
        *self.primary.lock().unwrap() = primary;
    }

    pub fn set_addrs(&self, addrs: Vec<String>) {
        *self.addrs.lock().unwrap() = addrs;
    }

    pub fn force_load_count(&self) -> u64 {
        self.force_loads.load(Ordering::SeqCst)
    }
}

impl ServiceWatcher for MockWatcher {
    fn primary(&self) -> Option<String> {
        self.primary.lock().unwrap().clone()
    }

    fn service_addrs(&self) -> Vec<String> {
        self.addrs.lock().unwrap().clone()
    }

    fn force_load(&self) {
        self.force_loads.fetch_add(1, Ordering::SeqCst);
    }
}

// ---- meta store ----

struct MemStoreState {
    kvs: BTreeMap<String, Vec<u8>>,
    revision: i64,
    compact_revision: i64,
    watchers: Vec<(String, futures::channel::mpsc::UnboundedSender<Result<WatchBatch>>)>,
}

impl Default for MemStoreState {
    fn default() -> MemStoreState {
        MemStoreState {
            kvs: BTreeMap::new(),
            revision: 1,
            compact_revision: 0,
            watchers: Vec::new(),
        }
    }
}

/// An in-memory transactional store. Watches observe changes made after
/// registration; history replay is not modeled.
#[derive(Default)]
pub struct MemStore {
    state: Mutex<MemStoreState>,
    fail_txn: AtomicBool,
}

impl MemStore {
    pub fn compact(&self, revision: i64) {
        self.state.lock().unwrap().compact_revision = revision;
    }

    pub fn fail_next_txn(&self) {
        self.fail_txn.store(true, Ordering::SeqCst);
    }
}

impl MetaStore for MemStore {
    fn txn(&self, ops: Vec<MetaOp>) -> PdFuture<()> {
        if self.fail_txn.swap(false, Ordering::SeqCst) {
            return Box::pin(futures::future::ready(Err(Error::TransactionFailed)));
        }
        let mut state = self.state.lock().unwrap();
        state.revision += 1;
        let revision = state.revision;
        let mut events = vec![];
        for op in ops {
            match op {
                MetaOp::Put { key, value } => {
                    state.kvs.insert(key.clone(), value.clone());
                    events.push(WatchEvent::Put { key, value });
                }
                MetaOp::Delete { key } => {
                    if let Some(prev) = state.kvs.remove(&key) {
                        events.push(WatchEvent::Delete {
                            key,
                            prev_value: Some(prev),
                        });
                    }
                }
            }
        }
        state.watchers.retain(|(prefix, tx)| {
            let matching: Vec<_> = events
                .iter()
                .filter(|event| {
                    let key = match event {
                        WatchEvent::Put { key, .. } => key,
                        WatchEvent::Delete { key, .. } => key,
                    };
                    key.starts_with(prefix.trim_end_matches('/'))
                })
                .cloned()
                .collect();
            if matching.is_empty() {
                return !tx.is_closed();
            }
            tx.unbounded_send(Ok(WatchBatch {
                events: matching,
                revision,
            }))
            .is_ok()
        });
        Box::pin(futures::future::ready(Ok(())))
    }

    fn get(&self, key: &str) -> PdFuture<Option<Vec<u8>>> {
        let value = self.state.lock().unwrap().kvs.get(key).cloned();
        Box::pin(futures::future::ready(Ok(value)))
    }

    fn get_prefix(&self, prefix: &str) -> PdFuture<(Vec<KeyValue>, i64)> {
        let state = self.state.lock().unwrap();
        let prefix = prefix.trim_end_matches('/').to_owned();
        let kvs = state
            .kvs
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| KeyValue {
                key: k.clone(),
                value: v.clone(),
            })
            .collect();
        Box::pin(futures::future::ready(Ok((kvs, state.revision))))
    }

    fn watch(&self, prefix: &str, revision: i64) -> BoxStream<'static, Result<WatchBatch>> {
        let mut state = self.state.lock().unwrap();
        if revision < state.compact_revision {
            let compacted = Error::DataCompacted {
                required: revision,
                compact: state.compact_revision,
            };
            return stream::iter(vec![Err(compacted)]).boxed();
        }
        let (tx, rx) = futures::channel::mpsc::unbounded();
        state.watchers.push((prefix.to_owned(), tx));
        rx.boxed()
    }
}

// ---- mock upstream PD ----

#[derive(Default)]
struct MockUpstreamState {
    alloc_id_calls: u64,
    region_heartbeats: Vec<RegionHeartbeatRequest>,
    bucket_reports: Vec<pdpb::ReportBucketsRequest>,
}

/// A bare-bones upstream PD answering the RPCs the forwarding paths use.
#[derive(Clone)]
pub struct MockUpstream {
    cluster_id: u64,
    tso_physical: i64,
    tso_logical: Arc<AtomicI64>,
    state: Arc<Mutex<MockUpstreamState>>,
    fail_tso: Arc<AtomicBool>,
}

impl MockUpstream {
    pub fn new(cluster_id: u64) -> MockUpstream {
        MockUpstream {
            cluster_id,
            tso_physical: 42,
            tso_logical: Arc::new(AtomicI64::new(0)),
            state: Arc::new(Mutex::new(MockUpstreamState::default())),
            fail_tso: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn alloc_id_calls(&self) -> u64 {
        self.state.lock().unwrap().alloc_id_calls
    }

    pub fn region_heartbeat_count(&self) -> usize {
        self.state.lock().unwrap().region_heartbeats.len()
    }

    pub fn bucket_report_count(&self) -> usize {
        self.state.lock().unwrap().bucket_reports.len()
    }

    pub fn fail_tso_with_not_leader(&self) {
        self.fail_tso.store(true, Ordering::SeqCst);
    }

    fn header(&self) -> pdpb::ResponseHeader {
        let mut header = pdpb::ResponseHeader::default();
        header.set_cluster_id(self.cluster_id);
        header
    }
}

impl Pd for MockUpstream {
    fn alloc_id(
        &mut self,
        ctx: RpcContext<'_>,
        _req: pdpb::AllocIdRequest,
        sink: UnarySink<pdpb::AllocIdResponse>,
    ) {
        let mut resp = pdpb::AllocIdResponse::default();
        resp.set_header(self.header());
        {
            let mut state = self.state.lock().unwrap();
            state.alloc_id_calls += 1;
            resp.set_id(9000 + state.alloc_id_calls);
        }
        ctx.spawn(async move {
            let _ = sink.success(resp).await;
        });
    }

    fn get_members(
        &mut self,
        ctx: RpcContext<'_>,
        _req: pdpb::GetMembersRequest,
        sink: UnarySink<pdpb::GetMembersResponse>,
    ) {
        let mut resp = pdpb::GetMembersResponse::default();
        resp.set_header(self.header());
        ctx.spawn(async move {
            let _ = sink.success(resp).await;
        });
    }

    fn tso(
        &mut self,
        ctx: RpcContext<'_>,
        stream: RequestStream<pdpb::TsoRequest>,
        mut sink: DuplexSink<pdpb::TsoResponse>,
    ) {
        let header = self.header();
        let logical = self.tso_logical.clone();
        let physical = self.tso_physical;
        let fail = self.fail_tso.clone();
        ctx.spawn(async move {
            if fail.load(Ordering::SeqCst) {
                let _ = sink
                    .fail(grpcio::RpcStatus::with_message(
                        grpcio::RpcStatusCode::UNAVAILABLE,
                        "not leader".to_owned(),
                    ))
                    .await;
                return;
            }
            let mut requests = stream;
            while let Some(Ok(req)) = requests.next().await {
                let tail = logical.fetch_add(req.get_count() as i64, Ordering::SeqCst)
                    + req.get_count() as i64;
                let mut resp = pdpb::TsoResponse::default();
                resp.set_header(header.clone());
                resp.set_count(req.get_count());
                let ts = resp.mut_timestamp();
                ts.set_physical(physical);
                ts.set_logical(tail);
                if sink.send((resp, WriteFlags::default())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
    }

    fn region_heartbeat(
        &mut self,
        ctx: RpcContext<'_>,
        stream: RequestStream<RegionHeartbeatRequest>,
        mut sink: DuplexSink<pdpb::RegionHeartbeatResponse>,
    ) {
        let header = self.header();
        let state = self.state.clone();
        ctx.spawn(async move {
            let mut requests = stream;
            while let Some(Ok(req)) = requests.next().await {
                let mut resp = pdpb::RegionHeartbeatResponse::default();
                resp.set_header(header.clone());
                resp.set_region_id(req.get_region().get_id());
                resp.set_target_peer(req.get_leader().clone());
                state.lock().unwrap().region_heartbeats.push(req);
                if sink.send((resp, WriteFlags::default())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
    }

    fn report_buckets(
        &mut self,
        ctx: RpcContext<'_>,
        stream: RequestStream<pdpb::ReportBucketsRequest>,
        sink: grpcio::ClientStreamingSink<pdpb::ReportBucketsResponse>,
    ) {
        let header = self.header();
        let state = self.state.clone();
        ctx.spawn(async move {
            let mut requests = stream;
            while let Some(Ok(req)) = requests.next().await {
                state.lock().unwrap().bucket_reports.push(req);
            }
            let mut resp = pdpb::ReportBucketsResponse::default();
            resp.set_header(header);
            let _ = sink.success(resp).await;
        });
    }
}

/// Starts a mock upstream on an ephemeral local port, returning the server
/// handle and its address.
pub fn start_mock_upstream(upstream: MockUpstream) -> (GrpcioServer, String) {
    start_service(pdpb::create_pd(upstream))
}

// ---- mock TSO service ----

/// One keyspace-group allocator of a standalone TSO deployment.
#[derive(Clone)]
pub struct MockTsoService {
    cluster_id: u64,
    groups_total: u32,
    groups_serving: u32,
    physical: i64,
    logical: Arc<AtomicI64>,
}

impl MockTsoService {
    pub fn new(cluster_id: u64, groups_total: u32, groups_serving: u32) -> MockTsoService {
        MockTsoService {
            cluster_id,
            groups_total,
            groups_serving,
            physical: 77,
            logical: Arc::new(AtomicI64::new(0)),
        }
    }

    fn header(&self) -> tsopb::ResponseHeader {
        let mut header = tsopb::ResponseHeader::default();
        header.set_cluster_id(self.cluster_id);
        header
    }
}

impl tsopb::Tso for MockTsoService {
    fn tso(
        &mut self,
        ctx: RpcContext<'_>,
        stream: RequestStream<tsopb::TsoRequest>,
        mut sink: DuplexSink<tsopb::TsoResponse>,
    ) {
        let header = self.header();
        let logical = self.logical.clone();
        let physical = self.physical;
        ctx.spawn(async move {
            let mut requests = stream;
            while let Some(Ok(req)) = requests.next().await {
                let tail = logical.fetch_add(req.get_count() as i64, Ordering::SeqCst)
                    + req.get_count() as i64;
                let mut resp = tsopb::TsoResponse::default();
                resp.set_header(header.clone());
                resp.set_count(req.get_count());
                let ts = resp.mut_timestamp();
                ts.set_physical(physical);
                ts.set_logical(tail);
                if sink.send((resp, WriteFlags::default())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });
    }

    fn get_min_ts(
        &mut self,
        ctx: RpcContext<'_>,
        _req: tsopb::GetMinTsRequest,
        sink: UnarySink<tsopb::GetMinTsResponse>,
    ) {
        let mut resp = tsopb::GetMinTsResponse::default();
        resp.set_header(self.header());
        resp.set_keyspace_groups_total(self.groups_total);
        resp.set_keyspace_groups_serving(self.groups_serving);
        let ts = resp.mut_timestamp();
        ts.set_physical(self.physical);
        ts.set_logical(self.logical.load(Ordering::SeqCst) + 1);
        ctx.spawn(async move {
            let _ = sink.success(resp).await;
        });
    }
}

/// Starts a mock TSO service on an ephemeral local port.
pub fn start_mock_tso(service: MockTsoService) -> (GrpcioServer, String) {
    start_service(tsopb::create_tso(service))
}

fn start_service(service: grpcio::Service) -> (GrpcioServer, String) {
    let env = Arc::new(EnvBuilder::new().cq_count(1).build());
    let mut server = ServerBuilder::new(env)
        .register_service(service)
        .bind("127.0.0.1", 0)
        .build()
        .expect("failed to build mock service");
    server.start();
    let (host, port) = server.bind_addrs().next().expect("no bind addr");
    let addr = format!("{}:{}", host, port);
    (server, addr)
}
