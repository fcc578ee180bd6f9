// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Interfaces of the external collaborators the frontend routes into. The
//! Raft-backed cluster state, the timestamp allocator, the GC safepoint
//! manager and the region syncer are all owned elsewhere; the frontend only
//! admits, routes and marshals.

use std::collections::HashMap;

use grpcio::{DuplexSink, RequestStream};
use kvproto::metapb;
use kvproto::pdpb::{
    self, AskBatchSplitRequest, AskSplitRequest, BootstrapRequest, RegionHeartbeatRequest,
    ReportBatchSplitRequest, ReportSplitRequest, StoreHeartbeatRequest, StoreHeartbeatResponse,
    SyncRegionRequest, SyncRegionResponse, Timestamp,
};

use crate::{PdFuture, Result};

/// A region with the bookkeeping the responses carry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegionRecord {
    pub region: metapb::Region,
    pub leader: Option<metapb::Peer>,
    pub down_peers: Vec<pdpb::PeerStats>,
    pub pending_peers: Vec<metapb::Peer>,
    pub buckets: Option<metapb::Buckets>,
}

impl RegionRecord {
    pub fn new(region: metapb::Region, leader: Option<metapb::Peer>) -> RegionRecord {
        RegionRecord {
            region,
            leader,
            ..Default::default()
        }
    }

    /// Converts into the wire representation, with a placeholder leader the
    /// way old clients expect.
    pub fn to_pdpb_region(&self, with_buckets: bool) -> pdpb::Region {
        let mut out = pdpb::Region::default();
        out.set_region(self.region.clone());
        out.set_leader(self.leader.clone().unwrap_or_default());
        out.set_down_peers(self.down_peers.clone().into());
        out.set_pending_peers(self.pending_peers.clone().into());
        if with_buckets {
            if let Some(b) = &self.buckets {
                out.set_buckets(b.clone());
            }
        }
        out
    }
}

#[derive(Clone, Debug, Default)]
pub struct OperatorRecord {
    pub region_id: u64,
    pub desc: Vec<u8>,
    pub kind: Vec<u8>,
    pub status: pdpb::OperatorStatus,
}

/// The split ids a batch split produces.
#[derive(Clone, Debug, Default)]
pub struct SplitIds {
    pub new_region_id: u64,
    pub new_peer_ids: Vec<u64>,
}

/// The cluster state registry (region/store registry, operator controller,
/// splitter, scatterer) as the frontend sees it.
pub trait RaftCluster: Send + Sync {
    /// Whether the bootstrapped cluster state is running on this member.
    /// When false the leader-side handlers answer `NOT_BOOTSTRAPPED`.
    fn is_running(&self) -> bool;
    /// Whether the follower region syncer keeps the local cache fresh; gates
    /// follower reads.
    fn is_syncer_running(&self) -> bool;

    fn bootstrap(&self, req: &BootstrapRequest) -> Result<()>;
    fn alloc_id(&self) -> Result<u64>;

    fn get_store(&self, store_id: u64) -> Option<metapb::Store>;
    fn get_stores(&self) -> Vec<metapb::Store>;
    fn put_store(&self, store: metapb::Store) -> Result<()>;
    fn handle_store_heartbeat(
        &self,
        req: &StoreHeartbeatRequest,
        resp: &mut StoreHeartbeatResponse,
    ) -> Result<()>;

    fn handle_region_heartbeat(&self, req: &RegionHeartbeatRequest) -> Result<()>;
    fn handle_report_buckets(&self, buckets: metapb::Buckets) -> Result<()>;

    fn get_region_by_key(&self, key: &[u8]) -> Option<RegionRecord>;
    fn get_prev_region_by_key(&self, key: &[u8]) -> Option<RegionRecord>;
    fn get_region_by_id(&self, region_id: u64) -> Option<RegionRecord>;
    fn scan_regions(&self, start_key: &[u8], end_key: &[u8], limit: usize) -> Vec<RegionRecord>;
    fn batch_scan_regions(
        &self,
        ranges: &[(Vec<u8>, Vec<u8>)],
        limit: usize,
        contain_all_key_range: bool,
    ) -> Result<Vec<RegionRecord>>;

    fn handle_ask_split(&self, req: &AskSplitRequest) -> Result<SplitIds>;
    fn handle_ask_batch_split(&self, req: &AskBatchSplitRequest) -> Result<Vec<SplitIds>>;
    fn handle_report_split(&self, req: &ReportSplitRequest) -> Result<()>;
    fn handle_report_batch_split(&self, req: &ReportBatchSplitRequest) -> Result<()>;

    fn get_cluster_config(&self) -> metapb::Cluster;
    fn put_cluster_config(&self, cluster: metapb::Cluster) -> Result<()>;

    /// Returns the finished percentage.
    fn scatter_regions(
        &self,
        region_ids: &[u64],
        group: &str,
        retry_limit: usize,
        skip_store_limit: bool,
    ) -> Result<u64>;
    /// Returns the finished percentage and the new region ids.
    fn split_regions(&self, split_keys: &[Vec<u8>], retry_limit: usize) -> (u64, Vec<u64>);
    fn get_operator(&self, region_id: u64) -> Option<OperatorRecord>;
    /// Schedules a remove-peer operator, used when a store reports damaged
    /// regions.
    fn add_remove_peer_operator(&self, region_id: u64, store_id: u64) -> Result<()>;

    fn set_min_resolved_ts(&self, store_id: u64, min_resolved_ts: u64) -> Result<()>;
    fn get_leader_store_by_region_id(&self, region_id: u64) -> Option<metapb::Store>;

    fn is_region_bucket_enabled(&self) -> bool;
    fn is_feature_supported(&self, feature: &str) -> bool;
    fn cluster_version(&self) -> String;

    fn set_external_timestamp(&self, ts: u64, global_ts: u64) -> Result<()>;
    fn get_external_timestamp(&self) -> u64;
    fn is_snapshot_recovering(&self) -> Result<bool>;
}

/// What the allocator reports for one dc-location.
#[derive(Clone, Debug, Default)]
pub struct DcLocationInfo {
    pub suffix: i32,
    pub max_ts: Timestamp,
}

/// The outcome of a max-TS synchronization round.
#[derive(Clone, Debug, Default)]
pub struct SyncedMaxTs {
    pub max_local_ts: Option<Timestamp>,
    pub synced_dcs: Vec<String>,
}

/// The local timestamp allocator.
pub trait TsoAllocator: Send + Sync {
    fn handle_request(&self, count: u32) -> PdFuture<Timestamp>;
    fn sync_max_ts(&self, max_ts: Option<Timestamp>, skip_check: bool) -> PdFuture<SyncedMaxTs>;
    fn dc_location_info(&self, dc_location: &str) -> PdFuture<Option<DcLocationInfo>>;
}

#[derive(Clone, Debug, Default)]
pub struct ServiceSafePoint {
    pub service_id: String,
    pub expired_at: i64,
    pub safe_point: u64,
}

pub trait GcSafePointManager: Send + Sync {
    fn load_gc_safe_point(&self) -> Result<u64>;
    /// Returns the previous safe point.
    fn update_gc_safe_point(&self, safe_point: u64) -> Result<u64>;
    /// Returns the minimal service safe point and whether the update took.
    fn update_service_gc_safe_point(
        &self,
        service_id: String,
        safe_point: u64,
        ttl: i64,
        now_unix: i64,
    ) -> Result<(ServiceSafePoint, bool)>;
    fn remove_service_gc_safe_point(&self, service_id: &str) -> Result<()>;
}

/// The follower region synchronization loop.
pub trait RegionSyncer: Send + Sync {
    fn sync(
        &self,
        stream: RequestStream<SyncRegionRequest>,
        sink: DuplexSink<SyncRegionResponse>,
    ) -> PdFuture<()>;
}

/// This member's view of the election state.
pub trait ElectionMember: Send + Sync {
    fn is_leader(&self) -> bool;
    fn leader(&self) -> Option<pdpb::Member>;
    fn members(&self) -> Result<Vec<pdpb::Member>>;
    fn etcd_leader_id(&self) -> u64;
    fn tso_allocator_leaders(&self) -> HashMap<String, pdpb::Member> {
        HashMap::new()
    }
}

/// An external subscription maintaining the current primary (and the full
/// address set) of an independent service. `force_load` asks for an
/// immediate refresh after a peer answered "not leader".
pub trait ServiceWatcher: Send + Sync {
    fn primary(&self) -> Option<String>;
    fn service_addrs(&self) -> Vec<String>;
    fn force_load(&self);
}
