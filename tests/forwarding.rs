// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! End-to-end scenarios against a real gRPC server: admission, unary and
//! streaming forwarding, the TSO proxy and global config.

use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use futures::{SinkExt, StreamExt};
use grpcio::{
    CallOption, ChannelBuilder, EnvBuilder, Environment, MetadataBuilder, RpcStatusCode,
    WriteFlags,
};
use kvproto::pdpb::{self, PdClient};

use pd_frontend::cluster::ServiceWatcher;
use pd_frontend::server::{Collaborators, PdServer};
use pd_frontend::testing::*;
use pd_frontend::Config;

const CLUSTER_ID: u64 = 6_000_000_001;

struct Fixture {
    server: Arc<PdServer>,
    addr: String,
    advertise_addr: String,
    cluster: Arc<MockCluster>,
    tso_watcher: Option<Arc<MockWatcher>>,
    meta_store: Arc<MemStore>,
    env: Arc<Environment>,
}

impl Fixture {
    fn client(&self) -> PdClient {
        let channel = ChannelBuilder::new(self.env.clone()).connect(&self.addr);
        PdClient::new(channel)
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.server.shutdown();
    }
}

fn free_local_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    format!("127.0.0.1:{}", addr.port())
}

fn new_fixture(leader: bool, tso_primary: Option<&str>) -> Fixture {
    pd_frontend::logger::init();
    let addr = free_local_addr();
    let advertise_addr = free_local_addr();
    let mut cfg = Config::default();
    cfg.client_urls = vec![addr.clone()];
    cfg.advertise_client_urls = vec![advertise_addr.clone()];

    let cluster = Arc::new(MockCluster::running());
    let member = Arc::new(MockMember::new(1, &addr));
    if !leader {
        member.demote();
    }
    let meta_store = Arc::new(MemStore::default());
    let tso_watcher = tso_primary.map(|primary| Arc::new(MockWatcher::with_primary(primary)));

    let collaborators = Collaborators {
        member: member.clone(),
        cluster: cluster.clone(),
        allocator: Arc::new(MockTsoAllocator::new(100, 0)),
        gc: Arc::new(MockGcManager::default()),
        syncer: Arc::new(MockSyncer),
        meta_store: meta_store.clone(),
        tso_watcher: tso_watcher
            .clone()
            .map(|w| w as Arc<dyn ServiceWatcher>),
        scheduling_watcher: None,
    };
    let server = PdServer::new(cfg, CLUSTER_ID, collaborators).unwrap();
    server.start().unwrap();

    Fixture {
        server,
        addr,
        advertise_addr,
        cluster,
        tso_watcher,
        meta_store,
        env: Arc::new(EnvBuilder::new().cq_count(1).build()),
    }
}

fn header() -> pdpb::RequestHeader {
    let mut header = pdpb::RequestHeader::default();
    header.set_cluster_id(CLUSTER_ID);
    header
}

fn call_opt(forwarded_host: Option<&str>, follower_handle: bool) -> CallOption {
    let mut builder = MetadataBuilder::with_capacity(2);
    if let Some(host) = forwarded_host {
        builder.add_str("pd-forwarded-host", host).unwrap();
    }
    if follower_handle {
        builder.add_str("pd-allow-follower-handle", "true").unwrap();
    }
    CallOption::default()
        .headers(builder.build())
        .timeout(Duration::from_secs(10))
}

fn alloc_id_req() -> pdpb::AllocIdRequest {
    let mut req = pdpb::AllocIdRequest::default();
    req.set_header(header());
    req
}

#[test]
fn test_forwarding_loop_prevention() {
    let fixture = new_fixture(true, None);
    let client = fixture.client();
    // The forwarded host names this member (by its advertise URL, which
    // nothing listens on): the request must be served locally, without any
    // outbound dial.
    let resp = client
        .alloc_id_opt(
            &alloc_id_req(),
            call_opt(Some(&fixture.advertise_addr), false),
        )
        .unwrap();
    assert_eq!(resp.get_header().get_cluster_id(), CLUSTER_ID);
    assert_eq!(resp.get_id(), 1);
}

#[test]
fn test_unary_forward_to_peer() {
    let upstream = MockUpstream::new(CLUSTER_ID);
    let (_upstream_server, upstream_addr) = start_mock_upstream(upstream.clone());

    let fixture = new_fixture(false, None);
    let client = fixture.client();

    // Without the forwarded host a follower rejects the request outright.
    match client.alloc_id_opt(&alloc_id_req(), call_opt(None, false)) {
        Err(grpcio::Error::RpcFailure(status)) => {
            assert_eq!(status.code(), RpcStatusCode::UNAVAILABLE);
            assert!(status.message().contains("not leader"));
        }
        other => panic!("unexpected {:?}", other),
    }

    // With it, the frontend relays to the peer and returns its reply
    // unchanged; no role check happens on the relay.
    let resp = client
        .alloc_id_opt(&alloc_id_req(), call_opt(Some(&upstream_addr), false))
        .unwrap();
    assert_eq!(resp.get_id(), 9001);
    assert_eq!(upstream.alloc_id_calls(), 1);
}

#[test]
fn test_cluster_id_mismatch_is_failed_precondition() {
    let fixture = new_fixture(true, None);
    let client = fixture.client();
    let mut req = pdpb::AllocIdRequest::default();
    req.mut_header().set_cluster_id(CLUSTER_ID + 1);
    match client.alloc_id_opt(&req, call_opt(None, false)) {
        Err(grpcio::Error::RpcFailure(status)) => {
            assert_eq!(status.code(), RpcStatusCode::FAILED_PRECONDITION);
            assert!(status.message().contains("mismatch cluster id"));
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn test_id_learning_rpcs_skip_cluster_id_check() {
    let fixture = new_fixture(true, None);
    let client = fixture.client();
    // GetMembers carries no cluster id at all and must still answer.
    let resp = client
        .get_members_opt(&pdpb::GetMembersRequest::default(), call_opt(None, false))
        .unwrap();
    assert_eq!(resp.get_header().get_cluster_id(), CLUSTER_ID);
    assert_eq!(resp.get_members().len(), 1);
    let resp = client
        .get_cluster_info_opt(&pdpb::GetClusterInfoRequest::default(), call_opt(None, false))
        .unwrap();
    assert_eq!(resp.get_service_modes(), [pdpb::ServiceMode::PdSvcMode]);
}

#[test]
fn test_follower_read_opt_in() {
    let fixture = new_fixture(false, None);
    fixture.cluster.set_syncer_running(true);
    fixture.cluster.add_region(region_record(2, b"a", b"z", 1));
    let client = fixture.client();

    let mut req = pdpb::GetRegionRequest::default();
    req.set_header(header());
    req.set_region_key(b"k".to_vec());

    // No opt-in: refused.
    match client.get_region_opt(&req, call_opt(None, false)) {
        Err(grpcio::Error::RpcFailure(status)) => {
            assert_eq!(status.code(), RpcStatusCode::UNAVAILABLE);
        }
        other => panic!("unexpected {:?}", other),
    }

    // Opt-in: served from the local cache, no forward.
    let resp = client.get_region_opt(&req, call_opt(None, true)).unwrap();
    assert!(!resp.get_header().has_error());
    assert_eq!(resp.get_region().get_id(), 2);

    // A stopped syncer turns follower reads into region-not-found.
    fixture.cluster.set_syncer_running(false);
    let resp = client.get_region_opt(&req, call_opt(None, true)).unwrap();
    assert_eq!(
        resp.get_header().get_error().get_field_type(),
        pdpb::ErrorType::RegionNotFound
    );
}

#[test]
fn test_region_buckets_ride_only_on_enabled_leader_reads() {
    let fixture = new_fixture(true, None);
    let mut record = region_record(2, b"a", b"z", 1);
    let mut buckets = kvproto::metapb::Buckets::default();
    buckets.set_region_id(2);
    buckets.set_keys(vec![b"a".to_vec(), b"m".to_vec(), b"z".to_vec()].into());
    record.buckets = Some(buckets);
    fixture.cluster.add_region(record);
    let client = fixture.client();

    let mut req = pdpb::GetRegionRequest::default();
    req.set_header(header());
    req.set_region_key(b"k".to_vec());
    req.set_need_buckets(true);

    // Feature disabled: asked-for buckets stay out of the response.
    let resp = client.get_region_opt(&req, call_opt(None, false)).unwrap();
    assert!(!resp.has_buckets());

    fixture.cluster.set_bucket_enabled(true);
    let resp = client.get_region_opt(&req, call_opt(None, false)).unwrap();
    assert!(resp.has_buckets());
    assert_eq!(resp.get_buckets().get_keys().len(), 3);
}

#[test]
fn test_tso_served_locally() {
    let fixture = new_fixture(true, None);
    let client = fixture.client();
    let (mut tx, mut rx) = client.tso_opt(call_opt(None, false)).unwrap();

    block_on(async {
        let mut req = pdpb::TsoRequest::default();
        req.set_header(header());
        req.set_count(3);
        tx.send((req, WriteFlags::default())).await.unwrap();
        let resp = rx.next().await.unwrap().unwrap();
        assert_eq!(resp.get_count(), 3);
        assert_eq!(resp.get_timestamp().get_physical(), 100);
        assert_eq!(resp.get_timestamp().get_logical(), 3);
        tx.close().await.unwrap();
    });
}

#[test]
fn test_tso_proxy_partitions_ranges() {
    let upstream = MockUpstream::new(CLUSTER_ID);
    let (_upstream_server, upstream_addr) = start_mock_upstream(upstream);

    let fixture = new_fixture(true, None);
    let client_a = fixture.client();
    let client_b = fixture.client();

    let opt = || call_opt(Some(&upstream_addr), false);
    let (mut tx_a, mut rx_a) = client_a.tso_opt(opt()).unwrap();
    let (mut tx_b, mut rx_b) = client_b.tso_opt(opt()).unwrap();

    let range_of = |resp: &pdpb::TsoResponse| {
        let logical = resp.get_timestamp().get_logical();
        (logical - resp.get_count() as i64 + 1, logical)
    };

    let (resp_a, resp_b) = block_on(async {
        let mut req_a = pdpb::TsoRequest::default();
        req_a.set_header(header());
        req_a.set_count(3);
        let mut req_b = req_a.clone();
        req_b.set_count(5);
        tx_a.send((req_a, WriteFlags::default())).await.unwrap();
        tx_b.send((req_b, WriteFlags::default())).await.unwrap();
        let resp_a = rx_a.next().await.unwrap().unwrap();
        let resp_b = rx_b.next().await.unwrap().unwrap();
        let _ = tx_a.close().await;
        let _ = tx_b.close().await;
        (resp_a, resp_b)
    });

    assert_eq!(resp_a.get_count(), 3);
    assert_eq!(resp_b.get_count(), 5);
    assert_eq!(resp_a.get_timestamp().get_physical(), 42);
    assert_eq!(resp_b.get_timestamp().get_physical(), 42);
    // The two sub-ranges are disjoint and jointly cover 8 timestamps.
    let (a_lo, a_hi) = range_of(&resp_a);
    let (b_lo, b_hi) = range_of(&resp_b);
    assert!(a_hi < b_lo || b_hi < a_lo, "ranges overlap: {:?} {:?}", (a_lo, a_hi), (b_lo, b_hi));
    assert_eq!((a_hi - a_lo + 1) + (b_hi - b_lo + 1), 8);
}

#[test]
fn test_tso_proxy_not_leader_forces_watcher_reload() {
    let upstream = MockUpstream::new(CLUSTER_ID);
    upstream.fail_tso_with_not_leader();
    let (_upstream_server, upstream_addr) = start_mock_upstream(upstream);

    let fixture = new_fixture(true, Some(&upstream_addr));
    let watcher = fixture.tso_watcher.clone().unwrap();
    let client = fixture.client();
    let (mut tx, mut rx) = client.tso_opt(call_opt(Some(&upstream_addr), false)).unwrap();

    block_on(async {
        let mut req = pdpb::TsoRequest::default();
        req.set_header(header());
        req.set_count(1);
        tx.send((req, WriteFlags::default())).await.unwrap();
        // The dispatcher fails the batch and tears the stream down with the
        // cause.
        assert!(rx.next().await.map(|r| r.is_err()).unwrap_or(true));
    });

    for _ in 0..50 {
        if watcher.force_load_count() > 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(watcher.force_load_count(), 1);
}

#[test]
fn test_region_heartbeat_local_and_damaged_store() {
    let fixture = new_fixture(true, None);
    fixture.cluster.add_store(1);
    fixture.cluster.add_region(region_record(2, b"", b"", 1));
    let client = fixture.client();

    let (mut tx, _rx) = client.region_heartbeat_opt(call_opt(None, false)).unwrap();
    block_on(async {
        let mut req = pdpb::RegionHeartbeatRequest::default();
        req.set_header(header());
        let record = region_record(2, b"", b"", 1);
        req.set_region(record.region.clone());
        req.set_leader(record.leader.clone().unwrap());
        tx.send((req, WriteFlags::default())).await.unwrap();
        // Wait for the handler to consume it.
        for _ in 0..50 {
            if fixture.cluster.region_heartbeat_count() > 0 {
                break;
            }
            pd_frontend::util::delay(Duration::from_millis(20)).await;
        }
        let _ = tx.close().await;
    });
    assert_eq!(fixture.cluster.region_heartbeat_count(), 1);

    // A store heartbeat naming damaged regions schedules remove-peer
    // operators and still succeeds.
    let mut req = pdpb::StoreHeartbeatRequest::default();
    req.set_header(header());
    let stats = req.mut_stats();
    stats.set_store_id(1);
    stats.set_damaged_regions_id(vec![5, 6]);
    let resp = client.store_heartbeat_opt(&req, call_opt(None, false)).unwrap();
    assert!(!resp.get_header().has_error());
    assert_eq!(fixture.cluster.remove_peer_ops(), vec![(5, 1), (6, 1)]);
}

#[test]
fn test_region_heartbeat_forwarded() {
    let upstream = MockUpstream::new(CLUSTER_ID);
    let (_upstream_server, upstream_addr) = start_mock_upstream(upstream.clone());

    let fixture = new_fixture(false, None);
    let client = fixture.client();
    let (mut tx, mut rx) = client
        .region_heartbeat_opt(call_opt(Some(&upstream_addr), false))
        .unwrap();

    block_on(async {
        for region_id in [7, 8] {
            let mut req = pdpb::RegionHeartbeatRequest::default();
            req.set_header(header());
            let record = region_record(region_id, b"", b"", 1);
            req.set_region(record.region.clone());
            req.set_leader(record.leader.clone().unwrap());
            tx.send((req, WriteFlags::default())).await.unwrap();
        }
        // The upstream echoes one response per request through the relay.
        let resp = rx.next().await.unwrap().unwrap();
        assert_eq!(resp.get_region_id(), 7);
        let resp = rx.next().await.unwrap().unwrap();
        assert_eq!(resp.get_region_id(), 8);
        let _ = tx.close().await;
    });
    assert_eq!(upstream.region_heartbeat_count(), 2);
    // Nothing was handled locally.
    assert_eq!(fixture.cluster.region_heartbeat_count(), 0);
}

#[test]
fn test_report_buckets_local_and_forwarded() {
    let fixture = new_fixture(true, None);
    fixture.cluster.add_store(1);
    fixture.cluster.add_region(region_record(2, b"", b"", 1));
    let client = fixture.client();

    let (mut tx, resp_fut) = client.report_buckets_opt(call_opt(None, false)).unwrap();
    block_on(async {
        let mut req = pdpb::ReportBucketsRequest::default();
        req.set_header(header());
        let buckets = req.mut_buckets();
        buckets.set_region_id(2);
        buckets.set_keys(vec![b"a".to_vec(), b"m".to_vec()].into());
        tx.send((req, WriteFlags::default())).await.unwrap();
        tx.close().await.unwrap();
        let resp = resp_fut.await.unwrap();
        assert!(!resp.get_header().has_error());
    });
    assert_eq!(fixture.cluster.bucket_report_count(), 1);

    // Forwarded variant.
    let upstream = MockUpstream::new(CLUSTER_ID);
    let (_upstream_server, upstream_addr) = start_mock_upstream(upstream.clone());
    let follower = new_fixture(false, None);
    let client = follower.client();
    let (mut tx, resp_fut) = client
        .report_buckets_opt(call_opt(Some(&upstream_addr), false))
        .unwrap();
    block_on(async {
        let mut req = pdpb::ReportBucketsRequest::default();
        req.set_header(header());
        let buckets = req.mut_buckets();
        buckets.set_region_id(3);
        buckets.set_keys(vec![b"a".to_vec()].into());
        tx.send((req, WriteFlags::default())).await.unwrap();
        tx.close().await.unwrap();
        // The closing response is relayed from the upstream.
        let resp = resp_fut.await.unwrap();
        assert_eq!(resp.get_header().get_cluster_id(), CLUSTER_ID);
    });
    assert_eq!(upstream.bucket_report_count(), 1);
}

#[test]
fn test_min_ts_rejects_inconsistent_totals() {
    let (_tso_a, addr_a) = start_mock_tso(MockTsoService::new(CLUSTER_ID, 3, 2));
    let (_tso_b, addr_b) = start_mock_tso(MockTsoService::new(CLUSTER_ID, 4, 2));

    let fixture = new_fixture(true, Some(&addr_a));
    fixture
        .tso_watcher
        .as_ref()
        .unwrap()
        .set_addrs(vec![addr_a.clone(), addr_b.clone()]);
    let client = fixture.client();
    let mut req = pdpb::GetMinTsRequest::default();
    req.set_header(header());
    let resp = client.get_min_ts_opt(&req, call_opt(None, false)).unwrap();
    assert!(resp.get_header().has_error());
    assert!(resp
        .get_header()
        .get_error()
        .get_message()
        .contains("inconsistent keyspace group total count"));
}

#[test]
fn test_min_ts_across_consistent_allocators() {
    let (_tso_a, addr_a) = start_mock_tso(MockTsoService::new(CLUSTER_ID, 3, 2));
    let (_tso_b, addr_b) = start_mock_tso(MockTsoService::new(CLUSTER_ID, 3, 1));

    let fixture = new_fixture(true, Some(&addr_a));
    fixture
        .tso_watcher
        .as_ref()
        .unwrap()
        .set_addrs(vec![addr_a.clone(), addr_b.clone()]);
    let client = fixture.client();
    let mut req = pdpb::GetMinTsRequest::default();
    req.set_header(header());
    let resp = client.get_min_ts_opt(&req, call_opt(None, false)).unwrap();
    assert!(!resp.get_header().has_error(), "{:?}", resp.get_header());
    assert_eq!(resp.get_timestamp().get_physical(), 77);
}

#[test]
fn test_global_config_roundtrip_and_compaction() {
    let fixture = new_fixture(true, None);
    let client = fixture.client();

    let mut put = pdpb::GlobalConfigItem::default();
    put.set_kind(pdpb::EventType::Put);
    put.set_name("source_id".to_owned());
    put.set_payload(b"42".to_vec());
    let mut store_req = pdpb::StoreGlobalConfigRequest::default();
    store_req.set_changes(vec![put].into());
    let resp = client
        .store_global_config_opt(&store_req, call_opt(None, false))
        .unwrap();
    assert!(!resp.has_error());

    let mut load_req = pdpb::LoadGlobalConfigRequest::default();
    load_req.set_names(vec!["source_id".to_owned()].into());
    let resp = client
        .load_global_config_opt(&load_req, call_opt(None, false))
        .unwrap();
    assert_eq!(resp.get_items().len(), 1);
    assert_eq!(resp.get_items()[0].get_payload(), b"42");

    // A missing name answers a typed error item.
    let mut load_req = pdpb::LoadGlobalConfigRequest::default();
    load_req.set_names(vec!["missing".to_owned()].into());
    let resp = client
        .load_global_config_opt(&load_req, call_opt(None, false))
        .unwrap();
    assert_eq!(
        resp.get_items()[0].get_error().get_field_type(),
        pdpb::ErrorType::GlobalConfigNotFound
    );

    // Watching from a compacted revision gets one DATA_COMPACTED response
    // and the stream terminates.
    fixture.meta_store.compact(10);
    let mut watch_req = pdpb::WatchGlobalConfigRequest::default();
    watch_req.set_revision(1);
    let mut watch = client
        .watch_global_config_opt(&watch_req, call_opt(None, false))
        .unwrap();
    block_on(async {
        let resp = watch.next().await.unwrap().unwrap();
        assert_eq!(
            resp.get_header().get_error().get_field_type(),
            pdpb::ErrorType::DataCompacted
        );
        assert!(watch.next().await.is_none());
    });
}

#[test]
fn test_gc_safe_point_updates() {
    let fixture = new_fixture(true, None);
    let client = fixture.client();

    let mut update = pdpb::UpdateGcSafePointRequest::default();
    update.set_header(header());
    update.set_safe_point(50);
    let resp = client
        .update_gc_safe_point_opt(&update, call_opt(None, false))
        .unwrap();
    assert_eq!(resp.get_new_safe_point(), 50);

    // Moving the safe point backwards keeps the newer one.
    update.set_safe_point(40);
    let resp = client
        .update_gc_safe_point_opt(&update, call_opt(None, false))
        .unwrap();
    assert_eq!(resp.get_new_safe_point(), 50);

    let mut get = pdpb::GetGcSafePointRequest::default();
    get.set_header(header());
    let resp = client
        .get_gc_safe_point_opt(&get, call_opt(None, false))
        .unwrap();
    assert_eq!(resp.get_safe_point(), 50);

    // Service safepoints anchor against a fresh global timestamp (the
    // direct allocator path here).
    let mut req = pdpb::UpdateServiceGcSafePointRequest::default();
    req.set_header(header());
    req.set_service_id(b"cdc".to_vec());
    req.set_ttl(60);
    req.set_safe_point(45);
    let resp = client
        .update_service_gc_safe_point_opt(&req, call_opt(None, false))
        .unwrap();
    assert!(!resp.get_header().has_error());
    assert_eq!(resp.get_service_id(), b"cdc");
    assert_eq!(resp.get_min_safe_point(), 45);
}

#[test]
fn test_internal_rpc_requires_leader_sender() {
    let fixture = new_fixture(true, None);
    let client = fixture.client();

    // The sender claims an id that is not the leader's.
    let mut req = pdpb::SyncMaxTsRequest::default();
    req.mut_header().set_cluster_id(CLUSTER_ID);
    req.mut_header().set_sender_id(42);
    req.set_skip_check(true);
    match client.sync_max_ts_opt(&req, call_opt(None, false)) {
        Err(grpcio::Error::RpcFailure(status)) => {
            assert_eq!(status.code(), RpcStatusCode::FAILED_PRECONDITION);
            assert!(status.message().contains("mismatch leader id"));
        }
        other => panic!("unexpected {:?}", other),
    }

    // The real leader id passes and the allocator answers.
    req.mut_header().set_sender_id(1);
    let mut max_ts = pdpb::Timestamp::default();
    max_ts.set_physical(100);
    max_ts.set_logical(5);
    req.set_max_ts(max_ts);
    let resp = client.sync_max_ts_opt(&req, call_opt(None, false)).unwrap();
    assert!(!resp.get_header().has_error());
    assert_eq!(resp.get_synced_dcs(), ["global".to_owned()]);
}

#[test]
fn test_not_bootstrapped_header() {
    let fixture = new_fixture(true, None);
    fixture.cluster.set_running(false);
    let client = fixture.client();
    let mut req = pdpb::GetAllStoresRequest::default();
    req.set_header(header());
    let resp = client.get_all_stores_opt(&req, call_opt(None, false)).unwrap();
    assert_eq!(
        resp.get_header().get_error().get_field_type(),
        pdpb::ErrorType::NotBootstrapped
    );
}

#[test]
fn test_tombstone_store_heartbeat() {
    let fixture = new_fixture(true, None);
    fixture.cluster.add_tombstone_store(9);
    let client = fixture.client();
    let mut req = pdpb::StoreHeartbeatRequest::default();
    req.set_header(header());
    req.mut_stats().set_store_id(9);
    let resp = client.store_heartbeat_opt(&req, call_opt(None, false)).unwrap();
    assert_eq!(
        resp.get_header().get_error().get_field_type(),
        pdpb::ErrorType::StoreTombstone
    );
}
