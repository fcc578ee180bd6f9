// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

use prometheus::*;

lazy_static! {
    pub static ref TSO_PROXY_HANDLE_DURATION_HISTOGRAM: Histogram = register_histogram!(
        "pd_server_tso_proxy_handling_duration_seconds",
        "Bucketed histogram of handling time of TSO proxy requests",
        exponential_buckets(0.0005, 2.0, 13).unwrap()
    )
    .unwrap();
    pub static ref TSO_PROXY_BATCH_SIZE_HISTOGRAM: Histogram = register_histogram!(
        "pd_server_tso_proxy_batch_size",
        "Bucketed histogram of TSO proxy batch size",
        exponential_buckets(1.0, 2.0, 13).unwrap()
    )
    .unwrap();
    pub static ref TSO_HANDLE_DURATION_HISTOGRAM: Histogram = register_histogram!(
        "pd_server_handle_tso_duration_seconds",
        "Bucketed histogram of handling time of TSO requests",
        exponential_buckets(0.0005, 2.0, 13).unwrap()
    )
    .unwrap();
    pub static ref FORWARD_FAIL_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "pd_server_forward_fail_total",
        "Total number of forwarding failures",
        &["request", "type"]
    )
    .unwrap();
    pub static ref REGION_HEARTBEAT_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "pd_server_region_heartbeat_total",
        "Total number of region heartbeat messages",
        &["store", "type", "status"]
    )
    .unwrap();
    pub static ref HEARTBEAT_STREAM_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "pd_server_heartbeat_stream_message_total",
        "Total number of messages pushed on heartbeat streams",
        &["store", "type", "status"]
    )
    .unwrap();
    pub static ref BUCKET_REPORT_COUNTER_VEC: IntCounterVec = register_int_counter_vec!(
        "pd_server_bucket_report_total",
        "Total number of bucket reports",
        &["store", "status"]
    )
    .unwrap();
    pub static ref STORE_HEARTBEAT_HANDLE_DURATION_HISTOGRAM: Histogram = register_histogram!(
        "pd_server_handle_store_heartbeat_duration_seconds",
        "Bucketed histogram of handling time of store heartbeats",
        exponential_buckets(0.0005, 2.0, 13).unwrap()
    )
    .unwrap();
}
