// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Minimum-timestamp aggregation across all keyspace-group allocators of the
//! TSO service. The result is only trusted when every allocator reports the
//! same group total and the serving counts jointly cover it.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use grpcio::CallOption;
use kvproto::pdpb::Timestamp;
use kvproto::tsopb::{self, TsoClient};

use crate::conn::ConnPool;
use crate::util::{compare_ts, is_zero_ts};
use crate::{Error, Result};

const GET_MIN_TS_TIMEOUT: Duration = Duration::from_secs(1);

/// Queries every TSO service address concurrently and returns the minimum
/// timestamp across all keyspace groups.
pub async fn get_min_ts_from_tso_service(
    pool: &Arc<ConnPool>,
    cluster_id: u64,
    addrs: &[String],
) -> Result<Timestamp> {
    if addrs.is_empty() {
        return Err(Error::GetMinTs(
            "no tso servers/pods discovered".to_owned(),
        ));
    }
    let calls = addrs.iter().map(|addr| {
        let pool = pool.clone();
        let addr = addr.clone();
        async move {
            match get_min_ts_from_single_server(&pool, cluster_id, &addr).await {
                Ok(resp) => Some(resp),
                Err(e) => {
                    warn!("failed to get min ts from tso server";
                        "address" => %addr, "err" => ?e);
                    None
                }
            }
        }
    });
    let resps: Vec<_> = join_all(calls).await.into_iter().flatten().collect();
    validate_min_ts_responses(&resps)
}

async fn get_min_ts_from_single_server(
    pool: &Arc<ConnPool>,
    cluster_id: u64,
    addr: &str,
) -> Result<tsopb::GetMinTsResponse> {
    let client = TsoClient::new(pool.get(addr));
    let mut req = tsopb::GetMinTsRequest::default();
    req.mut_header().set_cluster_id(cluster_id);
    let opt = CallOption::default().timeout(GET_MIN_TS_TIMEOUT);
    let resp = client.get_min_ts_async_opt(&req, opt)?.await?;
    if resp.get_header().has_error() {
        return Err(Error::GetMinTs(
            resp.get_header().get_error().get_message().to_owned(),
        ));
    }
    Ok(resp)
}

/// The consistency checks over the collected responses:
/// every responder reports the same positive group total, the serving counts
/// sum up to it, and a positive minimum exists.
pub fn validate_min_ts_responses(resps: &[tsopb::GetMinTsResponse]) -> Result<Timestamp> {
    if resps.is_empty() {
        return Err(Error::GetMinTs(
            "none of tso server/pod responded".to_owned(),
        ));
    }
    let total = resps[0].get_keyspace_groups_total();
    let mut asked: u32 = 0;
    let mut min_ts: Option<&Timestamp> = None;
    for resp in resps {
        if resp.get_keyspace_groups_total() == 0 {
            return Err(Error::GetMinTs(
                "the tso service has no keyspace group".to_owned(),
            ));
        }
        if resp.get_keyspace_groups_total() != total {
            return Err(Error::GetMinTs(
                "inconsistent keyspace group total count".to_owned(),
            ));
        }
        asked += resp.get_keyspace_groups_serving();
        let ts = resp.get_timestamp();
        if !is_zero_ts(ts) && min_ts.map_or(true, |min| compare_ts(ts, min).is_lt()) {
            min_ts = Some(ts);
        }
    }
    if asked != total {
        return Err(Error::GetMinTs(format!(
            "can't query all the tso keyspace groups, asked {}, expected {}",
            asked, total
        )));
    }
    match min_ts {
        Some(ts) => Ok(ts.clone()),
        None => Err(Error::GetMinTs("the tso service is not ready".to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(total: u32, serving: u32, physical: i64, logical: i64) -> tsopb::GetMinTsResponse {
        let mut resp = tsopb::GetMinTsResponse::default();
        resp.set_keyspace_groups_total(total);
        resp.set_keyspace_groups_serving(serving);
        let ts = resp.mut_timestamp();
        ts.set_physical(physical);
        ts.set_logical(logical);
        resp
    }

    #[test]
    fn test_minimum_selection() {
        let resps = vec![resp(3, 2, 100, 5), resp(3, 1, 90, 9)];
        let min = validate_min_ts_responses(&resps).unwrap();
        assert_eq!(min.get_physical(), 90);
        assert_eq!(min.get_logical(), 9);
    }

    #[test]
    fn test_zero_timestamps_are_not_candidates() {
        let resps = vec![resp(2, 1, 0, 0), resp(2, 1, 80, 1)];
        let min = validate_min_ts_responses(&resps).unwrap();
        assert_eq!(min.get_physical(), 80);
    }

    #[test]
    fn test_inconsistent_total_is_rejected() {
        let resps = vec![resp(3, 2, 100, 5), resp(4, 2, 90, 9)];
        match validate_min_ts_responses(&resps) {
            Err(Error::GetMinTs(msg)) => {
                assert!(msg.contains("inconsistent keyspace group total count"))
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_partial_coverage_is_rejected() {
        let resps = vec![resp(3, 1, 100, 5), resp(3, 1, 90, 9)];
        match validate_min_ts_responses(&resps) {
            Err(Error::GetMinTs(msg)) => assert!(msg.contains("can't query all")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_empty_and_not_ready() {
        assert!(validate_min_ts_responses(&[]).is_err());
        let resps = vec![resp(1, 1, 0, 0)];
        match validate_min_ts_responses(&resps) {
            Err(Error::GetMinTs(msg)) => assert!(msg.contains("not ready")),
            other => panic!("unexpected {:?}", other),
        }
        let resps = vec![resp(0, 0, 0, 0)];
        validate_min_ts_responses(&resps).unwrap_err();
    }
}
