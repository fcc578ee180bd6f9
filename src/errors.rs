// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

use std::error;
use std::result;

use grpcio::{RpcStatus, RpcStatusCode};
use kvproto::pdpb::{self, ErrorType, ResponseHeader};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not leader")]
    NotLeader,
    #[error("server not started")]
    NotStarted,
    #[error("not leader and follower handling not allowed")]
    FollowerHandlingNotAllowed,
    #[error("mismatch cluster id, need {expect} but got {got}")]
    ClusterMismatch { expect: u64, got: u64 },
    #[error("mismatch leader id, need {expect} but got {got}")]
    MismatchLeader { expect: u64, got: u64 },
    #[error("rate limit exceeded for {0}")]
    RateLimitExceeded(String),
    #[error("not found tso address")]
    NotFoundTsoAddr,
    #[error("not found scheduling address")]
    NotFoundSchedulingAddr,
    #[error("send heartbeat timeout")]
    SendHeartbeatTimeout,
    #[error("forward tso request timeout")]
    ForwardTsoTimeout,
    #[error("tso proxy timeout when receiving from client; stream closed by server")]
    TsoProxyRecvTimeout,
    #[error("stream closed")]
    StreamClosed,
    #[error("get min ts failed: {0}")]
    GetMinTs(String),
    #[error("global config transaction failed")]
    TransactionFailed,
    #[error("data compacted, required revision {required} is smaller than compact revision {compact}")]
    DataCompacted { required: i64, compact: i64 },
    #[error("{0:?}")]
    Grpc(#[from] grpcio::Error),
    #[error("stream disconnected")]
    StreamDisconnect(#[from] futures::channel::mpsc::SendError),
    #[error("{0:?}")]
    Io(#[from] std::io::Error),
    #[error("cluster {0} is already bootstrapped")]
    ClusterBootstrapped(u64),
    #[error("cluster is not bootstrapped")]
    ClusterNotBootstrapped,
    #[error("store is tombstone {0:?}")]
    StoreTombstone(String),
    #[error("region is not found {0:?}")]
    RegionNotFound(u64),
    #[error("incompatible cluster version {0:?}")]
    Incompatible(String),
    #[error("invalid value {0:?}")]
    InvalidValue(String),
    #[error("regions not contain all key ranges: {0}")]
    RegionsNotContainAllKeyRange(String),
    #[error("unknown error {0:?}")]
    Other(#[from] Box<dyn error::Error + Sync + Send>),
}

pub type Result<T> = result::Result<T, Error>;

#[macro_export]
macro_rules! box_err {
    ($e:expr) => ({
        let e: Box<dyn std::error::Error + Sync + Send> = format!("[{}:{}]: {}", file!(), line!(), $e).into();
        $crate::errors::Error::Other(e)
    });
    ($f:tt, $($arg:expr),+) => ({
        $crate::box_err!(format!($f, $($arg),+))
    });
}

impl Error {
    /// Maps admission and routing failures onto the statuses the clients
    /// branch on. Data errors never reach this path, they ride in response
    /// headers instead.
    pub fn rpc_status(&self) -> RpcStatus {
        let code = match self {
            Error::NotLeader
            | Error::NotStarted
            | Error::FollowerHandlingNotAllowed => RpcStatusCode::UNAVAILABLE,
            Error::ClusterMismatch { .. } | Error::MismatchLeader { .. } => {
                RpcStatusCode::FAILED_PRECONDITION
            }
            Error::RateLimitExceeded(_) => RpcStatusCode::RESOURCE_EXHAUSTED,
            Error::NotFoundTsoAddr | Error::NotFoundSchedulingAddr => RpcStatusCode::NOT_FOUND,
            Error::SendHeartbeatTimeout
            | Error::ForwardTsoTimeout
            | Error::TsoProxyRecvTimeout => RpcStatusCode::DEADLINE_EXCEEDED,
            Error::Grpc(grpcio::Error::RpcFailure(status)) => status.code(),
            _ => RpcStatusCode::UNKNOWN,
        };
        RpcStatus::with_message(code, format!("{}", self))
    }

    /// Whether the error invalidates the cached connection to the peer
    /// (unavailable / deadline-exceeded class).
    pub fn need_rebuild_connection(&self) -> bool {
        match self {
            Error::StreamClosed => true,
            Error::Grpc(grpcio::Error::RpcFinished(_)) => true,
            Error::Grpc(grpcio::Error::RpcFailure(status)) => matches!(
                status.code(),
                RpcStatusCode::UNAVAILABLE
                    | RpcStatusCode::DEADLINE_EXCEEDED
                    | RpcStatusCode::INTERNAL
                    | RpcStatusCode::UNKNOWN
                    | RpcStatusCode::RESOURCE_EXHAUSTED
            ),
            Error::Grpc(grpcio::Error::RemoteStopped) => true,
            _ => false,
        }
    }

    /// Whether the peer answered with a leadership complaint, which should
    /// force-reload the primary watcher before the next attempt.
    pub fn is_peer_not_leader(&self) -> bool {
        format!("{}", self).contains("not leader")
    }
}

/// Converts a response header error back to a typed `Error`.
pub fn check_resp_header(header: &ResponseHeader) -> Result<()> {
    if !header.has_error() {
        return Ok(());
    }
    let err = header.get_error();
    match err.get_field_type() {
        ErrorType::AlreadyBootstrapped => Err(Error::ClusterBootstrapped(header.get_cluster_id())),
        ErrorType::NotBootstrapped => Err(Error::ClusterNotBootstrapped),
        ErrorType::IncompatibleVersion => Err(Error::Incompatible(err.get_message().to_owned())),
        ErrorType::StoreTombstone => Err(Error::StoreTombstone(err.get_message().to_owned())),
        ErrorType::RegionNotFound => Err(Error::RegionNotFound(0)),
        ErrorType::Ok => Ok(()),
        _ => Err(box_err!(err.get_message())),
    }
}

/// Builds a response header carrying a typed error.
pub fn error_header(cluster_id: u64, err_type: ErrorType, message: impl Into<String>) -> ResponseHeader {
    let mut err = pdpb::Error::default();
    err.set_field_type(err_type);
    err.set_message(message.into());
    let mut header = ResponseHeader::default();
    header.set_cluster_id(cluster_id);
    header.set_error(err);
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_need_rebuild_classification() {
        let e = Error::Grpc(grpcio::Error::RpcFailure(RpcStatus::new(
            RpcStatusCode::UNAVAILABLE,
        )));
        assert!(e.need_rebuild_connection());
        let e = Error::Grpc(grpcio::Error::RpcFailure(RpcStatus::new(
            RpcStatusCode::DEADLINE_EXCEEDED,
        )));
        assert!(e.need_rebuild_connection());
        let e = Error::Grpc(grpcio::Error::RpcFailure(RpcStatus::new(
            RpcStatusCode::FAILED_PRECONDITION,
        )));
        assert!(!e.need_rebuild_connection());
        assert!(!Error::NotLeader.need_rebuild_connection());
    }

    #[test]
    fn test_not_leader_detection() {
        let e = Error::Grpc(grpcio::Error::RpcFailure(RpcStatus::with_message(
            RpcStatusCode::UNAVAILABLE,
            "not leader".to_owned(),
        )));
        assert!(e.is_peer_not_leader());
        assert!(Error::NotLeader.is_peer_not_leader());
        assert!(!Error::NotStarted.is_peer_not_leader());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = error_header(7, ErrorType::StoreTombstone, "store is tombstone");
        match check_resp_header(&header) {
            Err(Error::StoreTombstone(_)) => {}
            other => panic!("unexpected {:?}", other),
        }
        let mut ok = ResponseHeader::default();
        ok.set_cluster_id(7);
        check_resp_header(&ok).unwrap();
    }
}
