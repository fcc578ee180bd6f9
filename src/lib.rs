// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The request-routing and stream-forwarding frontend of the Placement
//! Driver.
//!
//! This crate terminates the cluster RPC surface (`kvproto::pdpb::Pd`) on one
//! PD member. Every request is admitted (cluster id, leader role, rate
//! limits) and then either served locally through the collaborator traits in
//! [`cluster`], or relayed to the right peer: the PD leader for ordinary
//! requests, a TSO service for timestamp streams, or the scheduling service
//! for region movement. The hard parts live in [`tso_proxy`] (fan-in batching
//! of many client timestamp streams onto one upstream stream per peer) and in
//! the per-stream forwarders of [`service`].

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_derive;
#[macro_use]
extern crate slog_global;

pub mod cluster;
pub mod config;
pub mod conn;
pub mod errors;
pub mod forward;
pub mod global_config;
pub mod global_tso;
pub mod guard;
pub mod hbstream;
pub mod logger;
pub mod metrics;
pub mod min_ts;
pub mod ratelimit;
pub mod security;
pub mod server;
pub mod service;
pub mod testing;
pub mod tso_proxy;
pub mod util;

pub use self::config::Config;
pub use self::errors::{Error, Result};
pub use self::server::PdServer;

use futures::future::BoxFuture;

/// The future type every collaborator trait speaks.
pub type PdFuture<T> = BoxFuture<'static, Result<T>>;

/// Metadata key naming the peer that should actually process a request.
pub const FORWARDED_HOST_KEY: &str = "pd-forwarded-host";
/// Metadata key a client sets to opt in to follower handling.
pub const FOLLOWER_HANDLE_KEY: &str = "pd-allow-follower-handle";

/// Key prefix mediated by the global-config operations.
pub const GLOBAL_CONFIG_PATH: &str = "/global/config/";
