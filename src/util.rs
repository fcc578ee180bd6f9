// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt::{self, Write as _};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use futures::future::{self, Either, FutureExt};
use kvproto::pdpb::Timestamp;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;

const TS_LOGICAL_BITS: u32 = 18;

/// Composes a timestamp into the single integer representation.
pub fn compose_ts(ts: &Timestamp) -> u64 {
    (ts.get_physical() as u64) << TS_LOGICAL_BITS | ts.get_logical() as u64
}

/// Splits a composed timestamp back into physical and logical parts.
pub fn parse_ts(ts: u64) -> Timestamp {
    let mut out = Timestamp::default();
    out.set_physical((ts >> TS_LOGICAL_BITS) as i64);
    out.set_logical((ts & ((1 << TS_LOGICAL_BITS) - 1)) as i64);
    out
}

pub fn compare_ts(a: &Timestamp, b: &Timestamp) -> std::cmp::Ordering {
    (a.get_physical(), a.get_logical()).cmp(&(b.get_physical(), b.get_logical()))
}

pub fn is_zero_ts(ts: &Timestamp) -> bool {
    ts.get_physical() == 0 && ts.get_logical() == 0
}

/// The logical part carries the allocator suffix in its low bits, so counts
/// must be shifted before they are added.
pub fn add_logical(logical: i64, count: i64, suffix_bits: u32) -> i64 {
    logical + (count << suffix_bits)
}

lazy_static! {
    static ref GLOBAL_TIMER: tokio::runtime::Runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_time()
        .thread_name("timer")
        .build()
        .expect("failed to spawn global timer");
}

/// Sleeps on the global timer thread. Usable from any executor, including
/// the gRPC completion queues.
pub fn delay(dur: Duration) -> impl Future<Output = ()> + Send + 'static {
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    GLOBAL_TIMER.spawn(async move {
        tokio::time::sleep(dur).await;
        let _ = tx.send(());
    });
    rx.map(|_| ())
}

#[derive(Debug, PartialEq, Eq)]
pub struct TimeoutError;

/// Awaits `fut` for at most `dur` against the global timer.
pub async fn timeout<F: Future>(dur: Duration, fut: F) -> std::result::Result<F::Output, TimeoutError> {
    futures::pin_mut!(fut);
    match future::select(fut, Box::pin(delay(dur))).await {
        Either::Left((v, _)) => Ok(v),
        Either::Right(((), _)) => Err(TimeoutError),
    }
}

/// Runs a detached task to completion, logging instead of propagating any
/// panic, the way helper goroutines must never take the process down.
pub async fn log_panic<F: Future<Output = ()>>(tag: &'static str, fut: F) {
    if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
        error!("task panicked"; "tag" => tag);
    }
}

/// A cancellation scope carrying the cause of the first cancellation, so
/// every blocked waiter learns why it was woken.
#[derive(Clone)]
pub struct CancelContext {
    cause: std::sync::Arc<Mutex<Option<String>>>,
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelContext {
    pub fn new() -> CancelContext {
        let (tx, rx) = watch::channel(false);
        CancelContext {
            cause: std::sync::Arc::new(Mutex::new(None)),
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Cancels the scope. Only the first cause is kept.
    pub fn cancel(&self, cause: impl Into<String>) {
        {
            let mut slot = self.cause.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cause.into());
            }
        }
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn cause(&self) -> Option<String> {
        self.cause.lock().unwrap().clone()
    }

    /// Resolves once the scope is cancelled, yielding the cause.
    pub async fn done(&self) -> String {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
        self.cause().unwrap_or_else(|| "canceled".to_owned())
    }
}

/// A duration rendered as `3s` / `500ms` / `5m` in serialized config.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct ReadableDuration(pub Duration);

impl From<ReadableDuration> for Duration {
    fn from(d: ReadableDuration) -> Duration {
        d.0
    }
}

impl ReadableDuration {
    pub const fn millis(millis: u64) -> ReadableDuration {
        ReadableDuration(Duration::from_millis(millis))
    }

    pub const fn secs(secs: u64) -> ReadableDuration {
        ReadableDuration(Duration::from_secs(secs))
    }

    pub const fn minutes(minutes: u64) -> ReadableDuration {
        ReadableDuration::secs(minutes * 60)
    }

    pub fn as_millis(&self) -> u64 {
        self.0.as_millis() as u64
    }
}

impl FromStr for ReadableDuration {
    type Err = String;

    fn from_str(dur_str: &str) -> std::result::Result<ReadableDuration, String> {
        let dur_str = dur_str.trim();
        let err = || format!("invalid duration: {:?}", dur_str);
        let mut dur = 0u64; // in millis
        let mut num = String::new();
        let mut chars = dur_str.chars().peekable();
        while let Some(c) = chars.next() {
            if c.is_ascii_digit() || c == '.' {
                num.push(c);
                continue;
            }
            let unit: u64 = match c {
                'd' => 24 * 60 * 60 * 1000,
                'h' => 60 * 60 * 1000,
                'm' if chars.peek() == Some(&'s') => {
                    chars.next();
                    1
                }
                'm' => 60 * 1000,
                's' => 1000,
                _ => return Err(err()),
            };
            let value: f64 = num.parse().map_err(|_| err())?;
            dur += (value * unit as f64) as u64;
            num.clear();
        }
        if !num.is_empty() {
            return Err(err());
        }
        Ok(ReadableDuration(Duration::from_millis(dur)))
    }
}

impl fmt::Display for ReadableDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut millis = self.as_millis();
        if millis == 0 {
            return f.write_str("0s");
        }
        let hours = millis / (60 * 60 * 1000);
        millis %= 60 * 60 * 1000;
        let minutes = millis / (60 * 1000);
        millis %= 60 * 1000;
        let secs = millis / 1000;
        millis %= 1000;
        if hours > 0 {
            write!(f, "{}h", hours)?;
        }
        if minutes > 0 {
            write!(f, "{}m", minutes)?;
        }
        if secs > 0 {
            write!(f, "{}s", secs)?;
        }
        if millis > 0 {
            write!(f, "{}ms", millis)?;
        }
        Ok(())
    }
}

impl Serialize for ReadableDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut buf = String::new();
        write!(buf, "{}", self).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&buf)
    }
}

impl<'de> Deserialize<'de> for ReadableDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct DurVisitor;

        impl<'de> Visitor<'de> for DurVisitor {
            type Value = ReadableDuration;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("valid duration")
            }

            fn visit_str<E: de::Error>(self, dur_str: &str) -> std::result::Result<ReadableDuration, E> {
                dur_str.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_str(DurVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readable_duration() {
        for (src, expect) in [
            ("3s", ReadableDuration::secs(3)),
            ("500ms", ReadableDuration::millis(500)),
            ("5m", ReadableDuration::minutes(5)),
            ("1h2m3s", ReadableDuration::millis(3_723_000)),
            ("0s", ReadableDuration::secs(0)),
        ] {
            assert_eq!(src.parse::<ReadableDuration>().unwrap(), expect, "{}", src);
        }
        assert!("3x".parse::<ReadableDuration>().is_err());
        assert!("s".parse::<ReadableDuration>().is_err());
        assert_eq!(format!("{}", ReadableDuration::millis(90_500)), "1m30s500ms");
    }

    #[test]
    fn test_ts_compose() {
        let mut ts = Timestamp::default();
        ts.set_physical(42);
        ts.set_logical(11);
        let composed = compose_ts(&ts);
        assert_eq!(parse_ts(composed), ts);
        assert_eq!(add_logical(10, 5, 0), 15);
        assert_eq!(add_logical(10, 5, 2), 30);
    }

    #[test]
    fn test_cancel_context_keeps_first_cause() {
        let ctx = CancelContext::new();
        assert!(!ctx.is_cancelled());
        ctx.cancel("first");
        ctx.cancel("second");
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.cause().unwrap(), "first");
        futures::executor::block_on(async {
            assert_eq!(ctx.done().await, "first");
        });
    }

    #[test]
    fn test_timeout() {
        futures::executor::block_on(async {
            let fast = timeout(Duration::from_secs(5), futures::future::ready(7)).await;
            assert_eq!(fast, Ok(7));
            let slow = timeout(
                Duration::from_millis(20),
                futures::future::pending::<()>(),
            )
            .await;
            assert_eq!(slow, Err(TimeoutError));
        });
    }
}
