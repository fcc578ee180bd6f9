// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The TSO proxy dispatcher. Many downstream client streams issue timestamp
//! requests against the same upstream; opening one upstream stream per
//! downstream would be prohibitive, so the dispatcher keeps one upstream
//! stream per forwarded host, merges compatible requests into a single
//! counted request, and splits the answered logical range back across the
//! batch in arrival order.
//!
//! Exactly one task consumes each queue, so the upstream stream never sees
//! interleaved writers. Producers observe dispatcher failure through the
//! queue's cancellation scope, which carries the cause.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{Sink, SinkExt, Stream, StreamExt};
use grpcio::WriteFlags;
use kvproto::pdpb::{PdClient, TsoRequest, TsoResponse};
use tokio::sync::{mpsc, oneshot};

use crate::cluster::ServiceWatcher;
use crate::conn::ConnPool;
use crate::guard::{with_flags, GuardedSender};
use crate::metrics::{TSO_PROXY_BATCH_SIZE_HISTOGRAM, TSO_PROXY_HANDLE_DURATION_HISTOGRAM};
use crate::util::{self, add_logical, CancelContext};
use crate::{box_err, Error, PdFuture, Result};

/// The most sub-requests one merged upstream request may carry.
pub const MAX_MERGE_REQUESTS: usize = 10000;

/// Where a proxied sub-request delivers its slice of the response.
pub trait TsoResponseSink: Send + Sync {
    fn send(&self, resp: TsoResponse) -> PdFuture<()>;
}

impl<Si> TsoResponseSink for GuardedSender<Si>
where
    Si: Sink<(TsoResponse, WriteFlags)> + Unpin + Send + 'static,
    Si::Error: Into<Error> + Send,
{
    fn send(&self, resp: TsoResponse) -> PdFuture<()> {
        let sender = self.clone();
        Box::pin(async move { sender.send(with_flags(resp)).await })
    }
}

/// One timestamp sub-request waiting in a proxy queue.
pub struct ProxiedTsoRequest {
    pub forwarded_host: String,
    pub request: TsoRequest,
    pub downstream: Arc<dyn TsoResponseSink>,
}

/// A deadline token covering one in-flight batch. The watcher cancels the
/// queue when the timer fires before the batch completes.
struct TsDeadline {
    timeout: Duration,
    done: oneshot::Receiver<()>,
    cancel: CancelContext,
}

#[derive(Clone)]
struct TsoProxyQueue {
    id: u64,
    tx: mpsc::Sender<ProxiedTsoRequest>,
    ctx: CancelContext,
}

struct DispatcherInner {
    server_ctx: CancelContext,
    handle: tokio::runtime::Handle,
    pool: Arc<ConnPool>,
    primary_watcher: Option<Arc<dyn ServiceWatcher>>,
    cluster_id: u64,
    batch_timeout: Duration,
    idle_timeout: Duration,
    queues: Mutex<std::collections::HashMap<String, TsoProxyQueue>>,
    queue_id_alloc: AtomicU64,
}

#[derive(Clone)]
pub struct TsoProxyDispatcher {
    inner: Arc<DispatcherInner>,
}

impl TsoProxyDispatcher {
    pub fn new(
        server_ctx: CancelContext,
        handle: tokio::runtime::Handle,
        pool: Arc<ConnPool>,
        primary_watcher: Option<Arc<dyn ServiceWatcher>>,
        cluster_id: u64,
        batch_timeout: Duration,
        idle_timeout: Duration,
    ) -> TsoProxyDispatcher {
        TsoProxyDispatcher {
            inner: Arc::new(DispatcherInner {
                server_ctx,
                handle,
                pool,
                primary_watcher,
                cluster_id,
                batch_timeout,
                idle_timeout,
                queues: Mutex::new(std::collections::HashMap::new()),
                queue_id_alloc: AtomicU64::new(0),
            }),
        }
    }

    /// Queues `req` for its forwarded host, starting the per-host consumer
    /// on first demand. The returned scope lets the caller observe
    /// dispatcher failure without blocking on its own stream.
    pub async fn dispatch(&self, req: ProxiedTsoRequest) -> CancelContext {
        let queue = self.inner.load_or_create_queue(&req.forwarded_host);
        let ctx = queue.ctx.clone();
        tokio::select! {
            res = queue.tx.send(req) => {
                if res.is_err() && !ctx.is_cancelled() {
                    ctx.cancel("tso proxy queue is gone");
                }
            }
            _ = ctx.done() => {}
        }
        ctx
    }
}

impl DispatcherInner {
    fn load_or_create_queue(self: &Arc<Self>, host: &str) -> TsoProxyQueue {
        let mut queues = self.queues.lock().unwrap();
        if let Some(queue) = queues.get(host) {
            if !queue.ctx.is_cancelled() {
                return queue.clone();
            }
        }
        info!("start new tso proxy dispatcher"; "forwarded-host" => host);
        let id = self.queue_id_alloc.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(MAX_MERGE_REQUESTS + 1);
        let ctx = CancelContext::new();
        let queue = TsoProxyQueue {
            id,
            tx,
            ctx: ctx.clone(),
        };
        queues.insert(host.to_owned(), queue.clone());

        let (deadline_tx, deadline_rx) = mpsc::channel(1);
        self.handle.spawn(util::log_panic(
            "tso-deadline-watcher",
            watch_ts_deadline(ctx.clone(), deadline_rx),
        ));
        let this = self.clone();
        let host = host.to_owned();
        self.handle.spawn(util::log_panic("tso-proxy-dispatch", async move {
            this.serve_queue(host, id, ctx, rx, deadline_tx).await;
        }));
        queue
    }

    async fn serve_queue(
        self: Arc<Self>,
        host: String,
        id: u64,
        ctx: CancelContext,
        rx: mpsc::Receiver<ProxiedTsoRequest>,
        deadline_tx: mpsc::Sender<TsDeadline>,
    ) {
        let stub = PdClient::new(self.pool.get(&host));
        match stub.tso() {
            Ok((sink, stream)) => {
                let params = QueueParams {
                    cluster_id: self.cluster_id,
                    batch_timeout: self.batch_timeout,
                    idle_timeout: self.idle_timeout,
                };
                run_queue(
                    &self.server_ctx,
                    &ctx,
                    &host,
                    rx,
                    sink,
                    stream.map(|r| r.map_err(Error::from)),
                    deadline_tx,
                    self.primary_watcher.clone(),
                    params,
                )
                .await;
            }
            Err(e) => {
                error!("create tso forwarding stream error";
                    "forwarded-host" => %host, "err" => ?e);
                ctx.cancel(format!("create tso forwarding stream error: {}", e));
            }
        }
        let mut queues = self.queues.lock().unwrap();
        if queues.get(&host).map_or(false, |q| q.id == id) {
            queues.remove(&host);
        }
    }
}

struct QueueParams {
    cluster_id: u64,
    batch_timeout: Duration,
    idle_timeout: Duration,
}

/// The single consumer of one proxy queue.
#[allow(clippy::too_many_arguments)]
async fn run_queue<Si, St>(
    server_ctx: &CancelContext,
    ctx: &CancelContext,
    host: &str,
    mut rx: mpsc::Receiver<ProxiedTsoRequest>,
    mut sink: Si,
    mut stream: St,
    deadline_tx: mpsc::Sender<TsDeadline>,
    primary_watcher: Option<Arc<dyn ServiceWatcher>>,
    params: QueueParams,
) where
    Si: Sink<(TsoRequest, WriteFlags)> + Unpin,
    Si::Error: Into<Error>,
    St: Stream<Item = Result<TsoResponse>> + Unpin,
{
    loop {
        let idle = util::delay(params.idle_timeout);
        tokio::select! {
            first = rx.recv() => {
                let first = match first {
                    Some(first) => first,
                    None => return,
                };
                let mut batch = vec![first];
                while batch.len() < MAX_MERGE_REQUESTS + 1 {
                    match rx.try_recv() {
                        Ok(req) => batch.push(req),
                        Err(_) => break,
                    }
                }
                let (done_tx, done_rx) = oneshot::channel();
                let deadline = TsDeadline {
                    timeout: params.batch_timeout,
                    done: done_rx,
                    cancel: ctx.clone(),
                };
                tokio::select! {
                    _ = deadline_tx.send(deadline) => {}
                    _ = ctx.done() => return,
                }
                let res = process_batch(ctx, &mut sink, &mut stream, &batch, params.cluster_id).await;
                drop(done_tx);
                if let Err(e) = res {
                    error!("proxy forward tso error"; "forwarded-host" => host, "err" => ?e);
                    if e.is_peer_not_leader() {
                        if let Some(watcher) = &primary_watcher {
                            watcher.force_load();
                        }
                    }
                    ctx.cancel(format!("{}", e));
                    return;
                }
            }
            _ = idle => {
                info!("close tso proxy as it is idle for a while"; "forwarded-host" => host);
                ctx.cancel("TSO proxy stream idle timeout");
                return;
            }
            _ = ctx.done() => return,
            cause = server_ctx.done() => {
                ctx.cancel(cause);
                return;
            }
        }
    }
}

/// Merges a batch onto the upstream stream, receives one response and
/// splits it across the batch in order.
async fn process_batch<Si, St>(
    ctx: &CancelContext,
    sink: &mut Si,
    stream: &mut St,
    batch: &[ProxiedTsoRequest],
    cluster_id: u64,
) -> Result<()>
where
    Si: Sink<(TsoRequest, WriteFlags)> + Unpin,
    Si::Error: Into<Error>,
    St: Stream<Item = Result<TsoResponse>> + Unpin,
{
    fail::fail_point!("tso_proxy_process_batch", |_| Err(box_err!(
        "injected tso proxy error"
    )));

    let count: u32 = batch.iter().map(|r| r.request.get_count()).sum();
    let mut merged = batch[0].request.clone();
    merged.mut_header().set_cluster_id(cluster_id);
    merged.set_count(count);

    let start = Instant::now();
    tokio::select! {
        res = sink.send((merged, WriteFlags::default().buffer_hint(false))) => {
            res.map_err(Into::into)?;
        }
        cause = ctx.done() => return Err(box_err!(cause)),
    }
    let resp = tokio::select! {
        next = stream.next() => match next {
            Some(resp) => resp?,
            None => return Err(Error::StreamClosed),
        },
        cause = ctx.done() => return Err(box_err!(cause)),
    };
    TSO_PROXY_HANDLE_DURATION_HISTOGRAM.observe(start.elapsed().as_secs_f64());
    TSO_PROXY_BATCH_SIZE_HISTOGRAM.observe(count as f64);

    if resp.get_count() != count {
        return Err(box_err!(
            "upstream gives unexpected number of timestamps, asked {} got {}",
            count,
            resp.get_count()
        ));
    }

    // The response carries the *largest* allocated logical. Walk the batch in
    // order, handing each request the tail of its contiguous sub-range.
    let ts = resp.get_timestamp();
    let (physical, logical, suffix_bits) =
        (ts.get_physical(), ts.get_logical(), ts.get_suffix_bits());
    let first_logical = add_logical(logical, -(count as i64), suffix_bits);
    let mut count_sum: i64 = 0;
    for req in batch {
        let sub_count = req.request.get_count();
        count_sum += sub_count as i64;
        let mut out = TsoResponse::default();
        out.mut_header().set_cluster_id(cluster_id);
        out.set_count(sub_count);
        let out_ts = out.mut_timestamp();
        out_ts.set_physical(physical);
        out_ts.set_logical(add_logical(first_logical, count_sum, suffix_bits));
        out_ts.set_suffix_bits(suffix_bits);
        req.downstream.send(out).await?;
    }
    Ok(())
}

/// Enforces the batch deadlines of one queue. One watcher per queue; every
/// in-flight batch posts a token here.
async fn watch_ts_deadline(ctx: CancelContext, mut rx: mpsc::Receiver<TsDeadline>) {
    loop {
        tokio::select! {
            deadline = rx.recv() => {
                let deadline = match deadline {
                    Some(d) => d,
                    None => return,
                };
                tokio::select! {
                    _ = util::delay(deadline.timeout) => {
                        warn!("tso proxy request processing is canceled due to timeout");
                        deadline.cancel.cancel("forward tso request timeout");
                    }
                    _ = deadline.done => {}
                    _ = ctx.done() => return,
                }
            }
            _ = ctx.done() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    use futures::channel::mpsc as fmpsc;
    use grpcio::{RpcStatus, RpcStatusCode};
    use kvproto::pdpb::Timestamp;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        got: StdMutex<Vec<TsoResponse>>,
    }

    impl TsoResponseSink for Recorder {
        fn send(&self, resp: TsoResponse) -> PdFuture<()> {
            self.got.lock().unwrap().push(resp);
            Box::pin(futures::future::ready(Ok(())))
        }
    }

    #[derive(Default)]
    struct CountingWatcher {
        force_loads: AtomicUsize,
    }

    impl ServiceWatcher for CountingWatcher {
        fn primary(&self) -> Option<String> {
            None
        }

        fn service_addrs(&self) -> Vec<String> {
            vec![]
        }

        fn force_load(&self) {
            self.force_loads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn proxied(count: u32, downstream: Arc<Recorder>) -> ProxiedTsoRequest {
        let mut request = TsoRequest::default();
        request.set_count(count);
        ProxiedTsoRequest {
            forwarded_host: "upstream".to_owned(),
            request,
            downstream,
        }
    }

    fn ts(physical: i64, logical: i64, suffix_bits: u32) -> Timestamp {
        let mut ts = Timestamp::default();
        ts.set_physical(physical);
        ts.set_logical(logical);
        ts.set_suffix_bits(suffix_bits);
        ts
    }

    fn upstream_resp(count: u32, t: Timestamp) -> TsoResponse {
        let mut resp = TsoResponse::default();
        resp.set_count(count);
        resp.set_timestamp(t);
        resp
    }

    #[tokio::test]
    async fn test_batch_merge_and_split() {
        let (up_tx, mut up_rx) = fmpsc::channel::<(TsoRequest, WriteFlags)>(4);
        let (mut resp_tx, resp_rx) = fmpsc::channel::<Result<TsoResponse>>(4);
        let ctx = CancelContext::new();

        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let batch = vec![proxied(3, a.clone()), proxied(5, b.clone())];

        resp_tx
            .send(Ok(upstream_resp(8, ts(100, 80, 0))))
            .await
            .unwrap();
        let mut sink = up_tx.clone();
        let mut stream = resp_rx;
        process_batch(&ctx, &mut sink, &mut stream, &batch, 7)
            .await
            .unwrap();

        // One merged request went upstream.
        let (merged, _) = up_rx.next().await.unwrap();
        assert_eq!(merged.get_count(), 8);
        assert_eq!(merged.get_header().get_cluster_id(), 7);

        // Sub-ranges partition 73..=80 contiguously in batch order.
        let got_a = a.got.lock().unwrap().clone();
        let got_b = b.got.lock().unwrap().clone();
        assert_eq!(got_a.len(), 1);
        assert_eq!(got_b.len(), 1);
        assert_eq!(got_a[0].get_count(), 3);
        assert_eq!(got_a[0].get_timestamp().get_logical(), 75);
        assert_eq!(got_a[0].get_timestamp().get_physical(), 100);
        assert_eq!(got_b[0].get_count(), 5);
        assert_eq!(got_b[0].get_timestamp().get_logical(), 80);
        assert_eq!(got_a[0].get_header().get_cluster_id(), 7);
        drop(up_tx);
        drop(resp_tx);
    }

    #[tokio::test]
    async fn test_batch_split_respects_suffix_bits() {
        let (up_tx, _up_rx) = fmpsc::channel::<(TsoRequest, WriteFlags)>(4);
        let (mut resp_tx, resp_rx) = fmpsc::channel::<Result<TsoResponse>>(4);
        let ctx = CancelContext::new();

        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        let batch = vec![proxied(1, a.clone()), proxied(1, b.clone())];

        resp_tx
            .send(Ok(upstream_resp(2, ts(50, 1 << 3, 2))))
            .await
            .unwrap();
        let mut sink = up_tx;
        let mut stream = resp_rx;
        process_batch(&ctx, &mut sink, &mut stream, &batch, 7)
            .await
            .unwrap();

        // first_logical = 8 - (2 << 2) = 0; shares are 4 and 8.
        assert_eq!(a.got.lock().unwrap()[0].get_timestamp().get_logical(), 4);
        assert_eq!(b.got.lock().unwrap()[0].get_timestamp().get_logical(), 8);
    }

    #[tokio::test]
    async fn test_count_mismatch_is_an_error() {
        let (up_tx, _up_rx) = fmpsc::channel::<(TsoRequest, WriteFlags)>(4);
        let (mut resp_tx, resp_rx) = fmpsc::channel::<Result<TsoResponse>>(4);
        let ctx = CancelContext::new();
        let a = Arc::new(Recorder::default());
        let batch = vec![proxied(4, a.clone())];
        resp_tx
            .send(Ok(upstream_resp(3, ts(10, 10, 0))))
            .await
            .unwrap();
        let mut sink = up_tx;
        let mut stream = resp_rx;
        process_batch(&ctx, &mut sink, &mut stream, &batch, 7)
            .await
            .unwrap_err();
        assert!(a.got.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_idle_timeout() {
        let server_ctx = CancelContext::new();
        let ctx = CancelContext::new();
        let (_tx, rx) = mpsc::channel::<ProxiedTsoRequest>(4);
        let (up_tx, _up_rx) = fmpsc::channel::<(TsoRequest, WriteFlags)>(4);
        let (_resp_tx, resp_rx) = fmpsc::channel::<Result<TsoResponse>>(4);
        let (deadline_tx, _deadline_rx) = mpsc::channel(1);
        run_queue(
            &server_ctx,
            &ctx,
            "upstream",
            rx,
            up_tx,
            resp_rx,
            deadline_tx,
            None,
            QueueParams {
                cluster_id: 7,
                batch_timeout: Duration::from_millis(100),
                idle_timeout: Duration::from_millis(30),
            },
        )
        .await;
        assert!(ctx.is_cancelled());
        assert!(ctx.cause().unwrap().contains("idle"));
    }

    #[tokio::test]
    async fn test_upstream_not_leader_forces_reload_and_cancels_with_cause() {
        let server_ctx = CancelContext::new();
        let ctx = CancelContext::new();
        let (tx, rx) = mpsc::channel::<ProxiedTsoRequest>(4);
        let (up_tx, mut up_rx) = fmpsc::channel::<(TsoRequest, WriteFlags)>(4);
        let (mut resp_tx, resp_rx) = fmpsc::channel::<Result<TsoResponse>>(4);
        let (deadline_tx, mut deadline_rx) = mpsc::channel(1);
        let watcher = Arc::new(CountingWatcher::default());

        let a = Arc::new(Recorder::default());
        tx.send(proxied(2, a.clone())).await.unwrap();
        resp_tx
            .send(Err(Error::Grpc(grpcio::Error::RpcFailure(
                RpcStatus::with_message(RpcStatusCode::UNAVAILABLE, "not leader".to_owned()),
            ))))
            .await
            .unwrap();

        let watcher_dyn: Arc<dyn ServiceWatcher> = watcher.clone();
        run_queue(
            &server_ctx,
            &ctx,
            "upstream",
            rx,
            up_tx,
            resp_rx,
            deadline_tx,
            Some(watcher_dyn),
            QueueParams {
                cluster_id: 7,
                batch_timeout: Duration::from_secs(1),
                idle_timeout: Duration::from_secs(60),
            },
        )
        .await;

        assert_eq!(watcher.force_loads.load(Ordering::SeqCst), 1);
        assert!(ctx.is_cancelled());
        assert!(ctx.cause().unwrap().contains("not leader"));
        // The merged request still went out before the failure.
        assert!(up_rx.next().await.is_some());
        // A deadline token was posted for the in-flight batch.
        assert!(deadline_rx.recv().await.is_some());
        assert!(a.got.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deadline_watcher_cancels_on_timeout() {
        let ctx = CancelContext::new();
        let queue_ctx = CancelContext::new();
        let (deadline_tx, deadline_rx) = mpsc::channel(1);
        let watcher = tokio::spawn(watch_ts_deadline(ctx.clone(), deadline_rx));

        let (_done_tx, done_rx) = oneshot::channel::<()>();
        deadline_tx
            .send(TsDeadline {
                timeout: Duration::from_millis(20),
                done: done_rx,
                cancel: queue_ctx.clone(),
            })
            .await
            .unwrap();
        assert_eq!(queue_ctx.done().await, "forward tso request timeout");
        ctx.cancel("shutdown");
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_watcher_returns_timer_on_done() {
        let ctx = CancelContext::new();
        let queue_ctx = CancelContext::new();
        let (deadline_tx, deadline_rx) = mpsc::channel(1);
        let watcher = tokio::spawn(watch_ts_deadline(ctx.clone(), deadline_rx));

        let (done_tx, done_rx) = oneshot::channel::<()>();
        deadline_tx
            .send(TsDeadline {
                timeout: Duration::from_millis(50),
                done: done_rx,
                cancel: queue_ctx.clone(),
            })
            .await
            .unwrap();
        drop(done_tx);
        util::delay(Duration::from_millis(100)).await;
        assert!(!queue_ctx.is_cancelled());
        ctx.cancel("shutdown");
        watcher.await.unwrap();
    }
}
