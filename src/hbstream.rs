// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The registry of region heartbeat streams. Each store's most recent
//! heartbeat stream is bound here so operator commands can be pushed back to
//! the store, and a keepalive sweep evicts broken bindings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::Sink;
use grpcio::WriteFlags;
use kvproto::metapb;
use kvproto::pdpb::{self, RegionHeartbeatResponse};
use tokio::sync::mpsc;

use crate::cluster::RaftCluster;
use crate::errors::error_header;
use crate::guard::{with_flags, GuardedSender};
use crate::metrics::HEARTBEAT_STREAM_COUNTER_VEC;
use crate::util::{self, CancelContext};
use crate::{Error, PdFuture};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const MSG_CHAN_CAPACITY: usize = 1024;

/// One bound downstream heartbeat stream.
pub trait HeartbeatStream: Send + Sync {
    fn send(&self, resp: RegionHeartbeatResponse) -> PdFuture<()>;
}

impl<Si> HeartbeatStream for GuardedSender<Si>
where
    Si: Sink<(RegionHeartbeatResponse, WriteFlags)> + Unpin + Send + 'static,
    Si::Error: Into<Error> + Send,
{
    fn send(&self, resp: RegionHeartbeatResponse) -> PdFuture<()> {
        let sender = self.clone();
        Box::pin(async move { sender.send(with_flags(resp)).await })
    }
}

struct StreamUpdate {
    store_id: u64,
    stream: Arc<dyn HeartbeatStream>,
}

pub struct HeartbeatStreams {
    ctx: CancelContext,
    cluster_id: u64,
    msg_tx: mpsc::Sender<RegionHeartbeatResponse>,
    stream_tx: mpsc::Sender<StreamUpdate>,
}

impl HeartbeatStreams {
    /// Builds the registry and its background runner. The caller spawns the
    /// runner on the server runtime and cancels `ctx` on shutdown.
    pub fn new(
        ctx: CancelContext,
        cluster_id: u64,
        cluster: Arc<dyn RaftCluster>,
    ) -> (HeartbeatStreams, impl std::future::Future<Output = ()> + Send) {
        let (msg_tx, msg_rx) = mpsc::channel(MSG_CHAN_CAPACITY);
        let (stream_tx, stream_rx) = mpsc::channel(1);
        let streams = HeartbeatStreams {
            ctx: ctx.clone(),
            cluster_id,
            msg_tx,
            stream_tx,
        };
        let runner = run(ctx, cluster_id, cluster, msg_rx, stream_rx);
        (streams, runner)
    }

    /// Binds `stream` as the push target for `store_id`, replacing any
    /// previous binding.
    pub async fn bind_stream(&self, store_id: u64, stream: Arc<dyn HeartbeatStream>) {
        let update = StreamUpdate { store_id, stream };
        tokio::select! {
            _ = self.stream_tx.send(update) => {}
            _ = self.ctx.done() => {}
        }
    }

    /// Queues an operator command for the store owning `target_peer`.
    pub async fn send_msg(&self, mut resp: RegionHeartbeatResponse) {
        let mut header = pdpb::ResponseHeader::default();
        header.set_cluster_id(self.cluster_id);
        resp.set_header(header);
        tokio::select! {
            _ = self.msg_tx.send(resp) => {}
            _ = self.ctx.done() => {}
        }
    }

    /// Queues a typed error heartbeat for `target_peer`'s store.
    pub async fn send_err(
        &self,
        err_type: pdpb::ErrorType,
        message: String,
        target_peer: metapb::Peer,
    ) {
        let mut resp = RegionHeartbeatResponse::default();
        resp.set_header(error_header(self.cluster_id, err_type, message));
        resp.set_target_peer(target_peer);
        tokio::select! {
            _ = self.msg_tx.send(resp) => {}
            _ = self.ctx.done() => {}
        }
    }
}

async fn run(
    ctx: CancelContext,
    cluster_id: u64,
    cluster: Arc<dyn RaftCluster>,
    mut msg_rx: mpsc::Receiver<RegionHeartbeatResponse>,
    mut stream_rx: mpsc::Receiver<StreamUpdate>,
) {
    let mut streams: HashMap<u64, Arc<dyn HeartbeatStream>> = HashMap::new();
    let mut keepalive = Box::pin(util::delay(KEEPALIVE_INTERVAL));
    loop {
        tokio::select! {
            update = stream_rx.recv() => {
                if let Some(update) = update {
                    streams.insert(update.store_id, update.stream);
                }
            }
            msg = msg_rx.recv() => {
                let msg = match msg {
                    Some(msg) => msg,
                    None => return,
                };
                let store_id = msg.get_target_peer().get_store_id();
                let store_label = store_id.to_string();
                if cluster.get_store(store_id).is_none() {
                    warn!("failed to get store";
                        "region-id" => msg.get_region_id(), "store-id" => store_id);
                    streams.remove(&store_id);
                    continue;
                }
                let region_id = msg.get_region_id();
                match streams.get(&store_id) {
                    Some(stream) => {
                        if let Err(e) = stream.send(msg).await {
                            warn!("send heartbeat message fail";
                                "region-id" => region_id, "err" => ?e);
                            streams.remove(&store_id);
                            HEARTBEAT_STREAM_COUNTER_VEC
                                .with_label_values(&[&store_label, "push", "err"]).inc();
                        } else {
                            HEARTBEAT_STREAM_COUNTER_VEC
                                .with_label_values(&[&store_label, "push", "ok"]).inc();
                        }
                    }
                    None => {
                        debug!("heartbeat stream not found, skip send message";
                            "region-id" => region_id, "store-id" => store_id);
                        HEARTBEAT_STREAM_COUNTER_VEC
                            .with_label_values(&[&store_label, "push", "skip"]).inc();
                    }
                }
            }
            _ = &mut keepalive => {
                keepalive = Box::pin(util::delay(KEEPALIVE_INTERVAL));
                let mut keepalive_msg = RegionHeartbeatResponse::default();
                let mut header = pdpb::ResponseHeader::default();
                header.set_cluster_id(cluster_id);
                keepalive_msg.set_header(header);
                let mut broken = vec![];
                for (store_id, stream) in &streams {
                    let store_label = store_id.to_string();
                    if cluster.get_store(*store_id).is_none() {
                        warn!("failed to get store"; "store-id" => *store_id);
                        broken.push(*store_id);
                        continue;
                    }
                    if let Err(e) = stream.send(keepalive_msg.clone()).await {
                        warn!("send keepalive message fail, store maybe disconnected";
                            "target-store-id" => *store_id, "err" => ?e);
                        broken.push(*store_id);
                        HEARTBEAT_STREAM_COUNTER_VEC
                            .with_label_values(&[&store_label, "keepalive", "err"]).inc();
                    } else {
                        HEARTBEAT_STREAM_COUNTER_VEC
                            .with_label_values(&[&store_label, "keepalive", "ok"]).inc();
                    }
                }
                for store_id in broken {
                    streams.remove(&store_id);
                }
            }
            _ = ctx.done() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use crate::testing::MockCluster;

    use super::*;

    struct RecordingStream {
        sent: Arc<Mutex<Vec<RegionHeartbeatResponse>>>,
        fail: bool,
    }

    impl HeartbeatStream for RecordingStream {
        fn send(&self, resp: RegionHeartbeatResponse) -> PdFuture<()> {
            let sent = self.sent.clone();
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    return Err(Error::StreamClosed);
                }
                sent.lock().unwrap().push(resp);
                Ok(())
            })
        }
    }

    fn peer(store_id: u64) -> metapb::Peer {
        let mut p = metapb::Peer::default();
        p.set_store_id(store_id);
        p
    }

    #[tokio::test]
    async fn test_push_to_bound_stream() {
        let cluster = Arc::new(MockCluster::default());
        cluster.add_store(1);
        let ctx = CancelContext::new();
        let (hbs, runner) = HeartbeatStreams::new(ctx.clone(), 7, cluster);
        let handle = tokio::spawn(runner);

        let sent = Arc::new(Mutex::new(vec![]));
        hbs.bind_stream(1, Arc::new(RecordingStream { sent: sent.clone(), fail: false }))
            .await;

        let mut msg = RegionHeartbeatResponse::default();
        msg.set_region_id(42);
        msg.set_target_peer(peer(1));
        hbs.send_msg(msg).await;

        // Wait until the runner drains the message.
        for _ in 0..50 {
            if !sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].get_region_id(), 42);
        assert_eq!(sent[0].get_header().get_cluster_id(), 7);

        ctx.cancel("shutdown");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_send_reaches_store() {
        let cluster = Arc::new(MockCluster::default());
        cluster.add_store(3);
        let ctx = CancelContext::new();
        let (hbs, runner) = HeartbeatStreams::new(ctx.clone(), 7, cluster);
        let handle = tokio::spawn(runner);

        let sent = Arc::new(Mutex::new(vec![]));
        hbs.bind_stream(3, Arc::new(RecordingStream { sent: sent.clone(), fail: false }))
            .await;
        hbs.send_err(
            pdpb::ErrorType::Unknown,
            "invalid request leader".to_owned(),
            peer(3),
        )
        .await;

        for _ in 0..50 {
            if !sent.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let sent = sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].get_header().has_error());

        ctx.cancel("shutdown");
        handle.await.unwrap();
    }
}
