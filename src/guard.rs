// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! Guards around bidirectional server streams. A guard pair shares one
//! write-once `closed` flag: any send/recv error or timeout on either half
//! closes both, so the RPC task can unwind and release the stream instead of
//! hanging on the other direction. Both halves are generic over
//! `futures::Sink`/`futures::Stream`, the tests drive them with channels.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use grpcio::{ClientStreamingSink, DuplexSink, RpcStatus, WriteFlags};

use crate::util;
use crate::{Error, Result};

/// Which RPC family the guard protects; decides the timeout errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuardKind {
    Tso,
    Heartbeat,
}

impl GuardKind {
    fn send_timeout_err(&self) -> Error {
        match self {
            GuardKind::Tso => Error::ForwardTsoTimeout,
            GuardKind::Heartbeat => Error::SendHeartbeatTimeout,
        }
    }

    fn recv_timeout_err(&self) -> Error {
        match self {
            GuardKind::Tso => Error::TsoProxyRecvTimeout,
            GuardKind::Heartbeat => Error::SendHeartbeatTimeout,
        }
    }
}

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds a guard pair over the two halves of a bidirectional stream.
/// `recv_timeout` is `None` for streams whose receive side may stay quiet
/// indefinitely (heartbeats).
pub fn guard<Si, St>(
    kind: GuardKind,
    sink: Si,
    stream: St,
    send_timeout: Duration,
    recv_timeout: Option<Duration>,
) -> (GuardedSender<Si>, GuardedReceiver<St>) {
    let closed = Arc::new(AtomicBool::new(false));
    (
        GuardedSender {
            kind,
            sink: Arc::new(tokio::sync::Mutex::new(Some(sink))),
            closed: closed.clone(),
            timeout: send_timeout,
        },
        GuardedReceiver {
            kind,
            stream,
            closed,
            timeout: recv_timeout,
        },
    )
}

pub struct GuardedSender<Si> {
    kind: GuardKind,
    sink: Arc<tokio::sync::Mutex<Option<Si>>>,
    closed: Arc<AtomicBool>,
    timeout: Duration,
}

impl<Si> Clone for GuardedSender<Si> {
    fn clone(&self) -> Self {
        GuardedSender {
            kind: self.kind,
            sink: self.sink.clone(),
            closed: self.closed.clone(),
            timeout: self.timeout,
        }
    }
}

impl<Si> GuardedSender<Si> {
    /// Sends one message within the guard timeout. After the first failure
    /// every call short-circuits with `StreamClosed`.
    pub async fn send<M>(&self, msg: M) -> Result<()>
    where
        Si: Sink<M> + Unpin,
        Si::Error: Into<Error>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StreamClosed);
        }
        let mut slot = self.sink.lock().await;
        let sink = match slot.as_mut() {
            Some(sink) => sink,
            None => return Err(Error::StreamClosed),
        };
        match util::timeout(self.timeout, sink.send(msg)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.closed.store(true, Ordering::Release);
                Err(e.into())
            }
            Err(util::TimeoutError) => {
                self.closed.store(true, Ordering::Release);
                Err(self.kind.send_timeout_err())
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static> GuardedSender<DuplexSink<T>> {
    /// Ends the RPC with `status`, consuming the underlying sink.
    pub async fn fail(&self, status: RpcStatus) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let sink = self.sink.lock().await.take();
        match sink {
            Some(sink) => sink.fail(status).await.map_err(Error::from),
            None => Err(Error::StreamClosed),
        }
    }

    /// Flushes and closes the RPC cleanly.
    pub async fn finish(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let sink = self.sink.lock().await.take();
        match sink {
            Some(mut sink) => sink.close().await.map_err(Error::from),
            None => Ok(()),
        }
    }
}

pub struct GuardedReceiver<St> {
    kind: GuardKind,
    stream: St,
    closed: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl<St> GuardedReceiver<St> {
    /// Builds a receiver sharing an existing `closed` flag, for streams whose
    /// send half is not a duplex sink.
    pub fn new(
        kind: GuardKind,
        stream: St,
        closed: Arc<AtomicBool>,
        timeout: Option<Duration>,
    ) -> GuardedReceiver<St> {
        GuardedReceiver {
            kind,
            stream,
            closed,
            timeout,
        }
    }

    /// Receives the next message. `Ok(None)` is a clean end of stream; once
    /// the guard is closed every call reports it immediately.
    pub async fn recv<R, E>(&mut self) -> Result<Option<R>>
    where
        St: Stream<Item = std::result::Result<R, E>> + Unpin,
        E: Into<Error>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Ok(None);
        }
        let next = match self.timeout {
            Some(dur) => match util::timeout(dur, self.stream.next()).await {
                Ok(next) => next,
                Err(util::TimeoutError) => {
                    self.closed.store(true, Ordering::Release);
                    return Err(self.kind.recv_timeout_err());
                }
            },
            None => self.stream.next().await,
        };
        match next {
            Some(Ok(req)) => Ok(Some(req)),
            Some(Err(e)) => {
                self.closed.store(true, Ordering::Release);
                Err(e.into())
            }
            None => {
                self.closed.store(true, Ordering::Release);
                Ok(None)
            }
        }
    }
}

/// Guard around a client-streaming response sink, whose send is terminal
/// (send-and-close). Shares its `closed` flag with the paired receiver.
pub struct GuardedClientStreamSink<T> {
    sink: Option<ClientStreamingSink<T>>,
    closed: Arc<AtomicBool>,
    timeout: Duration,
}

impl<T: Send + 'static> GuardedClientStreamSink<T> {
    pub fn new(
        sink: ClientStreamingSink<T>,
        closed: Arc<AtomicBool>,
        timeout: Duration,
    ) -> GuardedClientStreamSink<T> {
        GuardedClientStreamSink {
            sink: Some(sink),
            closed,
            timeout,
        }
    }

    pub async fn fail(&mut self, status: RpcStatus) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        match self.sink.take() {
            Some(sink) => sink.fail(status).await.map_err(Error::from),
            None => Err(Error::StreamClosed),
        }
    }

    pub async fn send_and_close(&mut self, resp: T) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StreamClosed);
        }
        let sink = match self.sink.take() {
            Some(sink) => sink,
            None => return Err(Error::StreamClosed),
        };
        match util::timeout(self.timeout, sink.success(resp)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.closed.store(true, Ordering::Release);
                Err(Error::Grpc(e))
            }
            Err(util::TimeoutError) => {
                self.closed.store(true, Ordering::Release);
                Err(Error::SendHeartbeatTimeout)
            }
        }
    }
}

/// Wraps a message with the write flags grpcio sinks expect.
pub fn with_flags<T>(msg: T) -> (T, WriteFlags) {
    (msg, WriteFlags::default())
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;
    use futures::executor::block_on;

    use super::*;

    type Pair = (
        GuardedSender<mpsc::Sender<u64>>,
        GuardedReceiver<mpsc::Receiver<std::result::Result<u64, Error>>>,
    );

    fn pair(
        recv_timeout: Option<Duration>,
    ) -> (Pair, mpsc::Receiver<u64>, mpsc::Sender<std::result::Result<u64, Error>>) {
        let (out_tx, out_rx) = mpsc::channel::<u64>(4);
        let (in_tx, in_rx) = mpsc::channel::<std::result::Result<u64, Error>>(4);
        let guards = guard(
            GuardKind::Tso,
            out_tx,
            in_rx,
            Duration::from_millis(50),
            recv_timeout,
        );
        (guards, out_rx, in_tx)
    }

    #[test]
    fn test_clean_stream() {
        block_on(async {
            let ((tx, mut rx), mut out_rx, mut in_tx) = pair(None);
            in_tx.send(Ok(7)).await.unwrap();
            assert_eq!(rx.recv().await.unwrap(), Some(7));
            tx.send(8).await.unwrap();
            assert_eq!(out_rx.next().await, Some(8));
            // Closing the inbound stream is a clean EOF.
            drop(in_tx);
            assert_eq!(rx.recv().await.unwrap(), None);
            // EOF closed the guard, the sender observes it.
            assert!(matches!(tx.send(9).await, Err(Error::StreamClosed)));
        });
    }

    #[test]
    fn test_recv_error_closes_both_ends() {
        block_on(async {
            let ((tx, mut rx), _out_rx, mut in_tx) = pair(None);
            in_tx.send(Err(Error::StreamClosed)).await.unwrap();
            rx.recv().await.unwrap_err();
            assert!(tx.is_closed());
            assert!(matches!(tx.send(1).await, Err(Error::StreamClosed)));
            // Closed flag is monotonic: recv now reports EOF without touching
            // the underlying stream.
            in_tx.send(Ok(2)).await.unwrap();
            assert_eq!(rx.recv().await.unwrap(), None);
        });
    }

    #[test]
    fn test_recv_timeout() {
        block_on(async {
            let ((tx, mut rx), _out_rx, _in_tx) = pair(Some(Duration::from_millis(20)));
            match rx.recv().await {
                Err(Error::TsoProxyRecvTimeout) => {}
                other => panic!("unexpected {:?}", other),
            }
            assert!(tx.is_closed());
            assert_eq!(rx.recv().await.unwrap(), None);
        });
    }

    #[test]
    fn test_send_timeout() {
        block_on(async {
            let (out_tx, _out_rx) = mpsc::channel::<u64>(0);
            let (_in_tx, in_rx) = mpsc::channel::<std::result::Result<u64, Error>>(0);
            let (tx, _rx) = guard(
                GuardKind::Heartbeat,
                out_tx,
                in_rx,
                Duration::from_millis(20),
                None,
            );
            // A zero-capacity channel admits one buffered message per sender,
            // the next send blocks until the guard timer fires.
            tx.send(1).await.unwrap();
            match tx.send(2).await {
                Err(Error::SendHeartbeatTimeout) => {}
                other => panic!("unexpected {:?}", other),
            }
            assert!(matches!(tx.send(3).await, Err(Error::StreamClosed)));
        });
    }
}
