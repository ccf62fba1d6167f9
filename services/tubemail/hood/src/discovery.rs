//! Discovery plugins.
//!
//! A plugin is started once the hood listens. It receives a
//! [`DiscoveryContext`] describing the hood and a [`DiscoverySink`] to report
//! peers through, and hands back a [`StopHandle`] the hood awaits when it
//! leaves. Closures with the right signature are plugins too.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use tubemail_wire::PeerId;

use crate::hood::HoodInput;

/// What a plugin knows about the hood it serves
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    /// Port the hood listens on
    pub port: u16,
    /// Mesh fingerprint, identical for every member of the mesh
    pub fingerprint: String,
    /// Identity of the hood
    pub id: PeerId,
}

/// Reporting channel handed to plugins
#[derive(Clone)]
pub struct DiscoverySink {
    inputs: mpsc::UnboundedSender<HoodInput>,
}

impl DiscoverySink {
    pub(crate) fn new(inputs: mpsc::UnboundedSender<HoodInput>) -> Self {
        Self { inputs }
    }

    /// Report a peer listening on `host:port`. `host` may be an IP literal or
    /// a name to resolve. Returns false once the hood is gone.
    pub fn found(&self, host: impl Into<String>, port: u16) -> bool {
        let host = host.into();
        trace!("Discovered {}:{}", host, port);
        self.inputs
            .send(HoodInput::Discovered { host, port })
            .is_ok()
    }

    /// Report a failure of the plugin to the hood's observers
    pub fn error(&self, error: impl fmt::Display) -> bool {
        self.inputs
            .send(HoodInput::DiscoveryFailed(error.to_string()))
            .is_ok()
    }

    /// Whether the hood stopped listening to this sink
    pub fn is_closed(&self) -> bool {
        self.inputs.is_closed()
    }
}

impl fmt::Debug for DiscoverySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoverySink")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Stops a running plugin
pub struct StopHandle {
    stop: Option<Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>>,
}

impl StopHandle {
    /// Run `stop` and await the future it returns when the hood leaves
    pub fn new<F, Fut>(stop: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            stop: Some(Box::new(move || stop().boxed())),
        }
    }

    /// Abort `task` when the hood leaves
    pub fn from_task(task: JoinHandle<()>) -> Self {
        Self::new(move || async move {
            task.abort();
            let _ = task.await;
        })
    }

    /// Nothing to stop
    pub fn noop() -> Self {
        Self { stop: None }
    }

    /// Stop the plugin and wait until it is done
    pub async fn stop(self) {
        if let Some(stop) = self.stop {
            stop().await;
        }
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("noop", &self.stop.is_none())
            .finish()
    }
}

/// A source of peers to dial
pub trait Discovery: Send + 'static {
    /// Start reporting peers into `sink`
    fn start(self: Box<Self>, ctx: DiscoveryContext, sink: DiscoverySink) -> StopHandle;
}

impl<F> Discovery for F
where
    F: FnOnce(DiscoveryContext, DiscoverySink) -> StopHandle + Send + 'static,
{
    fn start(self: Box<Self>, ctx: DiscoveryContext, sink: DiscoverySink) -> StopHandle {
        (*self)(ctx, sink)
    }
}

/// A peer at a fixed address, announced right away and then every
/// `interval`. A zero interval announces once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticPeer {
    /// IP literal or host name
    pub host: String,
    /// Listen port of the peer
    pub port: u16,
    /// Re-announcement period
    pub interval: Duration,
}

impl StaticPeer {
    /// Peer announced once
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            interval: Duration::ZERO,
        }
    }

    /// Re-announce every `interval`
    pub fn every(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Discovery for StaticPeer {
    fn start(self: Box<Self>, _ctx: DiscoveryContext, sink: DiscoverySink) -> StopHandle {
        let peer = *self;
        debug!("Static discovery of {}:{}", peer.host, peer.port);
        let task = tokio::spawn(async move {
            loop {
                if !sink.found(peer.host.clone(), peer.port) || peer.interval.is_zero() {
                    break;
                }
                tokio::time::sleep(peer.interval).await;
            }
        });
        StopHandle::from_task(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn context() -> DiscoveryContext {
        DiscoveryContext {
            port: 4816,
            fingerprint: "ab".repeat(32),
            id: PeerId::from_bytes([7; tubemail_wire::ID_SIZE]),
        }
    }

    fn sink() -> (DiscoverySink, mpsc::UnboundedReceiver<HoodInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (DiscoverySink::new(tx), rx)
    }

    fn discovered(input: HoodInput) -> (String, u16) {
        match input {
            HoodInput::Discovered { host, port } => (host, port),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_peer_repeats_until_stopped() {
        let (sink, mut rx) = sink();
        let plugin: Box<dyn Discovery> =
            Box::new(StaticPeer::new("10.0.0.2", 4817).every(Duration::from_secs(5)));
        let stop = plugin.start(context(), sink);

        assert_eq!(discovered(rx.recv().await.unwrap()), ("10.0.0.2".to_string(), 4817));
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        stop.stop().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_static_peer_once() {
        let (sink, mut rx) = sink();
        let stop = Box::new(StaticPeer::new("peer.local", 1)).start(context(), sink);
        assert_eq!(discovered(rx.recv().await.unwrap()), ("peer.local".to_string(), 1));
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        stop.stop().await;
    }

    #[tokio::test]
    async fn test_closure_plugin() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let plugin = move |ctx: DiscoveryContext, sink: DiscoverySink| {
            sink.found("127.0.0.1", ctx.port + 1);
            StopHandle::new(move || async move { flag.store(true, Ordering::SeqCst) })
        };

        let (sink, mut rx) = sink();
        let stop = Box::new(plugin).start(context(), sink);
        assert_eq!(discovered(rx.recv().await.unwrap()), ("127.0.0.1".to_string(), 4817));
        assert!(!stopped.load(Ordering::SeqCst));
        stop.stop().await;
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_sink_reports_closed_hood() {
        let (sink, rx) = sink();
        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.found("10.0.0.1", 1));
        assert!(!sink.error("mdns socket failed"));
        StopHandle::noop().stop().await;
    }
}
