//! The forwarding engine for one endpoint pair.
//!
//! A [`Forwarder`] runs one pump task per legal direction. A pump reads
//! frames from its source, passes each through the pair's module chain and
//! writes what survives to the other side. When its source ends (or a write
//! fails) the pump closes both endpoints, which releases the opposite pump's
//! pending read. Once the last pump exits the chain is closed and the
//! completion callback runs, exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use interpose_endpoint::Endpoint;
use interpose_module::{Direction, ModuleChain};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, trace};

/// Traffic counters for one direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub frames: u64,
    pub bytes: u64,
    pub dropped: u64,
}

/// What a finished pair reports to its owner.
#[derive(Debug, Clone, Copy)]
pub struct PairSummary {
    pub id: u64,
    pub a_to_b: DirectionStats,
    pub b_to_a: DirectionStats,
    pub duration: Duration,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    bytes: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DirectionStats {
        DirectionStats {
            frames: self.frames.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

type OnComplete = Box<dyn FnOnce(PairSummary) + Send>;

struct Shared {
    id: u64,
    a: Endpoint,
    b: Endpoint,
    chain: Mutex<ModuleChain>,
    remaining: AtomicUsize,
    on_complete: Mutex<Option<OnComplete>>,
    done: CancellationToken,
    started: Instant,
    a_to_b: Counters,
    b_to_a: Counters,
}

impl Shared {
    fn ends(&self, direction: Direction) -> (&Endpoint, &Endpoint, &Counters) {
        match direction {
            Direction::AToB => (&self.a, &self.b, &self.a_to_b),
            Direction::BToA => (&self.b, &self.a, &self.b_to_a),
        }
    }

    fn summary(&self) -> PairSummary {
        PairSummary {
            id: self.id,
            a_to_b: self.a_to_b.snapshot(),
            b_to_a: self.b_to_a.snapshot(),
            duration: self.started.elapsed(),
        }
    }

    fn finish(&self) {
        self.chain.lock().close();
        let summary = self.summary();
        interpose_metrics::record_pair_finished(summary.duration.as_secs_f64());
        debug!(
            pair = self.id,
            a_to_b = summary.a_to_b.bytes,
            b_to_a = summary.b_to_a.bytes,
            "forwarder finished"
        );
        let callback = self.on_complete.lock().take();
        if let Some(callback) = callback {
            callback(summary);
        }
        self.done.cancel();
    }
}

/// Handle to a running pair. Cheap to clone.
#[derive(Clone)]
pub struct Forwarder {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("id", &self.shared.id)
            .field("a", &self.shared.a.name())
            .field("b", &self.shared.b.name())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Forwarder {
    /// Start pumping between `a` and `b`. Both must already be initialized.
    ///
    /// A→B runs if `a` is readable and `b` writable, B→A symmetrically. A
    /// pair with no legal direction is closed and completes at once.
    pub fn start<F>(id: u64, a: Endpoint, b: Endpoint, chain: ModuleChain, on_complete: F) -> Self
    where
        F: FnOnce(PairSummary) + Send + 'static,
    {
        let a_to_b = a.capabilities().readable && b.capabilities().writable;
        let b_to_a = b.capabilities().readable && a.capabilities().writable;
        let pumps = usize::from(a_to_b) + usize::from(b_to_a);

        a.activate();
        b.activate();
        debug!(pair = id, a = %a.name(), b = %b.name(), a_to_b, b_to_a, "forwarder started");

        let shared = Arc::new(Shared {
            id,
            a,
            b,
            chain: Mutex::new(chain),
            remaining: AtomicUsize::new(pumps),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
            done: CancellationToken::new(),
            started: Instant::now(),
            a_to_b: Counters::default(),
            b_to_a: Counters::default(),
        });
        interpose_metrics::record_pair_started();

        if pumps == 0 {
            let shared = shared.clone();
            tokio::spawn(
                async move {
                    shared.a.close().await;
                    shared.b.close().await;
                    shared.finish();
                }
                .in_current_span(),
            );
        }
        for (legal, direction) in [(a_to_b, Direction::AToB), (b_to_a, Direction::BToA)] {
            if legal {
                tokio::spawn(pump(shared.clone(), direction).in_current_span());
            }
        }

        Self { shared }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn a(&self) -> &Endpoint {
        &self.shared.a
    }

    pub fn b(&self) -> &Endpoint {
        &self.shared.b
    }

    pub fn summary(&self) -> PairSummary {
        self.shared.summary()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.done.is_cancelled()
    }

    /// Wait until every pump has exited and the callback has run.
    pub async fn finished(&self) {
        self.shared.done.cancelled().await;
    }

    /// Close both endpoints and wait for the pumps to exit.
    pub async fn close(&self) {
        self.shared.a.close().await;
        self.shared.b.close().await;
        self.finished().await;
    }
}

async fn pump(shared: Arc<Shared>, direction: Direction) {
    let (src, dst, counters) = shared.ends(direction);
    let label = direction.as_str();

    'pump: loop {
        let Ok(frames) = src.read_frames().await else {
            break;
        };
        for frame in frames {
            let Some(data) = shared.chain.lock().apply(frame, direction) else {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                interpose_metrics::record_frame_dropped(label);
                continue;
            };
            let len = data.len() as u64;
            if dst.write_frame(data).await.is_err() {
                break 'pump;
            }
            counters.frames.fetch_add(1, Ordering::Relaxed);
            counters.bytes.fetch_add(len, Ordering::Relaxed);
            interpose_metrics::record_frame_forwarded(label, len);
        }
    }

    trace!(pair = shared.id, %direction, "pump exited");
    dst.close().await;
    src.close().await;
    if shared.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
        shared.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use interpose_endpoint::{Capabilities, State, StreamTransport};
    use interpose_module::Module;
    use interpose_proto::CodecSpec;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::oneshot;

    const WAIT: Duration = Duration::from_secs(5);

    fn endpoint(name: &str, caps: Capabilities) -> (Endpoint, DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let ep = Endpoint::from_transport(
            name,
            caps,
            CodecSpec::Passthrough,
            Box::new(StreamTransport::new(near)),
        );
        (ep, far)
    }

    struct Upper;

    impl Module for Upper {
        fn handle(&mut self, data: Bytes, direction: Direction) -> Option<Bytes> {
            match direction {
                Direction::AToB => Some(Bytes::from(data.to_ascii_uppercase())),
                Direction::BToA => Some(data),
            }
        }
    }

    struct DropAll;

    impl Module for DropAll {
        fn handle(&mut self, _data: Bytes, _direction: Direction) -> Option<Bytes> {
            None
        }
    }

    #[tokio::test]
    async fn test_forwards_both_directions_through_chain() {
        let (a, mut a_far) = endpoint("a", Capabilities::DUPLEX);
        let (b, mut b_far) = endpoint("b", Capabilities::DUPLEX);
        let fwd = Forwarder::start(1, a, b, ModuleChain::new(vec![Box::new(Upper)]), |_| {});

        a_far.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO");

        b_far.write_all(b"back").await.unwrap();
        let mut buf = [0u8; 4];
        a_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");

        let summary = fwd.summary();
        assert_eq!(summary.a_to_b.bytes, 5);
        assert_eq!(summary.b_to_a.bytes, 4);
    }

    #[tokio::test]
    async fn test_end_of_stream_cascades_and_completes_once() {
        let (a, a_far) = endpoint("a", Capabilities::DUPLEX);
        let (b, mut b_far) = endpoint("b", Capabilities::DUPLEX);
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        let fwd = Forwarder::start(7, a, b, ModuleChain::default(), {
            let calls = calls.clone();
            move |summary| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(summary.id);
            }
        });

        drop(a_far);
        let mut buf = Vec::new();
        let n = tokio::time::timeout(WAIT, b_far.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(tokio::time::timeout(WAIT, rx).await.unwrap().unwrap(), 7);

        fwd.close().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fwd.a().state(), State::Closed);
        assert_eq!(fwd.b().state(), State::Closed);
    }

    #[tokio::test]
    async fn test_dropped_frames_are_not_forwarded() {
        let (a, mut a_far) = endpoint("a", Capabilities::DUPLEX);
        let (b, mut b_far) = endpoint("b", Capabilities::DUPLEX);
        let fwd = Forwarder::start(2, a, b, ModuleChain::new(vec![Box::new(DropAll)]), |_| {});

        a_far.write_all(b"secret").await.unwrap();
        drop(a_far);
        tokio::time::timeout(WAIT, fwd.finished()).await.unwrap();

        let mut buf = Vec::new();
        b_far.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
        assert!(fwd.summary().a_to_b.dropped >= 1);
    }

    #[tokio::test]
    async fn test_one_way_pair() {
        let (a, mut a_far) = endpoint("a", Capabilities::READ_ONLY);
        let (b, mut b_far) = endpoint("b", Capabilities::WRITE_ONLY);
        let fwd = Forwarder::start(3, a, b, ModuleChain::default(), |_| {});

        a_far.write_all(b"one way").await.unwrap();
        let mut buf = [0u8; 7];
        b_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one way");

        drop(a_far);
        tokio::time::timeout(WAIT, fwd.finished()).await.unwrap();
        assert_eq!(fwd.summary().b_to_a, DirectionStats::default());
    }

    #[tokio::test]
    async fn test_no_legal_direction_completes_immediately() {
        let (a, _a_far) = endpoint("a", Capabilities::WRITE_ONLY);
        let (b, _b_far) = endpoint("b", Capabilities::WRITE_ONLY);
        let (tx, rx) = oneshot::channel();
        let fwd = Forwarder::start(4, a, b, ModuleChain::default(), move |_| {
            let _ = tx.send(());
        });
        tokio::time::timeout(WAIT, rx).await.unwrap().unwrap();
        assert!(fwd.is_finished());
        assert_eq!(fwd.a().state(), State::Closed);
        assert_eq!(fwd.b().state(), State::Closed);
    }

    #[tokio::test]
    async fn test_close_stops_idle_pumps() {
        let (a, _a_far) = endpoint("a", Capabilities::DUPLEX);
        let (b, _b_far) = endpoint("b", Capabilities::DUPLEX);
        let fwd = Forwarder::start(5, a, b, ModuleChain::default(), |_| {});
        tokio::time::timeout(WAIT, fwd.close()).await.unwrap();
        assert!(fwd.is_finished());
    }
}
