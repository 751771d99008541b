use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::ForwarderConfig;
use crate::connection::PeerConnection;
use crate::encrypt::FrameEncryptor;
use crate::frame::ForwardedFrame;
use crate::sender::{SendError, UdpSender};

/// Redundant copies sent per PMTU probe round. The remote's acknowledgement
/// travels over a best-effort channel, so a single probe would make the
/// countdown trigger-happy.
const PMTU_PROBE_COPIES: usize = 10;

/// Step by which an unacknowledged candidate client PMTU is lowered.
const PMTU_PROBE_DECREMENT: usize = 10;

/// One direction of a connection's forwarding: owns an encryptor, a sender
/// and the local view of the path MTU, and consumes its forward queue until
/// told to stop.
///
/// There are two instances per connection: a fragmentable one writing
/// through the shared UDP socket, and a DF one writing through a raw IP
/// socket whose `EMSGSIZE` feedback drives the PMTU discovery below.
pub(crate) struct ForwarderPipeline {
    conn: Arc<PeerConnection>,
    config: Arc<ForwarderConfig>,
    forward_rx: mpsc::Receiver<ForwardedFrame>,
    stop_rx: mpsc::Receiver<()>,
    encryptor: Box<dyn FrameEncryptor>,
    sender: Box<dyn UdpSender>,
    /// Largest datagram the sender accepts: path MTU minus the IP and UDP
    /// headers the kernel wraps around it.
    max_payload: usize,
    /// Local candidate for the connection-wide client PMTU. Zero until the
    /// first `EMSGSIZE` teaches us the real path MTU.
    client_pmtu: usize,
    /// Deadline of the pending verification round, if one is in flight.
    pmtu_verify_at: Option<Instant>,
    fatal_tx: mpsc::UnboundedSender<anyhow::Error>,
}

impl ForwarderPipeline {
    pub(crate) fn new(
        conn: Arc<PeerConnection>,
        encryptor: Box<dyn FrameEncryptor>,
        sender: Box<dyn UdpSender>,
        forward_rx: mpsc::Receiver<ForwardedFrame>,
        stop_rx: mpsc::Receiver<()>,
        fatal_tx: mpsc::UnboundedSender<anyhow::Error>,
        pmtu: usize,
    ) -> ForwarderPipeline {
        let config = conn.config();
        ForwarderPipeline {
            max_payload: pmtu.saturating_sub(config.udp_overhead),
            client_pmtu: 0,
            pmtu_verify_at: None,
            conn,
            config,
            forward_rx,
            stop_rx,
            encryptor,
            sender,
            fatal_tx,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("starting forwarder pipeline towards {}", self.conn.remote_peer());
        loop {
            let verify_at = self.pmtu_verify_at;
            tokio::select! {
                _ = self.stop_rx.recv() => {
                    self.drain();
                    break;
                }
                _ = deadline(verify_at) => {
                    // only reached between batches: every frame arm below
                    // flushes before the loop selects again, so probes never
                    // mix into a half-built datagram
                    self.pmtu_verify_at = None;
                    if !self.conn.is_client_pmtu_verified().await {
                        self.client_pmtu = self
                            .client_pmtu
                            .saturating_sub(PMTU_PROBE_DECREMENT)
                            .max(self.config.min_pmtu);
                        self.update_client_pmtu().await;
                    }
                }
                frame = self.forward_rx.recv() => {
                    match frame {
                        Some(frame) => {
                            if !self.coalesce_and_flush(frame).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        self.sender.shutdown();
        debug!("forwarder pipeline towards {} exited", self.conn.remote_peer());
    }

    /// Appends `frame` and keeps greedily pulling more without blocking,
    /// flushing whenever the next frame would overflow the datagram and as
    /// soon as the queue runs empty. Returns false when the queue is closed
    /// and the pipeline should exit.
    async fn coalesce_and_flush(&mut self, frame: ForwardedFrame) -> bool {
        if !self.append(&frame) {
            self.log_oversized_drop(&frame);
            return true;
        }
        loop {
            match self.forward_rx.try_recv() {
                Ok(frame) => {
                    if !self.append(&frame) {
                        self.flush().await;
                        if !self.append(&frame) {
                            self.log_oversized_drop(&frame);
                            return true;
                        }
                    }
                }
                Err(TryRecvError::Empty) => {
                    self.flush().await;
                    return true;
                }
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// A frame fits iff its framed length still fits the datagram next to
    /// what is already batched.
    fn append(&mut self, frame: &ForwardedFrame) -> bool {
        if self.encryptor.total_len() + self.encryptor.frame_overhead() + frame.len() > self.max_payload {
            return false;
        }
        self.encryptor.append_frame(frame);
        true
    }

    async fn flush(&mut self) {
        let datagram = self.encryptor.bytes();
        trace!(
            "flushing datagram of {} bytes towards {}",
            datagram.len(),
            self.conn.remote_peer()
        );
        match self.sender.send(&datagram).await {
            Ok(()) => {}
            Err(SendError::FrameTooBig { pmtu }) => {
                self.max_payload = pmtu.saturating_sub(self.config.udp_overhead);
                self.client_pmtu = self
                    .max_payload
                    .saturating_sub(self.encryptor.packet_overhead())
                    .saturating_sub(self.encryptor.frame_overhead())
                    .saturating_sub(self.config.ethernet_overhead)
                    .max(self.config.min_pmtu);
                self.update_client_pmtu().await;
            }
            Err(SendError::BufferExhausted) => {
                // TODO consider a short send back-off instead of dropping outright
                warn!(
                    "kernel send buffer exhausted, dropping a datagram of {} bytes",
                    datagram.len()
                );
            }
            Err(SendError::Io(e)) => {
                error!("transport error towards {}: {}", self.conn.remote_peer(), e);
                let _ = self.fatal_tx.send(e.into());
            }
        }
    }

    /// Publishes the local candidate to the connection and probes the remote
    /// with redundant maximum-size frames, each flushed on its own. Probe
    /// sends are best-effort: if they fail, the verify timer re-runs the
    /// round anyway.
    async fn update_client_pmtu(&mut self) {
        debug!(
            "probing candidate client PMTU of {} towards {}",
            self.client_pmtu,
            self.conn.remote_peer()
        );
        self.conn.set_client_pmtu(self.client_pmtu).await;

        let probe = ForwardedFrame::pmtu_probe(
            self.conn.local_peer(),
            self.conn.remote_peer(),
            self.client_pmtu + self.config.ethernet_overhead,
        );
        for _ in 0..PMTU_PROBE_COPIES {
            self.encryptor.append_frame(&probe);
            let datagram = self.encryptor.bytes();
            if let Err(e) = self.sender.send(&datagram).await {
                debug!("PMTU probe towards {} failed: {}", self.conn.remote_peer(), e);
            }
        }
        self.pmtu_verify_at = Some(Instant::now() + self.config.pmtu_verify_timeout);
    }

    /// Empties the forward queue so producers blocked on a full queue can
    /// make progress and observe the connection's nulled queue handles.
    fn drain(&mut self) {
        let mut dropped = 0usize;
        while self.forward_rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("dropped {} undelivered frames while stopping", dropped);
        }
    }

    fn log_oversized_drop(&self, frame: &ForwardedFrame) {
        warn!(
            "dropping too big frame during forwarding: frame len: {}; max payload: {}",
            frame.len(),
            self.max_payload
        );
    }
}

async fn deadline(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encrypt::PlainEncryptor;
    use crate::frame::PeerId;
    use crate::sender::MockUdpSender;
    use crate::test_util::test_connection;
    use bytes::Bytes;
    use std::io;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::runtime::Builder;
    use tokio::time::sleep;

    fn frame(len: usize) -> ForwardedFrame {
        ForwardedFrame::new(PeerId(1), PeerId(2), Bytes::from(vec![7u8; len]))
    }

    fn capturing_sender(sent: &Arc<Mutex<Vec<Vec<u8>>>>) -> MockUdpSender {
        let mut sender = MockUdpSender::new();
        let sent = sent.clone();
        sender.expect_send().returning(move |datagram| {
            sent.lock().unwrap().push(datagram.to_vec());
            Ok(())
        });
        sender.expect_shutdown().once().return_const(());
        sender
    }

    struct TestPipeline {
        forward_tx: mpsc::Sender<ForwardedFrame>,
        stop_tx: mpsc::Sender<()>,
        fatal_rx: mpsc::UnboundedReceiver<anyhow::Error>,
        handle: tokio::task::JoinHandle<()>,
    }

    async fn spawn_pipeline(
        conn: &Arc<PeerConnection>,
        sender: MockUdpSender,
        pmtu: usize,
        queue_capacity: usize,
    ) -> TestPipeline {
        let (forward_tx, forward_rx) = mpsc::channel(queue_capacity);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let pipeline = ForwarderPipeline::new(
            conn.clone(),
            Box::new(PlainEncryptor::new()),
            Box::new(sender),
            forward_rx,
            stop_rx,
            fatal_tx,
            pmtu,
        );
        let handle = tokio::spawn(pipeline.run());
        TestPipeline { forward_tx, stop_tx, fatal_rx, handle }
    }

    impl TestPipeline {
        async fn stop(self) {
            self.stop_tx.send(()).await.unwrap();
            self.handle.await.unwrap();
        }
    }

    fn paused_rt() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    /// frames queued back to back end up coalesced into far fewer datagrams,
    /// with nothing lost and no datagram over budget
    #[test]
    fn test_coalescing() {
        paused_rt().block_on(async {
            let conn = test_connection(false).await;
            let sent = Arc::new(Mutex::new(Vec::new()));

            let (forward_tx, forward_rx) = mpsc::channel(128);
            let (stop_tx, stop_rx) = mpsc::channel(1);
            let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();
            for _ in 0..100 {
                forward_tx.try_send(frame(200)).unwrap();
            }

            let pipeline = ForwarderPipeline::new(
                conn.clone(),
                Box::new(PlainEncryptor::new()),
                Box::new(capturing_sender(&sent)),
                forward_rx,
                stop_rx,
                fatal_tx,
                1500,
            );
            let handle = tokio::spawn(pipeline.run());
            sleep(Duration::from_millis(1)).await;

            stop_tx.send(()).await.unwrap();
            handle.await.unwrap();

            let sent = sent.lock().unwrap();
            // 218 framed bytes per frame into a 1472-byte budget: 6 per datagram
            assert_eq!(sent.len(), 17);
            assert!(sent.iter().all(|d| d.len() <= 1472 + 1));
            let framed_bytes: usize = sent.iter().map(|d| d.len() - 1).sum();
            assert_eq!(framed_bytes, 100 * (18 + 200));
        });
    }

    /// an EMSGSIZE-style send failure shrinks the budgets, publishes the
    /// recomputed client PMTU and probes it; an unacknowledged candidate is
    /// lowered and re-probed after the verify timeout
    #[test]
    fn test_pmtu_reduction_and_verification_countdown() {
        paused_rt().block_on(async {
            let conn = test_connection(false).await;

            let mut sender = MockUdpSender::new();
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 200)
                .times(1)
                .returning(|_| Err(SendError::FrameTooBig { pmtu: 1400 }));
            // client PMTU 1400 - 28 - 1 - 18 - 14 = 1339, probe frame 1353
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 1353)
                .times(10)
                .returning(|_| Ok(()));
            // countdown to 1329, probe frame 1343
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 1343)
                .times(10)
                .returning(|_| Ok(()));
            sender.expect_shutdown().once().return_const(());

            let pipeline = spawn_pipeline(&conn, sender, 1500, 16).await;
            pipeline.forward_tx.send(frame(200)).await.unwrap();
            sleep(Duration::from_millis(1)).await;

            assert_eq!(conn.client_pmtu().await, 1339);
            assert!(!conn.is_client_pmtu_verified().await);

            sleep(conn.config().pmtu_verify_timeout + Duration::from_millis(1)).await;
            assert_eq!(conn.client_pmtu().await, 1329);

            pipeline.stop().await;
        });
    }

    /// once the control plane acknowledges the candidate, the countdown stops
    #[test]
    fn test_verified_candidate_is_not_lowered() {
        paused_rt().block_on(async {
            let conn = test_connection(false).await;

            let mut sender = MockUdpSender::new();
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 100)
                .times(1)
                .returning(|_| Err(SendError::FrameTooBig { pmtu: 1400 }));
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 1353)
                .times(10)
                .returning(|_| Ok(()));
            sender.expect_shutdown().once().return_const(());

            let pipeline = spawn_pipeline(&conn, sender, 1500, 16).await;
            pipeline.forward_tx.send(frame(100)).await.unwrap();
            sleep(Duration::from_millis(1)).await;
            assert_eq!(conn.client_pmtu().await, 1339);

            conn.set_client_pmtu_verified().await;
            sleep(conn.config().pmtu_verify_timeout * 3).await;

            // no further probes (the mock would reject them) and no countdown
            assert_eq!(conn.client_pmtu().await, 1339);
            pipeline.stop().await;
        });
    }

    /// a recomputation that lands below the floor is clamped to it
    #[test]
    fn test_client_pmtu_clamped_to_minimum() {
        paused_rt().block_on(async {
            let conn = test_connection(false).await;
            let min_pmtu = conn.config().min_pmtu;

            let mut sender = MockUdpSender::new();
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 100)
                .times(1)
                .returning(|_| Err(SendError::FrameTooBig { pmtu: 68 }));
            // probes at the clamped floor: frame of min_pmtu + 14 bytes
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 576 + 14)
                .times(10)
                .returning(|_| Ok(()));
            sender.expect_shutdown().once().return_const(());

            let pipeline = spawn_pipeline(&conn, sender, 1500, 16).await;
            pipeline.forward_tx.send(frame(100)).await.unwrap();
            sleep(Duration::from_millis(1)).await;

            assert_eq!(conn.client_pmtu().await, min_pmtu);
            pipeline.stop().await;
        });
    }

    /// exhausted kernel buffers drop the datagram but never kill the connection
    #[test]
    fn test_buffer_exhaustion_is_swallowed() {
        paused_rt().block_on(async {
            let conn = test_connection(false).await;

            let mut sender = MockUdpSender::new();
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 100)
                .times(1)
                .returning(|_| Err(SendError::BufferExhausted));
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 200)
                .times(1)
                .returning(|_| Ok(()));
            sender.expect_shutdown().once().return_const(());

            let mut pipeline = spawn_pipeline(&conn, sender, 1500, 16).await;
            pipeline.forward_tx.send(frame(100)).await.unwrap();
            sleep(Duration::from_millis(1)).await;
            pipeline.forward_tx.send(frame(200)).await.unwrap();
            sleep(Duration::from_millis(1)).await;

            assert!(pipeline.fatal_rx.try_recv().is_err());
            pipeline.stop().await;
        });
    }

    /// any other transport error is reported to the parent; the pipeline
    /// itself keeps serving until stopped
    #[test]
    fn test_fatal_transport_error_is_reported() {
        paused_rt().block_on(async {
            let conn = test_connection(false).await;

            let mut sender = MockUdpSender::new();
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 100)
                .times(1)
                .returning(|_| {
                    Err(SendError::Io(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "operation not permitted",
                    )))
                });
            sender
                .expect_send()
                .withf(|d: &[u8]| d.len() == 1 + 18 + 200)
                .times(1)
                .returning(|_| Ok(()));
            sender.expect_shutdown().once().return_const(());

            let mut pipeline = spawn_pipeline(&conn, sender, 1500, 16).await;
            pipeline.forward_tx.send(frame(100)).await.unwrap();
            sleep(Duration::from_millis(1)).await;
            assert!(pipeline.fatal_rx.try_recv().is_ok());

            pipeline.forward_tx.send(frame(200)).await.unwrap();
            sleep(Duration::from_millis(1)).await;
            pipeline.stop().await;
        });
    }

    /// a frame too big even for an empty datagram is dropped, not sent
    #[test]
    fn test_oversized_single_frame_is_dropped() {
        paused_rt().block_on(async {
            let conn = test_connection(false).await;

            let mut sender = MockUdpSender::new();
            sender.expect_shutdown().once().return_const(());

            let pipeline = spawn_pipeline(&conn, sender, 1500, 16).await;
            // 18 + 1460 > 1472
            pipeline.forward_tx.send(frame(1460)).await.unwrap();
            sleep(Duration::from_millis(1)).await;
            pipeline.stop().await;
        });
    }

    /// stopping drains the queue so a producer blocked on a full queue makes
    /// progress, and shuts the sender down
    #[test]
    fn test_stop_drains_and_unblocks_producers() {
        paused_rt().block_on(async {
            let conn = test_connection(false).await;

            let (forward_tx, forward_rx) = mpsc::channel(2);
            let (stop_tx, stop_rx) = mpsc::channel(1);
            let (fatal_tx, _fatal_rx) = mpsc::unbounded_channel();

            forward_tx.try_send(frame(100)).unwrap();
            forward_tx.try_send(frame(100)).unwrap();
            let blocked_producer = {
                let forward_tx = forward_tx.clone();
                tokio::spawn(async move {
                    // queue is full, this blocks until the pipeline drains or exits
                    let _ = forward_tx.send(frame(100)).await;
                })
            };
            stop_tx.send(()).await.unwrap();

            let mut sender = MockUdpSender::new();
            sender.expect_send().returning(|_| Ok(()));
            sender.expect_shutdown().once().return_const(());

            let pipeline = ForwarderPipeline::new(
                conn.clone(),
                Box::new(PlainEncryptor::new()),
                Box::new(sender),
                forward_rx,
                stop_rx,
                fatal_tx,
                1500,
            );
            let handle = tokio::spawn(pipeline.run());

            tokio::time::timeout(Duration::from_secs(5), blocked_producer)
                .await
                .expect("producer stayed blocked across stop")
                .unwrap();
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("pipeline did not exit on stop")
                .unwrap();
        });
    }

    /// closing the forward queue ends the pipeline even without a stop signal
    #[test]
    fn test_closed_queue_ends_pipeline() {
        paused_rt().block_on(async {
            let conn = test_connection(false).await;

            let mut sender = MockUdpSender::new();
            sender.expect_shutdown().once().return_const(());

            let pipeline = spawn_pipeline(&conn, sender, 1500, 16).await;
            drop(pipeline.forward_tx);
            tokio::time::timeout(Duration::from_secs(5), pipeline.handle)
                .await
                .expect("pipeline did not exit on queue close")
                .unwrap();
        });
    }
}
