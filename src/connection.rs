use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::config::ForwarderConfig;
use crate::encrypt::{FrameEncryptor, GcmEncryptor, PlainEncryptor, SessionKey};
use crate::fragment::{fragment, FragmentError};
use crate::frame::{EthernetDecoder, ForwardedFrame, PeerId};
use crate::pipeline::ForwarderPipeline;
use crate::sender::{RawUdpSender, SimpleUdpSender, UdpSender};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForwardError {
    /// The caller asked for DF delivery of a frame the path cannot carry
    /// whole. Callers typically drop the frame and let the tenant's own
    /// PMTU discovery react.
    #[error("frame of {len} bytes exceeds the client PMTU of {pmtu} bytes")]
    FrameTooBig { pmtu: usize, len: usize },

    #[error(transparent)]
    Fragment(#[from] FragmentError),
}

/// Everything the dispatcher and the pipelines share about one connection.
///
/// Queue handles are `Some` exactly between `start_forwarding` and
/// `stop_forwarding`; the dispatcher treats `None` as "not ready yet" and
/// drops silently.
struct ForwardState {
    forward_tx: Option<mpsc::Sender<ForwardedFrame>>,
    forward_tx_df: Option<mpsc::Sender<ForwardedFrame>>,
    stop_tx: Option<mpsc::Sender<()>>,
    stop_tx_df: Option<mpsc::Sender<()>>,
    client_pmtu: usize,
    client_pmtu_verified: bool,
    stack_frag: bool,
}

/// The forwarding face of one long-lived connection to a remote peer.
///
/// Producers (tap sniffer, UDP listener, TCP receiver, heartbeats) call
/// [`forward`](PeerConnection::forward) concurrently; two pipeline tasks
/// spawned by [`start_forwarding`](PeerConnection::start_forwarding) consume
/// the queues behind it.
pub struct PeerConnection {
    local: PeerId,
    remote: PeerId,
    remote_udp_addr: SocketAddr,
    udp_socket: Arc<UdpSocket>,
    session_key: Option<SessionKey>,
    config: Arc<ForwarderConfig>,
    state: RwLock<ForwardState>,
}

impl PeerConnection {
    pub fn new(
        local: PeerId,
        remote: PeerId,
        remote_udp_addr: SocketAddr,
        udp_socket: Arc<UdpSocket>,
        session_key: Option<SessionKey>,
        stack_frag: bool,
        config: Arc<ForwarderConfig>,
    ) -> PeerConnection {
        PeerConnection {
            local,
            remote,
            remote_udp_addr,
            udp_socket,
            session_key,
            state: RwLock::new(ForwardState {
                forward_tx: None,
                forward_tx_df: None,
                stop_tx: None,
                stop_tx_df: None,
                client_pmtu: config.default_pmtu,
                client_pmtu_verified: false,
                stack_frag,
            }),
            config,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote
    }

    pub(crate) fn config(&self) -> Arc<ForwarderConfig> {
        self.config.clone()
    }

    /// Largest Ethernet body the overlay currently believes it can carry to
    /// this peer in one tunnel datagram.
    pub async fn client_pmtu(&self) -> usize {
        self.state.read().await.client_pmtu
    }

    /// A new candidate invalidates any previous acknowledgement.
    pub(crate) async fn set_client_pmtu(&self, client_pmtu: usize) {
        let mut state = self.state.write().await;
        state.client_pmtu = client_pmtu;
        state.client_pmtu_verified = false;
    }

    /// Called by the control plane when the remote acknowledges receiving a
    /// verification frame at the current client PMTU.
    pub async fn set_client_pmtu_verified(&self) {
        self.state.write().await.client_pmtu_verified = true;
    }

    pub(crate) async fn is_client_pmtu_verified(&self) -> bool {
        self.state.read().await.client_pmtu_verified
    }

    /// Hands a frame to this connection for delivery to the remote peer.
    ///
    /// `df` demands unfragmented delivery: an oversized frame is rejected
    /// with [`ForwardError::FrameTooBig`] instead of being fragmented. On
    /// the fragmentable path, `decoded` decides whether an oversized frame
    /// can be fragmented here when the local stack cannot be trusted to;
    /// `None` is legal and treats the frame as opaque.
    ///
    /// May block on a full queue - that is the backpressure towards the
    /// producers. Never blocks while holding the connection lock.
    pub async fn forward(
        &self,
        df: bool,
        frame: ForwardedFrame,
        decoded: Option<&EthernetDecoder>,
    ) -> Result<(), ForwardError> {
        let (forward_tx, forward_tx_df, client_pmtu, stack_frag) = {
            let state = self.state.read().await;
            (
                state.forward_tx.clone(),
                state.forward_tx_df.clone(),
                state.client_pmtu,
                state.stack_frag,
            )
        };
        let (Some(forward_tx), Some(forward_tx_df)) = (forward_tx, forward_tx_df) else {
            debug!("cannot forward frame to {} yet - awaiting contact", self.remote);
            return Ok(());
        };

        let ethernet_overhead = self.config.ethernet_overhead;
        if df {
            return if frame.len().saturating_sub(ethernet_overhead) <= client_pmtu {
                self.enqueue(&forward_tx_df, frame).await;
                Ok(())
            } else {
                Err(ForwardError::FrameTooBig { pmtu: client_pmtu, len: frame.len() })
            };
        }

        match decoded {
            Some(decoded) if !stack_frag && decoded.is_ipv4() => {
                if frame.len().saturating_sub(ethernet_overhead) <= client_pmtu {
                    // can't trust the stack to fragment, so send it whole
                    // with DF set
                    self.enqueue(&forward_tx_df, frame).await;
                    return Ok(());
                }
                debug!("fragmenting frame of {} bytes for {}", frame.len(), self.remote);
                for segment in fragment(&frame, decoded, client_pmtu, ethernet_overhead)? {
                    self.enqueue(&forward_tx_df, segment).await;
                }
                Ok(())
            }
            _ => {
                // the stack fragments for us, or the frame is opaque to us -
                // either way it goes out fragmentable
                self.enqueue(&forward_tx, frame).await;
                Ok(())
            }
        }
    }

    async fn enqueue(&self, queue: &mpsc::Sender<ForwardedFrame>, frame: ForwardedFrame) {
        // a send error means forwarding stopped while we held the old
        // handle; best-effort transport, so the frame is simply dropped
        if queue.send(frame).await.is_err() {
            debug!("forwarding to {} stopped while enqueueing - dropping frame", self.remote);
        }
    }

    /// Installs the forwarding queues and spawns the two pipeline tasks: the
    /// fragmentable one behind the shared UDP socket, the DF one behind a
    /// fresh raw IP socket. Creating that socket is the only fallible step
    /// and happens before any state is installed. Calling this while
    /// forwarding already runs is a no-op.
    ///
    /// Fatal transport errors encountered by either pipeline are reported
    /// through `fatal_tx`; tearing the connection down in response is the
    /// caller's business.
    pub async fn start_forwarding(
        self: &Arc<Self>,
        fatal_tx: mpsc::UnboundedSender<anyhow::Error>,
    ) -> anyhow::Result<()> {
        if self.state.read().await.forward_tx.is_some() {
            return Ok(());
        }
        let raw_sender = RawUdpSender::new(self.remote_udp_addr, self.config.port)?;
        let simple_sender = SimpleUdpSender::new(self.udp_socket.clone(), self.remote_udp_addr);
        self.start_forwarding_with(Box::new(simple_sender), Box::new(raw_sender), fatal_tx)
            .await
    }

    pub(crate) async fn start_forwarding_with(
        self: &Arc<Self>,
        sender: Box<dyn UdpSender>,
        sender_df: Box<dyn UdpSender>,
        fatal_tx: mpsc::UnboundedSender<anyhow::Error>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.forward_tx.is_some() || state.forward_tx_df.is_some() {
            return Ok(());
        }

        let (encryptor, encryptor_df) = self.create_encryptors();

        let (forward_tx, forward_rx) = mpsc::channel(self.config.channel_size);
        let (forward_tx_df, forward_rx_df) = mpsc::channel(self.config.channel_size);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (stop_tx_df, stop_rx_df) = mpsc::channel(1);

        state.forward_tx = Some(forward_tx);
        state.forward_tx_df = Some(forward_tx_df);
        state.stop_tx = Some(stop_tx);
        state.stop_tx_df = Some(stop_tx_df);
        let client_pmtu = state.client_pmtu;
        drop(state);

        tokio::spawn(
            ForwarderPipeline::new(
                self.clone(),
                encryptor,
                sender,
                forward_rx,
                stop_rx,
                fatal_tx.clone(),
                self.config.default_pmtu,
            )
            .run(),
        );
        tokio::spawn(
            ForwarderPipeline::new(
                self.clone(),
                encryptor_df,
                sender_df,
                forward_rx_df,
                stop_rx_df,
                fatal_tx,
                client_pmtu,
            )
            .run(),
        );
        Ok(())
    }

    fn create_encryptors(&self) -> (Box<dyn FrameEncryptor>, Box<dyn FrameEncryptor>) {
        match &self.session_key {
            Some(key) => (Box::new(GcmEncryptor::new(key)), Box::new(GcmEncryptor::new(key))),
            None => {
                warn!("no session key for {} - forwarding frames in the clear", self.remote);
                (Box::new(PlainEncryptor::new()), Box::new(PlainEncryptor::new()))
            }
        }
    }

    /// Nulls the queue handles so future `forward` calls drop silently, then
    /// signals both pipelines. They drain their queues before exiting, which
    /// unblocks any producer still waiting on a full queue.
    pub async fn stop_forwarding(&self) {
        let (stop_tx, stop_tx_df) = {
            let mut state = self.state.write().await;
            state.forward_tx = None;
            state.forward_tx_df = None;
            (state.stop_tx.take(), state.stop_tx_df.take())
        };
        if let Some(stop_tx) = stop_tx {
            let _ = stop_tx.send(()).await;
        }
        if let Some(stop_tx_df) = stop_tx_df {
            let _ = stop_tx_df.send(()).await;
        }
    }
}

/// Whether the local IP stack can be trusted to fragment outgoing non-DF
/// IPv4. With `ip_no_pmtu_disc` set the kernel never marks locally sent
/// packets DF and fragments them to the route MTU itself; with path MTU
/// discovery active (the default) it marks them DF and nothing on the path
/// will fragment for us.
///
/// Read once per connection at construction; hosts without procfs count as
/// untrusted.
pub fn detect_stack_fragmentation() -> bool {
    match std::fs::read_to_string("/proc/sys/net/ipv4/ip_no_pmtu_disc") {
        Ok(value) => value.trim() != "0",
        Err(_) => false,
    }
}
