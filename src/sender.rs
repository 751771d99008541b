use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
#[cfg(test)]
use mockall::automock;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::info;

const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum SendError {
    /// The kernel refused the datagram because it exceeds the current path
    /// MTU. Carries the kernel's fresh MTU estimate so the pipeline can
    /// shrink its budgets.
    #[error("datagram exceeds the path MTU of {pmtu} bytes")]
    FrameTooBig { pmtu: usize },

    /// The kernel's send buffer is exhausted. Best-effort transport: the
    /// pipeline drops the datagram and carries on.
    #[error("kernel send buffer exhausted")]
    BufferExhausted,

    /// Anything else is fatal for the connection.
    #[error("transport error: {0}")]
    Io(io::Error),
}

impl From<io::Error> for SendError {
    fn from(e: io::Error) -> SendError {
        match e.raw_os_error() {
            Some(libc::ENOBUFS) | Some(libc::ENOMEM) => SendError::BufferExhausted,
            _ => SendError::Io(e),
        }
    }
}

/// One datagram transport of a pipeline. Implementations must not block the
/// task beyond the send syscall itself.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UdpSender: Send {
    async fn send(&mut self, datagram: &[u8]) -> Result<(), SendError>;

    /// Releases transport resources. Called exactly once, after the last
    /// send, when the pipeline exits.
    fn shutdown(&mut self);
}

/// Sender of the fragmentable pipeline: plain writes through the router's
/// shared unconnected UDP socket. The socket outlives the connection, so
/// shutdown has nothing to do.
pub struct SimpleUdpSender {
    socket: Arc<UdpSocket>,
    peer_addr: SocketAddr,
}

impl SimpleUdpSender {
    pub fn new(socket: Arc<UdpSocket>, peer_addr: SocketAddr) -> SimpleUdpSender {
        SimpleUdpSender { socket, peer_addr }
    }
}

#[async_trait]
impl UdpSender for SimpleUdpSender {
    async fn send(&mut self, datagram: &[u8]) -> Result<(), SendError> {
        self.socket.send_to(datagram, self.peer_addr).await?;
        Ok(())
    }

    fn shutdown(&mut self) {}
}

/// Sender of the DF pipeline: UDP-over-IPv4 through a raw IP socket with
/// path MTU discovery forced on, so every outbound packet carries the Don't
/// Fragment bit and oversized sends surface as `EMSGSIZE` instead of being
/// fragmented en route.
pub struct RawUdpSender {
    socket: Option<Socket>,
    src_port: u16,
    dst_port: u16,
    buf: BytesMut,
}

impl RawUdpSender {
    /// Creating the socket is the only fallible step of pipeline startup;
    /// it needs `CAP_NET_RAW`.
    pub fn new(peer: SocketAddr, src_port: u16) -> anyhow::Result<RawUdpSender> {
        let IpAddr::V4(peer_ip) = peer.ip() else {
            bail!("the DF sender speaks UDP-over-raw-IPv4, cannot reach {}", peer.ip());
        };

        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::UDP))
            .context("creating raw IPv4 socket")?;
        socket
            .connect(&SocketAddr::new(IpAddr::V4(peer_ip), 0).into())
            .with_context(|| format!("connecting raw socket to {}", peer_ip))?;
        set_pmtu_discover(&socket).context("enabling kernel path MTU discovery")?;

        Ok(RawUdpSender {
            socket: Some(socket),
            src_port,
            dst_port: peer.port(),
            buf: BytesMut::new(),
        })
    }
}

#[async_trait]
impl UdpSender for RawUdpSender {
    async fn send(&mut self, datagram: &[u8]) -> Result<(), SendError> {
        let Some(socket) = &self.socket else {
            return Err(SendError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "raw socket already shut down",
            )));
        };
        if UDP_HEADER_LEN + datagram.len() > usize::from(u16::MAX) {
            return Err(SendError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "datagram exceeds the UDP length field",
            )));
        }

        self.buf.clear();
        ser_udp_header(&mut self.buf, self.src_port, self.dst_port, datagram.len());
        self.buf.put_slice(datagram);

        match socket.send(&self.buf) {
            Ok(_) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {
                let pmtu = path_mtu(socket)?;
                info!(
                    "EMSGSIZE on send, expecting path MTU update (UDP packet was {} bytes, payload was {} bytes)",
                    self.buf.len(),
                    datagram.len()
                );
                Err(SendError::FrameTooBig { pmtu })
            }
            Err(e) => Err(SendError::from(e)),
        }
    }

    fn shutdown(&mut self) {
        // dropping the socket closes the fd
        self.socket = None;
    }
}

/// The kernel fills in the IPv4 header on a raw `IPPROTO_UDP` socket, the
/// UDP header is ours to write. The checksum would have to be computed over
/// a phantom IP header; thankfully it is optional for UDP over IPv4, so we
/// send zero.
fn ser_udp_header(buf: &mut BytesMut, src_port: u16, dst_port: u16, payload_len: usize) {
    buf.put_u16(src_port);
    buf.put_u16(dst_port);
    buf.put_u16((UDP_HEADER_LEN + payload_len) as u16);
    buf.put_u16(0);
}

fn set_pmtu_discover(socket: &Socket) -> io::Result<()> {
    let value: libc::c_int = libc::IP_PMTUDISC_DO;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU_DISCOVER,
            &value as *const _ as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// The kernel's current path MTU estimate for the connected route, updated
/// by incoming ICMP "fragmentation needed" messages.
fn path_mtu(socket: &Socket) -> io::Result<usize> {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            socket.as_raw_fd(),
            libc::IPPROTO_IP,
            libc::IP_MTU,
            &mut value as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(value as usize)
}
