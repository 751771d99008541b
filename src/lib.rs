//! Per-connection forwarding core of a peer-to-peer Ethernet-over-UDP overlay.
//!
//! Each peer of the overlay keeps a long-lived connection to every other peer it
//! routes to. Ethernet frames captured from the local tap device are handed to
//! [`connection::PeerConnection::forward`], which batches them into UDP datagrams
//! and delivers them to the remote peer - encrypted if a session key was
//! negotiated, in the clear otherwise.
//!
//! ## Design goals
//!
//! * Discover the usable path MTU at the application layer instead of trusting
//!   static configuration: a raw IPv4 socket in `IP_PMTUDISC_DO` mode turns
//!   ICMP "fragmentation needed" feedback into `EMSGSIZE` on send, which this
//!   crate translates into a reduced *client PMTU* - the largest Ethernet body
//!   the overlay can carry in one tunnel datagram.
//! * Coalesce opportunistically: frames queued behind one another are packed
//!   into a single datagram up to the discovered MTU, without ever delaying a
//!   frame to wait for more.
//! * Run two independent pipelines per connection - one for traffic that must
//!   not be fragmented (DF) and one for fragmentable traffic - because the two
//!   need different senders and different MTU accounting.
//! * Fragment IPv4 in the application when the host stack cannot be trusted to
//!   do it for non-DF traffic.
//! * Apply backpressure to producers purely through bounded queues, and drain
//!   those queues on teardown so no producer stays blocked.
//!
//! ## Datagram layout
//!
//! Without a session key:
//!
//! ```ascii
//! 0: protocol version (u8)
//! 1: frames, each:
//!      0: source peer id (u64 BE)
//!      8: destination peer id (u64 BE)
//!     16: frame length (u16 BE)
//!     18: raw Ethernet frame bytes
//! ```
//!
//! With a session key, the frame sequence is AES-256-GCM encrypted:
//!
//! ```ascii
//!  0: protocol version (u8) - unencrypted to allow versioning of encryption
//!  1: nonce (12 bytes: 4 random bytes fixed per encryptor + u64 counter)
//! 13: encrypted frame sequence + 16 bytes GCM tag
//! ```
//!
//! The encrypted envelope adds a total of 1 + 12 + 16 = 29 bytes per datagram;
//! the plain one adds 1. Each appended frame adds 18 bytes of framing. The
//! pipelines budget exactly these overheads when deciding whether one more
//! frame still fits a datagram.
//!
//! ## Path MTU verification
//!
//! A lowered client PMTU is only trusted once the remote acknowledges it
//! out of band (the control plane sets the verified flag on the connection).
//! Until then the DF pipeline keeps probing: ten redundant copies of a
//! maximum-size frame per round, then a countdown of 10 bytes per verify
//! timeout. The redundancy compensates for the acknowledgement itself being
//! best-effort.

pub mod config;
pub mod connection;
pub mod encrypt;
pub mod fragment;
pub mod frame;
pub mod sender;

mod pipeline;

#[cfg(test)]
mod test_util;
