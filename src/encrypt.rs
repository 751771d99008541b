use aead::{Aead, KeyInit, Nonce};
use aes_gcm::Aes256Gcm;
use bytes::{BufMut, Bytes, BytesMut};
use tracing::error;

use crate::frame::{ForwardedFrame, PeerId};

/// First byte of every tunnel datagram, transmitted unencrypted so the
/// encryption envelope itself can be versioned.
pub const DATAGRAM_VERSION_1: u8 = 1;

/// Bytes each appended frame adds beyond the frame itself: both peer ids
/// plus a u16 length.
pub const FRAME_OVERHEAD: usize = 2 * PeerId::SERIALIZED_LEN + size_of::<u16>();

/// Session key negotiated by the control plane's handshake.
pub type SessionKey = [u8; 32];

/// Builds one outbound datagram at a time: frames are appended with their
/// framing, overheads are queryable for MTU budgeting, and [`bytes`] emits
/// the finished datagram and resets the builder.
///
/// [`bytes`]: FrameEncryptor::bytes
pub trait FrameEncryptor: Send {
    /// Appends `frame` plus framing to the datagram under construction.
    fn append_frame(&mut self, frame: &ForwardedFrame);

    /// Framed plaintext bytes committed to the current datagram so far.
    fn total_len(&self) -> usize;

    /// Bytes [`append_frame`](FrameEncryptor::append_frame) will add beyond
    /// the frame's own length.
    fn frame_overhead(&self) -> usize;

    /// Bytes the finished datagram carries beyond the framed plaintext,
    /// independent of how many frames it holds.
    fn packet_overhead(&self) -> usize;

    /// Serializes the current batch into a datagram and resets the builder.
    fn bytes(&mut self) -> Bytes;
}

fn put_framed(buf: &mut BytesMut, frame: &ForwardedFrame) {
    // the fit check against max_payload has already bounded the length
    debug_assert!(frame.len() <= usize::from(u16::MAX));
    frame.src.ser(buf);
    frame.dst.ser(buf);
    buf.put_u16(frame.len() as u16);
    buf.put_slice(&frame.frame);
}

/// Identity encryptor for connections without a session key.
pub struct PlainEncryptor {
    buf: BytesMut,
}

impl PlainEncryptor {
    pub fn new() -> PlainEncryptor {
        PlainEncryptor { buf: BytesMut::new() }
    }
}

impl Default for PlainEncryptor {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncryptor for PlainEncryptor {
    fn append_frame(&mut self, frame: &ForwardedFrame) {
        put_framed(&mut self.buf, frame);
    }

    fn total_len(&self) -> usize {
        self.buf.len()
    }

    fn frame_overhead(&self) -> usize {
        FRAME_OVERHEAD
    }

    fn packet_overhead(&self) -> usize {
        1 // protocol version
    }

    fn bytes(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(1 + self.buf.len());
        out.put_u8(DATAGRAM_VERSION_1);
        out.put_slice(&self.buf);
        self.buf.clear();
        out.freeze()
    }
}

/// AES-256-GCM encryptor for keyed connections.
///
/// Nonces are never reused: 4 random bytes fixed at construction plus a
/// per-datagram counter. Each pipeline owns its encryptor exclusively, so no
/// synchronisation is needed on the counter.
pub struct GcmEncryptor {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_counter: u64,
    buf: BytesMut,
}

impl GcmEncryptor {
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    pub fn new(key: &SessionKey) -> GcmEncryptor {
        GcmEncryptor {
            cipher: Aes256Gcm::new(key.into()),
            nonce_fixed: rand::random(),
            nonce_counter: 0,
            buf: BytesMut::new(),
        }
    }
}

impl FrameEncryptor for GcmEncryptor {
    fn append_frame(&mut self, frame: &ForwardedFrame) {
        put_framed(&mut self.buf, frame);
    }

    fn total_len(&self) -> usize {
        self.buf.len()
    }

    fn frame_overhead(&self) -> usize {
        FRAME_OVERHEAD
    }

    fn packet_overhead(&self) -> usize {
        1                   // protocol version
            + Self::NONCE_LEN
            + Self::TAG_LEN
    }

    fn bytes(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.packet_overhead() + self.buf.len());
        out.put_u8(DATAGRAM_VERSION_1);
        out.put_u32(self.nonce_fixed);
        out.put_u64(self.nonce_counter);
        self.nonce_counter += 1;

        let nonce = Nonce::<Aes256Gcm>::from_slice(&out[1..1 + Self::NONCE_LEN]);
        match self.cipher.encrypt(nonce, self.buf.as_ref()) {
            Ok(ciphertext) => out.put_slice(&ciphertext),
            Err(e) => {
                // AES-GCM encryption of an in-memory buffer cannot fail with
                // a well-formed key; treat it as a bug rather than dropping
                // traffic silently
                error!("encryption error: {}", e);
                panic!("encryption error");
            }
        }

        self.buf.clear();
        out.freeze()
    }
}
