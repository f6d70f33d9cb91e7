//! Transport wire format
//!
//! Every outgoing data message is laid out as:
//!
//! ```text
//! [type:u32 LE = 4][receiver index:u32 LE][counter:u64 LE][ciphertext || tag]
//! ```
//!
//! The AEAD is ChaCha20-Poly1305 with a 12-byte nonce of 4 zero bytes
//! followed by the little-endian counter, empty associated data, and the
//! plaintext zero-padded to the next multiple of 16, capped at the TUN MTU
//! (the MTU wins over the multiple). Keepalives are 32-byte frames: header
//! plus the tag over an empty plaintext.

use bytes::BufMut;

/// Message type of a handshake initiation
pub const MESSAGE_INITIATION_TYPE: u32 = 1;

/// Message type of a transport data message
pub const MESSAGE_TRANSPORT_TYPE: u32 = 4;

/// Size of the transport header preceding the ciphertext
pub const MESSAGE_TRANSPORT_HEADER_SIZE: usize = 16;

/// Size of the Poly1305 authentication tag
pub const POLY1305_TAG_SIZE: usize = 16;

/// Size of a transport message with an empty plaintext
pub const MESSAGE_TRANSPORT_SIZE: usize = MESSAGE_TRANSPORT_HEADER_SIZE + POLY1305_TAG_SIZE;

/// Size of a keepalive frame (empty plaintext)
pub const MESSAGE_KEEPALIVE_SIZE: usize = MESSAGE_TRANSPORT_SIZE;

/// Serialized size of a handshake initiation, MACs included
pub const MESSAGE_INITIATION_SIZE: usize = 148;

/// Largest possible UDP datagram
pub const MAX_SEGMENT_SIZE: usize = (1 << 16) - 1;

/// Size of the fixed message buffers in the pool
pub const MAX_MESSAGE_SIZE: usize = MAX_SEGMENT_SIZE;

/// Largest plaintext accepted from the TUN
pub const MAX_CONTENT_SIZE: usize = MAX_SEGMENT_SIZE - MESSAGE_TRANSPORT_SIZE;

/// Plaintext is zero-extended to the next multiple of this before sealing
pub const PADDING_MULTIPLE: usize = 16;

/// Size of the ChaCha20-Poly1305 nonce
pub const CHACHA20POLY1305_NONCE_SIZE: usize = 12;

/// Minimum length of an IPv4 header
pub const IPV4_HEADER_LEN: usize = 20;

/// Minimum length of an IPv6 header
pub const IPV6_HEADER_LEN: usize = 40;

/// Byte offset of the destination address in an IPv4 header
pub const IPV4_OFFSET_DST: usize = 16;

/// Byte offset of the destination address in an IPv6 header
pub const IPV6_OFFSET_DST: usize = 24;

/// Write the 16-byte transport header into the front of `header`
///
/// # Panics
///
/// Panics if `header` is shorter than [`MESSAGE_TRANSPORT_HEADER_SIZE`].
pub fn write_transport_header(header: &mut [u8], receiver_index: u32, counter: u64) {
    let mut dst = &mut header[..MESSAGE_TRANSPORT_HEADER_SIZE];
    dst.put_u32_le(MESSAGE_TRANSPORT_TYPE);
    dst.put_u32_le(receiver_index);
    dst.put_u64_le(counter);
}

/// Build the 12-byte AEAD nonce for a transport counter
#[must_use]
pub fn transport_nonce(counter: u64) -> [u8; CHACHA20POLY1305_NONCE_SIZE] {
    let mut nonce = [0u8; CHACHA20POLY1305_NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    nonce
}

/// Padded plaintext length for a packet of `len` bytes
///
/// The next multiple of [`PADDING_MULTIPLE`], except that the padded length
/// never exceeds the MTU (and never shrinks the packet).
#[must_use]
pub fn padded_len(len: usize, mtu: usize) -> usize {
    let rem = len % PADDING_MULTIPLE;
    if rem == 0 {
        len
    } else {
        (len + PADDING_MULTIPLE - rem).min(mtu.max(len))
    }
}

/// A handshake initiation message as produced by the external crypto module
///
/// The MAC fields are not part of this struct: [`MessageInitiation::serialize`]
/// leaves two zeroed 16-byte slots at the tail for the external MAC pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInitiation {
    /// Locally chosen session index the responder will echo back
    pub sender_index: u32,
    /// Unencrypted ephemeral public key
    pub ephemeral: [u8; 32],
    /// Encrypted static public key (32 bytes + tag)
    pub encrypted_static: [u8; 48],
    /// Encrypted TAI64N timestamp (12 bytes + tag)
    pub encrypted_timestamp: [u8; 28],
}

impl MessageInitiation {
    /// Byte offset of the first MAC in the serialized frame
    pub const MAC_OFFSET: usize = MESSAGE_INITIATION_SIZE - 32;

    /// Serialize to the 148-byte little-endian wire frame
    ///
    /// The two trailing MAC slots are zeroed; callers hand the frame to the
    /// external MAC pass before transmitting.
    #[must_use]
    pub fn serialize(&self) -> [u8; MESSAGE_INITIATION_SIZE] {
        let mut out = [0u8; MESSAGE_INITIATION_SIZE];
        let mut dst = &mut out[..];
        dst.put_u32_le(MESSAGE_INITIATION_TYPE);
        dst.put_u32_le(self.sender_index);
        dst.put_slice(&self.ephemeral);
        dst.put_slice(&self.encrypted_static);
        dst.put_slice(&self.encrypted_timestamp);
        out
    }
}
