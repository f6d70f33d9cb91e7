//! Session keypairs and the handshake-crypto contract
//!
//! The Noise_IK handshake itself lives outside this crate. Two seams connect
//! it to the data plane:
//!
//! - [`KeypairStore`]: where the handshake subsystem installs the current
//!   send-side session key. Installation goes through
//!   [`crate::peer::Peer::keypair_installed`] so the stalled nonce sequencer
//!   is woken.
//! - [`HandshakeCrypto`]: produces initiation message bodies and appends the
//!   two cookie MACs to serialized handshake frames.
//!
//! The sealing operation is in-crate: transport encryption is the data
//! plane's job and must be bit-exact (ChaCha20-Poly1305, empty associated
//! data, nonce = 4 zero bytes then the little-endian counter).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use chacha20poly1305::aead::AeadInPlace;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};

use crate::config::RekeyConfig;
use crate::error::NoiseError;
use crate::wire::{self, MessageInitiation};

/// A send-direction session key produced by a completed handshake.
///
/// The inbound half of a session is the receive path's concern and is not
/// represented here.
pub struct Keypair {
    /// Sealing cipher
    send: ChaCha20Poly1305,
    /// Next transport counter; fetch-add only
    pub send_nonce: AtomicU64,
    /// When the handshake that produced this keypair completed
    pub created: Instant,
    /// Whether the local side initiated the handshake
    pub is_initiator: bool,
    /// Session index assigned by the remote peer, echoed in every header
    pub remote_index: u32,
}

impl Keypair {
    /// Create a keypair from a 32-byte send key
    #[must_use]
    pub fn new(send_key: [u8; 32], is_initiator: bool, remote_index: u32) -> Self {
        Self {
            send: ChaCha20Poly1305::new(Key::from_slice(&send_key)),
            send_nonce: AtomicU64::new(0),
            created: Instant::now(),
            is_initiator,
            remote_index,
        }
    }

    /// Whether this keypair may still seal packets.
    ///
    /// True iff the counter has not reached `reject_after_messages` and the
    /// session is younger than `reject_after_time`.
    #[must_use]
    pub fn usable_for_sending(&self, rekey: &RekeyConfig) -> bool {
        self.send_nonce.load(Ordering::Relaxed) < rekey.reject_after_messages
            && self.created.elapsed() < rekey.reject_after_time
    }

    /// Atomically allocate the next transport counter
    #[must_use]
    pub fn next_send_nonce(&self) -> u64 {
        self.send_nonce.fetch_add(1, Ordering::Relaxed)
    }

    /// Seal a padded plaintext in place under the given counter.
    ///
    /// Associated data is empty. Returns the 16-byte tag the caller appends
    /// after the ciphertext.
    ///
    /// # Panics
    ///
    /// Sealing only fails for over-length plaintexts, which the pipeline
    /// rejects long before this point; a failure here is a programming error.
    #[must_use]
    pub fn seal_transport(&self, counter: u64, plaintext: &mut [u8]) -> Tag {
        let nonce = wire::transport_nonce(counter);
        self.send
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), &[], plaintext)
            .expect("in-range plaintext cannot fail to seal")
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("send_nonce", &self.send_nonce.load(Ordering::Relaxed))
            .field("is_initiator", &self.is_initiator)
            .field("remote_index", &self.remote_index)
            .finish_non_exhaustive()
    }
}

/// Holder of the current send-side keypair for one peer.
///
/// Reads are lock-free; the handshake subsystem swaps in new keypairs as
/// sessions complete.
#[derive(Debug, Default)]
pub struct KeypairStore {
    current: ArcSwapOption<Keypair>,
}

impl KeypairStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
        }
    }

    /// The current keypair, if any
    #[must_use]
    pub fn current(&self) -> Option<Arc<Keypair>> {
        self.current.load_full()
    }

    /// Install a new current keypair
    pub fn install(&self, keypair: Arc<Keypair>) {
        self.current.store(Some(keypair));
    }

    /// Drop the current keypair
    pub fn clear(&self) {
        self.current.store(None);
    }
}

/// Contract to the external Noise_IK handshake module.
///
/// One instance per peer; implementations own the static keys, ephemeral
/// generation, and cookie state.
pub trait HandshakeCrypto: Send + Sync {
    /// Produce a fresh handshake-initiation message body
    fn create_initiation(&self) -> Result<MessageInitiation, NoiseError>;

    /// Append the two cookie MACs to a serialized handshake frame
    fn add_macs(&self, packet: &mut [u8]);
}
