//! Handshake-initiation trigger and rekey freshness
//!
//! Initiations are triggered from three places: the TUN reader when it sees
//! a peer stalled on `awaiting_key`, the nonce sequencer when it cannot get
//! a usable keypair, and the sender's post-transmit freshness check. All
//! three funnel through [`Peer::send_handshake_initiation`], which enforces
//! the shared `rekey_timeout` spacing.

use tracing::debug;

use super::Peer;
use crate::error::TunnelError;

impl Peer {
    /// Send a handshake initiation to the peer's endpoint.
    ///
    /// A no-op when an initiation was sent less than `rekey_timeout` ago
    /// (or another trigger site is sending concurrently). `is_retry` keeps
    /// the attempt counter running instead of restarting it.
    pub async fn send_handshake_initiation(&self, is_retry: bool) -> Result<(), TunnelError> {
        if !is_retry {
            self.timers.reset_handshake_attempts();
        }

        if !self.timers.try_reserve_handshake(self.rekey.rekey_timeout) {
            return Ok(());
        }

        let message = self.handshake.create_initiation()?;

        debug!(peer = %self, "sending handshake initiation");

        let mut packet = message.serialize();
        self.handshake.add_macs(&mut packet);

        self.timers.any_authenticated_packet_traversal();
        let attempt = self.timers.note_handshake_initiated();
        if is_retry && attempt > 1 {
            debug!(peer = %self, attempt, "handshake retransmission");
        }
        self.stats
            .handshake_initiations
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        self.send_buffer(&packet).await?;
        Ok(())
    }

    /// Initiate a rekey if the current keypair is wearing out.
    ///
    /// Called after every authenticated transmission. Only initiator-side
    /// keypairs rekey from the send path; responders wait for the remote
    /// initiator.
    pub(crate) async fn keep_key_fresh_sending(&self) {
        let Some(keypair) = self.keypairs.current() else {
            return;
        };
        if !keypair.is_initiator {
            return;
        }
        let nonce = keypair
            .send_nonce
            .load(std::sync::atomic::Ordering::Relaxed);
        let stale = nonce > self.rekey.rekey_after_messages
            || keypair.created.elapsed() > self.rekey.rekey_after_time;
        if stale {
            if let Err(e) = self.send_handshake_initiation(false).await {
                debug!(peer = %self, error = %e, "rekey initiation failed");
            }
        }
    }
}
