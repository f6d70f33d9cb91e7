//! Per-peer timer state
//!
//! Timestamps are milliseconds relative to a per-peer monotonic epoch,
//! stored in atomics so every pipeline stage can stamp events without a
//! lock. The one piece of real coordination is
//! [`Timers::try_reserve_handshake`]: three places trigger handshake
//! initiations (the TUN reader, the nonce sequencer, the sender's
//! key-freshness check) and all of them must share one `rekey_timeout`
//! spacing, so the stamp is claimed with a compare-exchange and whichever
//! trigger site wins actually sends.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use super::Peer;

/// Sentinel for "never happened"
const NEVER: u64 = u64::MAX;

/// Atomic per-peer timer state
#[derive(Debug)]
pub struct Timers {
    /// Monotonic epoch all stamps are relative to
    epoch: Instant,
    /// When the last handshake initiation was sent (ms)
    last_sent_handshake: AtomicU64,
    /// When an authenticated packet last crossed the link (ms)
    last_traversal: AtomicU64,
    /// When data (a non-keepalive frame) was last sent (ms)
    last_data_sent: AtomicU64,
    /// Consecutive initiation attempts for the current handshake
    handshake_attempts: AtomicU32,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            last_sent_handshake: AtomicU64::new(NEVER),
            last_traversal: AtomicU64::new(NEVER),
            last_data_sent: AtomicU64::new(NEVER),
            handshake_attempts: AtomicU32::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)] // ms since epoch fits u64 for eons
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn ago(&self, stamp: &AtomicU64) -> Option<Duration> {
        match stamp.load(Ordering::Acquire) {
            NEVER => None,
            ms => Some(Duration::from_millis(self.now_ms().saturating_sub(ms))),
        }
    }

    /// Claim the right to send a handshake initiation.
    ///
    /// Returns false when one was sent less than `spacing` ago or another
    /// trigger site just won the claim; the caller must then skip sending.
    pub fn try_reserve_handshake(&self, spacing: Duration) -> bool {
        let now = self.now_ms();
        let last = self.last_sent_handshake.load(Ordering::Acquire);
        #[allow(clippy::cast_possible_truncation)]
        let spacing_ms = spacing.as_millis() as u64;
        if last != NEVER && now.saturating_sub(last) < spacing_ms {
            return false;
        }
        self.last_sent_handshake
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Reset the attempt counter for a fresh (non-retry) handshake
    pub fn reset_handshake_attempts(&self) {
        self.handshake_attempts.store(0, Ordering::Relaxed);
    }

    /// Record an initiation transmission, returning the attempt number
    pub fn note_handshake_initiated(&self) -> u32 {
        self.handshake_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record any authenticated packet crossing the link
    pub fn any_authenticated_packet_traversal(&self) {
        self.last_traversal.store(self.now_ms(), Ordering::Release);
    }

    /// Record a data (non-keepalive) transmission
    pub fn data_sent(&self) {
        self.last_data_sent.store(self.now_ms(), Ordering::Release);
    }

    /// How long ago an authenticated packet last traversed the link
    #[must_use]
    pub fn since_traversal(&self) -> Option<Duration> {
        self.ago(&self.last_traversal)
    }

    /// How long ago the last handshake initiation was sent
    #[must_use]
    pub fn since_sent_handshake(&self) -> Option<Duration> {
        self.ago(&self.last_sent_handshake)
    }

    /// How long ago data was last sent
    #[must_use]
    pub fn since_data_sent(&self) -> Option<Duration> {
        self.ago(&self.last_data_sent)
    }
}

/// Queue a keepalive whenever the link has been silent for `interval`
pub(super) async fn run_keepalive_ticker(
    peer: Arc<Peer>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick of a tokio interval fires immediately; skip it
    tick.tick().await;
    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = tick.tick() => {
                let idle = peer.timers.since_traversal().map_or(true, |ago| ago >= interval);
                if idle {
                    let _ = peer.send_keepalive();
                }
            }
        }
    }
}
