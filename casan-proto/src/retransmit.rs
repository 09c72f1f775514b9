//! Retransmission of confirmable messages
//!
//! Schedule per RFC 7252 §4.2: the first retransmission happens a uniformly
//! random 2 to 3 seconds after the original send, and the interval doubles
//! on each attempt up to [`MAX_RETRANSMIT`] retransmissions.

use rand::Rng;
use tracing::debug;

use crate::message::Message;
use crate::timer::Timestamp;

/// Lower bound on the initial retransmission delay, in ms
const ACK_TIMEOUT: u64 = 2_000;
/// Upper bound on the initial retransmission delay (ACK_TIMEOUT times the
/// 1.5 random factor), in ms
const ACK_TIMEOUT_MAX: u64 = 3_000;
/// Retransmissions of one message (beyond the initial send) before giving up
const MAX_RETRANSMIT: u8 = 4;

/// One confirmable message awaiting acknowledgement
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) msg: Message,
    last: Timestamp,
    next: Timestamp,
    pub(crate) attempts: u8,
}

impl Entry {
    /// Account for a (re)send at `now` and double the interval
    ///
    /// The doubled interval is anchored on `now`, not on the missed
    /// deadline, so an entry fires at most once per tick even after the
    /// device stalled past several deadlines.
    pub(crate) fn record_send(&mut self, now: Timestamp) {
        self.attempts += 1;
        let interval = self.next.saturating_since(self.last);
        self.next = now + 2 * interval;
        self.last = now;
    }
}

/// Pending confirmable messages, polled by the engine each tick
#[derive(Debug, Default)]
pub(crate) struct RetransmitQueue {
    entries: Vec<Entry>,
}

impl RetransmitQueue {
    /// Queue a just-sent confirmable message for retransmission
    pub(crate) fn enqueue(&mut self, msg: Message, now: Timestamp, rng: &mut impl Rng) {
        let delay = rng.gen_range(ACK_TIMEOUT..=ACK_TIMEOUT_MAX);
        self.entries.push(Entry {
            msg,
            last: now,
            next: now + delay,
            attempts: 0,
        });
    }

    /// Drop the entry matching an acknowledged message id
    ///
    /// Matching considers the id only, not the token; an acknowledgement
    /// echoes the id, and ids are not reused while an entry is pending.
    pub(crate) fn acknowledge(&mut self, id: u16) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.msg.id() != id);
        before != self.entries.len()
    }

    /// Drop everything, e.g. when the master is lost
    pub(crate) fn flush(&mut self) {
        self.entries.clear();
    }

    /// Next entry whose retransmission is due, after expiring exhausted ones
    pub(crate) fn next_due(&mut self, now: Timestamp) -> Option<&mut Entry> {
        self.entries.retain(|e| {
            if e.attempts >= MAX_RETRANSMIT {
                debug!(id = e.msg.id(), "giving up on unacknowledged message");
                return false;
            }
            true
        });
        let idx = self.entries.iter().position(|e| now >= e.next)?;
        Some(&mut self.entries[idx])
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
