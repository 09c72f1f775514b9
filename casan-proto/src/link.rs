//! Abstraction over the layer-2 network the engine runs on
//!
//! The reference medium is IEEE 802.15.4, but the engine only needs framed
//! datagram send/receive with addressing and an MTU, so anything with those
//! properties can implement [`Link`].

use std::fmt;

/// Outcome of polling the link for a frame
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RecvStatus {
    /// Nothing pending
    Empty,
    /// A frame arrived but is not a protocol frame; ignore it
    WrongType,
    /// A frame arrived but was addressed to someone else; ignore it
    WrongDest,
    /// A protocol frame arrived but the hardware cut it short
    ///
    /// Holds whatever prefix was captured; the fixed header and token are
    /// usually intact and allow the peer to be told the frame was too big.
    Truncated(Vec<u8>),
    /// A complete protocol frame
    Received(Vec<u8>),
}

/// A layer-2 interface as seen by the engine
///
/// Implementations are polled, never blocking: `recv` returns
/// [`RecvStatus::Empty`] immediately when nothing is pending.
pub trait Link {
    /// Layer-2 address type
    type Addr: Clone + Eq + fmt::Debug;

    /// Transmit one frame to `dest`; returns whether the hardware accepted it
    fn send(&mut self, dest: &Self::Addr, data: &[u8]) -> bool;

    /// Poll for one incoming frame
    fn recv(&mut self) -> RecvStatus;

    /// Source address of the most recently received frame
    ///
    /// Only meaningful directly after `recv` returned a frame.
    fn source(&self) -> Self::Addr;

    /// Current maximum frame payload in bytes
    fn mtu(&self) -> usize;

    /// Lower (or restore) the MTU, e.g. after negotiation with a master
    ///
    /// Implementations clamp to what the hardware supports.
    fn set_mtu(&mut self, mtu: usize);

    /// The broadcast address of the medium
    fn broadcast(&self) -> Self::Addr;
}
