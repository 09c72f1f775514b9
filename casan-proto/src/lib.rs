//! Slave-side implementation of the CASAN association protocol
//!
//! CASAN organises constrained devices (slaves) around a master on a shared
//! layer-2 medium, typically IEEE 802.15.4. Slaves broadcast discovery
//! messages until a master answers, associate for a master-granted TTL, serve
//! CoAP-style requests against registered resources, and renew the
//! association before it lapses.
//!
//! This crate performs no I/O and spawns no threads: the application provides
//! a [`Link`] implementation for its radio and calls [`Casan::tick`] with the
//! current time from its main loop. All protocol behaviour — discovery and
//! renewal backoff, retransmission of confirmable messages, request dispatch
//! and observe notifications — happens inside `tick`.

#![warn(missing_docs)]

mod coding;
mod config;
mod engine;
mod link;
mod message;
mod option;
mod resource;
mod retransmit;
mod timer;
mod token;

pub use config::Config;
pub use engine::{Casan, SlaveState, CASAN_NAMESPACE, RESOURCES_ALL};
pub use link::{Link, RecvStatus};
pub use message::{Code, DecodeError, EncodeError, Message, MsgType};
pub use option::{CoapOption, OptionCode, OptionError, OptionFormat, CF_TEXT_PLAIN};
pub use resource::{Handler, Observer, Resource};
pub use timer::{Clock, DiscoveryTimer, RenewalTimer, Timestamp};
pub use token::{Token, MAX_TOKEN_LEN};
