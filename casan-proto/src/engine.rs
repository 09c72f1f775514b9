//! The slave-side association engine
//!
//! [`Casan`] is driven entirely by [`tick`](Casan::tick): each call polls the
//! link for one frame, runs the association state machine, fires due timers
//! and retransmissions, and sends whatever is needed. It holds no threads and
//! reads no clocks; the application supplies time.

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::link::{Link, RecvStatus};
use crate::message::{Code, Message, MsgType};
use crate::option::{CoapOption, OptionCode, CF_TEXT_PLAIN};
use crate::resource::Resource;
use crate::retransmit::RetransmitQueue;
use crate::timer::{DiscoveryTimer, RenewalTimer, Timestamp};

/// Path under which all control messages are exchanged
pub const CASAN_NAMESPACE: [&str; 2] = [".well-known", "casan"];

/// Name of the aggregate resource listing
pub const RESOURCES_ALL: &str = "resources";

/// Milliseconds per TTL unit carried in association requests
pub(crate) const TTL_UNIT: u64 = 50;

/// Association state of the slave
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SlaveState {
    /// Powered up, nothing sent yet
    ColdStart,
    /// Broadcasting discovery, no master heard
    WaitingUnknown,
    /// A master answered; discovery now directed at it
    WaitingKnown,
    /// Associated and serving requests
    Running,
    /// Associated but past the TTL half-life, probing for renewal
    Renewing,
}

/// The protocol engine for one slave on one link
pub struct Casan<L: Link> {
    link: L,
    slave_id: u64,
    state: SlaveState,
    master: Option<L::Addr>,
    hello_id: Option<u64>,
    /// MTU ceiling: min of the link's and the configured cap
    default_mtu: usize,
    /// MTU in force, possibly lowered by the master
    cur_mtu: usize,
    slave_ttl: u64,
    next_id: u16,
    discovery: Option<DiscoveryTimer>,
    renewal: Option<RenewalTimer>,
    retransmit: RetransmitQueue,
    resources: Vec<Resource>,
    rng: StdRng,
}

impl<L: Link> Casan<L> {
    /// Create an engine over `link`; nothing is sent until the first tick
    pub fn new(mut link: L, config: Config) -> Self {
        let link_mtu = link.mtu();
        let default_mtu = match config.mtu {
            Some(mtu) if mtu > 0 && mtu < link_mtu => mtu,
            _ => link_mtu,
        };
        link.set_mtu(default_mtu);
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            link,
            slave_id: config.slave_id,
            state: SlaveState::ColdStart,
            master: None,
            hello_id: None,
            default_mtu,
            cur_mtu: default_mtu,
            slave_ttl: 0,
            next_id: 1,
            discovery: None,
            renewal: None,
            retransmit: RetransmitQueue::default(),
            resources: Vec::new(),
            rng,
        }
    }

    /// Current association state
    pub fn state(&self) -> SlaveState {
        self.state
    }

    /// Address of the current master, if one is known
    pub fn master(&self) -> Option<&L::Addr> {
        self.master.as_ref()
    }

    /// MTU currently in force
    pub fn mtu(&self) -> usize {
        self.cur_mtu
    }

    /// Association TTL granted by the master, in milliseconds
    pub fn ttl(&self) -> u64 {
        self.slave_ttl
    }

    /// The underlying link
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The underlying link, mutably
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Expose a resource; it appears in the aggregate listing immediately
    pub fn register_resource(&mut self, resource: Resource) {
        self.resources.push(resource);
    }

    /// A registered resource, by name
    pub fn resource_mut(&mut self, name: &str) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.name() == name)
    }

    /// Forget the master and any association, returning to cold start
    pub fn reset(&mut self) {
        self.reset_master();
        self.discovery = None;
        self.renewal = None;
        self.state = SlaveState::ColdStart;
        for res in &mut self.resources {
            res.set_observed(false, None);
        }
    }

    /// Advance the engine to `now`
    ///
    /// Call frequently (each main-loop iteration). `now` must never go
    /// backwards; use [`Clock`](crate::Clock) to widen a wrapping hardware
    /// counter.
    pub fn tick(&mut self, now: Timestamp) {
        self.drive_retransmissions(now);

        let incoming = match self.link.recv() {
            RecvStatus::Empty | RecvStatus::WrongType | RecvStatus::WrongDest => None,
            RecvStatus::Received(data) => match Message::decode(&data, false) {
                Ok(msg) => Some((msg, false)),
                Err(e) => {
                    debug!(%e, "discarding undecodable frame");
                    None
                }
            },
            RecvStatus::Truncated(data) => match Message::decode(&data, true) {
                Ok(msg) => Some((msg, true)),
                Err(e) => {
                    debug!(%e, "discarding truncated frame");
                    None
                }
            },
        };

        match self.state {
            SlaveState::ColdStart => {
                self.send_discover(now);
                self.discovery = Some(DiscoveryTimer::start(now));
                self.state = SlaveState::WaitingUnknown;
                trace!("started discovery");
            }
            SlaveState::WaitingUnknown | SlaveState::WaitingKnown => {
                self.waiting_tick(now, incoming)
            }
            SlaveState::Running | SlaveState::Renewing => self.running_tick(now, incoming),
        }
    }

    fn waiting_tick(&mut self, now: Timestamp, incoming: Option<(Message, bool)>) {
        if let Some((msg, truncated)) = incoming {
            // a truncated control message is useless; wait for the next one
            if !truncated {
                self.handle_waiting_msg(now, &msg);
            }
        }

        match self.state {
            SlaveState::WaitingUnknown => {
                let due = self.discovery.as_mut().map_or(false, |t| t.due(now));
                if due {
                    self.send_discover(now);
                }
            }
            SlaveState::WaitingKnown => {
                let expired = self.discovery.as_ref().map_or(false, |t| t.expired(now));
                if expired {
                    debug!("master went silent, resuming broadcast discovery");
                    self.reset_master();
                    self.discovery = Some(DiscoveryTimer::start(now));
                    self.state = SlaveState::WaitingUnknown;
                    self.send_discover(now);
                } else {
                    let due = self.discovery.as_mut().map_or(false, |t| t.due(now));
                    if due {
                        self.send_discover(now);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_waiting_msg(&mut self, now: Timestamp, msg: &Message) {
        if msg.ty() == MsgType::Ack {
            self.retransmit.acknowledge(msg.id());
        }
        if !is_control(msg) {
            trace!("ignoring non-control message while unassociated");
            return;
        }
        if let Some(hlid) = hello_id(msg) {
            let src = self.link.source();
            self.adopt_master(src, Some(hlid), None);
            if self.state == SlaveState::WaitingUnknown {
                self.discovery = Some(DiscoveryTimer::start(now));
                self.state = SlaveState::WaitingKnown;
                debug!(hello = hlid, "master heard, directing discovery at it");
            }
        } else if let Some((ttl, mtu)) = assoc_params(msg) {
            let src = self.link.source();
            self.slave_ttl = ttl;
            self.adopt_master(src, None, Some(mtu));
            self.send_assoc_answer(msg.id(), now);
            self.renewal = Some(RenewalTimer::start(now, ttl));
            self.discovery = None;
            self.state = SlaveState::Running;
            debug!(ttl, mtu = self.cur_mtu, "associated");
        }
    }

    fn running_tick(&mut self, now: Timestamp, incoming: Option<(Message, bool)>) {
        match incoming {
            Some((msg, false)) => self.handle_running_msg(now, &msg),
            Some((msg, true)) => self.reject_truncated(&msg, now),
            None => {}
        }

        self.check_observed(now);

        match self.state {
            SlaveState::Running => {
                let due = self.renewal.as_mut().map_or(false, |t| t.due(now));
                if due {
                    self.send_discover(now);
                    self.state = SlaveState::Renewing;
                    debug!("association past half-life, renewing");
                }
            }
            SlaveState::Renewing => {
                let expired = self.renewal.as_ref().map_or(false, |t| t.expired(now));
                if expired {
                    debug!("association expired");
                    self.reset_master();
                    self.renewal = None;
                    self.discovery = Some(DiscoveryTimer::start(now));
                    self.state = SlaveState::WaitingUnknown;
                    self.send_discover(now);
                } else {
                    let due = self.renewal.as_mut().map_or(false, |t| t.due(now));
                    if due {
                        self.send_discover(now);
                    }
                }
            }
            _ => {}
        }
    }

    fn handle_running_msg(&mut self, now: Timestamp, msg: &Message) {
        if msg.ty() == MsgType::Ack && self.retransmit.acknowledge(msg.id()) {
            trace!(id = msg.id(), "acknowledged");
        }
        if is_control(msg) {
            if let Some(hlid) = hello_id(msg) {
                let src = self.link.source();
                let known = self.master.as_ref() == Some(&src) && self.hello_id == Some(hlid);
                if !known {
                    // a fresh hello id means the master rebooted and lost us
                    debug!(hello = hlid, "master changed or rebooted");
                    let prev_hello = self.hello_id;
                    self.adopt_master(src, Some(hlid), Some(0));
                    if prev_hello.is_some() {
                        self.retransmit.flush();
                        self.renewal = None;
                        self.discovery = Some(DiscoveryTimer::start(now));
                        self.state = SlaveState::WaitingKnown;
                        self.send_discover(now);
                    }
                }
            } else if let Some((ttl, mtu)) = assoc_params(msg) {
                let src = self.link.source();
                // only the associated master may renegotiate
                if self.master.as_ref() != Some(&src) {
                    debug!(src = ?src, "ignoring association from a foreign master");
                    return;
                }
                self.slave_ttl = ttl;
                self.adopt_master(src, None, Some(mtu));
                self.send_assoc_answer(msg.id(), now);
                self.renewal = Some(RenewalTimer::start(now, ttl));
                self.state = SlaveState::Running;
                debug!(ttl, "association renewed");
            }
            return;
        }
        if msg.code().is_method() {
            self.process_request(msg, now);
        }
    }

    fn process_request(&mut self, req: &Message, now: Timestamp) {
        let mut out = Message::new();
        out.set_type(MsgType::Ack);
        out.set_id(req.id());
        out.set_token(req.token());

        let path: Vec<&CoapOption> = req.options_with(OptionCode::URI_PATH).collect();
        let name = match path.as_slice() {
            [single] => single.value_str(),
            _ => None,
        };

        let code = match name {
            Some(RESOURCES_ALL) => {
                self.fill_well_known(&mut out);
                Code::CONTENT
            }
            Some(name) => match self.resources.iter().position(|r| r.name() == name) {
                None => Code::NOT_FOUND,
                Some(idx) => {
                    if req.code() == Code::GET {
                        self.handle_observe(idx, req, &mut out);
                    }
                    self.invoke_handler(idx, Some(req), &mut out)
                }
            },
            None => Code::NOT_FOUND,
        };
        out.set_code(code);

        let dest = self.link.source();
        self.transmit(out, &dest, now);
    }

    /// Register or cancel an observation per the request's Observe option
    fn handle_observe(&mut self, idx: usize, req: &Message, out: &mut Message) {
        let Some(obs) = req.search_option(OptionCode::OBSERVE) else {
            return;
        };
        match obs.uint_value() {
            0 => {
                self.resources[idx].set_observed(true, Some(req));
                if self.resources[idx].observed() {
                    // serial 1 goes to the registration answer; notifications
                    // continue from 2
                    out.push_option(CoapOption::raw_uint(OptionCode::OBSERVE, 1));
                }
            }
            1 => self.resources[idx].set_observed(false, None),
            other => trace!(value = other, "ignoring unknown observe value"),
        }
    }

    fn invoke_handler(&mut self, idx: usize, req: Option<&Message>, out: &mut Message) -> Code {
        let method = req.map(Message::code).unwrap_or(Code::GET);
        match self.resources[idx].handler_mut(method) {
            None => Code::BAD_REQUEST,
            Some(handler) => {
                out.set_content_format(false, CF_TEXT_PLAIN);
                handler.handle(req, out)
            }
        }
    }

    /// Send notifications for every observed resource whose observer fired
    fn check_observed(&mut self, now: Timestamp) {
        let Some(master) = self.master.clone() else {
            return;
        };
        for idx in 0..self.resources.len() {
            if !self.resources[idx].check_trigger() {
                continue;
            }
            let mut out = Message::new();
            out.set_type(MsgType::Ack);
            out.set_id(self.next_msg_id());
            out.set_token(self.resources[idx].obs_token());
            let serial = self.resources[idx].next_serial();
            out.push_option(CoapOption::raw_uint(OptionCode::OBSERVE, u64::from(serial)));
            let code = self.invoke_handler(idx, None, &mut out);
            out.set_code(code);
            trace!(serial, "sending observe notification");
            self.transmit(out, &master, now);
        }
    }

    /// Answer an association request with the aggregate resource listing
    fn send_assoc_answer(&mut self, req_id: u16, now: Timestamp) {
        let mut out = Message::new();
        out.set_type(MsgType::Ack);
        out.set_code(Code::CONTENT);
        out.set_id(req_id);
        self.fill_well_known(&mut out);
        let dest = self.link.source();
        self.transmit(out, &dest, now);
    }

    /// Fill `out` with the comma-joined resource descriptors, up to the MTU
    fn fill_well_known(&self, out: &mut Message) {
        out.set_content_format(true, CF_TEXT_PLAIN);
        let avail = out.avail_space(self.cur_mtu);
        let mut listing = String::new();
        for res in &self.resources {
            let desc = res.well_known();
            let extra = desc.len() + usize::from(!listing.is_empty());
            if listing.len() + extra > avail {
                warn!(resource = res.name(), "resource listing truncated at MTU");
                break;
            }
            if !listing.is_empty() {
                listing.push(',');
            }
            listing.push_str(&desc);
        }
        out.set_payload(listing.into_bytes());
    }

    fn send_discover(&mut self, now: Timestamp) {
        let mut msg = Message::new();
        msg.set_type(MsgType::Non);
        msg.set_code(Code::POST);
        msg.set_id(self.next_msg_id());
        for seg in CASAN_NAMESPACE {
            msg.push_option(CoapOption::raw(OptionCode::URI_PATH, seg.as_bytes()));
        }
        msg.push_option(CoapOption::raw(
            OptionCode::URI_QUERY,
            format!("slave={}", self.slave_id).as_bytes(),
        ));
        msg.push_option(CoapOption::raw(
            OptionCode::URI_QUERY,
            format!("mtu={}", self.default_mtu).as_bytes(),
        ));
        let dest = match self.master.clone() {
            Some(addr) => addr,
            None => self.link.broadcast(),
        };
        trace!(dest = ?dest, "sending discovery");
        self.transmit(msg, &dest, now);
    }

    /// Reply to a frame the hardware cut short, telling the peer our limit
    fn reject_truncated(&mut self, msg: &Message, now: Timestamp) {
        warn!(id = msg.id(), "frame exceeded MTU, rejecting");
        let mut out = Message::new();
        out.set_type(MsgType::Ack);
        out.set_code(Code::TOO_LARGE);
        out.set_id(msg.id());
        out.set_token(msg.token());
        out.push_option(CoapOption::raw_uint(
            OptionCode::SIZE1,
            self.cur_mtu as u64,
        ));
        let dest = self.link.source();
        self.transmit(out, &dest, now);
    }

    /// Encode, send, and queue confirmables for retransmission
    fn transmit(&mut self, mut msg: Message, dest: &L::Addr, now: Timestamp) {
        let data = match msg.encoded(self.cur_mtu) {
            Ok(data) => data,
            Err(e) => {
                warn!(%e, "dropping oversized message");
                return;
            }
        };
        if !self.link.send(dest, data) {
            warn!("link refused frame");
        }
        if msg.ty() == MsgType::Con {
            self.retransmit.enqueue(msg, now, &mut self.rng);
        }
    }

    /// Resend due confirmables; exhausted ones are dropped by the queue
    fn drive_retransmissions(&mut self, now: Timestamp) {
        let Some(master) = self.master.clone() else {
            self.retransmit.flush();
            return;
        };
        while let Some(entry) = self.retransmit.next_due(now) {
            // advance the schedule before sending so a link stall cannot
            // loop on the same entry
            entry.record_send(now);
            let attempt = entry.attempts;
            match entry.msg.encoded(self.cur_mtu) {
                Ok(data) => {
                    trace!(attempt, "retransmitting");
                    if !self.link.send(&master, data) {
                        warn!("link refused retransmission");
                    }
                }
                // enqueued messages already encoded once; unreachable
                Err(e) => warn!(%e, "dropping unencodable retransmission"),
            }
        }
    }

    /// Record a master; `None` for hello id or MTU means "no change"
    fn adopt_master(&mut self, addr: L::Addr, hello: Option<u64>, mtu: Option<usize>) {
        match &self.master {
            Some(cur) if *cur == addr => {}
            _ => {
                debug!(master = ?addr, "adopting master");
                self.master = Some(addr);
            }
        }
        if hello.is_some() {
            self.hello_id = hello;
        }
        if let Some(mtu) = mtu {
            self.negotiate_mtu(mtu);
        }
    }

    /// Apply a master-proposed MTU; 0 or out-of-range restores the default
    fn negotiate_mtu(&mut self, mtu: usize) {
        let mtu = if mtu == 0 || mtu > self.default_mtu {
            self.default_mtu
        } else {
            mtu
        };
        self.cur_mtu = mtu;
        self.link.set_mtu(mtu);
    }

    fn reset_master(&mut self) {
        if self.master.is_some() {
            debug!("forgetting master");
        }
        self.master = None;
        self.hello_id = None;
        self.retransmit.flush();
        self.negotiate_mtu(0);
    }

    fn next_msg_id(&mut self) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }
}

/// Whether a message is addressed to the control namespace
///
/// True only when the Uri-Path options are exactly the namespace segments,
/// in order, with nothing extra.
pub(crate) fn is_control(msg: &Message) -> bool {
    let mut segs = msg.options_with(OptionCode::URI_PATH);
    for expected in CASAN_NAMESPACE {
        match segs.next() {
            Some(opt) if opt.value() == expected.as_bytes() => {}
            _ => return false,
        }
    }
    segs.next().is_none()
}

/// Value of the first `key=<number>` Uri-Query option
fn query_param(msg: &Message, key: &str) -> Option<u64> {
    msg.options_with(OptionCode::URI_QUERY).find_map(|opt| {
        let s = opt.value_str()?;
        s.strip_prefix(key)?.strip_prefix('=')?.parse().ok()
    })
}

/// Hello id of a control message, if it is a hello
pub(crate) fn hello_id(msg: &Message) -> Option<u64> {
    if msg.ty() != MsgType::Non || msg.code() != Code::POST {
        return None;
    }
    query_param(msg, "hello")
}

/// TTL (in ms) and MTU of a control message, if it is an assoc request
///
/// Both parameters are required; the TTL on the wire counts 50 ms units.
pub(crate) fn assoc_params(msg: &Message) -> Option<(u64, usize)> {
    if msg.ty() != MsgType::Con || msg.code() != Code::POST {
        return None;
    }
    let ttl = query_param(msg, "ttl")?;
    let mtu = query_param(msg, "mtu")?;
    Some((ttl * TTL_UNIT, mtu as usize))
}
