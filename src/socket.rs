//! The per-connection state machine.
//!
//! A socket is driven by three asynchronous inputs: datagrams routed to it
//! by the demultiplexer, signals from the signalling channel, and bytes
//! from the application channel. Timers add NAT keepalives and punch
//! retransmissions. Everything is dispatched by the event core, one
//! callback at a time.
//!
//! Connection establishment:
//!
//! * An active socket sends a Request signal carrying its reflexive
//!   endpoint and waits for the Response carrying the peer's.
//! * A listening socket answers each Request by cloning a child socket
//!   that shares its UDP socket, demultiplexer and STUN client.
//! * Both sides then transmit PUNCH until a PUNCH arrives (moving them to
//!   THRU), transmit THRU until a THRU arrives (moving them to
//!   ESTABLISHED). The first datagram through each NAT opens its binding
//!   for the rest of the connection.
//!
//! Termination mirrors TCP and is represented in [`State`], but only the
//! establishment half is exercised here; `close` tears the socket down
//! directly.

use crate::{
    config,
    demux::{Demux, DemuxId},
    engine::{PassthroughEngine, Segment, StreamEngine},
    error::Error,
    event::{CallbackId, EventCore, INVOKE_IMMEDIATELY, SUSPEND},
    net::{Pair, UdpLink},
    signalling::{AtpAddr, SignallingSocket},
    stun::NatResolver,
};

use std::{
    collections::VecDeque,
    net::SocketAddrV4,
    sync::{Arc, Weak},
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use bytes::{Bytes, BytesMut};
use codec::{
    frame::{self, Control, Header},
    signal::{Kind, Signal},
};
use parking_lot::Mutex;

pub(crate) type SocketRef = Arc<Mutex<SocketCore>>;

/// Connection states. The group from CLOSE_WAIT down mirrors TCP
/// termination and is carried at the interface level only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Listen,
    Punch,
    Thru,
    Established,
    CloseWait,
    LastAck,
    FinWait1,
    FinWait2,
    Closing,
    TimeWait,
}

/// Counters kept by a listening socket.
#[derive(Debug, Default, Clone, Copy)]
pub struct ListenerStats {
    pub sockets_accepted: u64,
    pub connections_refused: u64,
}

/// Per-socket timer overrides, settable through the context.
#[derive(Debug, Clone, Copy)]
pub enum SocketOption {
    NatKeepAliveInterval(Duration),
    PunchInterval(Duration),
    PunchTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOptionKind {
    NatKeepAliveInterval,
    PunchInterval,
    PunchTimeout,
}

/// Work that has to happen outside the socket lock, because it takes the
/// lock of a related socket. Holding two socket locks at once is never
/// allowed outside construction.
pub(crate) enum Followup {
    /// A child reached ESTABLISHED; the parent moves it from the
    /// incomplete set to the completed queue.
    Promote {
        parent: Weak<Mutex<SocketCore>>,
        endpoint: SocketAddrV4,
    },
    /// A child gave up punching; the parent forgets it.
    Detach {
        parent: Weak<Mutex<SocketCore>>,
        endpoint: SocketAddrV4,
    },
}

impl Followup {
    pub(crate) fn run(self) {
        match self {
            Followup::Promote { parent, endpoint } => {
                if let Some(parent) = parent.upgrade() {
                    parent.lock().promote(endpoint);
                }
            }
            Followup::Detach { parent, endpoint } => {
                if let Some(parent) = parent.upgrade() {
                    parent.lock().remove_incomplete(endpoint);
                }
            }
        }
    }
}

pub(crate) struct SocketCore {
    state: State,

    core: EventCore,
    link: Arc<dyn UdpLink>,
    demux: Arc<Demux>,
    resolver: Arc<dyn NatResolver>,
    signalling: Arc<dyn SignallingSocket>,

    timers: config::Timers,
    window: u16,
    max_backlog: usize,

    local_atp: Option<AtpAddr>,
    peer_atp: Option<AtpAddr>,
    peer_ip: Option<SocketAddrV4>,
    connect_pending: bool,

    /// The application-facing end of the paired channel; installed only
    /// when the state reaches ESTABLISHED.
    app_channel: Option<Pair>,
    engine_channel: Option<Pair>,
    engine: Option<Box<dyn StreamEngine>>,

    keepalive_callback: CallbackId,
    punch_callback: CallbackId,
    signalling_callback: CallbackId,
    app_callback: CallbackId,
    network_callback: DemuxId,
    wildcard_callback: DemuxId,

    seq_num: u32,
    ack_num: u32,
    punch_packets_sent: u32,

    backlog: usize,
    incomplete: HashMap<SocketAddrV4, SocketRef>,
    completed: VecDeque<SocketRef>,
    stats: ListenerStats,

    /// Only children carry a parent; the parent clears it when ownership
    /// of the child leaves it.
    parent: Weak<Mutex<SocketCore>>,
    weak_self: Weak<Mutex<SocketCore>>,
}

pub(crate) struct SocketDeps {
    pub core: EventCore,
    pub link: Arc<dyn UdpLink>,
    pub demux: Arc<Demux>,
    pub resolver: Arc<dyn NatResolver>,
    pub signalling: Arc<dyn SignallingSocket>,
    pub timers: config::Timers,
    pub window: u16,
    pub max_backlog: usize,
}

impl SocketCore {
    /// Assemble a root socket in CLOSED and start its NAT keepalive.
    pub(crate) fn create(deps: SocketDeps) -> Result<SocketRef, Error> {
        let socket = Arc::new_cyclic(|weak: &Weak<Mutex<SocketCore>>| {
            Mutex::new(SocketCore {
                state: State::Closed,
                core: deps.core.clone(),
                link: deps.link,
                demux: deps.demux,
                resolver: deps.resolver,
                signalling: deps.signalling,
                timers: deps.timers,
                window: deps.window,
                max_backlog: deps.max_backlog,
                local_atp: None,
                peer_atp: None,
                peer_ip: None,
                connect_pending: false,
                app_channel: None,
                engine_channel: None,
                engine: None,
                keepalive_callback: 0,
                punch_callback: 0,
                signalling_callback: 0,
                app_callback: 0,
                network_callback: 0,
                wildcard_callback: 0,
                seq_num: 0,
                ack_num: 0,
                punch_packets_sent: 0,
                backlog: 0,
                incomplete: HashMap::new(),
                completed: VecDeque::new(),
                stats: ListenerStats::default(),
                parent: Weak::new(),
                weak_self: weak.clone(),
            })
        });

        socket.lock().arm_keepalive()?;
        Ok(socket)
    }

    /// Keepalive runs continuously from socket creation; there is no
    /// attempt to suppress it once the connection is established.
    fn arm_keepalive(&mut self) -> Result<(), Error> {
        let weak = self.weak_self.clone();
        let id = self
            .core
            .register(None, INVOKE_IMMEDIATELY | SUSPEND, move || {
                let socket = weak.upgrade()?;
                let guard = socket.lock();
                guard.resolver.keepalive_send();
                Some(Duration::from_millis(guard.timers.nat_keepalive_ms))
            })?;

        self.keepalive_callback = id;
        self.core.resume(id)?;
        Ok(())
    }

    pub(crate) fn state(&self) -> State {
        self.state
    }

    pub(crate) fn stats(&self) -> ListenerStats {
        self.stats
    }

    pub(crate) fn peer_atp(&self) -> Option<AtpAddr> {
        self.peer_atp.clone()
    }

    pub(crate) fn app_channel(&self) -> Option<Pair> {
        self.app_channel.clone()
    }

    pub(crate) fn set_option(&mut self, option: SocketOption) -> Result<(), Error> {
        let millis = |duration: Duration| -> Result<u64, Error> {
            let millis = duration.as_millis() as u64;
            if millis == 0 { Err(Error::Inval) } else { Ok(millis) }
        };

        match option {
            SocketOption::NatKeepAliveInterval(value) => {
                self.timers.nat_keepalive_ms = millis(value)?
            }
            SocketOption::PunchInterval(value) => self.timers.punch_interval_ms = millis(value)?,
            SocketOption::PunchTimeout(value) => self.timers.punch_timeout_ms = millis(value)?,
        }

        Ok(())
    }

    pub(crate) fn option(&self, kind: SocketOptionKind) -> SocketOption {
        match kind {
            SocketOptionKind::NatKeepAliveInterval => SocketOption::NatKeepAliveInterval(
                Duration::from_millis(self.timers.nat_keepalive_ms),
            ),
            SocketOptionKind::PunchInterval => {
                SocketOption::PunchInterval(Duration::from_millis(self.timers.punch_interval_ms))
            }
            SocketOptionKind::PunchTimeout => {
                SocketOption::PunchTimeout(Duration::from_millis(self.timers.punch_timeout_ms))
            }
        }
    }

    pub(crate) fn bind(&mut self, addr: &AtpAddr) -> Result<(), Error> {
        if self.local_atp.is_some() {
            return Err(Error::AlreadySet);
        }

        self.signalling.bind(addr)?;
        self.local_atp = Some(addr.clone());
        Ok(())
    }

    pub(crate) fn listen(&mut self, backlog: usize) -> Result<(), Error> {
        if self.state != State::Closed || self.connect_pending {
            return Err(Error::AlreadySet);
        }

        if self.local_atp.is_none() {
            return Err(Error::NotBound);
        }

        if backlog == 0 || backlog > self.max_backlog {
            return Err(Error::Inval);
        }

        let weak = self.weak_self.clone();
        let signalling_callback =
            self.core
                .register(Some(self.signalling.readiness()), SUSPEND, move || {
                    if let Some(socket) = weak.upgrade() {
                        socket.lock().drain_listen_signals();
                    }
                    None
                })?;

        let wildcard_callback = match self.demux.register_wildcard(Box::new(|source, bytes| {
            // A peer may start punching before its Request has been
            // consumed here; there is no child yet, so the datagram can
            // only be noted and dropped.
            if frame::is_segment(bytes) {
                log::trace!("datagram from unknown peer {} dropped", source);
            } else {
                log::warn!("dropping non-atp datagram from {}", source);
            }
        })) {
            Ok(id) => id,
            Err(cause) => {
                let _ = self.core.delete(signalling_callback);
                return Err(cause);
            }
        };

        // Anything queued before the listen belongs to nobody.
        let mut buf = [0u8; 64];
        while self.signalling.try_recv(&mut buf).is_ok() {}

        self.signalling_callback = signalling_callback;
        self.wildcard_callback = wildcard_callback;
        self.backlog = backlog;
        self.state = State::Listen;

        self.core.resume(signalling_callback)?;
        Ok(())
    }

    fn drain_listen_signals(&mut self) {
        // The callback may have been checked out just as the listener was
        // closed; there is nothing left to do then.
        if self.state != State::Listen {
            return;
        }

        loop {
            let mut buf = [0u8; 64];
            match self.signalling.try_recv(&mut buf) {
                Ok((size, source)) => self.handle_listen_signal(&buf[..size], source),
                Err(Error::WouldBlock) => break,
                Err(cause) => {
                    log::warn!("signalling receive failed: {}", cause);
                    break;
                }
            }
        }
    }

    fn handle_listen_signal(&mut self, bytes: &[u8], source: AtpAddr) {
        let signal = match Signal::decode(bytes) {
            Ok(signal) => signal,
            Err(cause) => {
                log::warn!("dropping malformed signal from {}: {}", source, cause);
                return;
            }
        };

        if signal.kind != Kind::Request {
            log::warn!("dropping unexpected {:?} signal from {}", signal.kind, source);
            return;
        }

        let Some(reflexive) = self.resolver.reflexive_address() else {
            log::warn!("no reflexive address to answer {} with", source);
            return;
        };

        if self.incomplete.contains_key(&signal.endpoint) {
            // The requester retries; answer again, the child is already
            // punching.
            log::debug!("duplicate connection request from {}", source);
            self.send_signal(Signal::response(reflexive), &source);
            return;
        }

        if self.incomplete.len() + self.completed.len() >= self.backlog {
            log::warn!("refusing connection from {}: backlog full", source);
            self.stats.connections_refused += 1;
            return;
        }

        let child = match self.clone_to_accept(signal.endpoint, source.clone()) {
            Ok(child) => child,
            Err(cause) => {
                log::warn!("failed to clone socket for {}: {}", source, cause);
                return;
            }
        };

        self.incomplete.insert(signal.endpoint, child);
        log::debug!(
            "connection request from {} ({}), punching",
            source,
            signal.endpoint
        );

        self.send_signal(Signal::response(reflexive), &source);
    }

    /// Clone a child in PUNCH sharing this socket's UDP socket,
    /// demultiplexer and STUN client.
    fn clone_to_accept(&mut self, peer_ip: SocketAddrV4, peer_atp: AtpAddr) -> Result<SocketRef, Error> {
        let child = Arc::new_cyclic(|weak: &Weak<Mutex<SocketCore>>| {
            Mutex::new(SocketCore {
                state: State::Punch,
                core: self.core.clone(),
                link: self.link.clone(),
                demux: self.demux.clone(),
                resolver: self.resolver.clone(),
                signalling: self.signalling.clone(),
                timers: self.timers,
                window: self.window,
                max_backlog: self.max_backlog,
                local_atp: self.local_atp.clone(),
                peer_atp: Some(peer_atp),
                peer_ip: Some(peer_ip),
                connect_pending: false,
                app_channel: None,
                engine_channel: None,
                engine: None,
                keepalive_callback: 0,
                punch_callback: 0,
                signalling_callback: 0,
                app_callback: 0,
                network_callback: 0,
                wildcard_callback: 0,
                seq_num: 0,
                ack_num: 0,
                punch_packets_sent: 0,
                backlog: 0,
                incomplete: HashMap::new(),
                completed: VecDeque::new(),
                stats: ListenerStats::default(),
                parent: self.weak_self.clone(),
                weak_self: weak.clone(),
            })
        });

        // The child lock is uncontended here: no other reference exists
        // until it lands in the incomplete set.
        {
            let mut guard = child.lock();
            guard.arm_keepalive()?;
            guard.arm_traversal()?;
        }

        Ok(child)
    }

    pub(crate) fn connect(&mut self, dest: &AtpAddr) -> Result<(), Error> {
        if self.state != State::Closed || self.connect_pending || self.peer_atp.is_some() {
            return Err(Error::AlreadySet);
        }

        let reflexive = self
            .resolver
            .reflexive_address()
            .ok_or(Error::NatQueryFailure)?;

        let weak = self.weak_self.clone();
        let signalling_callback =
            self.core
                .register(Some(self.signalling.readiness()), SUSPEND, move || {
                    if let Some(socket) = weak.upgrade() {
                        socket.lock().drain_connect_signals();
                    }
                    None
                })?;

        let mut bytes = BytesMut::new();
        Signal::request(reflexive).encode(&mut bytes);
        if let Err(cause) = self.signalling.send(&bytes, dest) {
            let _ = self.core.delete(signalling_callback);
            return Err(cause);
        }

        self.signalling_callback = signalling_callback;
        self.peer_atp = Some(dest.clone());
        self.connect_pending = true;

        self.core.resume(signalling_callback)?;
        Ok(())
    }

    fn drain_connect_signals(&mut self) {
        loop {
            let mut buf = [0u8; 64];
            match self.signalling.try_recv(&mut buf) {
                Ok((size, source)) => {
                    if self.handle_connect_signal(&buf[..size], source) {
                        break;
                    }
                }
                Err(Error::WouldBlock) => break,
                Err(cause) => {
                    log::warn!("signalling receive failed: {}", cause);
                    break;
                }
            }
        }
    }

    /// Returns true once the response has been consumed and punching is
    /// under way.
    fn handle_connect_signal(&mut self, bytes: &[u8], source: AtpAddr) -> bool {
        let signal = match Signal::decode(bytes) {
            Ok(signal) => signal,
            Err(cause) => {
                log::warn!("dropping malformed signal from {}: {}", source, cause);
                return false;
            }
        };

        if signal.kind != Kind::Response {
            log::warn!("dropping unexpected {:?} signal from {}", signal.kind, source);
            return false;
        }

        if self.peer_atp.as_ref() != Some(&source) {
            log::warn!("dropping response from unexpected peer {}", source);
            return false;
        }

        if self.state != State::Closed || !self.connect_pending {
            log::warn!("dropping stray response from {}", source);
            return false;
        }

        self.peer_ip = Some(signal.endpoint);
        if let Err(cause) = self.arm_traversal() {
            log::warn!("cannot start punching towards {}: {}", signal.endpoint, cause);
            return false;
        }

        self.state = State::Punch;
        log::debug!("response from {}, punching {}", source, signal.endpoint);

        // The signalling channel has served its purpose for this socket.
        let _ = self.core.delete(self.signalling_callback);
        self.signalling_callback = 0;

        true
    }

    /// Register the punch retransmission timer and the demultiplexer route
    /// for the peer endpoint, then start the timer.
    fn arm_traversal(&mut self) -> Result<(), Error> {
        let peer = self.peer_ip.ok_or(Error::Unknown)?;

        let weak = self.weak_self.clone();
        let punch_callback = self
            .core
            .register(None, INVOKE_IMMEDIATELY | SUSPEND, move || {
                let socket = weak.upgrade()?;
                let (next, followup) = socket.lock().punch_tick();
                if let Some(followup) = followup {
                    followup.run();
                }
                next
            })?;

        let weak = self.weak_self.clone();
        let network_callback = match self.demux.register_callback(
            peer,
            Box::new(move |_, bytes| {
                let Some(socket) = weak.upgrade() else {
                    return;
                };

                let followup = socket.lock().on_segment(bytes);
                if let Some(followup) = followup {
                    followup.run();
                }
            }),
        ) {
            Ok(id) => id,
            Err(cause) => {
                let _ = self.core.delete(punch_callback);
                return Err(cause);
            }
        };

        self.punch_callback = punch_callback;
        self.network_callback = network_callback;
        self.core.resume(punch_callback)?;
        Ok(())
    }

    /// One firing of the punch retransmission timer.
    fn punch_tick(&mut self) -> (Option<Duration>, Option<Followup>) {
        // Transmission happens only while punching; in any other state
        // the timer winds down.
        let control = match self.state {
            State::Punch => Control::PUNCH,
            State::Thru => Control::THRU,
            _ => return (None, None),
        };

        self.send_control(control);
        self.punch_packets_sent += 1;

        let attempts = (self.timers.punch_timeout_ms / self.timers.punch_interval_ms).max(1) as u32;
        if self.punch_packets_sent >= attempts {
            log::warn!(
                "giving up on {:?} after {} punch attempts",
                self.peer_ip,
                self.punch_packets_sent
            );

            let followup = self.close_internal();
            return (None, followup);
        }

        (
            Some(Duration::from_millis(self.timers.punch_interval_ms)),
            None,
        )
    }

    /// One datagram from the peer endpoint.
    pub(crate) fn on_segment(&mut self, bytes: &[u8]) -> Option<Followup> {
        let (header, payload) = match frame::decode(bytes) {
            Ok(parsed) => parsed,
            Err(cause) => {
                log::warn!("dropping malformed datagram from {:?}: {}", self.peer_ip, cause);
                return None;
            }
        };

        let control = header.control;
        match self.state {
            State::Punch => {
                if control.contains(Control::PUNCH) {
                    // The hole is open in our direction; answer every
                    // PUNCH with a THRU until one comes back.
                    self.state = State::Thru;
                    self.send_control(Control::THRU);
                    None
                } else if control.contains(Control::THRU) {
                    self.establish()
                } else {
                    self.drop_segment(control);
                    None
                }
            }
            State::Thru => {
                if control.contains(Control::THRU) || control.contains(Control::DATA) {
                    let followup = self.establish();
                    if control.contains(Control::DATA) {
                        self.ingest(header, payload);
                    }
                    followup
                } else if control.contains(Control::PUNCH) {
                    self.send_control(Control::THRU);
                    None
                } else {
                    self.drop_segment(control);
                    None
                }
            }
            State::Established => {
                if control.contains(Control::THRU) {
                    // The peer has not seen our THRU yet.
                    self.send_control(Control::THRU);
                    None
                } else if control.contains(Control::PUNCH) {
                    self.drop_segment(control);
                    None
                } else {
                    self.ingest(header, payload);
                    None
                }
            }
            _ => {
                self.drop_segment(control);
                None
            }
        }
    }

    fn drop_segment(&self, control: Control) {
        log::warn!(
            "dropping segment (control {:#04x}) in state {:?}",
            control.bits(),
            self.state
        );
    }

    /// Both NATs have been punched through.
    fn establish(&mut self) -> Option<Followup> {
        self.state = State::Established;

        if self.punch_callback != 0 {
            let _ = self.core.delete(self.punch_callback);
            self.punch_callback = 0;
        }

        // The application-visible channel exists from this moment on; a
        // passively accepted socket has no user-visible endpoint until
        // punched through.
        let (app, engine_side) = Pair::pair();
        self.engine = Some(Box::new(PassthroughEngine::new(
            self.seq_num,
            self.ack_num,
            self.window,
        )));

        let weak = self.weak_self.clone();
        match self
            .core
            .register(Some(engine_side.readiness()), 0, move || {
                if let Some(socket) = weak.upgrade() {
                    socket.lock().pump_app();
                }
                None
            }) {
            Ok(id) => self.app_callback = id,
            Err(cause) => log::warn!("application channel will not drain: {}", cause),
        }

        self.app_channel = Some(app);
        self.engine_channel = Some(engine_side);

        log::info!("connection with {:?} established", self.peer_ip);

        let endpoint = self.peer_ip?;
        if self.parent.strong_count() > 0 {
            Some(Followup::Promote {
                parent: self.parent.clone(),
                endpoint,
            })
        } else {
            None
        }
    }

    /// Application bytes are ready on the internal channel end.
    fn pump_app(&mut self) {
        let Some(channel) = self.engine_channel.clone() else {
            return;
        };

        let Some(engine) = self.engine.as_mut() else {
            return;
        };

        let mut buf = [0u8; 4096];
        loop {
            match channel.try_read(&mut buf) {
                Ok(0) => break,
                Ok(size) => {
                    engine.ingest_stream(&buf[..size]);
                }
                Err(_) => break,
            }
        }

        self.flush_engine();
    }

    /// A segment for the stream engine: data, acknowledgements, keepalive.
    fn ingest(&mut self, header: Header, payload: &[u8]) {
        let Some(engine) = self.engine.as_mut() else {
            log::warn!("segment in {:?} without a stream engine", self.state);
            return;
        };

        if let Err(cause) = engine.ingest_segment(Segment {
            header,
            payload: Bytes::copy_from_slice(payload),
        }) {
            log::warn!("stream engine rejected segment: {}", cause);
            return;
        }

        while let Some(bytes) = self.engine.as_mut().and_then(|engine| engine.take_stream()) {
            if let Some(channel) = self.engine_channel.as_ref() {
                let _ = channel.try_write(&bytes);
            }
        }

        self.flush_engine();
    }

    fn flush_engine(&mut self) {
        let Some(peer) = self.peer_ip else {
            return;
        };

        let mut bytes = BytesMut::new();
        while let Some(segment) = self.engine.as_mut().and_then(|engine| engine.next_segment()) {
            if frame::encode(&segment.header, &segment.payload, &mut bytes).is_ok() {
                if let Err(cause) = self.link.try_send_to(&bytes, peer) {
                    log::warn!("segment send to {} failed: {}", peer, cause);
                }
            }
        }
    }

    /// A control-only segment towards the peer. Failures are logged; the
    /// next timer tick retries.
    fn send_control(&mut self, control: Control) {
        let Some(peer) = self.peer_ip else {
            return;
        };

        let header = Header {
            seq_num: self.seq_num,
            ack_num: self.ack_num,
            control,
            window: self.window,
        };

        let mut bytes = BytesMut::new();
        if frame::encode(&header, &[], &mut bytes).is_ok() {
            match self.link.try_send_to(&bytes, peer) {
                Ok(_) => log::trace!("sent control {:#04x} to {}", control.bits(), peer),
                Err(cause) => log::warn!("control send to {} failed: {}", peer, cause),
            }
        }
    }

    fn send_signal(&self, signal: Signal, dest: &AtpAddr) {
        let mut bytes = BytesMut::new();
        signal.encode(&mut bytes);
        if let Err(cause) = self.signalling.send(&bytes, dest) {
            log::warn!("signal send to {} failed: {}", dest, cause);
        }
    }

    /// Pop one completed connection. Ownership of the child leaves this
    /// socket; the caller must clear the child's parent reference after
    /// releasing this lock.
    pub(crate) fn accept(&mut self) -> Result<SocketRef, Error> {
        if self.state != State::Listen {
            return Err(Error::Inval);
        }

        let child = self.completed.pop_front().ok_or(Error::WouldBlock)?;
        self.stats.sockets_accepted += 1;
        Ok(child)
    }

    pub(crate) fn clear_parent(&mut self) {
        self.parent = Weak::new();
    }

    fn promote(&mut self, endpoint: SocketAddrV4) {
        // |incomplete| + |completed| is untouched, so the backlog bound
        // holds throughout.
        if let Some(child) = self.incomplete.remove(&endpoint) {
            log::debug!("connection from {} completed", endpoint);
            self.completed.push_back(child);
        }
    }

    fn remove_incomplete(&mut self, endpoint: SocketAddrV4) {
        if self.incomplete.remove(&endpoint).is_some() {
            log::debug!("incomplete connection from {} abandoned", endpoint);
        }
    }

    /// Tear the socket down: every callback identifier dies, the
    /// demultiplexer route is released, and owned channel ends close, in
    /// the opposite order to their acquisition.
    pub(crate) fn close_internal(&mut self) -> Option<Followup> {
        self.state = State::Closed;

        if self.app_callback != 0 {
            let _ = self.core.delete(self.app_callback);
            self.app_callback = 0;
        }

        if let Some(channel) = self.app_channel.take() {
            channel.close();
        }
        if let Some(channel) = self.engine_channel.take() {
            channel.close();
        }
        self.engine = None;

        if self.network_callback != 0 {
            let _ = self.demux.delete_callback(self.network_callback);
            self.network_callback = 0;
        }

        if self.punch_callback != 0 {
            let _ = self.core.delete(self.punch_callback);
            self.punch_callback = 0;
        }

        if self.wildcard_callback != 0 {
            let _ = self.demux.delete_callback(self.wildcard_callback);
            self.wildcard_callback = 0;
        }

        if self.signalling_callback != 0 {
            let _ = self.core.delete(self.signalling_callback);
            self.signalling_callback = 0;
        }

        if self.keepalive_callback != 0 {
            let _ = self.core.delete(self.keepalive_callback);
            self.keepalive_callback = 0;
        }

        let endpoint = self.peer_ip;
        let parent = std::mem::replace(&mut self.parent, Weak::new());

        match (endpoint, parent.strong_count() > 0) {
            (Some(endpoint), true) => Some(Followup::Detach { parent, endpoint }),
            _ => None,
        }
    }

    /// The listener's children, for the caller to close after releasing
    /// this lock.
    pub(crate) fn drain_children(&mut self) -> Vec<SocketRef> {
        let mut children: Vec<SocketRef> = self.incomplete.drain().map(|(_, child)| child).collect();
        children.extend(self.completed.drain(..));
        children
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        let _ = self.close_internal();
    }
}
