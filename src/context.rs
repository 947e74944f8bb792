//! The context: process-wide socket table and the stream-socket API.
//!
//! A context owns the dispatcher runtime and the collection of live
//! sockets, and maps opaque handles to them. Its lifetime bounds
//! everything underneath: dropping (or explicitly shutting down) the
//! context stops the dispatcher and tears every socket down.
//!
//! The API mirrors the familiar socket calls: `socket`, `bind`, `listen`,
//! `accept`, `connect`. All of them are synchronous and intended for the
//! application thread; the dispatcher makes progress concurrently.

use crate::{
    config::Config,
    demux::Demux,
    error::Error,
    event::EventCore,
    net::{NetFactory, Pair, SocketFactory, UdpLink},
    signalling::{AtpAddr, SignallingProvider},
    socket::{ListenerStats, SocketCore, SocketDeps, SocketOption, SocketOptionKind, SocketRef, State},
    stun::{NatResolver, NatType, StunClient},
};

use std::sync::Arc;

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};

/// The one protocol number this stack answers to.
pub const PROTO_ATP: u8 = 111;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    Ipv4,
    Ipv6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// An opaque handle to a socket owned by a [`Context`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u32);

/// Builds the NAT resolver for a freshly created socket. The default wires
/// up [`StunClient`]; tests substitute doubles.
pub type ResolverFactory = Arc<dyn Fn(Arc<dyn UdpLink>) -> Arc<dyn NatResolver> + Send + Sync>;

pub struct ContextOptions {
    pub config: Config,
    pub signalling: Arc<dyn SignallingProvider>,
    /// Defaults to real UDP sockets.
    pub factory: Option<Arc<dyn SocketFactory>>,
    /// Defaults to the STUN client configured in `config.stun`.
    pub resolver: Option<ResolverFactory>,
}

struct Table {
    next: u32,
    sockets: HashMap<Handle, SocketRef>,
}

pub struct Context {
    runtime: Option<Runtime>,
    core: EventCore,
    config: Config,
    factory: Arc<dyn SocketFactory>,
    signalling: Arc<dyn SignallingProvider>,
    resolver: ResolverFactory,
    table: Mutex<Table>,
}

impl Context {
    /// Build the context and start the dispatcher thread.
    pub fn new(options: ContextOptions) -> Result<Self, Error> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("atp-dispatch")
            .enable_all()
            .build()
            .map_err(|_| Error::EventCore)?;

        let core = EventCore::start(runtime.handle().clone());

        let factory = options
            .factory
            .unwrap_or_else(|| Arc::new(NetFactory::new(runtime.handle().clone())));

        let resolver = options.resolver.unwrap_or_else(|| {
            let stun = options.config.stun.clone();
            let handle = runtime.handle().clone();
            Arc::new(move |link: Arc<dyn UdpLink>| {
                Arc::new(StunClient::new(link, &stun, handle.clone())) as Arc<dyn NatResolver>
            })
        });

        Ok(Self {
            runtime: Some(runtime),
            core,
            config: options.config,
            factory,
            signalling: options.signalling,
            resolver,
            table: Mutex::new(Table {
                next: 1,
                sockets: HashMap::new(),
            }),
        })
    }

    /// Create a socket: resolve the reflexive address, classify the NAT,
    /// and wire the new socket into the dispatcher.
    pub fn socket(&self, domain: Domain, kind: SocketType, protocol: u8) -> Result<Handle, Error> {
        if domain != Domain::Ipv4 {
            return Err(Error::AfNoSupport);
        }

        if kind != SocketType::Stream || protocol != PROTO_ATP {
            return Err(Error::ProtoNoSupport);
        }

        if self.table.lock().sockets.len() >= self.config.limits.max_socket_count {
            return Err(Error::MaxSockets);
        }

        let link = self.factory.udp()?;
        let resolver = (self.resolver)(link.clone());

        // Query twice to be a bit extra sure about the NAT type.
        let handle = self.runtime.as_ref().ok_or(Error::EventCore)?.handle();
        for _ in 0..2 {
            handle
                .block_on(resolver.query_all_servers())
                .map_err(|_| Error::NatQueryFailure)?;
        }

        if resolver.nat_type() == NatType::Dependent {
            return Err(Error::NatDependent);
        }

        // The demultiplexer attaches only now, after the direct-read STUN
        // phase is over.
        let demux = Demux::new(&self.core, link.clone(), resolver.clone())?;
        let signalling = self.signalling.open()?;

        let socket = SocketCore::create(SocketDeps {
            core: self.core.clone(),
            link,
            demux,
            resolver,
            signalling,
            timers: self.config.timers,
            window: self.config.limits.constant_window,
            max_backlog: self.config.limits.max_backlog,
        })?;

        Ok(self.install(socket))
    }

    fn install(&self, socket: SocketRef) -> Handle {
        let mut table = self.table.lock();
        let handle = Handle(table.next);
        table.next = table.next.wrapping_add(1).max(1);
        table.sockets.insert(handle, socket);
        handle
    }

    fn get(&self, handle: Handle) -> Result<SocketRef, Error> {
        self.table
            .lock()
            .sockets
            .get(&handle)
            .cloned()
            .ok_or(Error::BadFd)
    }

    /// Publish this socket's signalling address. Required before `listen`.
    pub fn bind(&self, handle: Handle, addr: &AtpAddr) -> Result<(), Error> {
        self.get(handle)?.lock().bind(addr)
    }

    pub fn listen(&self, handle: Handle, backlog: usize) -> Result<(), Error> {
        self.get(handle)?.lock().listen(backlog)
    }

    /// Pop one completed connection off a listener. Non-blocking: fails
    /// with [`Error::WouldBlock`] while nothing has punched through yet.
    pub fn accept(&self, handle: Handle) -> Result<(Handle, AtpAddr), Error> {
        let child = self.get(handle)?.lock().accept()?;

        // The parent lock is released; only now may the child be touched.
        let peer = {
            let mut guard = child.lock();
            guard.clear_parent();
            guard.peer_atp().ok_or(Error::Unknown)?
        };

        Ok((self.install(child), peer))
    }

    pub fn connect(&self, handle: Handle, dest: &AtpAddr) -> Result<(), Error> {
        self.get(handle)?.lock().connect(dest)
    }

    /// The application end of the paired channel. Available once the
    /// connection is ESTABLISHED; [`Error::WouldBlock`] before that.
    pub fn stream(&self, handle: Handle) -> Result<Pair, Error> {
        self.get(handle)?.lock().app_channel().ok_or(Error::WouldBlock)
    }

    /// Current connection state, for diagnostics.
    pub fn state(&self, handle: Handle) -> Result<State, Error> {
        Ok(self.get(handle)?.lock().state())
    }

    pub fn listener_stats(&self, handle: Handle) -> Result<ListenerStats, Error> {
        Ok(self.get(handle)?.lock().stats())
    }

    pub fn set_option(&self, handle: Handle, option: SocketOption) -> Result<(), Error> {
        self.get(handle)?.lock().set_option(option)
    }

    pub fn option(&self, handle: Handle, kind: SocketOptionKind) -> Result<SocketOption, Error> {
        Ok(self.get(handle)?.lock().option(kind))
    }

    /// Tear one socket down and release its handle. A listener takes its
    /// unaccepted children with it.
    pub fn close(&self, handle: Handle) -> Result<(), Error> {
        let socket = {
            let mut table = self.table.lock();
            table.sockets.remove(&handle).ok_or(Error::BadFd)?
        };

        let (children, followup) = {
            let mut guard = socket.lock();
            let children = guard.drain_children();
            (children, guard.close_internal())
        };

        if let Some(followup) = followup {
            followup.run();
        }

        for child in children {
            let followup = {
                let mut guard = child.lock();
                guard.clear_parent();
                guard.close_internal()
            };
            drop(followup);
        }

        Ok(())
    }

    /// Stop the dispatcher and drop every socket. `Drop` does the same;
    /// this form merely makes the stop explicit.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let sockets: Vec<SocketRef> = {
            let mut table = self.table.lock();
            table.sockets.drain().map(|(_, socket)| socket).collect()
        };

        for socket in sockets {
            let children = {
                let mut guard = socket.lock();
                let children = guard.drain_children();
                let _ = guard.close_internal();
                children
            };

            for child in children {
                let _ = child.lock().close_internal();
            }
        }

        self.core.stop();

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(std::time::Duration::from_secs(1));
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        self.stop();
    }
}
