//! Seams over the kernel sockets.
//!
//! The engine never touches `tokio::net` directly: it speaks to a
//! [`UdpLink`] handed out by a [`SocketFactory`], and to [`Pair`] endpoints
//! standing in for a connected Unix socketpair. Tests substitute in-memory
//! implementations and run the whole stack without a kernel fd.

use crate::error::Error;

use std::{
    collections::VecDeque,
    future::Future,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    pin::Pin,
    sync::Arc,
};

use parking_lot::Mutex;
use tokio::{net::UdpSocket, sync::Notify};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A source of readability events.
pub trait ReadinessSource: Send + Sync {
    /// Resolves once the associated object has something to read. Must be
    /// level-triggered: if data is already pending the future resolves
    /// immediately.
    fn readable(&self) -> BoxFuture<'static, ()>;
}

/// A cloneable readiness handle, registered with the event core to drive a
/// callback whenever its object becomes readable.
#[derive(Clone)]
pub struct Interest(Arc<dyn ReadinessSource>);

impl Interest {
    pub fn new(source: Arc<dyn ReadinessSource>) -> Self {
        Self(source)
    }

    pub fn readable(&self) -> BoxFuture<'static, ()> {
        self.0.readable()
    }
}

/// Readiness over a queue guarded by a [`Notify`].
///
/// The probe closure reports whether data is currently pending, closing the
/// window between a notification being consumed and the queue being
/// drained. Custom link and signalling implementations can build their
/// readiness handles out of this.
pub struct ProbedReadiness {
    notify: Arc<Notify>,
    probe: Arc<dyn Fn() -> bool + Send + Sync>,
}

impl ProbedReadiness {
    pub fn new(notify: Arc<Notify>, probe: Arc<dyn Fn() -> bool + Send + Sync>) -> Self {
        Self { notify, probe }
    }
}

impl ReadinessSource for ProbedReadiness {
    fn readable(&self) -> BoxFuture<'static, ()> {
        let notify = self.notify.clone();
        let probe = self.probe.clone();

        Box::pin(async move {
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);

                // The waiter must exist before the probe so a push landing
                // in between still wakes us.
                if probe() {
                    return;
                }

                notified.await;
            }
        })
    }
}

/// A non-blocking datagram socket.
pub trait UdpLink: Send + Sync {
    fn local_addr(&self) -> SocketAddrV4;

    fn try_send_to(&self, buf: &[u8], dest: SocketAddrV4) -> Result<usize, Error>;

    fn try_recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), Error>;

    fn readiness(&self) -> Interest;
}

/// Creates the datagram sockets the engine runs on.
pub trait SocketFactory: Send + Sync {
    fn udp(&self) -> Result<Arc<dyn UdpLink>, Error>;
}

/// The production factory: one unbound-port UDP socket per call, backed by
/// the tokio reactor.
pub struct NetFactory {
    handle: tokio::runtime::Handle,
}

impl NetFactory {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }
}

impl SocketFactory for NetFactory {
    fn udp(&self) -> Result<Arc<dyn UdpLink>, Error> {
        let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_nonblocking(true)?;

        // Registering with the reactor needs the runtime context.
        let _guard = self.handle.enter();
        let socket = UdpSocket::from_std(socket)?;

        Ok(Arc::new(TokioLink {
            socket: Arc::new(socket),
        }))
    }
}

struct TokioLink {
    socket: Arc<UdpSocket>,
}

impl UdpLink for TokioLink {
    fn local_addr(&self) -> SocketAddrV4 {
        match self.socket.local_addr() {
            Ok(SocketAddr::V4(addr)) => addr,
            _ => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        }
    }

    fn try_send_to(&self, buf: &[u8], dest: SocketAddrV4) -> Result<usize, Error> {
        Ok(self.socket.try_send_to(buf, SocketAddr::V4(dest))?)
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), Error> {
        loop {
            let (size, addr) = self.socket.try_recv_from(buf)?;

            // The socket is bound to an IPv4 address; anything else cannot
            // be routed to a logical socket.
            if let SocketAddr::V4(addr) = addr {
                return Ok((size, addr));
            }
        }
    }

    fn readiness(&self) -> Interest {
        Interest::new(Arc::new(LinkReadiness {
            socket: self.socket.clone(),
        }))
    }
}

struct LinkReadiness {
    socket: Arc<UdpSocket>,
}

impl ReadinessSource for LinkReadiness {
    fn readable(&self) -> BoxFuture<'static, ()> {
        let socket = self.socket.clone();
        Box::pin(async move {
            let _ = socket.readable().await;
        })
    }
}

/// One side of an in-process connected channel pair, the stand-in for a
/// Unix socketpair between the application and the protocol stack.
///
/// Writes never block; reads are non-blocking with an [`Interest`] for
/// readiness, mirroring every other fd the event core watches.
#[derive(Clone)]
pub struct Pair {
    inbound: Arc<Half>,
    outbound: Arc<Half>,
}

struct Half {
    queue: Mutex<VecDeque<u8>>,
    notify: Arc<Notify>,
    closed: Mutex<bool>,
}

impl Half {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Arc::new(Notify::new()),
            closed: Mutex::new(false),
        })
    }
}

impl Pair {
    /// Create both connected endpoints.
    pub fn pair() -> (Pair, Pair) {
        let a = Half::new();
        let b = Half::new();

        (
            Pair {
                inbound: a.clone(),
                outbound: b.clone(),
            },
            Pair {
                inbound: b,
                outbound: a,
            },
        )
    }

    /// Read whatever is pending. Fails with [`Error::WouldBlock`] when the
    /// channel is empty, returns `Ok(0)` once the peer has closed and the
    /// queue is drained.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut queue = self.inbound.queue.lock();
        if queue.is_empty() {
            return if *self.inbound.closed.lock() {
                Ok(0)
            } else {
                Err(Error::WouldBlock)
            };
        }

        let size = buf.len().min(queue.len());
        for (byte, value) in buf.iter_mut().zip(queue.drain(..size)) {
            *byte = value;
        }

        Ok(size)
    }

    /// Append to the peer's inbound queue. The channel is unbounded, so
    /// this never blocks; it fails once the pair is closed.
    pub fn try_write(&self, buf: &[u8]) -> Result<usize, Error> {
        if *self.outbound.closed.lock() {
            return Err(Error::Unknown);
        }

        self.outbound.queue.lock().extend(buf.iter().copied());
        self.outbound.notify.notify_one();

        Ok(buf.len())
    }

    /// Half-close: the peer drains what is queued and then reads EOF.
    pub fn close(&self) {
        *self.outbound.closed.lock() = true;
        self.outbound.notify.notify_one();
    }

    pub fn readiness(&self) -> Interest {
        let half = self.inbound.clone();
        Interest::new(Arc::new(ProbedReadiness::new(
            self.inbound.notify.clone(),
            Arc::new(move || !half.queue.lock().is_empty() || *half.closed.lock()),
        )))
    }

    /// Blocking flavour of [`Pair::try_read`] for application use.
    pub async fn read(&self, buf: &mut [u8]) -> usize {
        loop {
            match self.try_read(buf) {
                Ok(size) => return size,
                Err(_) => self.readiness().readable().await,
            }
        }
    }
}
