//! A little laboratory network: in-memory datagram links, scripted STUN
//! servers, and a kill switch for peer traffic.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddrV4,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU16, Ordering},
    },
};

use atp::{
    error::Error,
    net::{Interest, ProbedReadiness, SocketFactory, UdpLink},
};
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::Notify;

/// Given the request bytes and the sender's address, produce the response
/// bytes, if any.
pub type Responder = Box<dyn Fn(&[u8], SocketAddrV4) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Clone)]
pub struct LabNet {
    inner: Arc<LabInner>,
}

struct LabInner {
    links: Mutex<HashMap<SocketAddrV4, Arc<Inbox>>>,
    responders: Mutex<HashMap<SocketAddrV4, Responder>>,
    /// When set, peer-to-peer datagrams vanish; STUN responders still
    /// answer.
    partitioned: AtomicBool,
    next_port: AtomicU16,
    allocated: Mutex<Vec<SocketAddrV4>>,
}

struct Inbox {
    addr: SocketAddrV4,
    queue: Mutex<VecDeque<(Vec<u8>, SocketAddrV4)>>,
    notify: Arc<Notify>,
}

impl LabNet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(LabInner {
                links: Mutex::new(HashMap::new()),
                responders: Mutex::new(HashMap::new()),
                partitioned: AtomicBool::new(false),
                next_port: AtomicU16::new(1),
                allocated: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn add_stun_server(&self, addr: &str, responder: Responder) {
        self.inner
            .responders
            .lock()
            .insert(addr.parse().unwrap(), responder);
    }

    pub fn set_partitioned(&self, partitioned: bool) {
        self.inner.partitioned.store(partitioned, Ordering::SeqCst);
    }

    /// Addresses in allocation order, for crafting raw datagrams.
    pub fn allocated(&self) -> Vec<SocketAddrV4> {
        self.inner.allocated.lock().clone()
    }

    /// Push a raw datagram straight into a link's inbox.
    pub fn inject(&self, dest: SocketAddrV4, source: SocketAddrV4, bytes: &[u8]) {
        if let Some(inbox) = self.inner.links.lock().get(&dest) {
            inbox.queue.lock().push_back((bytes.to_vec(), source));
            inbox.notify.notify_one();
        }
    }
}

impl SocketFactory for LabNet {
    fn udp(&self) -> Result<Arc<dyn UdpLink>, Error> {
        let port = 6000 + self.inner.next_port.fetch_add(1, Ordering::SeqCst);
        let addr: SocketAddrV4 = format!("10.0.0.1:{}", port).parse().unwrap();

        let inbox = Arc::new(Inbox {
            addr,
            queue: Mutex::new(VecDeque::new()),
            notify: Arc::new(Notify::new()),
        });

        self.inner.links.lock().insert(addr, inbox.clone());
        self.inner.allocated.lock().push(addr);

        Ok(Arc::new(LabLink {
            net: self.inner.clone(),
            inbox,
        }))
    }
}

struct LabLink {
    net: Arc<LabInner>,
    inbox: Arc<Inbox>,
}

impl UdpLink for LabLink {
    fn local_addr(&self) -> SocketAddrV4 {
        self.inbox.addr
    }

    fn try_send_to(&self, buf: &[u8], dest: SocketAddrV4) -> Result<usize, Error> {
        if let Some(responder) = self.net.responders.lock().get(&dest) {
            if let Some(reply) = responder(buf, self.inbox.addr) {
                self.inbox.queue.lock().push_back((reply, dest));
                self.inbox.notify.notify_one();
            }
            return Ok(buf.len());
        }

        if self.net.partitioned.load(Ordering::SeqCst) {
            // The NAT ate it.
            return Ok(buf.len());
        }

        if let Some(inbox) = self.net.links.lock().get(&dest) {
            inbox.queue.lock().push_back((buf.to_vec(), self.inbox.addr));
            inbox.notify.notify_one();
        }

        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), Error> {
        let (bytes, source) = self
            .inbox
            .queue
            .lock()
            .pop_front()
            .ok_or(Error::WouldBlock)?;

        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok((bytes.len(), source))
    }

    fn readiness(&self) -> Interest {
        let inbox = self.inbox.clone();
        Interest::new(Arc::new(ProbedReadiness::new(
            self.inbox.notify.clone(),
            Arc::new(move || !inbox.queue.lock().is_empty()),
        )))
    }
}

/// A binding responder that maps every request to a fixed address.
pub fn fixed_mapping(mapped: &str) -> Responder {
    let mapped: SocketAddrV4 = mapped.parse().unwrap();
    Box::new(move |request, _| binding_response(request, mapped))
}

/// A binding responder that echoes the sender's own address, like a real
/// server on an un-NATed network.
pub fn echo_mapping() -> Responder {
    Box::new(|request, sender| binding_response(request, sender))
}

pub fn binding_response(request: &[u8], mapped: SocketAddrV4) -> Option<Vec<u8>> {
    use codec::message::{
        Message, MessageEncoder, attributes::XorMappedAddress, methods::Method,
    };

    let request = Message::decode(request).ok()?;
    if request.method() != Method::BindingRequest {
        return None;
    }

    let token = request.token();
    let mut bytes = BytesMut::new();
    let mut encoder = MessageEncoder::new(Method::BindingResponse, &token, &mut bytes);
    encoder.append::<XorMappedAddress>(mapped);
    encoder.flush();

    Some(bytes.to_vec())
}

/// Spin until the probe passes or the deadline expires.
pub fn wait_for(mut probe: impl FnMut() -> bool, timeout: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    probe()
}
