//! In-memory fakes used by the unit tests.

use crate::{
    error::Error,
    net::{BoxFuture, Interest, ProbedReadiness, UdpLink},
    stun::{NatResolver, NatType},
};

use std::{collections::VecDeque, net::SocketAddrV4, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// A datagram socket whose wire is a queue: sends are captured, receives
/// are injected by the test.
pub struct MemoryLink {
    addr: SocketAddrV4,
    inbox: Arc<Mutex<VecDeque<(Vec<u8>, SocketAddrV4)>>>,
    notify: Arc<Notify>,
    sent: Mutex<Vec<(Vec<u8>, SocketAddrV4)>>,
}

pub fn memory_link(addr: &str) -> Arc<MemoryLink> {
    Arc::new(MemoryLink {
        addr: addr.parse().unwrap(),
        inbox: Arc::new(Mutex::new(VecDeque::new())),
        notify: Arc::new(Notify::new()),
        sent: Mutex::new(Vec::new()),
    })
}

impl MemoryLink {
    pub fn inject(&self, bytes: &[u8], source: SocketAddrV4) {
        self.inbox.lock().push_back((bytes.to_vec(), source));
        self.notify.notify_one();
    }

    pub fn sent(&self) -> Vec<(Vec<u8>, SocketAddrV4)> {
        self.sent.lock().clone()
    }
}

impl UdpLink for MemoryLink {
    fn local_addr(&self) -> SocketAddrV4 {
        self.addr
    }

    fn try_send_to(&self, buf: &[u8], dest: SocketAddrV4) -> Result<usize, Error> {
        self.sent.lock().push((buf.to_vec(), dest));
        Ok(buf.len())
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddrV4), Error> {
        let (bytes, source) = self.inbox.lock().pop_front().ok_or(Error::WouldBlock)?;
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok((bytes.len(), source))
    }

    fn readiness(&self) -> Interest {
        let inbox = self.inbox.clone();
        Interest::new(Arc::new(ProbedReadiness::new(
            self.notify.clone(),
            Arc::new(move || !inbox.lock().is_empty()),
        )))
    }
}

/// A resolver with a made-up verdict and no network behind it.
pub struct FixedResolver {
    pub reflexive: SocketAddrV4,
}

impl NatResolver for FixedResolver {
    fn query_all_servers(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(async { Ok(()) })
    }

    fn nat_type(&self) -> NatType {
        NatType::Independent
    }

    fn reflexive_address(&self) -> Option<SocketAddrV4> {
        Some(self.reflexive)
    }

    fn invalidate_reflexive_address(&self) {}

    fn keepalive_send(&self) {}

    fn keepalive_receive(&self, _bytes: &[u8]) -> Result<(), Error> {
        Err(Error::Inval)
    }
}
