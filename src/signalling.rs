//! The signalling channel.
//!
//! Peers behind NATs cannot reach each other until a hole is punched, so
//! the reflexive endpoints travel over an out-of-band channel supplied by a
//! [`SignallingProvider`]. The provider must be reliable and must deliver
//! exactly what was sent; retries are its concern, not ours.

use crate::{
    error::Error,
    net::{Interest, ProbedReadiness},
};

use std::{collections::VecDeque, str::FromStr, sync::Arc};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

pub const HOSTNAME_MAX: usize = 16;
pub const SERVICE_MAX: usize = 14;

/// A transport-independent signalling address: a hostname and a service
/// name. What these map to is up to the provider; the stack only assumes
/// that an address identifies exactly one signalling socket.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtpAddr {
    hostname: String,
    service: String,
}

impl AtpAddr {
    pub fn new(hostname: &str, service: &str) -> Result<Self, Error> {
        if hostname.is_empty() || hostname.len() > HOSTNAME_MAX {
            return Err(Error::Inval);
        }

        if service.is_empty() || service.len() > SERVICE_MAX {
            return Err(Error::Inval);
        }

        Ok(Self {
            hostname: hostname.to_string(),
            service: service.to_string(),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl std::fmt::Display for AtpAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hostname, self.service)
    }
}

impl FromStr for AtpAddr {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (hostname, service) = value.split_once(':').ok_or(Error::Inval)?;
        Self::new(hostname, service)
    }
}

/// Hands out signalling sockets.
pub trait SignallingProvider: Send + Sync {
    fn open(&self) -> Result<Arc<dyn SignallingSocket>, Error>;
}

/// One signalling socket.
///
/// Every socket must be bound before use. Send is assumed to always go
/// through; recv is non-blocking and fails with [`Error::WouldBlock`] when
/// no signal is queued. The readiness handle becomes readable whenever at
/// least one signal is available.
pub trait SignallingSocket: Send + Sync {
    fn bind(&self, addr: &AtpAddr) -> Result<(), Error>;

    fn send(&self, payload: &[u8], dest: &AtpAddr) -> Result<(), Error>;

    fn try_recv(&self, buf: &mut [u8]) -> Result<(usize, AtpAddr), Error>;

    fn readiness(&self) -> Interest;
}

/// An in-process provider: a hub of mailboxes keyed by [`AtpAddr`].
///
/// Delivery is immediate and loss-free, which satisfies the reliability
/// contract trivially. Useful for two peers inside one process and for
/// exercising the stack in tests.
#[derive(Default, Clone)]
pub struct LocalSignalling {
    hub: Arc<Hub>,
}

#[derive(Default)]
struct Hub {
    mailboxes: Mutex<HashMap<AtpAddr, Arc<Mailbox>>>,
}

struct Mailbox {
    queue: Mutex<VecDeque<(Vec<u8>, AtpAddr)>>,
    notify: Arc<Notify>,
}

impl LocalSignalling {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SignallingProvider for LocalSignalling {
    fn open(&self) -> Result<Arc<dyn SignallingSocket>, Error> {
        Ok(Arc::new(LocalSocket {
            hub: self.hub.clone(),
            mailbox: Arc::new(Mailbox {
                queue: Mutex::new(VecDeque::new()),
                notify: Arc::new(Notify::new()),
            }),
            bound: Mutex::new(None),
        }))
    }
}

struct LocalSocket {
    hub: Arc<Hub>,
    mailbox: Arc<Mailbox>,
    bound: Mutex<Option<AtpAddr>>,
}

impl SignallingSocket for LocalSocket {
    fn bind(&self, addr: &AtpAddr) -> Result<(), Error> {
        let mut bound = self.bound.lock();
        if bound.is_some() {
            return Err(Error::AlreadySet);
        }

        let mut mailboxes = self.hub.mailboxes.lock();
        if mailboxes.contains_key(addr) {
            // One address, one socket.
            return Err(Error::SignallingProvider);
        }

        mailboxes.insert(addr.clone(), self.mailbox.clone());
        *bound = Some(addr.clone());

        Ok(())
    }

    fn send(&self, payload: &[u8], dest: &AtpAddr) -> Result<(), Error> {
        let source = self
            .bound
            .lock()
            .clone()
            .ok_or(Error::SignallingProvider)?;

        let mailbox = self
            .hub
            .mailboxes
            .lock()
            .get(dest)
            .cloned()
            .ok_or(Error::SignallingProvider)?;

        mailbox
            .queue
            .lock()
            .push_back((payload.to_vec(), source));
        mailbox.notify.notify_one();

        Ok(())
    }

    fn try_recv(&self, buf: &mut [u8]) -> Result<(usize, AtpAddr), Error> {
        let (payload, source) = self
            .mailbox
            .queue
            .lock()
            .pop_front()
            .ok_or(Error::WouldBlock)?;

        if payload.len() > buf.len() {
            return Err(Error::Inval);
        }

        buf[..payload.len()].copy_from_slice(&payload);
        Ok((payload.len(), source))
    }

    fn readiness(&self) -> Interest {
        let mailbox = self.mailbox.clone();
        Interest::new(Arc::new(ProbedReadiness::new(
            self.mailbox.notify.clone(),
            Arc::new(move || !mailbox.queue.lock().is_empty()),
        )))
    }
}

impl Drop for LocalSocket {
    fn drop(&mut self) {
        if let Some(addr) = self.bound.lock().take() {
            self.hub.mailboxes.lock().remove(&addr);
        }
    }
}
