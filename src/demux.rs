//! The UDP demultiplexer.
//!
//! A listening socket and all its children share one UDP socket, so every
//! inbound datagram has to be routed to the right logical socket by its
//! source endpoint. The demultiplexer owns the link, registers a single
//! readiness callback with the event core, and keeps the routing table: an
//! exact-endpoint map plus an optional wildcard that a listener uses to see
//! datagrams from peers it has not learnt of yet.
//!
//! STUN shares the same socket. Anything that parses as a STUN message is
//! handed to the NAT resolver before endpoint routing.

use crate::{
    error::Error,
    event::{CallbackId, EventCore},
    net::UdpLink,
    stun::NatResolver,
};

use std::{
    net::SocketAddrV4,
    sync::{Arc, Weak},
};

use ahash::{HashMap, HashMapExt};
use parking_lot::Mutex;

/// Strictly positive; 0 means "none".
pub type DemuxId = u32;

pub type DemuxHandler = Box<dyn FnMut(SocketAddrV4, &[u8]) + Send>;

struct Slot {
    id: DemuxId,
    /// Taken out while the handler runs, so a handler can touch the
    /// demultiplexer without deadlocking on the table lock.
    handler: Option<DemuxHandler>,
}

struct Table {
    next_id: DemuxId,
    by_endpoint: HashMap<SocketAddrV4, Slot>,
    wildcard: Option<Slot>,
}

impl Table {
    fn alloc_id(&mut self) -> DemuxId {
        let id = self.next_id;
        self.next_id = self.next_id.checked_add(1).unwrap_or(1);
        id
    }
}

pub struct Demux {
    link: Arc<dyn UdpLink>,
    resolver: Arc<dyn NatResolver>,
    core: EventCore,
    table: Mutex<Table>,
    recv_callback: Mutex<CallbackId>,
}

impl Demux {
    pub fn new(
        core: &EventCore,
        link: Arc<dyn UdpLink>,
        resolver: Arc<dyn NatResolver>,
    ) -> Result<Arc<Self>, Error> {
        let demux = Arc::new(Self {
            link: link.clone(),
            resolver,
            core: core.clone(),
            table: Mutex::new(Table {
                next_id: 1,
                by_endpoint: HashMap::new(),
                wildcard: None,
            }),
            recv_callback: Mutex::new(0),
        });

        let weak: Weak<Demux> = Arc::downgrade(&demux);
        let id = core.register(Some(link.readiness()), 0, move || {
            if let Some(demux) = weak.upgrade() {
                demux.pump();
            }
            None
        })?;

        *demux.recv_callback.lock() = id;
        Ok(demux)
    }

    /// Read one datagram and route it. Runs on the dispatcher; per-endpoint
    /// ordering follows from reading the socket sequentially.
    fn pump(&self) {
        let mut buf = [0u8; 2048];
        let (size, source) = match self.link.try_recv_from(&mut buf) {
            Ok(received) => received,
            Err(Error::WouldBlock) => return,
            Err(cause) => {
                log::warn!("udp socket receive failed: {}", cause);
                return;
            }
        };

        let bytes = &buf[..size];
        log::trace!("udp socket receive: size={}, addr={}", size, source);

        if codec::message::is_message(bytes) {
            if self.resolver.keepalive_receive(bytes).is_err() {
                log::trace!("stun message from {} had no live transaction", source);
            }
            return;
        }

        self.dispatch(source, bytes);
    }

    fn dispatch(&self, source: SocketAddrV4, bytes: &[u8]) {
        enum Route {
            Endpoint(SocketAddrV4, DemuxId),
            Wildcard(DemuxId),
        }

        // Check the handler out so it never runs under the table lock.
        let (mut handler, route) = {
            let mut table = self.table.lock();
            if let Some(slot) = table.by_endpoint.get_mut(&source) {
                match slot.handler.take() {
                    Some(handler) => (handler, Route::Endpoint(source, slot.id)),
                    None => return,
                }
            } else if let Some(slot) = table.wildcard.as_mut() {
                match slot.handler.take() {
                    Some(handler) => (handler, Route::Wildcard(slot.id)),
                    None => return,
                }
            } else {
                log::trace!("dropping datagram from unknown endpoint {}", source);
                return;
            }
        };

        handler(source, bytes);

        // Put it back unless the registration changed underneath us.
        let mut table = self.table.lock();
        match route {
            Route::Endpoint(endpoint, id) => {
                if let Some(slot) = table.by_endpoint.get_mut(&endpoint) {
                    if slot.id == id {
                        slot.handler = Some(handler);
                    }
                }
            }
            Route::Wildcard(id) => {
                if let Some(slot) = table.wildcard.as_mut() {
                    if slot.id == id {
                        slot.handler = Some(handler);
                    }
                }
            }
        }
    }

    /// Route datagrams from one source endpoint to the handler. Fails if
    /// the endpoint is already claimed.
    pub fn register_callback(
        &self,
        source: SocketAddrV4,
        handler: DemuxHandler,
    ) -> Result<DemuxId, Error> {
        let mut table = self.table.lock();
        if table.by_endpoint.contains_key(&source) {
            return Err(Error::Demux);
        }

        let id = table.alloc_id();
        table.by_endpoint.insert(
            source,
            Slot {
                id,
                handler: Some(handler),
            },
        );

        Ok(id)
    }

    /// Catch datagrams no endpoint registration claims. At most one
    /// wildcard may exist at a time.
    pub fn register_wildcard(&self, handler: DemuxHandler) -> Result<DemuxId, Error> {
        let mut table = self.table.lock();
        if table.wildcard.is_some() {
            return Err(Error::Demux);
        }

        let id = table.alloc_id();
        table.wildcard = Some(Slot {
            id,
            handler: Some(handler),
        });

        Ok(id)
    }

    /// Remove a registration. Later datagrams from that endpoint fall
    /// through to the wildcard or are dropped.
    pub fn delete_callback(&self, id: DemuxId) -> Result<(), Error> {
        let mut table = self.table.lock();

        if table.wildcard.as_ref().is_some_and(|slot| slot.id == id) {
            table.wildcard = None;
            return Ok(());
        }

        let endpoint = table
            .by_endpoint
            .iter()
            .find(|(_, slot)| slot.id == id)
            .map(|(endpoint, _)| *endpoint)
            .ok_or(Error::Demux)?;

        table.by_endpoint.remove(&endpoint);
        Ok(())
    }

    pub fn link(&self) -> &Arc<dyn UdpLink> {
        &self.link
    }
}

impl Drop for Demux {
    fn drop(&mut self) {
        let id = *self.recv_callback.lock();
        if id != 0 {
            let _ = self.core.delete(id);
        }
    }
}
