//! ## ATP
//!
//! [RFC 5389]: https://tools.ietf.org/html/rfc5389
//!
//! A reliable, connection-oriented byte-stream transport between peers
//! that are both behind NATs, with neither publicly reachable. Each peer
//! discovers its reflexive (post-NAT) address with a [RFC 5389] STUN
//! client, the addresses travel over an out-of-band signalling channel,
//! and simultaneous UDP transmission punches a binding into both NATs.
//! A TCP-like protocol then runs over the punched path, presented through
//! a familiar stream-socket surface: socket, bind, listen, accept,
//! connect.
//!
//! Endpoint-dependent NATs (which assign a fresh reflexive endpoint per
//! destination) cannot be traversed this way; socket creation fails with
//! [`Error::NatDependent`] behind one.
//!
//! ```no_run
//! use std::sync::Arc;
//! use atp::{Context, ContextOptions, Domain, SocketType, PROTO_ATP};
//!
//! # fn main() -> Result<(), atp::Error> {
//! let context = Context::new(ContextOptions {
//!     config: Default::default(),
//!     signalling: Arc::new(atp::LocalSignalling::new()),
//!     factory: None,
//!     resolver: None,
//! })?;
//!
//! let socket = context.socket(Domain::Ipv4, SocketType::Stream, PROTO_ATP)?;
//! context.bind(socket, &"server:atp".parse()?)?;
//! context.listen(socket, 16)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod demux;
pub mod engine;
pub mod error;
pub mod event;
pub mod net;
pub mod signalling;
pub mod socket;
pub mod stun;

#[cfg(test)]
mod testing;

pub use self::{
    config::Config,
    context::{Context, ContextOptions, Domain, Handle, PROTO_ATP, ResolverFactory, SocketType},
    error::Error,
    net::{Interest, Pair, SocketFactory, UdpLink},
    signalling::{AtpAddr, LocalSignalling, SignallingProvider, SignallingSocket},
    socket::{ListenerStats, SocketOption, SocketOptionKind, State},
    stun::{NatResolver, NatType, StunClient},
};
