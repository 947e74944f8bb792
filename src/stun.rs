//! The STUN client.
//!
//! Queries a pool of binding servers for the reflexive (post-NAT) address,
//! classifies the NAT as endpoint-independent or endpoint-dependent, and
//! keeps the NAT binding alive with periodic binding requests.
//!
//! The client shares the network socket with the ATP traffic; once the
//! demultiplexer is attached, responses flow back through it and land in
//! [`StunClient::keepalive_receive`]. The initial query runs before the
//! demultiplexer exists and reads the socket directly, so the two paths
//! never compete for a datagram.

use crate::{
    config,
    error::Error,
    net::{BoxFuture, UdpLink},
};

use std::{
    collections::BTreeSet,
    net::{SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use ahash::{HashMap, HashMapExt};
use bytes::BytesMut;
use codec::message::{
    Message, MessageEncoder, TransactionId,
    attributes::{ErrorCode, XorMappedAddress},
    methods::Method,
};
use parking_lot::Mutex;
use rand::Rng;
use tokio::time::{Instant, timeout};

/// Whether the NAT maps this socket to the same reflexive endpoint for
/// every destination.
///
/// The verdict starts Unknown. The first successful response records an
/// endpoint but proves nothing; a second server confirming it makes the
/// NAT Independent, a contradiction makes it Dependent and clears the
/// endpoint. A Dependent NAT is final for the session: traversal is not
/// attempted and no further queries are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatType {
    Unknown,
    Independent,
    Dependent,
}

/// The NAT discovery surface the socket machine depends on.
pub trait NatResolver: Send + Sync {
    fn query_all_servers(&self) -> BoxFuture<'_, Result<(), Error>>;

    fn nat_type(&self) -> NatType;

    fn reflexive_address(&self) -> Option<SocketAddrV4>;

    /// Forget the recorded endpoint; the next query re-resolves it.
    fn invalidate_reflexive_address(&self);

    /// Fire one keepalive binding request at a randomly chosen server.
    fn keepalive_send(&self);

    /// Consume one STUN message that arrived on the shared socket.
    /// Succeeds iff the transaction id is live.
    fn keepalive_receive(&self, bytes: &[u8]) -> Result<(), Error>;
}

struct State {
    nat_type: NatType,
    reflexive: Option<SocketAddrV4>,
    /// Ordered primarily by send time so stale transactions purge in
    /// O(log n); the side table finds a transaction's send time by id.
    ongoing: BTreeSet<(u64, TransactionId)>,
    sent_at: HashMap<TransactionId, u64>,
}

pub struct StunClient {
    link: Arc<dyn UdpLink>,
    servers: Vec<config::StunServer>,
    timeout_ms: u64,
    max_retransmissions: u32,
    final_timeout_multiplier: u32,
    ttl: Duration,
    epoch: Instant,
    handle: tokio::runtime::Handle,
    state: Mutex<State>,
}

impl StunClient {
    pub fn new(
        link: Arc<dyn UdpLink>,
        stun: &config::Stun,
        handle: tokio::runtime::Handle,
    ) -> Self {
        Self {
            link,
            servers: stun.servers.clone(),
            timeout_ms: stun.timeout_ms,
            max_retransmissions: stun.max_retransmissions,
            final_timeout_multiplier: stun.final_timeout_multiplier,
            ttl: stun.ttl(),
            epoch: Instant::now(),
            handle,
            state: Mutex::new(State {
                nat_type: NatType::Unknown,
                reflexive: None,
                ongoing: BTreeSet::new(),
                sent_at: HashMap::new(),
            }),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Resolve one server, keeping the first IPv4/UDP address.
    async fn resolve(server: &config::StunServer) -> Option<SocketAddrV4> {
        let lookup = tokio::net::lookup_host(server.to_string()).await.ok()?;
        lookup.into_iter().find_map(|addr| match addr {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        })
    }

    /// Send a fresh binding request and record its transaction.
    fn send_request(&self, dest: SocketAddrV4) -> Result<TransactionId, Error> {
        let mut token = [0u8; 12];
        rand::rng().fill(&mut token);
        let token = TransactionId::from(token);

        let mut bytes = BytesMut::with_capacity(codec::message::HEADER_SIZE);
        MessageEncoder::new(Method::BindingRequest, &token, &mut bytes).flush();

        self.link.try_send_to(&bytes, dest)?;

        let mut state = self.state.lock();
        let now = self.now_ms();
        state.ongoing.insert((now, token));
        state.sent_at.insert(token, now);

        Ok(token)
    }

    /// Drop every transaction older than the TTL. Runs before each send
    /// and each receive.
    fn purge_stale(&self, state: &mut State) {
        let now = self.now_ms();
        while let Some(&(sent, token)) = state.ongoing.first() {
            if sent + self.ttl.as_millis() as u64 > now {
                break;
            }

            state.ongoing.remove(&(sent, token));
            state.sent_at.remove(&token);
        }
    }

    /// Remove the transaction if it is live. A response whose id is not in
    /// the live set must be ignored.
    fn consume_transaction(&self, state: &mut State, token: &TransactionId) -> bool {
        self.purge_stale(state);

        match state.sent_at.remove(token) {
            Some(sent) => {
                state.ongoing.remove(&(sent, *token));
                true
            }
            None => false,
        }
    }

    /// Fold one observed reflexive endpoint into the verdict.
    fn observe_reflexive(&self, state: &mut State, observed: SocketAddrV4) {
        match state.reflexive {
            None => {
                // First sighting; still unconfirmed.
                state.reflexive = Some(observed);
            }
            Some(recorded) if recorded == observed => {
                state.nat_type = NatType::Independent;
            }
            Some(recorded) => {
                log::warn!(
                    "nat assigns per-destination endpoints: {} != {}",
                    recorded,
                    observed
                );

                state.nat_type = NatType::Dependent;
                state.reflexive = None;
            }
        }
    }

    async fn query_all(&self) -> Result<(), Error> {
        if self.state.lock().nat_type == NatType::Dependent {
            // Final verdict; do not even send.
            return Err(Error::NatQueryFailure);
        }

        let mut candidates = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            match Self::resolve(server).await {
                Some(address) => candidates.push(Candidate {
                    address,
                    responded: false,
                }),
                None => log::warn!("stun server {} did not resolve", server),
            }
        }

        if candidates.is_empty() {
            return Err(Error::NatQueryFailure);
        }

        // Which candidate each in-flight transaction belongs to; a server
        // counts towards the verdict once per query no matter how many
        // retransmissions it answers.
        let mut in_flight: HashMap<TransactionId, usize> = HashMap::new();

        for round in 0..=self.max_retransmissions {
            if candidates.iter().all(|candidate| candidate.responded) {
                break;
            }

            {
                let mut state = self.state.lock();
                self.purge_stale(&mut state);
            }

            for (index, candidate) in candidates.iter().enumerate() {
                if candidate.responded {
                    continue;
                }

                match self.send_request(candidate.address) {
                    Ok(token) => {
                        in_flight.insert(token, index);
                    }
                    Err(cause) => {
                        log::warn!("binding request to {} failed: {}", candidate.address, cause)
                    }
                }
            }

            let rto = Duration::from_millis(if round < self.max_retransmissions {
                self.timeout_ms << round
            } else {
                self.timeout_ms * self.final_timeout_multiplier as u64
            });

            let deadline = Instant::now() + rto;
            'window: while Instant::now() < deadline {
                let readable = self.link.readiness().readable();
                if timeout(deadline - Instant::now(), readable).await.is_err() {
                    break 'window;
                }

                let mut buf = [0u8; 2048];
                while let Ok((size, source)) = self.link.try_recv_from(&mut buf) {
                    self.process_response(&buf[..size], source, &in_flight, &mut candidates);
                }

                if candidates.iter().all(|candidate| candidate.responded) {
                    break 'window;
                }
            }
        }

        if candidates.iter().any(|candidate| candidate.responded) {
            Ok(())
        } else {
            Err(Error::NatQueryFailure)
        }
    }

    fn process_response(
        &self,
        bytes: &[u8],
        source: SocketAddrV4,
        in_flight: &HashMap<TransactionId, usize>,
        candidates: &mut [Candidate],
    ) {
        if !codec::message::is_message(bytes) {
            log::warn!("dropping malformed stun datagram from {}", source);
            return;
        }

        let message = match Message::decode(bytes) {
            Ok(message) => message,
            Err(cause) => {
                log::warn!("rejecting stun message from {}: {}", source, cause);
                return;
            }
        };

        let token = message.token();
        let mut state = self.state.lock();
        if !self.consume_transaction(&mut state, &token) {
            log::warn!("ignoring stun response with unknown transaction id");
            return;
        }

        let Some(&index) = in_flight.get(&token) else {
            // A keepalive transaction answered mid-query; consumed, done.
            return;
        };

        if candidates[index].responded {
            return;
        }

        if message.method() == Method::BindingError {
            let code = message.get::<ErrorCode>().map(|error| error.code);
            log::warn!("binding error from {}: {:?}", source, code);
            return;
        }

        let Some(observed) = message.get::<XorMappedAddress>() else {
            log::warn!("binding response from {} lacks XOR-MAPPED-ADDRESS", source);
            return;
        };

        candidates[index].responded = true;
        self.observe_reflexive(&mut state, observed);
    }
}

struct Candidate {
    address: SocketAddrV4,
    responded: bool,
}

impl NatResolver for StunClient {
    fn query_all_servers(&self) -> BoxFuture<'_, Result<(), Error>> {
        Box::pin(self.query_all())
    }

    fn nat_type(&self) -> NatType {
        self.state.lock().nat_type
    }

    fn reflexive_address(&self) -> Option<SocketAddrV4> {
        self.state.lock().reflexive
    }

    fn invalidate_reflexive_address(&self) {
        let mut state = self.state.lock();
        state.reflexive = None;
        if state.nat_type == NatType::Independent {
            state.nat_type = NatType::Unknown;
        }
    }

    fn keepalive_send(&self) {
        if self.servers.is_empty() {
            log::warn!("keepalive: no stun servers configured");
            return;
        }

        // Callbacks must not block, and the lookup may; resolve and send
        // off the dispatcher.
        let index = rand::rng().random_range(0..self.servers.len());
        let server = self.servers[index].clone();
        let link = self.link.clone();

        let mut token = [0u8; 12];
        rand::rng().fill(&mut token);
        let token = TransactionId::from(token);

        let mut bytes = BytesMut::with_capacity(codec::message::HEADER_SIZE);
        MessageEncoder::new(Method::BindingRequest, &token, &mut bytes).flush();

        {
            let mut state = self.state.lock();
            self.purge_stale(&mut state);
            let now = self.now_ms();
            state.ongoing.insert((now, token));
            state.sent_at.insert(token, now);
        }

        self.handle.spawn(async move {
            let Some(address) = Self::resolve(&server).await else {
                log::warn!("keepalive: stun server {} did not resolve", server);
                return;
            };

            if let Err(cause) = link.try_send_to(&bytes, address) {
                log::warn!("keepalive send to {} failed: {}", address, cause);
            } else {
                log::trace!("keepalive binding request sent to {}", address);
            }
        });
    }

    fn keepalive_receive(&self, bytes: &[u8]) -> Result<(), Error> {
        let message = Message::decode(bytes).map_err(|_| Error::Inval)?;
        let token = message.token();

        let mut state = self.state.lock();
        if self.consume_transaction(&mut state, &token) {
            log::trace!("keepalive binding response consumed");
            Ok(())
        } else {
            Err(Error::Inval)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> StunClient {
        StunClient::new(
            crate::testing::memory_link("10.0.0.1:5000"),
            &config::Stun::default(),
            tokio::runtime::Handle::current(),
        )
    }

    fn response(token: TransactionId, mapped: SocketAddrV4) -> BytesMut {
        let mut bytes = BytesMut::new();
        let mut encoder = MessageEncoder::new(Method::BindingResponse, &token, &mut bytes);
        encoder.append::<XorMappedAddress>(mapped);
        encoder.flush();
        bytes
    }

    #[tokio::test]
    async fn unknown_transaction_ids_are_rejected() {
        let client = client();
        let bytes = response(
            TransactionId::from(*b"never-sent!!"),
            "203.0.113.5:40000".parse().unwrap(),
        );

        assert!(client.keepalive_receive(&bytes).is_err());
    }

    #[tokio::test]
    async fn live_transaction_is_consumed_exactly_once() {
        let client = client();

        let token = client
            .send_request("127.0.0.1:3478".parse().unwrap())
            .unwrap();
        let bytes = response(token, "203.0.113.5:40000".parse().unwrap());

        assert!(client.keepalive_receive(&bytes).is_ok());
        // The id left the live set with the first consume.
        assert!(client.keepalive_receive(&bytes).is_err());
    }

    #[tokio::test]
    async fn verdict_confirms_then_contradicts() {
        let client = client();
        let mapped: SocketAddrV4 = "203.0.113.5:40000".parse().unwrap();

        {
            let mut state = client.state.lock();
            client.observe_reflexive(&mut state, mapped);
            assert_eq!(state.nat_type, NatType::Unknown);
            assert_eq!(state.reflexive, Some(mapped));

            client.observe_reflexive(&mut state, mapped);
            assert_eq!(state.nat_type, NatType::Independent);
        }

        assert_eq!(client.reflexive_address(), Some(mapped));

        {
            let mut state = client.state.lock();
            client.observe_reflexive(&mut state, "203.0.113.5:40001".parse().unwrap());
            assert_eq!(state.nat_type, NatType::Dependent);
            assert_eq!(state.reflexive, None);
        }

        // Dependent is final: queries fail without sending.
        assert_eq!(
            client.query_all_servers().await.err(),
            Some(Error::NatQueryFailure)
        );
    }

    #[tokio::test]
    async fn stale_transactions_are_purged() {
        // A client whose whole backoff schedule is a few milliseconds: a
        // response arriving after the TTL must be ignored.
        let stun = config::Stun {
            timeout_ms: 1,
            max_retransmissions: 1,
            final_timeout_multiplier: 1,
            ..config::Stun::default()
        };

        let client = StunClient::new(
            crate::testing::memory_link("10.0.0.1:5000"),
            &stun,
            tokio::runtime::Handle::current(),
        );

        let token = client
            .send_request("127.0.0.1:3478".parse().unwrap())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        let bytes = response(token, "203.0.113.5:40000".parse().unwrap());
        assert!(client.keepalive_receive(&bytes).is_err());
    }

    #[tokio::test]
    async fn responses_attribute_per_server_once() {
        let client = client();
        let token = client
            .send_request("127.0.0.1:3478".parse().unwrap())
            .unwrap();

        let mut in_flight = HashMap::new();
        in_flight.insert(token, 0usize);
        let mut candidates = [Candidate {
            address: "127.0.0.1:3478".parse().unwrap(),
            responded: false,
        }];

        let bytes = response(token, "203.0.113.5:40000".parse().unwrap());
        client.process_response(
            &bytes,
            "127.0.0.1:3478".parse().unwrap(),
            &in_flight,
            &mut candidates,
        );

        assert!(candidates[0].responded);
        assert_eq!(
            client.reflexive_address(),
            Some("203.0.113.5:40000".parse().unwrap())
        );

        // A duplicate of the same response is no longer live and changes
        // nothing.
        client.process_response(
            &bytes,
            "127.0.0.1:3478".parse().unwrap(),
            &in_flight,
            &mut candidates,
        );
        assert_eq!(client.nat_type(), NatType::Unknown);
    }
}
