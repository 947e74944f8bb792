mod common;

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use atp::{
    config::{Stun, StunServer},
    error::Error,
    net::SocketFactory,
    stun::{NatResolver, NatType, StunClient},
};

use common::{LabNet, binding_response, echo_mapping, fixed_mapping};

fn stun_config() -> Stun {
    Stun {
        servers: vec![
            StunServer::new("10.0.0.240", "3478"),
            StunServer::new("10.0.0.241", "3478"),
        ],
        timeout_ms: 50,
        max_retransmissions: 2,
        final_timeout_multiplier: 2,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reflexive_address_discovery_happy_path() {
    let lab = LabNet::new();
    lab.add_stun_server("10.0.0.240:3478", fixed_mapping("203.0.113.5:40000"));
    lab.add_stun_server("10.0.0.241:3478", fixed_mapping("203.0.113.5:40000"));

    let client = StunClient::new(
        lab.udp().unwrap(),
        &stun_config(),
        tokio::runtime::Handle::current(),
    );

    client.query_all_servers().await.unwrap();

    assert_eq!(
        client.reflexive_address(),
        Some("203.0.113.5:40000".parse().unwrap())
    );

    // The second server confirmed what the first reported.
    assert_eq!(client.nat_type(), NatType::Independent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn endpoint_dependent_nat_is_final() {
    let lab = LabNet::new();
    let sends = Arc::new(AtomicUsize::new(0));

    for (addr, mapped) in [
        ("10.0.0.240:3478", "203.0.113.5:40000"),
        ("10.0.0.241:3478", "203.0.113.5:40001"),
    ] {
        let mapped: std::net::SocketAddrV4 = mapped.parse().unwrap();
        let sends = sends.clone();
        lab.add_stun_server(
            addr,
            Box::new(move |request, _| {
                sends.fetch_add(1, Ordering::SeqCst);
                binding_response(request, mapped)
            }),
        );
    }

    let client = StunClient::new(
        lab.udp().unwrap(),
        &stun_config(),
        tokio::runtime::Handle::current(),
    );

    client.query_all_servers().await.unwrap();

    // The two servers disagreed: the NAT maps per destination.
    assert_eq!(client.nat_type(), NatType::Dependent);
    assert_eq!(client.reflexive_address(), None);

    // The verdict is final; another query fails without sending anything.
    let sends_before = sends.load(Ordering::SeqCst);
    assert_eq!(
        client.query_all_servers().await.err(),
        Some(Error::NatQueryFailure)
    );
    assert_eq!(sends.load(Ordering::SeqCst), sends_before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn query_fails_when_no_server_answers() {
    let lab = LabNet::new();

    // No responders registered at all; every round times out.
    let client = StunClient::new(
        lab.udp().unwrap(),
        &stun_config(),
        tokio::runtime::Handle::current(),
    );

    assert_eq!(
        client.query_all_servers().await.err(),
        Some(Error::NatQueryFailure)
    );
    assert_eq!(client.nat_type(), NatType::Unknown);
    assert_eq!(client.reflexive_address(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_answering_server_is_enough() {
    let lab = LabNet::new();
    lab.add_stun_server("10.0.0.240:3478", echo_mapping());

    let client = StunClient::new(
        lab.udp().unwrap(),
        &stun_config(),
        tokio::runtime::Handle::current(),
    );

    client.query_all_servers().await.unwrap();

    // One sighting records the endpoint but proves nothing about the NAT.
    assert!(client.reflexive_address().is_some());
    assert_eq!(client.nat_type(), NatType::Unknown);

    // A second query re-asks the same pool; the repeat observation
    // confirms the endpoint.
    client.query_all_servers().await.unwrap();
    assert_eq!(client.nat_type(), NatType::Independent);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalidation_forgets_the_endpoint() {
    let lab = LabNet::new();
    lab.add_stun_server("10.0.0.240:3478", fixed_mapping("203.0.113.5:40000"));
    lab.add_stun_server("10.0.0.241:3478", fixed_mapping("203.0.113.5:40000"));

    let client = StunClient::new(
        lab.udp().unwrap(),
        &stun_config(),
        tokio::runtime::Handle::current(),
    );

    client.query_all_servers().await.unwrap();
    assert!(client.reflexive_address().is_some());

    client.invalidate_reflexive_address();
    assert_eq!(client.reflexive_address(), None);
    assert_eq!(client.nat_type(), NatType::Unknown);

    client.query_all_servers().await.unwrap();
    assert_eq!(
        client.reflexive_address(),
        Some("203.0.113.5:40000".parse().unwrap())
    );
}
