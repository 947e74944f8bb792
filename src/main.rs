#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use atp::{
    config::Config,
    net::{NetFactory, SocketFactory},
    stun::{NatResolver, StunClient},
};

/// Probe the NAT in front of this host: query the configured binding
/// servers, print the reflexive address and the traversability verdict.
fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.stun.servers.is_empty() {
        log::warn!("No stun servers configured, there is nothing to probe :-)");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let link = NetFactory::new(runtime.handle().clone()).udp()?;
    let client = Arc::new(StunClient::new(
        link,
        &config.stun,
        runtime.handle().clone(),
    ));

    // Two passes, like socket creation: one to learn the reflexive
    // address, one to confirm or contradict it.
    for _ in 0..2 {
        runtime.block_on(client.query_all_servers())?;
    }

    match client.reflexive_address() {
        Some(address) => println!("reflexive address: {}", address),
        None => println!("reflexive address: unknown"),
    }

    println!("nat verdict: {:?}", client.nat_type());
    Ok(())
}
