//! Gateway service tests over a running loop with a short heartbeat
//! interval: registrations survive while beaten and lapse afterwards.

use std::sync::Arc;
use std::time::{Duration, Instant};

use weir::channel::ChannelService;
use weir::gateway::GatewayService;
use weir::restorer::{Cap, MemRestorer, Restorer};

#[test]
fn heartbeat_keeps_a_registration_alive_until_it_stops() {
    let restorer = Arc::new(MemRestorer::new("gw"));
    let channels = ChannelService::spawn(restorer.clone(), Duration::from_secs(1));
    let channel = channels.create_channel("exposed", "", 1).unwrap();

    // Interval 1s, so the GC sweeps every 3s.
    let gateway = GatewayService::spawn(restorer.clone(), "Gateway", "", 1);
    let client = gateway.client();

    let registered = client
        .register(Cap::Channel(channel.clone()), Some("seed"))
        .unwrap();
    assert_eq!(registered.secs_heartbeat_interval, 1);
    let token = registered.sturdy_ref.token().to_string();
    assert!(restorer.restore(&token).is_ok());

    // Beat for a bit more than one sweep period; the entry must survive.
    let beat_until = Instant::now() + Duration::from_secs(4);
    while Instant::now() < beat_until {
        registered.heartbeat.beat().unwrap();
        std::thread::sleep(Duration::from_millis(300));
    }
    assert!(
        restorer.restore(&token).is_ok(),
        "beaten registration must survive the sweep"
    );

    // Stop beating: evicted within two sweep periods.
    let deadline = Instant::now() + Duration::from_secs(8);
    loop {
        if restorer.restore(&token).is_err() {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "lapsed registration was never evicted"
        );
        std::thread::sleep(Duration::from_millis(200));
    }

    gateway.shutdown();
}

#[test]
fn reregistration_with_the_same_seed_replaces_the_mapping() {
    let restorer = Arc::new(MemRestorer::new("gw"));
    let channels = ChannelService::spawn(restorer.clone(), Duration::from_secs(1));
    let channel = channels.create_channel("exposed", "", 1).unwrap();

    // Long interval: no sweep interferes with the test.
    let gateway = GatewayService::spawn(restorer.clone(), "Gateway", "", 600);
    let client = gateway.client();

    let first = client
        .register(Cap::Channel(channel.clone()), Some("stable-seed"))
        .unwrap();
    // A client that lost its heartbeat but kept its seed lands on the same
    // sturdy ref.
    let second = client
        .register(Cap::Channel(channel), Some("stable-seed"))
        .unwrap();

    assert_eq!(first.heartbeat.cap_id(), second.heartbeat.cap_id());
    assert_eq!(first.sturdy_ref.token(), second.sturdy_ref.token());
    assert!(restorer.restore(second.sturdy_ref.token()).is_ok());

    gateway.shutdown();
}

#[test]
fn restore_forwards_to_the_restorer() {
    let restorer = Arc::new(MemRestorer::new("gw"));
    let channels = ChannelService::spawn(restorer.clone(), Duration::from_secs(1));
    let channel = channels.create_channel("exposed", "", 1).unwrap();

    let gateway = GatewayService::spawn(restorer.clone(), "Gateway", "", 600);
    let client = gateway.client();

    let registered = client.register(Cap::Channel(channel), None).unwrap();
    let cap = client.restore(registered.sturdy_ref.as_str()).unwrap();
    assert!(cap.into_channel().is_some());

    assert!(client.restore("weir://gw/unknown-token").is_err());

    let info = client.info().unwrap();
    assert_eq!(info.name, "Gateway");

    gateway.shutdown();
}
