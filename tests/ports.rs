//! Port connector wired from an on-disk TOML config, end to end: a producer
//! component pushes values through its out port into a channel whose reader
//! is another component's in port.

use std::sync::Arc;
use std::time::Duration;

use weir::channel::ChannelService;
use weir::msg::Msg;
use weir::ports::{ConnectionManager, PortConnector};
use weir::restorer::MemRestorer;

const OUT_DATA: u32 = 1;
const IN_DATA: u32 = 1;

#[test]
fn two_components_exchange_values_over_a_configured_channel() {
    let restorer = Arc::new(MemRestorer::new("pipeline"));
    let service = ChannelService::spawn(restorer.clone(), Duration::from_secs(1));

    let channel = service.create_channel("data", "", 2).unwrap();
    let (reader, writer) = channel.endpoints().unwrap();
    reader.save_as(Some("data-out")).unwrap();
    writer.save_as(Some("data-in")).unwrap();

    let dir = tempfile::tempdir().expect("tempdir");
    let producer_cfg = dir.path().join("producer.toml");
    std::fs::write(&producer_cfg, "[ports.out.data]\nsr = \"data-in\"\n").unwrap();
    let consumer_cfg = dir.path().join("consumer.toml");
    std::fs::write(&consumer_cfg, "[ports.in.data]\nsr = \"data-out\"\n").unwrap();

    let conman = ConnectionManager::new(restorer.clone());
    let mut producer = PortConnector::new(conman.clone(), &[], &[(OUT_DATA, "data")]);
    producer.connect_from_config_file(&producer_cfg);
    let mut consumer = PortConnector::new(conman, &[(IN_DATA, "data")], &[]);
    consumer.connect_from_config_file(&consumer_cfg);

    assert!(producer.is_out_connected(OUT_DATA));
    assert!(consumer.is_in_connected(IN_DATA));

    let out = producer.out_port(OUT_DATA).unwrap();
    out.write(Msg::value("42")).unwrap();
    out.write(Msg::value("43")).unwrap();

    let in_port = consumer.in_port(IN_DATA).unwrap();
    assert_eq!(in_port.read().unwrap(), Msg::value("42"));
    assert_eq!(in_port.read().unwrap(), Msg::value("43"));

    // The producer closing its out ports ends the consumer's stream.
    producer.close_out_ports();
    assert_eq!(in_port.read().unwrap(), Msg::Done);
    consumer.set_in_disconnected(IN_DATA);
    assert!(!consumer.is_in_connected(IN_DATA));
}
