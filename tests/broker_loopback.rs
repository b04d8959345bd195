//! Whole-broker exercise: two brokers on the loopback exchange a reliable
//! message end to end, through the socket, the protocol engines, the
//! dispatcher, and the scheduler.

use std::time::Duration;

use grid_broker::{Broker, Config, Message, PeerId, ProtocolKind, Timings};
use tokio::sync::mpsc;

fn config_for(port: u16, peer_port: u16) -> Config {
    let mut config = Config::default();
    config.listen_address = "127.0.0.1".to_string();
    config.listen_port = port;
    config.peers = vec![PeerId::parse(&format!("127.0.0.1:{}", peer_port)).unwrap()];
    config
}

#[tokio::test]
async fn reliable_message_crosses_the_loopback() {
    let timings = Timings::for_tests();
    let config_a = config_for(39871, 39872);
    let config_b = config_for(39872, 39871);

    let mut broker_a = Broker::new(&config_a, &timings).await.unwrap();
    let mut broker_b = Broker::new(&config_b, &timings).await.unwrap();
    broker_a.register_module("gm", Duration::from_millis(timings.GM_PHASE_TIME));
    broker_b.register_module("gm", Duration::from_millis(timings.GM_PHASE_TIME));

    let (tx, mut rx) = mpsc::unbounded_channel();
    broker_b.register_handler(
        "gm",
        "invite",
        Box::new(move |msg| {
            let _ = tx.send(msg.clone());
        }),
    );

    let handle_a = broker_a.handle();
    let handle_b = broker_b.handle();
    let run_a = tokio::spawn(broker_a.run());
    let run_b = tokio::spawn(broker_b.run());

    let mut invite = Message::new("gm.invite", ProtocolKind::Src);
    invite.submessages.put("gm.invite.leader", "127.0.0.1:39871");
    handle_a.send(PeerId::parse("127.0.0.1:39872").unwrap(), invite);

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("message should arrive before the timeout")
        .expect("handler channel should stay open");

    assert_eq!(received.handler_key, "gm.invite");
    assert_eq!(
        received.source_peer_id.as_ref().map(|id| id.as_str()),
        Some("127.0.0.1:39871")
    );
    assert_eq!(
        received.submessages.get("gm.invite.leader"),
        Some("127.0.0.1:39871")
    );

    handle_a.stop();
    handle_b.stop();
    run_a.await.unwrap().unwrap();
    run_b.await.unwrap().unwrap();
}
