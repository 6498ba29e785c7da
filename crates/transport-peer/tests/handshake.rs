mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{count, init_tracing, joined, wired, QUIET};
use transport_peer::loopback;
use transport_peer::{
    CandidateMode, ChannelPayload, IceCandidate, Peer, PeerConfig, PeerEvent, Phase, Role,
    SessionDescription,
};

fn batched(role: Role) -> PeerConfig {
    PeerConfig::new(role).with_candidate_mode(CandidateMode::Batched)
}

#[test_timeout::tokio_timeout_test(paused)]
async fn trickle_handshake_connects_each_side_once() {
    init_tracing();
    let (mut a, mut b) = common::pair();
    a.peer.connect(None);
    b.peer.connect(None);

    let before = a.connected().await;
    assert!(count(&before, |e| matches!(e, PeerEvent::Signal(_))) >= 2);
    b.connected().await;

    let rest = joined([a.settle().await, b.settle().await]);
    assert_eq!(count(&rest, |e| matches!(e, PeerEvent::Connect)), 0);
    assert_eq!(count(&rest, |e| matches!(e, PeerEvent::Error(_))), 0);
    assert_eq!(a.peer.phase().await, Phase::Connected);
    assert_eq!(b.peer.phase().await, Phase::Connected);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn batched_mode_sends_a_single_description_per_side() {
    init_tracing();
    let (mut a, mut b) = wired(
        PeerConfig::new(Role::Initiator).with_candidate_mode(CandidateMode::Batched),
        PeerConfig::new(Role::Responder).with_trickle(false),
    );
    a.peer.connect(None);
    b.peer.connect(None);

    let a_seen = joined([a.connected().await, a.settle().await]);
    let b_seen = joined([b.connected().await, b.settle().await]);

    assert_eq!(a.signals, 1);
    assert_eq!(b.signals, 1);
    for seen in [&a_seen, &b_seen] {
        assert_eq!(count(seen, |e| matches!(e, PeerEvent::IceComplete)), 1);
        let description = seen
            .iter()
            .find_map(|event| match event {
                PeerEvent::Signal(message) => message.description().cloned(),
                _ => None,
            })
            .expect("description signalled");
        assert!(description.sdp.contains("a=candidate:"));
    }
}

#[test_timeout::tokio_timeout_test(paused)]
async fn data_channel_carries_text_and_binary() {
    init_tracing();
    let (a, mut b) = common::connected_pair().await;

    let local = a
        .peer
        .create_data_channel("chat", None)
        .await
        .expect("channel created");
    assert!(local.opened().await);
    assert!(local.ordered());

    let (event, _) = b
        .until(|event| matches!(event, PeerEvent::DataChannel(_)))
        .await;
    let PeerEvent::DataChannel(remote) = event else {
        unreachable!()
    };
    assert_eq!(remote.label(), "chat");

    local.send("wow").expect("send text");
    assert_eq!(remote.recv_message().await, Some(ChannelPayload::from("wow")));

    remote
        .send(Bytes::from_static(&[1, 127, 255]))
        .expect("send binary");
    let reply = local.recv_message().await.expect("binary reply");
    assert_eq!(reply.as_bytes(), &[1, 127, 255]);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn reserved_channel_label_is_rejected() {
    init_tracing();
    let (a, _b) = common::connected_pair().await;
    let err = a
        .peer
        .create_data_channel(transport_peer::INTERNAL_CHANNEL_LABEL, None)
        .await
        .unwrap_err();
    assert!(matches!(err, transport_peer::PeerError::InvalidState(_)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn close_is_idempotent_and_disconnects_the_remote() {
    init_tracing();
    let (mut a, mut b) = common::connected_pair().await;

    a.peer.close();
    a.peer.close();
    let a_seen = a.settle().await;
    assert_eq!(count(&a_seen, |e| matches!(e, PeerEvent::Close)), 1);
    assert_eq!(count(&a_seen, |e| matches!(e, PeerEvent::Disconnect)), 1);
    assert_eq!(a.peer.phase().await, Phase::Closed);
    assert!(a.transport().is_closed());

    let b_seen = b.settle().await;
    assert_eq!(count(&b_seen, |e| matches!(e, PeerEvent::Disconnect)), 1);
    assert_eq!(count(&b_seen, |e| matches!(e, PeerEvent::Close)), 0);
    assert_eq!(b.peer.phase().await, Phase::Closed);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn disconnected_peers_can_connect_again() {
    init_tracing();
    let (mut a, mut b) = common::connected_pair().await;
    a.peer.disconnect();
    a.until(|e| matches!(e, PeerEvent::Disconnect)).await;
    b.until(|e| matches!(e, PeerEvent::Disconnect)).await;
    let first = a.transport();

    a.peer.connect(None);
    b.peer.connect(None);
    a.connected().await;
    b.connected().await;
    assert!(first.is_closed());
    assert!(!a.transport().is_closed());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn roles_follow_peer_ids() {
    init_tracing();
    let (mut a, mut b) = wired(
        PeerConfig::default().with_id("peer-b"),
        PeerConfig::default().with_id("peer-a"),
    );
    assert_eq!(a.peer.id(), "peer-b");
    a.peer.connect(Some("peer-a"));
    b.peer.connect(Some("peer-b"));
    a.connected().await;
    b.connected().await;
}

#[test_timeout::tokio_timeout_test(paused)]
async fn connecting_to_own_id_is_rejected() {
    init_tracing();
    let (mut a, _b) = wired(
        PeerConfig::default().with_id("same"),
        PeerConfig::default().with_id("other"),
    );
    a.peer.connect(Some("same"));
    let (event, _) = a.until(|e| matches!(e, PeerEvent::Error(_))).await;
    assert!(matches!(
        event,
        PeerEvent::Error(transport_peer::PeerError::InvalidState(_))
    ));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn dropping_every_handle_stops_the_negotiator() {
    init_tracing();
    let (factory, _other) = loopback::pair();
    let (peer, mut events) =
        Peer::new(PeerConfig::new(Role::Initiator), Arc::new(factory)).expect("peer");
    let clone = peer.clone();
    drop(peer);
    drop(clone);
    assert!(events.recv().await.is_none());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn batched_mode_publishes_after_the_gather_debounce() {
    init_tracing();
    let (mut a, mut b) = wired(batched(Role::Initiator), batched(Role::Responder));
    a.factory.silence_gathering_complete();
    b.factory.silence_gathering_complete();
    a.peer.connect(None);
    b.peer.connect(None);

    let a_seen = joined([a.connected().await, a.settle().await]);
    let b_seen = joined([b.connected().await, b.settle().await]);

    assert_eq!(a.signals, 1);
    assert_eq!(b.signals, 1);
    for seen in [&a_seen, &b_seen] {
        assert_eq!(count(seen, |e| matches!(e, PeerEvent::IceComplete)), 1);
        assert_eq!(count(seen, |e| matches!(e, PeerEvent::Error(_))), 0);
        let description = seen
            .iter()
            .find_map(|event| match event {
                PeerEvent::Signal(message) => message.description().cloned(),
                _ => None,
            })
            .expect("description signalled");
        assert!(description.sdp.contains("a=candidate:"));
    }
    assert_eq!(a.peer.phase().await, Phase::Connected);
    assert_eq!(b.peer.phase().await, Phase::Connected);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn close_while_offer_is_produced_sends_nothing() {
    init_tracing();
    let (mut a, mut b) = common::pair();
    a.factory.delay_next("create_offer", Duration::from_secs(1));
    a.peer.connect(None);
    b.peer.connect(None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.peer.close();

    let seen = a.settle().await;
    assert_eq!(a.signals, 0);
    assert_eq!(count(&seen, |e| matches!(e, PeerEvent::Close)), 1);
    assert_eq!(count(&seen, |e| matches!(e, PeerEvent::Error(_))), 0);
    assert!(b.settle().await.is_empty());
    assert_eq!(a.peer.phase().await, Phase::Closed);
    assert!(a.transport().is_closed());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn close_during_gather_debounce_sends_nothing() {
    init_tracing();
    let (mut a, mut b) = wired(batched(Role::Initiator), batched(Role::Responder));
    a.factory.silence_gathering_complete();
    a.peer.connect(None);
    b.peer.connect(None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    a.peer.close();

    let seen = a.settle().await;
    assert_eq!(a.signals, 0);
    assert_eq!(count(&seen, |e| matches!(e, PeerEvent::IceComplete)), 0);
    assert_eq!(count(&seen, |e| matches!(e, PeerEvent::Close)), 1);
    assert_eq!(b.signals, 0);
    b.settle().await;
    assert_eq!(b.signals, 0);
}

fn remote_offer(version: u32) -> SessionDescription {
    SessionDescription::offer(format!(
        "v=0\r\no=- 77 {version} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n"
    ))
}

fn remote_candidate(port: u16) -> IceCandidate {
    IceCandidate::new(format!("candidate:1 1 udp 2122260223 127.0.0.1 {port} typ host"))
        .with_mid("0", 0)
}

#[test_timeout::tokio_timeout_test(paused)]
async fn candidates_for_a_superseded_offer_are_discarded() {
    init_tracing();
    let (_left, right) = loopback::pair();
    let factory = Arc::new(right);
    let (peer, mut events) =
        Peer::new(PeerConfig::new(Role::Responder), factory.clone()).expect("peer");
    peer.connect(None);
    peer.signal(remote_offer(1));
    peer.signal(remote_candidate(50_001));
    peer.signal(remote_offer(2));

    let answer = loop {
        match events.recv().await.expect("event stream ended") {
            PeerEvent::Signal(message) => {
                if let Some(description) = message.description() {
                    break description.clone();
                }
            }
            PeerEvent::Error(err) => panic!("unexpected error: {err}"),
            _ => {}
        }
    };
    assert!(!answer.is_offer());
    tokio::time::sleep(QUIET).await;
    let transport = factory.latest().expect("transport created");
    assert_eq!(transport.remote_candidate_count(), 0);

    peer.signal(remote_candidate(50_002));
    tokio::time::sleep(QUIET).await;
    assert_eq!(transport.remote_candidate_count(), 1);
    while let Some(event) = events.try_recv() {
        assert!(!matches!(event, PeerEvent::Error(_)), "{event:?}");
    }
}
