mod common;

use std::sync::Arc;

use common::{count, init_tracing};
use serde_json::json;
use transport_peer::loopback::LoopbackFactory;
use transport_peer::{
    LocalTrack, MediaStream, Peer, PeerConfig, PeerError, PeerEvent, Phase, Role,
    SessionDescription, TrackKind, TransportError,
};

fn is_error(event: &PeerEvent) -> bool {
    matches!(event, PeerEvent::Error(_))
}

fn error_of(event: PeerEvent) -> PeerError {
    match event {
        PeerEvent::Error(err) => err,
        other => panic!("expected an error, got {other:?}"),
    }
}

#[test_timeout::tokio_timeout_test(paused)]
async fn unsupported_platform_is_reported_on_creation() {
    init_tracing();
    let err = Peer::new(
        PeerConfig::new(Role::Initiator),
        Arc::new(LoopbackFactory::unsupported()),
    )
    .unwrap_err();
    assert_eq!(err, PeerError::UnsupportedPlatform);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn duplicate_and_unknown_tracks_are_rejected() {
    init_tracing();
    let (mut a, _b) = common::pair();
    let track = LocalTrack::new("mic", TrackKind::Audio);
    a.peer.add_track(track.clone(), MediaStream::new("s"));
    a.peer.add_track(track, MediaStream::new("s"));
    let (event, _) = a.until(is_error).await;
    assert_eq!(error_of(event), PeerError::DuplicateTrack("mic".into()));

    a.peer.remove_track_id("ghost");
    let (event, _) = a.until(is_error).await;
    assert_eq!(error_of(event), PeerError::UnknownTrack("ghost".into()));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn signal_after_close_is_rejected() {
    init_tracing();
    let (mut a, _b) = common::connected_pair().await;
    a.peer.close();
    a.until(|e| matches!(e, PeerEvent::Close)).await;

    a.peer.signal(SessionDescription::offer("v=0\r\n"));
    let (event, _) = a.until(is_error).await;
    assert_eq!(error_of(event), PeerError::PostCloseSignal);

    a.peer.connect(None);
    let (event, _) = a.until(is_error).await;
    assert!(matches!(error_of(event), PeerError::InvalidState(_)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn description_before_connect_is_invalid() {
    init_tracing();
    let (mut a, _b) = common::pair();
    a.peer.signal(SessionDescription::offer("v=0\r\n"));
    let (event, _) = a.until(is_error).await;
    assert!(matches!(error_of(event), PeerError::InvalidState(_)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn stray_answer_is_reported_without_closing() {
    init_tracing();
    let (mut a, _b) = common::connected_pair().await;
    a.peer.signal(SessionDescription::answer("v=0\r\n"));
    let (event, _) = a.until(is_error).await;
    assert!(matches!(error_of(event), PeerError::InvalidState(_)));

    let rest = a.settle().await;
    assert_eq!(count(&rest, |e| matches!(e, PeerEvent::Disconnect)), 0);
    assert_eq!(a.peer.phase().await, Phase::Connected);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn malformed_signals_are_reported() {
    init_tracing();
    let (mut a, _b) = common::connected_pair().await;
    a.peer.signal("not json");
    let (event, _) = a.until(is_error).await;
    assert!(matches!(error_of(event), PeerError::MalformedSignal(_)));

    a.peer.signal(json!({ "type": "pranswer", "sdp": "" }));
    let (event, _) = a.until(is_error).await;
    assert!(matches!(error_of(event), PeerError::MalformedSignal(_)));
    assert_eq!(a.peer.phase().await, Phase::Connected);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failing_transport_call_closes_the_connection() {
    init_tracing();
    let (mut a, _b) = common::pair();
    a.factory.fail_next("create_offer");
    a.peer.connect(None);

    let (event, _) = a.until(is_error).await;
    assert_eq!(
        error_of(event),
        PeerError::Transport(TransportError::operation("create_offer", "injected failure"))
    );
    let rest = a.settle().await;
    assert_eq!(count(&rest, |e| matches!(e, PeerEvent::Disconnect)), 0);
    assert_eq!(a.peer.phase().await, Phase::Closed);
    assert!(a.transport().is_closed());
}

#[test_timeout::tokio_timeout_test(paused)]
async fn failing_transport_creation_is_reported() {
    init_tracing();
    let (mut a, _b) = common::pair();
    a.factory.fail_next("create");
    a.peer.connect(None);
    let (event, _) = a.until(is_error).await;
    assert!(matches!(
        error_of(event),
        PeerError::Transport(TransportError::Operation { op: "create", .. })
    ));
    assert_eq!(a.peer.phase().await, Phase::Closed);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn losing_connectivity_disconnects_both_sides() {
    init_tracing();
    let (mut a, mut b) = common::connected_pair().await;
    a.transport().fail_ice();
    a.until(|e| matches!(e, PeerEvent::Disconnect)).await;
    b.until(|e| matches!(e, PeerEvent::Disconnect)).await;
    assert_eq!(a.peer.phase().await, Phase::Closed);
    assert_eq!(b.peer.phase().await, Phase::Closed);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn channel_on_unconnected_peer_is_rejected() {
    init_tracing();
    let (a, _b) = common::pair();
    let err = a.peer.create_data_channel("chat", None).await.unwrap_err();
    assert!(matches!(err, PeerError::InvalidState(_)));
}

#[test_timeout::tokio_timeout_test(paused)]
async fn deferred_transport_failure_closes_the_connection() {
    init_tracing();
    let (mut a, mut b) = common::connected_pair().await;
    a.transport().report_failure("add_track");

    let (event, _) = a.until(is_error).await;
    assert_eq!(
        error_of(event),
        PeerError::Transport(TransportError::operation("add_track", "reported failure"))
    );
    a.until(|e| matches!(e, PeerEvent::Disconnect)).await;
    b.until(|e| matches!(e, PeerEvent::Disconnect)).await;
    assert_eq!(a.peer.phase().await, Phase::Closed);
}

#[test_timeout::tokio_timeout_test(paused)]
async fn refused_in_band_send_closes_the_connection() {
    init_tracing();
    let (mut a, mut b) = common::connected_pair().await;
    a.transport().refuse_channel_sends();
    a.peer.renegotiate();

    let (event, _) = a.until(is_error).await;
    assert!(matches!(
        error_of(event),
        PeerError::Transport(TransportError::Operation { op: "send", .. })
    ));
    a.until(|e| matches!(e, PeerEvent::Disconnect)).await;
    b.until(|e| matches!(e, PeerEvent::Disconnect)).await;
    assert_eq!(a.peer.phase().await, Phase::Closed);
    assert_eq!(b.peer.phase().await, Phase::Closed);
}
