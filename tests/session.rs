mod common;

use std::time::Duration;

use bitalino_ble::client::{BitalinoClient, BitalinoClientConfig};
use bitalino_ble::error::{BitalinoError, TransportError};
use bitalino_ble::mock::{MockCall, MockStep, MockTransport};
use bitalino_ble::protocol::{NOTIFY_CHARACTERISTIC, WRITE_CHARACTERISTIC};
use bitalino_ble::transport::DeviceFilter;
use bitalino_ble::types::{BitalinoEvent, ConnectionState, DeviceIdentity, StreamConfig};

use common::{client, connected, next_event};

#[tokio::test]
async fn connect_resolves_session_and_publishes() {
    let client = client();
    let mut rx = client.subscribe();

    let device = client.connect().await.unwrap();
    assert_eq!(device.name.as_deref(), Some("BITalino-15-44"));

    assert_eq!(client.state(), ConnectionState::Connected);
    let status = client.status();
    assert_eq!(status.device, Some(device.clone()));
    assert!(!status.streaming);
    assert!(status.last_sample.is_none());

    assert_eq!(
        client.transport().calls(),
        vec![
            MockCall::Select,
            MockCall::Connect(device.id.clone()),
            MockCall::Resolve
        ]
    );
    assert_eq!(next_event(&mut rx).await, BitalinoEvent::Connected(device));
}

#[tokio::test]
async fn second_connect_is_rejected_without_side_effects() {
    let client = connected().await;
    assert_eq!(client.connect().await, Err(BitalinoError::AlreadyConnected));
    assert_eq!(client.state(), ConnectionState::Connected);
    assert!(client.transport().calls().is_empty());

    client
        .start_streaming(StreamConfig::default())
        .await
        .unwrap();
    assert_eq!(client.connect().await, Err(BitalinoError::AlreadyConnected));
    assert_eq!(client.state(), ConnectionState::Streaming);
}

#[tokio::test]
async fn connect_while_connecting_is_rejected() {
    let client = client();
    let gate = client.transport().hold(MockStep::Connect);

    let first = client.connect();
    tokio::pin!(first);
    tokio::select! {
        _ = &mut first => panic!("connect finished while held"),
        _ = gate.reached() => {}
    }

    assert_eq!(client.state(), ConnectionState::Connecting);
    assert_eq!(
        client.connect().await,
        Err(BitalinoError::ConnectionInProgress)
    );
    assert_eq!(
        client.disconnect().await,
        Err(BitalinoError::ConnectionInProgress)
    );

    gate.release();
    first.await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn abandoned_connect_resets_to_disconnected() {
    let client = client();
    let _gate = client.transport().hold(MockStep::Connect);

    let attempt = tokio::time::timeout(Duration::from_millis(50), client.connect()).await;
    assert!(attempt.is_err());

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.device.is_none());
    assert_eq!(client.disconnect().await, Ok(()));

    // The next attempt closes whatever the abandoned one left behind.
    client.transport().clear_calls();
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    let calls = client.transport().calls();
    assert_eq!(&calls[..2], &[MockCall::Disconnect, MockCall::Select]);
}

#[tokio::test]
async fn connect_failures_map_to_typed_errors() {
    let cases = [
        (
            MockStep::Select,
            TransportError::Unavailable,
            BitalinoError::CapabilityUnavailable,
        ),
        (
            MockStep::Select,
            TransportError::Cancelled,
            BitalinoError::SelectionCancelled,
        ),
        (
            MockStep::Connect,
            TransportError::Timeout("BLE connect".into()),
            BitalinoError::ConnectFailed("BLE connect timed out".into()),
        ),
    ];
    for (step, err, expected) in cases {
        let client = client();
        client.transport().fail(step, err);
        assert_eq!(client.connect().await, Err(expected));
        let status = client.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert!(status.device.is_none());
    }
}

#[tokio::test]
async fn failed_resolve_closes_the_link() {
    let client = client();
    client
        .transport()
        .fail(MockStep::Resolve, TransportError::NotFound("service".into()));

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, BitalinoError::ConnectFailed(_)));
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(client.transport().calls().last(), Some(&MockCall::Disconnect));
    assert!(!client.transport().is_connected());

    // A clean retry works once the device behaves.
    client.transport().clear_failures();
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn filter_that_matches_nothing_fails_connect() {
    let config = BitalinoClientConfig {
        filter: DeviceFilter {
            name_prefix: Some("Polar".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    let client = BitalinoClient::new(MockTransport::new(), config);
    assert!(matches!(
        client.connect().await,
        Err(BitalinoError::ConnectFailed(_))
    ));
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn unnamed_device_gets_display_name() {
    let mock = MockTransport::with_device(DeviceIdentity::new("AA:BB:CC:DD:EE:FF", None));
    let client = BitalinoClient::new(mock, BitalinoClientConfig::default());
    let device = client.connect().await.unwrap();
    assert_eq!(device.display_name(), "BITalino device");
}

#[tokio::test]
async fn disconnect_from_connected() {
    let client = connected().await;
    let mut rx = client.subscribe();

    client.disconnect().await.unwrap();

    let status = client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(status.device.is_none());
    assert_eq!(client.transport().calls(), vec![MockCall::Disconnect]);
    assert_eq!(
        next_event(&mut rx).await,
        BitalinoEvent::Disconnected { requested: true }
    );
}

#[tokio::test]
async fn disconnect_while_streaming_stops_first() {
    let client = connected().await;
    client
        .start_streaming(StreamConfig::default())
        .await
        .unwrap();
    client.transport().clear_calls();

    client.disconnect().await.unwrap();

    assert_eq!(
        client.transport().calls(),
        vec![
            MockCall::Write(WRITE_CHARACTERISTIC, vec![0x00]),
            MockCall::Unsubscribe(NOTIFY_CHARACTERISTIC),
            MockCall::Disconnect,
        ]
    );
    let status = client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.streaming);
}

#[tokio::test]
async fn disconnect_survives_failing_stop_and_transport() {
    let client = connected().await;
    client
        .start_streaming(StreamConfig::default())
        .await
        .unwrap();
    client
        .transport()
        .fail(MockStep::Write, TransportError::NotConnected);
    client
        .transport()
        .fail(MockStep::Disconnect, TransportError::Ble("gone".into()));

    client.disconnect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_is_rejected_while_start_is_pending() {
    let client = connected().await;
    let gate = client.transport().hold(MockStep::Write);

    let start = client.start_streaming(StreamConfig::default());
    tokio::pin!(start);
    tokio::select! {
        _ = &mut start => panic!("start finished while held"),
        _ = gate.reached() => {}
    }

    assert_eq!(
        client.disconnect().await,
        Err(BitalinoError::OperationInProgress("start_streaming"))
    );

    gate.release();
    start.await.unwrap();
    assert_eq!(client.state(), ConnectionState::Streaming);

    // Once the start has landed, disconnect shuts the stream down first.
    client.transport().clear_calls();
    client.disconnect().await.unwrap();
    assert_eq!(
        client.transport().calls(),
        vec![
            MockCall::Write(WRITE_CHARACTERISTIC, vec![0x00]),
            MockCall::Unsubscribe(NOTIFY_CHARACTERISTIC),
            MockCall::Disconnect,
        ]
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn disconnect_when_disconnected_is_a_noop() {
    let client = client();
    client.disconnect().await.unwrap();
    assert!(client.transport().calls().is_empty());
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn link_loss_while_streaming_is_one_transition() {
    let client = connected().await;
    client
        .start_streaming(StreamConfig::default())
        .await
        .unwrap();
    let mut rx = client.subscribe();
    let mut status_rx = client.watch_status();

    assert!(client.transport().drop_link().await);
    assert_eq!(
        next_event(&mut rx).await,
        BitalinoEvent::Disconnected { requested: false }
    );

    // The snapshot goes straight from Streaming to Disconnected.
    assert!(status_rx.has_changed().unwrap());
    let status = status_rx.borrow_and_update().clone();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.streaming);
    assert!(status.device.is_none());

    // Nothing left to stop, and the client can connect again.
    assert_eq!(
        client.start_streaming(StreamConfig::default()).await,
        Err(BitalinoError::NotConnected(ConnectionState::Disconnected))
    );
    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn link_loss_during_connect_wins() {
    let client = client();
    let mut rx = client.subscribe();
    let gate = client.transport().hold(MockStep::Resolve);

    let connect = client.connect();
    tokio::pin!(connect);
    tokio::select! {
        _ = &mut connect => panic!("connect finished while held"),
        _ = gate.reached() => {}
    }

    assert!(client.transport().drop_link().await);
    assert_eq!(
        next_event(&mut rx).await,
        BitalinoEvent::Disconnected { requested: false }
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);

    gate.release();
    assert_eq!(
        connect.await,
        Err(BitalinoError::Disconnected("connect"))
    );
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(client.status().device.is_none());
}

#[tokio::test]
async fn link_loss_during_start_wins() {
    let client = connected().await;
    let mut rx = client.subscribe();
    let gate = client.transport().hold(MockStep::Write);

    let start = client.start_streaming(StreamConfig::default());
    tokio::pin!(start);
    tokio::select! {
        _ = &mut start => panic!("start finished while held"),
        _ = gate.reached() => {}
    }

    assert!(client.transport().drop_link().await);
    assert_eq!(
        next_event(&mut rx).await,
        BitalinoEvent::Disconnected { requested: false }
    );

    gate.release();
    assert_eq!(
        start.await,
        Err(BitalinoError::Disconnected("start_streaming"))
    );
    let status = client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.streaming);
}

#[tokio::test]
async fn link_loss_during_stop_wins() {
    let client = connected().await;
    client
        .start_streaming(StreamConfig::default())
        .await
        .unwrap();
    let mut rx = client.subscribe();
    let gate = client.transport().hold(MockStep::Unsubscribe);

    let stop = client.stop_streaming();
    tokio::pin!(stop);
    tokio::select! {
        _ = &mut stop => panic!("stop finished while held"),
        _ = gate.reached() => {}
    }

    assert!(client.transport().drop_link().await);
    assert_eq!(
        next_event(&mut rx).await,
        BitalinoEvent::Disconnected { requested: false }
    );

    gate.release();
    assert_eq!(
        stop.await,
        Err(BitalinoError::Disconnected("stop_streaming"))
    );
    let status = client.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    assert!(!status.streaming);
}

/// Walk scripted operation sequences and check that `start_streaming`
/// succeeds exactly when the client was `Connected` beforehand.
#[tokio::test]
async fn start_succeeds_only_from_connected() {
    #[derive(Clone, Copy, Debug)]
    enum Action {
        Connect,
        Disconnect,
        Start,
        Stop,
        LinkLoss,
    }
    use Action::*;

    let scripts: &[&[Action]] = &[
        &[Start, Connect, Start, Start, Stop, Start],
        &[Connect, Stop, Start, Disconnect, Start],
        &[Connect, Start, LinkLoss, Start, Connect, Start, Stop, Stop],
        &[Connect, LinkLoss, Stop, Start, Disconnect, Connect, Start],
        &[Disconnect, Stop, Connect, Connect, Start, Disconnect, Disconnect],
    ];

    for script in scripts {
        let client = client();
        let mut rx = client.subscribe();
        for &action in *script {
            let before = client.state();
            match action {
                Connect => {
                    let _ = client.connect().await;
                }
                Disconnect => {
                    let _ = client.disconnect().await;
                }
                Start => {
                    let ok = client.start_streaming(StreamConfig::default()).await.is_ok();
                    assert_eq!(
                        ok,
                        before == ConnectionState::Connected,
                        "{script:?}: start from {before}"
                    );
                }
                Stop => {
                    let _ = client.stop_streaming().await;
                }
                LinkLoss => {
                    if client.transport().drop_link().await {
                        loop {
                            if let BitalinoEvent::Disconnected { .. } = next_event(&mut rx).await {
                                break;
                            }
                        }
                    }
                    let status = client.status();
                    assert_eq!(status.state, ConnectionState::Disconnected);
                    assert!(!status.streaming);
                }
            }
            let status = client.status();
            assert_eq!(status.streaming, status.state == ConnectionState::Streaming);
        }
    }
}
