#![allow(dead_code)]

use std::time::Duration;

use tokio::sync::broadcast;

use bitalino_ble::client::{BitalinoClient, BitalinoClientConfig};
use bitalino_ble::mock::MockTransport;
use bitalino_ble::types::BitalinoEvent;

pub type MockClient = BitalinoClient<MockTransport>;

pub fn client() -> MockClient {
    BitalinoClient::new(MockTransport::new(), BitalinoClientConfig::default())
}

pub async fn connected() -> MockClient {
    let client = client();
    client.connect().await.expect("mock connect");
    client.transport().clear_calls();
    client
}

/// Next event, failing the test instead of hanging.
pub async fn next_event(rx: &mut broadcast::Receiver<BitalinoEvent>) -> BitalinoEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}
