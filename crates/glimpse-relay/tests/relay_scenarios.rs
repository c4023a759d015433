//! End-to-end relay scenarios over real sockets.

use std::time::Duration;

use glimpse_protocol::client::{RelayClient, RelayClientConfig, RelayClientEvent};
use glimpse_protocol::messages::{
    encode_message, ChannelMessage, MessageDestination, MessageKind, TryConnectError,
};
use glimpse_protocol::rpc::ServerEvent;
use glimpse_relay::server::RelayServer;
use tokio::sync::mpsc;

async fn start_relay() -> String {
    let server = RelayServer::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _ = server.serve().await;
    });
    addr
}

fn client(addr: &str, name: &str) -> (std::sync::Arc<RelayClient>, mpsc::UnboundedReceiver<RelayClientEvent>) {
    RelayClient::connect(RelayClientConfig {
        addr: addr.to_string(),
        display_name: name.to_string(),
    })
}

/// Wait until `predicate` matches an incoming server event.
async fn expect_event<F, T>(
    events: &mut mpsc::UnboundedReceiver<RelayClientEvent>,
    mut predicate: F,
) -> T
where
    F: FnMut(&ServerEvent) -> Option<T>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await.expect("event stream ended") {
                RelayClientEvent::Event(event) => {
                    if let Some(found) = predicate(&event) {
                        return found;
                    }
                }
                RelayClientEvent::Connected | RelayClientEvent::Disconnected => {}
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn credentials(
    events: &mut mpsc::UnboundedReceiver<RelayClientEvent>,
) -> (String, String, String) {
    expect_event(events, |event| match event {
        ServerEvent::CredentialsAssigned {
            client_id,
            username,
            password,
        } => Some((client_id.clone(), username.clone(), password.clone())),
        _ => None,
    })
    .await
}

#[tokio::test]
async fn credentials_flow_creates_a_session() {
    let addr = start_relay().await;

    let (_presenter, mut presenter_events) = client(&addr, "Host");
    let (viewer, mut viewer_events) = client(&addr, "Guest");

    let (_p_id, p_user, p_pass) = credentials(&mut presenter_events).await;
    let (v_id, _v_user, _v_pass) = credentials(&mut viewer_events).await;

    let connection_id = viewer
        .connect_to(&p_user, &p_pass)
        .await
        .unwrap()
        .expect("connect should succeed");

    // Presenter: ConnectionStarted(is_presenter) then ConnectionChanged
    // carrying the viewer.
    let is_presenter = expect_event(&mut presenter_events, |event| match event {
        ServerEvent::ConnectionStarted { is_presenter, .. } => Some(*is_presenter),
        _ => None,
    })
    .await;
    assert!(is_presenter);

    let info = expect_event(&mut presenter_events, |event| match event {
        ServerEvent::ConnectionChanged { info } => Some(info.clone()),
        _ => None,
    })
    .await;
    assert_eq!(info.connection_id, connection_id);
    assert_eq!(info.viewers.len(), 1);
    assert_eq!(info.viewers[0].client_id, v_id);
    assert_eq!(info.viewers[0].display_name, "Guest");

    // Viewer: ConnectionStarted(!is_presenter).
    let is_presenter = expect_event(&mut viewer_events, |event| match event {
        ServerEvent::ConnectionStarted { is_presenter, .. } => Some(*is_presenter),
        _ => None,
    })
    .await;
    assert!(!is_presenter);
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let addr = start_relay().await;

    let (_presenter, mut presenter_events) = client(&addr, "Host");
    let (viewer, mut viewer_events) = client(&addr, "Guest");

    let (_, p_user, _) = credentials(&mut presenter_events).await;
    let _ = credentials(&mut viewer_events).await;

    assert_eq!(
        viewer.connect_to(&p_user, "wrong-password").await.unwrap(),
        Err(TryConnectError::InvalidCredentials)
    );
    assert_eq!(
        viewer.connect_to("0000000000", "whatever").await.unwrap(),
        Err(TryConnectError::NotFound)
    );
}

#[tokio::test]
async fn password_compare_ignores_case() {
    let addr = start_relay().await;

    let (_presenter, mut presenter_events) = client(&addr, "Host");
    let (viewer, mut viewer_events) = client(&addr, "Guest");

    let (_, p_user, p_pass) = credentials(&mut presenter_events).await;
    let _ = credentials(&mut viewer_events).await;

    let result = viewer
        .connect_to(&p_user, &p_pass.to_ascii_uppercase())
        .await
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn messages_route_between_presenter_and_viewer() {
    let addr = start_relay().await;

    let (presenter, mut presenter_events) = client(&addr, "Host");
    let (viewer, mut viewer_events) = client(&addr, "Guest");

    let (p_id, p_user, p_pass) = credentials(&mut presenter_events).await;
    let (v_id, _, _) = credentials(&mut viewer_events).await;

    let connection_id = viewer.connect_to(&p_user, &p_pass).await.unwrap().unwrap();

    // Viewer asks for the display list.
    use glimpse_protocol::connection::MessageOutlet;
    let request = ChannelMessage::DisplayRequestList;
    viewer
        .send_message(
            &connection_id,
            request.kind(),
            encode_message(&request).unwrap(),
            MessageDestination::PresenterOnly,
            None,
        )
        .await
        .unwrap();

    let (sender, kind) = expect_event(&mut presenter_events, |event| match event {
        ServerEvent::MessageReceived {
            sender_client_id,
            kind,
            ..
        } => Some((sender_client_id.clone(), *kind)),
        _ => None,
    })
    .await;
    assert_eq!(sender, v_id);
    assert_eq!(kind, MessageKind::DisplayRequestList);

    // Presenter answers to the specific viewer.
    let list = ChannelMessage::DisplayList { displays: vec![] };
    presenter
        .send_message(
            &connection_id,
            list.kind(),
            encode_message(&list).unwrap(),
            MessageDestination::SpecificClients,
            Some(vec![v_id.clone()]),
        )
        .await
        .unwrap();

    let from = expect_event(&mut viewer_events, |event| match event {
        ServerEvent::MessageReceived {
            sender_client_id,
            kind: MessageKind::DisplayList,
            ..
        } => Some(sender_client_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(from, p_id);
}

#[tokio::test]
async fn presenter_disconnect_stops_the_session() {
    let addr = start_relay().await;

    let (presenter, mut presenter_events) = client(&addr, "Host");
    let (viewer, mut viewer_events) = client(&addr, "Guest");

    let (_, p_user, p_pass) = credentials(&mut presenter_events).await;
    let _ = credentials(&mut viewer_events).await;

    let connection_id = viewer.connect_to(&p_user, &p_pass).await.unwrap().unwrap();

    // Presenter vanishes.
    presenter.stop();

    let stopped = expect_event(&mut viewer_events, |event| match event {
        ServerEvent::ConnectionStopped { connection_id } => Some(connection_id.clone()),
        _ => None,
    })
    .await;
    assert_eq!(stopped, connection_id);
}

#[tokio::test]
async fn viewer_disconnect_renotifies_the_presenter() {
    let addr = start_relay().await;

    let (_presenter, mut presenter_events) = client(&addr, "Host");
    let (viewer, mut viewer_events) = client(&addr, "Guest");

    let (_, p_user, p_pass) = credentials(&mut presenter_events).await;
    let _ = credentials(&mut viewer_events).await;

    let connection_id = viewer.connect_to(&p_user, &p_pass).await.unwrap().unwrap();
    let _ = expect_event(&mut presenter_events, |event| match event {
        ServerEvent::ConnectionChanged { info } if !info.viewers.is_empty() => Some(()),
        _ => None,
    })
    .await;

    viewer.disconnect(&connection_id);

    let info = expect_event(&mut presenter_events, |event| match event {
        ServerEvent::ConnectionChanged { info } => Some(info.clone()),
        _ => None,
    })
    .await;
    assert!(info.viewers.is_empty());
}

#[tokio::test]
async fn frames_coalesce_for_slow_viewers() {
    let addr = start_relay().await;

    let (presenter, mut presenter_events) = client(&addr, "Host");
    let (viewer, mut viewer_events) = client(&addr, "Guest");

    let (_, p_user, p_pass) = credentials(&mut presenter_events).await;
    let (v_id, _, _) = credentials(&mut viewer_events).await;

    let connection_id = viewer.connect_to(&p_user, &p_pass).await.unwrap().unwrap();

    use glimpse_protocol::connection::MessageOutlet;
    // A burst of frames; the relay may drop intermediates, but the
    // first and the latest must arrive, in order.
    for n in 0..10u64 {
        presenter
            .send_message(
                &connection_id,
                MessageKind::ScreenFrame,
                n.to_le_bytes().to_vec(),
                MessageDestination::SpecificClients,
                Some(vec![v_id.clone()]),
            )
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    while seen.last() != Some(&9u64) {
        let n = expect_event(&mut viewer_events, |event| match event {
            ServerEvent::MessageReceived {
                kind: MessageKind::ScreenFrame,
                data,
                ..
            } => Some(u64::from_le_bytes(data.as_slice().try_into().unwrap())),
            _ => None,
        })
        .await;
        seen.push(n);
    }

    // Monotonically increasing; no duplicates, latest delivered.
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(*seen.last().unwrap(), 9);
}
