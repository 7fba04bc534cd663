//! End-to-end tests against a single (master-role) broker over its unix
//! socket, speaking the real wire protocol.

mod common;

use std::time::Duration;

use common::{code_of, start_broker, PulseListener, TestClient};
use switchboard_types::{PartyId, Status};

#[tokio::test]
async fn basic_attach_with_notification() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    // A server process registers its interface.
    let mut server = TestClient::connect(&broker).await;
    let server_id = server.register("Hi", 1, 2, 4711, 888).await.unwrap();
    assert_eq!(server_id.extended, 1000);

    // A second client arms server-available; the interface is already
    // there, so the pulse fires immediately.
    let mut listener = PulseListener::bind(7001);
    let mut client = TestClient::connect(&broker).await;
    client
        .notify_server_available("Hi", 1, 2, listener.pulse_info(33, 1234))
        .await
        .unwrap();

    let pulse = listener.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!((pulse.code, pulse.value), (33, 1234));

    // Attaching returns the registered channel.
    let info = client.attach("Hi", 1, 2).await.unwrap();
    assert_eq!(info.channel.pid, 4711);
    assert_eq!(info.channel.chid, 888);
    assert_eq!(info.server_id, server_id);
    assert_ne!(info.client_id, PartyId::NULL);
    assert_ne!(info.client_id, server_id);
}

#[tokio::test]
async fn version_mismatch_only_on_newer_minor() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    let mut server = TestClient::connect(&broker).await;
    server.register("Hi", 1, 2, 100, 1).await.unwrap();

    let mut client = TestClient::connect(&broker).await;
    // Requesting a newer minor than registered fails...
    assert_eq!(
        client.attach("Hi", 1, 3).await.unwrap_err(),
        code_of(Status::VersionMismatch)
    );
    // ...a minor downgrade within the same major succeeds.
    let info = client.attach("Hi", 1, 1).await.unwrap();
    assert_eq!(info.if_version.major, 1);
    assert_eq!(info.if_version.minor, 2);
    // Another major is not compatible either.
    assert_eq!(
        client.attach("Hi", 2, 0).await.unwrap_err(),
        code_of(Status::VersionMismatch)
    );
    // A name nobody registered is simply unknown.
    assert_eq!(
        client.attach("Ho", 1, 0).await.unwrap_err(),
        code_of(Status::UnknownInterface)
    );
}

#[tokio::test]
async fn regex_match_returns_only_matching_interfaces() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    let mut server = TestClient::connect(&broker).await;
    for idx in 1..=5 {
        server
            .register(&format!("Interface{idx}"), 1, 0, 100, idx)
            .await
            .unwrap();
    }

    let mut client = TestClient::connect(&broker).await;
    let matches = client.match_interface_list("face[24]$", 10).await.unwrap();
    let names: Vec<&str> = matches.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, ["Interface2", "Interface4"]);

    // A broken pattern is a regex error, not a count.
    assert_eq!(
        client.match_interface_list("face[", 10).await.unwrap_err(),
        code_of(Status::RegularExpression)
    );

    // The plain list returns everything in name order.
    let all = client.get_interface_list(10).await.unwrap();
    assert_eq!(all.len(), 5);
    assert!(all.windows(2).all(|w| w[0].name < w[1].name));

    // Insufficient capacity is rejected.
    assert_eq!(
        client.get_interface_list(3).await.unwrap_err(),
        code_of(Status::BadArgument)
    );
}

#[tokio::test]
async fn attach_detach_roundtrip_and_disconnect_notification() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    let mut server = TestClient::connect(&broker).await;
    let server_id = server.register("svc.Door", 1, 0, 100, 5).await.unwrap();

    let mut listener = PulseListener::bind(7002);
    let mut client = TestClient::connect(&broker).await;
    let info = client.attach("svc.Door", 1, 0).await.unwrap();
    client
        .notify_server_disconnect(server_id, listener.pulse_info(40, 1))
        .await
        .unwrap();

    // Detaching alone must not fire the disconnect watch.
    assert_eq!(client.detach(info.client_id).await, 0);
    assert!(listener
        .recv_timeout(Duration::from_millis(300))
        .await
        .is_none());

    // Unregistering the server does.
    assert_eq!(server.unregister(server_id).await, 0);
    let pulse = listener.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!((pulse.code, pulse.value), (40, 1));

    // Detaching twice is an error.
    assert_eq!(
        client.detach(info.client_id).await,
        code_of(Status::InvalidClientId)
    );
}

#[tokio::test]
async fn duplicate_registration_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    let mut first = TestClient::connect(&broker).await;
    let id_a = first.register("Twin", 1, 0, 100, 1).await.unwrap();
    let mut second = TestClient::connect(&broker).await;
    assert_eq!(
        second.register("Twin", 2, 0, 200, 2).await.unwrap_err(),
        code_of(Status::InterfaceAlreadyRegistered)
    );

    // Party ids keep increasing across registrations.
    let id_b = second.register("Twin2", 1, 0, 200, 2).await.unwrap();
    assert!(id_b.local > id_a.local);
}

#[tokio::test]
async fn dead_server_connection_unregisters_and_notifies() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    let mut server = TestClient::connect(&broker).await;
    let server_id = server.register("ephemeral.Svc", 1, 0, 100, 9).await.unwrap();

    let mut listener = PulseListener::bind(7003);
    let mut client = TestClient::connect(&broker).await;
    client.attach("ephemeral.Svc", 1, 0).await.unwrap();
    client
        .notify_server_disconnect(server_id, listener.pulse_info(50, 2))
        .await
        .unwrap();

    // The server process dies; its registration must vanish and the
    // disconnect watch must fire.
    drop(server);
    let pulse = listener.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!((pulse.code, pulse.value), (50, 2));

    assert_eq!(
        client.attach("ephemeral.Svc", 1, 0).await.unwrap_err(),
        code_of(Status::UnknownInterface)
    );
}

#[tokio::test]
async fn invalid_names_and_versions_are_bad_arguments() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    let mut client = TestClient::connect(&broker).await;
    assert_eq!(
        client.register("bad\u{1}name", 1, 0, 1, 1).await.unwrap_err(),
        code_of(Status::BadArgument)
    );
    assert_eq!(
        client.register("zeroversion", 0, 0, 1, 1).await.unwrap_err(),
        code_of(Status::BadArgument)
    );
}

#[tokio::test]
async fn notifications_fire_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    let mut listener = PulseListener::bind(7004);
    let mut client = TestClient::connect(&broker).await;

    // Armed before the server exists; must fire on registration only.
    let id = client
        .notify_server_available("one.Shot", 1, 0, listener.pulse_info(60, 3))
        .await
        .unwrap();

    let mut server = TestClient::connect(&broker).await;
    server.register("one.Shot", 1, 0, 100, 4).await.unwrap();

    let pulse = listener.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!((pulse.code, pulse.value), (60, 3));

    // The notification is consumed: clearing it now is an error, and no
    // second pulse arrives.
    assert_eq!(
        client.clear_notification(id).await,
        code_of(Status::InvalidNotificationId)
    );
    assert!(listener
        .recv_timeout(Duration::from_millis(300))
        .await
        .is_none());
}

#[tokio::test]
async fn attach_extended_local_and_absent() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    let mut listener = PulseListener::bind(7005);
    let mut client = TestClient::connect(&broker).await;

    // Absent server: the call arms a connect watch and reports that.
    let (ret, reply) = client
        .attach_extended("late.Svc", 1, 0, listener.pulse_info(70, 5))
        .await;
    assert_eq!(ret, code_of(Status::UnknownInterface));
    let watch_id = reply.unwrap().notification_id;
    assert_ne!(watch_id, switchboard_types::INVALID_NOTIFICATION_ID);

    let mut server = TestClient::connect(&broker).await;
    let server_id = server.register("late.Svc", 1, 0, 321, 12).await.unwrap();
    let pulse = listener.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!((pulse.code, pulse.value), (70, 5));

    // Present server: connection info plus a disconnect watch.
    let (ret, reply) = client
        .attach_extended("late.Svc", 1, 0, listener.pulse_info(71, 6))
        .await;
    assert_eq!(ret, 0);
    let reply = reply.unwrap();
    assert_eq!(reply.conn.server_id, server_id);
    assert_eq!(reply.conn.channel.chid, 12);

    assert_eq!(server.unregister(server_id).await, 0);
    let pulse = listener.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!((pulse.code, pulse.value), (71, 6));
}

#[tokio::test]
async fn list_change_notification_persists() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(&dir).await;

    let mut listener = PulseListener::bind(7006);
    let mut client = TestClient::connect(&broker).await;
    let mut body = bytes::BytesMut::new();
    switchboard_types::wire::NotifyInterfaceListChange {
        sb_version: common::sb_version(),
        pulse: listener.pulse_info(80, 7),
    }
    .put(&mut body);
    let (ret, _) = client
        .request(switchboard_types::Command::NotifyInterfaceListChange, body.freeze())
        .await;
    assert_eq!(ret, 0);

    let mut server = TestClient::connect(&broker).await;
    let first = server.register("list.A", 1, 0, 1, 1).await.unwrap();
    assert_eq!(
        listener.recv_timeout(Duration::from_secs(5)).await.unwrap().code,
        80
    );

    // Still armed: the next change fires again.
    server.register("list.B", 1, 0, 1, 2).await.unwrap();
    assert_eq!(
        listener.recv_timeout(Duration::from_secs(5)).await.unwrap().code,
        80
    );

    server.unregister(first).await;
    assert_eq!(
        listener.recv_timeout(Duration::from_secs(5)).await.unwrap().code,
        80
    );
}
