//! Master/slave federation tests: two live brokers wired over TCP on
//! loopback, with real clients on both sides.

mod common;

use std::time::Duration;

use common::{
    code_of, free_port, master_options, slave_options, start_with, PulseListener, TestClient,
};
use switchboard_types::Status;

#[tokio::test(flavor = "multi_thread")]
async fn slave_interface_is_visible_on_the_master() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_port = free_port();
    let slave_port = free_port();

    let master = start_with(master_options(&master_dir, master_port)).await;
    let slave = start_with(slave_options(&slave_dir, master_port, slave_port, 7)).await;

    // A service comes up on the slave.
    let mut server = TestClient::connect(&slave).await;
    let local_id = server.register("S.Svc", 1, 0, 555, 42).await.unwrap();
    assert_eq!(local_id.extended, 7);

    // A master-side client can attach once forwarding has happened; the
    // server id is the one the slave minted.
    let mut client = TestClient::connect(&master).await;
    let info = crate::eventually!(client.attach("S.Svc", 1, 0).await.ok());
    assert_eq!(info.server_id, local_id);
    assert_eq!(info.channel.chid, 42);

    // A pre-armed disconnect watch on the master fires when the slave
    // unregisters.
    let mut listener = PulseListener::bind(8001);
    client
        .notify_server_disconnect(local_id, listener.pulse_info(90, 11))
        .await
        .unwrap();
    assert_eq!(server.unregister(local_id).await, 0);
    let pulse = listener.recv_timeout(Duration::from_secs(5)).await.unwrap();
    assert_eq!((pulse.code, pulse.value), (90, 11));

    // And the interface is gone again for master clients.
    crate::eventually!(client
        .attach("S.Svc", 1, 0)
        .await
        .err()
        .filter(|&e| e == code_of(Status::UnknownInterface)));

    slave.stop();
    master.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn proxy_pool_folds_many_watches_into_one() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_port = free_port();
    let slave_port = free_port();

    let master = start_with(master_options(&master_dir, master_port)).await;
    let slave = start_with(slave_options(&slave_dir, master_port, slave_port, 7)).await;

    // Give the slave a moment to connect upstream.
    tokio::time::sleep(Duration::from_millis(500)).await;

    // 100 watches on "X" from a handful of slave clients, all before the
    // service exists anywhere.
    let mut listener = PulseListener::bind(8002);
    let mut clients = Vec::new();
    for _ in 0..10 {
        clients.push(TestClient::connect(&slave).await);
    }
    let mut ids = Vec::new();
    for round in 0..10u32 {
        for (idx, client) in clients.iter_mut().enumerate() {
            let value = (round * 10 + idx as u32) as i32;
            let id = client
                .notify_server_available("X", 1, 0, listener.pulse_info(91, value))
                .await
                .unwrap();
            ids.push(id);
        }
    }

    // The service appears on the master; every single watch fires.
    let mut server = TestClient::connect(&master).await;
    server.register("X", 1, 0, 777, 3).await.unwrap();

    let mut seen = std::collections::BTreeSet::new();
    while seen.len() < 100 {
        let pulse = listener
            .recv_timeout(Duration::from_secs(10))
            .await
            .expect("all folded watches fire");
        assert_eq!(pulse.code, 91);
        assert!(seen.insert(pulse.value), "pulse {} fired twice", pulse.value);
    }

    // Consumed: the ids are no longer clearable on their owners.
    for (idx, client) in clients.iter_mut().enumerate() {
        assert_eq!(
            client.clear_notification(ids[idx]).await,
            code_of(Status::InvalidNotificationId)
        );
    }

    slave.stop();
    master.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn master_loss_fires_upstream_watches_and_reconnect_reforwards() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_port = free_port();
    let slave_port = free_port();

    let master = start_with(master_options(&master_dir, master_port)).await;
    let mut options = slave_options(&slave_dir, master_port, slave_port, 7);
    options.use_cache = true;
    let slave = start_with(options).await;

    // Three upstream-only servers, registered by a master-side client.
    let mut upstream_server = TestClient::connect(&master).await;
    let mut upstream_ids = Vec::new();
    for idx in 0..3 {
        upstream_ids.push(
            upstream_server
                .register(&format!("up.Svc{idx}"), 1, 0, 100, 10 + idx)
                .await
                .unwrap(),
        );
    }

    // A slave-side service that must be re-forwarded after reconnect.
    let mut slave_server = TestClient::connect(&slave).await;
    slave_server.register("down.Svc", 1, 0, 200, 77).await.unwrap();

    // Slave clients can resolve the upstream servers (this also fills the
    // remote-server cache) and arm disconnect watches on them.
    let mut listener = PulseListener::bind(8003);
    let mut client = TestClient::connect(&slave).await;
    for (idx, &server_id) in upstream_ids.iter().enumerate() {
        let info = crate::eventually!(client.attach(&format!("up.Svc{idx}"), 1, 0).await.ok());
        assert_eq!(info.server_id, server_id);
        client
            .notify_server_disconnect(server_id, listener.pulse_info(92, idx as i32))
            .await
            .unwrap();
    }

    // Cut the master. All three watches must deliver their pulses.
    master.stop();
    let mut seen = std::collections::BTreeSet::new();
    while seen.len() < 3 {
        let pulse = listener
            .recv_timeout(Duration::from_secs(10))
            .await
            .expect("upstream watches fire on master loss");
        assert_eq!(pulse.code, 92);
        seen.insert(pulse.value);
    }

    // The cache is gone with the link: upstream lookups fail now.
    assert_eq!(
        client.attach("up.Svc0", 1, 0).await.unwrap_err(),
        code_of(Status::UnknownInterface)
    );

    // A new master appears on the same port; the slave reconnects and
    // re-forwards its local registrations.
    let master2_dir = tempfile::tempdir().unwrap();
    let master2 = start_with(master_options(&master2_dir, master_port)).await;
    let mut master_client = TestClient::connect(&master2).await;
    let info = crate::eventually!(master_client.attach("down.Svc", 1, 0).await.ok());
    assert_eq!(info.channel.chid, 77);

    slave.stop();
    master2.stop();
}

#[tokio::test(flavor = "multi_thread")]
async fn slave_sees_global_view_plus_its_local_interfaces() {
    let master_dir = tempfile::tempdir().unwrap();
    let slave_dir = tempfile::tempdir().unwrap();
    let master_port = free_port();
    let slave_port = free_port();

    let master = start_with(master_options(&master_dir, master_port)).await;

    // The slave keeps one interface node-local via its rules file.
    let rules_path = slave_dir.path().join("rules.cfg");
    std::fs::write(&rules_path, "[LOCAL]\nhidden.Svc\n[FORWARD]\n*\n").unwrap();
    let mut options = slave_options(&slave_dir, master_port, slave_port, 7);
    options.config_file = Some(rules_path);
    let slave = start_with(options).await;

    let mut master_app = TestClient::connect(&master).await;
    master_app.register("global.Svc", 1, 0, 1, 1).await.unwrap();

    let mut slave_app = TestClient::connect(&slave).await;
    slave_app.register("hidden.Svc", 1, 0, 2, 2).await.unwrap();
    slave_app.register("shared.Svc", 1, 0, 3, 3).await.unwrap();

    // Wait until the forwardable interface reached the master.
    let mut master_client = TestClient::connect(&master).await;
    crate::eventually!(master_client.attach("shared.Svc", 1, 0).await.ok());

    // The master never sees the local service.
    assert_eq!(
        master_client.attach("hidden.Svc", 1, 0).await.unwrap_err(),
        code_of(Status::UnknownInterface)
    );

    // A slave client's list is the master's view plus local and
    // non-forwarded interfaces, without double-listing forwarded ones.
    let mut slave_client = TestClient::connect(&slave).await;
    let list = slave_client.get_interface_list(16).await.unwrap();
    let mut names: Vec<&str> = list.iter().map(|i| i.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, ["global.Svc", "hidden.Svc", "shared.Svc"]);

    slave.stop();
    master.stop();
}
