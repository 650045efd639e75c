//! End-to-end replication scenarios against the in-process server.

use dirmesh_protocol::{AssuredMode, InitTarget, ReplicationMsg, ServerStatus};
use dirmesh_repl::{DomainConfig, ReplError, ReplicationDomain, TcpConnector};
use dirmesh_tests::{MemoryBackend, TestReplicationServer, TestServerConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn cfg(service: &str, replica_id: u32, server_addr: &str) -> DomainConfig {
    let mut cfg = DomainConfig::new(service, replica_id, vec![server_addr.to_string()]);
    cfg.heartbeat_interval_ms = 0;
    cfg.receive_timeout_ms = 200;
    cfg
}

fn domain(cfg: DomainConfig, backend: &Arc<MemoryBackend>) -> Arc<ReplicationDomain> {
    ReplicationDomain::new(cfg, backend.clone(), Arc::new(TcpConnector::default()))
}

async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test]
async fn two_replicas_converge_through_one_server() {
    let server = TestReplicationServer::start(TestServerConfig::default())
        .await
        .unwrap();

    let backend_a = Arc::new(MemoryBackend::new());
    let backend_b = Arc::new(MemoryBackend::new());
    let a = domain(cfg("dc=example", 1, &server.addr()), &backend_a);
    let b = domain(cfg("dc=example", 2, &server.addr()), &backend_b);

    assert!(a.start_publish_service().await);
    assert!(b.start_publish_service().await);
    a.start_listen_service();
    b.start_listen_service();

    assert!(
        wait_until(Duration::from_secs(5), || {
            server.connected_replicas() == vec![1, 2]
        })
        .await
    );
    assert_eq!(a.status(), ServerStatus::Normal);
    assert_eq!(b.status(), ServerStatus::Normal);

    let csn = a.publish(b"cn=change-one".to_vec()).await;
    assert_eq!(csn.replica_id, 1);

    // The update reaches replica B's receive loop with the same CSN.
    assert!(
        wait_until(Duration::from_secs(5), || {
            backend_b.applied_csns().contains(&csn)
        })
        .await
    );
    let applied = backend_b.applied();
    let received = applied.iter().find(|u| u.csn == csn).unwrap();
    assert_eq!(received.payload, b"cn=change-one".to_vec());

    // Replay advanced B's server state past A's change.
    assert!(
        wait_until(Duration::from_secs(5), || b.server_state().covers(&csn)).await
    );
    // Nothing was replayed on A; nothing came back.
    assert!(backend_a.applied().is_empty());

    a.stop_domain().await;
    b.stop_domain().await;
    server.stop().await;
}

#[tokio::test]
async fn assured_publish_times_out_without_acker() {
    let server = TestReplicationServer::start(TestServerConfig::default())
        .await
        .unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let mut config = cfg("dc=assured", 1, &server.addr());
    config.assured.enabled = true;
    config.assured.mode = AssuredMode::SafeRead;
    config.assured.timeout_ms = 200;
    let a = domain(config, &backend);

    assert!(a.start_publish_service().await);
    a.start_listen_service();
    assert!(
        wait_until(Duration::from_secs(5), || {
            server.connected_replicas() == vec![1]
        })
        .await
    );

    // Nobody ever acks: publish must return after ~200ms, tallied as one
    // timeout, with no error escaping.
    let started = Instant::now();
    let csn = a.publish(b"cn=assured-change".to_vec()).await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "returned in {elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "returned in {elapsed:?}");
    assert_eq!(csn.replica_id, 1);

    let snap = a.monitor_snapshot();
    assert_eq!(snap.sr_sent, 1);
    assert_eq!(snap.sr_timeout, 1);
    assert_eq!(snap.sr_acknowledged, 0);

    a.stop_domain().await;
    server.stop().await;
}

#[tokio::test]
async fn assured_publish_resolves_on_peer_ack() {
    let server = TestReplicationServer::start(TestServerConfig::default())
        .await
        .unwrap();

    let backend_a = Arc::new(MemoryBackend::new());
    let backend_b = Arc::new(MemoryBackend::new());
    let mut config_a = cfg("dc=assured", 1, &server.addr());
    config_a.assured.enabled = true;
    config_a.assured.mode = AssuredMode::SafeRead;
    config_a.assured.timeout_ms = 5000;
    let a = domain(config_a, &backend_a);
    let b = domain(cfg("dc=assured", 2, &server.addr()), &backend_b);

    assert!(a.start_publish_service().await);
    assert!(b.start_publish_service().await);
    a.start_listen_service();
    b.start_listen_service();
    assert!(
        wait_until(Duration::from_secs(5), || {
            server.connected_replicas() == vec![1, 2]
        })
        .await
    );

    // B replays synchronously and acks the safe-read update, so the
    // publisher returns well before its 5s timeout.
    let started = Instant::now();
    a.publish(b"cn=acked-change".to_vec()).await;
    assert!(started.elapsed() < Duration::from_secs(4));

    let snap = a.monitor_snapshot();
    assert_eq!(snap.sr_sent, 1);
    assert_eq!(snap.sr_acknowledged, 1);
    assert_eq!(snap.sr_timeout, 0);

    let snap_b = b.monitor_snapshot();
    assert_eq!(snap_b.sr_received, 1);
    assert_eq!(snap_b.sr_received_acked, 1);

    a.stop_domain().await;
    b.stop_domain().await;
    server.stop().await;
}

#[tokio::test]
async fn generation_mismatch_starts_in_bad_gen_id() {
    let server = TestReplicationServer::start(TestServerConfig::default())
        .await
        .unwrap();

    let backend_a = Arc::new(MemoryBackend::new());
    let mut config_a = cfg("dc=gen", 1, &server.addr());
    config_a.generation_id = Some(1);
    let a = domain(config_a, &backend_a);
    assert!(a.start_publish_service().await);
    assert_eq!(a.status(), ServerStatus::Normal);

    // The server adopted generation 1 from A; a replica carrying a
    // different generation lands in bad-gen-id.
    let backend_c = Arc::new(MemoryBackend::new());
    let mut config_c = cfg("dc=gen", 3, &server.addr());
    config_c.generation_id = Some(7);
    let c = domain(config_c, &backend_c);
    assert!(c.start_publish_service().await);
    assert_eq!(c.status(), ServerStatus::BadGenId);

    a.stop_domain().await;
    c.stop_domain().await;
    server.stop().await;
}

#[tokio::test]
async fn full_update_initializes_one_replica_from_another() {
    let server = TestReplicationServer::start(TestServerConfig::default())
        .await
        .unwrap();

    let backend_a = Arc::new(MemoryBackend::with_generated_entries(3));
    let backend_b = Arc::new(MemoryBackend::new());
    let a = domain(cfg("dc=init", 1, &server.addr()), &backend_a);
    let b = domain(cfg("dc=init", 2, &server.addr()), &backend_b);

    assert!(a.start_publish_service().await);
    assert!(b.start_publish_service().await);
    a.start_listen_service();
    b.start_listen_service();
    assert!(
        wait_until(Duration::from_secs(5), || {
            server.connected_replicas() == vec![1, 2]
        })
        .await
    );

    let handle = b.initialize_from_remote(1).await.unwrap();
    handle.wait().await.unwrap();
    assert!(!b.ie_running());

    let mut expected = Vec::new();
    for i in 0..3 {
        expected.extend_from_slice(
            format!("dn: cn=entry-{i}\ncn: entry-{i}\n\n").as_bytes(),
        );
    }
    assert_eq!(backend_b.imported_bytes(), expected);

    // B reconnected after the import and settled back to normal.
    assert!(
        wait_until(Duration::from_secs(5), || {
            b.is_connected() && b.status() == ServerStatus::Normal
        })
        .await
    );

    a.stop_domain().await;
    b.stop_domain().await;
    server.stop().await;
}

#[tokio::test]
async fn export_flow_control_paces_against_slowest_peer() {
    let server = TestReplicationServer::start(TestServerConfig::default())
        .await
        .unwrap();

    let backend_a = Arc::new(MemoryBackend::with_generated_entries(10));
    let mut config_a = cfg("dc=flow", 1, &server.addr());
    config_a.init_window = 4;
    let a = domain(config_a, &backend_a);
    assert!(a.start_publish_service().await);
    a.start_listen_service();

    // A hand-driven importer that withholds flow-control acks.
    let importer = dirmesh_tests::harness::RawReplica::connect(
        &server.addr(),
        "dc=flow",
        2,
        1,
        None,
    )
    .await
    .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            a.topology().replica(2).is_some()
        })
        .await
    );

    let export = {
        let a = a.clone();
        tokio::spawn(async move { a.initialize_remote(2).await })
    };

    // A concurrent total update is refused outright.
    assert!(
        wait_until(Duration::from_secs(5), || a.ie_running()).await
    );
    match a.initialize_from_remote(2).await {
        Err(ReplError::SimultaneousImportExport) => {}
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("second context acquisition must fail"),
    }

    // The exporter announces itself, then waits for full-update status.
    let announce = importer
        .recv_data(Duration::from_secs(5))
        .await
        .unwrap();
    match announce {
        ReplicationMsg::InitializeTarget(init) => {
            assert_eq!(init.entry_count, 10);
            assert_eq!(init.init_window, 4);
            assert_eq!(init.target, InitTarget::Replica(2));
        }
        other => panic!("expected initialize-target, got {}", other.kind()),
    }
    importer.set_status(ServerStatus::FullUpdate).await.unwrap();

    // Without acks only one window's worth of entries may arrive.
    let mut received = Vec::new();
    for _ in 0..4 {
        match importer.recv_data(Duration::from_secs(5)).await.unwrap() {
            ReplicationMsg::Entry(e) => received.push(e.msg_id),
            other => panic!("expected entry, got {}", other.kind()),
        }
    }
    assert_eq!(received, vec![1, 2, 3, 4]);
    assert!(
        importer.recv_data(Duration::from_millis(400)).await.is_err(),
        "entry 5 must be withheld until an ack arrives"
    );

    // Acknowledging the first window lets the next one through.
    importer
        .send(&ReplicationMsg::InitializeRcvAck {
            sender_id: 2,
            num_ack: 4,
        })
        .await
        .unwrap();
    for expected in 5..=8u64 {
        match importer.recv_data(Duration::from_secs(5)).await.unwrap() {
            ReplicationMsg::Entry(e) => assert_eq!(e.msg_id, expected),
            other => panic!("expected entry, got {}", other.kind()),
        }
    }
    assert!(
        importer.recv_data(Duration::from_millis(400)).await.is_err(),
        "entry 9 must be withheld until a further ack arrives"
    );

    importer
        .send(&ReplicationMsg::InitializeRcvAck {
            sender_id: 2,
            num_ack: 8,
        })
        .await
        .unwrap();
    let mut tail = Vec::new();
    loop {
        match importer.recv_data(Duration::from_secs(5)).await.unwrap() {
            ReplicationMsg::Entry(e) => tail.push(e.msg_id),
            ReplicationMsg::Done { .. } => break,
            other => panic!("expected entry or done, got {}", other.kind()),
        }
    }
    assert_eq!(tail, vec![9, 10]);

    // Leave full update so the exporter's completion wait resolves.
    importer.set_status(ServerStatus::Normal).await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(30), export)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok(), "export failed: {result:?}");

    a.stop_domain().await;
    server.stop().await;
}

#[tokio::test]
async fn generation_reset_propagates_to_the_server() {
    let server = TestReplicationServer::start(TestServerConfig::default())
        .await
        .unwrap();

    let backend = Arc::new(MemoryBackend::new());
    let mut config = cfg("dc=reset", 1, &server.addr());
    config.generation_id = Some(5);
    let a = domain(config, &backend);
    assert!(a.start_publish_service().await);
    a.start_listen_service();

    a.reset_generation_id(None).await.unwrap();
    a.check_generation_id(None).await.unwrap();

    a.reset_generation_id(Some(5)).await.unwrap();
    a.check_generation_id(Some(5)).await.unwrap();

    a.stop_domain().await;
    server.stop().await;
}
