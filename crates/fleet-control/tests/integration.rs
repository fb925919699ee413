//! Integration tests for fleet-control
//!
//! Agents are simulated over the in-process channel transport; instances share
//! an in-memory SQLite store and, where needed, a `MemoryBroker`.

use async_trait::async_trait;
use fleet_auth::HandshakeTokens;
use fleet_chain::{Agent, AgentRole, ExitAgentRef, HealthTracker, LoadBalancer, Rule};
use fleet_control::config_sync::Delivery;
use fleet_control::transport::ChannelPeer;
use fleet_control::{
    channel_pair, AlertState, AlertTracker, AllowAll, BackoffConfig, BusConfig, ConfigSyncConfig,
    ConfigSyncService, EventBus, Hub, HubConfig, MemoryBroker, Notification, NotificationEvent,
    Notifier, NotifyError, ProbeConfig, ProbeOutcome, ProbeService, StatusHandler, TrafficBuffer,
    TrafficConfig, TunnelHealthHandler, UnreachableReason,
};
use fleet_db::entities::rule as rule_entity;
use fleet_db::{FleetStore, SeaOrmStore, SeaOrmTrafficStore};
use fleet_proto::{
    message_type, ConfigAck, ConfigSyncPayload, Envelope, LoadBalanceStrategy, ProbeResult,
    ProbeTask, ResourceKind, RuleSyncStatus, StatusReport, TrafficSample, TunnelHealthReport,
};
use sea_orm::{DatabaseConnection, EntityTrait};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn events(&self) -> Vec<NotificationEvent> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.event.clone())
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

struct Instance {
    hub: Arc<Hub>,
    sync: Arc<ConfigSyncService>,
    probe: Arc<ProbeService>,
    health: Arc<HealthTracker>,
    balancer: Arc<LoadBalancer>,
    traffic: Arc<TrafficBuffer>,
    bus: Option<Arc<EventBus>>,
}

struct Setup {
    db: DatabaseConnection,
    store: Arc<SeaOrmStore>,
    rules: [i64; 3],
    cancel: CancellationToken,
}

impl Drop for Setup {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// `fa_001` (config version 4) with three rules, plus two exit agents
async fn setup() -> Setup {
    let db = fleet_db::connect("sqlite::memory:").await.unwrap();
    fleet_db::migrate(&db).await.unwrap();
    let store = Arc::new(SeaOrmStore::new(db.clone()));

    let mut entry = Agent::new("fa_001", AgentRole::Entry);
    entry.config_version = 4;
    store.upsert_agent(&entry).await.unwrap();

    for id in ["fx_001", "fx_002"] {
        let mut exit = Agent::new(id, AgentRole::Exit);
        exit.address = format!("{}.example.net", id);
        exit.ws_port = 8080;
        store.upsert_agent(&exit).await.unwrap();
    }

    let direct = Rule::direct(0, "fa_001", 10001, "10.0.0.1", 80);
    let relayed = Rule::direct(0, "fa_001", 10002, "10.0.0.2", 80).with_next_hop("fx_001");
    let grouped = Rule::direct(0, "fa_001", 10003, "10.0.0.3", 80).with_exit_group(
        vec![ExitAgentRef::new("fx_001", 10), ExitAgentRef::new("fx_002", 5)],
        LoadBalanceStrategy::Failover,
    );

    let mut rules = [0; 3];
    for (slot, rule) in rules.iter_mut().zip([direct, relayed, grouped]) {
        *slot = store.save_rule(rule).await.unwrap().current.unwrap().id;
    }

    Setup {
        db,
        store,
        rules,
        cancel: CancellationToken::new(),
    }
}

fn instance(setup: &Setup, sync_config: ConfigSyncConfig, broker: Option<(&Arc<MemoryBroker>, &str)>) -> Instance {
    let hub = Arc::new(Hub::new(HubConfig::default()));

    let bus = broker.map(|(broker, instance_id)| {
        let config = BusConfig {
            instance_id: instance_id.to_string(),
            ..Default::default()
        };
        let bus = Arc::new(EventBus::new(config, broker.clone(), hub.clone()));
        hub.add_lifecycle_handler(bus.clone());
        tokio::spawn(bus.clone().run(setup.cancel.clone()));
        bus
    });

    let sync = ConfigSyncService::new(
        sync_config,
        setup.store.clone(),
        hub.clone(),
        bus.clone(),
        Arc::new(HandshakeTokens::new(chrono::Duration::minutes(5))),
        Arc::new(AllowAll),
    );
    sync.attach();

    let health = Arc::new(HealthTracker::new());
    let balancer = Arc::new(LoadBalancer::new());
    let probe = Arc::new(ProbeService::new(
        ProbeConfig {
            timeout: Duration::from_millis(500),
        },
        setup.store.clone(),
        hub.clone(),
        bus.clone(),
        balancer.clone(),
        health.clone(),
    ));
    probe.attach();

    let traffic_store = Arc::new(SeaOrmTrafficStore::new(setup.db.clone(), "test"));
    let traffic = Arc::new(TrafficBuffer::new(
        TrafficConfig::default(),
        traffic_store.clone(),
        traffic_store,
    ));
    Arc::new(StatusHandler::new(setup.store.clone(), traffic.clone(), sync.clone())).attach(&hub);
    Arc::new(TunnelHealthHandler::new(setup.store.clone(), health.clone())).attach(&hub);

    Instance {
        hub,
        sync,
        probe,
        health,
        balancer,
        traffic,
        bus,
    }
}

fn connect(hub: &Arc<Hub>, id: &str) -> ChannelPeer {
    let (sink, source, peer) = channel_pair(64);
    hub.register(ResourceKind::Agent, id, None, sink, source);
    peer
}

async fn next_sync(peer: &mut ChannelPeer) -> ConfigSyncPayload {
    loop {
        let envelope = timeout(WAIT, peer.recv_envelope())
            .await
            .expect("timed out waiting for config sync")
            .expect("connection closed");
        if envelope.msg_type == message_type::CONFIG_SYNC {
            return envelope.expect(message_type::CONFIG_SYNC).unwrap();
        }
    }
}

async fn send_ack(peer: &ChannelPeer, agent_id: &str, version: u64, success: bool) {
    let ack = ConfigAck {
        version,
        success,
        error: (!success).then(|| "listen port in use".to_string()),
    };
    let envelope = Envelope::new(message_type::CONFIG_ACK, agent_id, &ack).unwrap();
    peer.send_envelope(&envelope).await.unwrap();
}

async fn send(peer: &ChannelPeer, msg_type: &str, agent_id: &str, data: &impl serde::Serialize) {
    let envelope = Envelope::new(msg_type, agent_id, data).unwrap();
    peer.send_envelope(&envelope).await.unwrap();
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Clone, Copy)]
enum ProbeReply {
    Succeed,
    Fail,
    Silent,
}

struct FakeAgent {
    probes: Arc<AtomicUsize>,
    syncs: Arc<Mutex<Vec<ConfigSyncPayload>>>,
}

/// Acks every sync and answers probe tasks after `delay`
fn spawn_agent(mut peer: ChannelPeer, id: &'static str, reply: ProbeReply, delay: Duration) -> FakeAgent {
    let probes = Arc::new(AtomicUsize::new(0));
    let syncs = Arc::new(Mutex::new(Vec::new()));
    let agent = FakeAgent {
        probes: probes.clone(),
        syncs: syncs.clone(),
    };

    tokio::spawn(async move {
        while let Some(envelope) = peer.recv_envelope().await {
            match envelope.msg_type.as_str() {
                message_type::CONFIG_SYNC => {
                    let payload: ConfigSyncPayload = envelope.parse_data().unwrap();
                    send_ack(&peer, id, payload.version, true).await;
                    syncs.lock().unwrap().push(payload);
                }
                message_type::PROBE_TASK => {
                    let task: ProbeTask = envelope.parse_data().unwrap();
                    probes.fetch_add(1, Ordering::SeqCst);
                    sleep(delay).await;
                    let result = match reply {
                        ProbeReply::Succeed => ProbeResult {
                            correlation_id: task.correlation_id,
                            rule_id: task.rule_id,
                            success: true,
                            latency_ms: Some(12),
                            error: None,
                        },
                        ProbeReply::Fail => ProbeResult {
                            correlation_id: task.correlation_id,
                            rule_id: task.rule_id,
                            success: false,
                            latency_ms: None,
                            error: Some("connection refused".to_string()),
                        },
                        ProbeReply::Silent => continue,
                    };
                    send(&peer, message_type::PROBE_RESULT, id, &result).await;
                }
                _ => {}
            }
        }
    });

    agent
}

#[tokio::test]
async fn test_agent_lifecycle_end_to_end() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);

    let notifier = Arc::new(RecordingNotifier::default());
    let (alerts, dispatcher) = AlertTracker::new(setup.store.clone(), notifier.clone());
    node.hub.add_lifecycle_handler(alerts.clone());
    tokio::spawn(dispatcher.run(setup.cancel.clone()));

    // Connect: full sync with all three rules at the current version
    let mut peer = connect(&node.hub, "fa_001");
    let sync = next_sync(&mut peer).await;
    assert!(sync.full_sync);
    assert_eq!(sync.version, 7);
    assert_eq!(sync.added.len(), 3);
    assert!(!sync.client_token.is_empty());
    let grouped = sync
        .added
        .iter()
        .find(|r| r.id == setup.rules[2])
        .unwrap();
    assert_eq!(grouped.exit_agents.len(), 2);

    send_ack(&peer, "fa_001", 7, true).await;
    eventually("ack 7", || node.sync.acked_version("fa_001") == 7).await;
    assert!(node.sync.pending_versions("fa_001").is_empty());

    // Disable one rule: incremental diff removing it
    let mut disabled = setup.store.get_rule(setup.rules[0]).await.unwrap().unwrap();
    disabled.enabled = false;
    let change = setup.store.save_rule(disabled).await.unwrap();
    assert_eq!(change.version_for("fa_001"), Some(8));

    let results = node.sync.apply_rule_change(&change).await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0].1, Ok(Delivery::Local)));

    let diff = next_sync(&mut peer).await;
    assert!(!diff.full_sync);
    assert_eq!(diff.version, 8);
    assert_eq!(diff.removed, vec![setup.rules[0]]);
    assert!(diff.added.is_empty() && diff.updated.is_empty());

    send_ack(&peer, "fa_001", 8, true).await;
    eventually("ack 8", || node.sync.acked_version("fa_001") == 8).await;

    // Session deleted: offline, alert fires
    assert!(node.hub.disconnect(ResourceKind::Agent, "fa_001"));
    assert!(matches!(
        alerts.state(ResourceKind::Agent, "fa_001"),
        AlertState::Firing { .. }
    ));
    assert!(timeout(WAIT, peer.recv_envelope()).await.unwrap().is_none());

    // Reconnect: alert resolves with a recovery notification, fresh full sync
    let mut peer = connect(&node.hub, "fa_001");
    assert_eq!(alerts.state(ResourceKind::Agent, "fa_001"), AlertState::Normal);

    let resync = next_sync(&mut peer).await;
    assert!(resync.full_sync);
    assert_eq!(resync.version, 8);
    assert_eq!(resync.added.len(), 2);

    eventually("recovery notification", || {
        matches!(
            notifier.events().last(),
            Some(NotificationEvent::Recovered { .. })
        )
    })
    .await;
    assert_eq!(
        notifier.events()[..2],
        [NotificationEvent::Online, NotificationEvent::Offline]
    );

    // Acked versions never go backwards
    send_ack(&peer, "fa_001", 5, true).await;
    send_ack(&peer, "fa_001", 8, true).await;
    eventually("pending retired", || {
        node.sync.pending_versions("fa_001").is_empty()
    })
    .await;
    assert_eq!(node.sync.acked_version("fa_001"), 8);
}

#[tokio::test]
async fn test_failed_ack_triggers_full_resync() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);

    let mut peer = connect(&node.hub, "fa_001");
    assert_eq!(next_sync(&mut peer).await.version, 7);

    send_ack(&peer, "fa_001", 7, false).await;
    let retry = next_sync(&mut peer).await;
    assert!(retry.full_sync);
    assert_eq!(retry.version, 7);
    assert_eq!(node.sync.acked_version("fa_001"), 0);

    send_ack(&peer, "fa_001", 7, true).await;
    eventually("ack after retry", || node.sync.acked_version("fa_001") == 7).await;
}

#[tokio::test]
async fn test_missing_ack_keeps_resyncing_with_backoff() {
    let setup = setup().await;
    let config = ConfigSyncConfig {
        ack_timeout: Duration::from_millis(100),
        resync_backoff: BackoffConfig {
            base: Duration::from_millis(50),
            ceiling: Duration::from_millis(200),
            factor: 2,
        },
        ..Default::default()
    };
    let node = instance(&setup, config, None);

    let mut peer = connect(&node.hub, "fa_001");
    assert!(next_sync(&mut peer).await.full_sync);

    // Never acked: resyncs keep coming, spaced further apart
    let mut arrivals = Vec::new();
    for _ in 0..6 {
        let sync = next_sync(&mut peer).await;
        assert!(sync.full_sync);
        assert_eq!(sync.version, 7);
        arrivals.push(Instant::now());
    }
    assert!(node.sync.resync_attempts("fa_001") >= 6);
    let first_gap = arrivals[1] - arrivals[0];
    let last_gap = arrivals[5] - arrivals[4];
    assert!(last_gap > first_gap);

    // One good ack ends the streak
    send_ack(&peer, "fa_001", 7, true).await;
    eventually("ack after streak", || node.sync.acked_version("fa_001") == 7).await;
    assert_eq!(node.sync.resync_attempts("fa_001"), 0);
    assert!(timeout(Duration::from_millis(600), peer.recv_envelope())
        .await
        .is_err());
    assert!(node.hub.is_online(ResourceKind::Agent, "fa_001"));
}

#[tokio::test]
async fn test_offline_agent_diff_is_deferred() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);

    let rule = Rule::direct(0, "fa_001", 10004, "10.0.0.4", 80);
    let change = setup.store.save_rule(rule).await.unwrap();
    let results = node.sync.apply_rule_change(&change).await;
    assert!(matches!(
        results[0].1,
        Err(fleet_control::SyncError::Offline(_))
    ));

    let mut peer = connect(&node.hub, "fa_001");
    let sync = next_sync(&mut peer).await;
    assert_eq!(sync.version, 8);
    assert_eq!(sync.added.len(), 4);
}

#[tokio::test]
async fn test_exit_endpoint_change_resyncs_entry() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);

    let entry = spawn_agent(
        connect(&node.hub, "fa_001"),
        "fa_001",
        ProbeReply::Succeed,
        Duration::ZERO,
    );
    eventually("initial sync", || entry.syncs.lock().unwrap().len() == 1).await;

    let mut exit = connect(&node.hub, "fx_001");
    let exit_sync = next_sync(&mut exit).await;
    assert_eq!(exit_sync.added.len(), 2);

    let report = StatusReport {
        address: Some("fx-new.example.net".to_string()),
        ws_port: Some(9090),
        version: Some("1.4.2".to_string()),
        ..Default::default()
    };
    send(&exit, message_type::STATUS, "fx_001", &report).await;

    eventually("dependent resync", || entry.syncs.lock().unwrap().len() == 2).await;
    let resync = entry.syncs.lock().unwrap()[1].clone();
    assert!(resync.full_sync);
    let relayed = resync
        .added
        .iter()
        .find(|r| r.id == setup.rules[1])
        .unwrap();
    let next_hop = relayed.next_hop.as_ref().unwrap();
    assert_eq!(next_hop.address, "fx-new.example.net");
    assert_eq!(next_hop.ws_port, 9090);
}

#[tokio::test]
async fn test_probe_outcomes() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);

    let outcome = node.probe.probe_rule(setup.rules[0]).await.unwrap();
    assert_eq!(
        outcome,
        ProbeOutcome::AgentUnreachable {
            reason: UnreachableReason::Offline
        }
    );

    let agent = spawn_agent(
        connect(&node.hub, "fa_001"),
        "fa_001",
        ProbeReply::Succeed,
        Duration::ZERO,
    );
    let outcome = node.probe.probe_rule(setup.rules[0]).await.unwrap();
    assert_eq!(
        outcome,
        ProbeOutcome::Success {
            exit_agent_id: None,
            latency_ms: Some(12)
        }
    );

    let outcome = node.probe.probe_rule(setup.rules[2]).await.unwrap();
    assert_eq!(
        outcome,
        ProbeOutcome::Success {
            exit_agent_id: Some("fx_001".to_string()),
            latency_ms: Some(12)
        }
    );
    assert_eq!(agent.probes.load(Ordering::SeqCst), 2);

    assert!(matches!(
        node.probe.probe_rule(9999).await,
        Err(fleet_control::ProbeError::RuleNotFound(9999))
    ));
}

#[tokio::test]
async fn test_probe_failure_and_silence_are_distinct() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);

    spawn_agent(
        connect(&node.hub, "fa_001"),
        "fa_001",
        ProbeReply::Fail,
        Duration::ZERO,
    );
    let outcome = node.probe.probe_rule(setup.rules[0]).await.unwrap();
    assert!(matches!(outcome, ProbeOutcome::ProbeFailed { ref error, .. } if error == "connection refused"));

    node.hub.disconnect(ResourceKind::Agent, "fa_001");
    spawn_agent(
        connect(&node.hub, "fa_001"),
        "fa_001",
        ProbeReply::Silent,
        Duration::ZERO,
    );
    let outcome = node.probe.probe_rule(setup.rules[0]).await.unwrap();
    assert_eq!(
        outcome,
        ProbeOutcome::AgentUnreachable {
            reason: UnreachableReason::NoResponse
        }
    );
    assert!(node.probe.in_flight().is_empty());
}

#[tokio::test]
async fn test_concurrent_probes_for_one_rule_share_a_task() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);

    let agent = spawn_agent(
        connect(&node.hub, "fa_001"),
        "fa_001",
        ProbeReply::Succeed,
        Duration::from_millis(150),
    );

    let (first, second) = tokio::join!(
        node.probe.probe_rule(setup.rules[0]),
        node.probe.probe_rule(setup.rules[0])
    );
    let first = first.unwrap();
    assert!(first.is_success());
    assert_eq!(first, second.unwrap());
    assert_eq!(agent.probes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tunnel_health_reports_drive_failover() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);
    let grouped_id = setup.rules[2];
    let grouped = setup.store.get_rule(grouped_id).await.unwrap().unwrap();

    let mut peer = connect(&node.hub, "fa_001");
    next_sync(&mut peer).await;

    assert_eq!(
        node.balancer.select(&grouped, &node.health).as_deref(),
        Some("fx_001")
    );

    let failing = TunnelHealthReport {
        rule_id: grouped_id,
        exit_agent_id: "fx_001".to_string(),
        healthy: false,
        fail_count: None,
        error: Some("dial timeout".to_string()),
        latency_ms: None,
        checked_at: chrono::Utc::now().timestamp(),
    };
    for _ in 0..2 {
        send(&peer, message_type::TUNNEL_HEALTH_REPORT, "fa_001", &failing).await;
    }
    eventually("two failures recorded", || {
        node.health
            .get(grouped_id, "fx_001")
            .is_some_and(|h| h.consecutive_failures == 2)
    })
    .await;
    // Below the threshold: still selected
    assert!(node.health.is_healthy(grouped_id, "fx_001"));

    send(&peer, message_type::TUNNEL_HEALTH_REPORT, "fa_001", &failing).await;
    eventually("exit marked unhealthy", || {
        !node.health.is_healthy(grouped_id, "fx_001")
    })
    .await;
    assert_eq!(
        node.balancer.select(&grouped, &node.health).as_deref(),
        Some("fx_002")
    );

    // Reports about agents outside the rule are ignored
    let stray = TunnelHealthReport {
        exit_agent_id: "fa_001".to_string(),
        ..failing
    };
    send(&peer, message_type::TUNNEL_HEALTH_REPORT, "fa_001", &stray).await;
    sleep(Duration::from_millis(50)).await;
    assert!(node.health.get(grouped_id, "fa_001").is_none());
}

#[tokio::test]
async fn test_status_traffic_reaches_rule_totals() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);

    let mut peer = connect(&node.hub, "fa_001");
    next_sync(&mut peer).await;

    for bytes in [100u64, 1] {
        let report = StatusReport {
            traffic: vec![TrafficSample {
                rule_id: setup.rules[1],
                bytes_in: bytes,
                bytes_out: bytes * 10,
            }],
            ..Default::default()
        };
        send(&peer, message_type::STATUS, "fa_001", &report).await;
    }

    eventually("traffic buffered", || {
        node.traffic
            .pending()
            .first()
            .is_some_and(|d| d.bytes_in == 101)
    })
    .await;

    assert_eq!(node.traffic.flush_to_cache().await.unwrap(), 1);
    assert_eq!(node.traffic.persist().await.unwrap(), 1);

    let row = rule_entity::Entity::find_by_id(setup.rules[1])
        .one(&setup.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!((row.traffic_in, row.traffic_out), (101, 1010));

    let agent = setup.store.get_agent("fa_001").await.unwrap().unwrap();
    assert!(agent.last_seen.is_some());
}

#[tokio::test]
async fn test_reports_only_count_for_rules_the_agent_serves() {
    let setup = setup().await;
    let node = instance(&setup, ConfigSyncConfig::default(), None);

    // fx_002 is only a backup exit of the grouped rule
    let mut peer = connect(&node.hub, "fx_002");
    next_sync(&mut peer).await;

    let report = StatusReport {
        traffic: vec![
            TrafficSample {
                rule_id: setup.rules[0],
                bytes_in: 100,
                bytes_out: 200,
            },
            TrafficSample {
                rule_id: setup.rules[2],
                bytes_in: 7,
                bytes_out: 8,
            },
            TrafficSample {
                rule_id: 9999,
                bytes_in: 1,
                bytes_out: 1,
            },
        ],
        ..Default::default()
    };
    send(&peer, message_type::STATUS, "fx_002", &report).await;
    for rule_id in [setup.rules[0], setup.rules[2]] {
        let status = RuleSyncStatus {
            rule_id,
            status: "active".to_string(),
            error: None,
        };
        send(&peer, message_type::RULE_SYNC_STATUS, "fx_002", &status).await;
    }

    eventually("own rule buffered", || !node.traffic.pending().is_empty()).await;
    let deadline = Instant::now() + WAIT;
    loop {
        let own = rule_entity::Entity::find_by_id(setup.rules[2])
            .one(&setup.db)
            .await
            .unwrap()
            .unwrap();
        if own.sync_status.as_deref() == Some("active") {
            break;
        }
        assert!(Instant::now() < deadline, "timed out waiting for own sync status");
        sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(
        node.traffic.pending(),
        vec![fleet_db::TrafficDelta::new(setup.rules[2], 7, 8)]
    );
    let foreign = rule_entity::Entity::find_by_id(setup.rules[0])
        .one(&setup.db)
        .await
        .unwrap()
        .unwrap();
    assert!(foreign.sync_status.is_none());
}

#[tokio::test]
async fn test_two_instances_share_one_fleet() {
    let setup = setup().await;
    let broker = Arc::new(MemoryBroker::new());
    let a = instance(&setup, ConfigSyncConfig::default(), Some((&broker, "instance-a")));
    let b = instance(&setup, ConfigSyncConfig::default(), Some((&broker, "instance-b")));
    let bus_a = a.bus.clone().unwrap();
    let bus_b = b.bus.clone().unwrap();
    bus_a.wait_subscribed().await;
    bus_b.wait_subscribed().await;

    let mut status_b = bus_b.subscribe_status();

    let agent = spawn_agent(
        connect(&a.hub, "fa_001"),
        "fa_001",
        ProbeReply::Succeed,
        Duration::ZERO,
    );
    eventually("initial sync", || agent.syncs.lock().unwrap().len() == 1).await;
    eventually("presence on b", || {
        bus_b.is_online_remote(ResourceKind::Agent, "fa_001")
    })
    .await;
    assert!(!bus_a.is_online_remote(ResourceKind::Agent, "fa_001"));

    let event = timeout(WAIT, status_b.recv()).await.unwrap().unwrap();
    assert_eq!(event.origin, "instance-a");
    assert!(event.online);

    // Mutation handled by b reaches the agent through a, and a tracks the ack
    let rule = Rule::direct(0, "fa_001", 10005, "10.0.0.5", 80);
    let change = setup.store.save_rule(rule).await.unwrap();
    let results = b.sync.apply_rule_change(&change).await;
    assert!(matches!(results[0].1, Ok(Delivery::Relayed)));

    eventually("relayed diff", || agent.syncs.lock().unwrap().len() == 2).await;
    let diff = agent.syncs.lock().unwrap()[1].clone();
    assert!(!diff.full_sync);
    assert_eq!(diff.version, 8);
    eventually("ack tracked on a", || a.sync.acked_version("fa_001") == 8).await;

    // Probe started on b, answered through a
    let outcome = b.probe.probe_rule(setup.rules[0]).await.unwrap();
    assert!(outcome.is_success());

    // Offline propagates and clears presence
    a.hub.disconnect(ResourceKind::Agent, "fa_001");
    eventually("presence cleared on b", || {
        !bus_b.is_online_remote(ResourceKind::Agent, "fa_001")
    })
    .await;
    assert_eq!(
        b.probe.probe_rule(setup.rules[0]).await.unwrap(),
        ProbeOutcome::AgentUnreachable {
            reason: UnreachableReason::Offline
        }
    );
}

#[tokio::test]
async fn test_outage_and_reconnect_on_different_instances_pair_up() {
    let setup = setup().await;
    let broker = Arc::new(MemoryBroker::new());
    let a = instance(&setup, ConfigSyncConfig::default(), Some((&broker, "instance-a")));
    let b = instance(&setup, ConfigSyncConfig::default(), Some((&broker, "instance-b")));
    let bus_a = a.bus.clone().unwrap();
    let bus_b = b.bus.clone().unwrap();
    bus_a.wait_subscribed().await;
    bus_b.wait_subscribed().await;

    let mut trackers = Vec::new();
    for (inst, bus) in [(&a, &bus_a), (&b, &bus_b)] {
        let notifier = Arc::new(RecordingNotifier::default());
        let (alerts, dispatcher) = AlertTracker::new(setup.store.clone(), notifier.clone());
        inst.hub.add_lifecycle_handler(alerts.clone());
        tokio::spawn(dispatcher.run(setup.cancel.clone()));
        tokio::spawn(alerts.clone().follow(bus.clone(), inst.hub.clone(), setup.cancel.clone()));
        trackers.push((alerts, notifier));
    }
    let (alerts_a, notifier_a) = &trackers[0];
    let (alerts_b, notifier_b) = &trackers[1];

    let _first = connect(&a.hub, "fa_001");
    eventually("online notice on a", || notifier_a.events() == vec![NotificationEvent::Online]).await;

    a.hub.disconnect(ResourceKind::Agent, "fa_001");
    eventually("offline notice on a", || notifier_a.events().len() == 2).await;
    eventually("outage mirrored on b", || {
        matches!(alerts_b.state(ResourceKind::Agent, "fa_001"), AlertState::Firing { .. })
    })
    .await;

    let _second = connect(&b.hub, "fa_001");
    eventually("recovery notice on b", || {
        matches!(
            notifier_b.events().as_slice(),
            [NotificationEvent::Recovered { .. }]
        )
    })
    .await;
    eventually("a back to normal", || {
        alerts_a.state(ResourceKind::Agent, "fa_001") == AlertState::Normal
    })
    .await;

    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        notifier_a.events(),
        vec![NotificationEvent::Online, NotificationEvent::Offline]
    );
    assert!(alerts_b.firing().is_empty());
}
