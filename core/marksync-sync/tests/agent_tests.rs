use marksync_storage::{
    AppendOutcome, LocalStore, MemoryEventStore, MemoryLocalStore, SqliteLocalStore, StorageError,
    StorageResult, SyncEventStore,
};
use async_trait::async_trait;
use marksync_sync::{
    AgentConfig, AgentEvent, CoordinatorConfig, LocalConnector, ReconnectPolicy, SyncAgent,
    SyncCoordinator, SyncError, SyncMessage, SyncResponse, SyncResult, SyncTransport,
    TransportConnector,
};
use marksync_types::{ConnectionStatus, DeviceId, EventType, ResourceKey, SyncEvent, UserId};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

// ── Helpers ──────────────────────────────────────────────────────

const WAIT: Duration = Duration::from_secs(5);

fn fast_config() -> AgentConfig {
    AgentConfig {
        op_timeout: Duration::from_secs(2),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(40),
            max_attempts: 1_000,
        },
        ..AgentConfig::default()
    }
}

fn memory_coordinator() -> Arc<SyncCoordinator> {
    Arc::new(SyncCoordinator::new(
        CoordinatorConfig::default(),
        Arc::new(MemoryEventStore::new()),
    ))
}

struct Device {
    agent: Arc<SyncAgent<LocalConnector>>,
    connector: LocalConnector,
    events: broadcast::Receiver<AgentEvent>,
    task: Option<JoinHandle<SyncResult<()>>>,
}

impl Device {
    fn new(
        coordinator: &Arc<SyncCoordinator>,
        user: &str,
        device: &str,
        config: AgentConfig,
        local: Arc<dyn LocalStore>,
    ) -> Self {
        let (user, device) = (UserId::new(user), DeviceId::new(device));
        let connector = LocalConnector::new(coordinator.clone(), user.clone(), device.clone());
        let agent =
            Arc::new(SyncAgent::new(user, device, config, connector.clone(), local).unwrap());
        let events = agent.subscribe();
        Self {
            agent,
            connector,
            events,
            task: None,
        }
    }

    fn online(coordinator: &Arc<SyncCoordinator>, user: &str, device: &str) -> Self {
        let local = Arc::new(MemoryLocalStore::new());
        let mut d = Self::new(coordinator, user, device, fast_config(), local);
        d.start();
        d
    }

    fn start(&mut self) {
        let agent = self.agent.clone();
        self.task = Some(tokio::spawn(async move { agent.run().await }));
    }

    fn create(&self, id: &str) -> SyncEvent {
        self.agent
            .record(
                EventType::Create,
                "bookmark",
                id,
                json!({"url": format!("https://example.com/{id}"), "title": id}),
            )
            .unwrap()
    }

    /// Waits for an event matching `pred`, skipping others.
    async fn wait_for(&mut self, pred: impl Fn(&AgentEvent) -> bool) -> AgentEvent {
        tokio::time::timeout(WAIT, async {
            loop {
                match self.events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("agent event channel closed")
                    }
                }
            }
        })
        .await
        .expect("timed out waiting for agent event")
    }

    async fn wait_connected(&mut self) {
        if self.agent.status() != ConnectionStatus::Connected {
            self.wait_for(|e| *e == AgentEvent::StatusChanged(ConnectionStatus::Connected))
                .await;
        }
    }

    async fn stop(mut self) -> SyncResult<()> {
        self.agent.shutdown();
        let task = self.task.take().expect("agent not started");
        tokio::time::timeout(WAIT, task).await.expect("agent did not stop").unwrap()
    }
}

/// Polls `condition` until it holds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn key(id: &str) -> ResourceKey {
    ResourceKey::new("bookmark", id)
}

// ── Live sync ────────────────────────────────────────────────────

#[tokio::test]
async fn event_reaches_other_online_device() {
    let coordinator = memory_coordinator();
    let mut laptop = Device::online(&coordinator, "u1", "laptop");
    let mut phone = Device::online(&coordinator, "u1", "phone");
    laptop.wait_connected().await;
    phone.wait_connected().await;

    let event = laptop.create("b1");

    let delivered = laptop.wait_for(|e| matches!(e, AgentEvent::Delivered { .. })).await;
    assert_eq!(delivered, AgentEvent::Delivered { event_id: event.id, sequence: 1 });

    let applied = phone.wait_for(|e| matches!(e, AgentEvent::RemoteApplied { .. })).await;
    assert_eq!(
        applied,
        AgentEvent::RemoteApplied {
            event_id: event.id,
            resource: key("b1"),
            sequence: 1,
        }
    );

    let cached = phone.agent.cached(&key("b1")).unwrap();
    assert_eq!(cached.content["title"], "b1");
    assert_eq!(cached.sequence, Some(1));
    assert!(laptop.agent.pending_events().is_empty());
    eventually("phone checkpoint", || phone.agent.checkpoint() == 1).await;
    assert_eq!(laptop.agent.checkpoint(), 1);

    laptop.stop().await.unwrap();
    phone.stop().await.unwrap();
}

#[tokio::test]
async fn sender_never_receives_its_own_event() {
    let coordinator = memory_coordinator();
    let mut laptop = Device::online(&coordinator, "u1", "laptop");
    laptop.wait_connected().await;

    laptop.create("b1");
    laptop.wait_for(|e| matches!(e, AgentEvent::Delivered { .. })).await;
    laptop.create("b2");
    laptop.wait_for(|e| matches!(e, AgentEvent::Delivered { .. })).await;

    while let Ok(event) = laptop.events.try_recv() {
        assert!(!matches!(event, AgentEvent::RemoteApplied { .. }), "echoed: {event:?}");
    }
    let entry = laptop.agent.cached(&key("b2")).unwrap();
    assert_eq!(entry.pending, None);
    assert_eq!(entry.sequence, Some(2));

    laptop.stop().await.unwrap();
}

// ── Offline operation ────────────────────────────────────────────

#[tokio::test]
async fn offline_events_are_delivered_in_order_after_reconnect() {
    let coordinator = memory_coordinator();
    let mut laptop = Device::online(&coordinator, "u1", "laptop");
    let mut phone = Device::new(
        &coordinator,
        "u1",
        "phone",
        fast_config(),
        Arc::new(MemoryLocalStore::new()),
    );
    phone.connector.set_online(false);
    phone.start();
    laptop.wait_connected().await;

    let created: Vec<SyncEvent> = ["x", "y", "z"].iter().map(|id| phone.create(id)).collect();
    assert_eq!(phone.agent.pending_events().len(), 3);
    assert!(phone.agent.cached(&key("x")).unwrap().pending.is_some());

    phone.connector.set_online(true);
    let mut delivered = Vec::new();
    for _ in 0..3 {
        if let AgentEvent::Delivered { event_id, sequence } =
            phone.wait_for(|e| matches!(e, AgentEvent::Delivered { .. })).await
        {
            delivered.push((event_id, sequence));
        }
    }
    let expected: Vec<_> = created.iter().zip(1u64..).map(|(e, seq)| (e.id, seq)).collect();
    assert_eq!(delivered, expected);
    assert!(phone.agent.pending_events().is_empty());

    let mut received = Vec::new();
    for _ in 0..3 {
        if let AgentEvent::RemoteApplied { resource, .. } =
            laptop.wait_for(|e| matches!(e, AgentEvent::RemoteApplied { .. })).await
        {
            received.push(resource.resource_id);
        }
    }
    assert_eq!(received, vec!["x", "y", "z"]);

    laptop.stop().await.unwrap();
    phone.stop().await.unwrap();
}

#[tokio::test]
async fn reconnecting_device_catches_up_by_delta() {
    let coordinator = memory_coordinator();
    let mut laptop = Device::online(&coordinator, "u1", "laptop");
    let mut phone = Device::online(&coordinator, "u1", "phone");
    laptop.wait_connected().await;
    phone.wait_connected().await;

    phone.connector.set_online(false);
    phone
        .wait_for(|e| *e == AgentEvent::StatusChanged(ConnectionStatus::Disconnected))
        .await;

    for id in ["a", "b", "c"] {
        laptop.create(id);
        laptop.wait_for(|e| matches!(e, AgentEvent::Delivered { .. })).await;
    }
    assert_eq!(phone.agent.checkpoint(), 0);

    phone.connector.set_online(true);
    eventually("phone catch-up", || phone.agent.checkpoint() == 3).await;
    for id in ["a", "b", "c"] {
        assert!(phone.agent.cached(&key(id)).is_some(), "missing {id}");
    }

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let state = coordinator
            .device_state(&UserId::new("u1"), &DeviceId::new("phone"))
            .await
            .unwrap();
        if state.last_sync_sequence == 3 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "checkpoint never reported");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    laptop.stop().await.unwrap();
    phone.stop().await.unwrap();
}

#[tokio::test]
async fn delta_checkpoint_covers_own_events() {
    let coordinator = memory_coordinator();
    let mut laptop = Device::online(&coordinator, "u1", "laptop");
    laptop.wait_connected().await;
    laptop.create("a");
    laptop.wait_for(|e| matches!(e, AgentEvent::Delivered { .. })).await;

    // The phone's own events were persisted while it was away.
    for id in ["p1", "p2"] {
        let event =
            SyncEvent::create(UserId::new("u1"), DeviceId::new("phone"), "bookmark", id, json!({}));
        coordinator
            .ingest(&UserId::new("u1"), &DeviceId::new("phone"), event)
            .await
            .unwrap();
    }

    let mut phone = Device::online(&coordinator, "u1", "phone");
    eventually("phone checkpoint", || phone.agent.checkpoint() == 3).await;
    let applied = phone.wait_for(|e| matches!(e, AgentEvent::RemoteApplied { .. })).await;
    assert!(matches!(applied, AgentEvent::RemoteApplied { sequence: 1, .. }));
    assert!(phone.agent.cached(&key("p1")).is_none());

    laptop.stop().await.unwrap();
    phone.stop().await.unwrap();
}

#[tokio::test]
async fn queue_and_checkpoint_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("phone.db");
    let coordinator = memory_coordinator();

    let phone = Device::new(
        &coordinator,
        "u1",
        "phone",
        fast_config(),
        Arc::new(SqliteLocalStore::open(&path).unwrap()),
    );
    let first = phone.create("a");
    let second = phone.create("b");
    drop(phone);

    let mut phone = Device::new(
        &coordinator,
        "u1",
        "phone",
        fast_config(),
        Arc::new(SqliteLocalStore::open(&path).unwrap()),
    );
    let pending: Vec<_> = phone.agent.pending_events().iter().map(|e| e.id).collect();
    assert_eq!(pending, vec![first.id, second.id]);
    assert!(phone.agent.cached(&key("a")).is_some());

    phone.start();
    eventually("queue drained", || phone.agent.pending_events().is_empty()).await;
    assert_eq!(phone.agent.checkpoint(), 2);
    phone.stop().await.unwrap();

    let local = SqliteLocalStore::open(&path).unwrap();
    assert!(local.load_queue().unwrap().is_empty());
    assert_eq!(local.load_checkpoint().unwrap(), 2);
}

// ── Failures ─────────────────────────────────────────────────────

/// Fails appends while `failing` is set.
struct FlakyStore {
    inner: MemoryEventStore,
    failing: AtomicBool,
}

impl SyncEventStore for FlakyStore {
    fn append(&self, event: SyncEvent) -> StorageResult<AppendOutcome> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("disk offline".into()));
        }
        self.inner.append(event)
    }

    fn read_since(&self, user_id: &UserId, after: u64) -> StorageResult<Vec<SyncEvent>> {
        self.inner.read_since(user_id, after)
    }

    fn latest_sequence(&self, user_id: &UserId) -> StorageResult<u64> {
        self.inner.latest_sequence(user_id)
    }

    fn load_checkpoint(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
    ) -> StorageResult<Option<u64>> {
        self.inner.load_checkpoint(user_id, device_id)
    }

    fn save_checkpoint(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        sequence: u64,
    ) -> StorageResult<u64> {
        self.inner.save_checkpoint(user_id, device_id, sequence)
    }
}

#[tokio::test]
async fn store_outage_keeps_event_queued_until_recovery() {
    let store = Arc::new(FlakyStore {
        inner: MemoryEventStore::new(),
        failing: AtomicBool::new(true),
    });
    let coordinator = Arc::new(SyncCoordinator::new(CoordinatorConfig::default(), store.clone()));
    let mut phone = Device::online(&coordinator, "u1", "phone");
    phone.wait_connected().await;

    let event = phone.create("a");
    let rejected = phone.wait_for(|e| matches!(e, AgentEvent::Rejected { .. })).await;
    assert_eq!(
        rejected,
        AgentEvent::Rejected {
            event_id: Some(event.id),
            code: 503,
            message: "event store unavailable: store unavailable: disk offline".into(),
        }
    );
    assert_eq!(phone.agent.pending_events().len(), 1);

    store.failing.store(false, Ordering::SeqCst);
    let delivered = phone.wait_for(|e| matches!(e, AgentEvent::Delivered { .. })).await;
    assert_eq!(delivered, AgentEvent::Delivered { event_id: event.id, sequence: 1 });
    assert!(phone.agent.pending_events().is_empty());

    phone.stop().await.unwrap();
}

#[tokio::test]
async fn gives_up_after_max_reconnect_attempts() {
    let coordinator = memory_coordinator();
    let config = AgentConfig {
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: 3,
        },
        ..fast_config()
    };
    let local = Arc::new(MemoryLocalStore::new());
    let mut phone = Device::new(&coordinator, "u1", "phone", config, local);
    phone.connector.set_online(false);

    let result = tokio::time::timeout(WAIT, phone.agent.run()).await.unwrap();
    assert!(matches!(result, Err(SyncError::ReconnectExhausted { attempts: 3 })));

    let mut attempts = Vec::new();
    while let Ok(event) = phone.events.try_recv() {
        if let AgentEvent::Reconnecting { attempt, .. } = event {
            attempts.push(attempt);
        }
    }
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(phone.agent.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn unauthorized_stops_the_agent() {
    let coordinator = memory_coordinator();
    let local = Arc::new(MemoryLocalStore::new());
    let phone = Device::new(&coordinator, "", "phone", fast_config(), local);

    let result = tokio::time::timeout(WAIT, phone.agent.run()).await.unwrap();
    assert!(matches!(result, Err(SyncError::Unauthorized(_))));
}

#[tokio::test]
async fn record_never_waits_for_network() {
    let coordinator = memory_coordinator();
    let local = Arc::new(MemoryLocalStore::new());
    let phone = Device::new(&coordinator, "u1", "phone", fast_config(), local);

    // Not running at all: recording still succeeds and queues.
    let event = phone.create("a");
    assert_eq!(phone.agent.pending_events(), vec![event]);
    assert_eq!(phone.agent.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn foreign_events_cannot_be_enqueued() {
    let coordinator = memory_coordinator();
    let local = Arc::new(MemoryLocalStore::new());
    let phone = Device::new(&coordinator, "u1", "phone", fast_config(), local);

    let foreign =
        SyncEvent::create(UserId::new("u1"), DeviceId::new("laptop"), "bookmark", "a", json!({}));
    assert!(matches!(phone.agent.enqueue(foreign), Err(SyncError::Unauthorized(_))));

    let persisted =
        SyncEvent::create(UserId::new("u1"), DeviceId::new("phone"), "bookmark", "a", json!({}))
            .with_sequence(4);
    assert!(matches!(phone.agent.enqueue(persisted), Err(SyncError::Protocol(_))));
    assert!(phone.agent.pending_events().is_empty());
}

#[tokio::test]
async fn shutdown_before_connect_returns_ok() {
    let coordinator = memory_coordinator();
    let local = Arc::new(MemoryLocalStore::new());
    let phone = Device::new(&coordinator, "u1", "phone", fast_config(), local);
    phone.agent.shutdown();

    let result = tokio::time::timeout(WAIT, phone.agent.run()).await.unwrap();
    assert!(result.is_ok());
}

// ── Heartbeat and periodic sync ──────────────────────────────────

type Responder = dyn Fn(usize) -> Vec<SyncMessage> + Send + Sync;

/// A server that answers each `sync_request` from a script and otherwise
/// stays silent unless told to answer pings.
#[derive(Clone)]
struct ScriptedConnector {
    responder: Arc<Responder>,
    answer_pings: bool,
    sent: Arc<Mutex<Vec<SyncMessage>>>,
    connects: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    fn new(
        answer_pings: bool,
        responder: impl Fn(usize) -> Vec<SyncMessage> + Send + Sync + 'static,
    ) -> Self {
        Self {
            responder: Arc::new(responder),
            answer_pings,
            sent: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn sync_requests(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| matches!(m, SyncMessage::SyncRequest(_)))
            .count()
    }

    fn reported_checkpoints(&self) -> Vec<u64> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter_map(|m| match m {
                SyncMessage::Checkpoint(report) => Some(report.last_sequence),
                _ => None,
            })
            .collect()
    }
}

struct ScriptedTransport {
    connector: ScriptedConnector,
    // Held so `recv` stays pending instead of reporting a closed connection.
    inbox_tx: mpsc::UnboundedSender<SyncMessage>,
    inbox_rx: mpsc::UnboundedReceiver<SyncMessage>,
}

#[async_trait]
impl SyncTransport for ScriptedTransport {
    async fn send(&mut self, message: SyncMessage) -> SyncResult<()> {
        let replies = match &message {
            SyncMessage::SyncRequest(_) => {
                let index = self.connector.sync_requests();
                (self.connector.responder)(index)
            }
            SyncMessage::Ping(heartbeat) if self.connector.answer_pings => {
                vec![SyncMessage::Pong(*heartbeat)]
            }
            _ => Vec::new(),
        };
        self.connector.sent.lock().unwrap().push(message);
        for reply in replies {
            let _ = self.inbox_tx.send(reply);
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<SyncResult<SyncMessage>> {
        self.inbox_rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> SyncResult<()> {
        Ok(())
    }
}

#[async_trait]
impl TransportConnector for ScriptedConnector {
    type Transport = ScriptedTransport;

    async fn connect(&self) -> SyncResult<ScriptedTransport> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        Ok(ScriptedTransport {
            connector: self.clone(),
            inbox_tx,
            inbox_rx,
        })
    }
}

fn empty_response(last_sync_sequence: u64) -> SyncMessage {
    SyncMessage::SyncResponse(SyncResponse {
        events: Vec::new(),
        last_sync_sequence,
    })
}

fn tablet_event(id: &str, sequence: u64) -> SyncEvent {
    SyncEvent::create(
        UserId::new("u1"),
        DeviceId::new("tablet"),
        "bookmark",
        id,
        json!({"title": id}),
    )
    .with_sequence(sequence)
}

fn scripted_agent(
    connector: ScriptedConnector,
    config: AgentConfig,
) -> Arc<SyncAgent<ScriptedConnector>> {
    Arc::new(
        SyncAgent::new(
            UserId::new("u1"),
            DeviceId::new("phone"),
            config,
            connector,
            Arc::new(MemoryLocalStore::new()),
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn silent_server_triggers_heartbeat_timeout_and_reconnect() {
    let connector = ScriptedConnector::new(false, |_| vec![empty_response(0)]);
    let config = AgentConfig {
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(60),
        ..fast_config()
    };
    let agent = scripted_agent(connector.clone(), config.clone());
    let mut events = agent.subscribe();
    let task = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run().await }
    });

    let observed = tokio::time::timeout(WAIT, async {
        let mut connected_at = None;
        let mut seen = Vec::new();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("agent event channel closed"),
            };
            if event == AgentEvent::StatusChanged(ConnectionStatus::Connected)
                && connected_at.is_none()
            {
                connected_at = Some(tokio::time::Instant::now());
                continue;
            }
            if connected_at.is_none() {
                continue;
            }
            let done = matches!(event, AgentEvent::Reconnecting { .. });
            seen.push(event);
            if done {
                return (connected_at.map(|at| at.elapsed()), seen);
            }
        }
    })
    .await
    .expect("agent never noticed the silent server");

    let (elapsed, seen) = observed;
    assert_eq!(seen.len(), 2, "events after connect: {seen:?}");
    assert_eq!(seen[0], AgentEvent::StatusChanged(ConnectionStatus::Disconnected));
    assert!(matches!(seen[1], AgentEvent::Reconnecting { attempt: 1, .. }), "got {:?}", seen[1]);
    let elapsed = elapsed.unwrap();
    assert!(elapsed >= config.heartbeat_timeout, "dropped after only {elapsed:?}");

    eventually("second connection", || connector.connects.load(Ordering::SeqCst) >= 2).await;

    agent.shutdown();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn answered_pings_keep_the_session_alive() {
    let connector = ScriptedConnector::new(true, |_| vec![empty_response(0)]);
    let config = AgentConfig {
        heartbeat_interval: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(60),
        ..fast_config()
    };
    let agent = scripted_agent(connector.clone(), config);
    let task = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run().await }
    });

    eventually("connected", || agent.status() == ConnectionStatus::Connected).await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(agent.status(), ConnectionStatus::Connected);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 1);

    agent.shutdown();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn periodic_sync_closes_checkpoint_gap() {
    // The live push skips sequences 1 and 2; the next periodic delta
    // delivers them.
    let connector = ScriptedConnector::new(true, |index| match index {
        0 => vec![empty_response(0), SyncMessage::SyncEvent(tablet_event("c", 3))],
        _ => vec![SyncMessage::SyncResponse(SyncResponse {
            events: vec![tablet_event("a", 1), tablet_event("b", 2)],
            last_sync_sequence: 3,
        })],
    });
    let config = AgentConfig {
        periodic_sync_interval: Duration::from_millis(300),
        ..fast_config()
    };
    let agent = scripted_agent(connector.clone(), config);
    let mut events = agent.subscribe();
    let task = tokio::spawn({
        let agent = agent.clone();
        async move { agent.run().await }
    });

    tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(AgentEvent::RemoteApplied { sequence: 3, .. }) = events.recv().await {
                return;
            }
        }
    })
    .await
    .expect("live event never applied");
    assert_eq!(connector.sync_requests(), 1);
    assert_eq!(agent.checkpoint(), 0);

    eventually("periodic catch-up", || agent.checkpoint() == 3).await;
    assert!(connector.sync_requests() >= 2);
    for id in ["a", "b", "c"] {
        assert!(agent.cached(&key(id)).is_some(), "missing {id}");
    }
    eventually("checkpoint reported", || connector.reported_checkpoints().contains(&3)).await;

    agent.shutdown();
    tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
}
