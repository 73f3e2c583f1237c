use async_trait::async_trait;
use devpoll_core::{
    AdminCommand, Collaborators, ConfigurationStore, ConnectionSession, ControllerError, CovMode,
    DeviceController, DeviceEdit, DeviceRegistry, DeviceResolver, DeviceSettings, EditForm,
    FetchResults, GatewayError, ManualScheduler, MemoryStore, NetworkIdentity, ObjectType,
    PointId, PointUpdate, PropertyFetchGateway, RegistryError, RemoteDevice, ResolveError,
    ResolveRequest, StoreError, TimerState, TokioScheduler,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Default)]
struct Gateway {
    calls: Mutex<Vec<(String, Vec<PointId>)>>,
    hanging_macs: HashSet<String>,
}

#[async_trait]
impl PropertyFetchGateway for Gateway {
    async fn fetch(
        &self,
        device: &RemoteDevice,
        points: &[PointId],
    ) -> Result<FetchResults, GatewayError> {
        if self.hanging_macs.contains(&device.identity.mac) {
            futures::future::pending::<()>().await;
        }
        self.calls
            .lock()
            .push((device.identity.mac.clone(), points.to_vec()));
        Ok(points
            .iter()
            .map(|p| (*p, Ok(serde_json::json!(21.5))))
            .collect())
    }
}

#[derive(Default)]
struct Resolver {
    unreachable: Mutex<HashSet<String>>,
}

#[async_trait]
impl DeviceResolver for Resolver {
    async fn resolve(&self, request: &ResolveRequest) -> Result<RemoteDevice, ResolveError> {
        if self.unreachable.lock().contains(&request.identity.mac) {
            return Err(ResolveError::NotFound(request.identity.clone()));
        }
        Ok(RemoteDevice::bare(request.identity.clone()))
    }
}

struct Session;

impl ConnectionSession for Session {
    fn is_open(&self) -> bool {
        true
    }

    fn shutdown(&self) {}
}

/// Memory store with injectable write failures.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fail_save_for: Mutex<Option<String>>,
    fail_remove: Mutex<bool>,
}

impl ConfigurationStore for FlakyStore {
    fn list_devices(&self) -> Result<Vec<DeviceSettings>, StoreError> {
        self.inner.list_devices()
    }

    fn load_device(&self, name: &str) -> Result<Option<DeviceSettings>, StoreError> {
        self.inner.load_device(name)
    }

    fn save_device(&self, settings: &DeviceSettings) -> Result<(), StoreError> {
        if self.fail_save_for.lock().as_deref() == Some(settings.name.as_str()) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.inner.save_device(settings)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), StoreError> {
        self.inner.set_enabled(name, enabled)
    }

    fn rename_device(&self, old: &str, new: &str) -> Result<(), StoreError> {
        self.inner.rename_device(old, new)
    }

    fn remove_device(&self, name: &str) -> Result<(), StoreError> {
        if *self.fail_remove.lock() {
            return Err(StoreError::Backend("read-only".to_string()));
        }
        self.inner.remove_device(name)
    }

    fn points(&self, device: &str) -> Result<Vec<PointId>, StoreError> {
        self.inner.points(device)
    }

    fn add_point(&self, device: &str, point: PointId) -> Result<(), StoreError> {
        self.inner.add_point(device, point)
    }

    fn remove_point(&self, device: &str, point: PointId) -> Result<(), StoreError> {
        self.inner.remove_point(device, point)
    }

    fn set_disconnected(
        &self,
        device: &str,
        point: PointId,
        since: &str,
    ) -> Result<(), StoreError> {
        self.inner.set_disconnected(device, point, since)
    }

    fn clear_disconnected(&self, device: &str, point: PointId) -> Result<(), StoreError> {
        self.inner.clear_disconnected(device, point)
    }

    fn disconnected_since(
        &self,
        device: &str,
        point: PointId,
    ) -> Result<Option<String>, StoreError> {
        self.inner.disconnected_since(device, point)
    }
}

struct Fixture {
    scheduler: ManualScheduler,
    gateway: Arc<Gateway>,
    resolver: Arc<Resolver>,
    store: Arc<MemoryStore>,
    _updates: mpsc::Receiver<PointUpdate>,
    deps: Collaborators,
}

fn fixture_with(gateway: Gateway, scheduler: Arc<dyn devpoll_core::PollScheduler>) -> Fixture {
    let gateway = Arc::new(gateway);
    let resolver = Arc::new(Resolver::default());
    let store = Arc::new(MemoryStore::new());
    let (tx, rx) = mpsc::channel(1024);
    let deps = Collaborators {
        scheduler,
        gateway: gateway.clone(),
        resolver: resolver.clone(),
        store: store.clone(),
        session: Arc::new(Session),
        updates: tx,
    };
    Fixture {
        scheduler: ManualScheduler::new(),
        gateway,
        resolver,
        store,
        _updates: rx,
        deps,
    }
}

fn fixture() -> Fixture {
    let scheduler = ManualScheduler::new();
    let mut fixture = fixture_with(Gateway::default(), Arc::new(scheduler.clone()));
    fixture.scheduler = scheduler;
    fixture
}

fn settings(name: &str, mac: &str, enabled: bool) -> DeviceSettings {
    DeviceSettings {
        name: name.to_string(),
        identity: NetworkIdentity::new(mac, 2001),
        poll_interval_ms: 5000,
        cov_mode: CovMode::None,
        cov_lease_minutes: 0,
        enabled,
    }
}

fn point(instance: u32) -> PointId {
    PointId::new(ObjectType::AnalogValue, instance)
}

fn controller(f: &Fixture, enabled: bool) -> DeviceController {
    let settings = settings("boiler", "10.0.2.10:47808", enabled);
    f.store.save_device(&settings).unwrap();
    let device = RemoteDevice::bare(settings.identity.clone());
    DeviceController::new(settings, Some(device), f.deps.clone()).unwrap()
}

#[tokio::test]
async fn subscribe_before_enable_then_drain_and_resubscribe() {
    let f = fixture();
    let c = controller(&f, false);
    let p1 = point(1);
    let p2 = point(2);

    c.add_subscription(p1).await.unwrap();
    assert_eq!(c.timer_state().await, TimerState::Stopped);

    c.enable().await.unwrap();
    assert_eq!(c.timer_state().await, TimerState::Running);
    assert_eq!(f.scheduler.active_periods(), vec![Duration::from_millis(5000)]);

    c.remove_subscription(p1).await;
    assert_eq!(c.timer_state().await, TimerState::Stopped);
    assert_eq!(f.scheduler.active(), 0);

    c.add_subscription(p2).await.unwrap();
    assert_eq!(c.timer_state().await, TimerState::Running);
    assert_eq!(f.scheduler.active_periods(), vec![Duration::from_millis(5000)]);
    assert_eq!(f.scheduler.registrations(), 2);
}

#[tokio::test]
async fn reconfigure_restarts_with_all_subscribers() {
    let f = fixture();
    let c = controller(&f, true);
    c.add_subscription(point(1)).await.unwrap();
    c.add_subscription(point(2)).await.unwrap();

    let mut edit = DeviceEdit::unchanged(&settings("boiler", "10.0.2.10:47808", true));
    edit.poll_interval_ms = 2000;
    c.reconfigure(edit).await.unwrap();

    assert_eq!(f.scheduler.registrations(), 2);
    assert_eq!(f.scheduler.active_periods(), vec![Duration::from_millis(2000)]);
    assert_eq!(
        f.store.load_device("boiler").unwrap().unwrap().poll_interval_ms,
        2000
    );

    f.scheduler.fire().await;
    let calls = f.gateway.calls.lock().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, vec![point(1), point(2)]);
}

#[tokio::test]
async fn reconfigure_while_disabled_keeps_timer_stopped() {
    let f = fixture();
    let c = controller(&f, false);
    c.add_subscription(point(1)).await.unwrap();

    let mut edit = DeviceEdit::unchanged(&settings("boiler", "10.0.2.10:47808", false));
    edit.poll_interval_ms = 1000;
    c.reconfigure(edit).await.unwrap();

    assert_eq!(c.timer_state().await, TimerState::Stopped);
    assert_eq!(f.scheduler.registrations(), 0);
}

#[tokio::test]
async fn random_operation_sequences_hold_the_invariant() {
    let f = fixture();
    let c = controller(&f, false);
    let mut rng = StdRng::seed_from_u64(0x00de_7ce5);
    let mut enabled = false;
    let mut subscribed = HashSet::new();

    for _ in 0..500 {
        match rng.gen_range(0..5) {
            0 => {
                c.enable().await.unwrap();
                enabled = true;
            }
            1 => {
                c.disable().await.unwrap();
                enabled = false;
            }
            2 => {
                let p = point(rng.gen_range(0..4));
                c.add_subscription(p).await.unwrap();
                subscribed.insert(p);
            }
            3 => {
                let p = point(rng.gen_range(0..4));
                c.remove_subscription(p).await;
                subscribed.remove(&p);
            }
            _ => {
                let mut edit =
                    DeviceEdit::unchanged(&settings("boiler", "10.0.2.10:47808", enabled));
                edit.poll_interval_ms = rng.gen_range(1..10_000);
                c.reconfigure(edit).await.unwrap();
            }
        }

        let should_run = enabled && !subscribed.is_empty();
        let expected = if should_run {
            TimerState::Running
        } else {
            TimerState::Stopped
        };
        assert_eq!(c.timer_state().await, expected);
        assert_eq!(f.scheduler.active(), usize::from(should_run));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_subscribers_and_edits_settle_consistently() {
    let f = fixture();
    let c = Arc::new(controller(&f, true));

    let mut tasks = Vec::new();
    for worker in 0..8u32 {
        let c = Arc::clone(&c);
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                let p = point(worker * 100 + i);
                c.add_subscription(p).await.unwrap();
                if i % 2 == 0 {
                    c.remove_subscription(p).await;
                }
            }
        }));
    }
    {
        let c = Arc::clone(&c);
        tasks.push(tokio::spawn(async move {
            for interval in [1000, 1500, 2000, 2500] {
                let mut edit = DeviceEdit::unchanged(&settings("boiler", "10.0.2.10:47808", true));
                edit.poll_interval_ms = interval;
                c.reconfigure(edit).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(c.subscribed_points().len(), 8 * 25);
    assert_eq!(c.timer_state().await, TimerState::Running);
    assert_eq!(f.scheduler.active_periods(), vec![Duration::from_millis(2500)]);

    f.scheduler.fire().await;
    assert_eq!(f.gateway.calls.lock()[0].1.len(), 200);
}

#[tokio::test(start_paused = true)]
async fn slow_device_does_not_stall_others() {
    let gateway = Gateway {
        hanging_macs: HashSet::from(["10.0.9.9:47808".to_string()]),
        ..Gateway::default()
    };
    let f = fixture_with(gateway, Arc::new(TokioScheduler::current()));

    let stuck = settings("stuck", "10.0.9.9:47808", true);
    let healthy = settings("healthy", "10.0.9.10:47808", true);
    let mut controllers = Vec::new();
    for s in [stuck, healthy] {
        f.store.save_device(&s).unwrap();
        let device = RemoteDevice::bare(s.identity.clone());
        let c = DeviceController::new(s, Some(device), f.deps.clone()).unwrap();
        c.add_subscription(point(1)).await.unwrap();
        controllers.push(c);
    }

    tokio::time::sleep(Duration::from_millis(20_500)).await;

    let calls = f.gateway.calls.lock().clone();
    let mut per_device: HashMap<String, usize> = HashMap::new();
    for (mac, _) in calls {
        *per_device.entry(mac).or_default() += 1;
    }
    assert_eq!(per_device.get("10.0.9.10:47808"), Some(&5));
    assert_eq!(per_device.get("10.0.9.9:47808"), None);
}

#[tokio::test]
async fn duplicate_starts_stopped_and_empty() {
    let f = fixture();
    let registry = DeviceRegistry::new(f.deps.clone());
    let original = registry
        .add_device(settings("chiller", "10.0.3.1:47808", true))
        .await
        .unwrap();
    original.register_point(point(4)).await.unwrap();
    original.add_subscription(point(4)).await.unwrap();

    registry
        .execute(
            "chiller",
            AdminCommand::Duplicate {
                name: "chiller-2".to_string(),
            },
        )
        .await
        .unwrap();

    let copy = registry.get("chiller-2").await.unwrap();
    let status = copy.status().await;
    assert_eq!(status.timer, TimerState::Stopped);
    assert_eq!(status.subscriptions, 0);
    assert_eq!(f.store.points("chiller-2").unwrap(), vec![point(4)]);
    assert_eq!(original.timer_state().await, TimerState::Running);
    assert_eq!(f.scheduler.active(), 1);
}

#[tokio::test]
async fn restore_with_unreachable_device_comes_up_disabled() {
    let f = fixture();
    f.store
        .save_device(&settings("ok", "10.0.4.1:47808", true))
        .unwrap();
    f.store
        .save_device(&settings("gone", "10.0.4.2:47808", true))
        .unwrap();
    f.resolver
        .unreachable
        .lock()
        .insert("10.0.4.2:47808".to_string());

    let registry = DeviceRegistry::new(f.deps.clone());
    assert_eq!(registry.restore_all().await.unwrap(), 2);

    let gone = registry.get("gone").await.unwrap().status().await;
    let ok = registry.get("ok").await.unwrap().status().await;
    assert!(!gone.enabled);
    assert!(ok.enabled);
    assert!(!f.store.load_device("gone").unwrap().unwrap().enabled);
}

#[tokio::test]
async fn edit_command_renames_registry_entry() {
    let f = fixture();
    let registry = DeviceRegistry::new(f.deps.clone());
    registry
        .add_device(settings("rtu", "10.0.5.1:47808", true))
        .await
        .unwrap();

    let mut form: EditForm = registry.get("rtu").await.unwrap().edit_form().await.unwrap();
    form.name = "rtu-roof".to_string();
    form.polling_interval_secs = 30.0;
    registry
        .execute("rtu", AdminCommand::Edit { form })
        .await
        .unwrap();

    assert!(registry.get("rtu").await.is_none());
    let status = registry.get("rtu-roof").await.unwrap().status().await;
    assert_eq!(status.poll_interval_ms, 30_000);
}

#[tokio::test]
async fn remove_command_releases_timer() {
    let f = fixture();
    let registry = DeviceRegistry::new(f.deps.clone());
    let c = registry
        .add_device(settings("fcu", "10.0.6.1:47808", true))
        .await
        .unwrap();
    c.add_subscription(point(9)).await.unwrap();
    assert_eq!(f.scheduler.active(), 1);

    registry.execute("fcu", AdminCommand::Remove).await.unwrap();

    assert_eq!(f.scheduler.active(), 0);
    assert!(registry.names().await.is_empty());
    assert!(f.store.load_device("fcu").unwrap().is_none());
}

#[tokio::test]
async fn zero_interval_device_is_never_persisted() {
    let f = fixture();
    let registry = DeviceRegistry::new(f.deps.clone());
    let mut bad = settings("vav-bad", "10.0.7.1:47808", true);
    bad.poll_interval_ms = 0;

    let err = registry
        .add_device(bad)
        .await
        .err()
        .expect("zero interval rejected");

    assert!(matches!(
        err,
        RegistryError::Controller(ControllerError::InvalidInterval(_))
    ));
    assert!(f.store.load_device("vav-bad").unwrap().is_none());
    assert!(registry.names().await.is_empty());
}

#[tokio::test]
async fn restore_skips_unusable_rows_and_keeps_going() {
    let f = fixture();
    let mut bad = settings("aaa-bad", "10.0.7.2:47808", true);
    bad.poll_interval_ms = 0;
    f.store.save_device(&bad).unwrap();
    f.store
        .save_device(&settings("zzz-good", "10.0.7.3:47808", true))
        .unwrap();

    let registry = DeviceRegistry::new(f.deps.clone());

    assert_eq!(registry.restore_all().await.unwrap(), 1);
    assert!(registry.get("aaa-bad").await.is_none());
    assert!(registry.get("zzz-good").await.unwrap().status().await.enabled);
}

#[tokio::test]
async fn failed_save_after_rename_restores_the_old_name() {
    let f = fixture();
    let store = Arc::new(FlakyStore::default());
    let deps = Collaborators {
        store: store.clone(),
        ..f.deps.clone()
    };
    let original = settings("ahu", "10.0.8.1:47808", true);
    store.save_device(&original).unwrap();
    let c = DeviceController::new(
        original.clone(),
        Some(RemoteDevice::bare(original.identity.clone())),
        deps,
    )
    .unwrap();
    c.register_point(point(1)).await.unwrap();
    *store.fail_save_for.lock() = Some("renamed".to_string());

    let err = c
        .reconfigure(DeviceEdit {
            name: "renamed".to_string(),
            identity: original.identity.clone(),
            poll_interval_ms: 2000,
            cov_mode: CovMode::None,
            cov_lease_minutes: 0,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ControllerError::Store(_)));
    assert_eq!(c.name().await, "ahu");
    assert_eq!(store.load_device("ahu").unwrap(), Some(original));
    assert!(store.load_device("renamed").unwrap().is_none());

    c.disable().await.unwrap();
    assert!(store.disconnected_since("ahu", point(1)).unwrap().is_some());
    assert!(!store.load_device("ahu").unwrap().unwrap().enabled);
}

#[tokio::test]
async fn failed_delete_keeps_device_registered_and_polling() {
    let f = fixture();
    let store = Arc::new(FlakyStore::default());
    let registry = DeviceRegistry::new(Collaborators {
        store: store.clone(),
        ..f.deps.clone()
    });
    let c = registry
        .add_device(settings("fcu-2", "10.0.8.2:47808", true))
        .await
        .unwrap();
    c.add_subscription(point(3)).await.unwrap();
    *store.fail_remove.lock() = true;

    assert!(registry.execute("fcu-2", AdminCommand::Remove).await.is_err());

    assert!(registry.get("fcu-2").await.is_some());
    assert!(store.load_device("fcu-2").unwrap().is_some());
    assert_eq!(c.timer_state().await, TimerState::Running);
    assert_eq!(f.scheduler.active(), 1);

    *store.fail_remove.lock() = false;
    registry.execute("fcu-2", AdminCommand::Remove).await.unwrap();
    assert!(registry.get("fcu-2").await.is_none());
    assert_eq!(f.scheduler.active(), 0);
}
