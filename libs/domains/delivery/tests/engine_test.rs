//! End-to-end engine tests against the in-memory queue store and a
//! scripted provider driver.

use async_trait::async_trait;
use domain_delivery::{
    metrics, BucketConfig, DeliveryConfig, DriverRegistry, EnqueueRequest, Enqueuer, OutboundEmail,
    Priority, ProviderDriver, ProviderKind, Scheduler, SendOutcome, TemplateEngine, Worker,
    WorkerContext, WorkerSupervisor, CONSUMER_GROUP,
};
use queue_store::{keys, MemoryQueueStore, QueueStore};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Driver stub that replays a scripted outcome sequence and records every
/// dispatch with its start time.
struct ScriptedDriver {
    outcomes: Mutex<VecDeque<SendOutcome>>,
    dispatches: Mutex<Vec<(Instant, OutboundEmail)>>,
}

impl ScriptedDriver {
    fn new(outcomes: Vec<SendOutcome>) -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(outcomes.into()),
            dispatches: Mutex::new(Vec::new()),
        })
    }

    fn always_ok() -> Arc<Self> {
        Self::new(Vec::new())
    }

    fn dispatch_count(&self) -> usize {
        self.dispatches.lock().unwrap().len()
    }

    fn dispatched_subjects(&self) -> Vec<String> {
        self.dispatches
            .lock()
            .unwrap()
            .iter()
            .map(|(_, email)| email.subject.clone())
            .collect()
    }

    fn first_dispatch(&self) -> Option<OutboundEmail> {
        self.dispatches
            .lock()
            .unwrap()
            .first()
            .map(|(_, email)| email.clone())
    }
}

#[async_trait]
impl ProviderDriver for ScriptedDriver {
    async fn send(&self, email: &OutboundEmail, _deadline: Duration) -> SendOutcome {
        self.dispatches
            .lock()
            .unwrap()
            .push((Instant::now(), email.clone()));

        let mut outcomes = self.outcomes.lock().unwrap();
        outcomes
            .pop_front()
            .unwrap_or(SendOutcome::Ok { message_id: None })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// A running engine: store, enqueuer, and the shutdown handle for the
/// supervisor + scheduler tasks.
struct Engine {
    store: Arc<MemoryQueueStore>,
    enqueuer: Enqueuer,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Engine {
    async fn start(driver: Arc<ScriptedDriver>, config: DeliveryConfig) -> Self {
        metrics::init_metrics();

        let store = Arc::new(MemoryQueueStore::new());
        let dyn_store: Arc<dyn QueueStore> = store.clone();

        let drivers = DriverRegistry::new().register(ProviderKind::Smtp, driver);
        let ctx = WorkerContext::new(
            dyn_store.clone(),
            config.clone(),
            drivers,
            TemplateEngine::new().unwrap(),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let supervisor = WorkerSupervisor::with_process_id(ctx.clone(), "itest");
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let _ = supervisor.run(rx).await;
        }));

        let scheduler = Scheduler::new(dyn_store.clone(), config.clone(), "itest-sched");
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let _ = scheduler.run(rx).await;
        }));

        Self {
            store,
            enqueuer: Enqueuer::new(dyn_store, config),
            shutdown,
            tasks,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
        }
    }
}

fn fast_config() -> DeliveryConfig {
    let mut config = DeliveryConfig::default();
    config.worker_count = 1;
    config.poll_block = Duration::from_millis(20);
    config.scheduler_tick = Duration::from_millis(20);
    config.base_retry_delay = Duration::from_millis(200);
    config.drain_timeout = Duration::from_secs(2);
    config
}

fn request(recipient: &str, template: &str) -> EnqueueRequest {
    EnqueueRequest {
        recipients: vec![recipient.to_string()],
        template: template.to_string(),
        context: serde_json::Map::new(),
        subject: None,
        priority: None,
        provider: None,
        scheduled_for: None,
        endpoint_label: "send".to_string(),
    }
}

async fn wait_until<F, Fut>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while !predicate().await {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn audit_contains(store: &Arc<MemoryQueueStore>, job_id: &str, needle: &str) -> bool {
    store
        .get_audit(job_id)
        .await
        .ok()
        .flatten()
        .map(|record| record.contains(needle))
        .unwrap_or(false)
}

#[tokio::test]
async fn enqueue_then_send() {
    let driver = ScriptedDriver::always_ok();
    let engine = Engine::start(driver.clone(), fast_config()).await;

    let result = engine
        .enqueuer
        .enqueue(request("a@x.io", "welcome"), "billing")
        .await
        .unwrap();

    // Dispatched within two seconds, exactly once, to the right recipient
    let d = driver.clone();
    wait_until(Duration::from_secs(2), || {
        let d = d.clone();
        async move { d.dispatch_count() >= 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.dispatch_count(), 1);

    let email = driver.first_dispatch().unwrap();
    assert_eq!(email.recipients, vec!["a@x.io".to_string()]);

    let job_id = result.job_id.to_string();
    wait_until(Duration::from_secs(2), || {
        let store = engine.store.clone();
        let job_id = job_id.clone();
        async move { audit_contains(&store, &job_id, "\"final_status\":\"sent\"").await }
    })
    .await;

    engine.stop().await;
}

#[tokio::test]
async fn priority_preemption_with_single_worker() {
    let driver = ScriptedDriver::always_ok();
    let store = Arc::new(MemoryQueueStore::new());
    let dyn_store: Arc<dyn QueueStore> = store.clone();

    let config = fast_config();
    let drivers = DriverRegistry::new().register(ProviderKind::Smtp, driver.clone());
    let ctx = WorkerContext::new(
        dyn_store.clone(),
        config.clone(),
        drivers,
        TemplateEngine::new().unwrap(),
    );
    let enqueuer = Enqueuer::new(dyn_store.clone(), config);

    // Backlog of ten LOW jobs, then one HIGH, all before the worker starts
    for i in 0..10 {
        let mut req = request("low@x.io", "welcome");
        req.priority = Some(Priority::Low);
        req.subject = Some(format!("low-{}", i));
        enqueuer.enqueue(req, "svc").await.unwrap();
    }
    let mut high = request("high@x.io", "welcome");
    high.priority = Some(Priority::High);
    high.subject = Some("high-0".to_string());
    enqueuer.enqueue(high, "svc").await.unwrap();

    // One worker, strict priority order per poll
    let worker = Worker::new(ctx, "itest#0");
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move { worker.run(shutdown_rx).await });

    let d = driver.clone();
    wait_until(Duration::from_secs(5), || {
        let d = d.clone();
        async move { d.dispatch_count() >= 11 }
    })
    .await;
    shutdown_tx.send(true).unwrap();
    let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;

    let subjects = driver.dispatched_subjects();
    assert_eq!(subjects[0], "high-0", "HIGH must preempt the LOW backlog");
    assert_eq!(subjects.len(), 11);
}

#[tokio::test]
async fn retry_on_transient_until_success() {
    let driver = ScriptedDriver::new(vec![
        SendOutcome::Transient("smtp 451".to_string()),
        SendOutcome::Transient("smtp 451".to_string()),
    ]);
    let engine = Engine::start(driver.clone(), fast_config()).await;

    let started = Instant::now();
    let result = engine
        .enqueuer
        .enqueue(request("retry@x.io", "welcome"), "svc")
        .await
        .unwrap();

    let d = driver.clone();
    wait_until(Duration::from_secs(10), || {
        let d = d.clone();
        async move { d.dispatch_count() >= 3 }
    })
    .await;
    let elapsed = started.elapsed();

    // Three dispatches, two completed retry passes, delays of ~200ms and
    // ~400ms (each with ±20% jitter) in between
    assert!(
        elapsed >= Duration::from_millis(450),
        "retries came back too fast: {:?}",
        elapsed
    );

    let job_id = result.job_id.to_string();
    wait_until(Duration::from_secs(2), || {
        let store = engine.store.clone();
        let job_id = job_id.clone();
        async move { audit_contains(&store, &job_id, "\"final_status\":\"sent\"").await }
    })
    .await;

    assert!(audit_contains(&engine.store, &job_id, "\"attempt_count\":2").await);
    assert_eq!(driver.dispatch_count(), 3);

    engine.stop().await;
}

#[tokio::test]
async fn transient_failures_exhaust_into_dlq() {
    let driver = ScriptedDriver::new(vec![
        SendOutcome::Transient("boom".to_string()),
        SendOutcome::Transient("boom".to_string()),
        SendOutcome::Transient("boom".to_string()),
        SendOutcome::Transient("boom".to_string()),
    ]);
    let mut config = fast_config();
    config.base_retry_delay = Duration::from_millis(50);
    let engine = Engine::start(driver.clone(), config).await;

    let result = engine
        .enqueuer
        .enqueue(request("doomed@x.io", "welcome"), "svc")
        .await
        .unwrap();

    wait_until(Duration::from_secs(10), || {
        let store = engine.store.clone();
        async move { store.dlq_len().await.unwrap_or(0) == 1 }
    })
    .await;

    // No further attempts once dead-lettered
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(driver.dispatch_count(), 3);

    let entry = engine
        .store
        .dlq_get(&result.job_id.to_string())
        .await
        .unwrap()
        .unwrap();
    assert!(entry.contains("\"final_attempt_count\":3"));

    assert_eq!(
        engine.store.get_counter(keys::STATS_FAILED).await.unwrap(),
        1
    );
    assert_eq!(engine.store.parked_len().await.unwrap(), 0);

    engine.stop().await;
}

#[tokio::test]
async fn crashed_worker_entry_is_reclaimed_without_attempt_increase() {
    let driver = ScriptedDriver::always_ok();
    let store = Arc::new(MemoryQueueStore::new());
    let dyn_store: Arc<dyn QueueStore> = store.clone();

    let mut config = fast_config();
    config.pending_timeout = Duration::from_millis(50);

    let drivers = DriverRegistry::new().register(ProviderKind::Smtp, driver.clone());
    let ctx = WorkerContext::new(
        dyn_store.clone(),
        config.clone(),
        drivers,
        TemplateEngine::new().unwrap(),
    );

    let enqueuer = Enqueuer::new(dyn_store.clone(), config);
    let result = enqueuer
        .enqueue(request("orphan@x.io", "welcome"), "svc")
        .await
        .unwrap();

    // A worker reads the entry and "crashes" before dispatch or ack
    store
        .read_group(CONSUMER_GROUP, "crashed#0", &Priority::ALL, 1, 0)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;

    // A healthy worker's reclaim pass picks it up and dispatches it
    let worker = Worker::new(ctx, "alive#0");
    let reclaimed = worker.reclaim_pass().await.unwrap();
    assert_eq!(reclaimed, 1);
    assert_eq!(driver.dispatch_count(), 1);

    let job_id = result.job_id.to_string();
    assert!(audit_contains(&store, &job_id, "\"final_status\":\"sent\"").await);
    assert!(audit_contains(&store, &job_id, "\"attempt_count\":0").await);
}

#[tokio::test]
async fn rate_limited_jobs_dispatch_up_to_capacity_then_dead_letter() {
    let driver = ScriptedDriver::always_ok();
    let mut config = fast_config();
    config.worker_count = 2;
    config.rate_wait_max = Duration::from_millis(100);
    config.base_retry_delay = Duration::from_millis(50);
    config
        .buckets
        .insert(ProviderKind::Smtp, BucketConfig::new(2.0, 0.0));
    let engine = Engine::start(driver.clone(), config).await;

    for i in 0..5 {
        engine
            .enqueuer
            .enqueue(request(&format!("user{}@x.io", i), "welcome"), "svc")
            .await
            .unwrap();
    }

    // Two tokens, zero refill: exactly two jobs dispatch, the rest cycle
    // through the rate gate until their attempts are spent
    wait_until(Duration::from_secs(15), || {
        let store = engine.store.clone();
        async move { store.dlq_len().await.unwrap_or(0) == 3 }
    })
    .await;

    assert_eq!(driver.dispatch_count(), 2);
    assert_eq!(engine.store.get_counter(keys::STATS_SENT).await.unwrap(), 2);
    assert_eq!(
        engine.store.get_counter(keys::STATS_FAILED).await.unwrap(),
        3
    );

    engine.stop().await;
}

#[tokio::test]
async fn future_dated_job_waits_for_the_scheduler() {
    let driver = ScriptedDriver::always_ok();
    let engine = Engine::start(driver.clone(), fast_config()).await;

    let mut req = request("later@x.io", "welcome");
    let due = chrono::Utc::now() + chrono::Duration::milliseconds(250);
    req.scheduled_for = Some(due);

    engine.enqueuer.enqueue(req, "svc").await.unwrap();
    assert_eq!(engine.store.parked_len().await.unwrap(), 1);

    // Not dispatched before its due time
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(driver.dispatch_count(), 0);

    let d = driver.clone();
    wait_until(Duration::from_secs(3), || {
        let d = d.clone();
        async move { d.dispatch_count() == 1 }
    })
    .await;

    assert!(chrono::Utc::now() >= due);
    assert_eq!(engine.store.parked_len().await.unwrap(), 0);

    engine.stop().await;
}
