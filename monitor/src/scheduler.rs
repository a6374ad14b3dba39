use crate::config::{ConfigStore, MonitorConfig};
use crate::engine::{analyze, monitored_batch};
use crate::errors::Result;
use crate::metrics::{CYCLE_LATENCY_SECONDS, FETCH_FAILURES_TOTAL, TRACKED_VEHICLES};
use crate::model::VehicleSample;
use crate::rollup::{due_dates, record_day, run_rollup, RollupPolicy};
use crate::sink::{AlertLog, AlertSink, Notifier, LOCAL_ALERT_CAP};
use crate::store::{LocalState, StateStore};
use crate::source::SampleSource;
use crate::tracker::StagnationTracker;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub initial_delay: Duration,
    pub period: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(30),
            period: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Monitoring,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed {
        samples: usize,
        alerts: usize,
        /// Background rollup started by this cycle.
        rollup: Option<JoinHandle<()>>,
    },
    /// The source could not be reached; nothing was changed.
    Skipped,
    CredentialsExpired,
}

/// State touched by a cycle. Only the cycle holding this lock may write it.
struct CycleState {
    tracker: StagnationTracker,
    local: LocalState,
}

/// Everything one fetch-analyze-commit pass needs.
pub struct Monitor {
    config: ConfigStore,
    source: Arc<dyn SampleSource>,
    store: Arc<dyn StateStore>,
    sink: AlertSink,
    cycle: Mutex<CycleState>,
    rollup_policy: RollupPolicy,
}

impl Monitor {
    /// Builds a monitor, restoring the alert history from `store`.
    pub async fn open(
        config: MonitorConfig,
        source: Arc<dyn SampleSource>,
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn Notifier>,
        rollup_policy: RollupPolicy,
    ) -> Result<Self> {
        let local = store.load().await?;
        let log = AlertLog::from_alerts(LOCAL_ALERT_CAP, local.alerts.iter().cloned());
        let tracker = StagnationTracker::new(source.reference_time());

        Ok(Self {
            config: ConfigStore::new(config),
            source,
            store,
            sink: AlertSink::with_log(log, notifier),
            cycle: Mutex::new(CycleState { tracker, local }),
            rollup_policy,
        })
    }

    pub fn config(&self) -> &ConfigStore {
        &self.config
    }

    pub fn sink(&self) -> &AlertSink {
        &self.sink
    }

    /// Copy of the persisted state; waits for a running cycle to finish.
    pub async fn local_state(&self) -> LocalState {
        self.cycle.lock().await.local.clone()
    }

    pub async fn on_tick(self: &Arc<Self>) -> CycleOutcome {
        let now = Utc::now();
        self.run_cycle(now, now.with_timezone(&Local).naive_local())
            .await
    }

    /// One full cycle at wall-clock `now`; `local` is the same instant in
    /// local time and drives the daily rollup.
    pub async fn run_cycle(self: &Arc<Self>, now: DateTime<Utc>, local: NaiveDateTime) -> CycleOutcome {
        let config = self.config.snapshot();
        if config.credentials_expired(now) {
            info!("Session token expired, skipping fetch");
            return CycleOutcome::CredentialsExpired;
        }

        let mut cycle = self.cycle.lock().await;
        let timer = CYCLE_LATENCY_SECONDS.start_timer();

        let samples = match self.source.fetch(&config).await {
            Ok(samples) => samples,
            Err(e) => {
                FETCH_FAILURES_TOTAL.inc();
                warn!(source = self.source.name(), "Fetch failed, skipping cycle: {}", e);
                timer.stop_and_discard();
                return CycleOutcome::Skipped;
            }
        };
        debug!(source = self.source.name(), count = samples.len(), "Received vehicle samples");

        let monitored: Vec<VehicleSample> = monitored_batch(&samples, &config).cloned().collect();
        let alerts = analyze(&monitored, &config, &mut cycle.tracker, now);
        TRACKED_VEHICLES.set(cycle.tracker.tracked() as f64);

        let alert_count = alerts.len();
        self.sink.commit(alerts).await;

        if !monitored.is_empty() {
            cycle.local.record_snapshots(&monitored, &config, now);
        }
        cycle.local.alerts = self.sink.snapshot().all();
        if let Err(e) = self.store.save(&cycle.local).await {
            error!("Failed to persist local state: {}", e);
        }

        let dates = due_dates(self.rollup_policy, local, cycle.local.last_rollup);
        drop(cycle);

        let rollup = if !dates.is_empty() && !monitored.is_empty() && self.source.trips().is_some() {
            let monitor = Arc::clone(self);
            let vehicles = monitored.clone();
            Some(tokio::spawn(async move {
                monitor.roll_up(&config, &vehicles, &dates).await;
            }))
        } else {
            None
        };

        timer.observe_duration();
        info!(
            samples = samples.len(),
            monitored = monitored.len(),
            alerts = alert_count,
            "Monitoring cycle complete"
        );
        CycleOutcome::Completed {
            samples: monitored.len(),
            alerts: alert_count,
            rollup,
        }
    }

    /// Runs the distance rollup for each date and records the results.
    pub async fn roll_up(&self, config: &MonitorConfig, vehicles: &[VehicleSample], dates: &[NaiveDate]) {
        let Some(trips) = self.source.trips() else {
            return;
        };

        let mut days = Vec::with_capacity(dates.len());
        for &date in dates {
            days.push(run_rollup(trips, config, vehicles, date).await);
        }

        let mut cycle = self.cycle.lock().await;
        for day in days {
            if day.vehicles.is_empty() {
                continue;
            }
            let date = day.date;
            if day.succeeded() && cycle.local.last_rollup.map_or(true, |last| last < date) {
                cycle.local.last_rollup = Some(date);
            }
            record_day(&mut cycle.local.distance_history, day);
            info!(date = %date, "Stored daily distance data");
        }
        if let Err(e) = self.store.save(&cycle.local).await {
            error!("Failed to persist distance history: {}", e);
        }
    }
}

struct Timer {
    generation: u64,
    stop: watch::Sender<bool>,
    _handle: JoinHandle<()>,
}

/// Drives [`Monitor`] cycles on a periodic timer.
pub struct MonitorScheduler {
    monitor: Arc<Monitor>,
    options: SchedulerOptions,
    timer: Arc<StdMutex<Option<Timer>>>,
    generation: AtomicU64,
}

impl MonitorScheduler {
    pub fn new(monitor: Arc<Monitor>, options: SchedulerOptions) -> Self {
        Self {
            monitor,
            options,
            timer: Arc::new(StdMutex::new(None)),
            generation: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> SchedulerState {
        match lock(&self.timer).as_ref() {
            Some(_) => SchedulerState::Monitoring,
            None => SchedulerState::Idle,
        }
    }

    /// Installs `config` and (re)arms the timer. Tracked vehicle state is kept.
    pub fn start(&self, config: MonitorConfig) {
        self.monitor.config().replace(config);
        self.stop();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let monitor = Arc::clone(&self.monitor);
        let slot = Arc::clone(&self.timer);
        let options = self.options;

        // Held until the timer is installed so an early expiry cannot miss it.
        let mut current = lock(&self.timer);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + options.initial_delay, options.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                // Cycles run outside the select so a stop never cuts one short.
                if let CycleOutcome::CredentialsExpired = monitor.on_tick().await {
                    let mut timer = lock(&slot);
                    if timer.as_ref().is_some_and(|t| t.generation == generation) {
                        *timer = None;
                    }
                    info!("Token expired, monitoring stopped");
                    break;
                }
            }
            debug!(generation, "Monitor timer exited");
        });

        *current = Some(Timer {
            generation,
            stop: stop_tx,
            _handle: handle,
        });
        drop(current);
        info!(
            initial_delay = ?self.options.initial_delay,
            period = ?self.options.period,
            "Monitoring started"
        );
    }

    /// Cancels the timer. A cycle already running still completes.
    pub fn stop(&self) {
        if let Some(timer) = lock(&self.timer).take() {
            let _ = timer.stop.send(true);
            info!("Monitoring stopped");
        }
    }

    /// Swaps the configuration used from the next cycle on.
    pub fn update_config(&self, config: MonitorConfig) {
        self.monitor.config().replace(config);
    }
}

impl Drop for MonitorScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::errors::Error;
    use crate::model::AlertKind;
    use crate::sink::LogNotifier;
    use crate::source::{Trip, TripSource};
    use crate::store::MemoryStore;
    use crate::tracker::ReferenceTime;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    struct FakeSource {
        samples: StdMutex<Vec<VehicleSample>>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeSource {
        fn new(samples: Vec<VehicleSample>) -> Self {
            Self {
                samples: StdMutex::new(samples),
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new(Vec::new())
            }
        }

        fn set(&self, samples: Vec<VehicleSample>) {
            *self.samples.lock().unwrap() = samples;
        }
    }

    #[async_trait]
    impl SampleSource for FakeSource {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn reference_time(&self) -> ReferenceTime {
            ReferenceTime::FirstObserved
        }

        async fn fetch(&self, _config: &MonitorConfig) -> Result<Vec<VehicleSample>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::Validation("connection refused".to_string()));
            }
            Ok(self.samples.lock().unwrap().clone())
        }

        fn trips(&self) -> Option<&dyn TripSource> {
            Some(self)
        }
    }

    #[async_trait]
    impl TripSource for FakeSource {
        async fn fetch_trips(
            &self,
            _config: &MonitorConfig,
            vehicle_id: &str,
            _start: DateTime<Utc>,
            _end: DateTime<Utc>,
        ) -> Result<Vec<Trip>> {
            if vehicle_id == "BROKEN" {
                return Err(Error::Validation("trip lookup failed".to_string()));
            }
            Ok(vec![Trip {
                distance: Some(12_500.0),
            }])
        }
    }

    /// Holds every fetch until the test releases it.
    struct GatedSource {
        samples: Vec<VehicleSample>,
        entered: Notify,
        release: Notify,
        calls: AtomicUsize,
    }

    impl GatedSource {
        fn new(samples: Vec<VehicleSample>) -> Self {
            Self {
                samples,
                entered: Notify::new(),
                release: Notify::new(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SampleSource for GatedSource {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn reference_time(&self) -> ReferenceTime {
            ReferenceTime::FirstObserved
        }

        async fn fetch(&self, _config: &MonitorConfig) -> Result<Vec<VehicleSample>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            self.release.notified().await;
            Ok(self.samples.clone())
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            webhook_url: "https://fleet.example.com/loconav-webhook".to_string(),
            monitored_vehicles: vec!["V1".to_string(), "V2".to_string(), "BROKEN".to_string()],
            ..MonitorConfig::all_vehicles(80.0, 30)
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
    }

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    async fn monitor(source: Arc<dyn SampleSource>) -> (Arc<Monitor>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let monitor = Monitor::open(
            config(),
            source,
            store.clone(),
            Arc::new(LogNotifier),
            RollupPolicy::LastMinute,
        )
        .await
        .unwrap();
        (Arc::new(monitor), store)
    }

    #[tokio::test]
    async fn test_cycle_commits_and_persists() {
        let source = Arc::new(FakeSource::new(vec![
            VehicleSample::new("V1", 95.0, t0().timestamp()),
            VehicleSample::new("UNKNOWN", 150.0, t0().timestamp()),
            VehicleSample::new("V2", 40.0, t0().timestamp()),
        ]));
        let (monitor, store) = monitor(source).await;

        let outcome = monitor.run_cycle(t0(), noon()).await;
        match outcome {
            CycleOutcome::Completed {
                samples,
                alerts,
                rollup,
            } => {
                assert_eq!(samples, 2);
                assert_eq!(alerts, 1);
                assert!(rollup.is_none());
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let persisted = store.load().await.unwrap();
        assert_eq!(persisted.alerts.len(), 1);
        assert_eq!(persisted.alerts[0].kind, AlertKind::Speeding);
        assert_eq!(persisted.vehicles.len(), 2);
        assert_eq!(persisted.vehicles["V1"].status, "Speeding!");
    }

    #[tokio::test]
    async fn test_stagnation_across_cycles() {
        let source = Arc::new(FakeSource::new(vec![VehicleSample::new("V1", 0.0, 0)]));
        let (monitor, _store) = monitor(source.clone()).await;

        let mut stagnation = 0;
        for minute in 0..=40 {
            let now = t0() + ChronoDuration::minutes(minute);
            if let CycleOutcome::Completed { alerts, .. } = monitor.run_cycle(now, noon()).await {
                stagnation += alerts;
            }
        }
        assert_eq!(stagnation, 1);

        source.set(vec![VehicleSample::new("V1", 30.0, 0)]);
        monitor.run_cycle(t0() + ChronoDuration::minutes(41), noon()).await;
        source.set(vec![VehicleSample::new("V1", 0.0, 0)]);
        for minute in 42..=80 {
            let now = t0() + ChronoDuration::minutes(minute);
            if let CycleOutcome::Completed { alerts, .. } = monitor.run_cycle(now, noon()).await {
                stagnation += alerts;
            }
        }
        assert_eq!(stagnation, 2);
    }

    #[tokio::test]
    async fn test_transport_error_skips_cycle() {
        let source = Arc::new(FakeSource::failing());
        let (monitor, store) = monitor(source.clone()).await;

        let outcome = monitor.run_cycle(t0(), noon()).await;
        assert!(matches!(outcome, CycleOutcome::Skipped));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert!(monitor.sink().is_empty());
        assert!(store.load().await.unwrap().last_update.is_none());
    }

    #[tokio::test]
    async fn test_expired_credentials_skip_fetch() {
        let source = Arc::new(FakeSource::new(vec![VehicleSample::new("V1", 95.0, 0)]));
        let (monitor, _store) = monitor(source.clone()).await;
        monitor.config().replace(MonitorConfig {
            credentials: Some(Credentials {
                base_url: "https://api.example.com".to_string(),
                session_token: "token".to_string(),
                expires_at: Some(t0() - ChronoDuration::minutes(1)),
            }),
            ..config()
        });

        let outcome = monitor.run_cycle(t0(), noon()).await;
        assert!(matches!(outcome, CycleOutcome::CredentialsExpired));
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rollup_in_last_minute() {
        let source = Arc::new(FakeSource::new(vec![
            VehicleSample::new("V1", 20.0, 0),
            VehicleSample::new("BROKEN", 20.0, 0),
        ]));
        let (monitor, store) = monitor(source).await;
        let last_minute = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(23, 59, 10)
            .unwrap();

        let outcome = monitor.run_cycle(t0(), last_minute).await;
        let CycleOutcome::Completed {
            rollup: Some(rollup),
            ..
        } = outcome
        else {
            panic!("expected a rollup to start");
        };
        rollup.await.unwrap();

        let state = store.load().await.unwrap();
        assert_eq!(state.distance_history.len(), 1);
        let day = &state.distance_history[0];
        assert_eq!(day.vehicles.len(), 2);
        assert_eq!(day.total_distance, 12_500.0);
        assert!(day.vehicles[1].error.is_some());
        assert_eq!(state.last_rollup, NaiveDate::from_ymd_opt(2024, 5, 1));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let source = Arc::new(FakeSource::new(Vec::new()));
        let (monitor, _store) = monitor(source).await;
        let scheduler = MonitorScheduler::new(monitor, SchedulerOptions::default());

        scheduler.stop();
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Idle);

        scheduler.start(config());
        assert_eq!(scheduler.state(), SchedulerState::Monitoring);
        scheduler.start(config());
        assert_eq!(scheduler.state(), SchedulerState::Monitoring);

        scheduler.stop();
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_start_keeps_tracked_state() {
        let source = Arc::new(FakeSource::new(vec![VehicleSample::new("V1", 0.0, 0)]));
        let (monitor, _store) = monitor(source).await;
        monitor.run_cycle(t0(), noon()).await;

        let scheduler = MonitorScheduler::new(monitor.clone(), SchedulerOptions::default());
        let mut updated = config();
        updated.speed_limit = 60.0;
        scheduler.start(updated);

        assert_eq!(monitor.config().snapshot().speed_limit, 60.0);
        assert!(monitor.cycle.lock().await.tracker.state("V1").unwrap().is_stagnant);
        scheduler.stop();
    }

    #[tokio::test]
    async fn test_expiry_returns_scheduler_to_idle() {
        let source = Arc::new(FakeSource::new(Vec::new()));
        let (monitor, _store) = monitor(source.clone()).await;
        let scheduler = MonitorScheduler::new(
            monitor,
            SchedulerOptions {
                initial_delay: Duration::from_millis(5),
                period: Duration::from_millis(20),
            },
        );

        scheduler.start(MonitorConfig {
            credentials: Some(Credentials {
                base_url: "https://api.example.com".to_string(),
                session_token: "token".to_string(),
                expires_at: Some(Utc::now() - ChronoDuration::seconds(1)),
            }),
            ..config()
        });

        for _ in 0..100 {
            if scheduler.state() == SchedulerState::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_config_swap_applies_from_next_cycle() {
        let source = Arc::new(GatedSource::new(vec![VehicleSample::new("V1", 95.0, 0)]));
        let (monitor, _store) = monitor(source.clone()).await;
        let scheduler = MonitorScheduler::new(monitor.clone(), SchedulerOptions::default());

        let running = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.run_cycle(t0(), noon()).await })
        };
        source.entered.notified().await;
        scheduler.update_config(MonitorConfig {
            speed_limit: 120.0,
            ..config()
        });
        source.release.notify_one();

        let CycleOutcome::Completed { alerts, .. } = running.await.unwrap() else {
            panic!("cycle should complete");
        };
        assert_eq!(alerts, 1, "in-flight cycle keeps the limit it started with");

        source.release.notify_one();
        let CycleOutcome::Completed { alerts, .. } =
            monitor.run_cycle(t0() + ChronoDuration::minutes(1), noon()).await
        else {
            panic!("cycle should complete");
        };
        assert_eq!(alerts, 0);
        assert_eq!(monitor.config().snapshot().speed_limit, 120.0);
    }

    #[tokio::test]
    async fn test_stop_lets_running_cycle_commit() {
        let fresh = Utc::now().timestamp();
        let source = Arc::new(GatedSource::new(vec![VehicleSample::new("V1", 95.0, fresh)]));
        let (monitor, store) = monitor(source.clone()).await;
        let scheduler = MonitorScheduler::new(
            monitor.clone(),
            SchedulerOptions {
                initial_delay: Duration::ZERO,
                period: Duration::from_secs(60),
            },
        );

        scheduler.start(config());
        source.entered.notified().await;
        scheduler.stop();
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        source.release.notify_one();

        // Blocks until the in-flight cycle releases its lock.
        let state = monitor.local_state().await;
        assert_eq!(state.alerts.len(), 1);
        assert_eq!(state.vehicles["V1"].status, "Speeding!");
        assert_eq!(store.load().await.unwrap().alerts.len(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
