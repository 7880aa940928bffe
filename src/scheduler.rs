// ⏰ Scheduler - unattended, recurring pipeline runs
//
// One scheduling loop task per armed schedule. `start` cancels the previous
// loop before spawning the next, so at most one tick is ever pending. Runs
// happen on the blocking pool; the next tick is measured from completion.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::time::Instant;

// ============================================================================
// INTERVALS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleInterval {
    #[serde(rename = "1h")]
    Hourly,
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "24h")]
    Daily,
}

impl ScheduleInterval {
    pub const ALL: [ScheduleInterval; 5] = [
        ScheduleInterval::Hourly,
        ScheduleInterval::ThreeHours,
        ScheduleInterval::SixHours,
        ScheduleInterval::TwelveHours,
        ScheduleInterval::Daily,
    ];

    pub fn hours(&self) -> u64 {
        match self {
            ScheduleInterval::Hourly => 1,
            ScheduleInterval::ThreeHours => 3,
            ScheduleInterval::SixHours => 6,
            ScheduleInterval::TwelveHours => 12,
            ScheduleInterval::Daily => 24,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.hours() * 3600)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScheduleInterval::Hourly => "1h",
            ScheduleInterval::ThreeHours => "3h",
            ScheduleInterval::SixHours => "6h",
            ScheduleInterval::TwelveHours => "12h",
            ScheduleInterval::Daily => "24h",
        }
    }

    fn chrono(&self) -> chrono::Duration {
        chrono::Duration::hours(self.hours() as i64)
    }
}

impl fmt::Display for ScheduleInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ScheduleInterval {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        ScheduleInterval::ALL
            .into_iter()
            .find(|i| i.label() == wanted)
            .ok_or_else(|| ScheduleError::InvalidInterval(wanted.to_string()))
    }
}

// ============================================================================
// ERRORS / JOB / CLOCK
// ============================================================================

/// Why `start` refused to arm a schedule
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("no cached login secrets for '{0}'; run it interactively first")]
    MissingBankSecrets(String),

    #[error("no cached ledger server password; run a sync interactively first")]
    MissingLedgerSecret,

    #[error("no saved ledger mapping for source '{0}'")]
    MissingMapping(String),

    #[error("unknown bank '{0}'")]
    UnknownBank(String),

    #[error("invalid interval '{0}' (expected 1h, 3h, 6h, 12h or 24h)")]
    InvalidInterval(String),
}

/// Work the scheduler replays
pub trait ScheduledJob: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Everything an unattended run needs is already in memory
    fn check_ready(&self) -> Result<(), ScheduleError>;

    /// One blocking run; the message becomes `last_result`
    fn run(&self) -> anyhow::Result<String>;
}

/// Source of wall-clock timestamps for status fields
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// STATUS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub interval: Option<ScheduleInterval>,
    pub last_run: Option<DateTime<Utc>>,
    /// Null while a run is in flight
    pub next_run: Option<DateTime<Utc>>,
    pub last_result: Option<String>,
    pub running: bool,
}

#[derive(Default)]
struct State {
    status: SchedulerStatus,
    /// Bumped by every start/stop; a loop only touches the schedule while
    /// its generation is current
    generation: u64,
    cancel: Option<watch::Sender<bool>>,
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct Scheduler {
    job: Arc<dyn ScheduledJob>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    state: Arc<Mutex<State>>,
    /// Held across every run so a re-armed loop waits for the one in flight
    run_lock: Arc<AsyncMutex<()>>,
}

impl Scheduler {
    pub fn new(job: Arc<dyn ScheduledJob>, runtime: Handle) -> Self {
        Self::with_clock(job, runtime, Arc::new(SystemClock))
    }

    pub fn with_clock(job: Arc<dyn ScheduledJob>, runtime: Handle, clock: Arc<dyn Clock>) -> Self {
        Scheduler {
            job,
            clock,
            runtime,
            state: Arc::new(Mutex::new(State::default())),
            run_lock: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Arm (or re-arm) the schedule. Fails without touching the current
    /// schedule when a prerequisite is missing.
    pub fn start(&self, interval: ScheduleInterval, run_now: bool) -> Result<(), ScheduleError> {
        self.job.check_ready()?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let generation = {
            let mut state = self.state.lock();
            if let Some(previous) = state.cancel.take() {
                let _ = previous.send(true);
            }
            state.generation += 1;
            state.cancel = Some(cancel_tx);

            let now = self.clock.now();
            state.status.enabled = true;
            state.status.interval = Some(interval);
            state.status.next_run = Some(if run_now { now } else { now + interval.chrono() });
            state.generation
        };

        tracing::info!(
            job = %self.job.name(),
            interval = %interval,
            run_now,
            "schedule armed"
        );

        let tick = Tick {
            job: Arc::clone(&self.job),
            clock: Arc::clone(&self.clock),
            state: Arc::clone(&self.state),
            run_lock: Arc::clone(&self.run_lock),
            generation,
            interval,
        };
        self.runtime.spawn(tick.run_loop(run_now, cancel_rx));
        Ok(())
    }

    /// Disarm; an in-flight run finishes but no new tick is armed
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(cancel) = state.cancel.take() {
            let _ = cancel.send(true);
        }
        state.generation += 1;
        state.status.enabled = false;
        state.status.next_run = None;
        tracing::info!(job = %self.job.name(), "schedule stopped");
    }

    pub fn status(&self) -> SchedulerStatus {
        self.state.lock().status.clone()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Some(cancel) = self.state.lock().cancel.take() {
            let _ = cancel.send(true);
        }
    }
}

/// State owned by one scheduling loop
struct Tick {
    job: Arc<dyn ScheduledJob>,
    clock: Arc<dyn Clock>,
    state: Arc<Mutex<State>>,
    run_lock: Arc<AsyncMutex<()>>,
    generation: u64,
    interval: ScheduleInterval,
}

impl Tick {
    fn is_current(&self) -> bool {
        self.state.lock().generation == self.generation
    }

    async fn run_loop(self, run_now: bool, mut cancel: watch::Receiver<bool>) {
        let period = self.interval.duration();
        let mut deadline = if run_now {
            Instant::now()
        } else {
            Instant::now() + period
        };

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = cancel.changed() => return,
            }
            if *cancel.borrow() || !self.is_current() {
                return;
            }

            let _running = self.run_lock.lock().await;
            // superseded while a previous loop's run was still going
            if *cancel.borrow() || !self.is_current() {
                return;
            }

            let result = self.run_once().await;

            let rearm = {
                let mut state = self.state.lock();
                let now = self.clock.now();
                state.status.running = false;
                state.status.last_result = Some(result);
                if state.generation == self.generation {
                    state.status.next_run = Some(now + self.interval.chrono());
                    true
                } else {
                    false
                }
            };
            if !rearm {
                return;
            }
            deadline = Instant::now() + period;
        }
    }

    async fn run_once(&self) -> String {
        {
            let mut state = self.state.lock();
            state.status.running = true;
            state.status.next_run = None;
            state.status.last_run = Some(self.clock.now());
        }

        if let Err(reason) = self.job.check_ready() {
            tracing::warn!(job = %self.job.name(), "scheduled run skipped: {}", reason);
            return format!("Skipped: {}", reason);
        }

        tracing::info!(job = %self.job.name(), "scheduled run starting");
        let job = Arc::clone(&self.job);
        match tokio::task::spawn_blocking(move || job.run()).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                tracing::warn!(job = %self.job.name(), "scheduled run failed: {:#}", e);
                format!("Error: {:#}", e)
            }
            Err(join) => {
                tracing::warn!(job = %self.job.name(), "scheduled run panicked: {}", join);
                format!("Error: run aborted: {}", join)
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Timestamps that follow tokio's (paused) clock
    struct VirtualClock {
        base: DateTime<Utc>,
        start: Instant,
    }

    impl VirtualClock {
        fn new() -> Arc<Self> {
            Arc::new(VirtualClock {
                base: DateTime::parse_from_rfc3339("2025-03-05T08:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
                start: Instant::now(),
            })
        }
    }

    impl Clock for VirtualClock {
        fn now(&self) -> DateTime<Utc> {
            self.base + chrono::Duration::from_std(self.start.elapsed()).unwrap()
        }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct CountingJob {
        runs: AtomicUsize,
        behaviour: Mutex<Behaviour>,
        ready: Mutex<Result<(), ScheduleError>>,
    }

    impl CountingJob {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(CountingJob {
                runs: AtomicUsize::new(0),
                behaviour: Mutex::new(behaviour),
                ready: Mutex::new(Ok(())),
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    impl ScheduledJob for CountingJob {
        fn name(&self) -> String {
            "counting".to_string()
        }

        fn check_ready(&self) -> Result<(), ScheduleError> {
            self.ready.lock().clone()
        }

        fn run(&self) -> anyhow::Result<String> {
            let n = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            match *self.behaviour.lock() {
                Behaviour::Succeed => Ok(format!("run {} ok", n)),
                Behaviour::Fail => Err(anyhow::anyhow!("portal navigation failed")),
                Behaviour::Panic => panic!("driver crashed"),
            }
        }
    }

    fn scheduler(job: &Arc<CountingJob>) -> Scheduler {
        let job: Arc<dyn ScheduledJob> = Arc::clone(job) as Arc<dyn ScheduledJob>;
        Scheduler::with_clock(job, Handle::current(), VirtualClock::new())
    }

    /// Let virtual time pass in small steps until `check` holds
    async fn wait_until(check: impl Fn() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition never became true");
    }

    async fn advance(d: Duration) {
        tokio::time::sleep(d).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_leaves_a_single_timer() {
        let job = CountingJob::new(Behaviour::Succeed);
        let scheduler = scheduler(&job);

        scheduler.start(ScheduleInterval::Hourly, false).unwrap();
        scheduler.start(ScheduleInterval::ThreeHours, false).unwrap();

        advance(Duration::from_secs(3600 + 60)).await;
        assert_eq!(job.runs(), 0, "the 1h timer must have been cancelled");

        advance(Duration::from_secs(2 * 3600)).await;
        wait_until(|| scheduler.status().last_result.is_some()).await;
        assert_eq!(job.runs(), 1);

        advance(Duration::from_secs(3600)).await;
        assert_eq!(job.runs(), 1);

        let status = scheduler.status();
        assert!(status.enabled);
        assert_eq!(status.interval, Some(ScheduleInterval::ThreeHours));
        assert_eq!(status.last_result.as_deref(), Some("run 1 ok"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_tick_measured_from_completion() {
        let job = CountingJob::new(Behaviour::Succeed);
        let scheduler = scheduler(&job);

        scheduler.start(ScheduleInterval::Hourly, true).unwrap();
        wait_until(|| scheduler.status().last_result.is_some()).await;
        assert_eq!(job.runs(), 1);

        let status = scheduler.status();
        let last_run = status.last_run.unwrap();
        let next_run = status.next_run.unwrap();
        assert!(!status.running);
        assert!(next_run - last_run >= chrono::Duration::hours(1));

        advance(Duration::from_secs(3600 + 60)).await;
        wait_until(|| job.runs() == 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_prevents_future_ticks() {
        let job = CountingJob::new(Behaviour::Succeed);
        let scheduler = scheduler(&job);

        scheduler.start(ScheduleInterval::Hourly, false).unwrap();
        assert!(scheduler.status().next_run.is_some());
        scheduler.stop();

        advance(Duration::from_secs(5 * 3600)).await;
        assert_eq!(job.runs(), 0);

        let status = scheduler.status();
        assert!(!status.enabled);
        assert_eq!(status.next_run, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_precondition_arms_nothing() {
        let job = CountingJob::new(Behaviour::Succeed);
        *job.ready.lock() = Err(ScheduleError::MissingMapping("ibercaja".to_string()));
        let scheduler = scheduler(&job);

        let err = scheduler
            .start(ScheduleInterval::Hourly, true)
            .unwrap_err();
        assert_eq!(err, ScheduleError::MissingMapping("ibercaja".to_string()));

        advance(Duration::from_secs(2 * 3600)).await;
        assert_eq!(job.runs(), 0);
        assert_eq!(scheduler.status(), SchedulerStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_errors_are_stored_and_ticks_continue() {
        let job = CountingJob::new(Behaviour::Fail);
        let scheduler = scheduler(&job);

        scheduler.start(ScheduleInterval::Hourly, true).unwrap();
        wait_until(|| scheduler.status().last_result.is_some()).await;
        assert_eq!(
            scheduler.status().last_result.as_deref(),
            Some("Error: portal navigation failed")
        );

        *job.behaviour.lock() = Behaviour::Succeed;
        advance(Duration::from_secs(3600 + 60)).await;
        wait_until(|| job.runs() == 2).await;
        wait_until(|| scheduler.status().last_result.as_deref() == Some("run 2 ok")).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_run_is_recorded() {
        let job = CountingJob::new(Behaviour::Panic);
        let scheduler = scheduler(&job);

        scheduler.start(ScheduleInterval::Daily, true).unwrap();
        wait_until(|| scheduler.status().last_result.is_some()).await;

        let status = scheduler.status();
        assert!(status.last_result.unwrap().starts_with("Error: run aborted"));
        assert!(status.enabled);
        assert!(status.next_run.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skips_when_no_longer_ready() {
        let job = CountingJob::new(Behaviour::Succeed);
        let scheduler = scheduler(&job);

        scheduler.start(ScheduleInterval::Hourly, false).unwrap();
        *job.ready.lock() = Err(ScheduleError::MissingLedgerSecret);

        advance(Duration::from_secs(3600 + 60)).await;
        wait_until(|| scheduler.status().last_result.is_some()).await;

        assert_eq!(job.runs(), 0);
        assert!(scheduler
            .status()
            .last_result
            .unwrap()
            .starts_with("Skipped: no cached ledger server password"));
    }

    /// Blocks the worker for a while and records how many runs overlap
    #[derive(Default)]
    struct SlowJob {
        started: AtomicUsize,
        finished: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScheduledJob for SlowJob {
        fn name(&self) -> String {
            "slow".to_string()
        }

        fn check_ready(&self) -> Result<(), ScheduleError> {
            Ok(())
        }

        fn run(&self) -> anyhow::Result<String> {
            let n = self.started.fetch_add(1, Ordering::SeqCst) + 1;
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(active, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(300));
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(format!("slow run {}", n))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_during_run_waits_for_it() {
        let job = Arc::new(SlowJob::default());
        let scheduler = Scheduler::with_clock(
            Arc::clone(&job) as Arc<dyn ScheduledJob>,
            Handle::current(),
            VirtualClock::new(),
        );

        scheduler.start(ScheduleInterval::Hourly, true).unwrap();
        wait_until(|| job.active.load(Ordering::SeqCst) == 1).await;

        scheduler.start(ScheduleInterval::ThreeHours, true).unwrap();
        wait_until(|| job.finished.load(Ordering::SeqCst) == 2).await;
        wait_until(|| !scheduler.status().running).await;

        assert_eq!(job.peak.load(Ordering::SeqCst), 1, "runs overlapped");
        let status = scheduler.status();
        assert_eq!(status.interval, Some(ScheduleInterval::ThreeHours));
        assert_eq!(status.last_result.as_deref(), Some("slow run 2"));
        assert!(status.next_run.is_some());
    }

    #[test]
    fn test_interval_parsing() {
        assert_eq!("3h".parse::<ScheduleInterval>(), Ok(ScheduleInterval::ThreeHours));
        assert_eq!(ScheduleInterval::Daily.duration(), Duration::from_secs(86_400));
        assert!(matches!(
            "2h".parse::<ScheduleInterval>(),
            Err(ScheduleError::InvalidInterval(_))
        ));
        assert_eq!(
            serde_json::to_string(&ScheduleInterval::TwelveHours).unwrap(),
            "\"12h\""
        );
    }
}
