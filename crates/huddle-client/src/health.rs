//! Heartbeat-based connection health.
//!
//! The monitor never touches the socket. It asks its owner to send pings via
//! `HealthSignal::SendPing` and is told about pongs through `pong_received`.
//! Every outstanding ping has its own timeout in a `DelayQueue`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthConfig {
    pub interval: Duration,
    pub pong_timeout: Duration,
    /// Consecutive misses before the connection counts as unhealthy.
    pub failure_threshold: u32,
    /// How much slower to check while the app is backgrounded.
    pub background_multiplier: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            failure_threshold: 3,
            background_multiplier: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthSignal {
    /// Send a `ping` command carrying this id.
    SendPing { id: u64 },
    StatusChanged(HealthStatus),
    /// Fired once per unhealthy episode.
    ReconnectNeeded,
    /// The app came back to the foreground; fetch what was missed.
    MissedMessagesRequested { since: DateTime<Utc> },
}

enum Command {
    Pong(u64),
    Background(bool),
    Reset,
    CheckNow,
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    status: HealthStatus,
    outstanding: usize,
    running: bool,
}

pub struct HealthMonitor {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: Arc<Mutex<Snapshot>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Spawn the monitor. The first ping goes out one interval from now.
    pub fn start(config: HealthConfig) -> (Self, mpsc::UnboundedReceiver<HealthSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(Mutex::new(Snapshot {
            status: HealthStatus::Healthy,
            outstanding: 0,
            running: true,
        }));
        let cancel = CancellationToken::new();

        let worker = Worker {
            config,
            signals: signal_tx,
            snapshot: snapshot.clone(),
            timeouts: DelayQueue::new(),
            outstanding: HashMap::new(),
            next_ping_id: 1,
            failures: 0,
            status: HealthStatus::Healthy,
            reconnect_signaled: false,
            backgrounded_at: None,
            next_check: Instant::now() + config.interval,
        };
        let task = tokio::spawn(worker.run(command_rx, cancel.clone()));

        let monitor = Self {
            commands: command_tx,
            snapshot,
            cancel,
            task: Some(task),
        };
        (monitor, signal_rx)
    }

    pub fn pong_received(&self, id: u64) {
        let _ = self.commands.send(Command::Pong(id));
    }

    pub fn set_background(&self, background: bool) {
        let _ = self.commands.send(Command::Background(background));
    }

    /// Clear failures and outstanding pings once a new connection is up.
    pub fn reset_after_reconnect(&self) {
        let _ = self.commands.send(Command::Reset);
    }

    pub fn check_now(&self) {
        let _ = self.commands.send(Command::CheckNow);
    }

    pub fn status(&self) -> HealthStatus {
        self.read().status
    }

    /// Armed timers: the check interval (while running) plus one per
    /// unanswered ping.
    pub fn pending_timers(&self) -> usize {
        let snap = self.read();
        snap.outstanding + usize::from(snap.running)
    }

    /// Cancel the interval and every ping timeout, then wait for the task.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Health monitor task ended abnormally: {}", e);
            }
        }
    }

    fn read(&self) -> Snapshot {
        *self.snapshot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum Step {
    Stop,
    Check,
    TimedOut(u64),
    Command(Command),
}

struct Worker {
    config: HealthConfig,
    signals: mpsc::UnboundedSender<HealthSignal>,
    snapshot: Arc<Mutex<Snapshot>>,
    timeouts: DelayQueue<u64>,
    outstanding: HashMap<u64, delay_queue::Key>,
    next_ping_id: u64,
    failures: u32,
    status: HealthStatus,
    reconnect_signaled: bool,
    backgrounded_at: Option<DateTime<Utc>>,
    next_check: Instant,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, cancel: CancellationToken) {
        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                _ = sleep_until(self.next_check) => Step::Check,
                Some(expired) = self.timeouts.next(), if !self.timeouts.is_empty() => {
                    Step::TimedOut(expired.into_inner())
                }
                cmd = commands.recv() => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => Step::Stop,
                },
            };

            match step {
                Step::Stop => break,
                Step::Check => self.check(),
                Step::TimedOut(id) => self.timed_out(id),
                Step::Command(Command::Pong(id)) => self.pong(id),
                Step::Command(Command::Background(bg)) => self.set_background(bg),
                Step::Command(Command::Reset) => self.reset(),
                Step::Command(Command::CheckNow) => self.check(),
            }
        }

        self.timeouts.clear();
        self.outstanding.clear();
        self.publish();
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .running = false;
        debug!("Health monitor stopped");
    }

    fn current_interval(&self) -> Duration {
        if self.backgrounded_at.is_some() {
            self.config.interval * self.config.background_multiplier.max(1)
        } else {
            self.config.interval
        }
    }

    fn check(&mut self) {
        let id = self.next_ping_id;
        self.next_ping_id += 1;
        let key = self.timeouts.insert(id, self.config.pong_timeout);
        self.outstanding.insert(id, key);
        self.next_check = Instant::now() + self.current_interval();
        self.publish();
        self.emit(HealthSignal::SendPing { id });
    }

    fn pong(&mut self, id: u64) {
        let Some(key) = self.outstanding.remove(&id) else {
            debug!("Ignoring pong {} with no outstanding ping", id);
            return;
        };
        self.timeouts.remove(&key);
        self.failures = 0;
        self.reconnect_signaled = false;
        self.set_status(HealthStatus::Healthy);
    }

    fn timed_out(&mut self, id: u64) {
        if self.outstanding.remove(&id).is_none() {
            return;
        }
        self.failures += 1;
        warn!("Ping {} timed out ({} consecutive)", id, self.failures);

        if self.failures >= self.config.failure_threshold {
            self.set_status(HealthStatus::Unhealthy);
            if !self.reconnect_signaled {
                self.reconnect_signaled = true;
                self.emit(HealthSignal::ReconnectNeeded);
            }
        } else {
            self.set_status(HealthStatus::Degraded);
        }
    }

    fn set_background(&mut self, background: bool) {
        match (background, self.backgrounded_at) {
            (true, None) => {
                self.backgrounded_at = Some(Utc::now());
                self.next_check = Instant::now() + self.current_interval();
                debug!("Backgrounded; checking every {:?}", self.current_interval());
            }
            (false, Some(since)) => {
                self.backgrounded_at = None;
                info!("Foregrounded after {}s", (Utc::now() - since).num_seconds());
                self.check();
                self.emit(HealthSignal::MissedMessagesRequested { since });
            }
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.timeouts.clear();
        self.outstanding.clear();
        self.failures = 0;
        self.reconnect_signaled = false;
        self.next_check = Instant::now() + self.current_interval();
        self.set_status(HealthStatus::Healthy);
    }

    fn set_status(&mut self, status: HealthStatus) {
        let changed = self.status != status;
        self.status = status;
        self.publish();
        if changed {
            self.emit(HealthSignal::StatusChanged(status));
        }
    }

    fn publish(&self) {
        let mut snap = self.snapshot.lock().unwrap_or_else(PoisonError::into_inner);
        snap.status = self.status;
        snap.outstanding = self.timeouts.len();
    }

    fn emit(&self, signal: HealthSignal) {
        let _ = self.signals.send(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next_signal(rx: &mut mpsc::UnboundedReceiver<HealthSignal>) -> HealthSignal {
        rx.recv().await.expect("monitor stopped")
    }

    async fn next_ping(rx: &mut mpsc::UnboundedReceiver<HealthSignal>) -> u64 {
        loop {
            if let HealthSignal::SendPing { id } = next_signal(rx).await {
                return id;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn answered_pings_stay_healthy() {
        let (mut monitor, mut rx) = HealthMonitor::start(HealthConfig::default());

        let started = Instant::now();
        let first = next_ping(&mut rx).await;
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        monitor.pong_received(first);

        let second = next_ping(&mut rx).await;
        assert_ne!(first, second);
        monitor.pong_received(second);
        tokio::task::yield_now().await;
        assert_eq!(monitor.status(), HealthStatus::Healthy);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn misses_degrade_then_signal_reconnect_once() {
        let (mut monitor, mut rx) = HealthMonitor::start(HealthConfig::default());

        let mut statuses = Vec::new();
        let mut reconnects = 0;
        let mut pings = 0;
        while pings < 6 {
            match next_signal(&mut rx).await {
                HealthSignal::SendPing { .. } => pings += 1,
                HealthSignal::StatusChanged(s) => statuses.push(s),
                HealthSignal::ReconnectNeeded => reconnects += 1,
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(statuses, [HealthStatus::Degraded, HealthStatus::Unhealthy]);
        assert_eq!(reconnects, 1);

        // A fresh connection re-arms the signal
        monitor.reset_after_reconnect();
        assert_eq!(
            next_signal(&mut rx).await,
            HealthSignal::StatusChanged(HealthStatus::Healthy)
        );
        let mut reconnects = 0;
        while reconnects == 0 {
            if next_signal(&mut rx).await == HealthSignal::ReconnectNeeded {
                reconnects += 1;
            }
        }

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_pong_recovers_from_degraded() {
        let (mut monitor, mut rx) = HealthMonitor::start(HealthConfig::default());

        next_ping(&mut rx).await;
        assert_eq!(
            next_signal(&mut rx).await,
            HealthSignal::StatusChanged(HealthStatus::Degraded)
        );

        let id = next_ping(&mut rx).await;
        monitor.pong_received(id);
        assert_eq!(
            next_signal(&mut rx).await,
            HealthSignal::StatusChanged(HealthStatus::Healthy)
        );

        // Unknown ids change nothing
        monitor.pong_received(9999);
        tokio::task::yield_now().await;
        assert_eq!(monitor.status(), HealthStatus::Healthy);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_stretches_interval_and_foreground_checks_at_once() {
        let (mut monitor, mut rx) = HealthMonitor::start(HealthConfig::default());
        monitor.set_background(true);

        let started = Instant::now();
        let id = next_ping(&mut rx).await;
        assert_eq!(started.elapsed(), Duration::from_secs(120));
        monitor.pong_received(id);

        let before = Instant::now();
        monitor.set_background(false);
        assert!(matches!(next_signal(&mut rx).await, HealthSignal::SendPing { .. }));
        assert!(matches!(
            next_signal(&mut rx).await,
            HealthSignal::MissedMessagesRequested { .. }
        ));
        assert_eq!(before.elapsed(), Duration::ZERO);

        monitor.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_no_timers_behind() {
        let config = HealthConfig {
            interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(60),
            ..HealthConfig::default()
        };
        let (mut monitor, mut rx) = HealthMonitor::start(config);

        next_ping(&mut rx).await;
        next_ping(&mut rx).await;
        assert_eq!(monitor.pending_timers(), 3);

        // The worker itself reports the drained queue on the way out
        monitor.cancel.cancel();
        monitor.task.take().unwrap().await.unwrap();
        assert_eq!(monitor.pending_timers(), 0);
        assert!(rx.recv().await.is_none());

        monitor.check_now();
        tokio::task::yield_now().await;
        assert_eq!(monitor.pending_timers(), 0);
        monitor.stop().await;
    }
}
