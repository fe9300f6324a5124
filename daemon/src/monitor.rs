//! Refresh orchestration: the published process list and the tracking registry
//!
//! Everything that more than one loop touches (published records, the session
//! registry, selection, cached details and the refresh timer) lives in one
//! [`Shared`] behind a single async mutex. The refresh loop and each sampling
//! loop only ever wait on their own timers; they meet solely through that lock.

use crate::collector::{self, ProcessCollector, ProcessDetails, ProcessRecord};
use crate::config::Config;
use crate::error::ProcessError;
use crate::executor::ProcessExecutor;
use crate::priority::PriorityClass;
use crate::session::{
    run_sampling_loop, FinishReason, MemorySample, SessionSummary, TrackingSession,
    DEFAULT_SAMPLING_INTERVAL, MIN_SAMPLING_INTERVAL,
};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(5);
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MonitorEvent {
    Refreshed { process_count: usize, tracked_count: usize },
    TrackingStarted { pid: u32, name: String },
    TrackingFinished { pid: u32, reason: FinishReason },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSettings {
    pub refresh_interval: Duration,
    pub sampling_interval: Duration,
    pub include_system: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            include_system: true,
        }
    }
}

impl MonitorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            refresh_interval: config.refresh_interval(),
            sampling_interval: config.sampling_interval(),
            include_system: config.refresh.include_system_processes,
        }
    }
}

struct SessionEntry {
    session: Arc<TrackingSession>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SessionEntry {
    fn is_live(&self) -> bool {
        !self.session.is_finished()
    }
}

struct RefreshTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Shared {
    processes: Vec<ProcessRecord>,
    sessions: HashMap<u32, SessionEntry>,
    /// Earlier sessions of a pid that was tracked again.
    archived: Vec<Arc<TrackingSession>>,
    selected: Option<u32>,
    details: HashMap<u32, ProcessDetails>,
    timer: Option<RefreshTimer>,
    settings: MonitorSettings,
}

impl Shared {
    fn live_session(&self, pid: u32) -> Option<&Arc<TrackingSession>> {
        self.sessions
            .get(&pid)
            .filter(|entry| entry.is_live())
            .map(|entry| &entry.session)
    }

    fn tracking_start(&self, pid: u32) -> Option<DateTime<Local>> {
        self.live_session(pid).map(|s| s.start_time())
    }

    fn stamp(&self, record: &mut ProcessRecord) {
        match self.tracking_start(record.pid) {
            Some(started) => record.mark_tracked(started),
            None => record.clear_tracking(),
        }
    }
}

pub struct ProcessMonitor {
    collector: Arc<dyn ProcessCollector>,
    executor: Arc<dyn ProcessExecutor>,
    shared: Mutex<Shared>,
    refresh_gate: Arc<Semaphore>,
    events: broadcast::Sender<MonitorEvent>,
}

impl ProcessMonitor {
    pub fn new(
        collector: Arc<dyn ProcessCollector>,
        executor: Arc<dyn ProcessExecutor>,
        settings: MonitorSettings,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let settings = MonitorSettings {
            refresh_interval: settings.refresh_interval.max(MIN_REFRESH_INTERVAL),
            sampling_interval: settings.sampling_interval.max(MIN_SAMPLING_INTERVAL),
            include_system: settings.include_system,
        };
        Self {
            collector,
            executor,
            shared: Mutex::new(Shared {
                settings,
                ..Shared::default()
            }),
            refresh_gate: Arc::new(Semaphore::new(1)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MonitorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Takes a fresh snapshot, reconciles it with tracking state and publishes it.
    ///
    /// Returns `None` without enumerating when another refresh is in flight.
    pub async fn refresh(&self) -> Result<Option<Vec<ProcessRecord>>, ProcessError> {
        let Ok(permit) = Arc::clone(&self.refresh_gate).try_acquire_owned() else {
            debug!("refresh already in flight, skipping");
            return Ok(None);
        };

        let include_system = self.shared.lock().await.settings.include_system;
        let source = Arc::clone(&self.collector);
        // The permit lives as long as the scan itself, even if this future is dropped.
        let (records, _permit) = tokio::task::spawn_blocking(move || {
            let records = source.snapshot(include_system);
            (records, permit)
        })
        .await?;
        let mut records = records?;
        collector::sort_and_dedup(&mut records);

        // Tracking state is read at publish time, under the same lock that
        // start/stop use, so a session started mid-enumeration is not lost.
        let mut guard = self.shared.lock().await;
        let shared = &mut *guard;
        for record in &mut records {
            shared.stamp(record);
        }
        let present: HashSet<u32> = records.iter().map(|r| r.pid).collect();
        shared.details.retain(|pid, _| present.contains(pid));
        if shared.selected.is_some_and(|pid| !present.contains(&pid)) {
            shared.selected = None;
        }
        shared.processes = records;

        let process_count = shared.processes.len();
        let tracked_count = shared.processes.iter().filter(|r| r.tracked).count();
        let published = shared.processes.clone();
        drop(guard);

        debug!(process_count, tracked_count, "published process snapshot");
        self.emit(MonitorEvent::Refreshed {
            process_count,
            tracked_count,
        });
        Ok(Some(published))
    }

    /// The last published list.
    pub async fn processes(&self) -> Vec<ProcessRecord> {
        self.shared.lock().await.processes.clone()
    }

    pub async fn process(&self, pid: u32) -> Option<ProcessRecord> {
        self.shared
            .lock()
            .await
            .processes
            .iter()
            .find(|r| r.pid == pid)
            .cloned()
    }

    pub async fn select(&self, pid: u32) -> Option<ProcessRecord> {
        let mut shared = self.shared.lock().await;
        let record = shared.processes.iter().find(|r| r.pid == pid).cloned();
        shared.selected = record.as_ref().map(|r| r.pid);
        record
    }

    pub async fn selected(&self) -> Option<ProcessRecord> {
        let shared = self.shared.lock().await;
        let pid = shared.selected?;
        shared.processes.iter().find(|r| r.pid == pid).cloned()
    }

    pub async fn clear_selection(&self) {
        self.shared.lock().await.selected = None;
    }

    /// Thread and module detail, fetched on first request and cached until the
    /// pid drops out of a refresh.
    pub async fn details(&self, pid: u32) -> Result<ProcessDetails, ProcessError> {
        {
            let shared = self.shared.lock().await;
            if let Some(cached) = shared.details.get(&pid) {
                let mut details = cached.clone();
                shared.stamp(&mut details.record);
                return Ok(details);
            }
        }

        let collector = Arc::clone(&self.collector);
        let mut details = tokio::task::spawn_blocking(move || collector.details(pid)).await??;

        let mut shared = self.shared.lock().await;
        shared.stamp(&mut details.record);
        if shared.processes.iter().any(|r| r.pid == pid) {
            shared.details.insert(pid, details.clone());
        }
        Ok(details)
    }

    pub async fn is_tracking(&self, pid: u32) -> bool {
        self.shared.lock().await.live_session(pid).is_some()
    }

    /// Starts a sampling session for `pid`.
    ///
    /// Fails with [`ProcessError::AlreadyTracked`] if a live session exists and
    /// with [`ProcessError::NotFound`] if the process cannot be read.
    pub async fn start_tracking(&self, pid: u32) -> Result<SessionSummary, ProcessError> {
        let known = {
            let shared = self.shared.lock().await;
            if shared.live_session(pid).is_some() {
                warn!(pid, "tracking already active");
                return Err(ProcessError::AlreadyTracked(pid));
            }
            shared
                .processes
                .iter()
                .find(|r| r.pid == pid)
                .map(|r| (r.name.clone(), r.start_ticks))
        };

        let (name, start_ticks) = match known {
            Some(known) => known,
            None => {
                let collector = Arc::clone(&self.collector);
                let record = tokio::task::spawn_blocking(move || collector.process(pid)).await??;
                (record.name, record.start_ticks)
            }
        };

        let mut guard = self.shared.lock().await;
        let shared = &mut *guard;
        if shared.live_session(pid).is_some() {
            warn!(pid, "tracking already active");
            return Err(ProcessError::AlreadyTracked(pid));
        }

        let session = Arc::new(TrackingSession::new(pid, name.clone()));
        let cancel = CancellationToken::new();
        let interval = shared.settings.sampling_interval;
        let task = {
            let session = Arc::clone(&session);
            let collector = Arc::clone(&self.collector);
            let cancel = cancel.clone();
            let events = self.events.clone();
            tokio::spawn(async move {
                let reason =
                    run_sampling_loop(session, collector, interval, Some(start_ticks), cancel).await;
                if let Some(reason) = reason {
                    let _ = events.send(MonitorEvent::TrackingFinished { pid, reason });
                }
            })
        };

        let entry = SessionEntry {
            session: Arc::clone(&session),
            cancel,
            task: Some(task),
        };
        if let Some(previous) = shared.sessions.insert(pid, entry) {
            shared.archived.push(previous.session);
        }
        if let Some(record) = shared.processes.iter_mut().find(|r| r.pid == pid) {
            record.mark_tracked(session.start_time());
        }
        if let Some(details) = shared.details.get_mut(&pid) {
            details.record.mark_tracked(session.start_time());
        }
        drop(guard);

        info!(pid, name = %name, ?interval, "tracking started");
        self.emit(MonitorEvent::TrackingStarted { pid, name });
        Ok(session.summary())
    }

    /// Stops the live session for `pid` and waits for its loop to exit.
    ///
    /// Returns `false` when there was no live session to stop.
    pub async fn stop_tracking(&self, pid: u32) -> Result<bool, ProcessError> {
        let (stopped, cancel, task) = {
            let mut guard = self.shared.lock().await;
            let shared = &mut *guard;
            let Some(entry) = shared.sessions.get_mut(&pid) else {
                return Ok(false);
            };
            // Finished under the lock so a concurrent refresh cannot re-stamp it.
            let stopped = entry.session.finish(Local::now(), FinishReason::Stopped);
            let cancel = entry.cancel.clone();
            let task = entry.task.take();
            if let Some(record) = shared.processes.iter_mut().find(|r| r.pid == pid) {
                record.clear_tracking();
            }
            if let Some(details) = shared.details.get_mut(&pid) {
                details.record.clear_tracking();
            }
            (stopped, cancel, task)
        };

        cancel.cancel();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(pid, error = %e, "sampling task ended abnormally");
            }
        }

        if stopped {
            info!(pid, "tracking stopped");
            self.emit(MonitorEvent::TrackingFinished {
                pid,
                reason: FinishReason::Stopped,
            });
        }
        Ok(stopped)
    }

    /// Samples recorded by the latest session for `pid`.
    pub async fn history(&self, pid: u32) -> Option<Vec<MemorySample>> {
        let shared = self.shared.lock().await;
        shared.sessions.get(&pid).map(|entry| entry.session.history())
    }

    pub async fn session(&self, pid: u32) -> Option<SessionSummary> {
        let shared = self.shared.lock().await;
        shared.sessions.get(&pid).map(|entry| entry.session.summary())
    }

    /// Every session this monitor has run, oldest first.
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let shared = self.shared.lock().await;
        let mut summaries: Vec<SessionSummary> = shared
            .archived
            .iter()
            .map(|s| s.summary())
            .chain(shared.sessions.values().map(|entry| entry.session.summary()))
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.pid.cmp(&b.pid)));
        summaries
    }

    /// Kills `pid`, stopping its tracking session first.
    pub async fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        self.stop_tracking(pid).await?;

        let executor = Arc::clone(&self.executor);
        tokio::task::spawn_blocking(move || executor.kill(pid)).await??;
        info!(pid, "process killed");

        if let Err(e) = self.refresh().await {
            warn!(pid, error = %e, "refresh after kill failed");
        }
        Ok(())
    }

    pub async fn set_priority(&self, pid: u32, priority: PriorityClass) -> Result<(), ProcessError> {
        let executor = Arc::clone(&self.executor);
        tokio::task::spawn_blocking(move || executor.set_priority(pid, priority)).await??;

        let mut shared = self.shared.lock().await;
        if let Some(record) = shared.processes.iter_mut().find(|r| r.pid == pid) {
            record.priority = priority;
        }
        if let Some(details) = shared.details.get_mut(&pid) {
            details.record.priority = priority;
        }
        drop(shared);

        info!(pid, %priority, "priority changed");
        Ok(())
    }

    pub async fn settings(&self) -> MonitorSettings {
        self.shared.lock().await.settings.clone()
    }

    pub async fn set_include_system(&self, include_system: bool) {
        self.shared.lock().await.settings.include_system = include_system;
    }

    /// Applies to sessions started afterwards. Returns the clamped value.
    pub async fn set_sampling_interval(&self, interval: Duration) -> Duration {
        let interval = interval.max(MIN_SAMPLING_INTERVAL);
        self.shared.lock().await.settings.sampling_interval = interval;
        interval
    }

    /// Restarts the refresh timer if it is running. Returns the clamped value.
    pub async fn set_refresh_interval(self: &Arc<Self>, interval: Duration) -> Duration {
        let interval = interval.max(MIN_REFRESH_INTERVAL);
        let mut shared = self.shared.lock().await;
        shared.settings.refresh_interval = interval;
        if shared.timer.is_some() {
            self.restart_timer(&mut shared).await;
        }
        interval
    }

    pub async fn is_auto_refreshing(&self) -> bool {
        self.shared.lock().await.timer.is_some()
    }

    pub async fn start_auto_refresh(self: &Arc<Self>) {
        let mut shared = self.shared.lock().await;
        self.restart_timer(&mut shared).await;
    }

    pub async fn stop_auto_refresh(&self) {
        let mut shared = self.shared.lock().await;
        if let Some(timer) = shared.timer.take() {
            release_timer(timer).await;
            info!("auto refresh stopped");
        }
    }

    /// Replaces the refresh timer. The previous loop is cancelled and awaited
    /// before the new one is spawned, so two never run at once.
    async fn restart_timer(self: &Arc<Self>, shared: &mut Shared) {
        if let Some(previous) = shared.timer.take() {
            release_timer(previous).await;
        }

        let interval = shared.settings.refresh_interval;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(Arc::downgrade(self), interval, cancel.clone()));
        shared.timer = Some(RefreshTimer { cancel, task });
        info!(?interval, "auto refresh started");
    }

    /// Stops the refresh timer and every live session.
    pub async fn shutdown(&self) {
        self.stop_auto_refresh().await;
        let live: Vec<u32> = {
            let shared = self.shared.lock().await;
            shared
                .sessions
                .iter()
                .filter(|(_, entry)| entry.is_live())
                .map(|(pid, _)| *pid)
                .collect()
        };
        for pid in live {
            if let Err(e) = self.stop_tracking(pid).await {
                warn!(pid, error = %e, "failed to stop tracking during shutdown");
            }
        }
    }
}

impl Drop for ProcessMonitor {
    fn drop(&mut self) {
        let shared = self.shared.get_mut();
        if let Some(timer) = &shared.timer {
            timer.cancel.cancel();
        }
        for entry in shared.sessions.values() {
            entry.cancel.cancel();
        }
    }
}

async fn release_timer(timer: RefreshTimer) {
    timer.cancel.cancel();
    if let Err(e) = timer.task.await {
        warn!(error = %e, "refresh loop ended abnormally");
    }
}

/// Refreshes every `interval` until cancelled. Every wait races the token, so
/// a refresh blocked on the shared lock is abandoned on cancellation.
async fn refresh_loop(monitor: Weak<ProcessMonitor>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately; wait a full period instead.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let Some(monitor) = monitor.upgrade() else {
            break;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = monitor.refresh() => {
                if let Err(e) = result {
                    warn!(error = %e, "auto refresh failed");
                }
            }
        }
    }
    debug!("refresh loop exited");
}
