//! Per-process memory tracking sessions

use crate::collector::ProcessCollector;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Samples kept per session; the oldest is evicted first.
pub const HISTORY_CAPACITY: usize = 1000;
pub const MIN_SAMPLING_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_SAMPLING_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub at: DateTime<Local>,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    ProcessExited,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub pid: u32,
    pub name: String,
    pub started_at: DateTime<Local>,
    pub finished_at: Option<DateTime<Local>>,
    pub finish_reason: Option<FinishReason>,
    pub sample_count: usize,
    pub average_memory_mb: f64,
    pub tracking_seconds: f64,
}

#[derive(Debug, Default)]
struct SessionState {
    finished_at: Option<DateTime<Local>>,
    finish_reason: Option<FinishReason>,
    samples: VecDeque<MemorySample>,
}

/// Finish time and samples share one lock, so no sample can land after the
/// session is finished.
#[derive(Debug)]
pub struct TrackingSession {
    pid: u32,
    name: String,
    started_at: DateTime<Local>,
    state: Mutex<SessionState>,
}

impl TrackingSession {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self::with_start_time(pid, name, Local::now())
    }

    pub fn with_start_time(pid: u32, name: impl Into<String>, started_at: DateTime<Local>) -> Self {
        Self {
            pid,
            name: name.into(),
            started_at,
            state: Mutex::new(SessionState {
                samples: VecDeque::with_capacity(64),
                ..SessionState::default()
            }),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_time(&self) -> DateTime<Local> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Local>> {
        self.state.lock().finished_at
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.state.lock().finish_reason
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().finished_at.is_some()
    }

    /// Appends a sample, evicting the oldest past [`HISTORY_CAPACITY`].
    /// Timestamps are kept strictly increasing even if the wall clock steps back.
    /// Returns `false` once the session is finished.
    pub fn record(&self, at: DateTime<Local>, memory_mb: f64) -> bool {
        let mut state = self.state.lock();
        if state.finished_at.is_some() {
            return false;
        }
        let at = match state.samples.back() {
            Some(last) if at <= last.at => last.at + chrono::Duration::microseconds(1),
            _ => at,
        };
        while state.samples.len() >= HISTORY_CAPACITY {
            state.samples.pop_front();
        }
        state.samples.push_back(MemorySample { at, memory_mb });
        true
    }

    /// Sets the finish time the first time it is called; later calls return `false`.
    pub fn finish(&self, at: DateTime<Local>, reason: FinishReason) -> bool {
        let mut state = self.state.lock();
        if state.finished_at.is_some() {
            return false;
        }
        state.finished_at = Some(at);
        state.finish_reason = Some(reason);
        true
    }

    pub fn history(&self) -> Vec<MemorySample> {
        self.state.lock().samples.iter().copied().collect()
    }

    pub fn sample_count(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn summary(&self) -> SessionSummary {
        let state = self.state.lock();
        let sample_count = state.samples.len();
        let average_memory_mb = if sample_count == 0 {
            0.0
        } else {
            state.samples.iter().map(|s| s.memory_mb).sum::<f64>() / sample_count as f64
        };
        let end = state.finished_at.unwrap_or_else(Local::now);
        let tracking_seconds = (end - self.started_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        SessionSummary {
            pid: self.pid,
            name: self.name.clone(),
            started_at: self.started_at,
            finished_at: state.finished_at,
            finish_reason: state.finish_reason,
            sample_count,
            average_memory_mb,
            tracking_seconds,
        }
    }
}

/// Samples the session's process until it exits or `cancel` fires.
///
/// A missing process (or a pid now owned by a different process) ends the
/// session. Any other read failure is skipped until the next tick. Returns
/// the reason if this loop is what finished the session.
pub async fn run_sampling_loop(
    session: Arc<TrackingSession>,
    collector: Arc<dyn ProcessCollector>,
    interval: Duration,
    expected_start: Option<u64>,
    cancel: CancellationToken,
) -> Option<FinishReason> {
    let pid = session.pid();
    let mut identity = expected_start;
    let mut ticker = tokio::time::interval(interval.max(MIN_SAMPLING_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let probe = {
            let collector = Arc::clone(&collector);
            tokio::task::spawn_blocking(move || collector.probe_memory(pid)).await
        };

        match probe {
            Ok(Ok(probe)) => {
                let expected = *identity.get_or_insert(probe.start_ticks);
                if expected != probe.start_ticks {
                    info!(pid, name = session.name(), "tracked pid now belongs to another process");
                    return finish(&session, FinishReason::ProcessExited);
                }
                if cancel.is_cancelled() || !session.record(Local::now(), probe.memory_mb.max(0.0)) {
                    break;
                }
            }
            Ok(Err(e)) if e.is_not_found() => {
                info!(pid, name = session.name(), "tracked process exited");
                return finish(&session, FinishReason::ProcessExited);
            }
            Ok(Err(e)) => debug!(pid, error = %e, "skipping memory sample"),
            Err(e) => debug!(pid, error = %e, "memory probe task failed"),
        }
    }

    finish(&session, FinishReason::Stopped)
}

fn finish(session: &TrackingSession, reason: FinishReason) -> Option<FinishReason> {
    session.finish(Local::now(), reason).then_some(reason)
}
