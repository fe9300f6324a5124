//! Process table snapshots (reads /proc on Linux)

pub mod linux;

pub use linux::LinuxProcessCollector;

use crate::error::ProcessError;
use crate::priority::PriorityClass;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub const MAX_DETAIL_THREADS: usize = 50;
pub const MAX_DETAIL_MODULES: usize = 100;

/// Kernel and init housekeeping processes hidden when system processes are excluded.
pub const SYSTEM_PROCESSES: &[&str] = &[
    "kthreadd",
    "ksoftirqd",
    "kworker",
    "kswapd0",
    "kcompactd0",
    "khugepaged",
    "kauditd",
    "kdevtmpfs",
    "kblockd",
    "migration",
    "cpuhp",
    "idle_inject",
    "watchdog",
    "watchdogd",
    "oom_reaper",
    "writeback",
    "netns",
    "rcu_sched",
    "rcu_preempt",
    "rcu_gp",
    "rcu_par_gp",
    "rcu_tasks_kthre",
    "systemd-journal",
    "systemd-udevd",
];

/// Matches the full name or the part before the per-CPU suffix (`kworker/0:1`).
pub fn is_system_process(name: &str) -> bool {
    let base = name.split('/').next().unwrap_or(name);
    SYSTEM_PROCESSES.contains(&name) || SYSTEM_PROCESSES.contains(&base)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub memory_mb: f64,
    pub thread_count: u32,
    pub priority: PriorityClass,
    /// Start time in clock ticks since boot; tells a reused pid apart.
    pub start_ticks: u64,
    /// Reserved; never sampled.
    pub cpu_percent: Option<f64>,
    pub tracked: bool,
    pub tracking_started_at: Option<DateTime<Local>>,
}

impl ProcessRecord {
    pub fn new(
        pid: u32,
        name: impl Into<String>,
        memory_mb: f64,
        thread_count: u32,
        priority: PriorityClass,
        start_ticks: u64,
    ) -> Self {
        Self {
            pid,
            name: name.into(),
            memory_mb,
            thread_count,
            priority,
            start_ticks,
            cpu_percent: None,
            tracked: false,
            tracking_started_at: None,
        }
    }

    pub fn mark_tracked(&mut self, started_at: DateTime<Local>) {
        self.tracked = true;
        self.tracking_started_at = Some(started_at);
    }

    pub fn clear_tracking(&mut self) {
        self.tracked = false;
        self.tracking_started_at = None;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub id: u32,
    pub state: String,
    pub priority: PriorityClass,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub module_name: String,
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDetails {
    pub record: ProcessRecord,
    pub threads: Vec<ThreadInfo>,
    pub modules: Vec<ModuleInfo>,
}

/// Result of a single memory read for a tracked process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryProbe {
    pub memory_mb: f64,
    pub start_ticks: u64,
}

pub trait ProcessCollector: Send + Sync {
    /// Enumerates the process table. Processes that vanish or cannot be read
    /// mid-enumeration are skipped rather than failing the whole snapshot.
    fn snapshot(&self, include_system: bool) -> Result<Vec<ProcessRecord>, ProcessError>;

    fn process(&self, pid: u32) -> Result<ProcessRecord, ProcessError>;

    /// Thread list capped at [`MAX_DETAIL_THREADS`], modules at [`MAX_DETAIL_MODULES`].
    fn details(&self, pid: u32) -> Result<ProcessDetails, ProcessError>;

    fn probe_memory(&self, pid: u32) -> Result<MemoryProbe, ProcessError>;
}

/// Sorts by name (pid breaks ties) and keeps the first record seen for each pid.
pub fn sort_and_dedup(records: &mut Vec<ProcessRecord>) {
    records.sort_by(|a, b| a.name.cmp(&b.name).then(a.pid.cmp(&b.pid)));
    let mut seen = HashSet::with_capacity(records.len());
    records.retain(|r| seen.insert(r.pid));
}
