//! Scripted collector and executor for driving the monitor without a real /proc

#![allow(dead_code)]

use parking_lot::Mutex;
use proctrack_daemon::collector::{
    is_system_process, sort_and_dedup, MemoryProbe, ProcessCollector, ProcessDetails,
    ProcessRecord, ThreadInfo,
};
use proctrack_daemon::executor::ProcessExecutor;
use proctrack_daemon::priority::PriorityClass;
use proctrack_daemon::{MonitorSettings, ProcessError, ProcessMonitor};
use std::collections::{BTreeMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeProcess {
    name: String,
    memory_mb: f64,
    start_ticks: u64,
    priority: PriorityClass,
}

#[derive(Default)]
struct FakeTable {
    processes: BTreeMap<u32, FakeProcess>,
    glitches: BTreeMap<u32, usize>,
    snapshot_delay: Duration,
}

#[derive(Default)]
pub struct FakeCollector {
    table: Mutex<FakeTable>,
    snapshot_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl FakeCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spawn(&self, pid: u32, name: &str, memory_mb: f64) {
        self.table.lock().processes.insert(
            pid,
            FakeProcess {
                name: name.to_string(),
                memory_mb,
                start_ticks: 1000 + pid as u64,
                priority: PriorityClass::Normal,
            },
        );
    }

    /// Replaces `pid` with a different process under the same id.
    pub fn reuse_pid(&self, pid: u32, name: &str) {
        let mut table = self.table.lock();
        let start_ticks = table.processes.get(&pid).map_or(0, |p| p.start_ticks) + 1;
        table.processes.insert(
            pid,
            FakeProcess {
                name: name.to_string(),
                memory_mb: 1.0,
                start_ticks,
                priority: PriorityClass::Normal,
            },
        );
    }

    pub fn exit(&self, pid: u32) {
        self.table.lock().processes.remove(&pid);
    }

    pub fn set_memory(&self, pid: u32, memory_mb: f64) {
        if let Some(p) = self.table.lock().processes.get_mut(&pid) {
            p.memory_mb = memory_mb;
        }
    }

    pub fn set_priority(&self, pid: u32, priority: PriorityClass) {
        if let Some(p) = self.table.lock().processes.get_mut(&pid) {
            p.priority = priority;
        }
    }

    /// The next `count` memory probes for `pid` fail with a non-fatal error.
    pub fn glitch(&self, pid: u32, count: usize) {
        self.table.lock().glitches.insert(pid, count);
    }

    pub fn set_snapshot_delay(&self, delay: Duration) {
        self.table.lock().snapshot_delay = delay;
    }

    pub fn snapshot_calls(&self) -> usize {
        self.snapshot_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    fn record(pid: u32, p: &FakeProcess) -> ProcessRecord {
        ProcessRecord::new(pid, p.name.clone(), p.memory_mb, 2, p.priority, p.start_ticks)
    }
}

impl ProcessCollector for FakeCollector {
    fn snapshot(&self, include_system: bool) -> Result<Vec<ProcessRecord>, ProcessError> {
        self.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.table.lock().snapshot_delay;
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        let mut records: Vec<ProcessRecord> = self
            .table
            .lock()
            .processes
            .iter()
            .filter(|(_, p)| include_system || !is_system_process(&p.name))
            .map(|(pid, p)| Self::record(*pid, p))
            .collect();
        sort_and_dedup(&mut records);
        Ok(records)
    }

    fn process(&self, pid: u32) -> Result<ProcessRecord, ProcessError> {
        let table = self.table.lock();
        let p = table.processes.get(&pid).ok_or(ProcessError::NotFound(pid))?;
        Ok(Self::record(pid, p))
    }

    fn details(&self, pid: u32) -> Result<ProcessDetails, ProcessError> {
        let record = self.process(pid)?;
        Ok(ProcessDetails {
            threads: vec![
                ThreadInfo { id: pid, state: "Running".to_string(), priority: record.priority },
                ThreadInfo { id: pid + 1, state: "Sleeping".to_string(), priority: record.priority },
            ],
            modules: Vec::new(),
            record,
        })
    }

    fn probe_memory(&self, pid: u32) -> Result<MemoryProbe, ProcessError> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let mut table = self.table.lock();
        if let Some(remaining) = table.glitches.get_mut(&pid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ProcessError::Io {
                    pid,
                    source: io::Error::other("transient read failure"),
                });
            }
        }
        let p = table.processes.get(&pid).ok_or(ProcessError::NotFound(pid))?;
        Ok(MemoryProbe {
            memory_mb: p.memory_mb,
            start_ticks: p.start_ticks,
        })
    }
}

/// Kills and renices processes inside a [`FakeCollector`].
pub struct FakeExecutor {
    collector: Arc<FakeCollector>,
    denied: Mutex<HashSet<u32>>,
    killed: Mutex<Vec<u32>>,
}

impl FakeExecutor {
    pub fn new(collector: Arc<FakeCollector>) -> Arc<Self> {
        Arc::new(Self {
            collector,
            denied: Mutex::new(HashSet::new()),
            killed: Mutex::new(Vec::new()),
        })
    }

    pub fn deny(&self, pid: u32) {
        self.denied.lock().insert(pid);
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().clone()
    }

    fn check(&self, pid: u32) -> Result<(), ProcessError> {
        if self.denied.lock().contains(&pid) {
            return Err(ProcessError::AccessDenied(pid));
        }
        self.collector.process(pid).map(|_| ())
    }
}

impl ProcessExecutor for FakeExecutor {
    fn kill(&self, pid: u32) -> Result<(), ProcessError> {
        self.check(pid)?;
        self.collector.exit(pid);
        self.killed.lock().push(pid);
        Ok(())
    }

    fn set_priority(&self, pid: u32, priority: PriorityClass) -> Result<(), ProcessError> {
        self.check(pid)?;
        self.collector.set_priority(pid, priority);
        Ok(())
    }
}

pub struct Harness {
    pub collector: Arc<FakeCollector>,
    pub executor: Arc<FakeExecutor>,
    pub monitor: Arc<ProcessMonitor>,
}

pub fn harness(settings: MonitorSettings) -> Harness {
    let collector = FakeCollector::new();
    let executor = FakeExecutor::new(Arc::clone(&collector));
    let monitor = Arc::new(ProcessMonitor::new(
        collector.clone(),
        executor.clone(),
        settings,
    ));
    Harness {
        collector,
        executor,
        monitor,
    }
}

pub fn fast_sampling() -> MonitorSettings {
    MonitorSettings {
        sampling_interval: Duration::from_millis(500),
        ..MonitorSettings::default()
    }
}
