use super::{
    is_system_process, sort_and_dedup, MemoryProbe, ModuleInfo, ProcessCollector, ProcessDetails,
    ProcessRecord, ThreadInfo, MAX_DETAIL_MODULES, MAX_DETAIL_THREADS,
};
use crate::error::ProcessError;
use crate::priority::PriorityClass;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Fields of `/proc/<pid>/stat` the collector uses.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StatLine {
    pub name: String,
    pub state: char,
    pub nice: i32,
    pub num_threads: u32,
    pub start_ticks: u64,
    pub rss_pages: u64,
}

/// Parses a stat line. The command name may itself contain spaces and
/// parentheses, so fields are counted from the last `)`.
pub(crate) fn parse_stat(content: &str) -> Option<StatLine> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    let name = content.get(open + 1..close)?.to_string();
    let fields: Vec<&str> = content.get(close + 1..)?.split_whitespace().collect();
    if fields.len() < 22 {
        return None;
    }

    Some(StatLine {
        name,
        state: fields[0].chars().next()?,
        nice: fields[16].parse().ok()?,
        num_threads: fields[17].parse().ok()?,
        start_ticks: fields[19].parse().ok()?,
        rss_pages: fields[21].parse::<i64>().ok()?.max(0) as u64,
    })
}

pub(crate) fn read_stat(root: &Path, pid: u32) -> Result<StatLine, ProcessError> {
    let content = fs::read_to_string(root.join(pid.to_string()).join("stat"))
        .map_err(|e| ProcessError::from_io(pid, e))?;
    parse_stat(&content).ok_or_else(|| ProcessError::Io {
        pid,
        source: io::Error::new(io::ErrorKind::InvalidData, "malformed stat line"),
    })
}

/// True once the pid is gone or only a zombie remains.
pub(crate) fn has_exited(root: &Path, pid: u32) -> bool {
    match read_stat(root, pid) {
        Ok(stat) => matches!(stat.state, 'Z' | 'X' | 'x'),
        Err(_) => true,
    }
}

fn thread_state_name(state: char) -> &'static str {
    match state {
        'R' => "Running",
        'S' => "Sleeping",
        'D' => "Waiting",
        'T' => "Stopped",
        't' => "Tracing",
        'Z' => "Zombie",
        'X' | 'x' => "Dead",
        'I' => "Idle",
        'P' => "Parked",
        _ => "Unknown",
    }
}

pub struct LinuxProcessCollector {
    proc_root: PathBuf,
    page_size: u64,
    workers: usize,
}

impl LinuxProcessCollector {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Reads from an alternate procfs mount.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 { page_size as u64 } else { 4096 };
        let workers = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            proc_root: root.into(),
            page_size,
            workers,
        }
    }

    pub fn proc_root(&self) -> &Path {
        &self.proc_root
    }

    fn memory_mb(&self, rss_pages: u64) -> f64 {
        (rss_pages.saturating_mul(self.page_size)) as f64 / BYTES_PER_MB
    }

    fn list_pids(&self) -> Result<Vec<u32>, ProcessError> {
        let entries = fs::read_dir(&self.proc_root).map_err(|e| ProcessError::Io { pid: 0, source: e })?;
        Ok(entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect())
    }

    fn parse_process(&self, pid: u32) -> Result<ProcessRecord, ProcessError> {
        let stat = read_stat(&self.proc_root, pid)?;
        if matches!(stat.state, 'Z' | 'X' | 'x') {
            return Err(ProcessError::NotFound(pid));
        }
        Ok(ProcessRecord::new(
            pid,
            stat.name,
            self.memory_mb(stat.rss_pages),
            stat.num_threads,
            PriorityClass::from_nice(stat.nice),
            stat.start_ticks,
        ))
    }

    fn read_threads(&self, pid: u32) -> Vec<ThreadInfo> {
        let task_dir = self.proc_root.join(pid.to_string()).join("task");
        let Ok(entries) = fs::read_dir(&task_dir) else {
            return Vec::new();
        };
        let mut tids: Vec<u32> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        tids.sort_unstable();

        tids.into_iter()
            .take(MAX_DETAIL_THREADS)
            .filter_map(|tid| {
                let content = fs::read_to_string(task_dir.join(tid.to_string()).join("stat")).ok()?;
                let stat = parse_stat(&content)?;
                Some(ThreadInfo {
                    id: tid,
                    state: thread_state_name(stat.state).to_string(),
                    priority: PriorityClass::from_nice(stat.nice),
                })
            })
            .collect()
    }

    /// Distinct file-backed mappings, in address order.
    fn read_modules(&self, pid: u32) -> Vec<ModuleInfo> {
        let Ok(maps) = fs::read_to_string(self.proc_root.join(pid.to_string()).join("maps")) else {
            return Vec::new();
        };
        let mut seen = HashSet::new();
        let mut modules = Vec::new();
        for line in maps.lines() {
            let Some(path) = line.split_whitespace().nth(5) else {
                continue;
            };
            if !path.starts_with('/') || !seen.insert(path.to_string()) {
                continue;
            }
            let module_name = Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.to_string());
            modules.push(ModuleInfo {
                module_name,
                file_name: path.to_string(),
            });
            if modules.len() >= MAX_DETAIL_MODULES {
                break;
            }
        }
        modules
    }
}

impl Default for LinuxProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessCollector for LinuxProcessCollector {
    fn snapshot(&self, include_system: bool) -> Result<Vec<ProcessRecord>, ProcessError> {
        let pids = self.list_pids()?;
        let chunk_size = pids.len().div_ceil(self.workers.max(1)).max(1);

        let mut processes: Vec<ProcessRecord> = thread::scope(|scope| {
            let handles: Vec<_> = pids
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        chunk
                            .iter()
                            .filter_map(|&pid| self.parse_process(pid).ok())
                            .filter(|p| include_system || !is_system_process(&p.name))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|h| h.join().ok())
                .flatten()
                .collect()
        });

        sort_and_dedup(&mut processes);
        Ok(processes)
    }

    fn process(&self, pid: u32) -> Result<ProcessRecord, ProcessError> {
        self.parse_process(pid)
    }

    fn details(&self, pid: u32) -> Result<ProcessDetails, ProcessError> {
        let record = self.parse_process(pid)?;
        Ok(ProcessDetails {
            threads: self.read_threads(pid),
            modules: self.read_modules(pid),
            record,
        })
    }

    fn probe_memory(&self, pid: u32) -> Result<MemoryProbe, ProcessError> {
        let stat = read_stat(&self.proc_root, pid)?;
        if matches!(stat.state, 'Z' | 'X' | 'x') {
            return Err(ProcessError::NotFound(pid));
        }
        Ok(MemoryProbe {
            memory_mb: self.memory_mb(stat.rss_pages),
            start_ticks: stat.start_ticks,
        })
    }
}
