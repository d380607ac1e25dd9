//! OS sampling behind a small trait
//!
//! [`LinuxProbe`] reads procfs directly and `statvfs(3)` for the root
//! volume. [`FakeProbe`] returns settable values and can be told to fail
//! per source.

use parking_lot::Mutex;
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::{Result, SubstrateError};

/// Kernel clock ticks per second for `/proc/self/stat` times
const CLK_TCK: f64 = 100.0;

const DISK_CACHE_TTL: Duration = Duration::from_secs(30);

/// Reading groups, each of which may fail independently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProbeSource {
    Cpu,
    Memory,
    Disk,
    Network,
    Process,
}

impl ProbeSource {
    pub const ALL: [ProbeSource; 5] = [
        ProbeSource::Cpu,
        ProbeSource::Memory,
        ProbeSource::Disk,
        ProbeSource::Network,
        ProbeSource::Process,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            ProbeSource::Cpu => "cpu",
            ProbeSource::Memory => "memory",
            ProbeSource::Disk => "disk",
            ProbeSource::Network => "network",
            ProbeSource::Process => "process",
        }
    }
}

impl fmt::Display for ProbeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryReading {
    pub used: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DiskReading {
    pub used: u64,
    pub total: u64,
}

/// Bytes moved since the previous reading
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NetworkReading {
    pub received: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessReading {
    pub resident: u64,
    pub cpu_percent: f64,
    pub threads: u32,
}

/// Source of OS readings
///
/// Calls may block briefly on file or process I/O; the collector runs
/// them off the async workers.
pub trait SystemProbe: Send + Sync {
    /// System-wide CPU usage since the previous call, percent
    fn cpu_usage(&self) -> Result<f64>;
    fn memory(&self) -> Result<MemoryReading>;
    fn disk(&self) -> Result<DiskReading>;
    fn network(&self) -> Result<NetworkReading>;
    fn process(&self) -> Result<ProcessReading>;
}

fn probe_err(source: ProbeSource, detail: impl fmt::Display) -> SubstrateError {
    SubstrateError::Probe(format!("{}: {}", source, detail))
}

#[derive(Default)]
struct LinuxProbeState {
    /// (busy, total) jiffies from `/proc/stat`
    last_cpu: Option<(u64, u64)>,
    /// (rx, tx) byte totals from `/proc/net/dev`
    last_net: Option<(u64, u64)>,
    /// (utime + stime ticks, wall clock)
    last_proc: Option<(u64, Instant)>,
    disk_cache: Option<(DiskReading, Instant)>,
}

/// procfs-backed probe
pub struct LinuxProbe {
    state: Mutex<LinuxProbeState>,
    cpu_count: usize,
}

impl LinuxProbe {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LinuxProbeState::default()),
            cpu_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

impl Default for LinuxProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn read_proc(path: &str, source: ProbeSource) -> Result<String> {
    std::fs::read_to_string(Path::new(path)).map_err(|e| probe_err(source, format!("{}: {}", path, e)))
}

impl SystemProbe for LinuxProbe {
    fn cpu_usage(&self) -> Result<f64> {
        let content = read_proc("/proc/stat", ProbeSource::Cpu)?;
        let (busy, total) = content
            .lines()
            .next()
            .and_then(parse_cpu_line)
            .ok_or_else(|| probe_err(ProbeSource::Cpu, "malformed /proc/stat"))?;

        let mut state = self.state.lock();
        let usage = match state.last_cpu {
            Some((prev_busy, prev_total)) if total > prev_total => {
                busy.saturating_sub(prev_busy) as f64 * 100.0 / (total - prev_total) as f64
            }
            Some(_) => 0.0,
            None if total > 0 => busy as f64 * 100.0 / total as f64,
            None => 0.0,
        };
        state.last_cpu = Some((busy, total));
        Ok(usage.clamp(0.0, 100.0))
    }

    fn memory(&self) -> Result<MemoryReading> {
        let content = read_proc("/proc/meminfo", ProbeSource::Memory)?;
        parse_meminfo(&content).ok_or_else(|| probe_err(ProbeSource::Memory, "MemTotal/MemAvailable not found"))
    }

    fn disk(&self) -> Result<DiskReading> {
        if let Some((reading, at)) = self.state.lock().disk_cache {
            if at.elapsed() < DISK_CACHE_TTL {
                return Ok(reading);
            }
        }

        let reading = root_volume_usage("/")?;
        self.state.lock().disk_cache = Some((reading, Instant::now()));
        Ok(reading)
    }

    fn network(&self) -> Result<NetworkReading> {
        let content = read_proc("/proc/net/dev", ProbeSource::Network)?;
        let (rx, tx) = parse_net_dev(&content);

        let mut state = self.state.lock();
        let reading = match state.last_net {
            Some((prev_rx, prev_tx)) => NetworkReading {
                received: rx.saturating_sub(prev_rx),
                sent: tx.saturating_sub(prev_tx),
            },
            None => NetworkReading::default(),
        };
        state.last_net = Some((rx, tx));
        Ok(reading)
    }

    fn process(&self) -> Result<ProcessReading> {
        let status = read_proc("/proc/self/status", ProbeSource::Process)?;
        let (resident, threads) =
            parse_status(&status).ok_or_else(|| probe_err(ProbeSource::Process, "VmRSS/Threads not found"))?;
        let stat = read_proc("/proc/self/stat", ProbeSource::Process)?;
        let ticks = parse_self_stat_ticks(&stat)
            .ok_or_else(|| probe_err(ProbeSource::Process, "malformed /proc/self/stat"))?;

        let now = Instant::now();
        let mut state = self.state.lock();
        let cpu_percent = match state.last_proc {
            Some((prev_ticks, prev_at)) => {
                let wall = now.duration_since(prev_at).as_secs_f64();
                if wall > 0.0 {
                    let cpu_secs = ticks.saturating_sub(prev_ticks) as f64 / CLK_TCK;
                    (cpu_secs / wall / self.cpu_count as f64 * 100.0).clamp(0.0, 100.0)
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        state.last_proc = Some((ticks, now));

        Ok(ProcessReading {
            resident,
            cpu_percent,
            threads,
        })
    }
}

/// `cpu  user nice system idle iowait irq softirq steal ...` → (busy, total)
fn parse_cpu_line(line: &str) -> Option<(u64, u64)> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let values: Vec<u64> = fields.take(8).filter_map(|f| f.parse().ok()).collect();
    if values.len() < 4 {
        return None;
    }
    let total: u64 = values.iter().sum();
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    Some((total.saturating_sub(idle), total))
}

fn parse_meminfo(content: &str) -> Option<MemoryReading> {
    let mut total_kb = None;
    let mut available_kb = None;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("MemTotal:") => total_kb = parts.next().and_then(|v| v.parse::<u64>().ok()),
            Some("MemAvailable:") => available_kb = parts.next().and_then(|v| v.parse::<u64>().ok()),
            _ => {}
        }
        if total_kb.is_some() && available_kb.is_some() {
            break;
        }
    }
    let total = total_kb? * 1024;
    let available = available_kb? * 1024;
    Some(MemoryReading {
        used: total.saturating_sub(available),
        total,
    })
}

/// Used and total bytes of the filesystem holding `path`
#[cfg(unix)]
fn root_volume_usage(path: &str) -> Result<DiskReading> {
    let c_path = std::ffi::CString::new(path).map_err(|e| probe_err(ProbeSource::Disk, e))?;
    // SAFETY: c_path is NUL-terminated and stat is a plain C struct written by the call
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if ret != 0 {
        return Err(probe_err(
            ProbeSource::Disk,
            format!("statvfs {}: {}", path, std::io::Error::last_os_error()),
        ));
    }
    Ok(usage_from_blocks(
        stat.f_frsize as u64,
        stat.f_blocks as u64,
        stat.f_bfree as u64,
    ))
}

#[cfg(not(unix))]
fn root_volume_usage(path: &str) -> Result<DiskReading> {
    Err(probe_err(ProbeSource::Disk, format!("statvfs unavailable for {}", path)))
}

fn usage_from_blocks(block_size: u64, blocks: u64, free_blocks: u64) -> DiskReading {
    let total = blocks.saturating_mul(block_size);
    let free = free_blocks.min(blocks).saturating_mul(block_size);
    DiskReading {
        used: total - free,
        total,
    }
}

/// Summed (rx, tx) bytes over all interfaces except loopback
fn parse_net_dev(content: &str) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in content.lines().skip(2) {
        let Some((iface, data)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<u64> = data
            .split_whitespace()
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() >= 9 {
            rx += fields[0];
            tx += fields[8];
        }
    }
    (rx, tx)
}

/// (VmRSS bytes, Threads) from `/proc/self/status`
fn parse_status(content: &str) -> Option<(u64, u32)> {
    let mut rss = None;
    let mut threads = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            rss = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|kb| kb * 1024);
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            threads = rest.trim().parse::<u32>().ok();
        }
    }
    Some((rss?, threads?))
}

/// utime + stime ticks; fields counted after the parenthesized comm
fn parse_self_stat_ticks(content: &str) -> Option<u64> {
    let after_comm = &content[content.rfind(')')? + 1..];
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    // state is field 3 overall, utime 14, stime 15
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[derive(Debug, Clone, Default)]
struct FakeReadings {
    cpu: f64,
    memory: MemoryReading,
    disk: DiskReading,
    network: NetworkReading,
    process: ProcessReading,
    failing: Vec<ProbeSource>,
}

/// Probe with settable readings
#[derive(Default)]
pub struct FakeProbe {
    readings: Mutex<FakeReadings>,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_cpu(&self, percent: f64) {
        self.readings.lock().cpu = percent;
    }

    pub fn set_memory(&self, used: u64, total: u64) {
        self.readings.lock().memory = MemoryReading { used, total };
    }

    pub fn set_disk(&self, used: u64, total: u64) {
        self.readings.lock().disk = DiskReading { used, total };
    }

    pub fn set_network(&self, received: u64, sent: u64) {
        self.readings.lock().network = NetworkReading { received, sent };
    }

    pub fn set_process(&self, resident: u64, cpu_percent: f64, threads: u32) {
        self.readings.lock().process = ProcessReading {
            resident,
            cpu_percent,
            threads,
        };
    }

    /// Make `source` fail (or recover) on subsequent reads
    pub fn set_failing(&self, source: ProbeSource, failing: bool) {
        let mut r = self.readings.lock();
        r.failing.retain(|s| *s != source);
        if failing {
            r.failing.push(source);
        }
    }

    fn read<T>(&self, source: ProbeSource, f: impl FnOnce(&FakeReadings) -> T) -> Result<T> {
        let r = self.readings.lock();
        if r.failing.contains(&source) {
            return Err(probe_err(source, "injected failure"));
        }
        Ok(f(&r))
    }
}

impl SystemProbe for FakeProbe {
    fn cpu_usage(&self) -> Result<f64> {
        self.read(ProbeSource::Cpu, |r| r.cpu)
    }

    fn memory(&self) -> Result<MemoryReading> {
        self.read(ProbeSource::Memory, |r| r.memory)
    }

    fn disk(&self) -> Result<DiskReading> {
        self.read(ProbeSource::Disk, |r| r.disk)
    }

    fn network(&self) -> Result<NetworkReading> {
        self.read(ProbeSource::Network, |r| r.network)
    }

    fn process(&self) -> Result<ProcessReading> {
        self.read(ProbeSource::Process, |r| r.process)
    }
}
