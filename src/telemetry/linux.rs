use super::{ProcessSort, TelemetrySource};
use chrono::DateTime;
use nix::sys::statvfs::statvfs;
use parking_lot::Mutex;
use procfs::process::{Process, all_processes};
use procfs::{CpuInfo, CpuTime, Current, CurrentSI, KernelStats, LoadAverage, Meminfo, Uptime};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

const SKIP_FS: &[&str] = &[
    "tmpfs",
    "proc",
    "sysfs",
    "devtmpfs",
    "devpts",
    "cgroup",
    "cgroup2",
    "pstore",
    "securityfs",
    "fusectl",
    "debugfs",
    "hugetlbfs",
    "mqueue",
    "configfs",
    "binfmt_misc",
    "autofs",
    "tracefs",
    "overlay",
    "nsfs",
    "efivarfs",
];

/// `(busy, total)` jiffies of one CPU line.
fn jiffies(t: &CpuTime) -> (u64, u64) {
    let idle = t.idle + t.iowait.unwrap_or(0);
    let total = t.user
        + t.nice
        + t.system
        + t.idle
        + t.iowait.unwrap_or(0)
        + t.irq.unwrap_or(0)
        + t.softirq.unwrap_or(0)
        + t.steal.unwrap_or(0);
    (total - idle, total)
}

fn usage_percent(prev: (u64, u64), now: (u64, u64)) -> f64 {
    let busy = now.0.saturating_sub(prev.0);
    let total = now.1.saturating_sub(prev.1);
    if total == 0 {
        return 0.0;
    }
    round1(busy as f64 / total as f64 * 100.0)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round1(part as f64 / whole as f64 * 100.0)
}

struct ProcessSample {
    taken: Instant,
    ticks: HashMap<i32, u64>,
}

/// Telemetry read from `/proc` and `statvfs`.
///
/// CPU figures are deltas against the previous call, so the first reading
/// reports the average since boot.
pub struct ProcfsTelemetry {
    prev_cpu: Mutex<Vec<(u64, u64)>>,
    prev_processes: Mutex<Option<ProcessSample>>,
}

impl ProcfsTelemetry {
    pub fn new() -> anyhow::Result<Self> {
        // Fail early when /proc is not mounted
        Meminfo::current()?;
        Ok(Self {
            prev_cpu: Mutex::new(Vec::new()),
            prev_processes: Mutex::new(None),
        })
    }
}

impl TelemetrySource for ProcfsTelemetry {
    fn system_info(&self) -> anyhow::Result<Value> {
        let uname = nix::sys::utsname::uname()?;
        let cpuinfo = CpuInfo::current()?;
        let stats = KernelStats::current()?;
        let uptime = Uptime::current()?;

        let logical = cpuinfo.num_cores();
        let physical: HashSet<(String, String)> = (0..logical)
            .filter_map(|i| {
                Some((
                    cpuinfo.get_field(i, "physical id")?.to_string(),
                    cpuinfo.get_field(i, "core id")?.to_string(),
                ))
            })
            .collect();
        let cpu_count = if physical.is_empty() {
            logical
        } else {
            physical.len()
        };

        Ok(json!({
            "platform": uname.sysname().to_string_lossy(),
            "platform_release": uname.release().to_string_lossy(),
            "platform_version": uname.version().to_string_lossy(),
            "architecture": uname.machine().to_string_lossy(),
            "hostname": uname.nodename().to_string_lossy(),
            "processor": cpuinfo.model_name(0),
            "cpu_count": cpu_count,
            "cpu_count_logical": logical,
            "boot_time": DateTime::from_timestamp(stats.btime as i64, 0).map(|t| t.to_rfc3339()),
            "uptime_seconds": uptime.uptime,
        }))
    }

    fn cpu(&self) -> anyhow::Result<Value> {
        let stats = KernelStats::current()?;
        let loadavg = LoadAverage::current()?;
        let cpuinfo = CpuInfo::current()?;

        let now: Vec<(u64, u64)> = std::iter::once(&stats.total)
            .chain(stats.cpu_time.iter())
            .map(jiffies)
            .collect();

        let mut prev = self.prev_cpu.lock();
        let usage: Vec<f64> = now
            .iter()
            .enumerate()
            .map(|(i, sample)| usage_percent(prev.get(i).copied().unwrap_or((0, 0)), *sample))
            .collect();
        *prev = now;
        drop(prev);

        let frequency = cpuinfo
            .get_field(0, "cpu MHz")
            .and_then(|mhz| mhz.trim().parse::<f64>().ok());

        Ok(json!({
            "percent": usage.first().copied().unwrap_or(0.0),
            "percent_per_core": usage.get(1..).unwrap_or_default(),
            "frequency": frequency.map(|current| json!({ "current": current })),
            "load_average": {
                "one": loadavg.one,
                "five": loadavg.five,
                "fifteen": loadavg.fifteen,
            },
        }))
    }

    fn detached(&self) -> anyhow::Result<Arc<dyn TelemetrySource>> {
        Ok(Arc::new(ProcfsTelemetry::new()?))
    }

    fn memory(&self) -> anyhow::Result<Value> {
        let meminfo = Meminfo::current()?;
        let total = meminfo.mem_total;
        let available = meminfo.mem_available.unwrap_or(meminfo.mem_free);
        let used = total.saturating_sub(available);
        let swap_used = meminfo.swap_total.saturating_sub(meminfo.swap_free);

        Ok(json!({
            "total": total,
            "available": available,
            "used": used,
            "percent": percent(used, total),
            "swap_total": meminfo.swap_total,
            "swap_used": swap_used,
            "swap_percent": percent(swap_used, meminfo.swap_total),
        }))
    }

    fn disks(&self) -> anyhow::Result<Value> {
        let mounts = Process::myself()?.mountinfo()?;

        let mut disks = Vec::new();
        for m in mounts
            .iter()
            .filter(|m| !SKIP_FS.contains(&m.fs_type.as_str()))
        {
            // Unreadable mounts are skipped
            let Ok(stat) = statvfs(m.mount_point.as_path()) else {
                continue;
            };
            let block_size = stat.fragment_size() as u64;
            let total = stat.blocks() as u64 * block_size;
            let free = stat.blocks_available() as u64 * block_size;
            if total == 0 {
                continue;
            }
            let used = total.saturating_sub(free);
            disks.push(json!({
                "device": m.mount_source.as_deref().unwrap_or("unknown"),
                "mountpoint": m.mount_point.display().to_string(),
                "fstype": m.fs_type,
                "total": total,
                "used": used,
                "free": free,
                "percent": percent(used, total),
            }));
        }
        Ok(Value::Array(disks))
    }

    fn network(&self) -> anyhow::Result<Value> {
        let devices = procfs::net::dev_status()?;
        let (mut bytes_sent, mut bytes_recv, mut packets_sent, mut packets_recv) = (0, 0, 0, 0);
        for device in devices.values() {
            bytes_sent += device.sent_bytes;
            bytes_recv += device.recv_bytes;
            packets_sent += device.sent_packets;
            packets_recv += device.recv_packets;
        }

        Ok(json!({
            "bytes_sent": bytes_sent,
            "bytes_recv": bytes_recv,
            "packets_sent": packets_sent,
            "packets_recv": packets_recv,
        }))
    }

    fn processes(&self, sort: ProcessSort, limit: usize) -> anyhow::Result<Value> {
        let ticks_per_sec = procfs::ticks_per_second() as f64;
        let page_size = procfs::page_size();
        let mem_total = Meminfo::current()?.mem_total;

        let taken = Instant::now();
        let mut ticks = HashMap::new();
        let mut prev = self.prev_processes.lock();
        let elapsed = prev
            .as_ref()
            .map(|p| taken.duration_since(p.taken).as_secs_f64())
            .unwrap_or(0.0);

        let mut rows: Vec<(f64, f64, Value)> = all_processes()?
            .filter_map(|p| p.ok())
            .filter_map(|p| {
                // Processes may exit while being listed
                let stat = p.stat().ok()?;
                let cpu_ticks = stat.utime + stat.stime;
                ticks.insert(stat.pid, cpu_ticks);

                let cpu_percent = match prev.as_ref().and_then(|s| s.ticks.get(&stat.pid)) {
                    Some(before) if elapsed > 0.0 => round1(
                        cpu_ticks.saturating_sub(*before) as f64 / ticks_per_sec / elapsed * 100.0,
                    ),
                    _ => 0.0,
                };
                let memory_percent = percent(stat.rss * page_size, mem_total);

                Some((
                    cpu_percent,
                    memory_percent,
                    json!({
                        "pid": stat.pid,
                        "name": stat.comm,
                        "cpu_percent": cpu_percent,
                        "memory_percent": memory_percent,
                    }),
                ))
            })
            .collect();

        *prev = Some(ProcessSample { taken, ticks });
        drop(prev);

        rows.sort_by(|a, b| {
            let (a, b) = match sort {
                ProcessSort::Cpu => (a.0, b.0),
                ProcessSort::Memory => (a.1, b.1),
            };
            b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(Value::Array(
            rows.into_iter().take(limit).map(|(_, _, row)| row).collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_percent() {
        assert_eq!(usage_percent((0, 0), (50, 100)), 50.0);
        assert_eq!(usage_percent((50, 100), (50, 100)), 0.0);
        assert_eq!(usage_percent((10, 100), (40, 200)), 30.0);
    }

    #[test]
    fn test_memory() {
        let telemetry = ProcfsTelemetry::new().unwrap();
        let memory = telemetry.memory().unwrap();
        assert!(memory["total"].as_u64().unwrap() > 0);
        let pct = memory["percent"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&pct));
    }

    #[test]
    fn test_cpu_per_core() {
        let telemetry = ProcfsTelemetry::new().unwrap();
        telemetry.cpu().unwrap();
        let cpu = telemetry.cpu().unwrap();
        assert!(!cpu["percent_per_core"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_detached_keeps_own_cpu_baseline() {
        let telemetry = ProcfsTelemetry::new().unwrap();
        telemetry.cpu().unwrap();
        let baseline = telemetry.prev_cpu.lock().clone();

        let stream = telemetry.detached().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        stream.cpu().unwrap();

        assert_eq!(*telemetry.prev_cpu.lock(), baseline);
    }

    #[test]
    fn test_processes_limit_and_order() {
        let telemetry = ProcfsTelemetry::new().unwrap();
        let rows = telemetry.processes(ProcessSort::Memory, 5).unwrap();
        let rows = rows.as_array().unwrap();
        assert!(!rows.is_empty() && rows.len() <= 5);
        let mem: Vec<f64> = rows
            .iter()
            .map(|r| r["memory_percent"].as_f64().unwrap())
            .collect();
        assert!(mem.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_system_info() {
        let telemetry = ProcfsTelemetry::new().unwrap();
        let info = telemetry.system_info().unwrap();
        assert_eq!(info["platform"], "Linux");
        assert!(info["cpu_count_logical"].as_u64().unwrap() > 0);
    }
}
