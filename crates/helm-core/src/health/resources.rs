//! Resource sampling from `/proc/<pid>/`.
//!
//! CPU is reported as a percentage of one core averaged since the
//! previous sample; memory is resident-set size in MiB. Metrics are
//! per-process, so children a service forks are not accounted — good
//! enough for the dashboard, not a billing meter.

use std::time::Instant;

use nix::unistd::{SysconfVar, sysconf};

/// One resource sample for a process.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    /// CPU usage as a percentage of one core over the sampling interval.
    /// Zero on the first sample (no baseline yet).
    pub cpu_percent: f64,
    /// Resident set size in MiB.
    pub memory_mb: f64,
}

/// Stateful sampler for one PID, keeping the CPU baseline between calls.
#[derive(Debug)]
pub struct ResourceSampler {
    pid: u32,
    last_cpu: Option<(Instant, u64)>,
}

impl ResourceSampler {
    /// Create a sampler for the given PID.
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        Self {
            pid,
            last_cpu: None,
        }
    }

    /// The PID being sampled.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Take a sample. Returns `None` when the process is gone or `/proc`
    /// cannot be parsed.
    pub fn sample(&mut self) -> Option<ResourceSample> {
        let now = Instant::now();
        let jiffies = read_cpu_jiffies(self.pid)?;
        let rss_bytes = read_rss_bytes(self.pid)?;

        let cpu_percent = match self.last_cpu {
            Some((last_at, last_jiffies)) => {
                let elapsed = now.duration_since(last_at).as_secs_f64();
                if elapsed > 0.0 {
                    let delta = jiffies.saturating_sub(last_jiffies);
                    #[allow(clippy::cast_precision_loss)]
                    let cpu_seconds = delta as f64 / clock_ticks_per_second();
                    (cpu_seconds / elapsed) * 100.0
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        self.last_cpu = Some((now, jiffies));

        #[allow(clippy::cast_precision_loss)]
        let memory_mb = rss_bytes as f64 / (1024.0 * 1024.0);

        Some(ResourceSample {
            cpu_percent,
            memory_mb,
        })
    }
}

/// Total CPU jiffies (utime + stime) from `/proc/<pid>/stat`.
///
/// The fields after the `(comm)` field are space-separated; comm itself
/// may contain spaces, so parsing starts after the last `)`.
fn read_cpu_jiffies(pid: u32) -> Option<u64> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let comm_end = content.rfind(')')?;
    let fields: Vec<&str> = content.get(comm_end + 2..)?.split_whitespace().collect();

    // After (comm): index 11 is utime (field 14 overall), 12 is stime.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime.saturating_add(stime))
}

/// Resident set size in bytes from `/proc/<pid>/statm`.
fn read_rss_bytes(pid: u32) -> Option<u64> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let resident_pages: u64 = content.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages.saturating_mul(page_size()))
}

fn page_size() -> u64 {
    sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|v| u64::try_from(v).ok())
        .unwrap_or(4096)
}

fn clock_ticks_per_second() -> f64 {
    let ticks = sysconf(SysconfVar::CLK_TCK).ok().flatten().unwrap_or(100);
    #[allow(clippy::cast_precision_loss)]
    let ticks = ticks as f64;
    ticks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_own_process() {
        let mut sampler = ResourceSampler::new(std::process::id());

        let first = sampler.sample().unwrap();
        assert!(first.memory_mb > 0.0);
        assert!((first.cpu_percent - 0.0).abs() < f64::EPSILON);

        // Burn a little CPU so the second sample has a delta to report.
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_add(i);
        }
        std::hint::black_box(acc);

        let second = sampler.sample().unwrap();
        assert!(second.cpu_percent >= 0.0);
        assert!(second.memory_mb > 0.0);
    }

    #[test]
    fn test_sample_dead_process_is_none() {
        let mut sampler = ResourceSampler::new(999_999_997);
        assert!(sampler.sample().is_none());
    }

    #[test]
    fn test_stat_parsing_tolerates_spaces_in_comm() {
        // Parsing anchors on the last ')' so a comm with spaces and
        // parens cannot shift the field offsets.
        let content = "1 (a weird) name) S 0 1 1 0 -1 4194304 100 0 50 0 7 13 0 0 20 0 1 0 1000";
        let comm_end = content.rfind(')').unwrap();
        let fields: Vec<&str> = content[comm_end + 2..].split_whitespace().collect();
        assert_eq!(fields[11], "7");
        assert_eq!(fields[12], "13");
    }
}
