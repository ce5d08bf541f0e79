//! Periodic resource log line: load average, memory, swap and disk usage.

use crate::harvest::flag::Flag;
use crate::harvest::util::human_size;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSample {
    pub load: Option<[f64; 3]>,
    pub mem_total_kb: Option<u64>,
    pub mem_available_kb: Option<u64>,
    pub swap_total_kb: Option<u64>,
    pub swap_free_kb: Option<u64>,
    pub disk_total: Option<u64>,
    pub disk_available: Option<u64>,
}

impl ResourceSample {
    pub fn collect(disk_path: &Path) -> Self {
        let mut sample = Self::default();
        if let Ok(raw) = fs::read_to_string("/proc/loadavg") {
            sample.load = parse_loadavg(&raw);
        }
        if let Ok(raw) = fs::read_to_string("/proc/meminfo") {
            sample.mem_total_kb = meminfo_kb(&raw, "MemTotal");
            sample.mem_available_kb = meminfo_kb(&raw, "MemAvailable");
            sample.swap_total_kb = meminfo_kb(&raw, "SwapTotal");
            sample.swap_free_kb = meminfo_kb(&raw, "SwapFree");
        }
        sample.disk_total = fs2::total_space(disk_path).ok();
        sample.disk_available = fs2::available_space(disk_path).ok();
        sample
    }

    pub fn summary(&self) -> String {
        let load = self
            .load
            .map(|[a, b, c]| format!("{a:.2} {b:.2} {c:.2}"))
            .unwrap_or_else(|| "n/a".to_string());
        format!(
            "load: {load}. memory: {}. swap: {}. disk: {}",
            usage(self.mem_total_kb.map(|k| k * 1024), self.mem_available_kb.map(|k| k * 1024)),
            usage(self.swap_total_kb.map(|k| k * 1024), self.swap_free_kb.map(|k| k * 1024)),
            usage(self.disk_total, self.disk_available),
        )
    }
}

fn usage(total: Option<u64>, free: Option<u64>) -> String {
    match (total, free) {
        (Some(total), Some(free)) => format!(
            "{} used of {}",
            human_size(total.saturating_sub(free)),
            human_size(total)
        ),
        _ => "n/a".to_string(),
    }
}

fn parse_loadavg(raw: &str) -> Option<[f64; 3]> {
    let mut fields = raw.split_whitespace().map(|f| f.parse::<f64>().ok());
    Some([fields.next()??, fields.next()??, fields.next()??])
}

fn meminfo_kb(raw: &str, key: &str) -> Option<u64> {
    raw.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        rest.split_whitespace().next()?.parse().ok()
    })
}

pub struct Monitor {
    stop: Flag,
    handle: Option<JoinHandle<()>>,
}

impl Monitor {
    pub fn start(interval: Duration, disk_path: impl Into<PathBuf>) -> Result<Self> {
        let stop = Flag::new();
        let thread_stop = stop.clone();
        let disk_path = disk_path.into();
        let handle = thread::Builder::new()
            .name("resource-monitor".to_string())
            .spawn(move || {
                loop {
                    info!("{}", ResourceSample::collect(&disk_path).summary());
                    if thread_stop.wait_timeout(interval) {
                        break;
                    }
                }
            })
            .context("failed to spawn resource monitor")?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn stop(mut self) {
        self.halt();
    }

    fn halt(&mut self) {
        self.stop.set();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("resource monitor panicked");
            }
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_proc_formats() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 2/1024 12345\n"), Some([0.52, 0.58, 0.59]));
        assert_eq!(parse_loadavg("garbage"), None);
        let meminfo = "MemTotal:       16318480 kB\nMemFree:  1000 kB\nMemAvailable:   8159240 kB\n";
        assert_eq!(meminfo_kb(meminfo, "MemTotal"), Some(16_318_480));
        assert_eq!(meminfo_kb(meminfo, "MemAvailable"), Some(8_159_240));
        assert_eq!(meminfo_kb(meminfo, "SwapTotal"), None);
    }

    #[test]
    fn summary_tolerates_missing_values() {
        let sample = ResourceSample {
            disk_total: Some(4096),
            disk_available: Some(1024),
            ..Default::default()
        };
        assert_eq!(
            sample.summary(),
            "load: n/a. memory: n/a. swap: n/a. disk: 3.0K used of 4.0K"
        );
    }

    #[test]
    fn monitor_stops_promptly() {
        let monitor = Monitor::start(Duration::from_secs(3600), ".").expect("start");
        monitor.stop();
    }
}
