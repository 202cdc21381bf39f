//! Machine identity and resource metrics for registration and heartbeats.

use std::time::Duration;
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use uuid::Uuid;

/// Point-in-time resource usage, each value a 0-100 percentage.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub cpu: f64,
    pub memory: f64,
    pub disk: f64,
}

/// Collect a metrics snapshot. The CPU measurement blocks for ~200 ms; call
/// from a blocking-friendly context.
pub fn collect() -> Metrics {
    Metrics {
        cpu: cpu_percent(),
        memory: memory_percent(),
        disk: disk_percent(),
    }
}

fn cpu_percent() -> f64 {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    std::thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(200)));
    sys.refresh_cpu_usage();
    round2(f64::from(sys.global_cpu_usage()))
}

fn memory_percent() -> f64 {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return 0.0;
    }
    round2(sys.used_memory() as f64 / total as f64 * 100.0)
}

/// Usage of the primary mount: `/` where it exists, otherwise the first
/// disk reported.
fn disk_percent() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let primary = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.list().first());
    match primary {
        Some(disk) if disk.total_space() > 0 => {
            let used = disk.total_space() - disk.available_space();
            round2(used as f64 / disk.total_space() as f64 * 100.0)
        }
        _ => 0.0,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Normalised OS identifier used on the wire: `linux`, `macos` or `windows`.
pub fn os_ident() -> &'static str {
    match std::env::consts::OS {
        "macos" => "macos",
        "windows" => "windows",
        _ => "linux",
    }
}

pub fn hostname() -> String {
    System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Fresh random UUID for use as a persistent machine identifier.
pub fn generate_machine_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_ident_is_normalised() {
        assert!(matches!(os_ident(), "linux" | "macos" | "windows"));
    }

    #[test]
    fn metrics_are_percentages() {
        let m = collect();
        assert!((0.0..=100.0).contains(&m.cpu), "cpu: {}", m.cpu);
        assert!((0.0..=100.0).contains(&m.memory), "memory: {}", m.memory);
        assert!((0.0..=100.0).contains(&m.disk), "disk: {}", m.disk);
    }

    #[test]
    fn round2_truncates_to_two_places() {
        assert_eq!(round2(12.3456), 12.35);
        assert_eq!(round2(0.0), 0.0);
    }

    #[test]
    fn machine_ids_are_unique() {
        assert_ne!(generate_machine_id(), generate_machine_id());
    }
}
