//! Admission gate on host memory and disk pressure.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use sysinfo::{Disks, MemoryRefreshKind, RefreshKind, System};
use tracing::{debug, warn};

/// Source of host resource readings.
pub trait CapacityProbe: Send + Sync {
    /// Used/total memory ratio in `[0, 1]`, if known.
    fn memory_usage(&self) -> Option<f64>;

    /// Free bytes on the volume holding `path`, if known.
    fn available_disk_bytes(&self, path: &Path) -> Option<u64>;
}

/// Readings from the running host via sysinfo.
pub struct SystemProbe {
    system: Mutex<System>,
}

impl SystemProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            )),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityProbe for SystemProbe {
    fn memory_usage(&self) -> Option<f64> {
        let mut system = self.system.lock();
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        let free = system.available_memory().min(total);
        Some((total - free) as f64 / total as f64)
    }

    fn available_disk_bytes(&self, path: &Path) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        // Longest mount point containing the path.
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Fixed readings that can be changed at runtime.
#[derive(Debug)]
pub struct FixedCapacity {
    memory_usage: Mutex<Option<f64>>,
    disk_bytes: Mutex<Option<u64>>,
}

impl FixedCapacity {
    pub fn new(memory_usage: f64) -> Self {
        Self {
            memory_usage: Mutex::new(Some(memory_usage)),
            disk_bytes: Mutex::new(None),
        }
    }

    pub fn set_memory_usage(&self, usage: f64) {
        *self.memory_usage.lock() = Some(usage);
    }

    pub fn set_disk_bytes(&self, bytes: Option<u64>) {
        *self.disk_bytes.lock() = bytes;
    }
}

impl CapacityProbe for FixedCapacity {
    fn memory_usage(&self) -> Option<f64> {
        *self.memory_usage.lock()
    }

    fn available_disk_bytes(&self, _path: &Path) -> Option<u64> {
        *self.disk_bytes.lock()
    }
}

/// Outcome of a capacity check.
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityStatus {
    Available,
    MemoryPressure { usage: f64, threshold: f64 },
    LowDisk { available_bytes: u64, required_bytes: u64 },
}

impl CapacityStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Available)
    }

    pub fn reason(&self) -> String {
        match self {
            Self::Available => "capacity available".to_string(),
            Self::MemoryPressure { usage, threshold } => format!(
                "memory usage {:.1}% exceeds {:.1}%",
                usage * 100.0,
                threshold * 100.0
            ),
            Self::LowDisk {
                available_bytes,
                required_bytes,
            } => format!(
                "{} bytes free on output volume, {} required",
                available_bytes, required_bytes
            ),
        }
    }
}

/// Stateless capacity check consulted before admitting work.
#[derive(Clone)]
pub struct ResourceGuard {
    probe: Arc<dyn CapacityProbe>,
    memory_threshold: f64,
    min_free_disk_bytes: Option<u64>,
    output_dir: PathBuf,
}

impl ResourceGuard {
    pub fn new(
        probe: Arc<dyn CapacityProbe>,
        memory_threshold: f64,
        min_free_disk_bytes: Option<u64>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            probe,
            memory_threshold,
            min_free_disk_bytes,
            output_dir: output_dir.into(),
        }
    }

    /// Guard over the running host.
    pub fn system(
        memory_threshold: f64,
        min_free_disk_bytes: Option<u64>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self::new(
            Arc::new(SystemProbe::new()),
            memory_threshold,
            min_free_disk_bytes,
            output_dir,
        )
    }

    pub fn check(&self) -> CapacityStatus {
        match self.probe.memory_usage() {
            Some(usage) if usage > self.memory_threshold => {
                warn!(
                    usage,
                    threshold = self.memory_threshold,
                    "Memory pressure"
                );
                return CapacityStatus::MemoryPressure {
                    usage,
                    threshold: self.memory_threshold,
                };
            }
            Some(usage) => debug!(usage, "Memory usage OK"),
            None => debug!("Memory usage unknown, assuming capacity"),
        }

        if let Some(required) = self.min_free_disk_bytes.filter(|r| *r > 0) {
            match self.probe.available_disk_bytes(&self.output_dir) {
                Some(available) if available < required => {
                    warn!(
                        available_bytes = available,
                        required_bytes = required,
                        "Insufficient disk space"
                    );
                    return CapacityStatus::LowDisk {
                        available_bytes: available,
                        required_bytes: required,
                    };
                }
                Some(_) => {}
                None => warn!(
                    path = %self.output_dir.display(),
                    "Could not determine disk space"
                ),
            }
        }

        CapacityStatus::Available
    }

    pub fn has_capacity(&self) -> bool {
        self.check().is_available()
    }
}
