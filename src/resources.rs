//! Accelerator memory accounting and scoped cache discipline.
//!
//! Accelerator memory is the one contended resource in the pipeline. Every
//! mode-selection and fallback decision reads it through a single
//! [`ResourceGuard`], which wraps a [`DeviceMemory`] implementation supplied
//! by whoever owns the accelerator runtime (usually the model backend).
//!
//! The discipline is "clear-before, clear-after, clear-every-N-steps":
//! [`ResourceGuard::acquire`] returns a [`GuardScope`] that clears the cache
//! on entry and again when it is dropped, including on early return via `?`
//! or on panic unwinding.
//!
//! A process without an accelerator is a valid configuration, not an error:
//! [`HostOnly`] reports no device and every cache operation is a no-op.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Bytes per GB as reported in snapshots (decimal, matching device tooling).
pub const BYTES_PER_GB: f64 = 1e9;

/// Resource-accounting interface over an accelerator's memory allocator.
///
/// Implementations must be cheap to query; the pipeline reads these values
/// before every encode.
pub trait DeviceMemory: Send + Sync {
    /// Human-readable device name, or `None` when there is no accelerator.
    fn device_name(&self) -> Option<String>;

    /// Bytes currently held by live tensors.
    fn allocated_bytes(&self) -> u64;

    /// Bytes reserved by the caching allocator (allocated + cached).
    fn reserved_bytes(&self) -> u64;

    /// `(free, total)` bytes as reported by the driver.
    fn mem_info(&self) -> (u64, u64);

    /// Release cached, unused blocks back to the driver.
    fn empty_cache(&self);
}

/// A [`DeviceMemory`] for hosts without an accelerator.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostOnly;

impl DeviceMemory for HostOnly {
    fn device_name(&self) -> Option<String> {
        None
    }

    fn allocated_bytes(&self) -> u64 {
        0
    }

    fn reserved_bytes(&self) -> u64 {
        0
    }

    fn mem_info(&self) -> (u64, u64) {
        (0, 0)
    }

    fn empty_cache(&self) {}
}

/// Point-in-time accelerator memory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MemoryStats {
    /// An accelerator is present.
    Available {
        device_name: String,
        allocated_gb: f64,
        reserved_gb: f64,
        free_gb: f64,
        total_gb: f64,
        /// `allocated / reserved * 100`, or 0 when nothing is reserved.
        usage_percent: f64,
    },
    /// No accelerator; callers treat this as a normal state.
    NoAccelerator,
}

impl MemoryStats {
    pub fn is_available(&self) -> bool {
        matches!(self, MemoryStats::Available { .. })
    }

    pub fn allocated_gb(&self) -> f64 {
        match self {
            MemoryStats::Available { allocated_gb, .. } => *allocated_gb,
            MemoryStats::NoAccelerator => 0.0,
        }
    }

    pub fn free_gb(&self) -> f64 {
        match self {
            MemoryStats::Available { free_gb, .. } => *free_gb,
            MemoryStats::NoAccelerator => 0.0,
        }
    }
}

impl fmt::Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryStats::Available {
                device_name,
                allocated_gb,
                reserved_gb,
                free_gb,
                total_gb,
                usage_percent,
            } => write!(
                f,
                "{device_name}: allocated {allocated_gb:.2}GB, reserved {reserved_gb:.2}GB, \
                 free {free_gb:.2}GB / {total_gb:.2}GB ({usage_percent:.1}%)"
            ),
            MemoryStats::NoAccelerator => f.write_str("No GPU available"),
        }
    }
}

/// Single entry point for accelerator memory decisions.
///
/// Cloning is cheap: clones share the same [`DeviceMemory`].
#[derive(Clone)]
pub struct ResourceGuard {
    device: Arc<dyn DeviceMemory>,
    threshold_percent: f64,
    critical_ratio: f64,
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("device", &self.device.device_name())
            .field("threshold_percent", &self.threshold_percent)
            .field("critical_ratio", &self.critical_ratio)
            .finish()
    }
}

impl ResourceGuard {
    /// Default threshold for [`ResourceGuard::check_threshold`].
    pub const DEFAULT_THRESHOLD_PERCENT: f64 = 90.0;
    /// Allocated/reserved ratio above which memory counts as critical.
    pub const DEFAULT_CRITICAL_RATIO: f64 = 0.9;

    pub fn new(device: Arc<dyn DeviceMemory>) -> Self {
        Self {
            device,
            threshold_percent: Self::DEFAULT_THRESHOLD_PERCENT,
            critical_ratio: Self::DEFAULT_CRITICAL_RATIO,
        }
    }

    /// Guard over a host without an accelerator.
    pub fn host_only() -> Self {
        Self::new(Arc::new(HostOnly))
    }

    pub fn with_threshold_percent(mut self, percent: f64) -> Self {
        self.threshold_percent = percent.clamp(0.0, 100.0);
        self
    }

    pub fn with_critical_ratio(mut self, ratio: f64) -> Self {
        self.critical_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn has_accelerator(&self) -> bool {
        self.device.device_name().is_some()
    }

    /// Enter a guarded scope: clear stale cache and record a baseline.
    ///
    /// The returned [`GuardScope`] clears the cache again and logs the
    /// allocation delta when it is dropped or [released](GuardScope::release).
    pub fn acquire(&self, label: &'static str) -> GuardScope<'_> {
        let baseline = if self.has_accelerator() {
            self.device.empty_cache();
            let allocated = self.device.allocated_bytes();
            debug!(
                "ResourceGuard[{}]: cleared cache, baseline {:.2}GB",
                label,
                allocated as f64 / BYTES_PER_GB
            );
            Some(allocated)
        } else {
            None
        };

        GuardScope {
            guard: self,
            label,
            baseline,
            released: false,
        }
    }

    /// Clear the cache when `allocated / reserved` exceeds `threshold_percent`.
    ///
    /// Returns whether a clear happened. Safe to call repeatedly.
    pub fn check_and_clear(&self, threshold_percent: f64) -> bool {
        if !self.has_accelerator() {
            return false;
        }
        let reserved = self.device.reserved_bytes();
        if reserved == 0 {
            return false;
        }
        let usage_percent = self.device.allocated_bytes() as f64 / reserved as f64 * 100.0;
        if usage_percent > threshold_percent {
            self.device.empty_cache();
            info!(
                "Memory threshold exceeded ({:.1}%), cleared cache",
                usage_percent
            );
            true
        } else {
            false
        }
    }

    /// [`check_and_clear`](Self::check_and_clear) at the configured threshold.
    pub fn check_threshold(&self) -> bool {
        self.check_and_clear(self.threshold_percent)
    }

    /// Snapshot current memory, or [`MemoryStats::NoAccelerator`].
    pub fn memory_stats(&self) -> MemoryStats {
        let Some(device_name) = self.device.device_name() else {
            return MemoryStats::NoAccelerator;
        };
        let allocated = self.device.allocated_bytes();
        let reserved = self.device.reserved_bytes();
        let (free, total) = self.device.mem_info();
        MemoryStats::Available {
            device_name,
            allocated_gb: allocated as f64 / BYTES_PER_GB,
            reserved_gb: reserved as f64 / BYTES_PER_GB,
            free_gb: free as f64 / BYTES_PER_GB,
            total_gb: total as f64 / BYTES_PER_GB,
            usage_percent: if reserved > 0 {
                allocated as f64 / reserved as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Clear the cache unconditionally (logged at debug level).
    pub fn clear_cache(&self) {
        if self.has_accelerator() {
            self.device.empty_cache();
            debug!("Cleared accelerator cache");
        }
    }

    /// Clear the cache unconditionally (logged at info level).
    pub fn force_clear_cache(&self) {
        if self.has_accelerator() {
            self.device.empty_cache();
            info!("Forced accelerator cache clear");
        }
    }

    /// Free accelerator memory in GB; 0 without an accelerator.
    pub fn free_gb(&self) -> f64 {
        if !self.has_accelerator() {
            return 0.0;
        }
        self.device.mem_info().0 as f64 / BYTES_PER_GB
    }

    /// `allocated / reserved`, or 0 when nothing is reserved.
    pub fn usage_ratio(&self) -> f64 {
        if !self.has_accelerator() {
            return 0.0;
        }
        let reserved = self.device.reserved_bytes();
        if reserved == 0 {
            return 0.0;
        }
        self.device.allocated_bytes() as f64 / reserved as f64
    }

    /// True when the caching allocator is nearly full of live tensors.
    pub fn is_critical(&self) -> bool {
        self.usage_ratio() > self.critical_ratio
    }

    /// True when free accelerator memory is below `threshold_gb`.
    /// Always false without an accelerator.
    pub fn is_memory_critical(&self, threshold_gb: f64) -> bool {
        self.has_accelerator() && self.free_gb() < threshold_gb
    }
}

/// RAII scope returned by [`ResourceGuard::acquire`].
#[must_use = "the scope clears the cache when dropped; bind it to a variable"]
pub struct GuardScope<'a> {
    guard: &'a ResourceGuard,
    label: &'static str,
    baseline: Option<u64>,
    released: bool,
}

impl GuardScope<'_> {
    /// Leave the scope now; returns the allocation delta in GB.
    pub fn release(mut self) -> Option<f64> {
        self.finish()
    }

    fn finish(&mut self) -> Option<f64> {
        if self.released {
            return None;
        }
        self.released = true;
        let baseline = self.baseline?;
        let device = &self.guard.device;
        let final_bytes = device.allocated_bytes();
        device.empty_cache();
        let delta = (final_bytes as f64 - baseline as f64) / BYTES_PER_GB;
        debug!(
            "ResourceGuard[{}]: cleared cache, memory delta {:+.2}GB",
            self.label, delta
        );
        Some(delta)
    }
}

impl Drop for GuardScope<'_> {
    fn drop(&mut self) {
        self.finish();
    }
}
