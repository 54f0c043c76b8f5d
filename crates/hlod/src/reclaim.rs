//! Memory reclamation policy for long bake passes.

use std::time::{Duration, Instant};

use sysinfo::System;

use crate::settings::ReclaimSettings;

/// Reports available system memory.
pub trait MemoryProbe {
    fn available_bytes(&mut self) -> Option<u64>;
}

/// Reads available memory from the operating system.
pub struct SystemMemoryProbe {
    system: System,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn available_bytes(&mut self) -> Option<u64> {
        self.system.refresh_memory();
        Some(self.system.available_memory())
    }
}

/// Never reports memory; only the interval triggers reclamation.
pub struct NoMemoryProbe;

impl MemoryProbe for NoMemoryProbe {
    fn available_bytes(&mut self) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    Interval,
    LowMemory,
}

/// Decides when the builder should drop working data.
#[derive(Debug, Clone)]
pub struct ReclaimPolicy {
    enabled: bool,
    interval: Duration,
    min_available_bytes: u64,
    last: Instant,
}

impl ReclaimPolicy {
    pub fn new(interval: Duration, min_available_bytes: u64) -> Self {
        Self {
            enabled: true,
            interval,
            min_available_bytes,
            last: Instant::now(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::MAX, 0)
        }
    }

    pub fn from_settings(settings: &ReclaimSettings) -> Self {
        if !settings.enabled {
            return Self::disabled();
        }
        Self::new(
            Duration::from_secs(settings.interval_secs),
            settings.min_available_mb.saturating_mul(1024 * 1024),
        )
    }

    /// Check once; resets the interval when it fires.
    pub fn poll(&mut self, probe: &mut dyn MemoryProbe) -> Option<ReclaimReason> {
        if !self.enabled {
            return None;
        }
        let reason = if self.last.elapsed() >= self.interval {
            Some(ReclaimReason::Interval)
        } else {
            match probe.available_bytes() {
                Some(available) if available < self.min_available_bytes => {
                    Some(ReclaimReason::LowMemory)
                }
                _ => None,
            }
        };
        if reason.is_some() {
            self.last = Instant::now();
        }
        reason
    }
}
