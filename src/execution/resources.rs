//! Resource limits for stage containers.

use serde::{Deserialize, Serialize};

/// Resource limits applied to one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Memory limit in megabytes.
    pub memory_mb: u64,
    /// CPU cores available (e.g., 0.5, 1.0, 2.0).
    pub cpu_cores: f64,
    /// Maximum number of processes allowed.
    pub max_processes: u64,
    /// Shared memory size in megabytes. Model inference uses it for data loaders.
    pub shm_mb: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            memory_mb: 32 * 1024,
            cpu_cores: 8.0,
            max_processes: 4096,
            shm_mb: 2048,
        }
    }
}

impl ExecutionLimits {
    pub fn new(memory_mb: u64, cpu_cores: f64, max_processes: u64) -> Self {
        Self {
            memory_mb,
            cpu_cores,
            max_processes,
            ..Self::default()
        }
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota based on cores allocated.
    ///
    /// quota = period * cores, so 1.0 core = 100000.
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }

    pub fn shm_bytes(&self) -> i64 {
        (self.shm_mb * 1024 * 1024) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits_fit_model_inference() {
        let limits = ExecutionLimits::default();
        assert_eq!(limits.memory_mb, 32768);
        assert_eq!(limits.cpu_cores, 8.0);
        assert_eq!(limits.max_processes, 4096);
    }

    #[test]
    fn test_memory_bytes_conversion() {
        let limits = ExecutionLimits::new(512, 1.0, 100);
        assert_eq!(limits.memory_bytes(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_cpu_quota_calculation() {
        let limits = ExecutionLimits::new(512, 2.0, 100);
        assert_eq!(limits.cpu_period(), 100_000);
        assert_eq!(limits.cpu_quota(), 200_000);

        let half = ExecutionLimits::new(512, 0.5, 100);
        assert_eq!(half.cpu_quota(), 50_000);
    }

    #[test]
    fn test_new_keeps_default_shm() {
        let limits = ExecutionLimits::new(4096, 4.0, 500);
        assert_eq!(limits.shm_mb, ExecutionLimits::default().shm_mb);
        assert_eq!(limits.shm_bytes(), 2048 * 1024 * 1024);
    }
}
