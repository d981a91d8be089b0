//! Memory Accounting
//!
//! Byte counters for GPU-resident streaming data, checked against a hard
//! maximum and a softer target the streaming systems try to stay under.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Memory budget with a hard ceiling and a steady-state target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    /// Usage above this forces eviction regardless of distance
    pub max_bytes: usize,
    /// Loading stops and eviction relaxes once usage is at or below this
    pub target_bytes: usize,
}

impl MemoryBudget {
    /// Create a budget, clamping the target to the maximum
    pub fn new(max_bytes: usize, target_bytes: usize) -> Self {
        Self {
            max_bytes,
            target_bytes: target_bytes.min(max_bytes),
        }
    }

    /// Whether `used` exceeds the hard maximum
    pub fn is_over_max(&self, used: usize) -> bool {
        used > self.max_bytes
    }

    /// Whether `used` exceeds the target
    pub fn is_over_target(&self, used: usize) -> bool {
        used > self.target_bytes
    }

    /// Fraction of the maximum in use
    pub fn utilization(&self, used: usize) -> f32 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        used as f32 / self.max_bytes as f32
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            max_bytes: 512 * 1024 * 1024, // 512 MB
            target_bytes: 384 * 1024 * 1024,
        }
    }
}

/// Thread-safe allocation counters
#[derive(Debug, Default)]
pub struct MemoryStats {
    /// Bytes currently accounted
    pub allocated: AtomicUsize,
    /// High-water mark
    pub peak: AtomicUsize,
    /// Number of live allocations
    pub allocation_count: AtomicUsize,
}

impl MemoryStats {
    /// Create new memory stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    pub fn record_alloc(&self, size: usize) {
        let new_size = self.allocated.fetch_add(size, Ordering::Relaxed) + size;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(new_size, Ordering::Relaxed);
    }

    /// Record a deallocation, saturating at zero
    pub fn record_dealloc(&self, size: usize) {
        let _ = self
            .allocated
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(size)));
        let _ = self
            .allocation_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    /// Bytes currently accounted
    pub fn current(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Peak bytes accounted
    pub fn peak_usage(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }

    /// Live allocation count
    pub fn count(&self) -> usize {
        self.allocation_count.load(Ordering::Relaxed)
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.allocated.store(0, Ordering::Relaxed);
        self.peak.store(0, Ordering::Relaxed);
        self.allocation_count.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_stats() {
        let stats = MemoryStats::new();
        stats.record_alloc(100);
        stats.record_alloc(50);
        assert_eq!(stats.current(), 150);
        assert_eq!(stats.count(), 2);

        stats.record_dealloc(100);
        assert_eq!(stats.current(), 50);
        assert_eq!(stats.peak_usage(), 150);
        assert_eq!(stats.count(), 1);
    }

    #[test]
    fn test_dealloc_saturates() {
        let stats = MemoryStats::new();
        stats.record_alloc(10);
        stats.record_dealloc(20);
        assert_eq!(stats.current(), 0);
    }

    #[test]
    fn test_budget_thresholds() {
        let budget = MemoryBudget::new(1000, 800);
        assert!(!budget.is_over_target(800));
        assert!(budget.is_over_target(801));
        assert!(!budget.is_over_max(1000));
        assert!(budget.is_over_max(1001));
        assert!((budget.utilization(500) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn test_budget_clamps_target() {
        let budget = MemoryBudget::new(100, 200);
        assert_eq!(budget.target_bytes, 100);
    }
}
