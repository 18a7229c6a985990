//! Managed memory budget for pooled GPU resources
//!
//! Tracks the estimated bytes held by the resource pool against a configured
//! maximum. The budget is advisory: it tells the pool when to evict, it never
//! refuses an allocation by itself.

/// Memory budget manager
#[derive(Clone, Copy, Debug)]
pub struct MemoryBudget {
    /// Maximum managed memory (bytes)
    max_bytes: u64,
    /// Currently used managed memory (bytes)
    used_bytes: u64,
}

impl MemoryBudget {
    /// Create a budget of `max_bytes`
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            used_bytes: 0,
        }
    }

    // --- Tracking methods ---

    pub fn add(&mut self, bytes: u64) {
        self.used_bytes = self.used_bytes.saturating_add(bytes);
    }

    pub fn remove(&mut self, bytes: u64) {
        self.used_bytes = self.used_bytes.saturating_sub(bytes);
    }

    pub fn set_max(&mut self, max_bytes: u64) {
        self.max_bytes = max_bytes;
    }

    // --- Query methods ---

    pub fn used(&self) -> u64 {
        self.used_bytes
    }

    pub fn max(&self) -> u64 {
        self.max_bytes
    }

    pub fn available(&self) -> u64 {
        self.max_bytes.saturating_sub(self.used_bytes)
    }

    /// Used / max (0.0 to 1.0+); values above 1.0 mean over budget
    pub fn pressure(&self) -> f32 {
        if self.max_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f32 / self.max_bytes as f32
    }

    // --- Decision methods ---

    /// Whether adding `bytes` would push usage past the maximum
    pub fn would_exceed(&self, bytes: u64) -> bool {
        self.used_bytes.saturating_add(bytes) > self.max_bytes
    }

    /// Bytes that must be freed before `bytes` fit
    pub fn shortfall(&self, bytes: u64) -> u64 {
        self.used_bytes.saturating_add(bytes).saturating_sub(self.max_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_budget_new() {
        let budget = MemoryBudget::new(512 * MB);
        assert_eq!(budget.used(), 0);
        assert_eq!(budget.available(), 512 * MB);
    }

    #[test]
    fn test_budget_add_remove() {
        let mut budget = MemoryBudget::new(100 * MB);
        budget.add(60 * MB);
        budget.remove(20 * MB);

        assert_eq!(budget.used(), 40 * MB);
        assert_eq!(budget.available(), 60 * MB);
    }

    #[test]
    fn test_budget_saturating_ops() {
        let mut budget = MemoryBudget::new(100);

        // Removing more than used should saturate at 0
        budget.remove(1000);
        assert_eq!(budget.used(), 0);

        budget.add(u64::MAX);
        budget.add(100);
        assert_eq!(budget.used(), u64::MAX);
    }

    #[test]
    fn test_budget_pressure() {
        let mut budget = MemoryBudget::new(100 * MB);
        assert_eq!(budget.pressure(), 0.0);

        budget.add(50 * MB);
        assert!((budget.pressure() - 0.5).abs() < 0.01);

        budget.add(60 * MB);
        assert!(budget.pressure() > 1.0);
    }

    #[test]
    fn test_budget_zero_budget_pressure() {
        let budget = MemoryBudget::new(0);
        assert_eq!(budget.pressure(), 0.0);
    }

    #[test]
    fn test_budget_would_exceed() {
        let mut budget = MemoryBudget::new(100);
        budget.add(80);

        assert!(!budget.would_exceed(20));
        assert!(budget.would_exceed(21));
        assert_eq!(budget.shortfall(30), 10);
        assert_eq!(budget.shortfall(10), 0);
    }

    #[test]
    fn test_budget_shrink_max() {
        let mut budget = MemoryBudget::new(100);
        budget.add(80);
        budget.set_max(50);

        assert_eq!(budget.available(), 0);
        assert!(budget.would_exceed(1));
        assert_eq!(budget.shortfall(0), 30);
    }
}
