//! Coordination statistics.
//!
//! Counters for work dispatch and the exclusive barrier. All counters are
//! updated atomically; readers may sample them from any thread.

use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for CPU coordination.
#[derive(Debug, Default)]
pub struct CoordStats {
    /// Work items enqueued onto a vCPU queue.
    work_submitted: AtomicU64,

    /// Synchronous calls executed inline on the target's own thread.
    work_inline: AtomicU64,

    /// Work items executed by queue drains.
    work_drained: AtomicU64,

    /// Completed exclusive sections.
    exclusive_sections: AtomicU64,

    /// Times a vCPU parked in exec_start because a barrier was in progress.
    resume_waits: AtomicU64,
}

impl CoordStats {
    /// Create new zeroed statistics.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_submitted(&self) {
        self.work_submitted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_inline(&self) {
        self.work_inline.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_drained(&self) {
        self.work_drained.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_exclusive(&self) {
        self.exclusive_sections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn record_resume_wait(&self) {
        self.resume_waits.fetch_add(1, Ordering::Relaxed);
    }

    // =========================================================================
    // Getters
    // =========================================================================

    /// Work items enqueued onto vCPU queues.
    #[inline]
    pub fn work_submitted(&self) -> u64 {
        self.work_submitted.load(Ordering::Relaxed)
    }

    /// Synchronous calls that ran inline without enqueueing.
    #[inline]
    pub fn work_inline(&self) -> u64 {
        self.work_inline.load(Ordering::Relaxed)
    }

    /// Work items executed by queue drains.
    #[inline]
    pub fn work_drained(&self) -> u64 {
        self.work_drained.load(Ordering::Relaxed)
    }

    /// Completed exclusive sections.
    #[inline]
    pub fn exclusive_sections(&self) -> u64 {
        self.exclusive_sections.load(Ordering::Relaxed)
    }

    /// Times a vCPU parked at exec_start behind an in-progress barrier.
    #[inline]
    pub fn resume_waits(&self) -> u64 {
        self.resume_waits.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero.
    pub fn reset(&self) {
        self.work_submitted.store(0, Ordering::Relaxed);
        self.work_inline.store(0, Ordering::Relaxed);
        self.work_drained.store(0, Ordering::Relaxed);
        self.exclusive_sections.store(0, Ordering::Relaxed);
        self.resume_waits.store(0, Ordering::Relaxed);
    }
}

impl std::fmt::Display for CoordStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "CPU Coordination Statistics:")?;
        writeln!(f, "  Work Submitted:     {}", self.work_submitted())?;
        writeln!(f, "  Work Inline:        {}", self.work_inline())?;
        writeln!(f, "  Work Drained:       {}", self.work_drained())?;
        writeln!(f, "  Exclusive Sections: {}", self.exclusive_sections())?;
        writeln!(f, "  Resume Waits:       {}", self.resume_waits())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_start_zeroed() {
        let stats = CoordStats::new();
        assert_eq!(stats.work_submitted(), 0);
        assert_eq!(stats.work_drained(), 0);
        assert_eq!(stats.exclusive_sections(), 0);
    }

    #[test]
    fn test_stats_record_and_reset() {
        let stats = CoordStats::new();
        stats.record_submitted();
        stats.record_submitted();
        stats.record_inline();
        stats.record_exclusive();
        assert_eq!(stats.work_submitted(), 2);
        assert_eq!(stats.work_inline(), 1);
        assert_eq!(stats.exclusive_sections(), 1);

        stats.reset();
        assert_eq!(stats.work_submitted(), 0);
        assert_eq!(stats.exclusive_sections(), 0);
    }

    #[test]
    fn test_stats_display() {
        let stats = CoordStats::new();
        stats.record_drained();
        let rendered = format!("{stats}");
        assert!(rendered.contains("CPU Coordination Statistics"));
        assert!(rendered.contains("Work Drained"));
    }
}
