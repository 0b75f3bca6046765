//! Per-core and process-wide counters (spec §3 "Statistics", §6).
//!
//! Each core owns and mutates only its own [`CoreStats`] (spec §5: "Write-
//! owned per core; read-only snapshots gathered by a supervisory thread. No
//! atomics required on the write path"); [`GlobalStats`] covers the handful
//! of counters that are process-wide rather than per-core (backlog/reset
//! enqueue failures that occur outside any one core's step).

/// Counters owned by a single [`crate::core::EmulationCore`].
#[derive(Debug, Default, Clone)]
pub struct CoreStats {
    pub admitted: u64,
    pub dropped: u64,
    pub marked: u64,
    pub pushed: u64,
    pub pulled: u64,
    pub alloc_failed: u64,
    pub wait_for_admitted_enqueue: u64,
    pub admitted_alloc_failed: u64,
}

/// Process-wide counters not owned by any single core.
#[derive(Debug, Default, Clone)]
pub struct GlobalStats {
    pub packet_alloc_failed: u64,
    pub backlog_enqueue_failed: u64,
    pub reset_enqueue_failed: u64,
}

/// A read-only snapshot taken by a supervisory thread for periodic
/// reporting; never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    pub per_core: Vec<CoreStats>,
    pub global: GlobalStats,
}

impl StatsSnapshot {
    /// Render the human-readable report named in spec §6 ("Format is
    /// human-readable text; no machine protocol").
    pub fn report(&self) -> String {
        let mut out = String::new();
        for (i, core) in self.per_core.iter().enumerate() {
            out.push_str(&format!(
                "core {i}: admit={} drop={} mark={} pushed={} pulled={} alloc_fail={} wait_for_admitted={}\n",
                core.admitted,
                core.dropped,
                core.marked,
                core.pushed,
                core.pulled,
                core.alloc_failed,
                core.wait_for_admitted_enqueue,
            ));
        }
        out.push_str(&format!(
            "global: packet_alloc_failed={} backlog_enqueue_failed={} reset_enqueue_failed={}\n",
            self.global.packet_alloc_failed,
            self.global.backlog_enqueue_failed,
            self.global.reset_enqueue_failed,
        ));
        out
    }
}
