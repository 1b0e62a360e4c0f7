//! Memory reclamation bookkeeping.
//!
//! Reclamation passes are advisory: they ask the interpreter to drop
//! unreachable objects and never touch session bindings. The counter is
//! process-wide and only feeds the health probe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::trace;

/// Why a reclamation pass ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    /// Unconditional pass at the end of every execution.
    AfterExecution,
    /// Extra pass after a `MemoryError`.
    MemoryExhausted,
    /// Session interpreter is being dropped.
    SessionTeardown,
}

/// Process-wide reclamation counter, shared by every session.
#[derive(Debug, Clone, Default)]
pub struct Reclaimer {
    passes: Arc<AtomicU64>,
}

impl Reclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note that a pass ran.
    pub fn record(&self, reason: ReclaimReason) {
        let total = self.passes.fetch_add(1, Ordering::Relaxed) + 1;
        trace!(?reason, total, "Reclamation pass");
    }

    pub fn passes(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    /// Current memory figures for the health probe.
    pub fn snapshot(&self) -> MemoryStats {
        MemoryStats {
            resident_bytes: resident_memory_bytes(),
            reclamation_passes: self.passes(),
        }
    }
}

/// Raw memory counters reported by `/health`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MemoryStats {
    /// Resident set size, when the platform exposes it.
    pub resident_bytes: Option<u64>,
    pub reclamation_passes: u64,
}

/// Resident set size of this process, read from `/proc/self/status`.
pub fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut fields = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = fields.next()?.parse().ok()?;
    match fields.next() {
        Some("kB") | None => Some(value * 1024),
        Some(_) => None,
    }
}
