//! Context-switch probe: the table-root switch.
//!
//! The probe runs from the host scheduler's switch notification, right
//! before the actual space switch and with interrupts disabled on the
//! switching CPU. The isolated-root update has to live here because the
//! switch primitive itself cannot be live-patched, nor can any of its
//! callers up to and including the scheduler core; the notification point
//! is the only hookable spot on that path.
//!
//! The probe never blocks and takes no lock. It reads the phase and the
//! space's shadow root through atomics and tolerates staleness in both:
//! reading too little means one more switch on the old behavior, which the
//! transition dispatch then flushes out.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{Ordering, fence};

use spin::RwLock;
use thiserror::Error;

use crate::{
    cpu::LogicalCpuId, host::ModuleId, percpu::TlbState, shared_data::SharedData, task::Task,
};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HookError {
    #[error("probe already registered for module {0:?}")]
    AlreadyRegistered(ModuleId),
    #[error("no probe registered for module {0:?}")]
    NotRegistered(ModuleId),
}

struct SwitchProbe {
    module: ModuleId,
    shared: Arc<SharedData>,
}

/// The host's switch notification point.
///
/// During a handover both the outgoing and the incoming installation have
/// probes registered and each switch runs the update twice against the
/// same record; the update is idempotent, so the overlap is harmless.
pub struct SchedSwitchPoint {
    probes: RwLock<Vec<SwitchProbe>>,
}

impl SchedSwitchPoint {
    pub const fn new() -> Self {
        Self {
            probes: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, module: ModuleId, shared: Arc<SharedData>) -> Result<(), HookError> {
        let mut probes = self.probes.write();
        if probes.iter().any(|p| p.module == module) {
            return Err(HookError::AlreadyRegistered(module));
        }
        probes.push(SwitchProbe { module, shared });
        Ok(())
    }

    pub fn unregister(&self, module: ModuleId) -> Result<(), HookError> {
        let mut probes = self.probes.write();
        let before = probes.len();
        probes.retain(|p| p.module != module);
        if probes.len() == before {
            return Err(HookError::NotRegistered(module));
        }
        Ok(())
    }

    pub fn probe_count(&self) -> usize {
        self.probes.read().len()
    }

    /// Fires the notification for one switch on `cpu`.
    pub fn fire(&self, cpu: LogicalCpuId, prev: &Task, next: &Task, preempt: bool) {
        for probe in self.probes.read().iter() {
            switch_update(&probe.shared, cpu, prev, next, preempt);
        }
    }
}

impl Default for SchedSwitchPoint {
    fn default() -> Self {
        Self::new()
    }
}

/// Updates this CPU's root cache for the space being switched in.
pub(crate) fn switch_update(
    shared: &SharedData,
    cpu: LogicalCpuId,
    prev: &Task,
    next: &Task,
    _preempt: bool,
) {
    let pcpu = shared.percpu().entry(cpu);

    let next_mm = next.mm();
    let user_root = next_mm.and_then(|mm| mm.user_root());
    let (next_mm, user_root) = match next_mm.zip(user_root) {
        Some(pair) if shared.is_active() => pair,
        // Mitigation down, kernel thread, or a space that never got a
        // shadow table: the plain switch owns the register and both
        // caches must read unset.
        _ => {
            pcpu.clear_roots();
            return;
        }
    };

    if prev.active_mm_id() != Some(next_mm.id()) {
        pcpu.set_roots(next_mm.kern_root(), user_root);
        return;
    }

    // Same space as before the switch, e.g. back from a kernel thread
    // that borrowed it. The first isolated entry on this CPU still has
    // to publish both roots.
    if pcpu.user_root().is_none() {
        pcpu.set_roots(next_mm.kern_root(), user_root);
        return;
    }

    // The TLB-state write must stabilize before the tracking-mask test:
    // a concurrent shootdown sender decides by that state whether this
    // CPU needs an IPI. The write is redundant with the one the plain
    // switch does right after us and doesn't harm.
    pcpu.set_tlb_state(TlbState::Ok);
    fence(Ordering::SeqCst);
    if !next_mm.cpus().contains(cpu) {
        // We have been in lazy TLB mode and dropped off the mask, so
        // flush IPIs may have passed this CPU by. Catch up on the next
        // return to user mode.
        pcpu.request_user_flush();
    }
}
