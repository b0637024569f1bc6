//! Single-threaded SMP harness for tests.
//!
//! Drives the crate the way a running kernel would: a [`Machine`] owns a
//! [`Host`] plus per-CPU scheduler slots and performs context switches,
//! including the `active_mm` borrowing that kernel threads do and the
//! tracking-mask maintenance of the real switch tail. Cross-CPU dispatch
//! runs the callback on each CPU in turn from the calling thread, fenced
//! like the real primitive.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{Ordering, fence};

use spin::Mutex;

use crate::{
    cpu::LogicalCpuId,
    gate::{CpuInfo, CpuVendor, HypervisorKind},
    host::{CrossCpu, Host},
    mm::{AddrSpace, TableRoot},
    percpu::TlbState,
    shadow::MapError,
    shared_data::SharedData,
    task::Task,
};

fn intel_info() -> CpuInfo {
    CpuInfo {
        vendor: CpuVendor::Intel,
        hypervisor: HypervisorKind::None,
        pcid: true,
    }
}

/// In-order dispatch: runs the callback on every CPU from the calling
/// thread, with the full fences the real primitive implies.
pub(crate) struct SimDispatch {
    cpus: u32,
}

impl SimDispatch {
    pub(crate) fn new(cpus: u32) -> Self {
        Self { cpus }
    }
}

impl CrossCpu for SimDispatch {
    fn run_on_each(&self, f: &mut (dyn FnMut(LogicalCpuId) + Send)) {
        fence(Ordering::SeqCst);
        for cpu in 0..self.cpus {
            f(LogicalCpuId::new(cpu));
        }
        fence(Ordering::SeqCst);
    }
}

type Hook = Box<dyn FnMut(LogicalCpuId) + Send>;

/// Dispatch that runs an injected hook after each per-CPU callback, for
/// racing context switches against a transition in flight.
pub(crate) struct HookedDispatch {
    cpus: u32,
    hook: Mutex<Option<Hook>>,
}

impl HookedDispatch {
    pub(crate) fn new(cpus: u32) -> Self {
        Self {
            cpus,
            hook: Mutex::new(None),
        }
    }

    pub(crate) fn set_hook(&self, hook: impl FnMut(LogicalCpuId) + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub(crate) fn clear_hook(&self) {
        *self.hook.lock() = None;
    }
}

impl CrossCpu for Arc<HookedDispatch> {
    fn run_on_each(&self, f: &mut (dyn FnMut(LogicalCpuId) + Send)) {
        fence(Ordering::SeqCst);
        for cpu in 0..self.cpus {
            let cpu = LogicalCpuId::new(cpu);
            f(cpu);
            if let Some(hook) = self.hook.lock().as_mut() {
                hook(cpu);
            }
        }
        fence(Ordering::SeqCst);
    }
}

pub(crate) fn host(cpus: u32) -> Arc<Host> {
    Host::new(cpus, intel_info(), Box::new(SimDispatch::new(cpus)))
}

pub(crate) fn host_with_frames(cpus: u32, frames: usize) -> Arc<Host> {
    Host::with_frame_capacity(cpus, intel_info(), Box::new(SimDispatch::new(cpus)), frames)
}

pub(crate) fn host_with_info(cpus: u32, info: CpuInfo) -> Arc<Host> {
    Host::new(cpus, info, Box::new(SimDispatch::new(cpus)))
}

struct CpuSlot {
    current: Arc<Task>,
    /// Space a running kernel thread borrowed from its predecessor.
    borrowed: Option<Arc<AddrSpace>>,
}

/// A simulated machine: host plus scheduler state.
pub(crate) struct Machine {
    host: Arc<Host>,
    slots: Vec<CpuSlot>,
}

impl Machine {
    pub(crate) fn new(cpus: u32) -> Self {
        Self::from_host(host(cpus))
    }

    pub(crate) fn with_frames(cpus: u32, frames: usize) -> Self {
        Self::from_host(host_with_frames(cpus, frames))
    }

    pub(crate) fn with_hooked_dispatch(cpus: u32) -> (Self, Arc<HookedDispatch>) {
        let dispatch = Arc::new(HookedDispatch::new(cpus));
        let host = Host::new(cpus, intel_info(), Box::new(dispatch.clone()));
        (Self::from_host(host), dispatch)
    }

    fn from_host(host: Arc<Host>) -> Self {
        // One idle kernel task per CPU; they are real tasks with real
        // stacks as far as the mapping walk is concerned.
        let slots = (0..host.cpu_count())
            .map(|_| {
                let idle = Arc::new(Task::new(None));
                host.add_task(idle.clone());
                CpuSlot {
                    current: idle,
                    borrowed: None,
                }
            })
            .collect();
        Self { host, slots }
    }

    pub(crate) fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub(crate) fn shared(&self) -> Arc<SharedData> {
        self.host
            .shared()
            .expect("no shared record attached")
            .clone()
    }

    pub(crate) fn spawn_user(&self) -> Arc<Task> {
        let mm = Arc::new(AddrSpace::new());
        let task = Arc::new(Task::new(Some(mm)));
        self.host.add_task(task.clone());
        task
    }

    pub(crate) fn spawn_kernel(&self) -> Arc<Task> {
        let task = Arc::new(Task::new(None));
        self.host.add_task(task.clone());
        task
    }

    /// Builds the shadow table for a user task's space, as the host's
    /// process-creation path would.
    pub(crate) fn install_shadow(&self, task: &Arc<Task>) -> Result<TableRoot, MapError> {
        let mm = task.mm().expect("task has no address space");
        self.shared().install_shadow(&self.host, mm)
    }

    /// Context-switches `cpu` to `next`: fires the switch notification,
    /// then performs the plain switch tail (tracking mask and `active_mm`
    /// maintenance).
    pub(crate) fn switch_to(&mut self, cpu: LogicalCpuId, next: &Arc<Task>) {
        let slot = &mut self.slots[cpu.get() as usize];
        let prev = slot.current.clone();

        self.host.sched_switch().fire(cpu, &prev, next, false);

        match next.mm() {
            Some(mm) => {
                mm.cpus().atomic_set(cpu);
                if let Some(prev_mm) = prev.mm() {
                    if !Arc::ptr_eq(prev_mm, mm) {
                        prev_mm.cpus().atomic_clear(cpu);
                    }
                }
                next.attach_active_mm(Some(mm));
                slot.borrowed = None;
                if let Some(shared) = self.host.shared() {
                    shared.percpu().entry(cpu).set_tlb_state(TlbState::Ok);
                }
            }
            None => {
                // Kernel thread: borrow whatever space was live and drop
                // to lazy TLB tracking.
                let borrowed = prev.mm().cloned().or_else(|| slot.borrowed.clone());
                next.attach_active_mm(borrowed.as_ref());
                slot.borrowed = borrowed;
                if let Some(shared) = self.host.shared() {
                    shared.percpu().entry(cpu).set_tlb_state(TlbState::Lazy);
                }
            }
        }
        slot.current = next.clone();
    }

    /// Lazy-TLB departure: a shootdown round noticed `cpu` idling on a
    /// borrowed space and dropped it from the tracking mask. Flush IPIs
    /// will pass this CPU by from here on.
    pub(crate) fn leave_mm(&mut self, cpu: LogicalCpuId) {
        let slot = &mut self.slots[cpu.get() as usize];
        let space = slot.current.mm().cloned().or_else(|| slot.borrowed.clone());
        if let Some(mm) = space {
            mm.cpus().atomic_clear(cpu);
        }
    }
}
