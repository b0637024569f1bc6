use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mm::{AddrSpace, AddrSpaceId, PAGE_SIZE};

/// A unique task identifier, never reused.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct TaskId(usize);

static NEXT_TASK_ID: AtomicUsize = AtomicUsize::new(1);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Extent of a task's privileged stack. Activation maps every live task's
/// stack into the shared kernel side of the shadow tables so entry code can
/// run before the root switch back to the full tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelStack {
    pub base: usize,
    pub size: usize,
}

pub const KERNEL_STACK_SIZE: usize = 4 * PAGE_SIZE;

const KERNEL_STACK_BASE: usize = 0xffff_c000_0000;

/// A schedulable task as the switch path sees it.
///
/// `mm` is `None` for kernel threads. `active_mm_id` mirrors the host
/// scheduler's borrowed-space bookkeeping: for a user task it is the id of
/// its own space, for a kernel thread the id of whichever space it
/// borrowed, zero if none yet. Only ever compared, never dereferenced, so
/// an id is enough.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    kstack: KernelStack,
    mm: Option<Arc<AddrSpace>>,
    active_mm_id: AtomicUsize,
}

impl Task {
    pub fn new(mm: Option<Arc<AddrSpace>>) -> Self {
        let id = TaskId::next();
        let kstack = KernelStack {
            base: KERNEL_STACK_BASE + id.get() * KERNEL_STACK_SIZE,
            size: KERNEL_STACK_SIZE,
        };
        Self {
            id,
            kstack,
            mm,
            active_mm_id: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }
    pub fn kstack(&self) -> KernelStack {
        self.kstack
    }
    pub fn mm(&self) -> Option<&Arc<AddrSpace>> {
        self.mm.as_ref()
    }

    pub fn active_mm_id(&self) -> Option<AddrSpaceId> {
        // Maintained and read on the owning CPU; cross-CPU readers only
        // appear in tests.
        match self.active_mm_id.load(Ordering::Relaxed) {
            0 => None,
            raw => AddrSpaceId::from_raw(raw),
        }
    }

    /// Records which space this task currently runs on. Called by the host
    /// scheduler's switch tail, after the point probes have run.
    pub fn attach_active_mm(&self, mm: Option<&Arc<AddrSpace>>) {
        let raw = mm.map_or(0, |mm| mm.id().get());
        self.active_mm_id.store(raw, Ordering::Relaxed);
    }
}
