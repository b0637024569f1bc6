//! Consumed host-kernel primitives.
//!
//! A live patch ships no kernel of its own; everything it borrows from the
//! running host is collected behind one environment object. That keeps the
//! seam explicit: on a real machine these are the IDT register, the frame
//! allocator, the task list, the perf debug-store buffers and
//! `schedule_on_each_cpu`; under test they are plain objects driven from a
//! single thread.

use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};

use slab::Slab;
use spin::{Mutex, Once};
use thiserror::Error;

use crate::{
    context_switch::SchedSwitchPoint,
    cpu::{LogicalCpuId, MAX_CPU_COUNT},
    gate::CpuInfo,
    idt::IdtImage,
    mm::{PAGE_SIZE, TableRoot},
    shared_data::SharedData,
    task::{Task, TaskId},
};

/// Identity the live-patch manager assigns to one loaded patch module.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct ModuleId(usize);

static NEXT_MODULE_ID: AtomicUsize = AtomicUsize::new(1);

impl ModuleId {
    pub fn next() -> Self {
        Self(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }
    pub const fn get(self) -> usize {
        self.0
    }
}

/// Synchronous cross-CPU dispatch, the `schedule_on_each_cpu` of the host.
///
/// Contract: the callback runs once on every online CPU and the call
/// returns only after all runs completed. The round trip orders all memory
/// operations before the call with all operations after it on every CPU,
/// which is exactly what phase transitions lean on. Implementations must
/// not be invoked with any patch lock held; the callback may run for a
/// while and CPUs may block on each other.
pub trait CrossCpu: Send + Sync {
    fn run_on_each(&self, f: &mut (dyn FnMut(LogicalCpuId) + Send));
}

/// A frame handed out by the shadow arena.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub struct FrameId(usize);

impl FrameId {
    pub const fn get(self) -> usize {
        self.0
    }
    #[cfg(test)]
    pub(crate) const fn synthetic(raw: usize) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("frame {0:?} is not allocated")]
    NotAllocated(FrameId),
    #[error("frame {0:?} still has live users")]
    Busy(FrameId),
}

const SHADOW_FRAME_BASE: usize = 0x9000_0000;

pub const DEFAULT_FRAME_CAPACITY: usize = 1024;

/// Arena backing shadow top-level tables and shadow page-table pages.
///
/// Capacity-limited so activation can genuinely run out of memory, and
/// counted so teardown can prove it returned everything.
#[derive(Debug)]
pub struct FrameAlloc {
    frames: Mutex<Slab<()>>,
    capacity: usize,
    total: AtomicUsize,
    #[cfg(test)]
    fail_release: core::sync::atomic::AtomicBool,
}

impl FrameAlloc {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(Slab::new()),
            capacity,
            total: AtomicUsize::new(0),
            #[cfg(test)]
            fail_release: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn alloc(&self) -> Option<FrameId> {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            return None;
        }
        let key = frames.insert(());
        self.total.fetch_add(1, Ordering::Relaxed);
        Some(FrameId(key))
    }

    pub fn release(&self, frame: FrameId) -> Result<(), ReleaseError> {
        #[cfg(test)]
        if self.fail_release.load(Ordering::Relaxed) {
            return Err(ReleaseError::Busy(frame));
        }
        match self.frames.lock().try_remove(frame.0) {
            Some(()) => Ok(()),
            None => Err(ReleaseError::NotAllocated(frame)),
        }
    }

    /// Root value entry stubs would load for a table living in `frame`.
    pub fn root_of(&self, frame: FrameId) -> TableRoot {
        // Slab keys start at 0; offset by one page to keep roots nonzero.
        let addr = SHADOW_FRAME_BASE + (frame.0 + 1) * PAGE_SIZE;
        TableRoot::from_raw(addr).unwrap_or_else(|| unreachable!("nonzero by construction"))
    }

    /// Frames currently allocated.
    pub fn outstanding(&self) -> usize {
        self.frames.lock().len()
    }

    /// Cumulative allocations over the arena's lifetime.
    pub fn total_allocs(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    /// Makes every subsequent release fail, modeling a frame the host still
    /// holds a reference to.
    #[cfg(test)]
    pub(crate) fn inject_release_failure(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::Relaxed);
    }
}

/// An Intel debug-store buffer area registered by the host's perf layer.
/// These are touched from NMI context, so they must be reachable from the
/// shadow tables as well.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DsBuffer {
    pub base: usize,
    pub size: usize,
}

/// The host environment one or more installations run against.
pub struct Host {
    cpu_count: u32,
    info: CpuInfo,
    cross: Box<dyn CrossCpu>,
    /// Per-CPU IDT register: which table the CPU currently uses.
    idtr: Box<[Mutex<Arc<IdtImage>>]>,
    frames: FrameAlloc,
    tasks: Mutex<Vec<Arc<Task>>>,
    ds_buffers: Mutex<Vec<DsBuffer>>,
    sched_switch: SchedSwitchPoint,
    /// Stable slot through which every installation reaches the one shared
    /// record. Survives unload/reload of individual installations.
    shared: Once<Arc<SharedData>>,
}

impl Host {
    pub fn new(cpu_count: u32, info: CpuInfo, cross: Box<dyn CrossCpu>) -> Arc<Self> {
        Self::with_frame_capacity(cpu_count, info, cross, DEFAULT_FRAME_CAPACITY)
    }

    pub fn with_frame_capacity(
        cpu_count: u32,
        info: CpuInfo,
        cross: Box<dyn CrossCpu>,
        frame_capacity: usize,
    ) -> Arc<Self> {
        assert!(cpu_count >= 1 && cpu_count <= MAX_CPU_COUNT);
        let boot = Arc::new(IdtImage::boot());
        let idtr: Vec<Mutex<Arc<IdtImage>>> =
            (0..cpu_count).map(|_| Mutex::new(boot.clone())).collect();
        Arc::new(Self {
            cpu_count,
            info,
            cross,
            idtr: idtr.into_boxed_slice(),
            frames: FrameAlloc::new(frame_capacity),
            tasks: Mutex::new(Vec::new()),
            ds_buffers: Mutex::new(Vec::new()),
            sched_switch: SchedSwitchPoint::new(),
            shared: Once::new(),
        })
    }

    pub fn cpu_count(&self) -> u32 {
        self.cpu_count
    }
    pub fn cpu_info(&self) -> &CpuInfo {
        &self.info
    }
    pub fn frames(&self) -> &FrameAlloc {
        &self.frames
    }
    pub fn sched_switch(&self) -> &SchedSwitchPoint {
        &self.sched_switch
    }

    pub fn run_on_each(&self, f: &mut (dyn FnMut(LogicalCpuId) + Send)) {
        self.cross.run_on_each(f);
    }

    /// Loads `image` into `cpu`'s IDT register slot.
    pub fn load_idt(&self, cpu: LogicalCpuId, image: Arc<IdtImage>) {
        *self.idtr[cpu.get() as usize].lock() = image;
    }

    pub fn idt_image(&self, cpu: LogicalCpuId) -> Arc<IdtImage> {
        self.idtr[cpu.get() as usize].lock().clone()
    }

    pub fn idt_bytes(&self, cpu: LogicalCpuId) -> Vec<u8> {
        self.idtr[cpu.get() as usize].lock().as_bytes().to_vec()
    }

    pub fn add_task(&self, task: Arc<Task>) {
        self.tasks.lock().push(task);
    }

    pub fn remove_task(&self, id: TaskId) {
        self.tasks.lock().retain(|task| task.id() != id);
    }

    /// Snapshot of the live task list.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.tasks.lock().clone()
    }

    pub fn add_ds_buffer(&self, buffer: DsBuffer) {
        self.ds_buffers.lock().push(buffer);
    }

    pub fn ds_buffers(&self) -> Vec<DsBuffer> {
        self.ds_buffers.lock().clone()
    }

    pub(crate) fn shared_slot(&self) -> &Once<Arc<SharedData>> {
        &self.shared
    }

    /// The shared record, if any installation ever attached one.
    pub fn shared(&self) -> Option<&Arc<SharedData>> {
        self.shared.get()
    }
}

impl core::fmt::Debug for Host {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Host")
            .field("cpu_count", &self.cpu_count)
            .field("info", &self.info)
            .field("outstanding_frames", &self.frames.outstanding())
            .finish_non_exhaustive()
    }
}
