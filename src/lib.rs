//! # KPTI live-patch core
//!
//! Retrofits kernel page-table isolation (the Meltdown mitigation) into a
//! running kernel as a live patch. The kernel being patched was built with
//! no notion of split page tables, the patch cannot reboot it, and updates
//! of the patch itself must stack without ever dropping isolation; this
//! crate is the machinery that makes that work.
//!
//! # Design
//!
//! * One [`patch::MeltdownPatch`] per loaded patch module, driven through
//!   the live-patch manager's hooks (activate, pre-revert, pre-replace).
//! * All state that outlives a single installation sits in the
//!   [`shared_data::SharedData`] record: the lifecycle phase, the pristine
//!   interrupt-table snapshot, the per-CPU root caches and the shadow
//!   registry. Stacked installations find it through the host and hand the
//!   mitigation over through it.
//! * The per-CPU root switch runs from the scheduler's switch notification
//!   ([`context_switch`]); it is lock-free and tolerates stale phase
//!   reads by standing down.
//! * Everything borrowed from the host kernel is behind [`host::Host`],
//!   so the whole lifecycle runs single-threaded under test.

// Strict safety enforcement
#![deny(clippy::unwrap_used)]
#![deny(static_mut_refs)]
#![deny(unreachable_patterns)]
#![deny(unused_must_use)]
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod context_switch;
pub mod cpu;
pub mod gate;
pub mod host;
pub mod idt;
pub mod mm;
pub mod patch;
pub mod percpu;
pub mod shadow;
pub mod shared_data;
pub mod task;

#[cfg(test)]
pub(crate) mod sim;

pub use crate::{
    gate::{CpuInfo, DisableReason},
    host::{CrossCpu, DsBuffer, Host, ModuleId},
    patch::{ActivateError, InitError, MeltdownPatch},
    shared_data::{PatchState, SharedData},
};
