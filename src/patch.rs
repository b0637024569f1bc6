//! Patch lifecycle.
//!
//! One [`MeltdownPatch`] value is one loaded installation of the
//! mitigation. The live-patch manager drives it through the module hooks:
//! [`init`](MeltdownPatch::init) at load,
//! [`on_activate`](MeltdownPatch::on_activate) once the function patches
//! have landed, [`on_pre_deactivate`](MeltdownPatch::on_pre_deactivate)
//! before a revert, [`on_pre_replace`](MeltdownPatch::on_pre_replace) when
//! another patch is about to take over, and
//! [`cleanup`](MeltdownPatch::cleanup) at unload.
//!
//! # Handover
//!
//! Stacked updates hand the mitigation over without a window where the
//! machine runs unprotected. The manager loads the successor first (its
//! `init` registers it as a patcher), then runs the predecessor's
//! `on_pre_replace`, then the successor's `on_activate`. On the clean
//! path the predecessor's shadow world stays in place; the successor only
//! swaps in its own entry tables and then starts the predecessor's drain.
//! If a revert struck in between, the record is dirty and the successor
//! rebuilds everything from scratch after resetting it.

use alloc::sync::Arc;

use log::{debug, error, warn};
use thiserror::Error;

use crate::{
    context_switch::HookError,
    cpu::LogicalCpuId,
    gate,
    host::{Host, ModuleId},
    idt::{EntryTable, IdtSnapshot},
    shadow::MapError,
    shared_data::{PatchState, RegisterError, ResetError, SharedData},
};

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to register sched switch probe: {0}")]
    Hook(#[from] HookError),
    #[error("failed to register patcher: {0}")]
    Register(#[from] RegisterError),
}

#[derive(Debug, Error)]
pub enum ActivateError {
    #[error("shared data reset failed: {0}")]
    Reset(#[from] ResetError),
    #[error("mapping thread stacks failed: {0}")]
    MapStacks(#[source] MapError),
    #[error("mapping debug-store buffers failed: {0}")]
    MapDsBuffers(#[source] MapError),
}

/// One loaded installation of the mitigation.
pub struct MeltdownPatch {
    module: ModuleId,
    host: Arc<Host>,
    /// `None` when the environment gate disabled this installation; every
    /// hook is then inert.
    shared: Option<Arc<SharedData>>,
    entry: EntryTable,
}

impl MeltdownPatch {
    /// Loads one installation against `host`.
    pub fn init(host: &Arc<Host>) -> Result<Self, InitError> {
        let module = ModuleId::next();
        let entry = EntryTable::new(module);

        if let Some(reason) = gate::check(host.cpu_info()) {
            gate::report(reason);
            return Ok(Self {
                module,
                host: host.clone(),
                shared: None,
                entry,
            });
        }

        let shared = SharedData::attach(host);
        host.sched_switch()
            .register(module, shared.clone())
            .map_err(|err| {
                error!("failed to register sched switch probe: {err}");
                err
            })?;

        {
            let mut inner = shared.lock();
            if shared.state() == PatchState::Disabled {
                shared.set_state(&mut inner, PatchState::Enabled);
            }
            if let Err(err) = inner.register_patcher(module) {
                drop(inner);
                // Unwind; this installation never went live.
                let _ = host.sched_switch().unregister(module);
                return Err(err.into());
            }
        }

        debug!("meltdown patch module {} loaded", module.get());
        Ok(Self {
            module,
            host: host.clone(),
            shared: Some(shared),
            entry,
        })
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Whether the environment gate disabled this installation at load.
    pub fn is_disabled(&self) -> bool {
        self.shared.is_none()
    }

    pub fn entry(&self) -> &EntryTable {
        &self.entry
    }

    /// Post-patch hook: bring the mitigation up, or take it over from a
    /// predecessor.
    pub fn on_activate(&self) -> Result<(), ActivateError> {
        debug!("post-patch callback");
        let Some(shared) = &self.shared else {
            return Ok(());
        };
        let host = &self.host;

        let entry_state;
        {
            let mut inner = shared.lock();
            entry_state = shared.state();
            match entry_state {
                PatchState::Disabled => return Ok(()),
                PatchState::Enabled => {
                    if inner.dirty {
                        // Unclean handover: there has been a revert
                        // between us and our predecessor.
                        if let Err(err) = shared.reset(&mut inner, host) {
                            // In theory this can't happen, c.f. the
                            // strict shadow release.
                            error!("failed to reset shared data, Meltdown unfixed: {err}");
                            return Err(err.into());
                        }
                    }
                    shared.set_state(&mut inner, PatchState::Activating);
                }
                _ => {}
            }
            // The first installer captures the pristine table for every
            // later revert to restore.
            if inner.orig_idt.is_none() {
                inner.orig_idt = Some(IdtSnapshot::capture(&host.idt_image(LogicalCpuId::BSP)));
            }
        }

        // Load the replacement table on all CPUs. The dispatch also makes
        // the state transition above visible everywhere.
        let image = self.entry.image().clone();
        let percpu = shared.percpu();
        host.run_on_each(&mut |cpu| {
            host.load_idt(cpu, image.clone());
            percpu.entry(cpu).enable_pcid();
        });

        if entry_state == PatchState::Active {
            // Clean handover: the predecessor's shadow world stays; tell
            // it to start draining now that our tables are live.
            let handle = shared.lock().prev_drain_start.take();
            match handle {
                Some(start) => start.begin(),
                None => warn!("clean handover without a predecessor drain handle"),
            }
        } else {
            shared.map_all_thread_stacks(host).map_err(|err| {
                error!("failed to map thread stacks: {err}, Meltdown unfixed");
                ActivateError::MapStacks(err)
            })?;
            shared.map_all_ds_buffers(host).map_err(|err| {
                error!("failed to map Intel DS buffers: {err}, Meltdown unfixed");
                ActivateError::MapDsBuffers(err)
            })?;
            let mut inner = shared.lock();
            shared.set_state(&mut inner, PatchState::Active);
        }
        Ok(())
    }

    /// Pre-revert hook: take the mitigation down and start draining this
    /// installation's entry stubs.
    pub fn on_pre_deactivate(&self) {
        debug!("pre-revert callback");
        let Some(shared) = &self.shared else {
            return;
        };
        let host = &self.host;

        let snapshot;
        {
            let mut inner = shared.lock();
            match shared.state() {
                // Nothing is up. A repeated revert must not disturb the
                // handover bookkeeping a fresh installer depends on.
                PatchState::Disabled | PatchState::Enabled => return,
                _ => {}
            }
            shared.set_state(&mut inner, PatchState::Deactivating);
            snapshot = inner.orig_idt.clone();
        }

        let restore = match snapshot {
            Some(snapshot) => Some(Arc::new(snapshot.to_image())),
            None => {
                error!("no original interrupt table to restore");
                None
            }
        };
        let percpu = shared.percpu();
        host.run_on_each(&mut |cpu| {
            let entry = percpu.entry(cpu);
            entry.clear_roots();
            entry.disable_pcid();
            if let Some(image) = &restore {
                host.load_idt(cpu, image.clone());
            }
        });

        shared.shadow().free_all(host);

        {
            let mut inner = shared.lock();
            shared.set_state(&mut inner, PatchState::Enabled);
            inner.dirty = true;
        }
        self.entry.drain().begin();
    }

    /// Pre-replace hook, told which module is about to take over.
    ///
    /// The manager loads the successor before firing this, so a successor
    /// carrying this same mitigation is already in the patcher registry.
    pub fn on_pre_replace(&self, successor: ModuleId) {
        debug!("pre-replace callback");
        let Some(shared) = &self.shared else {
            return;
        };
        if shared.state() == PatchState::Disabled {
            return;
        }

        // Decide whether what follows fixes Meltdown too: that makes the
        // replacement a handover, anything else a revert.
        let mut inner = shared.lock();
        if inner.is_patcher(successor) {
            // The stacked module installs its own replacement tables from
            // its post-patch hook. All we do is hand it the means to
            // start draining us once it has.
            self.entry.drain().mark_draining();
            inner.prev_drain_start = Some(self.entry.drain_start_handle());
        } else {
            drop(inner);
            self.on_pre_deactivate();
        }
    }

    /// Module unload.
    pub fn cleanup(self) {
        let Some(shared) = &self.shared else {
            return;
        };
        shared.lock().unregister_patcher(self.module);
        if let Err(err) = self.host.sched_switch().unregister(self.module) {
            // Impossible, but print an error for debugging purposes.
            error!("failed to unregister sched switch probe: {err}");
        }
        debug!("meltdown patch module {} unloaded", self.module.get());
    }
}

// ===== Tests =====
