//! Environment gate.
//!
//! The mitigation only makes sense on hardware that is both affected and
//! capable of carrying it: Xen guests get isolation from the hypervisor
//! already, the root-switch stubs require PCID to stay affordable, and AMD
//! parts are not vulnerable. A tripped gate permanently disables the
//! installation for the process lifetime; it loads inert and never touches
//! the shared record.

use log::{info, warn};

/// CPU vendor as reported by the identification leaves.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CpuVendor {
    Intel,
    Amd,
    Other,
}

/// Hypervisor the process runs under, if any.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HypervisorKind {
    None,
    Xen,
    Kvm,
    HyperV,
    Vmware,
    Other,
}

/// Everything the gate needs to know about the machine.
#[derive(Clone, Copy, Debug)]
pub struct CpuInfo {
    pub vendor: CpuVendor,
    pub hypervisor: HypervisorKind,
    pub pcid: bool,
}

impl CpuInfo {
    /// Probes the running CPU.
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    pub fn detect() -> Self {
        let cpuid = raw_cpuid::CpuId::new();

        let vendor = match cpuid.get_vendor_info() {
            Some(v) if v.as_str() == "GenuineIntel" => CpuVendor::Intel,
            Some(v) if v.as_str() == "AuthenticAMD" => CpuVendor::Amd,
            _ => CpuVendor::Other,
        };
        let hypervisor = match cpuid.get_hypervisor_info() {
            None => HypervisorKind::None,
            Some(hv) => match hv.identify() {
                raw_cpuid::Hypervisor::Xen => HypervisorKind::Xen,
                raw_cpuid::Hypervisor::KVM => HypervisorKind::Kvm,
                raw_cpuid::Hypervisor::HyperV => HypervisorKind::HyperV,
                raw_cpuid::Hypervisor::VMware => HypervisorKind::Vmware,
                _ => HypervisorKind::Other,
            },
        };
        let pcid = cpuid
            .get_feature_info()
            .map(|f| f.has_pcid())
            .unwrap_or(false);

        Self {
            vendor,
            hypervisor,
            pcid,
        }
    }
}

/// Why an installation disabled itself at load.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DisableReason {
    XenGuest,
    NoPcid,
    AmdCpu,
}

/// Checks whether the mitigation may run here. Returns the first matching
/// disable reason; the order (Xen, then PCID, then vendor) is significant
/// because a Xen guest on AMD should report the hypervisor, not the CPU.
pub fn check(info: &CpuInfo) -> Option<DisableReason> {
    if info.hypervisor == HypervisorKind::Xen {
        Some(DisableReason::XenGuest)
    } else if !info.pcid {
        Some(DisableReason::NoPcid)
    } else if info.vendor == CpuVendor::Amd {
        Some(DisableReason::AmdCpu)
    } else {
        None
    }
}

/// Logs the disable verdict. Missing PCID is the only noisy case since it
/// can mean a misconfigured guest rather than expected hardware.
pub fn report(reason: DisableReason) {
    match reason {
        DisableReason::XenGuest => info!("Disabling Meltdown patch: XEN guest"),
        DisableReason::NoPcid => warn!("Disabling Meltdown patch: lack of PCID support"),
        DisableReason::AmdCpu => info!("Disabling Meltdown patch: AMD CPU"),
    }
}
