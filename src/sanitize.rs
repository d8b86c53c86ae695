//! Reconciles requested control values with what the CPU reports it supports.
//!
//! Every function here is pure apart from [`VmxCapabilities::sanitize_proc2_ctls`],
//! which relaxes or imposes the CR0 paging/protection requirement depending on
//! whether unrestricted guest mode ends up enabled. A CR0 value written before
//! the secondary controls is therefore sanitized against the previous
//! requirement; callers that toggle unrestricted guest mode should write the
//! secondary controls first.

use x86::controlregs::{Cr0, Cr4};
use x86::msr;
use x86::vmx::vmcs::control::SecondaryControls;

use crate::AxVsHal;

/// Bits always requested in the pin-based controls: NMI exiting and virtual NMIs.
pub const PIN_CTLS_FORCED: u64 = 0x28;
/// Bits always requested in the primary processor-based controls: activate secondary controls.
pub const PROC_CTLS_FORCED: u64 = 0x8000_0000;
/// Bits always requested in the VM-exit controls: host address space size, save/load
/// PAT and EFER.
pub const EXIT_CTLS_FORCED: u64 = 0x3C_0204;
/// Bits always requested in the VM-entry controls: IA-32e mode guest, load PAT and EFER.
pub const ENTRY_CTLS_FORCED: u64 = 0xC004;
/// Bits always requested in the secondary processor-based controls.
pub const PROC2_CTLS_FORCED: u64 = 0;

/// CR0.PG | CR0.PE, forced on unless the guest runs in unrestricted mode.
pub const CR0_PG_PE: u64 = CR0_PG | CR0_PE;
const CR0_PG: u64 = Cr0::CR0_ENABLE_PAGING.bits() as u64;
const CR0_PE: u64 = Cr0::CR0_PROTECTED_MODE.bits() as u64;
/// CR4.VMXE, which must stay set while the guest runs under VMX.
pub const CR4_VMXE: u64 = Cr4::CR4_ENABLE_VMX.bits() as u64;
/// The "unrestricted guest" secondary processor-based control.
pub const UNRESTRICTED_GUEST: u64 = SecondaryControls::UNRESTRICTED_GUEST.bits() as u64;
/// XCR0 bit 0 (x87 state), which must always be enabled.
pub const XCR0_X87: u64 = 0x1;

/// `(requested | forced | fixed0) & fixed1`.
pub const fn sanitize(requested: u64, fixed0: u64, fixed1: u64, forced: u64) -> u64 {
    (requested | forced | fixed0) & fixed1
}

/// XCR0 only needs the x87 component forced on.
pub const fn sanitize_xcr0(requested: u64) -> u64 {
    requested | XCR0_X87
}

/// A pair of capability masks: `fixed0` bits must be 1, bits clear in `fixed1` must be 0.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FixedBits {
    pub fixed0: u64,
    pub fixed1: u64,
}

impl FixedBits {
    /// No requirement in either direction.
    pub const EMPTY: Self = Self {
        fixed0: 0,
        fixed1: 0,
    };

    /// Splits a VMX control capability MSR: the low half holds the allowed-0
    /// settings, the high half the allowed-1 settings.
    pub const fn from_ctls_msr(value: u64) -> Self {
        Self {
            fixed0: value & 0xFFFF_FFFF,
            fixed1: value >> 32,
        }
    }

    /// Applies these masks to `requested` with `forced` bits set on top.
    pub const fn apply(&self, requested: u64, forced: u64) -> u64 {
        sanitize(requested, self.fixed0, self.fixed1, forced)
    }
}

/// The capability snapshot of one VS, taken when it is allocated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmxCapabilities {
    pub cr0: FixedBits,
    pub cr4: FixedBits,
    pub pin: FixedBits,
    pub proc: FixedBits,
    pub exit: FixedBits,
    pub entry: FixedBits,
    pub proc2: FixedBits,
}

impl VmxCapabilities {
    /// The snapshot of a VS that owns no VMCS.
    pub const EMPTY: Self = Self {
        cr0: FixedBits::EMPTY,
        cr4: FixedBits::EMPTY,
        pin: FixedBits::EMPTY,
        proc: FixedBits::EMPTY,
        exit: FixedBits::EMPTY,
        entry: FixedBits::EMPTY,
        proc2: FixedBits::EMPTY,
    };

    /// Reads every capability MSR through the HAL.
    pub fn capture<H: AxVsHal>(hal: &H) -> Self {
        Self {
            cr0: FixedBits {
                fixed0: hal.rdmsr(msr::IA32_VMX_CR0_FIXED0),
                fixed1: hal.rdmsr(msr::IA32_VMX_CR0_FIXED1),
            },
            cr4: FixedBits {
                fixed0: hal.rdmsr(msr::IA32_VMX_CR4_FIXED0),
                fixed1: hal.rdmsr(msr::IA32_VMX_CR4_FIXED1),
            },
            pin: FixedBits::from_ctls_msr(hal.rdmsr(msr::IA32_VMX_TRUE_PINBASED_CTLS)),
            proc: FixedBits::from_ctls_msr(hal.rdmsr(msr::IA32_VMX_TRUE_PROCBASED_CTLS)),
            exit: FixedBits::from_ctls_msr(hal.rdmsr(msr::IA32_VMX_TRUE_EXIT_CTLS)),
            entry: FixedBits::from_ctls_msr(hal.rdmsr(msr::IA32_VMX_TRUE_ENTRY_CTLS)),
            // There is no TRUE variant of the secondary controls MSR.
            proc2: FixedBits::from_ctls_msr(hal.rdmsr(msr::IA32_VMX_PROCBASED_CTLS2)),
        }
    }

    /// Pin-based controls, with NMI exiting and virtual NMIs forced on.
    pub const fn sanitize_pin_ctls(&self, requested: u64) -> u64 {
        self.pin.apply(requested, PIN_CTLS_FORCED)
    }

    /// Primary processor-based controls, with the secondary controls activated.
    pub const fn sanitize_proc_ctls(&self, requested: u64) -> u64 {
        self.proc.apply(requested, PROC_CTLS_FORCED)
    }

    /// VM-exit controls.
    pub const fn sanitize_exit_ctls(&self, requested: u64) -> u64 {
        self.exit.apply(requested, EXIT_CTLS_FORCED)
    }

    /// VM-entry controls.
    pub const fn sanitize_entry_ctls(&self, requested: u64) -> u64 {
        self.entry.apply(requested, ENTRY_CTLS_FORCED)
    }

    /// Sanitizes the secondary controls and updates the CR0 requirement to match:
    /// with unrestricted guest mode enabled CR0.PG/PE are no longer forced on.
    pub fn sanitize_proc2_ctls(&mut self, requested: u64) -> u64 {
        let value = self.proc2.apply(requested, PROC2_CTLS_FORCED);
        if value & UNRESTRICTED_GUEST != 0 {
            self.cr0.fixed0 &= !CR0_PG_PE;
        } else {
            self.cr0.fixed0 |= CR0_PG_PE;
        }
        value
    }

    /// Guest CR0 against the current CR0 requirement.
    pub const fn sanitize_cr0(&self, requested: u64) -> u64 {
        self.cr0.apply(requested, 0)
    }

    /// Guest CR4, which always keeps VMXE.
    pub const fn sanitize_cr4(&self, requested: u64) -> u64 {
        self.cr4.apply(requested, 0) | CR4_VMXE
    }
}
