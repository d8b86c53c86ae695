//! Symbolic register names and where each one is stored.
//!
//! The numbering of [`VsReg`] is the guest-state ABI: numbers are dense, start at
//! zero, and are never reused. New registers are appended.

use axerrno::{ax_err_type, AxError};
use x86::vmx::vmcs::{control, guest, ro};

use crate::regs::{GprIndex, MissingReg};
use crate::vmcs::VmcsField;

/// Control values that are reconciled with the VS's capability snapshot before
/// they reach the VMCS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sanitizer {
    PinCtls,
    ProcCtls,
    ProcCtls2,
    ExitCtls,
    EntryCtls,
    Cr0,
    Cr4,
}

/// The storage behind a symbolic register.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegLocation {
    /// Not backed by anything; every access fails.
    Unsupported,
    /// A general-purpose register, held by the per-CPU window while the VS is
    /// active and by the register bank otherwise.
    Gpr(GprIndex),
    /// A register the VMCS has no field for.
    Missing(MissingReg),
    /// A VMCS field written as-is.
    Vmcs(VmcsField),
    /// A VMCS field written through a sanitizer.
    Sanitized(VmcsField, Sanitizer),
}

const fn gpr(index: GprIndex) -> RegLocation {
    RegLocation::Gpr(index)
}

const fn missing(reg: MissingReg) -> RegLocation {
    RegLocation::Missing(reg)
}

const fn vmcs(encoding: u32) -> RegLocation {
    RegLocation::Vmcs(VmcsField(encoding))
}

const fn sanitized(encoding: u32, sanitizer: Sanitizer) -> RegLocation {
    RegLocation::Sanitized(VmcsField(encoding), sanitizer)
}

macro_rules! define_vs_regs {
    ($($(#[$attr:meta])* $name:ident = $num:literal => $loc:expr,)*) => {
        /// A register of a virtual processor, addressable by [`crate::AxVs::read`]
        /// and [`crate::AxVs::write`].
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
        #[repr(u64)]
        pub enum VsReg {
            $($(#[$attr])* $name = $num,)*
        }

        impl VsReg {
            /// Every register, indexed by its number.
            pub const ALL: &'static [VsReg] = &[$(VsReg::$name,)*];

            const LOCATIONS: &'static [RegLocation] = &[$($loc,)*];
        }
    };
}

define_vs_regs! {
    Unsupported = 0 => RegLocation::Unsupported,
    Rax = 1 => gpr(GprIndex::Rax),
    Rbx = 2 => gpr(GprIndex::Rbx),
    Rcx = 3 => gpr(GprIndex::Rcx),
    Rdx = 4 => gpr(GprIndex::Rdx),
    Rbp = 5 => gpr(GprIndex::Rbp),
    Rsi = 6 => gpr(GprIndex::Rsi),
    Rdi = 7 => gpr(GprIndex::Rdi),
    R8 = 8 => gpr(GprIndex::R8),
    R9 = 9 => gpr(GprIndex::R9),
    R10 = 10 => gpr(GprIndex::R10),
    R11 = 11 => gpr(GprIndex::R11),
    R12 = 12 => gpr(GprIndex::R12),
    R13 = 13 => gpr(GprIndex::R13),
    R14 = 14 => gpr(GprIndex::R14),
    R15 = 15 => gpr(GprIndex::R15),
    Cr2 = 16 => missing(MissingReg::Cr2),
    Dr6 = 17 => missing(MissingReg::Dr6),
    Star = 18 => missing(MissingReg::Star),
    Lstar = 19 => missing(MissingReg::Lstar),
    Cstar = 20 => missing(MissingReg::Cstar),
    Fmask = 21 => missing(MissingReg::Fmask),
    KernelGsBase = 22 => missing(MissingReg::KernelGsBase),

    // 16-bit fields
    VirtualProcessorIdentifier = 23 => vmcs(control::VPID),
    PostedInterruptNotificationVector = 24 => vmcs(control::POSTED_INTERRUPT_NOTIFICATION_VECTOR),
    EptpIndex = 25 => vmcs(control::EPTP_INDEX),
    EsSelector = 26 => vmcs(guest::ES_SELECTOR),
    CsSelector = 27 => vmcs(guest::CS_SELECTOR),
    SsSelector = 28 => vmcs(guest::SS_SELECTOR),
    DsSelector = 29 => vmcs(guest::DS_SELECTOR),
    FsSelector = 30 => vmcs(guest::FS_SELECTOR),
    GsSelector = 31 => vmcs(guest::GS_SELECTOR),
    LdtrSelector = 32 => vmcs(guest::LDTR_SELECTOR),
    TrSelector = 33 => vmcs(guest::TR_SELECTOR),
    InterruptStatus = 34 => vmcs(guest::INTERRUPT_STATUS),
    PmlIndex = 35 => vmcs(guest::PML_INDEX),

    // 64-bit fields
    IoBitmapAAddress = 36 => vmcs(control::IO_BITMAP_A_ADDR_FULL),
    IoBitmapBAddress = 37 => vmcs(control::IO_BITMAP_B_ADDR_FULL),
    MsrBitmapsAddress = 38 => vmcs(control::MSR_BITMAPS_ADDR_FULL),
    VmexitMsrStoreAddress = 39 => vmcs(control::VMEXIT_MSR_STORE_ADDR_FULL),
    VmexitMsrLoadAddress = 40 => vmcs(control::VMEXIT_MSR_LOAD_ADDR_FULL),
    VmentryMsrLoadAddress = 41 => vmcs(control::VMENTRY_MSR_LOAD_ADDR_FULL),
    ExecutiveVmcsPointer = 42 => vmcs(control::EXECUTIVE_VMCS_PTR_FULL),
    PmlAddress = 43 => vmcs(control::PML_ADDR_FULL),
    TscOffset = 44 => vmcs(control::TSC_OFFSET_FULL),
    VirtualApicAddress = 45 => vmcs(control::VIRT_APIC_ADDR_FULL),
    ApicAccessAddress = 46 => vmcs(control::APIC_ACCESS_ADDR_FULL),
    PostedInterruptDescriptorAddress = 47 => vmcs(control::POSTED_INTERRUPT_DESC_ADDR_FULL),
    VmFunctionControls = 48 => vmcs(control::VM_FUNCTION_CONTROLS_FULL),
    EptPointer = 49 => vmcs(control::EPTP_FULL),
    EoiExitBitmap0 = 50 => vmcs(control::EOI_EXIT0_FULL),
    EoiExitBitmap1 = 51 => vmcs(control::EOI_EXIT1_FULL),
    EoiExitBitmap2 = 52 => vmcs(control::EOI_EXIT2_FULL),
    EoiExitBitmap3 = 53 => vmcs(control::EOI_EXIT3_FULL),
    EptpListAddress = 54 => vmcs(control::EPTP_LIST_ADDR_FULL),
    VmreadBitmapAddress = 55 => vmcs(control::VMREAD_BITMAP_ADDR_FULL),
    VmwriteBitmapAddress = 56 => vmcs(control::VMWRITE_BITMAP_ADDR_FULL),
    VirtExceptionInformationAddress = 57 => vmcs(control::VIRT_EXCEPTION_INFO_ADDR_FULL),
    XssExitingBitmap = 58 => vmcs(control::XSS_EXITING_BITMAP_FULL),
    EnclsExitingBitmap = 59 => vmcs(control::ENCLS_EXITING_BITMAP_FULL),
    SubPagePermissionTablePointer = 60 => vmcs(control::SUBPAGE_PERM_TABLE_PTR_FULL),
    TscMultiplier = 61 => vmcs(control::TSC_MULTIPLIER_FULL),
    GuestPhysicalAddress = 62 => vmcs(ro::GUEST_PHYSICAL_ADDR_FULL),
    VmcsLinkPointer = 63 => vmcs(guest::LINK_PTR_FULL),
    Debugctl = 64 => vmcs(guest::IA32_DEBUGCTL_FULL),
    Pat = 65 => vmcs(guest::IA32_PAT_FULL),
    Efer = 66 => vmcs(guest::IA32_EFER_FULL),
    PerfGlobalCtrl = 67 => vmcs(guest::IA32_PERF_GLOBAL_CTRL_FULL),
    Pdpte0 = 68 => vmcs(guest::PDPTE0_FULL),
    Pdpte1 = 69 => vmcs(guest::PDPTE1_FULL),
    Pdpte2 = 70 => vmcs(guest::PDPTE2_FULL),
    Pdpte3 = 71 => vmcs(guest::PDPTE3_FULL),
    Bndcfgs = 72 => vmcs(guest::IA32_BNDCFGS_FULL),
    RtitCtl = 73 => vmcs(guest::IA32_RTIT_CTL_FULL),

    // 32-bit fields
    PinBasedVmExecutionCtls = 74 => sanitized(control::PINBASED_EXEC_CONTROLS, Sanitizer::PinCtls),
    PrimaryProcBasedVmExecutionCtls = 75 => sanitized(control::PRIMARY_PROCBASED_EXEC_CONTROLS, Sanitizer::ProcCtls),
    ExceptionBitmap = 76 => vmcs(control::EXCEPTION_BITMAP),
    PageFaultErrorCodeMask = 77 => vmcs(control::PAGE_FAULT_ERR_CODE_MASK),
    PageFaultErrorCodeMatch = 78 => vmcs(control::PAGE_FAULT_ERR_CODE_MATCH),
    Cr3TargetCount = 79 => vmcs(control::CR3_TARGET_COUNT),
    VmexitCtls = 80 => sanitized(control::VMEXIT_CONTROLS, Sanitizer::ExitCtls),
    VmexitMsrStoreCount = 81 => vmcs(control::VMEXIT_MSR_STORE_COUNT),
    VmexitMsrLoadCount = 82 => vmcs(control::VMEXIT_MSR_LOAD_COUNT),
    VmentryCtls = 83 => sanitized(control::VMENTRY_CONTROLS, Sanitizer::EntryCtls),
    VmentryMsrLoadCount = 84 => vmcs(control::VMENTRY_MSR_LOAD_COUNT),
    VmentryInterruptInformationField = 85 => vmcs(control::VMENTRY_INTERRUPTION_INFO_FIELD),
    VmentryExceptionErrorCode = 86 => vmcs(control::VMENTRY_EXCEPTION_ERR_CODE),
    VmentryInstructionLength = 87 => vmcs(control::VMENTRY_INSTRUCTION_LEN),
    TprThreshold = 88 => vmcs(control::TPR_THRESHOLD),
    SecondaryProcBasedVmExecutionCtls = 89 => sanitized(control::SECONDARY_PROCBASED_EXEC_CONTROLS, Sanitizer::ProcCtls2),
    PleGap = 90 => vmcs(control::PLE_GAP),
    PleWindow = 91 => vmcs(control::PLE_WINDOW),
    VmInstructionError = 92 => vmcs(ro::VM_INSTRUCTION_ERROR),
    ExitReason = 93 => vmcs(ro::EXIT_REASON),
    VmexitInterruptionInformation = 94 => vmcs(ro::VMEXIT_INTERRUPTION_INFO),
    VmexitInterruptionErrorCode = 95 => vmcs(ro::VMEXIT_INTERRUPTION_ERR_CODE),
    IdtVectoringInformationField = 96 => vmcs(ro::IDT_VECTORING_INFO),
    IdtVectoringErrorCode = 97 => vmcs(ro::IDT_VECTORING_ERR_CODE),
    VmexitInstructionLength = 98 => vmcs(ro::VMEXIT_INSTRUCTION_LEN),
    VmexitInstructionInformation = 99 => vmcs(ro::VMEXIT_INSTRUCTION_INFO),
    EsLimit = 100 => vmcs(guest::ES_LIMIT),
    CsLimit = 101 => vmcs(guest::CS_LIMIT),
    SsLimit = 102 => vmcs(guest::SS_LIMIT),
    DsLimit = 103 => vmcs(guest::DS_LIMIT),
    FsLimit = 104 => vmcs(guest::FS_LIMIT),
    GsLimit = 105 => vmcs(guest::GS_LIMIT),
    LdtrLimit = 106 => vmcs(guest::LDTR_LIMIT),
    TrLimit = 107 => vmcs(guest::TR_LIMIT),
    GdtrLimit = 108 => vmcs(guest::GDTR_LIMIT),
    IdtrLimit = 109 => vmcs(guest::IDTR_LIMIT),
    EsAttrib = 110 => vmcs(guest::ES_ACCESS_RIGHTS),
    CsAttrib = 111 => vmcs(guest::CS_ACCESS_RIGHTS),
    SsAttrib = 112 => vmcs(guest::SS_ACCESS_RIGHTS),
    DsAttrib = 113 => vmcs(guest::DS_ACCESS_RIGHTS),
    FsAttrib = 114 => vmcs(guest::FS_ACCESS_RIGHTS),
    GsAttrib = 115 => vmcs(guest::GS_ACCESS_RIGHTS),
    LdtrAttrib = 116 => vmcs(guest::LDTR_ACCESS_RIGHTS),
    TrAttrib = 117 => vmcs(guest::TR_ACCESS_RIGHTS),
    InterruptibilityState = 118 => vmcs(guest::INTERRUPTIBILITY_STATE),
    ActivityState = 119 => vmcs(guest::ACTIVITY_STATE),
    Smbase = 120 => vmcs(guest::SMBASE),
    SysenterCs = 121 => vmcs(guest::IA32_SYSENTER_CS),
    VmxPreemptionTimerValue = 122 => vmcs(guest::VMX_PREEMPTION_TIMER_VALUE),

    // natural-width fields
    Cr0GuestHostMask = 123 => vmcs(control::CR0_GUEST_HOST_MASK),
    Cr4GuestHostMask = 124 => vmcs(control::CR4_GUEST_HOST_MASK),
    Cr0ReadShadow = 125 => vmcs(control::CR0_READ_SHADOW),
    Cr4ReadShadow = 126 => vmcs(control::CR4_READ_SHADOW),
    Cr3TargetValue0 = 127 => vmcs(control::CR3_TARGET_VALUE0),
    Cr3TargetValue1 = 128 => vmcs(control::CR3_TARGET_VALUE1),
    Cr3TargetValue2 = 129 => vmcs(control::CR3_TARGET_VALUE2),
    Cr3TargetValue3 = 130 => vmcs(control::CR3_TARGET_VALUE3),
    ExitQualification = 131 => vmcs(ro::EXIT_QUALIFICATION),
    IoRcx = 132 => vmcs(ro::IO_RCX),
    IoRsi = 133 => vmcs(ro::IO_RSI),
    IoRdi = 134 => vmcs(ro::IO_RDI),
    IoRip = 135 => vmcs(ro::IO_RIP),
    GuestLinearAddress = 136 => vmcs(ro::GUEST_LINEAR_ADDR),
    Cr0 = 137 => sanitized(guest::CR0, Sanitizer::Cr0),
    Cr3 = 138 => vmcs(guest::CR3),
    Cr4 = 139 => sanitized(guest::CR4, Sanitizer::Cr4),
    EsBase = 140 => vmcs(guest::ES_BASE),
    CsBase = 141 => vmcs(guest::CS_BASE),
    SsBase = 142 => vmcs(guest::SS_BASE),
    DsBase = 143 => vmcs(guest::DS_BASE),
    FsBase = 144 => vmcs(guest::FS_BASE),
    GsBase = 145 => vmcs(guest::GS_BASE),
    LdtrBase = 146 => vmcs(guest::LDTR_BASE),
    TrBase = 147 => vmcs(guest::TR_BASE),
    GdtrBase = 148 => vmcs(guest::GDTR_BASE),
    IdtrBase = 149 => vmcs(guest::IDTR_BASE),
    Dr7 = 150 => vmcs(guest::DR7),
    Rsp = 151 => vmcs(guest::RSP),
    Rip = 152 => vmcs(guest::RIP),
    Rflags = 153 => vmcs(guest::RFLAGS),
    PendingDebugExceptions = 154 => vmcs(guest::PENDING_DBG_EXCEPTIONS),
    SysenterEsp = 155 => vmcs(guest::IA32_SYSENTER_ESP),
    SysenterEip = 156 => vmcs(guest::IA32_SYSENTER_EIP),

    // registers the VMCS does not hold
    Cr8 = 157 => missing(MissingReg::Cr8),
    /// Bit 0 (x87) is always forced on when written.
    Xcr0 = 158 => missing(MissingReg::Xcr0),
    Dr0 = 159 => missing(MissingReg::Dr0),
    Dr1 = 160 => missing(MissingReg::Dr1),
    Dr2 = 161 => missing(MissingReg::Dr2),
    Dr3 = 162 => missing(MissingReg::Dr3),
}

impl VsReg {
    /// Where this register is stored.
    pub const fn location(self) -> RegLocation {
        Self::LOCATIONS[self as usize]
    }

    /// Whether a written value may be altered before it is stored.
    pub const fn is_sanitized(self) -> bool {
        matches!(
            self.location(),
            RegLocation::Sanitized(..) | RegLocation::Missing(MissingReg::Xcr0)
        )
    }
}

impl TryFrom<u64> for VsReg {
    type Error = AxError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        usize::try_from(value)
            .ok()
            .and_then(|index| Self::ALL.get(index))
            .copied()
            .ok_or_else(|| ax_err_type!(Unsupported, format_args!("unknown register {}", value)))
    }
}
