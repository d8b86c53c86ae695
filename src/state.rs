/// A segment register as it is exchanged with the outside world.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SegmentState {
    pub selector: u16,
    pub attrib: u16,
    pub limit: u32,
    pub base: u64,
}

/// GDTR or IDTR.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DescriptorTableState {
    pub limit: u16,
    pub base: u64,
}

/// The complete architectural state of a guest processor, used to load a VS in
/// bulk or to take a snapshot of it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GuestStateSave {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rsp: u64,
    pub rip: u64,
    pub rflags: u64,

    pub gdtr: DescriptorTableState,
    pub idtr: DescriptorTableState,

    pub es: SegmentState,
    pub cs: SegmentState,
    pub ss: SegmentState,
    pub ds: SegmentState,
    pub fs: SegmentState,
    pub gs: SegmentState,
    pub ldtr: SegmentState,
    pub tr: SegmentState,

    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub cr8: u64,
    pub xcr0: u64,

    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,

    pub msr_efer: u64,
    pub msr_star: u64,
    pub msr_lstar: u64,
    pub msr_cstar: u64,
    pub msr_fmask: u64,
    pub msr_kernel_gs_base: u64,
    pub msr_sysenter_cs: u64,
    pub msr_sysenter_esp: u64,
    pub msr_sysenter_eip: u64,
    pub msr_pat: u64,
    pub msr_debugctl: u64,
}
