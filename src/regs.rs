/// The index of a general-purpose register, in the architectural encoding order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum GprIndex {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    /// Never stored here, the guest stack pointer lives in the VMCS.
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl GprIndex {
    /// Every register that is copied between the register bank and the per-CPU window.
    pub const SWAPPED: [GprIndex; 15] = [
        GprIndex::Rax,
        GprIndex::Rcx,
        GprIndex::Rdx,
        GprIndex::Rbx,
        GprIndex::Rbp,
        GprIndex::Rsi,
        GprIndex::Rdi,
        GprIndex::R8,
        GprIndex::R9,
        GprIndex::R10,
        GprIndex::R11,
        GprIndex::R12,
        GprIndex::R13,
        GprIndex::R14,
        GprIndex::R15,
    ];
}

/// General-purpose registers of a guest, in the layout the VM entry trampoline expects.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GeneralRegisters {
    regs: [u64; 16],
}

impl GeneralRegisters {
    /// All registers zeroed.
    pub const fn new() -> Self {
        Self { regs: [0; 16] }
    }

    /// Returns the value of the given register.
    pub const fn get(&self, index: GprIndex) -> u64 {
        self.regs[index as usize]
    }

    /// Sets the value of the given register.
    pub fn set(&mut self, index: GprIndex, value: u64) {
        self.regs[index as usize] = value;
    }

    /// Copies every swapped register from `other`.
    pub fn copy_from(&mut self, other: &GeneralRegisters) {
        for index in GprIndex::SWAPPED {
            self.set(index, other.get(index));
        }
    }
}

/// A register that has no VMCS field and is kept by software instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MissingReg {
    Cr2,
    Cr8,
    Xcr0,
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr6,
    Star,
    Lstar,
    Cstar,
    Fmask,
    KernelGsBase,
}

/// State the VMCS does not hold, swapped by the VM entry trampoline around every
/// hardware round-trip.
///
/// The host half is captured once at allocation and never touched by guest
/// operations.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MissingRegisters {
    /// Set after the first successful entry; selects `VMRESUME` over `VMLAUNCH`.
    pub launched: bool,

    pub guest_cr2: u64,
    pub guest_cr8: u64,
    pub guest_xcr0: u64,
    pub guest_dr0: u64,
    pub guest_dr1: u64,
    pub guest_dr2: u64,
    pub guest_dr3: u64,
    pub guest_dr6: u64,
    pub guest_star: u64,
    pub guest_lstar: u64,
    pub guest_cstar: u64,
    pub guest_fmask: u64,
    pub guest_kernel_gs_base: u64,

    pub host_star: u64,
    pub host_lstar: u64,
    pub host_cstar: u64,
    pub host_fmask: u64,
    pub host_kernel_gs_base: u64,
}

impl MissingRegisters {
    /// Every register zeroed, not yet launched.
    pub const fn new() -> Self {
        Self {
            launched: false,
            guest_cr2: 0,
            guest_cr8: 0,
            guest_xcr0: 0,
            guest_dr0: 0,
            guest_dr1: 0,
            guest_dr2: 0,
            guest_dr3: 0,
            guest_dr6: 0,
            guest_star: 0,
            guest_lstar: 0,
            guest_cstar: 0,
            guest_fmask: 0,
            guest_kernel_gs_base: 0,
            host_star: 0,
            host_lstar: 0,
            host_cstar: 0,
            host_fmask: 0,
            host_kernel_gs_base: 0,
        }
    }

    /// Returns the guest value of a missing register.
    pub const fn guest(&self, reg: MissingReg) -> u64 {
        match reg {
            MissingReg::Cr2 => self.guest_cr2,
            MissingReg::Cr8 => self.guest_cr8,
            MissingReg::Xcr0 => self.guest_xcr0,
            MissingReg::Dr0 => self.guest_dr0,
            MissingReg::Dr1 => self.guest_dr1,
            MissingReg::Dr2 => self.guest_dr2,
            MissingReg::Dr3 => self.guest_dr3,
            MissingReg::Dr6 => self.guest_dr6,
            MissingReg::Star => self.guest_star,
            MissingReg::Lstar => self.guest_lstar,
            MissingReg::Cstar => self.guest_cstar,
            MissingReg::Fmask => self.guest_fmask,
            MissingReg::KernelGsBase => self.guest_kernel_gs_base,
        }
    }

    /// Returns a mutable reference to the guest slot of a missing register.
    pub fn guest_mut(&mut self, reg: MissingReg) -> &mut u64 {
        match reg {
            MissingReg::Cr2 => &mut self.guest_cr2,
            MissingReg::Cr8 => &mut self.guest_cr8,
            MissingReg::Xcr0 => &mut self.guest_xcr0,
            MissingReg::Dr0 => &mut self.guest_dr0,
            MissingReg::Dr1 => &mut self.guest_dr1,
            MissingReg::Dr2 => &mut self.guest_dr2,
            MissingReg::Dr3 => &mut self.guest_dr3,
            MissingReg::Dr6 => &mut self.guest_dr6,
            MissingReg::Star => &mut self.guest_star,
            MissingReg::Lstar => &mut self.guest_lstar,
            MissingReg::Cstar => &mut self.guest_cstar,
            MissingReg::Fmask => &mut self.guest_fmask,
            MissingReg::KernelGsBase => &mut self.guest_kernel_gs_base,
        }
    }
}

/// The part of a virtual processor's state that lives outside the VMCS.
///
/// The general-purpose registers in here are only authoritative while the owning
/// VS is not active on any physical CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegisterBank {
    pub gprs: GeneralRegisters,
    pub missing: MissingRegisters,
}

impl RegisterBank {
    /// An empty register bank.
    pub const fn new() -> Self {
        Self {
            gprs: GeneralRegisters::new(),
            missing: MissingRegisters::new(),
        }
    }

    /// Resets every slot to zero.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
