use crate::regs::GeneralRegisters;

/// Host state written into the host-state area of every VMCS set up on a CPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostState {
    pub es_selector: u16,
    pub cs_selector: u16,
    pub ss_selector: u16,
    pub ds_selector: u16,
    pub fs_selector: u16,
    pub gs_selector: u16,
    pub tr_selector: u16,

    pub cr0: u64,
    pub cr3: u64,
    pub cr4: u64,

    pub tr_base: u64,
    pub gdtr_base: u64,
    pub idtr_base: u64,

    /// Where the CPU resumes in the host after a VM exit.
    pub vmexit_entry: u64,
}

/// Host per-CPU state shared by every VS that runs on the CPU.
///
/// Recommended usage:
/// - Define one per physical CPU in the hypervisor and fill in the host state
///   once the CPU has entered VMX root operation:
///
///   ```ignore
///   #[percpu::def_percpu]
///   pub static AXVS_PER_CPU: AxPerCpuVs = AxPerCpuVs::new(0, HostState::EMPTY);
///   ```
///
/// - Pass it to every [`crate::AxVs`] operation executed on that CPU. Only the
///   CPU that owns it may touch it.
pub struct AxPerCpuVs {
    /// The id of this physical CPU.
    cpu_id: u16,
    /// The VS whose VMCS is current on this CPU.
    pub(crate) loaded_vs: Option<u16>,
    /// The VS whose general-purpose registers live in `gprs`.
    pub(crate) active_vs: Option<u16>,
    /// The general-purpose register window the VM entry trampoline reads and writes.
    pub(crate) gprs: GeneralRegisters,
    host: HostState,
}

impl HostState {
    /// A host state with every field zeroed.
    pub const EMPTY: Self = Self {
        es_selector: 0,
        cs_selector: 0,
        ss_selector: 0,
        ds_selector: 0,
        fs_selector: 0,
        gs_selector: 0,
        tr_selector: 0,
        cr0: 0,
        cr3: 0,
        cr4: 0,
        tr_base: 0,
        gdtr_base: 0,
        idtr_base: 0,
        vmexit_entry: 0,
    };
}

impl AxPerCpuVs {
    /// Create the per-CPU state of CPU `cpu_id`, with no VS loaded or active.
    pub const fn new(cpu_id: u16, host: HostState) -> Self {
        Self {
            cpu_id,
            loaded_vs: None,
            active_vs: None,
            gprs: GeneralRegisters::new(),
            host,
        }
    }

    /// The id of this CPU.
    pub const fn cpu_id(&self) -> u16 {
        self.cpu_id
    }

    /// The VS whose VMCS is currently loaded, if any.
    pub const fn loaded_vs(&self) -> Option<u16> {
        self.loaded_vs
    }

    /// The VS that is currently active, if any.
    pub const fn active_vs(&self) -> Option<u16> {
        self.active_vs
    }

    /// The host state used to set up new VMCSs.
    pub const fn host(&self) -> &HostState {
        &self.host
    }

    /// Replace the host state, e.g. after the host reloaded its descriptor tables.
    pub fn set_host(&mut self, host: HostState) {
        self.host = host;
    }

    /// The general-purpose register window.
    pub const fn gprs(&self) -> &GeneralRegisters {
        &self.gprs
    }

    /// Mutable access to the general-purpose register window, for the VM entry
    /// trampoline and exit handlers of the active VS.
    pub fn gprs_mut(&mut self) -> &mut GeneralRegisters {
        &mut self.gprs
    }
}
