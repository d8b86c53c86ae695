use core::marker::PhantomData;
use core::ptr::NonNull;

use axerrno::{ax_err, AxResult};
use log::{debug, error, trace};
use memory_addr::{PhysAddr, VirtAddr};
use x86::msr;
use x86::vmx::vmcs::host;

use crate::exit::VmxExit;
use crate::percpu::AxPerCpuVs;
use crate::reg::{RegLocation, Sanitizer, VsReg};
use crate::regs::{GeneralRegisters, GprIndex, MissingReg, MissingRegisters, RegisterBank};
use crate::sanitize::{sanitize_xcr0, VmxCapabilities};
use crate::state::{DescriptorTableState, GuestStateSave, SegmentState};
use crate::vmcs::{VmcsField, VmcsRegion, VMCS_UNUSABLE_SEGMENT};
use crate::AxVsHal;

/// The id that never names a VS, VM, VP or PP.
pub const INVALID_ID: u16 = 0xFFFF;

/// Whether a VS owns a VMCS.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AllocationStatus {
    /// No VMCS, no assignment.
    Deallocated,
    /// The VMCS is allocated and primed with host state.
    Allocated,
}

/// Where a VS is in its run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunningStatus {
    /// Never run since allocation.
    Initial,
    /// Inside the hardware round-trip.
    Running,
    /// Returned from the guest, the caller is handling the exit.
    HandlingExit,
}

/// The VMCS page owned by an allocated VS.
struct VmcsPage {
    ptr: NonNull<VmcsRegion>,
    paddr: PhysAddr,
}

/// The four VMCS fields describing one guest segment register.
struct SegmentRegs {
    selector: VsReg,
    attrib: VsReg,
    limit: VsReg,
    base: VsReg,
}

macro_rules! segment_regs {
    ($selector:ident, $attrib:ident, $limit:ident, $base:ident) => {
        SegmentRegs {
            selector: VsReg::$selector,
            attrib: VsReg::$attrib,
            limit: VsReg::$limit,
            base: VsReg::$base,
        }
    };
}

const ES: SegmentRegs = segment_regs!(EsSelector, EsAttrib, EsLimit, EsBase);
const CS: SegmentRegs = segment_regs!(CsSelector, CsAttrib, CsLimit, CsBase);
const SS: SegmentRegs = segment_regs!(SsSelector, SsAttrib, SsLimit, SsBase);
const DS: SegmentRegs = segment_regs!(DsSelector, DsAttrib, DsLimit, DsBase);
const FS: SegmentRegs = segment_regs!(FsSelector, FsAttrib, FsLimit, FsBase);
const GS: SegmentRegs = segment_regs!(GsSelector, GsAttrib, GsLimit, GsBase);
const LDTR: SegmentRegs = segment_regs!(LdtrSelector, LdtrAttrib, LdtrLimit, LdtrBase);
const TR: SegmentRegs = segment_regs!(TrSelector, TrAttrib, TrLimit, TrBase);

/// The state of one virtual processor under Intel VMX.
///
/// A VS owns a VMCS page, the registers the VMCS does not hold and the
/// capability snapshot its control fields are sanitized against.
///
/// Note that:
/// - Every operation runs on, and is given the [`AxPerCpuVs`] of, the physical CPU
///   that executes it. VMCS accesses first make this VS the loaded one on that CPU,
///   which is only allowed on the CPU the VS is assigned to.
/// - The VMCS page comes from, and must be returned to, the page pool of `H`: call
///   [`AxVs::deallocate`] or [`AxVs::release`] before dropping an allocated VS.
pub struct AxVs<H: AxVsHal> {
    id: Option<u16>,
    allocation_status: AllocationStatus,
    running_status: RunningStatus,

    assigned_vm: Option<u16>,
    assigned_vp: Option<u16>,
    assigned_pp: Option<u16>,
    /// The CPU whose register window holds this VS's general-purpose registers.
    active_pp: Option<u16>,

    vmcs: Option<VmcsPage>,
    bank: RegisterBank,
    caps: VmxCapabilities,

    _hal: PhantomData<H>,
}

fn check_id(id: u16, what: &str) -> AxResult<u16> {
    if id == INVALID_ID {
        ax_err!(InvalidInput, format!("invalid {} id {:#x}", what, id))
    } else {
        Ok(id)
    }
}

impl<H: AxVsHal> AxVs<H> {
    /// Create a new VS with no id, deallocated.
    pub const fn new() -> Self {
        Self {
            id: None,
            allocation_status: AllocationStatus::Deallocated,
            running_status: RunningStatus::Initial,
            assigned_vm: None,
            assigned_vp: None,
            assigned_pp: None,
            active_pp: None,
            vmcs: None,
            bank: RegisterBank::new(),
            caps: VmxCapabilities::EMPTY,
            _hal: PhantomData,
        }
    }

    /// Assign the id of the VS. Only allowed once.
    pub fn initialize(&mut self, id: u16) -> AxResult {
        if let Some(current) = self.id {
            return ax_err!(BadState, format!("VS {:#x} is already initialized", current));
        }
        self.id = Some(check_id(id, "VS")?);
        Ok(())
    }

    /// Get the id of the VS, `None` before [`AxVs::initialize`] and after [`AxVs::release`].
    pub const fn id(&self) -> Option<u16> {
        self.id
    }

    /// Whether the VS owns a primed VMCS.
    pub const fn is_allocated(&self) -> bool {
        matches!(self.allocation_status, AllocationStatus::Allocated)
    }

    /// Whether the VS owns no VMCS.
    pub const fn is_deallocated(&self) -> bool {
        matches!(self.allocation_status, AllocationStatus::Deallocated)
    }

    /// The VM this VS is assigned to.
    pub const fn assigned_vm(&self) -> Option<u16> {
        self.assigned_vm
    }

    /// The VP this VS is assigned to.
    pub const fn assigned_vp(&self) -> Option<u16> {
        self.assigned_vp
    }

    /// The physical CPU this VS is pinned to.
    pub const fn assigned_pp(&self) -> Option<u16> {
        self.assigned_pp
    }

    /// The physical CPU this VS is active on, if any.
    pub const fn is_active(&self) -> Option<u16> {
        self.active_pp
    }

    /// Whether this VS is active on the given CPU.
    pub fn is_active_on_this_pp(&self, cpu: &AxPerCpuVs) -> bool {
        self.active_pp == Some(cpu.cpu_id())
    }

    /// Where the VS is in its run loop.
    pub const fn running_status(&self) -> RunningStatus {
        self.running_status
    }

    /// Set the running status of the VS.
    /// # Safety
    /// This method is unsafe because it may break the run loop state model.
    /// Use it with caution.
    pub unsafe fn set_running_status(&mut self, status: RunningStatus) {
        self.running_status = status;
    }

    /// The capability snapshot taken at allocation, including the CR0 requirement
    /// as last adjusted by a write to the secondary controls.
    pub const fn capabilities(&self) -> &VmxCapabilities {
        &self.caps
    }

    /// The physical address of the VMCS, if allocated.
    pub fn vmcs_paddr(&self) -> Option<PhysAddr> {
        self.vmcs.as_ref().map(|page| page.paddr)
    }

    fn check_allocated(&self) -> AxResult<&VmcsPage> {
        match (&self.vmcs, self.allocation_status) {
            (Some(page), AllocationStatus::Allocated) => Ok(page),
            _ => ax_err!(BadState, format!("VS {:?} is not allocated", self.id)),
        }
    }

    fn check_not_running(&self) -> AxResult {
        if self.running_status == RunningStatus::Running {
            ax_err!(BadState, format!("VS {:?} is running", self.id))
        } else {
            Ok(())
        }
    }

    /// Only the CPU the VS is assigned to may load, clear or activate it.
    fn check_assigned(&self, cpu: &AxPerCpuVs) -> AxResult {
        if self.assigned_pp != Some(cpu.cpu_id()) {
            return ax_err!(
                BadState,
                format!(
                    "VS {:?} is assigned to PP {:?}, not PP {}",
                    self.id,
                    self.assigned_pp,
                    cpu.cpu_id()
                )
            );
        }
        Ok(())
    }

    /// Make this VS's VMCS the current one on `cpu`.
    fn ensure_loaded(&self, cpu: &mut AxPerCpuVs, hal: &mut H) -> AxResult {
        let paddr = match &self.vmcs {
            Some(page) => page.paddr,
            None => return ax_err!(BadState, format!("VS {:?} has no VMCS", self.id)),
        };
        self.check_not_running()?;
        self.check_assigned(cpu)?;
        if cpu.loaded_vs == self.id {
            return Ok(());
        }
        trace!("loading VS {:?} ({:?}) on PP {}", self.id, paddr, cpu.cpu_id());
        hal.vmptrld(paddr)?;
        cpu.loaded_vs = self.id;
        Ok(())
    }

    /// The authoritative copy of the general-purpose registers.
    fn gprs<'a>(&'a self, cpu: &'a AxPerCpuVs) -> &'a GeneralRegisters {
        if self.id.is_some() && cpu.active_vs == self.id {
            &cpu.gprs
        } else {
            &self.bank.gprs
        }
    }

    /// The authoritative copy of the general-purpose registers, along with the
    /// missing registers.
    fn regs_mut<'a>(
        &'a mut self,
        cpu: &'a mut AxPerCpuVs,
    ) -> (&'a mut GeneralRegisters, &'a mut MissingRegisters) {
        let bank = &mut self.bank;
        if self.id.is_some() && cpu.active_vs == self.id {
            (&mut cpu.gprs, &mut bank.missing)
        } else {
            (&mut bank.gprs, &mut bank.missing)
        }
    }

    /// Acquire and prime a VMCS, assigning the VS to `vm`, `vp` and `pp`.
    ///
    /// `cpu` must be the CPU `pp` names. Nothing is left allocated on failure.
    pub fn allocate(
        &mut self,
        cpu: &mut AxPerCpuVs,
        hal: &mut H,
        vm: u16,
        vp: u16,
        pp: u16,
    ) -> AxResult {
        if self.id.is_none() {
            return ax_err!(BadState, "VS is not initialized");
        }
        if !self.is_deallocated() || self.running_status != RunningStatus::Initial {
            return ax_err!(BadState, format!("VS {:?} is already allocated", self.id));
        }
        let vm = check_id(vm, "VM")?;
        let vp = check_id(vp, "VP")?;
        let pp = check_id(pp, "PP")?;
        if pp != cpu.cpu_id() {
            return ax_err!(
                BadState,
                format!("VS {:?} must be allocated on PP {}, not PP {}", self.id, pp, cpu.cpu_id())
            );
        }

        let Some(ptr) = hal.alloc_vmcs_page() else {
            return ax_err!(NoMemory, format!("no VMCS page left for VS {:?}", self.id));
        };
        let paddr = hal.virt_to_phys(VirtAddr::from(ptr.as_ptr() as usize));
        self.vmcs = Some(VmcsPage { ptr, paddr });
        self.assigned_vm = Some(vm);
        self.assigned_vp = Some(vp);
        self.assigned_pp = Some(pp);

        if let Err(err) = self.init_vmcs(cpu, hal, ptr, paddr) {
            error!("failed to set up the VMCS of VS {:?}: {:?}", self.id, err);
            self.reset(cpu, hal);
            return Err(err);
        }

        self.allocation_status = AllocationStatus::Allocated;
        debug!(
            "VS {:?} allocated for VM {} VP {} on PP {}, VMCS at {:?}",
            self.id, vm, vp, pp, paddr
        );
        Ok(())
    }

    fn init_vmcs(
        &mut self,
        cpu: &mut AxPerCpuVs,
        hal: &mut H,
        ptr: NonNull<VmcsRegion>,
        paddr: PhysAddr,
    ) -> AxResult {
        let revision_id = (hal.rdmsr(msr::IA32_VMX_BASIC) & 0x7FFF_FFFF) as u32;
        // SAFETY: the page was just handed out by the pool and only this VS refers to it.
        unsafe { (*ptr.as_ptr()).revision_id = revision_id };

        self.ensure_loaded(cpu, hal)?;
        hal.vmclear(paddr)?;
        hal.vmptrld(paddr)?;

        let host_state = *cpu.host();
        let fields = [
            (host::ES_SELECTOR, host_state.es_selector as u64),
            (host::CS_SELECTOR, host_state.cs_selector as u64),
            (host::SS_SELECTOR, host_state.ss_selector as u64),
            (host::DS_SELECTOR, host_state.ds_selector as u64),
            (host::FS_SELECTOR, host_state.fs_selector as u64),
            (host::GS_SELECTOR, host_state.gs_selector as u64),
            (host::TR_SELECTOR, host_state.tr_selector as u64),
            (host::IA32_PAT_FULL, hal.rdmsr(msr::IA32_PAT)),
            (host::IA32_EFER_FULL, hal.rdmsr(msr::IA32_EFER)),
            (
                host::IA32_SYSENTER_CS,
                hal.rdmsr(msr::IA32_SYSENTER_CS) & 0xFFFF_FFFF,
            ),
            (host::CR0, host_state.cr0),
            (host::CR3, host_state.cr3),
            (host::CR4, host_state.cr4),
            (host::FS_BASE, hal.rdmsr(msr::IA32_FS_BASE)),
            (host::GS_BASE, hal.rdmsr(msr::IA32_GS_BASE)),
            (host::TR_BASE, host_state.tr_base),
            (host::GDTR_BASE, host_state.gdtr_base),
            (host::IDTR_BASE, host_state.idtr_base),
            (host::IA32_SYSENTER_ESP, hal.rdmsr(msr::IA32_SYSENTER_ESP)),
            (host::IA32_SYSENTER_EIP, hal.rdmsr(msr::IA32_SYSENTER_EIP)),
            (host::RIP, host_state.vmexit_entry),
        ];
        for (field, value) in fields {
            VmcsField(field).write(hal, value)?;
        }

        let missing = &mut self.bank.missing;
        missing.host_star = hal.rdmsr(msr::IA32_STAR);
        missing.host_lstar = hal.rdmsr(msr::IA32_LSTAR);
        missing.host_cstar = hal.rdmsr(msr::IA32_CSTAR);
        missing.host_fmask = hal.rdmsr(msr::IA32_FMASK);
        missing.host_kernel_gs_base = hal.rdmsr(msr::IA32_KERNEL_GSBASE);

        self.caps = VmxCapabilities::capture(hal);
        Ok(())
    }

    /// Return the VMCS page and forget everything that came with it.
    fn reset(&mut self, cpu: &mut AxPerCpuVs, hal: &mut H) {
        if let Some(page) = self.vmcs.take() {
            hal.dealloc_vmcs_page(page.ptr);
        }
        if self.id.is_some() && cpu.loaded_vs == self.id {
            cpu.loaded_vs = None;
        }
        self.bank.clear();
        self.caps = VmxCapabilities::EMPTY;
        self.assigned_vm = None;
        self.assigned_vp = None;
        self.assigned_pp = None;
        self.allocation_status = AllocationStatus::Deallocated;
        self.running_status = RunningStatus::Initial;
    }

    /// Release the VMCS and clear the register bank, the capability snapshot and
    /// the assignment. Deallocating a deallocated VS does nothing.
    ///
    /// The VS must not be running or active anywhere, and `cpu` must be the CPU
    /// it is assigned to.
    pub fn deallocate(&mut self, cpu: &mut AxPerCpuVs, hal: &mut H) -> AxResult {
        self.check_not_running()?;
        if let Some(pp) = self.active_pp {
            return ax_err!(
                BadState,
                format!("VS {:?} is still active on PP {}", self.id, pp)
            );
        }
        if self.vmcs.is_some() {
            self.check_assigned(cpu)?;
            debug!("VS {:?} deallocated", self.id);
        }
        self.reset(cpu, hal);
        Ok(())
    }

    /// Deallocate the VS and clear its id, so it can be initialized again.
    pub fn release(&mut self, cpu: &mut AxPerCpuVs, hal: &mut H) -> AxResult {
        self.deallocate(cpu, hal)?;
        self.id = None;
        Ok(())
    }

    /// Move the general-purpose registers of this VS into the register window of `cpu`,
    /// which must be the CPU the VS is assigned to.
    pub fn set_active(&mut self, cpu: &mut AxPerCpuVs) -> AxResult {
        self.check_allocated()?;
        self.check_not_running()?;
        self.check_assigned(cpu)?;
        if let Some(other) = cpu.active_vs {
            return ax_err!(
                BadState,
                format!("PP {} already has VS {:#x} active", cpu.cpu_id(), other)
            );
        }
        if let Some(pp) = self.active_pp {
            return ax_err!(
                BadState,
                format!("VS {:?} is already active on PP {}", self.id, pp)
            );
        }

        cpu.gprs.copy_from(&self.bank.gprs);
        cpu.active_vs = self.id;
        self.active_pp = Some(cpu.cpu_id());
        debug!("VS {:?} active on PP {}", self.id, cpu.cpu_id());
        Ok(())
    }

    /// Move the general-purpose registers of this VS back from the register window
    /// of `cpu`.
    pub fn set_inactive(&mut self, cpu: &mut AxPerCpuVs) -> AxResult {
        if self.id.is_none() || cpu.active_vs != self.id {
            return ax_err!(
                BadState,
                format!("VS {:?} is not active on PP {}", self.id, cpu.cpu_id())
            );
        }

        self.bank.gprs.copy_from(&cpu.gprs);
        cpu.active_vs = None;
        self.active_pp = None;
        debug!("VS {:?} inactive on PP {}", self.id, cpu.cpu_id());
        Ok(())
    }

    /// Flush the VMCS of this VS out of `cpu`, so the next run launches it afresh.
    ///
    /// `cpu` must be the CPU the VS is assigned to.
    pub fn clear(&mut self, cpu: &mut AxPerCpuVs, hal: &mut H) -> AxResult {
        let paddr = self.check_allocated()?.paddr;
        self.check_not_running()?;
        self.check_assigned(cpu)?;

        hal.vmclear(paddr)?;
        self.bank.missing.launched = false;
        if cpu.loaded_vs == self.id {
            cpu.loaded_vs = None;
        }
        debug!("VS {:?} cleared on PP {}", self.id, cpu.cpu_id());
        Ok(())
    }

    /// Reassign the VS to another CPU. `cpu` must be the CPU the VS is currently
    /// assigned to, where its VMCS is cleared before the reassignment.
    ///
    /// The assignment is left unchanged if the VMCS cannot be cleared.
    pub fn migrate(&mut self, cpu: &mut AxPerCpuVs, hal: &mut H, pp: u16) -> AxResult {
        self.check_allocated()?;
        let pp = check_id(pp, "PP")?;
        if let Some(active) = self.active_pp {
            return ax_err!(
                BadState,
                format!("VS {:?} cannot migrate while active on PP {}", self.id, active)
            );
        }

        self.clear(cpu, hal)?;
        debug!(
            "VS {:?} migrated from PP {:?} to PP {}",
            self.id, self.assigned_pp, pp
        );
        self.assigned_pp = Some(pp);
        Ok(())
    }

    fn read_loaded(&self, cpu: &AxPerCpuVs, hal: &H, reg: VsReg) -> AxResult<u64> {
        match reg.location() {
            RegLocation::Unsupported => {
                ax_err!(Unsupported, format!("unsupported register {:?}", reg))
            }
            RegLocation::Gpr(index) => Ok(self.gprs(cpu).get(index)),
            RegLocation::Missing(missing) => Ok(self.bank.missing.guest(missing)),
            RegLocation::Vmcs(field) | RegLocation::Sanitized(field, _) => field.read(hal),
        }
    }

    fn write_loaded(
        &mut self,
        cpu: &mut AxPerCpuVs,
        hal: &mut H,
        reg: VsReg,
        value: u64,
    ) -> AxResult {
        match reg.location() {
            RegLocation::Unsupported => {
                ax_err!(Unsupported, format!("unsupported register {:?}", reg))
            }
            RegLocation::Gpr(index) => {
                self.regs_mut(cpu).0.set(index, value);
                Ok(())
            }
            RegLocation::Missing(MissingReg::Xcr0) => {
                self.bank.missing.guest_xcr0 = sanitize_xcr0(value);
                Ok(())
            }
            RegLocation::Missing(missing) => {
                *self.bank.missing.guest_mut(missing) = value;
                Ok(())
            }
            RegLocation::Vmcs(field) => field.write(hal, value),
            RegLocation::Sanitized(field, sanitizer) => {
                field.check(value)?;
                // The snapshot only changes once the write has gone through.
                let mut caps = self.caps;
                let value = match sanitizer {
                    Sanitizer::PinCtls => caps.sanitize_pin_ctls(value),
                    Sanitizer::ProcCtls => caps.sanitize_proc_ctls(value),
                    Sanitizer::ProcCtls2 => caps.sanitize_proc2_ctls(value),
                    Sanitizer::ExitCtls => caps.sanitize_exit_ctls(value),
                    Sanitizer::EntryCtls => caps.sanitize_entry_ctls(value),
                    Sanitizer::Cr0 => caps.sanitize_cr0(value),
                    Sanitizer::Cr4 => caps.sanitize_cr4(value),
                };
                field.write(hal, value)?;
                self.caps = caps;
                Ok(())
            }
        }
    }

    /// Read a register of the VS.
    pub fn read(&self, cpu: &mut AxPerCpuVs, hal: &mut H, reg: VsReg) -> AxResult<u64> {
        self.check_allocated()?;
        self.ensure_loaded(cpu, hal)?;
        self.read_loaded(cpu, hal, reg)
    }

    /// Write a register of the VS. Control fields and CR0/CR4/XCR0 are sanitized
    /// first, so reading them back may return a different value.
    ///
    /// Fails without side effect if `value` does not fit the register.
    pub fn write(&mut self, cpu: &mut AxPerCpuVs, hal: &mut H, reg: VsReg, value: u64) -> AxResult {
        self.check_allocated()?;
        self.ensure_loaded(cpu, hal)?;
        self.write_loaded(cpu, hal, reg, value)
    }

    fn set_segment(
        &mut self,
        cpu: &mut AxPerCpuVs,
        hal: &mut H,
        regs: &SegmentRegs,
        segment: &SegmentState,
    ) -> AxResult {
        let (attrib, limit, base) = if segment.selector == 0 {
            (VMCS_UNUSABLE_SEGMENT as u64, 0, 0)
        } else {
            (segment.attrib as u64, segment.limit as u64, segment.base)
        };
        self.write_loaded(cpu, hal, regs.selector, segment.selector as u64)?;
        self.write_loaded(cpu, hal, regs.attrib, attrib)?;
        self.write_loaded(cpu, hal, regs.limit, limit)?;
        self.write_loaded(cpu, hal, regs.base, base)
    }

    fn get_segment(&self, cpu: &AxPerCpuVs, hal: &H, regs: &SegmentRegs) -> AxResult<SegmentState> {
        let selector = self.read_loaded(cpu, hal, regs.selector)? as u16;
        if selector == 0 {
            return Ok(SegmentState::default());
        }
        Ok(SegmentState {
            selector,
            attrib: self.read_loaded(cpu, hal, regs.attrib)? as u16,
            limit: self.read_loaded(cpu, hal, regs.limit)? as u32,
            base: self.read_loaded(cpu, hal, regs.base)?,
        })
    }

    /// Load the complete guest state of the VS from `state`.
    pub fn state_save_to_vs(
        &mut self,
        cpu: &mut AxPerCpuVs,
        hal: &mut H,
        state: &GuestStateSave,
    ) -> AxResult {
        self.check_allocated()?;
        self.ensure_loaded(cpu, hal)?;

        let gprs = self.regs_mut(cpu).0;
        gprs.set(GprIndex::Rax, state.rax);
        gprs.set(GprIndex::Rbx, state.rbx);
        gprs.set(GprIndex::Rcx, state.rcx);
        gprs.set(GprIndex::Rdx, state.rdx);
        gprs.set(GprIndex::Rbp, state.rbp);
        gprs.set(GprIndex::Rsi, state.rsi);
        gprs.set(GprIndex::Rdi, state.rdi);
        gprs.set(GprIndex::R8, state.r8);
        gprs.set(GprIndex::R9, state.r9);
        gprs.set(GprIndex::R10, state.r10);
        gprs.set(GprIndex::R11, state.r11);
        gprs.set(GprIndex::R12, state.r12);
        gprs.set(GprIndex::R13, state.r13);
        gprs.set(GprIndex::R14, state.r14);
        gprs.set(GprIndex::R15, state.r15);

        let regs = [
            (VsReg::Rsp, state.rsp),
            (VsReg::Rip, state.rip),
            (VsReg::Rflags, state.rflags),
            (VsReg::GdtrLimit, state.gdtr.limit as u64),
            (VsReg::GdtrBase, state.gdtr.base),
            (VsReg::IdtrLimit, state.idtr.limit as u64),
            (VsReg::IdtrBase, state.idtr.base),
            (VsReg::Cr0, state.cr0),
            (VsReg::Cr2, state.cr2),
            (VsReg::Cr3, state.cr3),
            (VsReg::Cr4, state.cr4),
            (VsReg::Cr8, state.cr8),
            (VsReg::Xcr0, state.xcr0),
            (VsReg::Dr0, state.dr0),
            (VsReg::Dr1, state.dr1),
            (VsReg::Dr2, state.dr2),
            (VsReg::Dr3, state.dr3),
            (VsReg::Dr6, state.dr6),
            (VsReg::Dr7, state.dr7),
            (VsReg::Efer, state.msr_efer),
            (VsReg::Pat, state.msr_pat),
            (VsReg::Debugctl, state.msr_debugctl),
            (VsReg::SysenterCs, state.msr_sysenter_cs),
            (VsReg::SysenterEsp, state.msr_sysenter_esp),
            (VsReg::SysenterEip, state.msr_sysenter_eip),
            (VsReg::Star, state.msr_star),
            (VsReg::Lstar, state.msr_lstar),
            (VsReg::Cstar, state.msr_cstar),
            (VsReg::Fmask, state.msr_fmask),
            (VsReg::KernelGsBase, state.msr_kernel_gs_base),
        ];
        for (reg, value) in regs {
            self.write_loaded(cpu, hal, reg, value)?;
        }

        self.set_segment(cpu, hal, &ES, &state.es)?;
        self.set_segment(cpu, hal, &CS, &state.cs)?;
        self.set_segment(cpu, hal, &SS, &state.ss)?;
        self.set_segment(cpu, hal, &DS, &state.ds)?;
        self.set_segment(cpu, hal, &FS, &state.fs)?;
        self.set_segment(cpu, hal, &GS, &state.gs)?;
        self.set_segment(cpu, hal, &LDTR, &state.ldtr)?;
        self.set_segment(cpu, hal, &TR, &state.tr)
    }

    /// Take a snapshot of the complete guest state of the VS.
    pub fn vs_to_state_save(&self, cpu: &mut AxPerCpuVs, hal: &mut H) -> AxResult<GuestStateSave> {
        self.check_allocated()?;
        self.ensure_loaded(cpu, hal)?;

        let cpu = &*cpu;
        let hal = &*hal;
        let gprs = self.gprs(cpu);
        let missing = &self.bank.missing;
        let read = |reg: VsReg| self.read_loaded(cpu, hal, reg);

        Ok(GuestStateSave {
            rax: gprs.get(GprIndex::Rax),
            rbx: gprs.get(GprIndex::Rbx),
            rcx: gprs.get(GprIndex::Rcx),
            rdx: gprs.get(GprIndex::Rdx),
            rbp: gprs.get(GprIndex::Rbp),
            rsi: gprs.get(GprIndex::Rsi),
            rdi: gprs.get(GprIndex::Rdi),
            r8: gprs.get(GprIndex::R8),
            r9: gprs.get(GprIndex::R9),
            r10: gprs.get(GprIndex::R10),
            r11: gprs.get(GprIndex::R11),
            r12: gprs.get(GprIndex::R12),
            r13: gprs.get(GprIndex::R13),
            r14: gprs.get(GprIndex::R14),
            r15: gprs.get(GprIndex::R15),
            rsp: read(VsReg::Rsp)?,
            rip: read(VsReg::Rip)?,
            rflags: read(VsReg::Rflags)?,

            gdtr: DescriptorTableState {
                limit: read(VsReg::GdtrLimit)? as u16,
                base: read(VsReg::GdtrBase)?,
            },
            idtr: DescriptorTableState {
                limit: read(VsReg::IdtrLimit)? as u16,
                base: read(VsReg::IdtrBase)?,
            },

            es: self.get_segment(cpu, hal, &ES)?,
            cs: self.get_segment(cpu, hal, &CS)?,
            ss: self.get_segment(cpu, hal, &SS)?,
            ds: self.get_segment(cpu, hal, &DS)?,
            fs: self.get_segment(cpu, hal, &FS)?,
            gs: self.get_segment(cpu, hal, &GS)?,
            ldtr: self.get_segment(cpu, hal, &LDTR)?,
            tr: self.get_segment(cpu, hal, &TR)?,

            cr0: read(VsReg::Cr0)?,
            cr2: missing.guest_cr2,
            cr3: read(VsReg::Cr3)?,
            cr4: read(VsReg::Cr4)?,
            cr8: missing.guest_cr8,
            xcr0: missing.guest_xcr0,

            dr0: missing.guest_dr0,
            dr1: missing.guest_dr1,
            dr2: missing.guest_dr2,
            dr3: missing.guest_dr3,
            dr6: missing.guest_dr6,
            dr7: read(VsReg::Dr7)?,

            msr_efer: read(VsReg::Efer)?,
            msr_star: missing.guest_star,
            msr_lstar: missing.guest_lstar,
            msr_cstar: missing.guest_cstar,
            msr_fmask: missing.guest_fmask,
            msr_kernel_gs_base: missing.guest_kernel_gs_base,
            msr_sysenter_cs: read(VsReg::SysenterCs)?,
            msr_sysenter_esp: read(VsReg::SysenterEsp)?,
            msr_sysenter_eip: read(VsReg::SysenterEip)?,
            msr_pat: read(VsReg::Pat)?,
            msr_debugctl: read(VsReg::Debugctl)?,
        })
    }

    /// Run the guest until its next VM exit.
    ///
    /// An `Err` means the guest could not be entered at all; the VS should not
    /// be run again.
    pub fn run(&mut self, cpu: &mut AxPerCpuVs, hal: &mut H) -> AxResult<VmxExit> {
        self.check_allocated()?;
        self.ensure_loaded(cpu, hal)?;

        self.running_status = RunningStatus::Running;
        let (gprs, missing) = self.regs_mut(cpu);
        let result = hal.vmrun(gprs, missing);
        self.running_status = RunningStatus::HandlingExit;

        let exit = match result {
            Ok(raw) => VmxExit::new(raw),
            Err(err) => {
                error!("VS {:?} failed to enter the guest: {:?}", self.id, err);
                return Err(err);
            }
        };
        if !exit.is_entry_failure() {
            self.bank.missing.launched = true;
        }
        trace!("VS {:?} exit {:?}", self.id, exit);
        Ok(exit)
    }

    /// Step the guest past the instruction that caused the last exit.
    pub fn advance_ip(&mut self, cpu: &mut AxPerCpuVs, hal: &mut H) -> AxResult {
        self.check_allocated()?;
        self.ensure_loaded(cpu, hal)?;

        let rip = self.read_loaded(cpu, hal, VsReg::Rip)?;
        let len = self.read_loaded(cpu, hal, VsReg::VmexitInstructionLength)?;
        let Some(next) = rip.checked_add(len) else {
            return ax_err!(BadState, format!("RIP {:#x} + {} overflows", rip, len));
        };
        self.write_loaded(cpu, hal, VsReg::Rip, next)
    }

    fn invalidate(&self, cpu: &mut AxPerCpuVs, hal: &mut H, addr: Option<u64>) -> AxResult {
        self.check_allocated()?;
        self.ensure_loaded(cpu, hal)?;

        let vpid = self.read_loaded(cpu, hal, VsReg::VirtualProcessorIdentifier)? as u16;
        hal.invvpid(vpid, addr)
    }

    /// Invalidate every TLB entry tagged with this VS's VPID.
    pub fn tlb_flush(&self, cpu: &mut AxPerCpuVs, hal: &mut H) -> AxResult {
        self.invalidate(cpu, hal, None)
    }

    /// Invalidate the TLB entries of one guest linear address.
    pub fn tlb_flush_addr(&self, cpu: &mut AxPerCpuVs, hal: &mut H, gla: u64) -> AxResult {
        self.invalidate(cpu, hal, Some(gla))
    }
}

impl<H: AxVsHal> Default for AxVs<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: AxVsHal> Drop for AxVs<H> {
    fn drop(&mut self) {
        if self.is_allocated() {
            error!(
                "VS {:?} dropped while allocated, its VMCS page is leaked",
                self.id
            );
        }
    }
}
