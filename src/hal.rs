use core::ptr::NonNull;

use axerrno::AxResult;
use memory_addr::{PhysAddr, VirtAddr};

use crate::regs::{GeneralRegisters, MissingRegisters};
use crate::vmcs::VmcsRegion;

/// The interfaces which the underlying software (kernel or hypervisor) must implement.
///
/// All methods act on the physical CPU the caller is executing on. VMCS field
/// accesses target the VMCS most recently loaded with [`AxVsHal::vmptrld`] on
/// that CPU.
pub trait AxVsHal {
    /// Allocates a zero-filled, page-aligned VMCS region. Returns `None` when the
    /// page pool is exhausted.
    fn alloc_vmcs_page(&mut self) -> Option<NonNull<VmcsRegion>>;

    /// Returns a region obtained from [`AxVsHal::alloc_vmcs_page`] to the page pool.
    fn dealloc_vmcs_page(&mut self, page: NonNull<VmcsRegion>);

    /// Converts a host virtual address to a host physical address.
    ///
    /// # Parameters
    ///
    /// * `vaddr` - The virtual address to convert.
    ///
    /// # Returns
    ///
    /// * `PhysAddr` - The corresponding physical address.
    fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr;

    /// Reads a model-specific register. Used for the VMX capability MSRs and the
    /// host MSRs captured when a VMCS is set up.
    fn rdmsr(&self, msr: u32) -> u64;

    /// Whether this CPU implements the VMCS field with the given encoding.
    fn vmcs_field_exists(&self, field: u32) -> bool {
        let _ = field;
        true
    }

    /// `VMREAD` from the current VMCS.
    fn vmread(&self, field: u32) -> AxResult<u64>;

    /// `VMWRITE` to the current VMCS. The value already fits the field.
    fn vmwrite(&mut self, field: u32, value: u64) -> AxResult;

    /// `VMPTRLD`: makes the VMCS at `vmcs` current on this CPU.
    fn vmptrld(&mut self, vmcs: PhysAddr) -> AxResult;

    /// `VMCLEAR`: flushes the VMCS at `vmcs` to memory and resets its launch state.
    fn vmclear(&mut self, vmcs: PhysAddr) -> AxResult;

    /// Enters the guest described by the current VMCS and returns the exit reason
    /// once it exits.
    ///
    /// `gprs` holds the guest general-purpose registers and is updated with their
    /// values at exit. The guest half of `missing` is loaded before entry and saved
    /// after exit, the host half the other way round. `missing.launched` selects
    /// `VMRESUME` over `VMLAUNCH`.
    ///
    /// An `Err` means the guest never ran (`VMfailValid`/`VMfailInvalid`).
    fn vmrun(
        &mut self,
        gprs: &mut GeneralRegisters,
        missing: &mut MissingRegisters,
    ) -> AxResult<u64>;

    /// `INVVPID`: invalidates the translations tagged with `vpid`, either all of
    /// them or only those for the guest linear address `addr`.
    fn invvpid(&mut self, vpid: u16, addr: Option<u64>) -> AxResult;
}
