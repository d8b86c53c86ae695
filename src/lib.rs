// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxVs - The Intel VMX virtual processor state of a thin hypervisor.
//!
//! This crate owns the VMCS of each guest virtual processor, mediates every read
//! and write of its state and drives the hardware round-trip into and out of the
//! guest. Everything it needs from the host (pages, MSRs, the VMX instructions)
//! is reached through the [`AxVsHal`] trait.
//!
//! # Features
//!
//! - Allocation, activation, migration and clearing of virtual processor states
//! - Register access by a stable symbolic name ([`VsReg`]), dispatched through a static table
//! - Sanitization of control fields against the capabilities the CPU reports
//! - Bulk guest state save and restore ([`GuestStateSave`])
//! - The VM entry/exit loop, instruction pointer advance and VPID TLB invalidation

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;

// Core modules
mod exit; // VM exit information returned by a run
mod hal; // Hardware abstraction layer interfaces
mod percpu; // Per-CPU loaded/active state and host state
mod reg; // Symbolic register names and their dispatch table
mod regs; // Register bank: state the VMCS does not hold
mod sanitize; // Control field sanitization against VMX capabilities
mod state; // Bulk guest state exchanged with the orchestrator
mod vmcs; // VMCS region and width-typed field access
mod vs; // Main VS implementation and state management

// Public API exports
pub use exit::{VmxExit, VmxExitReason}; // VM exit information
pub use hal::AxVsHal; // Hardware abstraction layer trait
pub use percpu::{AxPerCpuVs, HostState}; // Per-CPU state management types
pub use reg::{RegLocation, Sanitizer, VsReg};
pub use regs::{GeneralRegisters, GprIndex, MissingReg, MissingRegisters, RegisterBank};
pub use sanitize::{FixedBits, VmxCapabilities};
pub use state::{DescriptorTableState, GuestStateSave, SegmentState};
pub use vmcs::{VmcsField, VmcsFieldWidth, VmcsRegion, VMCS_SIZE, VMCS_UNUSABLE_SEGMENT};
pub use vs::*; // Main VS types and functions
