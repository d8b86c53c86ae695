//! The VMCS page and width-typed access to its fields.

use axerrno::{ax_err, ax_err_type, AxResult};

use crate::AxVsHal;

/// Size of a VMCS region.
pub const VMCS_SIZE: usize = 4096;

/// Access-rights value marking a guest segment register as unusable.
pub const VMCS_UNUSABLE_SEGMENT: u32 = 0x1_0000;

/// A VMCS region. Software only ever touches the header.
#[repr(C, align(4096))]
pub struct VmcsRegion {
    pub revision_id: u32,
    pub abort_indicator: u32,
    pub reserved: [u8; VMCS_SIZE - 8],
}

impl VmcsRegion {
    /// A zero-filled region, as handed out by the page pool.
    pub const fn zeroed() -> Self {
        Self {
            revision_id: 0,
            abort_indicator: 0,
            reserved: [0; VMCS_SIZE - 8],
        }
    }
}

/// The width of a VMCS field, encoded in bits 14:13 of its encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsFieldWidth {
    Bit16,
    Bit64,
    Bit32,
    Natural,
}

impl VmcsFieldWidth {
    /// Largest value a field of this width can hold.
    pub const fn max(self) -> u64 {
        match self {
            Self::Bit16 => u16::MAX as u64,
            Self::Bit32 => u32::MAX as u64,
            Self::Bit64 | Self::Natural => u64::MAX,
        }
    }
}

/// A VMCS field, named by its hardware encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmcsField(pub u32);

impl VmcsField {
    /// The raw field encoding.
    pub const fn encoding(self) -> u32 {
        self.0
    }

    /// The width of the field.
    pub const fn width(self) -> VmcsFieldWidth {
        match (self.0 >> 13) & 0b11 {
            0 => VmcsFieldWidth::Bit16,
            1 => VmcsFieldWidth::Bit64,
            2 => VmcsFieldWidth::Bit32,
            _ => VmcsFieldWidth::Natural,
        }
    }

    /// Reads the field from the current VMCS.
    pub fn read<H: AxVsHal>(self, hal: &H) -> AxResult<u64> {
        if !hal.vmcs_field_exists(self.0) {
            return ax_err!(
                Unsupported,
                format_args!("VMCS field {:#x} is not supported", self.0)
            );
        }
        Ok(hal.vmread(self.0)? & self.width().max())
    }

    /// Fails if `value` is wider than the field.
    pub fn check(self, value: u64) -> AxResult {
        if value > self.width().max() {
            return Err(ax_err_type!(
                InvalidInput,
                format_args!(
                    "{:#x} does not fit the {:?} VMCS field {:#x}",
                    value,
                    self.width(),
                    self.0
                )
            ));
        }
        Ok(())
    }

    /// Writes the field of the current VMCS. Values wider than the field are
    /// rejected before the hardware is touched.
    pub fn write<H: AxVsHal>(self, hal: &mut H, value: u64) -> AxResult {
        self.check(value)?;
        if !hal.vmcs_field_exists(self.0) {
            return ax_err!(
                Unsupported,
                format_args!("VMCS field {:#x} is not supported", self.0)
            );
        }
        hal.vmwrite(self.0, value)
    }
}
