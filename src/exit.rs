/// Basic VM-exit reasons (Intel SDM Vol. 3D, Appendix C).
///
/// The VS does not interpret exits, this only names them for the caller.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum VmxExitReason {
    ExceptionNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    Init = 3,
    Sipi = 4,
    IoSmi = 5,
    OtherSmi = 6,
    InterruptWindow = 7,
    NmiWindow = 8,
    TaskSwitch = 9,
    Cpuid = 10,
    Getsec = 11,
    Hlt = 12,
    Invd = 13,
    Invlpg = 14,
    Rdpmc = 15,
    Rdtsc = 16,
    Rsm = 17,
    Vmcall = 18,
    Vmclear = 19,
    Vmlaunch = 20,
    Vmptrld = 21,
    Vmptrst = 22,
    Vmread = 23,
    Vmresume = 24,
    Vmwrite = 25,
    Vmoff = 26,
    Vmon = 27,
    CrAccess = 28,
    DrAccess = 29,
    IoInstruction = 30,
    MsrRead = 31,
    MsrWrite = 32,
    InvalidGuestState = 33,
    MsrLoadFail = 34,
    Mwait = 36,
    MonitorTrapFlag = 37,
    Monitor = 39,
    Pause = 40,
    MachineCheck = 41,
    TprBelowThreshold = 43,
    ApicAccess = 44,
    VirtualizedEoi = 45,
    GdtrIdtrAccess = 46,
    LdtrTrAccess = 47,
    EptViolation = 48,
    EptMisconfig = 49,
    Invept = 50,
    Rdtscp = 51,
    PreemptionTimer = 52,
    Invvpid = 53,
    Wbinvd = 54,
    Xsetbv = 55,
    ApicWrite = 56,
    Rdrand = 57,
    Invpcid = 58,
    Vmfunc = 59,
    Encls = 60,
    Rdseed = 61,
    PmlFull = 62,
    Xsaves = 63,
    Xrstors = 64,
}

impl TryFrom<u16> for VmxExitReason {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        use VmxExitReason::*;
        Ok(match value {
            0 => ExceptionNmi,
            1 => ExternalInterrupt,
            2 => TripleFault,
            3 => Init,
            4 => Sipi,
            5 => IoSmi,
            6 => OtherSmi,
            7 => InterruptWindow,
            8 => NmiWindow,
            9 => TaskSwitch,
            10 => Cpuid,
            11 => Getsec,
            12 => Hlt,
            13 => Invd,
            14 => Invlpg,
            15 => Rdpmc,
            16 => Rdtsc,
            17 => Rsm,
            18 => Vmcall,
            19 => Vmclear,
            20 => Vmlaunch,
            21 => Vmptrld,
            22 => Vmptrst,
            23 => Vmread,
            24 => Vmresume,
            25 => Vmwrite,
            26 => Vmoff,
            27 => Vmon,
            28 => CrAccess,
            29 => DrAccess,
            30 => IoInstruction,
            31 => MsrRead,
            32 => MsrWrite,
            33 => InvalidGuestState,
            34 => MsrLoadFail,
            36 => Mwait,
            37 => MonitorTrapFlag,
            39 => Monitor,
            40 => Pause,
            41 => MachineCheck,
            43 => TprBelowThreshold,
            44 => ApicAccess,
            45 => VirtualizedEoi,
            46 => GdtrIdtrAccess,
            47 => LdtrTrAccess,
            48 => EptViolation,
            49 => EptMisconfig,
            50 => Invept,
            51 => Rdtscp,
            52 => PreemptionTimer,
            53 => Invvpid,
            54 => Wbinvd,
            55 => Xsetbv,
            56 => ApicWrite,
            57 => Rdrand,
            58 => Invpcid,
            59 => Vmfunc,
            60 => Encls,
            61 => Rdseed,
            62 => PmlFull,
            63 => Xsaves,
            64 => Xrstors,
            other => return Err(other),
        })
    }
}

/// What [`crate::AxVs::run`] returns when the guest exits back to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmxExit {
    raw: u64,
}

impl VmxExit {
    const ENTRY_FAILURE: u64 = 1 << 31;

    /// Wraps the exit reason returned by [`crate::AxVsHal::vmrun`].
    pub const fn new(raw: u64) -> Self {
        Self { raw }
    }

    /// The exit reason exactly as the hardware reported it.
    pub const fn raw(&self) -> u64 {
        self.raw
    }

    /// Bits 15:0 of the exit reason.
    pub const fn basic(&self) -> u16 {
        self.raw as u16
    }

    /// The basic exit reason, or the raw number if it is not one we know.
    pub fn reason(&self) -> Result<VmxExitReason, u16> {
        VmxExitReason::try_from(self.basic())
    }

    /// Whether the exit happened while loading guest state during VM entry.
    pub const fn is_entry_failure(&self) -> bool {
        self.raw & Self::ENTRY_FAILURE != 0
    }
}
