// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Hardware-interface definitions for the VT-x control core: VMCS field
//! encodings, exit-reason decoding, the architectural register file, and the
//! traits abstracting the machine-specific world-switch primitive and direct
//! host-processor access.

mod exits;
mod regs;
pub mod vmcs;

pub use exits::{CrAccess, CrAccessKind, ExitReason, ExitRecord, IoAccess};
pub use regs::{DescriptorTable, GpReg, RegisterFile, SegReg, Segment, NR_GP_REGS};

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("world switch failed")]
    WorldSwitch,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Values returned by one CPUID leaf query.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// The hardware control structure and the world-switch primitive.
///
/// The structure is a single-owner, single-processor-resident resource: field
/// access is only valid between `load` and `clear`, and `world_switch` saves
/// the host register file, loads the guest register file, runs guest code
/// until a trap, restores the host register file and leaves the exit fields
/// readable through `read`.
pub trait VmControl: Send {
    /// Makes the control structure resident on the current processor.
    fn load(&mut self);

    /// Clears residency so the structure may migrate between processors.
    fn clear(&mut self);

    fn read(&self, field: u32) -> u64;

    fn write(&mut self, field: u32, value: u64);

    /// Runs guest code until the hardware traps back to the monitor.
    ///
    /// `regs` holds the guest general-purpose registers across the switch;
    /// rip, rsp and rflags travel through the control structure and must be
    /// staged/collected by the caller.
    fn world_switch(&mut self, regs: &mut RegisterFile) -> Result<()>;
}

/// Direct access to the host processor, used where emulation intentionally
/// falls through to real hardware (CPUID leaves without an override, MSR
/// reads without a table entry) and for the host-signal probe of the
/// external-interrupt path.
pub trait HostCpu: Send + Sync {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult;

    fn rdmsr(&self, index: u32) -> u64;

    /// Whether the calling thread has a host signal pending delivery.
    fn signal_pending(&self) -> bool;
}
