// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! VM-exit reason numbering and exit-qualification decoding.

use crate::regs::GpReg;

/// Basic exit reasons the monitor dispatches on. The numbering is the
/// hardware's; anything outside the handled set lands in `Unknown` and is
/// treated as fatal by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ExternalInterrupt,
    InterruptWindow,
    TaskSwitch,
    Cpuid,
    CrAccess,
    DrAccess,
    IoInstruction,
    MsrRead,
    MsrWrite,
    ApicAccess,
    EptViolation,
    PreemptionTimer,
    Unknown(u32),
}

impl ExitReason {
    pub fn from_code(code: u32) -> ExitReason {
        // Bit 31 flags VM-entry failure; the basic reason is the low 16 bits.
        match code & 0xffff {
            1 => ExitReason::ExternalInterrupt,
            7 => ExitReason::InterruptWindow,
            9 => ExitReason::TaskSwitch,
            10 => ExitReason::Cpuid,
            28 => ExitReason::CrAccess,
            29 => ExitReason::DrAccess,
            30 => ExitReason::IoInstruction,
            31 => ExitReason::MsrRead,
            32 => ExitReason::MsrWrite,
            44 => ExitReason::ApicAccess,
            48 => ExitReason::EptViolation,
            52 => ExitReason::PreemptionTimer,
            other => ExitReason::Unknown(other),
        }
    }
}

/// Everything the dispatcher needs from one trap, captured from the control
/// structure right after the world switch while the fields are still live.
#[derive(Debug, Clone, Copy)]
pub struct ExitRecord {
    pub reason: ExitReason,
    pub qualification: u64,
    pub guest_physical: u64,
    pub instruction_len: u64,
    pub instruction_error: u64,
}

/// A decoded I/O-instruction exit qualification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoAccess {
    pub port: u16,
    pub size: u8,
    pub is_in: bool,
    pub is_string: bool,
    pub has_rep: bool,
}

impl IoAccess {
    pub fn decode(qualification: u64) -> IoAccess {
        IoAccess {
            // Access size is encoded as size - 1 in bits 2:0.
            size: ((qualification & 0x7) + 1) as u8,
            is_in: qualification & (1 << 3) != 0,
            is_string: qualification & (1 << 4) != 0,
            has_rep: qualification & (1 << 5) != 0,
            port: (qualification >> 16) as u16,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrAccessKind {
    MovToCr,
    MovFromCr,
    Clts,
    Lmsw,
}

/// A decoded control-register-access exit qualification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrAccess {
    pub cr: u8,
    pub kind: CrAccessKind,
    /// GP register moved to/from the control register; absent for
    /// clts/lmsw forms.
    pub reg: Option<GpReg>,
}

impl CrAccess {
    pub fn decode(qualification: u64) -> CrAccess {
        let kind = match (qualification >> 4) & 0x3 {
            0 => CrAccessKind::MovToCr,
            1 => CrAccessKind::MovFromCr,
            2 => CrAccessKind::Clts,
            _ => CrAccessKind::Lmsw,
        };
        CrAccess {
            cr: (qualification & 0xf) as u8,
            kind,
            reg: GpReg::from_index(((qualification >> 8) & 0xf) as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reason_codes() {
        assert_eq!(ExitReason::from_code(10), ExitReason::Cpuid);
        assert_eq!(ExitReason::from_code(30), ExitReason::IoInstruction);
        assert_eq!(ExitReason::from_code(48), ExitReason::EptViolation);
        assert_eq!(ExitReason::from_code(55), ExitReason::Unknown(55));
        // Entry-failure bit does not change the basic reason.
        assert_eq!(ExitReason::from_code(0x8000_0001), ExitReason::ExternalInterrupt);
    }

    #[test]
    fn io_decode() {
        // out 0x3f8, al: size 1, out, port 0x3f8.
        let access = IoAccess::decode(0x03f8_0000);
        assert_eq!(access.port, 0x3f8);
        assert_eq!(access.size, 1);
        assert!(!access.is_in);

        // in ax, 0x64: size 2, in.
        let access = IoAccess::decode(0x0064_0009);
        assert_eq!(access.port, 0x64);
        assert_eq!(access.size, 2);
        assert!(access.is_in);
    }

    #[test]
    fn cr_decode() {
        // mov cr3, rax
        let access = CrAccess::decode(0x0000_0003);
        assert_eq!(access.cr, 3);
        assert_eq!(access.kind, CrAccessKind::MovToCr);
        assert_eq!(access.reg, Some(GpReg::Rax));

        // mov rbx, cr3
        let access = CrAccess::decode(0x0000_0313);
        assert_eq!(access.cr, 3);
        assert_eq!(access.kind, CrAccessKind::MovFromCr);
        assert_eq!(access.reg, Some(GpReg::Rbx));
    }
}
