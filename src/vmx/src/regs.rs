// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::ops::{Index, IndexMut};

use crate::vmcs::*;

pub const NR_GP_REGS: usize = 16;

/// General-purpose registers in Intel instruction encoding order, the order
/// the mov-CR exit qualification and the world-switch save area use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum GpReg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
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

impl GpReg {
    /// Decodes a register number from an exit qualification.
    pub fn from_index(index: usize) -> Option<GpReg> {
        use GpReg::*;
        const ORDER: [GpReg; NR_GP_REGS] = [
            Rax, Rcx, Rdx, Rbx, Rsp, Rbp, Rsi, Rdi, R8, R9, R10, R11, R12, R13, R14, R15,
        ];
        ORDER.get(index).copied()
    }
}

/// The architectural register state that travels through the world switch in
/// software. rsp lives in the GP array for encoding purposes but the
/// hardware-resident copy in the control structure is authoritative; the run
/// path mirrors it around each switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterFile {
    pub gp: [u64; NR_GP_REGS],
    pub rip: u64,
    pub rflags: u64,
}

impl Default for RegisterFile {
    fn default() -> RegisterFile {
        RegisterFile {
            gp: [0; NR_GP_REGS],
            rip: 0,
            // Bit 1 is reserved-set in RFLAGS.
            rflags: 0x2,
        }
    }
}

impl Index<GpReg> for RegisterFile {
    type Output = u64;

    fn index(&self, reg: GpReg) -> &u64 {
        &self.gp[reg as usize]
    }
}

impl IndexMut<GpReg> for RegisterFile {
    fn index_mut(&mut self, reg: GpReg) -> &mut u64 {
        &mut self.gp[reg as usize]
    }
}

/// Segment registers in VMCS field-block order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegReg {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

impl SegReg {
    /// VMCS field encodings for this segment: selector, base, limit and
    /// access rights. The four blocks are laid out with a uniform stride.
    pub fn fields(self) -> (u32, u32, u32, u32) {
        let i = self as u32;
        (
            GUEST_ES_SELECTOR + 2 * i,
            GUEST_ES_BASE + 2 * i,
            GUEST_ES_LIMIT + 2 * i,
            GUEST_ES_AR_BYTES + 2 * i,
        )
    }
}

/// One segment register's architectural state, KVM-shaped: the packed VMX
/// access-rights byte pair is exploded into its bit fields.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub base: u64,
    pub limit: u32,
    pub selector: u16,
    pub type_: u8,
    pub present: u8,
    pub dpl: u8,
    pub db: u8,
    pub s: u8,
    pub l: u8,
    pub g: u8,
    pub avl: u8,
    pub unusable: u8,
}

impl Segment {
    /// Packs the bit fields into the VMX access-rights format.
    pub fn access_rights(&self) -> u64 {
        u64::from(self.type_ & 0xf)
            | (u64::from(self.s & 0x1) << 4)
            | (u64::from(self.dpl & 0x3) << 5)
            | (u64::from(self.present & 0x1) << 7)
            | (u64::from(self.avl & 0x1) << 12)
            | (u64::from(self.l & 0x1) << 13)
            | (u64::from(self.db & 0x1) << 14)
            | (u64::from(self.g & 0x1) << 15)
            | (u64::from(self.unusable & 0x1) << 16)
    }

    /// Rebuilds the bit fields from a VMX access-rights value.
    pub fn from_access_rights(selector: u16, base: u64, limit: u32, ar: u64) -> Segment {
        Segment {
            base,
            limit,
            selector,
            type_: (ar & 0xf) as u8,
            s: ((ar >> 4) & 0x1) as u8,
            dpl: ((ar >> 5) & 0x3) as u8,
            present: ((ar >> 7) & 0x1) as u8,
            avl: ((ar >> 12) & 0x1) as u8,
            l: ((ar >> 13) & 0x1) as u8,
            db: ((ar >> 14) & 0x1) as u8,
            g: ((ar >> 15) & 0x1) as u8,
            unusable: ((ar >> 16) & 0x1) as u8,
        }
    }
}

/// GDTR/IDTR state.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorTable {
    pub base: u64,
    pub limit: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gp_encoding_order() {
        assert_eq!(GpReg::from_index(0), Some(GpReg::Rax));
        assert_eq!(GpReg::from_index(1), Some(GpReg::Rcx));
        assert_eq!(GpReg::from_index(4), Some(GpReg::Rsp));
        assert_eq!(GpReg::from_index(15), Some(GpReg::R15));
        assert_eq!(GpReg::from_index(16), None);
    }

    #[test]
    fn register_file_indexing() {
        let mut regs = RegisterFile::default();
        regs[GpReg::Rax] = 0xdead_beef;
        assert_eq!(regs.gp[0], 0xdead_beef);
        assert_eq!(regs[GpReg::Rax], 0xdead_beef);
        assert_eq!(regs.rflags, 0x2);
    }

    #[test]
    fn segment_field_stride() {
        use crate::vmcs::*;
        assert_eq!(
            SegReg::Cs.fields(),
            (GUEST_CS_SELECTOR, GUEST_CS_BASE, GUEST_CS_LIMIT, GUEST_CS_AR_BYTES)
        );
        assert_eq!(
            SegReg::Tr.fields(),
            (GUEST_TR_SELECTOR, GUEST_TR_BASE, GUEST_TR_LIMIT, GUEST_TR_AR_BYTES)
        );
    }

    #[test]
    fn access_rights_roundtrip() {
        let seg = Segment {
            base: 0,
            limit: 0xffff,
            selector: 0x10,
            type_: 0xb,
            present: 1,
            dpl: 0,
            db: 0,
            s: 1,
            l: 1,
            g: 1,
            avl: 0,
            unusable: 0,
        };
        let ar = seg.access_rights();
        let back = Segment::from_access_rights(0x10, 0, 0xffff, ar);
        assert_eq!(seg, back);
    }

    #[test]
    fn unusable_segment_bit() {
        let seg = Segment {
            unusable: 1,
            ..Segment::default()
        };
        assert_eq!(seg.access_rights() & (1 << 16), 1 << 16);
    }
}
