// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The KVM-shaped control surface: opcode-tagged requests, their payload
//! structs, and the fixed ABI constants clients probe for.

use std::sync::{Arc, Mutex};

use vm_memory::GuestAddress;
use vmx::{DescriptorTable, Segment};

use crate::run::RunOutcome;
use crate::PAGE_SIZE;

pub const KVM_API_VERSION: u32 = 12;

/// Two pages per vCPU: the run header and the port-I/O data page.
pub const KVM_PIO_PAGE_OFFSET: u64 = 1;
pub const VCPU_MMAP_SIZE: u64 = PAGE_SIZE * 2;

// Capability numbers, Linux uapi values.
pub const KVM_CAP_IRQCHIP: u32 = 0;
pub const KVM_CAP_USER_MEMORY: u32 = 3;
pub const KVM_CAP_SET_TSS_ADDR: u32 = 4;
pub const KVM_CAP_EXT_CPUID: u32 = 7;
pub const KVM_CAP_MP_STATE: u32 = 14;
pub const KVM_CAP_SYNC_MMU: u32 = 16;
pub const KVM_CAP_DESTROY_MEMORY_REGION_WORKS: u32 = 21;
pub const KVM_CAP_JOIN_MEMORY_REGIONS_WORKS: u32 = 30;
pub const KVM_CAP_TSC_CONTROL: u32 = 60;

/// Extensions the extension query answers 1 for; everything else is 0.
pub const SUPPORTED_EXTENSIONS: &[u32] = &[
    KVM_CAP_USER_MEMORY,
    KVM_CAP_SET_TSS_ADDR,
    KVM_CAP_EXT_CPUID,
    KVM_CAP_MP_STATE,
    KVM_CAP_SYNC_MMU,
    KVM_CAP_DESTROY_MEMORY_REGION_WORKS,
    KVM_CAP_JOIN_MEMORY_REGIONS_WORKS,
    KVM_CAP_TSC_CONTROL,
];

// Exit kinds reported through the run header.
pub const KVM_EXIT_IO: u32 = 2;
pub const KVM_EXIT_IO_IN: u8 = 0;
pub const KVM_EXIT_IO_OUT: u8 = 1;

pub const MSR_IA32_TSC_ADJUST: u32 = 0x3b;
pub const MSR_IA32_MCG_STATUS: u32 = 0x17a;
pub const MSR_IA32_MCG_CTL: u32 = 0x17b;
pub const MSR_IA32_MISC_ENABLE: u32 = 0x1a0;
pub const MSR_IA32_TSCDEADLINE: u32 = 0x6e0;

/// MSRs the monitor claims to emulate.
pub const MSR_INDEX_LIST: &[u32] = &[
    MSR_IA32_TSC_ADJUST,
    MSR_IA32_TSCDEADLINE,
    MSR_IA32_MISC_ENABLE,
    MSR_IA32_MCG_STATUS,
    MSR_IA32_MCG_CTL,
];

/// (function, index) pairs the supported-CPUID query reports, filled from
/// the host processor at query time.
pub const SUPPORTED_CPUID_LEAVES: &[(u32, u32)] = &[
    (0x4000_0000, 0),
    (0x4000_0001, 0),
    (0, 0),
    (1, 0),
    (2, 0),
    (3, 0),
    (4, 0),
    (4, 1),
    (4, 2),
    (4, 3),
    (0x8000_0000, 0),
    (0x8000_0001, 0),
    (0x8000_0002, 0),
    (0x8000_0003, 0),
    (0x8000_0004, 0),
];

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Regs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rsp: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Sregs {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
    pub tr: Segment,
    pub ldt: Segment,
    pub gdt: DescriptorTable,
    pub idt: DescriptorTable,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub efer: u64,
    pub apic_base: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct UserMemoryRegion {
    pub slot: u32,
    pub flags: u32,
    pub guest_phys_addr: GuestAddress,
    pub memory_size: u64,
    pub userspace_addr: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuidEntry {
    pub function: u32,
    pub index: u32,
    pub flags: u32,
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsrEntry {
    pub index: u32,
    pub data: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct IrqLevel {
    pub irq: u32,
    pub level: u32,
}

/// Programmable-interval-timer state, carried opaquely: three channels of
/// 24 bytes, the Linux uapi layout.
#[derive(Debug, Clone, Copy)]
pub struct PitState(pub [u8; 72]);

impl Default for PitState {
    fn default() -> PitState {
        PitState([0; 72])
    }
}

/// Interrupt-controller state, carried opaquely.
#[derive(Debug, Clone, Copy)]
pub struct IrqchipState(pub [u8; 512]);

impl Default for IrqchipState {
    fn default() -> IrqchipState {
        IrqchipState([0; 512])
    }
}

/// FPU state, carried opaquely: the Linux uapi `kvm_fpu` layout. The guest
/// FPU is never context-switched by the monitor, so get/set are accepted
/// without touching hardware.
#[derive(Debug, Clone, Copy)]
pub struct FpuState(pub [u8; 416]);

impl Default for FpuState {
    fn default() -> FpuState {
        FpuState([0; 416])
    }
}

/// The I/O block of the run header, valid while `exit_reason` is
/// `KVM_EXIT_IO`. `data_offset` locates the transfer buffer within the
/// mapped region; it is always the second page.
#[derive(Debug, Default, Clone, Copy)]
pub struct IoBlock {
    pub direction: u8,
    pub size: u8,
    pub port: u16,
    pub count: u32,
    pub data_offset: u64,
}

/// The region a map-vCPU request exposes: the run header page plus the
/// port-I/O data page behind it.
pub struct RunPage {
    pub exit_reason: u32,
    pub io: IoBlock,
    pub pio_data: [u8; PAGE_SIZE as usize],
}

impl Default for RunPage {
    fn default() -> RunPage {
        RunPage {
            exit_reason: 0,
            io: IoBlock::default(),
            pio_data: [0; PAGE_SIZE as usize],
        }
    }
}

/// One control-surface operation with its payload.
#[derive(Debug)]
pub enum Request {
    ApiVersion,
    CheckExtension(u32),
    CreateVm,
    CreateVcpu(u64),
    VcpuMmapSize,
    MapVcpu,
    SetUserMemoryRegion(UserMemoryRegion),
    GetRegs,
    SetRegs(Regs),
    GetSregs,
    SetSregs(Sregs),
    Run,
    IrqLine(IrqLevel),
    SetCpuid(Vec<CpuidEntry>),
    SetMsrs(Vec<MsrEntry>),
    GetSupportedCpuid { max_entries: usize },
    GetMsrIndexList { max_indices: usize },
    GetPit,
    SetPit(PitState),
    GetIrqchip,
    SetIrqchip(IrqchipState),
    // Accepted as validated no-ops.
    GetFpu,
    SetFpu(FpuState),
    CreateIrqchip,
    CreatePit,
    SetTssAddr(u64),
    SetIdentityMapAddr(u64),
    SetSignalMask(u64),
}

pub enum Response {
    Unit,
    Number(u64),
    Regs(Regs),
    Sregs(Sregs),
    RunPage(Arc<Mutex<RunPage>>),
    RunOutcome(RunOutcome),
    Cpuid(Vec<CpuidEntry>),
    MsrIndices(Vec<u32>),
    Pit(PitState),
    Irqchip(IrqchipState),
    Fpu(FpuState),
}
