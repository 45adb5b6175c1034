// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-vCPU state and lifecycle: the software register file, control-register
//! shadows, interrupt-line state, the shared run page, and the initial
//! hardware configuration applied at create-VM.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::debug;
use vm_memory::GuestAddress;
use vmx::vmcs::*;
use vmx::{GpReg, HostCpu, RegisterFile, SegReg, Segment, VmControl};

use crate::abi::{CpuidEntry, RunPage, Sregs};
use crate::ept::{Ept, TableFrame, TableFrames};
use crate::Result;

pub const IRQ_MAX: usize = 16;

/// Local APIC page the access-trap page is mapped over.
pub const APIC_BASE: u64 = 0xfee0_0000;

/// A level transition pends an interrupt only on the rising edge.
pub(crate) fn rising_edge(prev: u32, new: u32) -> bool {
    prev == 0 && new == 1
}

/// Interrupt-line state, locked separately from the vCPU so lines can be
/// toggled while the run loop is inside guest code.
#[derive(Debug, Default)]
pub struct IrqState {
    levels: [u32; IRQ_MAX],
    pending: u32,
}

impl IrqState {
    pub fn new() -> IrqState {
        IrqState::default()
    }

    /// Drives one line to a level; edge-triggered, so re-asserting an
    /// already-high line pends nothing.
    pub fn set_line(&mut self, irq: usize, level: u32) {
        if rising_edge(self.levels[irq], level) {
            self.pending |= 1 << irq;
        }
        self.levels[irq] = level;
    }

    /// Pends a line directly, bypassing edge detection. The external
    /// interrupt handler uses this to run the guest timer in lockstep with
    /// the host tick.
    pub fn pend(&mut self, irq: usize) {
        self.pending |= 1 << irq;
    }

    pub fn pending(&self) -> u32 {
        self.pending
    }

    /// Claims the lowest pending line for injection.
    pub fn take_lowest(&mut self) -> Option<u8> {
        for irq in 0..IRQ_MAX {
            if self.pending & (1 << irq) != 0 {
                self.pending &= !(1 << irq);
                return Some(irq as u8);
            }
        }
        None
    }
}

/// One virtual processor. Exactly one exists per VM handle; it is created by
/// create-VM and torn down with the handle. All fields are guarded by the
/// per-vCPU lock the registry wraps around this struct, except `irq` which
/// carries its own lock.
pub struct Vcpu {
    pub(crate) regs: RegisterFile,
    pub(crate) cr2: u64,
    /// Guest's idea of CR3; the hardware field holds the same value but
    /// reads are answered from here.
    pub(crate) cr3_shadow: u64,
    pub(crate) paging: bool,
    /// An in-instruction is waiting for userspace to fill the pio page.
    pub(crate) pending_io: bool,
    pub(crate) cpuid_overrides: FxHashMap<(u32, u32), CpuidEntry>,
    pub(crate) msrs: FxHashMap<u32, u64>,
    pub(crate) run: Arc<Mutex<RunPage>>,
    pub(crate) ept: Ept,
    pub(crate) irq: Arc<Mutex<IrqState>>,
    pub(crate) hw: Box<dyn VmControl>,
    pub(crate) host: Arc<dyn HostCpu>,
    virtual_apic: TableFrame,
    apic_access: TableFrame,
}

impl Vcpu {
    pub fn new(
        hw: Box<dyn VmControl>,
        host: Arc<dyn HostCpu>,
        mut frames: Box<dyn TableFrames>,
        irq: Arc<Mutex<IrqState>>,
    ) -> Result<Vcpu> {
        let virtual_apic = frames.alloc()?;
        let apic_access = frames.alloc()?;
        let ept = Ept::new(frames)?;
        Ok(Vcpu {
            regs: RegisterFile::default(),
            cr2: 0,
            cr3_shadow: 0,
            paging: false,
            pending_io: false,
            cpuid_overrides: FxHashMap::default(),
            msrs: FxHashMap::default(),
            run: Arc::new(Mutex::new(RunPage::default())),
            ept,
            irq,
            hw,
            host,
            virtual_apic,
            apic_access,
        })
    }

    /// Makes the control structure resident and returns the guard access to
    /// hardware fields is scoped to.
    pub(crate) fn load(&mut self) -> LoadedVcpu<'_> {
        self.hw.load();
        LoadedVcpu { vcpu: self }
    }

    /// Applies the fixed initial configuration: execution controls,
    /// control-register masks and shadows, the table pointer, and the APIC
    /// pages (with the access page mapped at the architectural APIC base).
    pub fn configure(&mut self) -> Result<()> {
        let apic_phys = self.apic_access.phys;
        let virtual_apic_phys = self.virtual_apic.phys;
        let ept_root = self.ept.root_phys();
        let host = self.host.clone();

        let mut loaded = self.load();
        loaded.hw.write(EXCEPTION_BITMAP, 0);

        loaded.hw.write(EPT_POINTER, ept_root | EPT_POINTER_WALK_LEN_4);
        loaded.hw.write(VIRTUAL_APIC_PAGE_ADDR, virtual_apic_phys);
        loaded.hw.write(APIC_ACCESS_ADDR, apic_phys);
        loaded.ept.add_page(GuestAddress(APIC_BASE), apic_phys)?;

        loaded.hw.write(
            PIN_BASED_VM_EXEC_CONTROL,
            PIN_BASED_ALWAYSON_WITHOUT_TRUE_MSR | PIN_BASED_NMI_EXITING | PIN_BASED_EXT_INTR_MASK,
        );
        // CR3 exiting stays off; the CR0 mask below still traps paging
        // transitions.
        loaded.hw.write(
            CPU_BASED_VM_EXEC_CONTROL,
            (CPU_BASED_ALWAYSON_WITHOUT_TRUE_MSR
                & !(CPU_BASED_CR3_LOAD_EXITING | CPU_BASED_CR3_STORE_EXITING))
                | CPU_BASED_TPR_SHADOW
                | CPU_BASED_ACTIVATE_SECONDARY_CONTROLS
                | CPU_BASED_UNCOND_IO_EXITING
                | CPU_BASED_MOV_DR_EXITING,
        );
        loaded.hw.write(
            SECONDARY_VM_EXEC_CONTROL,
            SECONDARY_EXEC_UNRESTRICTED_GUEST
                | SECONDARY_EXEC_ENABLE_EPT
                | SECONDARY_EXEC_VIRTUALIZE_APIC_ACCESSES,
        );

        loaded.hw.write(
            VM_EXIT_CONTROLS,
            VM_EXIT_ALWAYSON_WITHOUT_TRUE_MSR | VM_EXIT_HOST_ADDR_SPACE_SIZE,
        );
        loaded
            .hw
            .write(VM_ENTRY_CONTROLS, VM_ENTRY_ALWAYSON_WITHOUT_TRUE_MSR);

        loaded.hw.write(PAGE_FAULT_ERROR_CODE_MASK, 0);
        loaded.hw.write(PAGE_FAULT_ERROR_CODE_MATCH, 0);
        loaded.hw.write(CR3_TARGET_COUNT, 0);

        loaded.hw.write(VM_EXIT_MSR_STORE_COUNT, 0);
        loaded.hw.write(VM_EXIT_MSR_LOAD_COUNT, 0);
        loaded.hw.write(VM_ENTRY_MSR_LOAD_COUNT, 0);

        // No VMCS shadowing.
        loaded.hw.write(VMCS_LINK_POINTER, !0);
        loaded.hw.write(GUEST_IA32_DEBUGCTL, 0);

        loaded.hw.write(VM_EXIT_MSR_STORE_ADDR, !0);
        loaded.hw.write(VM_EXIT_MSR_LOAD_ADDR, !0);
        loaded.hw.write(VM_ENTRY_MSR_LOAD_ADDR, !0);

        loaded.hw.write(VM_ENTRY_EXCEPTION_ERROR_CODE, 0);
        loaded.hw.write(VM_ENTRY_INSTRUCTION_LEN, 0);
        loaded.hw.write(TPR_THRESHOLD, 0);

        // Only the paging bit of CR0 traps; the guest can never disable
        // VMX in CR4.
        loaded.hw.write(CR0_GUEST_HOST_MASK, X86_CR0_PG);
        loaded.hw.write(CR0_READ_SHADOW, 0);
        loaded.hw.write(CR4_GUEST_HOST_MASK, X86_CR4_VMXE);
        loaded.hw.write(CR4_READ_SHADOW, 0);

        loaded.hw.write(CR3_TARGET_VALUE0, 0);
        loaded.hw.write(CR3_TARGET_VALUE1, 0);
        loaded.hw.write(CR3_TARGET_VALUE2, 0);
        loaded.hw.write(CR3_TARGET_VALUE3, 0);

        loaded.hw.write(GUEST_PENDING_DBG_EXCEPTIONS, 0);
        loaded.hw.write(GUEST_INTERRUPTIBILITY_INFO, 0);
        loaded.hw.write(GUEST_ACTIVITY_STATE, GUEST_ACTIVITY_ACTIVE);
        loaded.hw.write(VMX_PREEMPTION_TIMER_VALUE, 0);

        loaded
            .hw
            .write(GUEST_SYSENTER_CS, host.rdmsr(MSR_IA32_SYSENTER_CS));
        loaded
            .hw
            .write(GUEST_SYSENTER_ESP, host.rdmsr(MSR_IA32_SYSENTER_ESP));
        loaded
            .hw
            .write(GUEST_SYSENTER_EIP, host.rdmsr(MSR_IA32_SYSENTER_EIP));

        Ok(())
    }

    pub fn get_regs(&self) -> crate::abi::Regs {
        use GpReg::*;
        let r = &self.regs;
        crate::abi::Regs {
            rax: r[Rax],
            rbx: r[Rbx],
            rcx: r[Rcx],
            rdx: r[Rdx],
            rsi: r[Rsi],
            rdi: r[Rdi],
            rsp: r[Rsp],
            rbp: r[Rbp],
            r8: r[R8],
            r9: r[R9],
            r10: r[R10],
            r11: r[R11],
            r12: r[R12],
            r13: r[R13],
            r14: r[R14],
            r15: r[R15],
            rip: r.rip,
            rflags: r.rflags,
        }
    }

    pub fn set_regs(&mut self, regs: &crate::abi::Regs) {
        use GpReg::*;
        let r = &mut self.regs;
        r[Rax] = regs.rax;
        r[Rbx] = regs.rbx;
        r[Rcx] = regs.rcx;
        r[Rdx] = regs.rdx;
        r[Rsi] = regs.rsi;
        r[Rdi] = regs.rdi;
        r[Rsp] = regs.rsp;
        r[Rbp] = regs.rbp;
        r[R8] = regs.r8;
        r[R9] = regs.r9;
        r[R10] = regs.r10;
        r[R11] = regs.r11;
        r[R12] = regs.r12;
        r[R13] = regs.r13;
        r[R14] = regs.r14;
        r[R15] = regs.r15;
        r.rip = regs.rip;
        r.rflags = regs.rflags;
        debug!(rip = format_args!("{:#x}", regs.rip), "set guest rip");
    }

    pub fn get_sregs(&mut self) -> Sregs {
        let cr2 = self.cr2;
        let loaded = self.load();
        Sregs {
            cs: loaded.read_segment(SegReg::Cs),
            ds: loaded.read_segment(SegReg::Ds),
            es: loaded.read_segment(SegReg::Es),
            fs: loaded.read_segment(SegReg::Fs),
            gs: loaded.read_segment(SegReg::Gs),
            ss: loaded.read_segment(SegReg::Ss),
            tr: loaded.read_segment(SegReg::Tr),
            ldt: loaded.read_segment(SegReg::Ldtr),
            gdt: vmx::DescriptorTable {
                base: loaded.hw.read(GUEST_GDTR_BASE),
                limit: loaded.hw.read(GUEST_GDTR_LIMIT) as u16,
            },
            idt: vmx::DescriptorTable {
                base: loaded.hw.read(GUEST_IDTR_BASE),
                limit: loaded.hw.read(GUEST_IDTR_LIMIT) as u16,
            },
            cr0: loaded.hw.read(GUEST_CR0),
            cr2,
            cr3: loaded.hw.read(GUEST_CR3),
            cr4: loaded.hw.read(GUEST_CR4),
            efer: loaded.hw.read(GUEST_IA32_EFER),
            apic_base: APIC_BASE,
        }
    }

    /// Installs system-register state. CR0.NE and CR4.VMXE are forced on:
    /// the first is required for entry, the second must never be guest
    /// controlled.
    pub fn set_sregs(&mut self, sregs: &Sregs) {
        self.cr2 = sregs.cr2;
        let mut loaded = self.load();
        loaded.hw.write(GUEST_CR0, sregs.cr0 | X86_CR0_NE);
        loaded.hw.write(GUEST_CR3, sregs.cr3);
        loaded.hw.write(GUEST_CR4, sregs.cr4 | X86_CR4_VMXE);

        loaded.write_segment(SegReg::Cs, &sregs.cs);
        loaded.write_segment(SegReg::Ds, &sregs.ds);
        loaded.write_segment(SegReg::Es, &sregs.es);
        loaded.write_segment(SegReg::Fs, &sregs.fs);
        loaded.write_segment(SegReg::Gs, &sregs.gs);
        loaded.write_segment(SegReg::Ss, &sregs.ss);
        loaded.write_segment(SegReg::Tr, &sregs.tr);
        loaded.write_segment(SegReg::Ldtr, &sregs.ldt);

        loaded.hw.write(GUEST_GDTR_BASE, sregs.gdt.base);
        loaded.hw.write(GUEST_GDTR_LIMIT, sregs.gdt.limit as u64);
        loaded.hw.write(GUEST_IDTR_BASE, sregs.idt.base);
        loaded.hw.write(GUEST_IDTR_LIMIT, sregs.idt.limit as u64);

        loaded.hw.write(GUEST_IA32_EFER, sregs.efer);
    }
}

/// RAII residency scope for the control structure. Hardware field access is
/// only valid through this guard; dropping it clears residency so the
/// structure may migrate to another processor.
pub(crate) struct LoadedVcpu<'a> {
    vcpu: &'a mut Vcpu,
}

impl Drop for LoadedVcpu<'_> {
    fn drop(&mut self) {
        self.vcpu.hw.clear();
    }
}

impl Deref for LoadedVcpu<'_> {
    type Target = Vcpu;

    fn deref(&self) -> &Vcpu {
        self.vcpu
    }
}

impl DerefMut for LoadedVcpu<'_> {
    fn deref_mut(&mut self) -> &mut Vcpu {
        self.vcpu
    }
}

impl LoadedVcpu<'_> {
    pub(crate) fn read_segment(&self, seg: SegReg) -> Segment {
        let (selector, base, limit, ar) = seg.fields();
        Segment::from_access_rights(
            self.hw.read(selector) as u16,
            self.hw.read(base),
            self.hw.read(limit) as u32,
            self.hw.read(ar),
        )
    }

    pub(crate) fn write_segment(&mut self, seg: SegReg, segment: &Segment) {
        let (selector, base, limit, ar) = seg.fields();
        self.vcpu.hw.write(selector, segment.selector as u64);
        self.vcpu.hw.write(base, segment.base);
        self.vcpu.hw.write(limit, segment.limit as u64);
        self.vcpu.hw.write(ar, segment.access_rights());
    }

    /// Register snapshot for exit-loop diagnostics.
    pub(crate) fn show_regs(&self) {
        use GpReg::*;
        let r = &self.vcpu.regs;
        debug!(
            rax = format_args!("{:#x}", r[Rax]),
            rbx = format_args!("{:#x}", r[Rbx]),
            rcx = format_args!("{:#x}", r[Rcx]),
            rdx = format_args!("{:#x}", r[Rdx]),
            rsi = format_args!("{:#x}", r[Rsi]),
            rdi = format_args!("{:#x}", r[Rdi]),
            rsp = format_args!("{:#x}", r[Rsp]),
            rbp = format_args!("{:#x}", r[Rbp]),
            rip = format_args!("{:#x}", r.rip),
            rflags = format_args!("{:#x}", r.rflags),
            cr0 = format_args!("{:#x}", self.hw.read(GUEST_CR0)),
            cr3 = format_args!("{:#x}", self.hw.read(GUEST_CR3)),
            cr4 = format_args!("{:#x}", self.hw.read(GUEST_CR4)),
            "register snapshot"
        );
    }
}
