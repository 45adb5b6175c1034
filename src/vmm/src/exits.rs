// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! VM-exit dispatch. Each handler implements one exit-reason policy and
//! reports whether the run loop keeps going or hands control back to the
//! caller with the run page describing the exit.

use tracing::{debug, error, warn};

use vmx::vmcs::*;
use vmx::{CrAccess, CrAccessKind, ExitReason, ExitRecord, GpReg, IoAccess};

use crate::abi::{KVM_EXIT_IO, KVM_EXIT_IO_IN, KVM_EXIT_IO_OUT, KVM_PIO_PAGE_OFFSET};
use crate::vstate::LoadedVcpu;
use crate::PAGE_SIZE;

/// What the run loop does after one exit is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Continue,
    Stop,
}

impl LoadedVcpu<'_> {
    /// Advances the guest past the instruction that trapped.
    fn skip_instruction(&mut self, exit: &ExitRecord) {
        self.regs.rip += exit.instruction_len;
    }

    pub(crate) fn dispatch(&mut self, exit: &ExitRecord) -> Disposition {
        match exit.reason {
            ExitReason::ExternalInterrupt => self.handle_external_interrupt(exit),
            ExitReason::InterruptWindow => Disposition::Continue,
            ExitReason::TaskSwitch => {
                debug!("task switch");
                Disposition::Continue
            }
            ExitReason::Cpuid => self.handle_cpuid(exit),
            ExitReason::CrAccess => self.handle_cr(exit),
            ExitReason::DrAccess => {
                self.skip_instruction(exit);
                Disposition::Continue
            }
            ExitReason::IoInstruction => self.handle_io(exit),
            ExitReason::MsrRead => self.handle_rdmsr(exit),
            ExitReason::MsrWrite => self.handle_wrmsr(exit),
            ExitReason::ApicAccess => {
                debug!(
                    qualification = format_args!("{:#x}", exit.qualification),
                    "apic access"
                );
                self.skip_instruction(exit);
                Disposition::Continue
            }
            ExitReason::EptViolation => {
                // No demand paging yet; every mapping is installed up front,
                // so a violation is a guest bug we step over.
                warn!(
                    guest_physical = format_args!("{:#x}", exit.guest_physical),
                    "ept violation"
                );
                self.skip_instruction(exit);
                Disposition::Continue
            }
            ExitReason::PreemptionTimer => Disposition::Continue,
            ExitReason::Unknown(code) => {
                error!(code, "unhandled exit reason");
                Disposition::Stop
            }
        }
    }

    /// Port I/O leaves the run loop: the run page is filled in so userspace
    /// can service the port, writes carry their data out through the pio
    /// page, reads arm a pending transaction resolved on re-entry.
    fn handle_io(&mut self, exit: &ExitRecord) -> Disposition {
        let access = IoAccess::decode(exit.qualification);

        let run = self.run.clone();
        let mut run = run.lock().unwrap();
        run.io.direction = if access.is_in {
            KVM_EXIT_IO_IN
        } else {
            KVM_EXIT_IO_OUT
        };
        run.io.size = access.size;
        run.io.port = access.port;
        run.io.count = 1;
        run.io.data_offset = KVM_PIO_PAGE_OFFSET * PAGE_SIZE;

        if access.is_in {
            self.pending_io = true;
        } else {
            let bytes = usize::from(access.size).min(8);
            let val = self.regs[GpReg::Rax].to_le_bytes();
            run.pio_data[..bytes].copy_from_slice(&val[..bytes]);
        }

        run.exit_reason = KVM_EXIT_IO;
        self.skip_instruction(exit);
        Disposition::Stop
    }

    fn handle_cpuid(&mut self, exit: &ExitRecord) -> Disposition {
        let function = self.regs[GpReg::Rax] as u32;
        let index = self.regs[GpReg::Rcx] as u32;

        let mut result = match self.cpuid_overrides.get(&(function, index)) {
            Some(entry) => vmx::CpuidResult {
                eax: entry.eax,
                ebx: entry.ebx,
                ecx: entry.ecx,
                edx: entry.edx,
            },
            None => self.host.cpuid(function, index),
        };

        // The guest gets no SSE family and no XSAVE, whatever the override
        // table says; nothing restores that state across the world switch.
        if function == 1 {
            result.edx &= !(1 << 25 | 1 << 26);
            result.ecx &= !(1 << 0 | 1 << 9);
            result.ecx &= !(1 << 19 | 1 << 20);
            result.ecx &= !(1 << 26 | 1 << 27);
        }

        self.regs[GpReg::Rax] = result.eax as u64;
        self.regs[GpReg::Rbx] = result.ebx as u64;
        self.regs[GpReg::Rcx] = result.ecx as u64;
        self.regs[GpReg::Rdx] = result.edx as u64;

        self.skip_instruction(exit);
        Disposition::Continue
    }

    fn handle_rdmsr(&mut self, exit: &ExitRecord) -> Disposition {
        let index = self.regs[GpReg::Rcx] as u32;
        let value = match self.msrs.get(&index) {
            Some(value) => *value,
            None => self.host.rdmsr(index),
        };
        debug!(index = format_args!("{:#x}", index), value, "rdmsr");

        self.regs[GpReg::Rax] = value & 0xffff_ffff;
        self.regs[GpReg::Rdx] = value >> 32;

        self.skip_instruction(exit);
        Disposition::Continue
    }

    /// Writes only land in MSRs the client installed; anything else is
    /// dropped after logging rather than touching the host.
    fn handle_wrmsr(&mut self, exit: &ExitRecord) -> Disposition {
        let index = self.regs[GpReg::Rcx] as u32;
        let value = (self.regs[GpReg::Rax] & 0xffff_ffff) | (self.regs[GpReg::Rdx] << 32);

        if let Some(slot) = self.msrs.get_mut(&index) {
            *slot = value;
        } else {
            debug!(index = format_args!("{:#x}", index), value, "wrmsr dropped");
        }

        self.skip_instruction(exit);
        Disposition::Continue
    }

    fn handle_cr(&mut self, exit: &ExitRecord) -> Disposition {
        let access = CrAccess::decode(exit.qualification);

        match (access.cr, access.kind, access.reg) {
            (3, CrAccessKind::MovToCr, Some(reg)) => {
                self.cr3_shadow = self.regs[reg];
                let translated = self
                    .ept
                    .translate(vm_memory::GuestAddress(self.cr3_shadow));
                debug!(
                    cr3 = format_args!("{:#x}", self.cr3_shadow),
                    translated = format_args!("{:#x}", translated.unwrap_or(0)),
                    "load cr3"
                );
                // The hardware walks the guest value through the nested
                // tables itself; the shadow only answers reads.
                let cr3 = self.cr3_shadow;
                self.hw.write(GUEST_CR3, cr3);
            }
            (3, CrAccessKind::MovFromCr, Some(reg)) => {
                self.regs[reg] = self.cr3_shadow;
            }
            (0, CrAccessKind::MovToCr, Some(reg)) => {
                let value = self.regs[reg];
                self.hw.write(GUEST_CR0, value);
                let secondary = self.hw.read(SECONDARY_VM_EXEC_CONTROL);
                if value & X86_CR0_PG != 0 {
                    debug!("paging is on");
                    self.paging = true;
                    self.hw.write(
                        SECONDARY_VM_EXEC_CONTROL,
                        secondary & !SECONDARY_EXEC_UNRESTRICTED_GUEST,
                    );
                    self.hw.write(CR0_READ_SHADOW, X86_CR0_PG);
                } else {
                    debug!("paging is off");
                    self.paging = false;
                    self.hw.write(
                        SECONDARY_VM_EXEC_CONTROL,
                        secondary | SECONDARY_EXEC_UNRESTRICTED_GUEST,
                    );
                    self.hw.write(CR0_READ_SHADOW, 0);
                }
            }
            _ => {
                warn!(cr = access.cr, "unemulated control register access");
            }
        }

        self.skip_instruction(exit);
        Disposition::Continue
    }

    /// Qualification 0 is the host timer tick, mirrored onto guest line 0
    /// so the guest clock runs in lockstep. A pending host signal stops the
    /// loop so it can be delivered. The interrupt itself re-fires once the
    /// host unblocks; no skip, the instruction never ran.
    fn handle_external_interrupt(&mut self, exit: &ExitRecord) -> Disposition {
        if exit.qualification == 0 {
            self.irq.lock().unwrap().pend(0);
        }

        if self.host.signal_pending() {
            debug!("host signal pending, leaving run loop");
            return Disposition::Stop;
        }

        Disposition::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::CpuidEntry;
    use crate::testutil::test_vcpu;
    use crate::vstate::APIC_BASE;
    use vm_memory::GuestAddress;

    fn record(reason_code: u32, qualification: u64, len: u64) -> ExitRecord {
        ExitRecord {
            reason: ExitReason::from_code(reason_code),
            qualification,
            guest_physical: 0,
            instruction_len: len,
            instruction_error: 0,
        }
    }

    #[test]
    fn io_out_copies_rax_and_stops() {
        let (mut vcpu, _hw) = test_vcpu();
        vcpu.regs[GpReg::Rax] = 0x1122_3344_5566_7788;
        let mut loaded = vcpu.load();
        // out to port 0x3f8, size 2.
        let exit = record(30, 0x03f8_0001, 2);
        assert_eq!(loaded.dispatch(&exit), Disposition::Stop);
        assert_eq!(loaded.regs.rip, 2);
        drop(loaded);

        let run = vcpu.run.lock().unwrap();
        assert_eq!(run.exit_reason, KVM_EXIT_IO);
        assert_eq!(run.io.direction, KVM_EXIT_IO_OUT);
        assert_eq!(run.io.port, 0x3f8);
        assert_eq!(run.io.size, 2);
        assert_eq!(run.io.data_offset, PAGE_SIZE);
        assert_eq!(&run.pio_data[..2], &[0x88, 0x77]);
        assert!(!vcpu.pending_io);
    }

    #[test]
    fn io_in_arms_pending_transaction() {
        let (mut vcpu, _hw) = test_vcpu();
        let mut loaded = vcpu.load();
        // in from port 0x64, size 1.
        let exit = record(30, 0x0064_0008, 1);
        assert_eq!(loaded.dispatch(&exit), Disposition::Stop);
        drop(loaded);
        assert!(vcpu.pending_io);
        let run = vcpu.run.lock().unwrap();
        assert_eq!(run.io.direction, KVM_EXIT_IO_IN);
        assert_eq!(run.io.port, 0x64);
    }

    #[test]
    fn cpuid_masking_is_unconditional() {
        let (mut vcpu, _hw) = test_vcpu();
        // Override claims every feature bit.
        vcpu.cpuid_overrides.insert(
            (1, 0),
            CpuidEntry {
                function: 1,
                index: 0,
                flags: 0,
                eax: 0x0001_0663,
                ebx: 0,
                ecx: u32::MAX,
                edx: u32::MAX,
            },
        );
        vcpu.regs[GpReg::Rax] = 1;
        vcpu.regs[GpReg::Rcx] = 0;
        let mut loaded = vcpu.load();
        assert_eq!(loaded.dispatch(&record(10, 0, 2)), Disposition::Continue);
        let edx = loaded.regs[GpReg::Rdx] as u32;
        let ecx = loaded.regs[GpReg::Rcx] as u32;
        assert_eq!(edx & (1 << 25 | 1 << 26), 0);
        assert_eq!(ecx & (1 << 0 | 1 << 9 | 1 << 19 | 1 << 20 | 1 << 26 | 1 << 27), 0);
        // Untouched bits of the override survive.
        assert_eq!(loaded.regs[GpReg::Rax], 0x0001_0663);
        assert_eq!(loaded.regs.rip, 2);
    }

    #[test]
    fn cpuid_override_exact_match_only() {
        let (mut vcpu, _hw) = test_vcpu();
        vcpu.cpuid_overrides.insert(
            (4, 1),
            CpuidEntry {
                function: 4,
                index: 1,
                eax: 0x42,
                ..CpuidEntry::default()
            },
        );
        // Same function, different index: falls through to the host.
        vcpu.regs[GpReg::Rax] = 4;
        vcpu.regs[GpReg::Rcx] = 2;
        let mut loaded = vcpu.load();
        loaded.dispatch(&record(10, 0, 2));
        assert_eq!(loaded.regs[GpReg::Rax], 4); // fake host echoes the leaf
        assert_eq!(loaded.regs[GpReg::Rcx], 2);
    }

    #[test]
    fn rdmsr_prefers_installed_table() {
        let (mut vcpu, _hw) = test_vcpu();
        vcpu.msrs.insert(0x1a0, 0x1122_3344_5566_7788);
        vcpu.regs[GpReg::Rcx] = 0x1a0;
        let mut loaded = vcpu.load();
        loaded.dispatch(&record(31, 0, 2));
        assert_eq!(loaded.regs[GpReg::Rax], 0x5566_7788);
        assert_eq!(loaded.regs[GpReg::Rdx], 0x1122_3344);
    }

    #[test]
    fn wrmsr_updates_only_installed_entries() {
        let (mut vcpu, _hw) = test_vcpu();
        vcpu.msrs.insert(0x6e0, 0);
        vcpu.regs[GpReg::Rcx] = 0x6e0;
        vcpu.regs[GpReg::Rax] = 0xdead;
        vcpu.regs[GpReg::Rdx] = 0x1;
        let mut loaded = vcpu.load();
        loaded.dispatch(&record(32, 0, 2));
        drop(loaded);
        assert_eq!(vcpu.msrs[&0x6e0], 0x1_0000_dead);

        // Uninstalled MSR: dropped.
        vcpu.regs[GpReg::Rcx] = 0x999;
        let mut loaded = vcpu.load();
        loaded.dispatch(&record(32, 0, 2));
        drop(loaded);
        assert!(!vcpu.msrs.contains_key(&0x999));
    }

    #[test]
    fn cr3_write_shadows_and_mirrors() {
        let (mut vcpu, hw) = test_vcpu();
        vcpu.ept.add_page(GuestAddress(0x5000), 0x9000).unwrap();
        vcpu.regs[GpReg::Rbx] = 0x5000;
        let mut loaded = vcpu.load();
        // mov cr3, rbx
        loaded.dispatch(&record(28, 0x0000_0303, 3));
        drop(loaded);
        assert_eq!(vcpu.cr3_shadow, 0x5000);
        assert_eq!(hw.lock().unwrap().field(GUEST_CR3), 0x5000);

        // mov rax, cr3 reads the shadow.
        let mut loaded = vcpu.load();
        loaded.dispatch(&record(28, 0x0000_0013, 3));
        assert_eq!(loaded.regs[GpReg::Rax], 0x5000);
    }

    #[test]
    fn cr0_paging_toggle() {
        let (mut vcpu, hw) = test_vcpu();
        hw.lock().unwrap().fields.insert(
            SECONDARY_VM_EXEC_CONTROL,
            SECONDARY_EXEC_UNRESTRICTED_GUEST | SECONDARY_EXEC_ENABLE_EPT,
        );
        vcpu.regs[GpReg::Rax] = X86_CR0_PG | 0x1;
        let mut loaded = vcpu.load();
        // mov cr0, rax
        loaded.dispatch(&record(28, 0x0000_0000, 3));
        drop(loaded);
        assert!(vcpu.paging);
        let fields = hw.lock().unwrap();
        assert_eq!(
            fields.field(SECONDARY_VM_EXEC_CONTROL) & SECONDARY_EXEC_UNRESTRICTED_GUEST,
            0
        );
        assert_eq!(fields.field(CR0_READ_SHADOW), X86_CR0_PG);
        drop(fields);

        // And back off.
        vcpu.regs[GpReg::Rax] = 0x1;
        let mut loaded = vcpu.load();
        loaded.dispatch(&record(28, 0x0000_0000, 3));
        drop(loaded);
        assert!(!vcpu.paging);
        let fields = hw.lock().unwrap();
        assert_ne!(
            fields.field(SECONDARY_VM_EXEC_CONTROL) & SECONDARY_EXEC_UNRESTRICTED_GUEST,
            0
        );
        assert_eq!(fields.field(CR0_READ_SHADOW), 0);
    }

    #[test]
    fn external_interrupt_timer_lockstep() {
        let (mut vcpu, _hw) = test_vcpu();
        let irq = vcpu.irq.clone();
        let mut loaded = vcpu.load();
        assert_eq!(loaded.dispatch(&record(1, 0, 0)), Disposition::Continue);
        // No skip: rip untouched.
        assert_eq!(loaded.regs.rip, 0);
        drop(loaded);
        assert_eq!(irq.lock().unwrap().pending(), 1);

        // Non-zero qualification: not the timer.
        let mut loaded = vcpu.load();
        loaded.dispatch(&record(1, 0x23, 0));
        drop(loaded);
        assert_eq!(irq.lock().unwrap().pending(), 1);
    }

    #[test]
    fn external_interrupt_signal_stops() {
        use std::sync::atomic::Ordering;
        use std::sync::{Arc, Mutex};

        use crate::ept::HeapFrames;
        use crate::testutil::{FakeHostCpu, FakeVmControl};
        use crate::vstate::{IrqState, Vcpu};

        let host = Arc::new(FakeHostCpu::default());
        host.signal.store(true, Ordering::SeqCst);
        let mut vcpu = Vcpu::new(
            Box::new(FakeVmControl::default()),
            host,
            Box::new(HeapFrames),
            Arc::new(Mutex::new(IrqState::new())),
        )
        .unwrap();
        let mut loaded = vcpu.load();
        assert_eq!(loaded.dispatch(&record(1, 0x23, 0)), Disposition::Stop);
    }

    #[test]
    fn unknown_reason_stops() {
        let (mut vcpu, _hw) = test_vcpu();
        let mut loaded = vcpu.load();
        assert_eq!(loaded.dispatch(&record(55, 0, 2)), Disposition::Stop);
    }

    #[test]
    fn ept_violation_steps_over() {
        let (mut vcpu, _hw) = test_vcpu();
        let mut loaded = vcpu.load();
        let mut exit = record(48, 0, 4);
        exit.guest_physical = APIC_BASE;
        assert_eq!(loaded.dispatch(&exit), Disposition::Continue);
        assert_eq!(loaded.regs.rip, 4);
    }
}
