// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The run loop: world switches, exit capture, interrupt injection and the
//! bounded-exit fairness valve.

use tracing::{debug, error, warn};

use vmx::vmcs::*;
use vmx::{ExitReason, ExitRecord, GpReg};

use crate::exits::Disposition;
use crate::vstate::Vcpu;
use crate::Result;

/// Consecutive handled exits before the loop yields back to the caller, so
/// a guest spinning on emulated instructions cannot wedge the host thread.
pub const MAX_CONSECUTIVE_EXITS: usize = 1000;

/// Interrupt vector bases: a paged guest runs a protected-mode IDT layout,
/// an unpaged one the real-mode one.
const VECTOR_BASE_PAGED: u8 = 0x30;
const VECTOR_BASE_REAL: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A handler handed control back; the run page describes the exit.
    Exit,
    /// The loop hit the consecutive-exit bound without leaving.
    Timeout,
    /// The hardware reported an instruction error.
    HardwareError(u64),
}

impl Vcpu {
    /// Runs the guest until a handler stops the loop, the exit bound is hit
    /// or the hardware reports an error.
    pub fn run(&mut self) -> Result<RunOutcome> {
        self.complete_pending_io();
        self.run.lock().unwrap().exit_reason = 0;

        // Injection is decided by the previous iteration's exit: only an
        // interrupt-window exit proves the guest can take a vector now.
        let mut window_open = false;
        let mut last_reason = ExitReason::Unknown(0);

        for _ in 0..MAX_CONSECUTIVE_EXITS {
            let mut intr_info = 0;
            let pending = {
                let mut irq = self.irq.lock().unwrap();
                if window_open {
                    if let Some(line) = irq.take_lowest() {
                        let base = if self.paging {
                            VECTOR_BASE_PAGED
                        } else {
                            VECTOR_BASE_REAL
                        };
                        intr_info = external_interrupt_info(base + line);
                    }
                }
                irq.pending()
            };

            let mut loaded = self.load();

            if intr_info != 0 {
                loaded.hw.write(VM_ENTRY_INTR_INFO_FIELD, intr_info);
            }

            // Ask for an interrupt-window exit only while lines are pending.
            let cpu_based = loaded.hw.read(CPU_BASED_VM_EXEC_CONTROL);
            let cpu_based = if pending != 0 {
                cpu_based | CPU_BASED_VIRTUAL_INTR_PENDING
            } else {
                cpu_based & !CPU_BASED_VIRTUAL_INTR_PENDING
            };
            loaded.hw.write(CPU_BASED_VM_EXEC_CONTROL, cpu_based);

            // rip, rsp and rflags travel through the control structure.
            let (rip, rsp, rflags) = (
                loaded.regs.rip,
                loaded.regs[GpReg::Rsp],
                loaded.regs.rflags,
            );
            loaded.hw.write(GUEST_RIP, rip);
            loaded.hw.write(GUEST_RSP, rsp);
            loaded.hw.write(GUEST_RFLAGS, rflags);

            {
                let vcpu = &mut *loaded;
                vcpu.hw.world_switch(&mut vcpu.regs)?;
            }

            loaded.regs.rip = loaded.hw.read(GUEST_RIP);
            loaded.regs.rflags = loaded.hw.read(GUEST_RFLAGS);
            let rsp = loaded.hw.read(GUEST_RSP);
            loaded.regs[GpReg::Rsp] = rsp;

            let exit = ExitRecord {
                reason: ExitReason::from_code(loaded.hw.read(VM_EXIT_REASON) as u32),
                qualification: loaded.hw.read(EXIT_QUALIFICATION),
                guest_physical: loaded.hw.read(GUEST_PHYSICAL_ADDRESS),
                instruction_len: loaded.hw.read(VM_EXIT_INSTRUCTION_LEN),
                instruction_error: loaded.hw.read(VM_INSTRUCTION_ERROR),
            };

            if exit.instruction_error != 0 {
                error!(
                    error = exit.instruction_error,
                    reason = ?exit.reason,
                    "instruction error on entry"
                );
                loaded.show_regs();
                return Ok(RunOutcome::HardwareError(exit.instruction_error));
            }

            if noisy_reason(exit.reason) {
                debug!(
                    reason = ?exit.reason,
                    qualification = format_args!("{:#x}", exit.qualification),
                    guest_physical = format_args!("{:#x}", exit.guest_physical),
                    rip = format_args!("{:#x}", loaded.regs.rip),
                    "uncommon exit"
                );
            }

            let disposition = loaded.dispatch(&exit);
            drop(loaded);

            if disposition == Disposition::Stop {
                return Ok(RunOutcome::Exit);
            }

            window_open = exit.reason == ExitReason::InterruptWindow;
            last_reason = exit.reason;
        }

        warn!(last_reason = ?last_reason, "exit from timeout");
        Ok(RunOutcome::Timeout)
    }

    /// Finishes an in-instruction armed by the previous run: userspace has
    /// filled the pio page, the guest gets it in rax.
    fn complete_pending_io(&mut self) {
        if !self.pending_io {
            return;
        }
        let run = self.run.clone();
        let run = run.lock().unwrap();
        let bytes = (usize::from(run.io.size) * run.io.count as usize).min(8);
        let mut buf = [0u8; 8];
        buf[..bytes].copy_from_slice(&run.pio_data[..bytes]);
        self.regs[GpReg::Rax] = u64::from_le_bytes(buf);
        self.pending_io = false;
    }
}

/// Exit reasons worth a diagnostic line; the common ones would flood the
/// log at debug level.
fn noisy_reason(reason: ExitReason) -> bool {
    !matches!(
        reason,
        ExitReason::IoInstruction
            | ExitReason::PreemptionTimer
            | ExitReason::ExternalInterrupt
            | ExitReason::InterruptWindow
            | ExitReason::TaskSwitch
            | ExitReason::Cpuid
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::KVM_EXIT_IO;
    use crate::testutil::{test_vcpu, ScriptedExit};

    /// reason 30, out port 1, size 1.
    fn io_exit() -> ScriptedExit {
        ScriptedExit::reason(30)
            .field(EXIT_QUALIFICATION, 0x0001_0000)
            .field(VM_EXIT_INSTRUCTION_LEN, 2)
    }

    #[test]
    fn stops_on_io_exit() {
        let (mut vcpu, hw) = test_vcpu();
        hw.lock().unwrap().script.push_back(io_exit());
        assert_eq!(vcpu.run().unwrap(), RunOutcome::Exit);
        let inner = hw.lock().unwrap();
        assert_eq!(inner.switches, 1);
        assert!(!inner.loaded);
        drop(inner);
        assert_eq!(vcpu.run.lock().unwrap().exit_reason, KVM_EXIT_IO);
    }

    #[test]
    fn times_out_after_bound() {
        // Empty script: every switch is a continue-class exit.
        let (mut vcpu, hw) = test_vcpu();
        assert_eq!(vcpu.run().unwrap(), RunOutcome::Timeout);
        assert_eq!(hw.lock().unwrap().switches, MAX_CONSECUTIVE_EXITS);
    }

    #[test]
    fn hardware_error_aborts() {
        let (mut vcpu, hw) = test_vcpu();
        hw.lock()
            .unwrap()
            .script
            .push_back(ScriptedExit::reason(52).field(VM_INSTRUCTION_ERROR, 7));
        assert_eq!(vcpu.run().unwrap(), RunOutcome::HardwareError(7));
        let inner = hw.lock().unwrap();
        assert_eq!(inner.switches, 1);
        assert!(!inner.loaded);
    }

    #[test]
    fn pending_io_resolves_into_rax() {
        let (mut vcpu, hw) = test_vcpu();
        vcpu.pending_io = true;
        {
            let mut run = vcpu.run.lock().unwrap();
            run.io.size = 2;
            run.io.count = 1;
            run.pio_data[..2].copy_from_slice(&[0x34, 0x12]);
        }
        hw.lock().unwrap().script.push_back(io_exit());
        vcpu.run().unwrap();
        // rax was loaded before the first world switch; the out exit then
        // copied it back out through the pio page.
        assert!(!vcpu.pending_io);
        assert_eq!(vcpu.run.lock().unwrap().pio_data[0], 0x34);
        assert_eq!(vcpu.get_regs().rax, 0x1234);
    }

    #[test]
    fn injects_on_interrupt_window() {
        let (mut vcpu, hw) = test_vcpu();
        vcpu.irq.lock().unwrap().set_line(3, 1);
        {
            let mut inner = hw.lock().unwrap();
            // Window opens, then an I/O exit stops the loop.
            inner.script.push_back(ScriptedExit::reason(7));
            inner.script.push_back(io_exit());
        }
        assert_eq!(vcpu.run().unwrap(), RunOutcome::Exit);

        let inner = hw.lock().unwrap();
        // First entry: nothing injectable yet, but the window is requested.
        // Second entry: line 3 rides in on the real-mode vector base.
        assert_eq!(inner.intr_pending_at_switch, vec![true, false]);
        assert_eq!(
            inner.injected,
            vec![external_interrupt_info(VECTOR_BASE_REAL + 3)]
        );
    }

    #[test]
    fn paged_guest_uses_high_vector_base() {
        let (mut vcpu, hw) = test_vcpu();
        vcpu.paging = true;
        vcpu.irq.lock().unwrap().set_line(0, 1);
        {
            let mut inner = hw.lock().unwrap();
            inner.script.push_back(ScriptedExit::reason(7));
            inner.script.push_back(io_exit());
        }
        vcpu.run().unwrap();
        assert_eq!(
            hw.lock().unwrap().injected,
            vec![external_interrupt_info(VECTOR_BASE_PAGED)]
        );
    }

    #[test]
    fn lowest_line_first() {
        let (mut vcpu, hw) = test_vcpu();
        {
            let mut irq = vcpu.irq.lock().unwrap();
            irq.set_line(9, 1);
            irq.set_line(2, 1);
        }
        {
            let mut inner = hw.lock().unwrap();
            inner.script.push_back(ScriptedExit::reason(7));
            inner.script.push_back(ScriptedExit::reason(7));
            inner.script.push_back(io_exit());
        }
        vcpu.run().unwrap();
        assert_eq!(
            hw.lock().unwrap().injected,
            vec![
                external_interrupt_info(VECTOR_BASE_REAL + 2),
                external_interrupt_info(VECTOR_BASE_REAL + 9),
            ]
        );
    }

    #[test]
    fn rip_travels_through_control_structure() {
        let (mut vcpu, hw) = test_vcpu();
        vcpu.regs.rip = 0x7c00;
        hw.lock().unwrap().script.push_back(
            io_exit().field(GUEST_RIP, 0x7c05),
        );
        vcpu.run().unwrap();
        // Collected rip plus the skip over the two-byte out instruction.
        assert_eq!(vcpu.regs.rip, 0x7c07);
        assert_eq!(hw.lock().unwrap().field(GUEST_RIP), 0x7c05);
    }
}
