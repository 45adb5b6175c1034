// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Scripted stand-ins for the hardware seams, shared across test modules.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use vmx::vmcs::*;
use vmx::{CpuidResult, GpReg, HostCpu, RegisterFile, VmControl};

use crate::device::{MemoryPinner, PinnedRange};
use crate::ept::{HeapFrames, TableFrames};
use crate::vstate::{IrqState, Vcpu};
use crate::{Backend, Result};

/// One scripted world switch: fields to set as the exit state plus guest
/// register mutations that "happened" while the guest ran.
#[derive(Default, Clone)]
pub struct ScriptedExit {
    pub fields: Vec<(u32, u64)>,
    pub regs: Vec<(GpReg, u64)>,
}

impl ScriptedExit {
    pub fn reason(code: u32) -> ScriptedExit {
        ScriptedExit {
            fields: vec![(VM_EXIT_REASON, code as u64)],
            regs: Vec::new(),
        }
    }

    pub fn field(mut self, field: u32, value: u64) -> ScriptedExit {
        self.fields.push((field, value));
        self
    }
}

#[derive(Default)]
pub struct FakeInner {
    pub fields: FxHashMap<u32, u64>,
    pub script: VecDeque<ScriptedExit>,
    pub loaded: bool,
    pub switches: usize,
    /// Every non-zero injection value observed at switch time.
    pub injected: Vec<u64>,
    /// Virtual-interrupt-pending control state at each switch.
    pub intr_pending_at_switch: Vec<bool>,
}

impl FakeInner {
    pub fn field(&self, field: u32) -> u64 {
        self.fields.get(&field).copied().unwrap_or(0)
    }
}

/// Scripted control structure. World switches pop the script front; with an
/// empty script every switch reports a preemption-timer exit, which the
/// dispatcher treats as continue, so an unscripted run loop times out.
#[derive(Clone, Default)]
pub struct FakeVmControl(pub Arc<Mutex<FakeInner>>);

impl VmControl for FakeVmControl {
    fn load(&mut self) {
        let mut inner = self.0.lock().unwrap();
        assert!(!inner.loaded, "nested load");
        inner.loaded = true;
    }

    fn clear(&mut self) {
        let mut inner = self.0.lock().unwrap();
        assert!(inner.loaded, "clear without load");
        inner.loaded = false;
    }

    fn read(&self, field: u32) -> u64 {
        let inner = self.0.lock().unwrap();
        assert!(inner.loaded, "field read without residency");
        inner.field(field)
    }

    fn write(&mut self, field: u32, value: u64) {
        let mut inner = self.0.lock().unwrap();
        assert!(inner.loaded, "field write without residency");
        inner.fields.insert(field, value);
    }

    fn world_switch(&mut self, regs: &mut RegisterFile) -> vmx::Result<()> {
        let mut inner = self.0.lock().unwrap();
        assert!(inner.loaded, "world switch without residency");
        inner.switches += 1;
        let info = inner.field(VM_ENTRY_INTR_INFO_FIELD);
        if info != 0 {
            inner.injected.push(info);
        }
        let pending =
            inner.field(CPU_BASED_VM_EXEC_CONTROL) & CPU_BASED_VIRTUAL_INTR_PENDING != 0;
        inner.intr_pending_at_switch.push(pending);
        // Exits clear the injection field, like the hardware does.
        inner.fields.insert(VM_ENTRY_INTR_INFO_FIELD, 0);
        let exit = inner
            .script
            .pop_front()
            .unwrap_or_else(|| ScriptedExit::reason(52));
        inner.fields.insert(VM_INSTRUCTION_ERROR, 0);
        for (field, value) in exit.fields {
            inner.fields.insert(field, value);
        }
        for (reg, value) in exit.regs {
            regs[reg] = value;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeHostCpu {
    pub cpuid: Mutex<FxHashMap<(u32, u32), CpuidResult>>,
    pub msrs: Mutex<FxHashMap<u32, u64>>,
    pub signal: AtomicBool,
}

impl HostCpu for FakeHostCpu {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.cpuid
            .lock()
            .unwrap()
            .get(&(leaf, subleaf))
            .copied()
            // Recognizable default pattern for unscripted leaves.
            .unwrap_or(CpuidResult {
                eax: leaf,
                ebx: 0xb0b0_0000 | leaf,
                ecx: subleaf,
                edx: 0xd0d0_0000 | leaf,
            })
    }

    fn rdmsr(&self, index: u32) -> u64 {
        self.msrs
            .lock()
            .unwrap()
            .get(&index)
            .copied()
            .unwrap_or(0x5150_0000_0000_0000 | index as u64)
    }

    fn signal_pending(&self) -> bool {
        self.signal.load(Ordering::SeqCst)
    }
}

/// Pinner resolving every page to `userspace_addr | 0x8000_0000_0000`,
/// except addresses listed as holes.
#[derive(Default)]
pub struct FakePinner {
    pub holes: Vec<u64>,
}

struct FakeRange {
    base: u64,
    holes: Vec<u64>,
}

impl PinnedRange for FakeRange {
    fn host_frame(&self, offset: u64) -> Option<u64> {
        let addr = self.base + offset;
        if self.holes.contains(&addr) {
            None
        } else {
            Some(addr | 0x8000_0000_0000)
        }
    }
}

impl MemoryPinner for FakePinner {
    fn pin(&self, userspace_addr: u64, _size: u64) -> Result<Box<dyn PinnedRange>> {
        Ok(Box::new(FakeRange {
            base: userspace_addr,
            holes: self.holes.clone(),
        }))
    }
}

pub struct FakeBackend {
    pub host: Arc<FakeHostCpu>,
    pub pinner: Arc<FakePinner>,
    /// Handle onto the control structure of the most recently created VM.
    pub last_hw: Mutex<Option<Arc<Mutex<FakeInner>>>>,
}

impl Default for FakeBackend {
    fn default() -> FakeBackend {
        FakeBackend {
            host: Arc::new(FakeHostCpu::default()),
            pinner: Arc::new(FakePinner::default()),
            last_hw: Mutex::new(None),
        }
    }
}

impl Backend for FakeBackend {
    fn new_vm_control(&self) -> Result<Box<dyn VmControl>> {
        let hw = FakeVmControl::default();
        *self.last_hw.lock().unwrap() = Some(hw.0.clone());
        Ok(Box::new(hw))
    }

    fn new_table_frames(&self) -> Result<Box<dyn TableFrames>> {
        Ok(Box::new(HeapFrames))
    }

    fn host_cpu(&self) -> Arc<dyn HostCpu> {
        self.host.clone()
    }

    fn pinner(&self) -> Arc<dyn MemoryPinner> {
        self.pinner.clone()
    }
}

/// A bare vCPU on scripted hardware, bypassing the control surface.
pub fn test_vcpu() -> (Vcpu, Arc<Mutex<FakeInner>>) {
    let hw = FakeVmControl::default();
    let inner = hw.0.clone();
    let vcpu = Vcpu::new(
        Box::new(hw),
        Arc::new(FakeHostCpu::default()),
        Box::new(HeapFrames),
        Arc::new(Mutex::new(IrqState::new())),
    )
    .unwrap();
    (vcpu, inner)
}
