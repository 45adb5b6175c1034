// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The KVM-shaped control surface and the client registry behind it.
//!
//! Each client handle owns at most one VM with exactly one vCPU. Handles are
//! reference counted by open count: state appears on the first open and is
//! torn down on the last close. Operations serialize on the per-vCPU lock,
//! except interrupt-line updates which only take the narrower line lock so
//! they can land while the run loop is inside guest code.

use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use tracing::debug;
use vm_memory::{Address, GuestAddress};

use crate::abi::*;
use crate::vstate::{IrqState, Vcpu, IRQ_MAX};
use crate::{Backend, Error, Result, PAGE_SIZE};

/// Pins user memory so guest mappings stay resolvable while the VM runs.
pub trait MemoryPinner: Send + Sync {
    /// Wires `[userspace_addr, userspace_addr + size)` and returns a handle
    /// that resolves page offsets to host-physical frames. Unpinning happens
    /// when the handle drops.
    fn pin(&self, userspace_addr: u64, size: u64) -> Result<Box<dyn PinnedRange>>;
}

pub trait PinnedRange: Send {
    /// Host-physical frame backing `offset` into the pinned range, `None`
    /// when the page cannot be resolved.
    fn host_frame(&self, offset: u64) -> Option<u64>;
}

pub(crate) struct VmState {
    pub(crate) vcpu: Mutex<Vcpu>,
    pub(crate) irq: Arc<Mutex<IrqState>>,
    pins: Mutex<Vec<Box<dyn PinnedRange>>>,
    pit: Mutex<PitState>,
    irqchip: Mutex<IrqchipState>,
}

struct ClientState {
    vm: Mutex<Option<Arc<VmState>>>,
}

struct ClientEntry {
    open_count: u32,
    state: Arc<ClientState>,
}

/// The monitor's front door. One instance serves every client.
pub struct Device {
    backend: Arc<dyn Backend>,
    clients: Mutex<FxHashMap<u64, ClientEntry>>,
}

impl Device {
    pub fn new(backend: Arc<dyn Backend>) -> Device {
        Device {
            backend,
            clients: Mutex::new(FxHashMap::default()),
        }
    }

    /// Registers one open of a client handle, creating its state on the
    /// first.
    pub fn open(&self, client_id: u64) {
        let mut clients = self.clients.lock().unwrap();
        let entry = clients.entry(client_id).or_insert_with(|| ClientEntry {
            open_count: 0,
            state: Arc::new(ClientState {
                vm: Mutex::new(None),
            }),
        });
        entry.open_count += 1;
    }

    /// Drops one open; the last close tears the client's VM down.
    pub fn close(&self, client_id: u64) -> Result<()> {
        let mut clients = self.clients.lock().unwrap();
        let entry = clients.get_mut(&client_id).ok_or(Error::NoClient)?;
        entry.open_count -= 1;
        if entry.open_count == 0 {
            clients.remove(&client_id);
            debug!(client_id, "client torn down");
        }
        Ok(())
    }

    fn client(&self, client_id: u64) -> Result<Arc<ClientState>> {
        self.clients
            .lock()
            .unwrap()
            .get(&client_id)
            .map(|entry| entry.state.clone())
            .ok_or(Error::NoClient)
    }

    fn vm(client: &ClientState) -> Result<Arc<VmState>> {
        client.vm.lock().unwrap().clone().ok_or(Error::NoVm)
    }

    #[cfg(test)]
    pub(crate) fn vm_state(&self, client_id: u64) -> Arc<VmState> {
        Self::vm(&self.client(client_id).unwrap()).unwrap()
    }

    /// Dispatches one opcode-tagged operation for an open client.
    pub fn handle(&self, client_id: u64, request: Request) -> Result<Response> {
        let client = self.client(client_id)?;
        match request {
            Request::ApiVersion => Ok(Response::Number(KVM_API_VERSION as u64)),
            Request::CheckExtension(cap) => {
                let supported = SUPPORTED_EXTENSIONS.contains(&cap);
                Ok(Response::Number(supported as u64))
            }
            Request::CreateVm => {
                self.create_vm(&client)?;
                Ok(Response::Unit)
            }
            Request::CreateVcpu(id) => {
                Self::vm(&client)?;
                // Single-vCPU machines only.
                if id != 0 {
                    return Err(Error::InvalidArgument);
                }
                Ok(Response::Unit)
            }
            Request::VcpuMmapSize => Ok(Response::Number(VCPU_MMAP_SIZE)),
            Request::MapVcpu => {
                let vm = Self::vm(&client)?;
                let run = vm.vcpu.lock().unwrap().run.clone();
                Ok(Response::RunPage(run))
            }
            Request::SetUserMemoryRegion(region) => {
                let vm = Self::vm(&client)?;
                self.set_user_memory_region(&vm, &region)?;
                Ok(Response::Unit)
            }
            Request::GetRegs => {
                let vm = Self::vm(&client)?;
                let regs = vm.vcpu.lock().unwrap().get_regs();
                Ok(Response::Regs(regs))
            }
            Request::SetRegs(regs) => {
                let vm = Self::vm(&client)?;
                vm.vcpu.lock().unwrap().set_regs(&regs);
                Ok(Response::Unit)
            }
            Request::GetSregs => {
                let vm = Self::vm(&client)?;
                let sregs = vm.vcpu.lock().unwrap().get_sregs();
                Ok(Response::Sregs(sregs))
            }
            Request::SetSregs(sregs) => {
                let vm = Self::vm(&client)?;
                vm.vcpu.lock().unwrap().set_sregs(&sregs);
                Ok(Response::Unit)
            }
            Request::Run => {
                let vm = Self::vm(&client)?;
                let outcome = vm.vcpu.lock().unwrap().run()?;
                Ok(Response::RunOutcome(outcome))
            }
            Request::IrqLine(level) => {
                let vm = Self::vm(&client)?;
                if level.irq as usize >= IRQ_MAX {
                    return Err(Error::InvalidArgument);
                }
                vm.irq
                    .lock()
                    .unwrap()
                    .set_line(level.irq as usize, level.level);
                Ok(Response::Unit)
            }
            Request::SetCpuid(entries) => {
                let vm = Self::vm(&client)?;
                let mut vcpu = vm.vcpu.lock().unwrap();
                debug!(count = entries.len(), "installing cpuid overrides");
                vcpu.cpuid_overrides = entries
                    .into_iter()
                    .map(|entry| ((entry.function, entry.index), entry))
                    .collect();
                Ok(Response::Unit)
            }
            Request::SetMsrs(entries) => {
                let vm = Self::vm(&client)?;
                let mut vcpu = vm.vcpu.lock().unwrap();
                debug!(count = entries.len(), "installing msr table");
                vcpu.msrs = entries
                    .into_iter()
                    .map(|entry| (entry.index, entry.data))
                    .collect();
                Ok(Response::Unit)
            }
            Request::GetSupportedCpuid { max_entries } => {
                Ok(Response::Cpuid(self.supported_cpuid(max_entries)?))
            }
            Request::GetMsrIndexList { max_indices } => {
                if max_indices < MSR_INDEX_LIST.len() {
                    return Err(Error::TooBig);
                }
                Ok(Response::MsrIndices(MSR_INDEX_LIST.to_vec()))
            }
            Request::GetPit => {
                let vm = Self::vm(&client)?;
                let pit = *vm.pit.lock().unwrap();
                Ok(Response::Pit(pit))
            }
            Request::SetPit(state) => {
                let vm = Self::vm(&client)?;
                *vm.pit.lock().unwrap() = state;
                Ok(Response::Unit)
            }
            Request::GetIrqchip => {
                let vm = Self::vm(&client)?;
                let chip = *vm.irqchip.lock().unwrap();
                Ok(Response::Irqchip(chip))
            }
            Request::SetIrqchip(state) => {
                let vm = Self::vm(&client)?;
                *vm.irqchip.lock().unwrap() = state;
                Ok(Response::Unit)
            }
            // Accepted so clients following the usual bring-up sequence
            // keep working; the monitor has nothing to configure for them.
            Request::GetFpu => {
                Self::vm(&client)?;
                Ok(Response::Fpu(FpuState::default()))
            }
            Request::SetFpu(_) | Request::CreateIrqchip | Request::CreatePit => {
                Self::vm(&client)?;
                Ok(Response::Unit)
            }
            Request::SetTssAddr(addr) | Request::SetIdentityMapAddr(addr) => {
                Self::vm(&client)?;
                debug!(addr = format_args!("{:#x}", addr), "ignored address setup");
                Ok(Response::Unit)
            }
            Request::SetSignalMask(_) => {
                Self::vm(&client)?;
                Ok(Response::Unit)
            }
        }
    }

    /// Builds the VM: vCPU, translation tables, hardware control structure,
    /// and the fixed initial configuration. One per handle.
    fn create_vm(&self, client: &ClientState) -> Result<()> {
        let mut slot = client.vm.lock().unwrap();
        if slot.is_some() {
            return Err(Error::VmExists);
        }

        let irq = Arc::new(Mutex::new(IrqState::new()));
        let hw = self.backend.new_vm_control()?;
        let frames = self.backend.new_table_frames()?;
        let mut vcpu = Vcpu::new(hw, self.backend.host_cpu(), frames, irq.clone())?;
        vcpu.configure()?;

        *slot = Some(Arc::new(VmState {
            vcpu: Mutex::new(vcpu),
            irq,
            pins: Mutex::new(Vec::new()),
            pit: Mutex::new(PitState::default()),
            irqchip: Mutex::new(IrqchipState::default()),
        }));
        Ok(())
    }

    /// Maps a user memory range into the guest, one page at a time.
    /// Alignment is validated before anything is touched; an unresolvable
    /// page fails the call hard, leaving earlier pages mapped.
    fn set_user_memory_region(&self, vm: &VmState, region: &UserMemoryRegion) -> Result<()> {
        let guest_base = region.guest_phys_addr.raw_value();
        if guest_base % PAGE_SIZE != 0
            || region.memory_size % PAGE_SIZE != 0
            || region.userspace_addr % PAGE_SIZE != 0
        {
            return Err(Error::InvalidArgument);
        }

        debug!(
            slot = region.slot,
            userspace = format_args!("{:#x}", region.userspace_addr),
            guest = format_args!("{:#x}", guest_base),
            size = region.memory_size,
            "mapping user memory region"
        );

        let range = self
            .backend
            .pinner()
            .pin(region.userspace_addr, region.memory_size)?;

        let mut vcpu = vm.vcpu.lock().unwrap();
        let mut off = 0;
        while off < region.memory_size {
            let host = range
                .host_frame(off)
                .ok_or(Error::Unmapped(region.userspace_addr + off))?;
            vcpu.ept.add_page(GuestAddress(guest_base + off), host)?;
            off += PAGE_SIZE;
        }

        vm.pins.lock().unwrap().push(range);
        Ok(())
    }

    fn supported_cpuid(&self, max_entries: usize) -> Result<Vec<CpuidEntry>> {
        if max_entries < SUPPORTED_CPUID_LEAVES.len() {
            return Err(Error::TooBig);
        }
        let host = self.backend.host_cpu();
        Ok(SUPPORTED_CPUID_LEAVES
            .iter()
            .map(|&(function, index)| {
                let result = host.cpuid(function, index);
                CpuidEntry {
                    function,
                    index,
                    flags: 0,
                    eax: result.eax,
                    ebx: result.ebx,
                    ecx: result.ecx,
                    edx: result.edx,
                }
            })
            .collect())
    }
}
