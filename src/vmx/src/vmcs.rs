// Copyright 2021 Red Hat, Inc.
// SPDX-License-Identifier: Apache-2.0

//! VMCS field encodings and control bits, Intel SDM Appendix B numbering.

// 16-bit guest segment selectors.
pub const GUEST_ES_SELECTOR: u32 = 0x800;
pub const GUEST_CS_SELECTOR: u32 = 0x802;
pub const GUEST_SS_SELECTOR: u32 = 0x804;
pub const GUEST_DS_SELECTOR: u32 = 0x806;
pub const GUEST_FS_SELECTOR: u32 = 0x808;
pub const GUEST_GS_SELECTOR: u32 = 0x80a;
pub const GUEST_LDTR_SELECTOR: u32 = 0x80c;
pub const GUEST_TR_SELECTOR: u32 = 0x80e;

// 64-bit control fields.
pub const VM_EXIT_MSR_STORE_ADDR: u32 = 0x2006;
pub const VM_EXIT_MSR_LOAD_ADDR: u32 = 0x2008;
pub const VM_ENTRY_MSR_LOAD_ADDR: u32 = 0x200a;
pub const VIRTUAL_APIC_PAGE_ADDR: u32 = 0x2012;
pub const APIC_ACCESS_ADDR: u32 = 0x2014;
pub const EPT_POINTER: u32 = 0x201a;
pub const GUEST_PHYSICAL_ADDRESS: u32 = 0x2400;
pub const VMCS_LINK_POINTER: u32 = 0x2800;
pub const GUEST_IA32_DEBUGCTL: u32 = 0x2802;
pub const GUEST_IA32_EFER: u32 = 0x2806;

// 32-bit control fields.
pub const PIN_BASED_VM_EXEC_CONTROL: u32 = 0x4000;
pub const CPU_BASED_VM_EXEC_CONTROL: u32 = 0x4002;
pub const EXCEPTION_BITMAP: u32 = 0x4004;
pub const PAGE_FAULT_ERROR_CODE_MASK: u32 = 0x4006;
pub const PAGE_FAULT_ERROR_CODE_MATCH: u32 = 0x4008;
pub const CR3_TARGET_COUNT: u32 = 0x400a;
pub const VM_EXIT_CONTROLS: u32 = 0x400c;
pub const VM_EXIT_MSR_STORE_COUNT: u32 = 0x400e;
pub const VM_EXIT_MSR_LOAD_COUNT: u32 = 0x4010;
pub const VM_ENTRY_CONTROLS: u32 = 0x4012;
pub const VM_ENTRY_MSR_LOAD_COUNT: u32 = 0x4014;
pub const VM_ENTRY_INTR_INFO_FIELD: u32 = 0x4016;
pub const VM_ENTRY_EXCEPTION_ERROR_CODE: u32 = 0x4018;
pub const VM_ENTRY_INSTRUCTION_LEN: u32 = 0x401a;
pub const TPR_THRESHOLD: u32 = 0x401c;
pub const SECONDARY_VM_EXEC_CONTROL: u32 = 0x401e;

// 32-bit read-only data fields.
pub const VM_INSTRUCTION_ERROR: u32 = 0x4400;
pub const VM_EXIT_REASON: u32 = 0x4402;
pub const VM_EXIT_INSTRUCTION_LEN: u32 = 0x440c;

// 32-bit guest-state fields.
pub const GUEST_ES_LIMIT: u32 = 0x4800;
pub const GUEST_CS_LIMIT: u32 = 0x4802;
pub const GUEST_SS_LIMIT: u32 = 0x4804;
pub const GUEST_DS_LIMIT: u32 = 0x4806;
pub const GUEST_FS_LIMIT: u32 = 0x4808;
pub const GUEST_GS_LIMIT: u32 = 0x480a;
pub const GUEST_LDTR_LIMIT: u32 = 0x480c;
pub const GUEST_TR_LIMIT: u32 = 0x480e;
pub const GUEST_GDTR_LIMIT: u32 = 0x4810;
pub const GUEST_IDTR_LIMIT: u32 = 0x4812;
pub const GUEST_ES_AR_BYTES: u32 = 0x4814;
pub const GUEST_CS_AR_BYTES: u32 = 0x4816;
pub const GUEST_SS_AR_BYTES: u32 = 0x4818;
pub const GUEST_DS_AR_BYTES: u32 = 0x481a;
pub const GUEST_FS_AR_BYTES: u32 = 0x481c;
pub const GUEST_GS_AR_BYTES: u32 = 0x481e;
pub const GUEST_LDTR_AR_BYTES: u32 = 0x4820;
pub const GUEST_TR_AR_BYTES: u32 = 0x4822;
pub const GUEST_INTERRUPTIBILITY_INFO: u32 = 0x4824;
pub const GUEST_ACTIVITY_STATE: u32 = 0x4826;
pub const GUEST_SYSENTER_CS: u32 = 0x482a;
pub const VMX_PREEMPTION_TIMER_VALUE: u32 = 0x482e;

// Natural-width control fields.
pub const CR0_GUEST_HOST_MASK: u32 = 0x6000;
pub const CR4_GUEST_HOST_MASK: u32 = 0x6002;
pub const CR0_READ_SHADOW: u32 = 0x6004;
pub const CR4_READ_SHADOW: u32 = 0x6006;
pub const CR3_TARGET_VALUE0: u32 = 0x6008;
pub const CR3_TARGET_VALUE1: u32 = 0x600a;
pub const CR3_TARGET_VALUE2: u32 = 0x600c;
pub const CR3_TARGET_VALUE3: u32 = 0x600e;

// Natural-width read-only data fields.
pub const EXIT_QUALIFICATION: u32 = 0x6400;

// Natural-width guest-state fields.
pub const GUEST_CR0: u32 = 0x6800;
pub const GUEST_CR3: u32 = 0x6802;
pub const GUEST_CR4: u32 = 0x6804;
pub const GUEST_ES_BASE: u32 = 0x6806;
pub const GUEST_CS_BASE: u32 = 0x6808;
pub const GUEST_SS_BASE: u32 = 0x680a;
pub const GUEST_DS_BASE: u32 = 0x680c;
pub const GUEST_FS_BASE: u32 = 0x680e;
pub const GUEST_GS_BASE: u32 = 0x6810;
pub const GUEST_LDTR_BASE: u32 = 0x6812;
pub const GUEST_TR_BASE: u32 = 0x6814;
pub const GUEST_GDTR_BASE: u32 = 0x6816;
pub const GUEST_IDTR_BASE: u32 = 0x6818;
pub const GUEST_DR7: u32 = 0x681a;
pub const GUEST_RSP: u32 = 0x681c;
pub const GUEST_RIP: u32 = 0x681e;
pub const GUEST_RFLAGS: u32 = 0x6820;
pub const GUEST_PENDING_DBG_EXCEPTIONS: u32 = 0x6822;
pub const GUEST_SYSENTER_ESP: u32 = 0x6824;
pub const GUEST_SYSENTER_EIP: u32 = 0x6826;

// Pin-based execution controls.
pub const PIN_BASED_EXT_INTR_MASK: u64 = 1 << 0;
pub const PIN_BASED_NMI_EXITING: u64 = 1 << 3;
pub const PIN_BASED_ALWAYSON_WITHOUT_TRUE_MSR: u64 = 0x16;

// Primary processor-based execution controls.
pub const CPU_BASED_VIRTUAL_INTR_PENDING: u64 = 1 << 2;
pub const CPU_BASED_CR3_LOAD_EXITING: u64 = 1 << 15;
pub const CPU_BASED_CR3_STORE_EXITING: u64 = 1 << 16;
pub const CPU_BASED_TPR_SHADOW: u64 = 1 << 21;
pub const CPU_BASED_MOV_DR_EXITING: u64 = 1 << 23;
pub const CPU_BASED_UNCOND_IO_EXITING: u64 = 1 << 24;
pub const CPU_BASED_ACTIVATE_SECONDARY_CONTROLS: u64 = 1 << 31;
pub const CPU_BASED_ALWAYSON_WITHOUT_TRUE_MSR: u64 = 0x0401_e172;

// Secondary processor-based execution controls.
pub const SECONDARY_EXEC_VIRTUALIZE_APIC_ACCESSES: u64 = 1 << 0;
pub const SECONDARY_EXEC_ENABLE_EPT: u64 = 1 << 1;
pub const SECONDARY_EXEC_UNRESTRICTED_GUEST: u64 = 1 << 7;

// Exit/entry controls.
pub const VM_EXIT_HOST_ADDR_SPACE_SIZE: u64 = 1 << 9;
pub const VM_EXIT_ALWAYSON_WITHOUT_TRUE_MSR: u64 = 0x0003_6dff;
pub const VM_ENTRY_ALWAYSON_WITHOUT_TRUE_MSR: u64 = 0x0000_11ff;

// Event-injection encoding for VM_ENTRY_INTR_INFO_FIELD.
pub const INTR_INFO_VALID_MASK: u64 = 1 << 31;
pub const INTR_TYPE_EXT_INTR: u64 = 0 << 8;

pub const GUEST_ACTIVITY_ACTIVE: u64 = 0;

// Architectural register bits the monitor interprets.
pub const X86_CR0_NE: u64 = 1 << 5;
pub const X86_CR0_PG: u64 = 1 << 31;
pub const X86_CR4_VMXE: u64 = 1 << 13;

// Sysenter MSRs mirrored into the guest at configuration time.
pub const MSR_IA32_SYSENTER_CS: u32 = 0x174;
pub const MSR_IA32_SYSENTER_ESP: u32 = 0x175;
pub const MSR_IA32_SYSENTER_EIP: u32 = 0x176;

bitflags::bitflags! {
    /// Permission and memory-type bits of an EPT entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EptEntryFlags: u64 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXECUTABLE = 1 << 2;
        /// Write-back memory type, leaf entries only.
        const CACHE_WRITEBACK = 6 << 3;
    }
}

/// Default permissions for every entry the monitor installs.
pub const EPT_DEFAULTS: u64 = EptEntryFlags::READABLE.bits()
    | EptEntryFlags::WRITABLE.bits()
    | EptEntryFlags::EXECUTABLE.bits();

/// EPT pointer low bits: 4-level walk (3 = levels - 1, bits 5:3).
pub const EPT_POINTER_WALK_LEN_4: u64 = 3 << 3;

/// Builds the event-injection value for an external interrupt vector.
pub fn external_interrupt_info(vector: u8) -> u64 {
    INTR_INFO_VALID_MASK | INTR_TYPE_EXT_INTR | vector as u64
}
