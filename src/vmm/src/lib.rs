// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the THIRD-PARTY file.

//! Control core of a hardware-assisted virtual machine monitor: nested page
//! tables, vCPU state, VM-exit dispatch, the run loop with interrupt
//! injection, and a KVM-shaped control surface on top.
//!
//! The machine-specific pieces stay behind traits: the world-switch primitive
//! ([`vmx::VmControl`]), direct host-processor access ([`vmx::HostCpu`]),
//! table-frame allocation ([`ept::TableFrames`]) and user-memory pinning
//! ([`device::MemoryPinner`]). Everything above those seams is portable and
//! tested in isolation.

use std::sync::Arc;

pub mod abi;
pub mod device;
pub mod ept;
mod exits;
mod run;
pub mod vstate;

#[cfg(test)]
mod testutil;

pub use device::{Device, MemoryPinner, PinnedRange};
pub use ept::{Ept, HeapFrames, TableFrame, TableFrames};
pub use run::RunOutcome;
pub use vstate::{IrqState, Vcpu};

pub const PAGE_SIZE: u64 = 4096;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A payload failed validation.
    #[error("invalid argument")]
    InvalidArgument,
    /// The caller's buffer cannot hold the full table.
    #[error("buffer too small for the full table")]
    TooBig,
    /// A translation-table frame could not be allocated.
    #[error("out of memory for translation tables")]
    NoMemory,
    /// A vCPU operation arrived before create-VM.
    #[error("no virtual machine on this handle")]
    NoVm,
    /// create-VM was issued twice on one handle.
    #[error("handle already owns a virtual machine")]
    VmExists,
    #[error("unknown client handle")]
    NoClient,
    /// A page of a user memory region had no resolvable host frame.
    #[error("no host frame backing user page {0:#x}")]
    Unmapped(u64),
    #[error("world switch failed: {0}")]
    WorldSwitch(#[from] vmx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Platform services each virtual machine is built from.
pub trait Backend: Send + Sync {
    /// Allocates a fresh hardware control structure for one vCPU.
    fn new_vm_control(&self) -> Result<Box<dyn vmx::VmControl>>;

    /// Allocates the translation-table frame allocator for one VM.
    fn new_table_frames(&self) -> Result<Box<dyn TableFrames>>;

    fn host_cpu(&self) -> Arc<dyn vmx::HostCpu>;

    fn pinner(&self) -> Arc<dyn MemoryPinner>;
}
