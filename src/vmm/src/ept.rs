// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Extended page tables: the 4-level guest-physical to host-physical radix
//! tree the hardware walks on every guest memory access.
//!
//! Each level splits 9 bits of the guest-physical address; the low 12 bits
//! stay as the page offset. Every node pairs the hardware-visible entry
//! frame (child host-physical address plus permission bits) with host-owned
//! child handles, so teardown is plain ownership and no entry is ever
//! reparsed to find a child.

use vm_memory::{Address, GuestAddress};
use vmx::vmcs::{EptEntryFlags, EPT_DEFAULTS};

#[cfg(test)]
use crate::Error;
use crate::{Result, PAGE_SIZE};

pub const ENTRIES_PER_TABLE: usize = 512;

/// One page-aligned table frame: 512 hardware entries plus the
/// host-physical address the parent entry must point at.
pub struct TableFrame {
    pub entries: Box<[u64; ENTRIES_PER_TABLE]>,
    pub phys: u64,
}

/// Allocator for translation-table frames.
///
/// Allocation failure is `Error::NoMemory` and is fatal to the enclosing
/// mapping call; levels already built stay in place and are found again on
/// retry.
pub trait TableFrames: Send {
    fn alloc(&mut self) -> Result<TableFrame>;
}

/// Heap-backed frames for hosted use: the "physical" address is the stable
/// heap address of the entry array, which a real walker never sees.
pub struct HeapFrames;

impl TableFrames for HeapFrames {
    fn alloc(&mut self) -> Result<TableFrame> {
        let entries: Box<[u64; ENTRIES_PER_TABLE]> = Box::new([0; ENTRIES_PER_TABLE]);
        let phys = entries.as_ptr() as u64;
        Ok(TableFrame { entries, phys })
    }
}

/// Lowest level: hardware entries only, each mapping one 4 KiB guest page.
struct PageTable {
    frame: TableFrame,
}

struct PageDirectory {
    frame: TableFrame,
    tables: Box<[Option<PageTable>; ENTRIES_PER_TABLE]>,
}

struct PageDirectoryPointer {
    frame: TableFrame,
    directories: Box<[Option<PageDirectory>; ENTRIES_PER_TABLE]>,
}

fn empty_children<T>() -> Box<[Option<T>; ENTRIES_PER_TABLE]> {
    Box::new(std::array::from_fn(|_| None))
}

fn split(guest: GuestAddress) -> (usize, usize, usize, usize) {
    let gpa = guest.raw_value();
    (
        ((gpa >> 39) & 0x1ff) as usize,
        ((gpa >> 30) & 0x1ff) as usize,
        ((gpa >> 21) & 0x1ff) as usize,
        ((gpa >> 12) & 0x1ff) as usize,
    )
}

/// The per-VM translation tree. The root frame's host-physical address goes
/// into the hardware's table pointer; everything below is owned here and
/// freed bottom-up when the VM is torn down. Backing guest frames are never
/// freed by this module, only the tables that reference them.
pub struct Ept {
    root: TableFrame,
    pointers: Box<[Option<PageDirectoryPointer>; ENTRIES_PER_TABLE]>,
    frames: Box<dyn TableFrames>,
}

impl Ept {
    pub fn new(mut frames: Box<dyn TableFrames>) -> Result<Ept> {
        let root = frames.alloc()?;
        Ok(Ept {
            root,
            pointers: empty_children(),
            frames,
        })
    }

    /// Host-physical address of the root table, for the hardware pointer.
    pub fn root_phys(&self) -> u64 {
        self.root.phys
    }

    /// Maps one guest page onto one host frame with the default
    /// read/write/execute permissions and write-back caching. Intermediate
    /// levels are allocated on first use; remapping an already-mapped page
    /// silently overwrites the old entry.
    pub fn add_page(&mut self, guest: GuestAddress, host_phys: u64) -> Result<()> {
        let (l4, l3, l2, l1) = split(guest);

        if self.pointers[l4].is_none() {
            let frame = self.frames.alloc()?;
            self.root.entries[l4] = frame.phys | EPT_DEFAULTS;
            self.pointers[l4] = Some(PageDirectoryPointer {
                frame,
                directories: empty_children(),
            });
        }
        let pointer = self.pointers[l4].as_mut().unwrap();

        if pointer.directories[l3].is_none() {
            let frame = self.frames.alloc()?;
            pointer.frame.entries[l3] = frame.phys | EPT_DEFAULTS;
            pointer.directories[l3] = Some(PageDirectory {
                frame,
                tables: empty_children(),
            });
        }
        let directory = pointer.directories[l3].as_mut().unwrap();

        if directory.tables[l2].is_none() {
            let frame = self.frames.alloc()?;
            directory.frame.entries[l2] = frame.phys | EPT_DEFAULTS;
            directory.tables[l2] = Some(PageTable { frame });
        }
        let table = directory.tables[l2].as_mut().unwrap();

        table.frame.entries[l1] =
            host_phys | EPT_DEFAULTS | EptEntryFlags::CACHE_WRITEBACK.bits();
        Ok(())
    }

    /// Walks the tree without modifying it. `None` when any level is absent
    /// or the leaf entry was never written; the result is masked down to the
    /// page boundary.
    pub fn translate(&self, guest: GuestAddress) -> Option<u64> {
        let (l4, l3, l2, l1) = split(guest);
        let pointer = self.pointers[l4].as_ref()?;
        let directory = pointer.directories[l3].as_ref()?;
        let table = directory.tables[l2].as_ref()?;
        let entry = table.frame.entries[l1];
        if entry == 0 {
            return None;
        }
        Some(entry & !(PAGE_SIZE - 1))
    }
}
