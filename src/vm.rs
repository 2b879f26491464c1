//! Page tables and address-space managers.
//!
//! `UserMemory` owns one process's page table and user pages. Fork clones
//! it lazily: writable pages are re-mapped read-only with the COW bit in
//! both spaces and the frame's reference count is bumped; the first write
//! through either mapping takes a store fault and `cow_fault` gives the
//! writer a private copy.

use core::mem;
use core::ptr;

use bitflags::bitflags;
use static_assertions::const_assert;
use zerocopy::AsBytes;

use crate::{
    kernel::kernel,
    memlayout::{
        kstack, text_end, trampoline_base, KERNBASE, PHYSTOP, PLIC, TRAMPOLINE, TRAPFRAME, UART0,
        VIRTIO0,
    },
    page::Page,
    param::NPROC,
    riscv::{make_satp, pgrounddown, pgroundup, sfence_vma, MAXVA, PGSHIFT, PGSIZE},
};

bitflags! {
    pub struct PteFlags: usize {
        /// Valid.
        const V = 1 << 0;
        /// Readable.
        const R = 1 << 1;
        /// Writable.
        const W = 1 << 2;
        /// Executable.
        const X = 1 << 3;
        /// User-accessible.
        const U = 1 << 4;
        /// RSW bit: lazily copied copy-on-write mapping.
        const COW = 1 << 8;
    }
}

/// A user virtual address.
#[derive(Clone, Copy, PartialEq)]
pub struct UVAddr(usize);

impl UVAddr {
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    pub const fn into_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

#[derive(Clone, Copy)]
#[repr(transparent)]
struct PageTableEntry(usize);

impl PageTableEntry {
    const fn invalid() -> Self {
        Self(0)
    }

    fn new(pa: usize, flags: PteFlags) -> Self {
        Self(((pa >> PGSHIFT) << 10) | flags.bits())
    }

    fn pa(self) -> usize {
        (self.0 >> 10) << PGSHIFT
    }

    fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// A valid entry with none of R/W/X set points at a lower-level table.
    fn is_table(self) -> bool {
        self.is_valid()
            && !self
                .flags()
                .intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }
}

const NPTE: usize = 512;

#[repr(C, align(4096))]
struct RawPageTable {
    entries: [PageTableEntry; NPTE],
}

const_assert!(mem::size_of::<RawPageTable>() == PGSIZE);

/// Index of `va` at the given level of the Sv39 tree (2 is the root).
const fn px(level: usize, va: usize) -> usize {
    (va >> (PGSHIFT + 9 * level)) & (NPTE - 1)
}

/// Allocate one zeroed page-table page.
fn alloc_table() -> Option<*mut RawPageTable> {
    let mut page = kernel().alloc()?;
    page.write_bytes(0);
    Some(page.into_usize() as *mut RawPageTable)
}

/// Return the address of the PTE in page table `root` that corresponds to
/// virtual address `va`. If `alloc` is true, create any required
/// page-table pages.
///
/// # Safety
///
/// `root` is a valid page-table tree.
unsafe fn walk(root: *mut RawPageTable, va: usize, alloc: bool) -> Option<*mut PageTableEntry> {
    assert!(va < MAXVA, "walk");

    let mut table = root;
    for level in [2, 1] {
        // SAFETY: table points at a valid page-table page.
        let pte = unsafe { &mut (*table).entries[px(level, va)] };
        if pte.is_valid() {
            table = pte.pa() as *mut RawPageTable;
        } else {
            if !alloc {
                return None;
            }
            let next = alloc_table()?;
            *pte = PageTableEntry::new(next as usize, PteFlags::V);
            table = next;
        }
    }
    // SAFETY: table points at a valid leaf-level page-table page.
    Some(unsafe { &mut (*table).entries[px(0, va)] })
}

/// Create PTEs for virtual addresses starting at `va` that refer to
/// physical addresses starting at `pa`. `va` must be page-aligned.
///
/// # Safety
///
/// `root` is a valid page-table tree and the `pa` range is owned or MMIO.
unsafe fn map_pages(
    root: *mut RawPageTable,
    va: usize,
    size: usize,
    mut pa: usize,
    perm: PteFlags,
) -> Result<(), ()> {
    assert!(va % PGSIZE == 0, "map_pages: va not aligned");
    assert!(size > 0, "map_pages: size");

    let last = pgrounddown(va + size - 1);
    let mut a = va;
    loop {
        // SAFETY: precondition of this function.
        let pte = unsafe { walk(root, a, true).ok_or(())? };
        // SAFETY: walk returns a valid PTE address.
        let pte = unsafe { &mut *pte };
        assert!(!pte.is_valid(), "map_pages: remap");
        *pte = PageTableEntry::new(pa, perm | PteFlags::V);
        if a == last {
            break;
        }
        a += PGSIZE;
        pa += PGSIZE;
    }
    Ok(())
}

/// Remove the mapping for one page if present, returning its physical
/// address and flags.
///
/// # Safety
///
/// `root` is a valid page-table tree.
unsafe fn unmap_page(root: *mut RawPageTable, va: usize) -> Option<(usize, PteFlags)> {
    // SAFETY: precondition of this function.
    let pte = unsafe { walk(root, va, false)? };
    // SAFETY: walk returns a valid PTE address.
    let pte = unsafe { &mut *pte };
    if !pte.is_valid() {
        return None;
    }
    assert!(!pte.is_table(), "unmap_page: not a leaf");
    let out = (pte.pa(), pte.flags());
    *pte = PageTableEntry::invalid();
    Some(out)
}

/// Recursively free page-table pages. All leaf mappings must already have
/// been removed.
///
/// # Safety
///
/// `table` is a valid page-table tree no hart is using.
unsafe fn free_walk(table: *mut RawPageTable) {
    for i in 0..NPTE {
        // SAFETY: table points at a valid page-table page.
        let pte = unsafe { &mut (*table).entries[i] };
        if pte.is_table() {
            // SAFETY: the entry points at a child table.
            unsafe { free_walk(pte.pa() as *mut RawPageTable) };
            *pte = PageTableEntry::invalid();
        } else if pte.is_valid() {
            panic!("free_walk: leaf");
        }
    }
    // SAFETY: the table page came from the allocator and is no longer
    // referenced.
    kernel().free(unsafe { Page::from_usize(table as usize) });
}

/// One process's user address space: the page table plus the size of the
/// mapped image starting at virtual address zero.
pub struct UserMemory {
    page_table: *mut RawPageTable,
    size: usize,
}

impl UserMemory {
    /// A placeholder for an unused process slot.
    pub const fn uninit() -> Self {
        Self {
            page_table: ptr::null_mut(),
            size: 0,
        }
    }

    /// Create an address space containing only the trampoline and the given
    /// trapframe page; if `src` is given, also one user page holding a copy
    /// of it (the initcode image).
    pub fn new(trap_frame_pa: usize, src: Option<&[u8]>) -> Option<Self> {
        let root = alloc_table()?;
        let mut this = Self {
            page_table: root,
            size: 0,
        };

        // Map the trampoline code (for system call return) at the highest
        // user virtual address. Only the supervisor uses it, on the way
        // to/from user space, so not U.
        // SAFETY: root is a fresh table; the trampoline page is kernel text.
        if unsafe {
            map_pages(
                root,
                TRAMPOLINE,
                PGSIZE,
                trampoline_base(),
                PteFlags::R | PteFlags::X,
            )
        }
        .is_err()
        {
            this.free();
            return None;
        }

        // Map the trapframe page just below the trampoline page.
        // SAFETY: the trapframe page is owned by the caller's process slot.
        if unsafe {
            map_pages(
                root,
                TRAPFRAME,
                PGSIZE,
                trap_frame_pa,
                PteFlags::R | PteFlags::W,
            )
        }
        .is_err()
        {
            this.free();
            return None;
        }

        if let Some(src) = src {
            assert!(src.len() <= PGSIZE, "UserMemory::new: initcode too big");
            let mut page = match kernel().alloc() {
                Some(page) => page,
                None => {
                    this.free();
                    return None;
                }
            };
            page.write_bytes(0);
            let pa = page.into_usize();
            // SAFETY: the page is owned and page-sized.
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), pa as *mut u8, src.len()) };
            // SAFETY: the page was just allocated for this space.
            if unsafe {
                map_pages(
                    root,
                    0,
                    PGSIZE,
                    pa,
                    PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::U,
                )
            }
            .is_err()
            {
                // SAFETY: pa was just allocated and is unmapped.
                kernel().free(unsafe { Page::from_usize(pa) });
                this.free();
                return None;
            }
            this.size = PGSIZE;
        }

        Some(this)
    }

    /// Clone this address space for fork. User pages are not copied:
    /// writable mappings become read-only + COW in both spaces and every
    /// frame gains a reference. The child gets its own trapframe page.
    pub fn clone_cow(&mut self, trap_frame_pa: usize) -> Option<Self> {
        let mut child = Self::new(trap_frame_pa, None)?;

        let mut va = 0;
        while va < self.size {
            // SAFETY: the table is valid and va is below size.
            let pte = unsafe { walk(self.page_table, va, false) }.expect("clone_cow: hole");
            // SAFETY: walk returns a valid PTE address.
            let pte = unsafe { &mut *pte };
            assert!(pte.is_valid(), "clone_cow: invalid page");

            let mut flags = pte.flags();
            if flags.contains(PteFlags::W) {
                flags.remove(PteFlags::W);
                flags.insert(PteFlags::COW);
                *pte = PageTableEntry::new(pte.pa(), flags);
            }

            // SAFETY: the frame is owned by the parent space; the child
            // gains a reference right below.
            if unsafe { map_pages(child.page_table, va, PGSIZE, pte.pa(), flags) }.is_err() {
                child.free();
                return None;
            }
            kernel().share(pte.pa());

            child.size = va + PGSIZE;
            va += PGSIZE;
        }

        // The parent's mappings just lost their write bits.
        // SAFETY: flushing the TLB is always allowed.
        unsafe { sfence_vma() };

        Some(child)
    }

    /// Handle a store fault at `va` by giving the faulting space a private,
    /// writable copy of the page.
    pub fn cow_fault(&mut self, va: usize) -> Result<(), ()> {
        if va == 0 || va >= MAXVA {
            return Err(());
        }

        let va = pgrounddown(va);
        // SAFETY: the table is valid.
        let pte = unsafe { walk(self.page_table, va, false) }.ok_or(())?;
        // SAFETY: walk returns a valid PTE address.
        let pte = unsafe { &mut *pte };
        if !pte.flags().contains(PteFlags::V | PteFlags::U) {
            return Err(());
        }

        let old_pa = pte.pa();
        let mut page = kernel().alloc().ok_or(())?;
        page.copy_from(old_pa);
        let new_pa = page.into_usize();
        // SAFETY: this space owned one reference to old_pa; the mapping is
        // replaced below.
        kernel().free(unsafe { Page::from_usize(old_pa) });

        *pte = PageTableEntry::new(
            new_pa,
            PteFlags::V | PteFlags::U | PteFlags::R | PteFlags::W | PteFlags::X,
        );
        // SAFETY: flushing the TLB is always allowed.
        unsafe { sfence_vma() };
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Page table address for satp.
    pub fn satp(&self) -> usize {
        make_satp(self.page_table as usize)
    }

    /// Grow or shrink the space by `n` bytes. Returns the old size.
    pub fn resize(&mut self, n: i32) -> Result<usize, ()> {
        let old = self.size;
        let new = (old as isize).checked_add(n as isize).ok_or(())?;
        if new < 0 {
            return Err(());
        }
        let new = new as usize;
        if new > old {
            self.grow(new)?;
        } else {
            self.shrink(new);
        }
        Ok(old)
    }

    /// Allocate and map zeroed pages to grow the space to `new` bytes.
    fn grow(&mut self, new: usize) -> Result<(), ()> {
        let old = self.size;
        let mut a = pgroundup(old);
        while a < new {
            let mut page = match kernel().alloc() {
                Some(page) => page,
                None => {
                    self.shrink(old);
                    return Err(());
                }
            };
            page.write_bytes(0);
            let pa = page.into_usize();
            // SAFETY: the page was just allocated for this space.
            if unsafe {
                map_pages(
                    self.page_table,
                    a,
                    PGSIZE,
                    pa,
                    PteFlags::R | PteFlags::W | PteFlags::U,
                )
            }
            .is_err()
            {
                // SAFETY: pa was just allocated and is unmapped.
                kernel().free(unsafe { Page::from_usize(pa) });
                self.shrink(old);
                return Err(());
            }
            self.size = a + PGSIZE;
            a += PGSIZE;
        }
        self.size = new;
        Ok(())
    }

    /// Unmap and release pages above `new` bytes.
    fn shrink(&mut self, new: usize) {
        let mut a = pgroundup(new);
        while a < pgroundup(self.size) {
            // SAFETY: the table is valid.
            if let Some((pa, _)) = unsafe { unmap_page(self.page_table, a) } {
                // SAFETY: this space owned a reference to pa.
                kernel().free(unsafe { Page::from_usize(pa) });
            }
            a += PGSIZE;
        }
        self.size = new;
    }

    /// Resolve `va` for a kernel write, breaking a COW share first if
    /// needed.
    fn walk_writable(&mut self, va: usize) -> Result<usize, ()> {
        if va >= self.size {
            return Err(());
        }
        loop {
            // SAFETY: the table is valid.
            let pte = unsafe { walk(self.page_table, va, false) }.ok_or(())?;
            // SAFETY: walk returns a valid PTE address.
            let pte = unsafe { &mut *pte };
            let flags = pte.flags();
            if !flags.contains(PteFlags::V | PteFlags::U) {
                return Err(());
            }
            if flags.contains(PteFlags::W) {
                return Ok(pte.pa());
            }
            if !flags.contains(PteFlags::COW) {
                return Err(());
            }
            self.cow_fault(va)?;
        }
    }

    /// Copy from kernel to user.
    pub fn copy_out_bytes(&mut self, dst: UVAddr, src: &[u8]) -> Result<(), ()> {
        let mut dst = dst.into_usize();
        let mut src = src;
        while !src.is_empty() {
            let va0 = pgrounddown(dst);
            let pa0 = self.walk_writable(va0)?;
            let n = core::cmp::min(PGSIZE - (dst - va0), src.len());
            // SAFETY: pa0 is a writable user frame of this space.
            unsafe {
                ptr::copy_nonoverlapping(src.as_ptr(), (pa0 + (dst - va0)) as *mut u8, n);
            }
            src = &src[n..];
            dst += n;
        }
        Ok(())
    }

    /// Copy a value out to user space.
    pub fn copy_out<T: AsBytes>(&mut self, dst: UVAddr, src: &T) -> Result<(), ()> {
        self.copy_out_bytes(dst, src.as_bytes())
    }

    /// Copy from user to kernel.
    pub fn copy_in_bytes(&mut self, dst: &mut [u8], src: UVAddr) -> Result<(), ()> {
        let mut src = src.into_usize();
        let mut off = 0;
        while off < dst.len() {
            let va0 = pgrounddown(src);
            if va0 >= self.size {
                return Err(());
            }
            // SAFETY: the table is valid.
            let pte = unsafe { walk(self.page_table, va0, false) }.ok_or(())?;
            // SAFETY: walk returns a valid PTE address.
            let pte = unsafe { &*pte };
            if !pte.flags().contains(PteFlags::V | PteFlags::U) {
                return Err(());
            }
            let n = core::cmp::min(PGSIZE - (src - va0), dst.len() - off);
            // SAFETY: the frame belongs to this space.
            unsafe {
                ptr::copy_nonoverlapping(
                    (pte.pa() + (src - va0)) as *const u8,
                    dst.as_mut_ptr().add(off),
                    n,
                );
            }
            off += n;
            src += n;
        }
        Ok(())
    }

    /// Release every user page and the page-table tree itself. The
    /// trapframe page is owned by the process slot and is not freed here.
    pub fn free(mut self) {
        if self.page_table.is_null() {
            return;
        }
        // SAFETY: the table is valid and this space is going away.
        unsafe {
            let _ = unmap_page(self.page_table, TRAMPOLINE);
            let _ = unmap_page(self.page_table, TRAPFRAME);
        }
        self.shrink(0);
        // SAFETY: all leaves are gone.
        unsafe { free_walk(self.page_table) };
        self.page_table = ptr::null_mut();
    }
}

/// The kernel's own address space: a direct map of devices and RAM, the
/// trampoline, and one stack page per process slot below the trampoline.
pub struct KernelMemory {
    page_table: *mut RawPageTable,
}

impl KernelMemory {
    pub fn new() -> Option<Self> {
        let root = alloc_table()?;
        let rw = PteFlags::R | PteFlags::W;
        let rx = PteFlags::R | PteFlags::X;

        // SAFETY: the mapped ranges are MMIO or kernel-owned RAM and root
        // is a fresh table.
        unsafe {
            // uart registers
            map_pages(root, UART0, PGSIZE, UART0, rw).ok()?;

            // virtio mmio disk interface
            map_pages(root, VIRTIO0, PGSIZE, VIRTIO0, rw).ok()?;

            // PLIC
            map_pages(root, PLIC, 0x40_0000, PLIC, rw).ok()?;

            // kernel text, executable and read-only
            map_pages(root, KERNBASE, text_end() - KERNBASE, KERNBASE, rx).ok()?;

            // kernel data and the physical RAM we'll make use of
            map_pages(root, text_end(), PHYSTOP - text_end(), text_end(), rw).ok()?;

            // the trampoline, mapped at the highest virtual address
            map_pages(root, TRAMPOLINE, PGSIZE, trampoline_base(), rx).ok()?;

            // one kernel stack per process slot, each below an unmapped
            // guard page
            for i in 0..NPROC {
                let pa = kernel().alloc()?.into_usize();
                map_pages(root, kstack(i), PGSIZE, pa, rw).ok()?;
            }
        }

        Some(Self { page_table: root })
    }

    /// Switch the hart's MMU to this page table.
    pub unsafe fn init_hart(&self) {
        unsafe {
            // Wait for any previous writes to the page table to finish.
            sfence_vma();
            crate::riscv::w_satp(make_satp(self.page_table as usize));
            sfence_vma();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_round_trips_address_and_flags() {
        let flags = PteFlags::V | PteFlags::R | PteFlags::W | PteFlags::U;
        let pte = PageTableEntry::new(0x8765_4000, flags);
        assert_eq!(pte.pa(), 0x8765_4000);
        assert_eq!(pte.flags(), flags);
        assert!(pte.is_valid());
        assert!(!pte.is_table());
    }

    #[test]
    fn table_entries_have_no_rwx() {
        let pte = PageTableEntry::new(0x8000_1000, PteFlags::V);
        assert!(pte.is_table());
    }

    #[test]
    fn cow_bit_is_independent_of_permissions() {
        let mut flags = PteFlags::V | PteFlags::U | PteFlags::R | PteFlags::W;
        flags.remove(PteFlags::W);
        flags.insert(PteFlags::COW);
        let pte = PageTableEntry::new(0x8000_2000, flags);
        assert!(!pte.flags().contains(PteFlags::W));
        assert!(pte.flags().contains(PteFlags::COW));
        assert!(pte.flags().contains(PteFlags::U));
    }

    #[test]
    fn px_selects_nine_bit_fields() {
        let va = (3 << (12 + 18)) | (5 << (12 + 9)) | (7 << 12) | 0x123;
        assert_eq!(px(2, va), 3);
        assert_eq!(px(1, va), 5);
        assert_eq!(px(0, va), 7);
    }
}
