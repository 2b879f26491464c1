//! Physical memory allocator, for user processes, kernel stacks,
//! page-table pages and trapframes. Allocates whole 4096-byte pages.
//!
//! Each frame carries a reference count so that fork can map a page into
//! several address spaces; `free` only links a frame back onto the free
//! list once the last reference is gone.

use core::mem;
use core::ptr;

use crate::{
    memlayout::{kernel_end, KERNBASE, PHYSTOP},
    page::Page,
    riscv::{pgrounddown, pgroundup, PGSIZE},
};

/// Number of allocatable frames between KERNBASE and PHYSTOP.
const NFRAME: usize = (PHYSTOP - KERNBASE) / PGSIZE;

struct Run {
    next: *mut Run,
}

/// # Safety
///
/// - The free list has no cycle.
/// - If head is null the list is empty; otherwise head is a valid free page.
/// - A frame is on the free list iff its reference count is zero.
pub struct Kmem {
    head: *mut Run,
    refcount: [u16; NFRAME],
}

const fn frame_index(pa: usize) -> usize {
    (pa - KERNBASE) / PGSIZE
}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            refcount: [0; NFRAME],
        }
    }

    /// Create pages between `end` and `PHYSTOP`.
    ///
    /// # Safety
    ///
    /// There must be no existing pages. It implies that this method should
    /// be called only once.
    pub unsafe fn init(&mut self) {
        let pa_start = pgroundup(kernel_end());
        let pa_end = pgrounddown(PHYSTOP);
        for pa in num_iter::range_step(pa_start, pa_end, PGSIZE) {
            self.refcount[frame_index(pa)] = 1;
            // SAFETY: pa is page-aligned, inside allocatable RAM, and not
            // yet owned by anyone.
            self.free(unsafe { Page::from_usize(pa) });
        }
    }

    /// Drop one reference to the page; the frame is reusable once the last
    /// reference is gone.
    pub fn free(&mut self, page: Page) {
        let pa = page.into_usize();
        debug_assert!(
            pa % PGSIZE == 0 && (KERNBASE..PHYSTOP).contains(&pa),
            "Kmem::free"
        );

        let rc = &mut self.refcount[frame_index(pa)];
        assert!(*rc > 0, "Kmem::free refcount");
        *rc -= 1;
        if *rc > 0 {
            return;
        }

        let r = pa as *mut Run;
        // SAFETY: the frame is unreferenced, so it cannot already be on the
        // list and no cycle is created.
        unsafe { (*r).next = self.head };
        self.head = r;
    }

    /// Allocate one page with reference count 1, or None if memory is
    /// exhausted.
    pub fn alloc(&mut self) -> Option<Page> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: head is a valid free page by the invariant.
        let next = unsafe { (*self.head).next };
        let pa = mem::replace(&mut self.head, next) as usize;
        self.refcount[frame_index(pa)] = 1;
        // SAFETY: the frame just left the free list, so it is unowned.
        Some(unsafe { Page::from_usize(pa) })
    }

    /// Add a reference to an allocated frame (copy-on-write fork).
    pub fn share(&mut self, pa: usize) {
        let rc = &mut self.refcount[frame_index(pgrounddown(pa))];
        assert!(*rc > 0, "Kmem::share refcount");
        *rc += 1;
    }
}
