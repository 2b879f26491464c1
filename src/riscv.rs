//! RISC-V privileged registers and paging constants.
//!
//! On `riscv64` these are thin `asm!` wrappers. On any other target (the
//! unit-test host) they become inert shims: CSR reads return the boot-time
//! values, writes vanish, and interrupts read as disabled. That is enough
//! for the lock and scheduler logic to run single-threaded under `cargo
//! test` without pretending to be hardware.

// Dead code is allowed in this file because not all registers are used.
#![allow(dead_code)]

use bitflags::bitflags;

/// Bytes per page.
pub const PGSIZE: usize = 4096;

/// Bits of offset within a page.
pub const PGSHIFT: usize = 12;

/// One beyond the highest possible virtual address. MAXVA is actually one
/// bit less than the max allowed by Sv39 to avoid having to sign-extend
/// virtual addresses that have the high bit set.
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);

pub const fn pgroundup(sz: usize) -> usize {
    sz.wrapping_add(PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

/// Sv39 mode bits of the satp register.
const SATP_SV39: usize = 8 << 60;

pub const fn make_satp(pagetable: usize) -> usize {
    SATP_SV39 | (pagetable >> PGSHIFT)
}

bitflags! {
    /// Machine Status Register, mstatus.
    pub struct Mstatus: usize {
        /// Previous mode.
        const MPP_MASK = 3 << 11;
        const MPP_M = 3 << 11;
        const MPP_S = 1 << 11;
        /// Machine-mode interrupt enable.
        const MIE = 1 << 3;
    }
}

bitflags! {
    /// Supervisor Status Register, sstatus.
    pub struct Sstatus: usize {
        /// Previous mode, 1=Supervisor, 0=User.
        const SPP = 1 << 8;
        /// Supervisor Previous Interrupt Enable.
        const SPIE = 1 << 5;
        /// Supervisor Interrupt Enable.
        const SIE = 1 << 1;
    }
}

bitflags! {
    /// Supervisor Interrupt Enable, sie.
    pub struct Sie: usize {
        /// External.
        const SEIE = 1 << 9;
        /// Timer.
        const STIE = 1 << 5;
        /// Software.
        const SSIE = 1 << 1;
    }
}

bitflags! {
    /// Machine-mode Interrupt Enable, mie.
    pub struct Mie: usize {
        /// Timer.
        const MTIE = 1 << 7;
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        use core::arch::asm;

        impl Mstatus {
            #[inline]
            pub fn read() -> Self {
                let x;
                unsafe { asm!("csrr {}, mstatus", out(reg) x) };
                Self::from_bits_truncate(x)
            }

            #[inline]
            pub unsafe fn write(self) {
                unsafe { asm!("csrw mstatus, {}", in(reg) self.bits()) };
            }
        }

        impl Sstatus {
            #[inline]
            pub fn read() -> Self {
                let x;
                unsafe { asm!("csrr {}, sstatus", out(reg) x) };
                Self::from_bits_truncate(x)
            }

            #[inline]
            pub unsafe fn write(self) {
                unsafe { asm!("csrw sstatus, {}", in(reg) self.bits()) };
            }
        }

        impl Sie {
            #[inline]
            pub fn read() -> Self {
                let x;
                unsafe { asm!("csrr {}, sie", out(reg) x) };
                Self::from_bits_truncate(x)
            }

            #[inline]
            pub unsafe fn write(self) {
                unsafe { asm!("csrw sie, {}", in(reg) self.bits()) };
            }
        }

        impl Mie {
            #[inline]
            pub fn read() -> Self {
                let x;
                unsafe { asm!("csrr {}, mie", out(reg) x) };
                Self::from_bits_truncate(x)
            }

            #[inline]
            pub unsafe fn write(self) {
                unsafe { asm!("csrw mie, {}", in(reg) self.bits()) };
            }
        }

        /// Which hart (core) is this?
        #[inline]
        pub fn r_mhartid() -> usize {
            let x;
            unsafe { asm!("csrr {}, mhartid", out(reg) x) };
            x
        }

        /// Machine exception program counter; holds the instruction address
        /// to which mret will go.
        #[inline]
        pub unsafe fn w_mepc(x: usize) {
            unsafe { asm!("csrw mepc, {}", in(reg) x) };
        }

        #[inline]
        pub unsafe fn w_medeleg(x: usize) {
            unsafe { asm!("csrw medeleg, {}", in(reg) x) };
        }

        #[inline]
        pub unsafe fn w_mideleg(x: usize) {
            unsafe { asm!("csrw mideleg, {}", in(reg) x) };
        }

        #[inline]
        pub unsafe fn w_mscratch(x: usize) {
            unsafe { asm!("csrw mscratch, {}", in(reg) x) };
        }

        /// Machine-mode interrupt vector.
        #[inline]
        pub unsafe fn w_mtvec(x: usize) {
            unsafe { asm!("csrw mtvec, {}", in(reg) x) };
        }

        /// Supervisor trap vector base address.
        #[inline]
        pub unsafe fn w_stvec(x: usize) {
            unsafe { asm!("csrw stvec, {}", in(reg) x) };
        }

        /// Supervisor exception program counter.
        #[inline]
        pub unsafe fn w_sepc(x: usize) {
            unsafe { asm!("csrw sepc, {}", in(reg) x) };
        }

        #[inline]
        pub fn r_sepc() -> usize {
            let x;
            unsafe { asm!("csrr {}, sepc", out(reg) x) };
            x
        }

        /// Supervisor trap cause.
        #[inline]
        pub fn r_scause() -> usize {
            let x;
            unsafe { asm!("csrr {}, scause", out(reg) x) };
            x
        }

        /// Supervisor trap value (e.g. the faulting address).
        #[inline]
        pub fn r_stval() -> usize {
            let x;
            unsafe { asm!("csrr {}, stval", out(reg) x) };
            x
        }

        /// Supervisor interrupt pending.
        #[inline]
        pub fn r_sip() -> usize {
            let x;
            unsafe { asm!("csrr {}, sip", out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_sip(x: usize) {
            unsafe { asm!("csrw sip, {}", in(reg) x) };
        }

        /// Supervisor address translation and protection; holds the address
        /// of the page table.
        #[inline]
        pub unsafe fn w_satp(x: usize) {
            unsafe { asm!("csrw satp, {}", in(reg) x) };
        }

        #[inline]
        pub fn r_satp() -> usize {
            let x;
            unsafe { asm!("csrr {}, satp", out(reg) x) };
            x
        }

        /// Read the thread pointer, which holds this hart's id.
        #[inline]
        pub fn r_tp() -> usize {
            let x;
            unsafe { asm!("mv {}, tp", out(reg) x) };
            x
        }

        #[inline]
        pub unsafe fn w_tp(x: usize) {
            unsafe { asm!("mv tp, {}", in(reg) x) };
        }

        /// Enable device interrupts.
        #[inline]
        pub unsafe fn intr_on() {
            let mut x = Sstatus::read();
            x.insert(Sstatus::SIE);
            unsafe { x.write() };
        }

        /// Disable device interrupts.
        #[inline]
        pub fn intr_off() {
            let mut x = Sstatus::read();
            x.remove(Sstatus::SIE);
            unsafe { x.write() };
        }

        /// Are device interrupts enabled?
        #[inline]
        pub fn intr_get() -> bool {
            Sstatus::read().contains(Sstatus::SIE)
        }

        /// Flush the TLB.
        #[inline]
        pub unsafe fn sfence_vma() {
            // The zero, zero means flush all TLB entries.
            unsafe { asm!("sfence.vma zero, zero") };
        }
    } else {
        // Host shims. The test target runs single-threaded with interrupts
        // conceptually off; every CSR reads as its boot value.

        macro_rules! host_csr {
            ($t:ty) => {
                impl $t {
                    #[inline]
                    pub fn read() -> Self {
                        Self::empty()
                    }

                    #[inline]
                    pub unsafe fn write(self) {}
                }
            };
        }

        host_csr!(Mstatus);
        host_csr!(Sstatus);
        host_csr!(Sie);
        host_csr!(Mie);

        pub fn r_mhartid() -> usize {
            0
        }

        pub unsafe fn w_mepc(_: usize) {}
        pub unsafe fn w_medeleg(_: usize) {}
        pub unsafe fn w_mideleg(_: usize) {}
        pub unsafe fn w_mscratch(_: usize) {}
        pub unsafe fn w_mtvec(_: usize) {}
        pub unsafe fn w_stvec(_: usize) {}
        pub unsafe fn w_sepc(_: usize) {}

        pub fn r_sepc() -> usize {
            0
        }

        pub fn r_scause() -> usize {
            0
        }

        pub fn r_stval() -> usize {
            0
        }

        pub fn r_sip() -> usize {
            0
        }

        pub unsafe fn w_sip(_: usize) {}
        pub unsafe fn w_satp(_: usize) {}

        pub fn r_satp() -> usize {
            0
        }

        pub fn r_tp() -> usize {
            0
        }

        pub unsafe fn w_tp(_: usize) {}

        pub unsafe fn intr_on() {}

        pub fn intr_off() {}

        pub fn intr_get() -> bool {
            false
        }

        pub unsafe fn sfence_vma() {}
    }
}
