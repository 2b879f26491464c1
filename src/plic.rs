//! The RISC-V Platform Level Interrupt Controller (PLIC).

use crate::memlayout::{plic_sclaim, plic_senable, plic_spriority, PLIC, UART0_IRQ, VIRTIO0_IRQ};
use crate::proc::cpuid;

/// Set the sources the kernel serves to nonzero priority (zero means
/// disabled).
pub unsafe fn init() {
    unsafe {
        core::ptr::write_volatile((PLIC + UART0_IRQ as usize * 4) as *mut u32, 1);
        core::ptr::write_volatile((PLIC + VIRTIO0_IRQ as usize * 4) as *mut u32, 1);
    }
}

/// Enable the uart and virtio IRQs for this hart's S-mode, with priority
/// threshold zero.
pub unsafe fn inithart() {
    let hart = cpuid();
    unsafe {
        core::ptr::write_volatile(
            plic_senable(hart) as *mut u32,
            (1 << UART0_IRQ) | (1 << VIRTIO0_IRQ),
        );
        core::ptr::write_volatile(plic_spriority(hart) as *mut u32, 0);
    }
}

/// Ask the PLIC what interrupt we should serve.
pub unsafe fn claim() -> u32 {
    let hart = cpuid();
    unsafe { core::ptr::read_volatile(plic_sclaim(hart) as *const u32) }
}

/// Tell the PLIC we've served this IRQ.
pub unsafe fn complete(irq: u32) {
    let hart = cpuid();
    unsafe { core::ptr::write_volatile(plic_sclaim(hart) as *mut u32, irq) }
}
