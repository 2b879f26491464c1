//! Machine-mode boot: prepare supervisor mode, program the CLINT timer,
//! and mret into main.

use core::ptr;

use crate::kernel::main;
use crate::memlayout::{clint_mtimecmp, CLINT_MTIME};
use crate::param::NCPU;
use crate::riscv::{
    r_mhartid, w_medeleg, w_mepc, w_mideleg, w_mscratch, w_mtvec, w_satp, w_tp, Mie, Mstatus, Sie,
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        extern "C" {
            // Machine-mode timer interrupt vector in kernelvec.S.
            fn timervec();
        }
    } else {
        unsafe extern "C" fn timervec() {}
    }
}

/// entry.S needs one stack per CPU.
#[repr(C, align(16))]
pub struct Stack([[u8; 4096]; NCPU]);

impl Stack {
    const fn new() -> Self {
        Self([[0; 4096]; NCPU])
    }
}

#[no_mangle]
pub static mut stack0: Stack = Stack::new();

/// A scratch area per CPU for machine-mode timer interrupts.
static mut TIMER_SCRATCH: [[usize; 5]; NCPU] = [[0; 5]; NCPU];

/// entry.S jumps here in machine mode on stack0.
#[no_mangle]
pub unsafe extern "C" fn start() -> ! {
    // Set M Previous Privilege mode to Supervisor, for mret.
    let mut x = Mstatus::read();
    x.remove(Mstatus::MPP_MASK);
    x.insert(Mstatus::MPP_S);
    unsafe { x.write() };

    // Set M Exception Program Counter to main, for mret.
    unsafe { w_mepc(main as usize) };

    // Disable paging for now.
    unsafe { w_satp(0) };

    // Delegate all interrupts and exceptions to supervisor mode.
    unsafe { w_medeleg(0xffff) };
    unsafe { w_mideleg(0xffff) };
    let mut x = Sie::read();
    x.insert(Sie::SEIE);
    x.insert(Sie::STIE);
    x.insert(Sie::SSIE);
    unsafe { x.write() };

    // Ask for clock interrupts.
    unsafe { timerinit() };

    // Keep each CPU's hartid in its tp register, for cpuid().
    unsafe { w_tp(r_mhartid()) };

    // Switch to supervisor mode and jump to main().
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("mret", options(noreturn))
    };

    #[cfg(not(target_arch = "riscv64"))]
    unreachable!("machine-mode boot on the host")
}

/// Set up to receive timer interrupts in machine mode, which arrive at
/// timervec in kernelvec.S, which turns them into software interrupts for
/// devintr() in trap.rs.
unsafe fn timerinit() {
    // Each CPU has a separate source of timer interrupts.
    let id = r_mhartid();

    // Ask the CLINT for a timer interrupt.
    let interval: usize = 1_000_000; // cycles; about 1/10th second in qemu.
    unsafe {
        *(clint_mtimecmp(id) as *mut usize) = *(CLINT_MTIME as *const usize) + interval;
    }

    // Prepare information in scratch[] for timervec.
    // scratch[0..2] : space for timervec to save registers.
    // scratch[3] : address of the CLINT MTIMECMP register.
    // scratch[4] : desired interval (in cycles) between timer interrupts.
    let scratch = unsafe { &mut *ptr::addr_of_mut!(TIMER_SCRATCH[id]) };
    scratch[3] = clint_mtimecmp(id);
    scratch[4] = interval;
    unsafe { w_mscratch(scratch.as_ptr() as usize) };

    // Set the machine-mode trap handler.
    unsafe { w_mtvec(timervec as usize) };

    // Enable machine-mode interrupts.
    let mut x = Mstatus::read();
    x.insert(Mstatus::MIE);
    unsafe { x.write() };

    // Enable machine-mode timer interrupts.
    let mut y = Mie::read();
    y.insert(Mie::MTIE);
    unsafe { y.write() };
}
