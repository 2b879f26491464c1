//! A Unix-like teaching kernel for RISC-V with a build-time-pluggable
//! process scheduler.
//!
//! The crate owns the process table, the five scheduling disciplines
//! (round-robin, FCFS, lottery, priority, MLFQ), the context-switch
//! protocol, wait/exit/reparent semantics, user-level alarm delivery and
//! the copy-on-write fault path. The file system proper and most device
//! service live behind the boundaries declared in `fs` and `trap`.
//!
//! Unit tests build for the host: everything that touches privileged
//! registers or MMIO resolves to inert shims off-`riscv64` (see `riscv`),
//! so the pure logic is testable without a cross toolchain.

#![cfg_attr(not(test), no_std)]
//
// # Tries to deny lints that bit us before.
#![deny(anonymous_parameters)]
#![deny(deprecated_in_future)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(non_ascii_idents)]
#![deny(rust_2018_idioms)]
#![deny(trivial_numeric_casts)]
#![deny(unsafe_op_in_unsafe_fn)]
#![deny(unused_extern_crates)]
#![deny(unused_import_braces)]
#![allow(dead_code)]

mod console;
mod fs;
mod kalloc;
mod kernel;
mod memlayout;
mod page;
mod param;
mod plic;
mod proc;
mod riscv;
mod sched;
mod sleepablelock;
mod spinlock;
mod start;
mod syscall;
mod sysproc;
mod trap;
mod vm;

// Assembly entry points: boot, context switch, trap vectors, trampoline.
#[cfg(target_arch = "riscv64")]
mod arch_asm {
    core::arch::global_asm!(include_str!("asm/entry.S"));
    core::arch::global_asm!(include_str!("asm/swtch.S"));
    core::arch::global_asm!(include_str!("asm/kernelvec.S"));
    core::arch::global_asm!(include_str!("asm/trampoline.S"));
}
