//! Trap handling: system calls, device interrupts, the clock, alarm
//! delivery, the copy-on-write fault path and the per-discipline
//! preemption decision.

use crate::{
    console,
    kernel::kernel,
    memlayout::{trampoline_base, TRAMPOLINE, TRAPFRAME, UART0_IRQ, VIRTIO0_IRQ},
    plic, println,
    proc::{cpuid, myproc, proc_yield, Procstate},
    riscv::{
        intr_get, intr_off, intr_on, r_satp, r_scause, r_sepc, r_sip, r_stval, r_tp, w_sepc,
        w_sip, w_stvec, Sstatus, PGSIZE,
    },
    sched::{Preempt, Scheduler},
    syscall::syscall,
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        extern "C" {
            // In kernelvec.S, calls kerneltrap().
            fn kernelvec();

            // trampoline.S
            static mut uservec: [u8; 0];
            static mut userret: [u8; 0];

            // The virtio disk driver.
            fn virtio_disk_intr();
        }

        fn uservec_addr() -> usize {
            unsafe { uservec.as_ptr() as usize }
        }

        fn userret_addr() -> usize {
            unsafe { userret.as_ptr() as usize }
        }
    } else {
        unsafe extern "C" fn kernelvec() {}
        unsafe extern "C" fn virtio_disk_intr() {}

        fn uservec_addr() -> usize {
            trampoline_base()
        }

        fn userret_addr() -> usize {
            trampoline_base()
        }
    }
}

/// Set up to take exceptions and traps while in the kernel.
pub unsafe fn trapinithart() {
    unsafe { w_stvec(kernelvec as usize) };
}

/// Handle an interrupt, exception, or system call from user space.
/// Called from trampoline.S.
#[no_mangle]
pub unsafe extern "C" fn usertrap() -> ! {
    assert!(
        !Sstatus::read().contains(Sstatus::SPP),
        "usertrap: not from user mode"
    );

    // Send interrupts and exceptions to kerneltrap(), since we're now in
    // the kernel.
    unsafe { w_stvec(kernelvec as usize) };

    let mut p = kernel().current_proc();

    // Save user program counter.
    p.deref_mut_data().trap_frame_mut().epc = r_sepc();

    let scause = r_scause();
    let mut which_dev = 0;

    if scause == 8 {
        // system call

        if p.killed() {
            kernel().procs.exit_current(-1);
        }

        // sepc points to the ecall instruction, but we want to return to
        // the next instruction.
        p.deref_mut_data().trap_frame_mut().epc += 4;

        // An interrupt will change sepc, scause, and sstatus, so enable
        // only now that we're done with those registers.
        unsafe { intr_on() };

        syscall(&mut p);
    } else {
        which_dev = unsafe { devintr() };
        if which_dev == 2 {
            // A user-mode tick also drives the alarm clock.
            let data = p.deref_mut_data();
            if data.alarm.tick() {
                let handler = data.alarm.handler();
                data.save_trap_frame();
                data.trap_frame_mut().epc = handler;
            }
        } else if which_dev == 0 {
            if scause == 0xf {
                // Store fault: satisfiable if it hit a copy-on-write page.
                if p.deref_mut_data().memory.cow_fault(r_stval()).is_err() {
                    p.kill();
                }
            } else {
                println!(
                    "usertrap(): unexpected scause {:#x} pid={}",
                    scause,
                    p.pid()
                );
                println!("            sepc={:#x} stval={:#x}", r_sepc(), r_stval());
                p.kill();
            }
        }
    }

    if p.killed() {
        kernel().procs.exit_current(-1);
    }

    // Give up the CPU if the discipline says a timer tick unseats us.
    if which_dev == 2 {
        // SAFETY: p is the current process.
        if kernel().sched.on_tick(unsafe { &*p.raw() }) == Preempt::Yield {
            proc_yield();
        }
    }

    unsafe { usertrapret() }
}

/// Return to user space.
pub unsafe fn usertrapret() -> ! {
    let mut p = kernel().current_proc();

    // We're about to switch the destination of traps from kerneltrap() to
    // usertrap(), so turn off interrupts until we're back in user space,
    // where usertrap() is correct.
    intr_off();

    // Send syscalls, interrupts, and exceptions to uservec in
    // trampoline.S.
    unsafe { w_stvec(TRAMPOLINE + (uservec_addr() - trampoline_base())) };

    // Set up trapframe values that uservec will need when the process next
    // traps into the kernel.
    let kstack = p.deref_data().kstack;
    let satp = p.deref_data().memory.satp();
    let tf = p.deref_mut_data().trap_frame_mut();
    tf.kernel_satp = r_satp(); // kernel page table
    tf.kernel_sp = kstack + PGSIZE; // process's kernel stack
    tf.kernel_trap = usertrap as usize;
    tf.kernel_hartid = r_tp(); // hartid for cpuid()

    // Set up the registers that trampoline.S's sret will use to get to
    // user space.

    // Set S Previous Privilege mode to User and enable interrupts in user
    // mode.
    let mut x = Sstatus::read();
    x.remove(Sstatus::SPP);
    x.insert(Sstatus::SPIE);
    unsafe { x.write() };

    // Set S Exception Program Counter to the saved user pc.
    unsafe { w_sepc(tf.epc) };

    // Jump to userret in trampoline.S at the top of memory, which switches
    // to the user page table, restores user registers, and switches to
    // user mode with sret.
    let trampoline_userret = TRAMPOLINE + (userret_addr() - trampoline_base());
    // SAFETY: trampoline_userret points at userret, whose ABI is
    // (TRAPFRAME, satp) and which never returns.
    let userret: unsafe extern "C" fn(usize, usize) -> ! =
        unsafe { core::mem::transmute(trampoline_userret) };
    unsafe { userret(TRAPFRAME, satp) }
}

/// Interrupts and exceptions from kernel code go here via kernelvec, on
/// whatever the current kernel stack is.
#[no_mangle]
pub unsafe extern "C" fn kerneltrap() {
    let sepc = r_sepc();
    let sstatus = Sstatus::read();

    assert!(
        sstatus.contains(Sstatus::SPP),
        "kerneltrap: not from supervisor mode"
    );
    assert!(!intr_get(), "kerneltrap: interrupts enabled");

    let which_dev = unsafe { devintr() };
    if which_dev == 0 {
        println!("scause {:#x}", r_scause());
        println!("sepc={:#x} stval={:#x}", r_sepc(), r_stval());
        panic!("kerneltrap");
    }

    // Give up the CPU if this is a timer interrupt and the discipline
    // preempts.
    if which_dev == 2 {
        let p = myproc();
        if !p.is_null() {
            // SAFETY: an unlocked peek; we only yield if we really are the
            // process running on this CPU.
            let state = unsafe { (*(*p).info_raw()).state };
            if state == Procstate::RUNNING
                && kernel().sched.on_tick(unsafe { &*p }) == Preempt::Yield
            {
                proc_yield();
            }
        }
    }

    // The yield may have caused some traps to occur, so restore trap
    // registers for use by kernelvec.S's sepc instruction.
    unsafe {
        w_sepc(sepc);
        sstatus.write();
    }
}

/// Advance the tick counter, charge the tick to every process, and wake
/// sleepers on the tick channel.
fn clockintr() {
    let mut ticks = kernel().ticks.lock();
    *ticks = ticks.wrapping_add(1);
    kernel().procs.update_time();
    ticks.wakeup();
}

/// Check if it's an external interrupt or software interrupt and handle
/// it. Returns 2 if timer interrupt, 1 if other device, 0 if not
/// recognized.
unsafe fn devintr() -> i32 {
    let scause = r_scause();

    if scause & 0x8000_0000_0000_0000 != 0 && scause & 0xff == 9 {
        // This is a supervisor external interrupt, via PLIC.

        // irq indicates which device interrupted.
        let irq = unsafe { plic::claim() };

        if irq == UART0_IRQ {
            console::intr();
        } else if irq == VIRTIO0_IRQ {
            // SAFETY: the disk driver owns this interrupt.
            unsafe { virtio_disk_intr() };
        } else if irq != 0 {
            println!("unexpected interrupt irq={}", irq);
        }

        // The PLIC allows each device to raise at most one interrupt at a
        // time; tell the PLIC the device is now allowed to interrupt
        // again.
        if irq != 0 {
            unsafe { plic::complete(irq) };
        }

        1
    } else if scause == 0x8000_0000_0000_0001 {
        // Software interrupt from a machine-mode timer interrupt,
        // forwarded by timervec in kernelvec.S.

        if cpuid() == 0 {
            clockintr();
        }

        // Acknowledge the software interrupt by clearing the SSIP bit in
        // sip.
        unsafe { w_sip(r_sip() & !2) };

        2
    } else {
        0
    }
}
