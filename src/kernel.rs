//! The kernel singleton: every shared subsystem hangs off one static
//! `Kernel`, immutably shared between harts after boot.

use core::cell::UnsafeCell;
use core::fmt;
use core::hint::spin_loop;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicBool, Ordering};

use array_macro::array;

use crate::{
    console::{Printer, Uart},
    kalloc::Kmem,
    page::Page,
    param::NCPU,
    plic,
    proc::{cpuid, procinit, scheduler, Cpu, ProcessSystem},
    sched::Active,
    sleepablelock::Sleepablelock,
    spinlock::Spinlock,
    trap::trapinithart,
    vm::KernelMemory,
};

/// The kernel.
static mut KERNEL: Kernel = Kernel::zero();

/// The kernel is initialized single-threaded by hart 0 in `main` before
/// the other harts start scheduling; afterwards shared access is safe.
#[inline]
pub fn kernel() -> &'static Kernel {
    unsafe { &*ptr::addr_of!(KERNEL) }
}

pub struct Kernel {
    panicked: AtomicBool,

    /// Console output.
    pub printer: Spinlock<Printer>,

    /// Physical page allocator.
    pub kmem: Spinlock<Kmem>,

    /// The kernel page table; written once during boot.
    memory: MaybeUninit<KernelMemory>,

    /// Ticks since boot, with a wait channel for sleep(n).
    pub ticks: Sleepablelock<u32>,

    /// The process system.
    pub procs: ProcessSystem,

    /// The compiled-in scheduling discipline.
    pub sched: Active,

    /// Per-hart state. A hart mutates only its own entry, with interrupts
    /// disabled.
    cpus: [UnsafeCell<Cpu>; NCPU],
}

impl Kernel {
    const fn zero() -> Self {
        Self {
            panicked: AtomicBool::new(false),
            printer: Spinlock::new("PRINTLN", Printer::new()),
            kmem: Spinlock::new("KMEM", Kmem::new()),
            memory: MaybeUninit::uninit(),
            ticks: Sleepablelock::new("time", 0),
            procs: ProcessSystem::zero(),
            sched: Active::new(),
            cpus: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
        }
    }

    fn panic(&self) {
        self.panicked.store(true, Ordering::Release);
    }

    pub fn is_panicked(&self) -> bool {
        self.panicked.load(Ordering::Acquire)
    }

    /// Return this CPU's cpu struct.
    ///
    /// It is safe to call this with interrupts enabled, but the returned
    /// address may stop being the current CPU's as soon as they are: hold
    /// them off to actually use the result.
    #[cfg(not(test))]
    pub fn mycpu(&self) -> *mut Cpu {
        self.cpus[cpuid()].get()
    }

    /// Under the test harness every test thread acts as its own hart, so
    /// the interrupt-nesting bookkeeping of concurrently running tests
    /// cannot collide.
    #[cfg(test)]
    pub fn mycpu(&self) -> *mut Cpu {
        std::thread_local! {
            static CPU: UnsafeCell<Cpu> = const { UnsafeCell::new(Cpu::new()) };
        }
        CPU.with(|c| c.get())
    }

    /// The tick counter without its lock; readers tolerate a torn value.
    pub fn ticks_value(&self) -> u32 {
        // SAFETY: u32 reads are single loads on every supported target.
        unsafe { *self.ticks.get_mut_raw() }
    }

    pub fn alloc(&self) -> Option<Page> {
        self.kmem.lock().alloc()
    }

    pub fn free(&self, page: Page) {
        self.kmem.lock().free(page)
    }

    pub fn share(&self, pa: usize) {
        self.kmem.lock().share(pa)
    }

    /// Prints the given formatted string with the Printer.
    pub fn printer_write_fmt(&self, args: fmt::Arguments<'_>) -> fmt::Result {
        use core::fmt::Write;
        if self.is_panicked() {
            // SAFETY: the machine is going down; losing a race on the
            // printer is acceptable.
            unsafe { (*self.printer.get_mut_raw()).write_fmt(args) }
        } else {
            let mut printer = self.printer.lock();
            printer.write_fmt(args)
        }
    }
}

/// print! macro prints to the console using the kernel printer.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::kernel::kernel().printer_write_fmt(format_args!($($arg)*)).unwrap();
    };
}

/// println! macro prints to the console using the kernel printer.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Handles panic.
#[cfg(not(test))]
#[panic_handler]
fn panic_handler(info: &core::panic::PanicInfo<'_>) -> ! {
    // Freeze other CPUs.
    kernel().panic();
    println!("{}", info);

    loop {
        spin_loop();
    }
}

/// start() jumps here in supervisor mode on all CPUs.
pub unsafe fn main() -> ! {
    static STARTED: AtomicBool = AtomicBool::new(false);

    if cpuid() == 0 {
        // SAFETY: hart 0 runs this once, before any shared access.
        let kernel = unsafe { &mut *ptr::addr_of_mut!(KERNEL) };

        // Console.
        Uart::init();

        println!();
        println!("kernel is booting");
        println!();

        // Physical page allocator.
        unsafe { kernel.kmem.get_mut().init() };

        // The kernel page table; then turn on paging.
        let memory = KernelMemory::new().expect("KernelMemory::new");
        unsafe { kernel.memory.write(memory).init_hart() };

        // The process table.
        unsafe { procinit(&mut kernel.procs) };

        // Install the kernel trap vector.
        unsafe { trapinithart() };

        // Set up the interrupt controller.
        unsafe { plic::init() };
        unsafe { plic::inithart() };

        // First user process.
        unsafe { kernel.procs.user_proc_init() };

        STARTED.store(true, Ordering::Release);
    } else {
        while !STARTED.load(Ordering::Acquire) {
            spin_loop();
        }

        println!("hart {} starting", cpuid());

        // Turn on paging.
        // SAFETY: hart 0 wrote the kernel memory before STARTED.
        unsafe { kernel().memory.assume_init_ref().init_hart() };

        // Install the kernel trap vector.
        unsafe { trapinithart() };

        // Ask the PLIC for device interrupts.
        unsafe { plic::inithart() };
    }

    unsafe { scheduler() }
}
