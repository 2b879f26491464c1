//! Processes: the slot table, the state machine, context switching,
//! sleep/wakeup, fork/exit/wait and the per-CPU scheduler entry.

use core::cell::UnsafeCell;
use core::mem::{self, MaybeUninit};
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::str;
use core::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use array_macro::array;
use itertools::izip;
use scopeguard::ScopeGuard;
use spin::Once;

use crate::{
    fs::{RcFile, RcInode},
    kernel::kernel,
    memlayout::kstack,
    page::Page,
    param::{MAXPROCNAME, NOFILE, NPROC, ROOTDEV},
    println,
    riscv::{intr_get, intr_on, r_tp, PGSIZE},
    sched::{SchedState, Scheduler},
    spinlock::{pop_off, push_off, RawSpinlock, Spinlock, SpinlockProtected, SpinlockProtectedGuard},
    trap::usertrapret,
    vm::{UserMemory, UVAddr},
};

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        extern "C" {
            // swtch.S
            pub(crate) fn swtch(old: *mut Context, new: *mut Context);
        }
    } else {
        pub(crate) unsafe extern "C" fn swtch(_old: *mut Context, _new: *mut Context) {
            panic!("swtch on the host");
        }
    }
}

/// Saved registers for kernel context switches.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    /// Callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }
}

/// Per-CPU state.
pub struct Cpu {
    /// The process running on this cpu, or null.
    pub proc: *mut Proc,

    /// swtch() here to enter scheduler().
    pub context: Context,

    /// Depth of push_off() nesting.
    pub noff: i32,

    /// Were interrupts enabled before push_off()?
    pub interrupt_enabled: bool,
}

impl Cpu {
    pub const fn new() -> Self {
        Self {
            proc: ptr::null_mut(),
            context: Context::new(),
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

/// Per-process data for the trap handling code in trampoline.S.
/// Sits in a page by itself just under the trampoline page in the
/// user page table. Not specially mapped in the kernel page table.
/// uservec in trampoline.S saves user registers in the trapframe,
/// then initializes registers from the trapframe's
/// kernel_sp, kernel_hartid, kernel_satp, and jumps to usertrap.
/// usertrapret() and userret in trampoline.S set up
/// the trapframe's kernel_*, restore user registers from the
/// trapframe, switch to the user page table, and enter user space.
/// The trapframe includes callee-saved user registers like s0-s11 because
/// the return-to-user path via usertrapret() doesn't return through
/// the entire kernel call stack.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct TrapFrame {
    /// 0 - kernel page table (satp)
    pub kernel_satp: usize,
    /// 8 - top of process's kernel stack
    pub kernel_sp: usize,
    /// 16 - usertrap()
    pub kernel_trap: usize,
    /// 24 - saved user program counter
    pub epc: usize,
    /// 32 - saved kernel tp
    pub kernel_hartid: usize,
    /// 40
    pub ra: usize,
    /// 48
    pub sp: usize,
    /// 56
    pub gp: usize,
    /// 64
    pub tp: usize,
    /// 72
    pub t0: usize,
    /// 80
    pub t1: usize,
    /// 88
    pub t2: usize,
    /// 96
    pub s0: usize,
    /// 104
    pub s1: usize,
    /// 112
    pub a0: usize,
    /// 120
    pub a1: usize,
    /// 128
    pub a2: usize,
    /// 136
    pub a3: usize,
    /// 144
    pub a4: usize,
    /// 152
    pub a5: usize,
    /// 160
    pub a6: usize,
    /// 168
    pub a7: usize,
    /// 176
    pub s2: usize,
    /// 184
    pub s3: usize,
    /// 192
    pub s4: usize,
    /// 200
    pub s5: usize,
    /// 208
    pub s6: usize,
    /// 216
    pub s7: usize,
    /// 224
    pub s8: usize,
    /// 232
    pub s9: usize,
    /// 240
    pub s10: usize,
    /// 248
    pub s11: usize,
    /// 256
    pub t3: usize,
    /// 264
    pub t4: usize,
    /// 272
    pub t5: usize,
    /// 280
    pub t6: usize,
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Procstate {
    UNUSED,
    USED,
    SLEEPING,
    RUNNABLE,
    RUNNING,
    ZOMBIE,
}

impl Procstate {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Procstate::UNUSED => "unused",
            Procstate::USED => "used",
            Procstate::SLEEPING => "sleep ",
            Procstate::RUNNABLE => "runble",
            Procstate::RUNNING => "run   ",
            Procstate::ZOMBIE => "zombie",
        }
    }
}

/// Represents lock guards that can be slept in a `WaitChannel`.
pub trait Waitable {
    /// Releases the inner `RawSpinlock`.
    ///
    /// # Safety
    ///
    /// `raw_release()` and `raw_acquire` must always be used as a pair.
    /// Use these only for temporarily releasing (and then acquiring) the
    /// lock. Also, do not access `self` until re-acquiring the lock with
    /// `raw_acquire()`.
    unsafe fn raw_release(&mut self);

    /// Acquires the inner `RawSpinlock`.
    ///
    /// # Safety
    ///
    /// `raw_release()` and `raw_acquire` must always be used as a pair.
    unsafe fn raw_acquire(&mut self);
}

pub struct WaitChannel {
    /// Required to make this type non-zero-sized. If it were zero-sized,
    /// multiple wait channels may have the same address, spuriously waking
    /// up more threads.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    /// Atomically release the lock and sleep on this channel.
    /// Reacquires the lock when awakened.
    pub fn sleep<T: Waitable>(&self, lk: &mut T) {
        let p = myproc();
        assert!(!p.is_null(), "sleep: no process");
        // SAFETY: p is the current CPU's process.
        let p = unsafe { &*p };

        // Must acquire p->lock in order to change p->state and then call
        // sched. Once we hold p->lock, we can be guaranteed that we won't
        // miss any wakeup (wakeup locks p->lock), so it's okay to release
        // lk.
        let mut guard = p.lock();
        unsafe {
            // Temporarily release the inner `RawSpinlock`. This is safe,
            // since we don't access `lk` until re-acquiring the lock at
            // `lk.raw_acquire()`.
            lk.raw_release();
        }

        // Go to sleep.
        guard.deref_mut_info().waitchannel = self;
        guard.deref_mut_info().state = Procstate::SLEEPING;
        unsafe {
            // Safe since we hold `p.lock()`, changed the process's state,
            // and device interrupts are disabled by `push_off()` in
            // `p.lock()`.
            guard.sched();
        }

        // Tidy up.
        guard.deref_mut_info().waitchannel = ptr::null();

        // Reacquire original lock.
        drop(guard);
        unsafe {
            // Safe since this is paired with a previous `lk.raw_release()`.
            lk.raw_acquire();
        }
    }

    /// Wake up all processes sleeping on this channel.
    /// Must be called without any p->lock.
    pub fn wakeup(&self) {
        kernel().procs.wakeup_pool(self)
    }
}

/// User-level alarm bookkeeping. The delivery mechanics (trapframe
/// snapshot and pc redirection) belong to the trap path; this type only
/// decides when a handler fires.
pub struct Alarm {
    /// Alarm period in ticks; 0 means disarmed.
    interval: u32,

    /// User-space handler address.
    handler: usize,

    /// Ticks observed since the last delivery.
    elapsed: u32,

    /// True while the handler runs; suppresses nested deliveries.
    handling: bool,
}

impl Alarm {
    pub const fn new() -> Self {
        Self {
            interval: 0,
            handler: 0,
            elapsed: 0,
            handling: false,
        }
    }

    pub fn arm(&mut self, interval: u32, handler: usize) {
        self.interval = interval;
        self.handler = handler;
    }

    pub fn handler(&self) -> usize {
        self.handler
    }

    /// Account one user-mode timer tick. Returns true when the handler
    /// must be delivered now. Ticks inside the handler are not counted, so
    /// a delivery can come no sooner than one full period after the
    /// previous `finish`.
    pub fn tick(&mut self) -> bool {
        if self.interval == 0 || self.handling {
            return false;
        }
        self.elapsed += 1;
        if self.elapsed >= self.interval {
            self.handling = true;
            self.elapsed = 0;
            return true;
        }
        false
    }

    /// The handler returned via sigreturn.
    pub fn finish(&mut self) {
        self.handling = false;
    }
}

/// Proc::info's spinlock must be held when using these.
pub struct ProcInfo {
    /// Process state.
    pub state: Procstate,

    /// If non-null, sleeping on this channel.
    pub waitchannel: *const WaitChannel,

    /// WaitChannel saying a child proc is dead.
    pub child_waitchannel: WaitChannel,

    /// Exit status to be returned to parent's wait.
    pub xstate: i32,

    /// Process ID.
    pub pid: i32,

    /// Tick of creation.
    pub ctime: u32,

    /// Ticks spent RUNNING.
    pub rtime: u32,

    /// Ticks spent SLEEPING.
    pub stime: u32,

    /// Tick of exit.
    pub endtime: u32,

    /// Times this process has been selected to run.
    pub sched_count: u32,

    /// State of the compiled-in scheduling discipline.
    pub sched: SchedState,
}

/// Proc::data are private to the process, so the lock need not be held.
pub struct ProcData {
    /// Virtual address of kernel stack.
    pub kstack: usize,

    /// Data page for trampoline.S.
    trap_frame: *mut TrapFrame,

    /// Snapshot page for alarm delivery; sigreturn restores from here.
    backup_frame: *mut TrapFrame,

    /// User memory manager.
    pub memory: UserMemory,

    /// swtch() here to run the process.
    context: Context,

    /// Open files.
    pub open_files: [Option<RcFile>; NOFILE],

    /// Current directory.
    pub cwd: Option<RcInode>,

    /// Bitmask of traced system calls.
    pub trace_mask: u32,

    /// User-level alarm state.
    pub alarm: Alarm,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: 0,
            trap_frame: ptr::null_mut(),
            backup_frame: ptr::null_mut(),
            memory: UserMemory::uninit(),
            context: Context::new(),
            open_files: array![_ => None; NOFILE],
            cwd: None,
            trace_mask: 0,
            alarm: Alarm::new(),
        }
    }

    pub fn trap_frame(&self) -> &TrapFrame {
        // SAFETY: non-null while the process is not UNUSED.
        unsafe { &*self.trap_frame }
    }

    pub fn trap_frame_mut(&mut self) -> &mut TrapFrame {
        // SAFETY: non-null while the process is not UNUSED.
        unsafe { &mut *self.trap_frame }
    }

    /// Snapshot the trapframe before redirecting the pc into an alarm
    /// handler.
    pub fn save_trap_frame(&mut self) {
        // SAFETY: both pages are owned by this process slot.
        unsafe { *self.backup_frame = *self.trap_frame };
    }

    /// Restore the trapframe snapshot verbatim; returns the restored a0.
    pub fn restore_trap_frame(&mut self) -> usize {
        // SAFETY: both pages are owned by this process slot.
        unsafe { *self.trap_frame = *self.backup_frame };
        self.trap_frame().a0
    }
}

/// Per-process state.
pub struct Proc {
    /// Parent process. A back-reference only; hangs off the process
    /// system's wait_lock.
    parent: MaybeUninit<SpinlockProtected<*mut Proc>>,

    info: Spinlock<ProcInfo>,

    pub data: UnsafeCell<ProcData>,

    /// If true, the process has been killed.
    killed: AtomicBool,

    /// Process name (debugging).
    pub name: [u8; MAXPROCNAME],
}

impl Proc {
    const fn zero() -> Self {
        Self {
            parent: MaybeUninit::uninit(),
            info: Spinlock::new(
                "proc",
                ProcInfo {
                    state: Procstate::UNUSED,
                    waitchannel: ptr::null(),
                    child_waitchannel: WaitChannel::new(),
                    xstate: 0,
                    pid: 0,
                    ctime: 0,
                    rtime: 0,
                    stime: 0,
                    endtime: 0,
                    sched_count: 0,
                    sched: SchedState::new(),
                },
            ),
            data: UnsafeCell::new(ProcData::new()),
            killed: AtomicBool::new(false),
            name: [0; MAXPROCNAME],
        }
    }

    pub(crate) fn lock(&self) -> ProcGuard {
        mem::forget(self.info.lock());
        ProcGuard { ptr: self }
    }

    pub(crate) fn pid(&self) -> i32 {
        // SAFETY: pid is only written under the lock while the reader
        // merely identifies the slot; a torn read is tolerable.
        unsafe { self.info.get_mut_unchecked() }.pid
    }

    /// Kill and let the victim find out on its next user-space boundary.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    pub(crate) fn info_raw(&self) -> *mut ProcInfo {
        self.info.get_mut_raw()
    }
}

/// Assumption: `ptr` points into the process pool and ptr->info's spinlock
/// is held.
pub(crate) struct ProcGuard {
    ptr: *const Proc,
}

impl ProcGuard {
    pub(crate) fn deref_info(&self) -> &ProcInfo {
        // SAFETY: the lock is held.
        unsafe { (*self.ptr).info.get_mut_unchecked() }
    }

    pub(crate) fn deref_mut_info(&mut self) -> &mut ProcInfo {
        // SAFETY: the lock is held.
        unsafe { (*self.ptr).info.get_mut_unchecked() }
    }

    pub(crate) fn raw(&self) -> *const Proc {
        self.ptr
    }

    /// Switch to scheduler. Must hold only p->lock and have changed
    /// proc->state. Saves and restores interrupt_enabled because
    /// interrupt_enabled is a property of this kernel thread, not this CPU.
    /// It should be proc->interrupt_enabled and proc->noff, but that would
    /// break in the few places where a lock is held but there's no process.
    pub(crate) unsafe fn sched(&mut self) {
        let c = kernel().mycpu();
        unsafe {
            assert_eq!((*c).noff, 1, "sched locks");
            assert_ne!(self.deref_info().state, Procstate::RUNNING, "sched running");
            assert!(!intr_get(), "sched interruptible");

            let interrupt_enabled = (*c).interrupt_enabled;
            swtch(&mut (*self.data.get()).context, &mut (*c).context);

            // This thread may resume on another CPU.
            let c = kernel().mycpu();
            (*c).interrupt_enabled = interrupt_enabled;
        }
    }

    /// Hand the CPU to this process, which must be RUNNABLE. The process
    /// runs with its lock held and gives it back by re-entering `sched`.
    pub(crate) unsafe fn run(&mut self, c: *mut Cpu) {
        let info = self.deref_mut_info();
        info.sched_count += 1;

        // Switch to chosen process. It is the process's job to release its
        // lock and then reacquire it before jumping back to us.
        info.state = Procstate::RUNNING;
        unsafe {
            (*c).proc = self.ptr as *mut _;
            swtch(&mut (*c).context, &mut (*self.data.get()).context);

            // Process is done running for now. It should have changed its
            // p->state before coming back.
            (*c).proc = ptr::null_mut();
        }
    }

    /// Wake process from sleep().
    fn wakeup(&mut self) {
        if self.deref_info().state == Procstate::SLEEPING {
            self.deref_mut_info().state = Procstate::RUNNABLE;
        }
    }

    /// Free a proc structure and the data hanging from it, including user
    /// pages. If `parent_guard` is provided, also clear the parent field
    /// (accessing it without the wait lock is illegal).
    fn clear(&mut self, parent_guard: Option<&mut SpinlockProtectedGuard<'_>>) {
        // SAFETY: this process cannot be the current process any longer.
        let data = unsafe { &mut *self.data.get() };
        let trap_frame = mem::replace(&mut data.trap_frame, ptr::null_mut());
        if !trap_frame.is_null() {
            // SAFETY: the page was allocated for this slot.
            kernel().free(unsafe { Page::from_usize(trap_frame as usize) });
        }
        let backup_frame = mem::replace(&mut data.backup_frame, ptr::null_mut());
        if !backup_frame.is_null() {
            // SAFETY: the page was allocated for this slot.
            kernel().free(unsafe { Page::from_usize(backup_frame as usize) });
        }
        mem::replace(&mut data.memory, UserMemory::uninit()).free();
        data.trace_mask = 0;
        data.alarm = Alarm::new();

        if let Some(guard) = parent_guard {
            // SAFETY: parent was initialized in procinit.
            *unsafe { (*self.ptr).parent.assume_init_ref() }.get_mut(guard) = ptr::null_mut();
        }

        // SAFETY: name is only written by the process itself or its reaper.
        unsafe { (*(self.ptr as *mut Proc)).name[0] = 0 };
        // SAFETY: self.ptr is valid.
        unsafe { (*self.ptr).killed.store(false, Ordering::Release) };

        let info = self.deref_mut_info();
        info.waitchannel = ptr::null();
        info.pid = 0;
        info.xstate = 0;
        info.ctime = 0;
        info.rtime = 0;
        info.stime = 0;
        info.endtime = 0;
        info.sched_count = 0;
        info.sched = SchedState::new();
        info.state = Procstate::UNUSED;
    }
}

impl Deref for ProcGuard {
    type Target = Proc;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.ptr }
    }
}

impl DerefMut for ProcGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *(self.ptr as *mut _) }
    }
}

impl Drop for ProcGuard {
    fn drop(&mut self) {
        // SAFETY: the guard owns the acquisition made in Proc::lock.
        unsafe { (*self.ptr).info.unlock() };
    }
}

/// The process running on this CPU.
///
/// Assumption: `ptr` is the current CPU's proc, so `ProcData` can be
/// accessed without the lock.
pub struct CurrentProc {
    ptr: *mut Proc,
}

impl CurrentProc {
    pub fn raw(&self) -> *mut Proc {
        self.ptr
    }

    pub fn deref_data(&self) -> &ProcData {
        // SAFETY: data is private to the process and we are it.
        unsafe { &*(*self.ptr).data.get() }
    }

    pub fn deref_mut_data(&mut self) -> &mut ProcData {
        // SAFETY: data is private to the process and we are it.
        unsafe { &mut *(*self.ptr).data.get() }
    }

    pub fn pid(&self) -> i32 {
        // SAFETY: pid is not modified while the process runs.
        unsafe { &*self.ptr }.pid()
    }

    pub fn killed(&self) -> bool {
        // SAFETY: self.ptr is the current process.
        unsafe { &*self.ptr }.killed()
    }

    pub fn kill(&self) {
        // SAFETY: self.ptr is the current process.
        unsafe { &*self.ptr }.kill();
    }
}

/// A user program that calls exec("/init").
/// od -t xC initcode
const INITCODE: [u8; 52] = [
    0x17, 0x05, 0, 0, 0x13, 0x05, 0x45, 0x02, 0x97, 0x05, 0, 0, 0x93, 0x85, 0x35, 0x02, 0x93, 0x08,
    0x70, 0, 0x73, 0, 0, 0, 0x93, 0x08, 0x20, 0, 0x73, 0, 0, 0, 0xef, 0xf0, 0x9f, 0xff, 0x2f, 0x69,
    0x6e, 0x69, 0x74, 0, 0, 0x24, 0, 0, 0, 0, 0, 0, 0, 0,
];

/// Process system type containing & managing whole processes.
pub struct ProcessSystem {
    nextpid: AtomicI32,
    process_pool: [Proc; NPROC],
    initial_proc: *mut Proc,

    // Helps ensure that wakeups of wait()ing parents are not lost. Helps
    // obey the memory model when using p->parent. Must be acquired before
    // any p->lock.
    wait_lock: RawSpinlock,
}

impl ProcessSystem {
    pub const fn zero() -> Self {
        Self {
            nextpid: AtomicI32::new(1),
            process_pool: array![_ => Proc::zero(); NPROC],
            initial_proc: ptr::null_mut(),
            wait_lock: RawSpinlock::new("wait_lock"),
        }
    }

    pub(crate) fn pool(&self) -> &[Proc; NPROC] {
        &self.process_pool
    }

    fn allocpid(&self) -> i32 {
        self.nextpid.fetch_add(1, Ordering::Relaxed)
    }

    /// Look in the process pool for an UNUSED slot. If found, initialize
    /// the state required to run in the kernel and return with the slot's
    /// lock held. The caller supplies the trapframe pages and the user
    /// address space; on failure all three are released here.
    unsafe fn alloc(
        &self,
        trap_frame: Page,
        backup_frame: Page,
        memory: UserMemory,
    ) -> Result<ProcGuard, ()> {
        let now = kernel().ticks_value();
        for p in &self.process_pool {
            let mut guard = p.lock();
            if guard.deref_info().state == Procstate::UNUSED {
                let info = guard.deref_mut_info();
                info.pid = self.allocpid();
                info.ctime = now;
                info.rtime = 0;
                info.stime = 0;
                info.endtime = 0;
                info.sched_count = 0;
                info.sched = SchedState::new();
                info.sched.reset(now);

                // SAFETY: this process cannot be the current process yet.
                let data = unsafe { &mut *guard.data.get() };
                data.trap_frame = trap_frame.into_usize() as _;
                data.backup_frame = backup_frame.into_usize() as _;
                data.memory = memory;
                data.trace_mask = 0;
                data.alarm = Alarm::new();

                // Set up new context to start executing at forkret, which
                // returns to user space.
                data.context = Context::new();
                data.context.ra = forkret as usize;
                data.context.sp = data.kstack + PGSIZE;

                // It's safe because trap frames and memory are initialized.
                guard.deref_mut_info().state = Procstate::USED;
                return Ok(guard);
            }
        }

        kernel().free(trap_frame);
        kernel().free(backup_frame);
        memory.free();
        Err(())
    }

    /// Set up the first user process.
    pub unsafe fn user_proc_init(&mut self) {
        // Allocate the trapframe pages.
        let trap_frame = scopeguard::guard(
            kernel().alloc().expect("user_proc_init: alloc"),
            |page| kernel().free(page),
        );
        let backup_frame = scopeguard::guard(
            kernel().alloc().expect("user_proc_init: alloc"),
            |page| kernel().free(page),
        );

        // Allocate one user page and copy initcode's instructions and data
        // into it.
        let memory = UserMemory::new(trap_frame.addr(), Some(&INITCODE))
            .expect("user_proc_init: UserMemory::new");

        let mut guard = unsafe {
            self.alloc(
                ScopeGuard::into_inner(trap_frame),
                ScopeGuard::into_inner(backup_frame),
                memory,
            )
        }
        .expect("user_proc_init: no slot");

        self.initial_proc = guard.raw() as *mut _;

        // SAFETY: this process cannot be the current process yet.
        let data = unsafe { &mut *guard.data.get() };

        // Prepare for the very first "return" from kernel to user.
        data.trap_frame_mut().epc = 0; // user program counter
        data.trap_frame_mut().sp = PGSIZE; // user stack pointer
        data.cwd = Some(RcInode::root());

        let name = b"initcode\x00";
        guard.name[..name.len()].copy_from_slice(name);

        guard.deref_mut_info().state = Procstate::RUNNABLE;
    }

    /// Create a new process, copying the parent.
    /// Sets up the child kernel stack to return as if from fork().
    pub fn fork(&self) -> Result<i32, ()> {
        let mut p = kernel().current_proc();

        // Allocate trapframe pages for the child.
        let trap_frame =
            scopeguard::guard(kernel().alloc().ok_or(())?, |page| kernel().free(page));
        let backup_frame =
            scopeguard::guard(kernel().alloc().ok_or(())?, |page| kernel().free(page));

        // Share user memory with the child, copy-on-write.
        let memory = p
            .deref_mut_data()
            .memory
            .clone_cow(trap_frame.addr())
            .ok_or(())?;

        // Allocate a process slot.
        let mut np = unsafe {
            self.alloc(
                ScopeGuard::into_inner(trap_frame),
                ScopeGuard::into_inner(backup_frame),
                memory,
            )
        }?;
        // SAFETY: the child cannot be the current process yet.
        let npdata = unsafe { &mut *np.data.get() };
        let pdata = p.deref_data();

        // Copy saved user registers.
        *npdata.trap_frame_mut() = *pdata.trap_frame();

        // Cause fork to return 0 in the child.
        npdata.trap_frame_mut().a0 = 0;

        // Increment reference counts on open file descriptors.
        for (nf, f) in izip!(npdata.open_files.iter_mut(), pdata.open_files.iter()) {
            *nf = f.clone();
        }
        npdata.cwd = pdata.cwd.clone();

        // The child inherits the trace mask and the discipline state
        // (lottery tickets).
        npdata.trace_mask = pdata.trace_mask;
        np.deref_mut_info().sched =
            // SAFETY: only the parent itself mutates its discipline state.
            unsafe { (*p.raw()).info.get_mut_unchecked() }.sched.inherited();

        // SAFETY: name is only written by the process itself.
        np.name.copy_from_slice(unsafe { &(*p.raw()).name });

        let pid = np.deref_info().pid;

        // Now drop the guard before we acquire the wait_lock, because the
        // lock order is wait_lock -> p->lock.
        let child = np.raw();
        drop(np);

        // Acquire the wait_lock and write the parent field.
        // SAFETY: parent was initialized in procinit.
        let parent_field = unsafe { (*child).parent.assume_init_ref() };
        let mut parent_guard = parent_field.lock();
        *parent_field.get_mut(&mut parent_guard) = p.raw();
        drop(parent_guard);

        // SAFETY: child points into the pool.
        let mut np = unsafe { (*child).lock() };
        np.deref_mut_info().state = Procstate::RUNNABLE;

        Ok(pid)
    }

    /// Pass p's abandoned children to init.
    /// The caller must hold the wait lock.
    fn reparent(&self, p: *mut Proc, parent_guard: &mut SpinlockProtectedGuard<'_>) {
        for pp in &self.process_pool {
            // SAFETY: parent was initialized in procinit.
            let parent = unsafe { pp.parent.assume_init_ref() }.get_mut(parent_guard);
            if *parent == p {
                *parent = self.initial_proc;
                // SAFETY: initial_proc is set before any process can exit.
                unsafe { (*self.initial_proc).info.get_mut_unchecked() }
                    .child_waitchannel
                    .wakeup();
            }
        }
    }

    /// Exit the current process. Does not return. An exited process
    /// remains in the zombie state until its parent calls wait().
    pub fn exit_current(&self, status: i32) -> ! {
        let mut p = kernel().current_proc();
        assert!(p.raw() != self.initial_proc, "init exiting");

        let data = p.deref_mut_data();

        // Close all open files.
        for file in &mut data.open_files {
            if let Some(f) = file.take() {
                f.close();
            }
        }
        if let Some(cwd) = data.cwd.take() {
            cwd.put();
        }

        // Give any children to init.
        // SAFETY: parent was initialized in procinit.
        let parent_field = unsafe { (*p.raw()).parent.assume_init_ref() };
        let mut parent_guard = parent_field.lock();
        self.reparent(p.raw(), &mut parent_guard);

        // Parent might be sleeping in wait().
        let parent = *parent_field.get_mut(&mut parent_guard);
        // SAFETY: every process except init has a live parent, and init
        // cannot get here.
        unsafe { (*parent).info.get_mut_unchecked() }
            .child_waitchannel
            .wakeup();

        // SAFETY: p is the current process.
        let mut guard = unsafe { (*p.raw()).lock() };
        let info = guard.deref_mut_info();
        info.xstate = status;
        info.state = Procstate::ZOMBIE;
        info.endtime = kernel().ticks_value();

        // Should manually drop since this function never returns.
        drop(parent_guard);

        // Jump into the scheduler, never to return.
        unsafe { guard.sched() };

        unreachable!("zombie exit")
    }

    /// Wait for a child process to exit; reap it and return its pid.
    /// Returns Err if this process has no children.
    pub fn wait(&self, addr: UVAddr) -> Result<i32, ()> {
        self.wait_inner(addr, &mut 0, &mut 0)
    }

    /// Like `wait`, but also reports the child's run time and its waiting
    /// time (endtime - ctime - rtime).
    pub fn waitx(&self, addr: UVAddr, rtime: &mut u32, wtime: &mut u32) -> Result<i32, ()> {
        self.wait_inner(addr, rtime, wtime)
    }

    fn wait_inner(&self, addr: UVAddr, rtime: &mut u32, wtime: &mut u32) -> Result<i32, ()> {
        let mut p = kernel().current_proc();
        let ptr = p.raw();

        // SAFETY: parent was initialized in procinit; any slot's handle
        // reaches the shared wait_lock.
        let mut parent_guard = unsafe { self.process_pool[0].parent.assume_init_ref() }.lock();

        loop {
            // Scan through the pool looking for exited children.
            let mut havekids = false;
            for np in &self.process_pool {
                // SAFETY: parent was initialized in procinit.
                if *unsafe { np.parent.assume_init_ref() }.get_mut(&mut parent_guard) == ptr {
                    // Make sure the child isn't still in exit() or swtch().
                    let mut np = np.lock();

                    havekids = true;
                    if np.deref_info().state == Procstate::ZOMBIE {
                        let info = np.deref_info();
                        let pid = info.pid;
                        let xstate = info.xstate;
                        *rtime = info.rtime;
                        *wtime = info.endtime - info.ctime - info.rtime;
                        if !addr.is_null()
                            && p.deref_mut_data().memory.copy_out(addr, &xstate).is_err()
                        {
                            return Err(());
                        }
                        // Reap the zombie child.
                        np.clear(Some(&mut parent_guard));
                        return Ok(pid);
                    }
                }
            }

            // No point waiting if we don't have any children.
            if !havekids || p.killed() {
                return Err(());
            }

            // Wait for a child to exit.
            //DOC: wait-sleep
            // SAFETY: the channel address is stable for the slot's lifetime.
            unsafe { (*ptr).info.get_mut_unchecked() }
                .child_waitchannel
                .sleep(&mut parent_guard);
        }
    }

    /// Wake up all processes in the pool sleeping on `target`.
    /// Must be called without any p->lock.
    pub fn wakeup_pool(&self, target: &WaitChannel) {
        let me = myproc();
        for p in &self.process_pool {
            if p as *const Proc != me as *const Proc {
                let mut guard = p.lock();
                if guard.deref_info().waitchannel == target as *const _ {
                    guard.wakeup();
                }
            }
        }
    }

    /// Kill the process with the given pid. The victim won't exit until it
    /// tries to return to user space (see usertrap).
    pub fn kill(&self, pid: i32) -> Result<(), ()> {
        for p in &self.process_pool {
            let mut guard = p.lock();
            if guard.deref_info().pid == pid {
                p.kill();
                guard.wakeup();
                return Ok(());
            }
        }
        Err(())
    }

    /// Charge the clock tick to every slot: run time for RUNNING
    /// processes (plus the discipline's own accounting), sleep time for
    /// SLEEPING ones.
    pub fn update_time(&self) {
        for p in &self.process_pool {
            let mut guard = p.lock();
            let info = guard.deref_mut_info();
            match info.state {
                Procstate::RUNNING => {
                    info.rtime += 1;
                    info.sched.tick_running();
                }
                Procstate::SLEEPING => info.stime += 1,
                _ => {}
            }
        }
    }

    /// Print a process listing to the console. For debugging; runs when a
    /// user types ^P on the console. No lock to avoid wedging a stuck
    /// machine further.
    pub fn dump(&self) {
        println!();
        println!("{}", kernel().sched.dump_header());
        for p in &self.process_pool {
            // SAFETY: unlocked read; torn values are tolerated here.
            let info = unsafe { &*p.info_raw() };
            if info.state == Procstate::UNUSED {
                continue;
            }
            // For null character recognition, since str::from_utf8 cannot
            // recognize interior null characters.
            let length = p.name.iter().position(|&c| c == 0).unwrap_or(p.name.len());
            let name = str::from_utf8(&p.name[..length]).unwrap_or("???");
            kernel().sched.dump_row(info, name);
        }
    }
}

/// Initialize the proc table at boot time.
///
/// # Safety
///
/// `procs` must be the kernel's process system, which lives forever.
pub unsafe fn procinit(procs: &mut ProcessSystem) {
    // SAFETY: the process system lives forever; its wait_lock address is
    // stable.
    let wait_lock: &'static RawSpinlock = unsafe { &*ptr::addr_of!(procs.wait_lock) };
    for (i, p) in procs.process_pool.iter_mut().enumerate() {
        p.parent
            .write(SpinlockProtected::new(wait_lock, ptr::null_mut()));
        p.data.get_mut().kstack = kstack(i);
    }
}

/// Return this CPU's ID.
///
/// Must be called with interrupts disabled, to prevent a race with the
/// process being moved to a different CPU.
pub fn cpuid() -> usize {
    r_tp()
}

/// Return the current struct Proc *, or null if none.
pub fn myproc() -> *mut Proc {
    unsafe {
        push_off();
        let c = kernel().mycpu();
        let p = (*c).proc;
        pop_off();
        p
    }
}

impl crate::kernel::Kernel {
    /// The process running on this CPU. Panics if the CPU is idling in the
    /// scheduler.
    pub fn current_proc(&self) -> CurrentProc {
        let p = myproc();
        assert!(!p.is_null(), "current_proc: none");
        CurrentProc { ptr: p }
    }
}

/// Per-CPU process scheduler. Each CPU calls scheduler() after setting
/// itself up. Scheduler never returns. It loops, doing:
///  - choose a process to run via the compiled-in discipline.
///  - swtch to start running that process.
///  - eventually that process transfers control back via swtch.
pub unsafe fn scheduler() -> ! {
    let c = kernel().mycpu();
    unsafe { (*c).proc = ptr::null_mut() };
    loop {
        // Avoid deadlock by ensuring that devices can interrupt.
        unsafe { intr_on() };

        unsafe { kernel().sched.select(c) };
    }
}

/// Give up the CPU for one scheduling round.
pub fn proc_yield() {
    let p = myproc();
    // SAFETY: p is the current process.
    let mut guard = unsafe { (*p).lock() };
    guard.deref_mut_info().state = Procstate::RUNNABLE;
    unsafe { guard.sched() };
}

/// A fork child's very first scheduling by scheduler() will swtch to
/// forkret.
unsafe fn forkret() {
    static FIRST: Once<()> = Once::new();

    // Still holding p->lock from scheduler.
    unsafe { (*myproc()).info.unlock() };

    // File system initialization must be run in the context of a regular
    // process (e.g., because it calls sleep), and thus cannot be run from
    // main().
    FIRST.call_once(|| crate::fs::init(ROOTDEV));

    unsafe { usertrapret() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_are_monotonic_and_unique() {
        let procs = ProcessSystem::zero();
        let a = procs.allocpid();
        let b = procs.allocpid();
        let c = procs.allocpid();
        assert_eq!(a, 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn alarm_fires_after_period_and_suppresses_reentry() {
        let mut alarm = Alarm::new();
        alarm.arm(3, 0x1000);
        assert!(!alarm.tick());
        assert!(!alarm.tick());
        assert!(alarm.tick());
        assert_eq!(alarm.handler(), 0x1000);

        // In the handler: ticks are ignored, never delivered.
        assert!(!alarm.tick());
        assert!(!alarm.tick());
        assert!(!alarm.tick());
        assert!(!alarm.tick());

        // After sigreturn a full period elapses before the next delivery.
        alarm.finish();
        assert!(!alarm.tick());
        assert!(!alarm.tick());
        assert!(alarm.tick());
    }

    #[test]
    fn disarmed_alarm_never_fires() {
        let mut alarm = Alarm::new();
        for _ in 0..100 {
            assert!(!alarm.tick());
        }
    }

    #[test]
    fn wakeup_only_affects_sleeping_processes() {
        let procs = ProcessSystem::zero();
        let chan = WaitChannel::new();

        {
            let mut guard = procs.process_pool[0].lock();
            guard.deref_mut_info().state = Procstate::SLEEPING;
            guard.deref_mut_info().waitchannel = &chan;
            guard.wakeup();
            assert_eq!(guard.deref_info().state, Procstate::RUNNABLE);
        }

        {
            let mut guard = procs.process_pool[1].lock();
            guard.deref_mut_info().state = Procstate::RUNNING;
            guard.wakeup();
            assert_eq!(guard.deref_info().state, Procstate::RUNNING);
        }
    }

    #[test]
    fn wakeup_pool_matches_on_channel_identity() {
        let procs = ProcessSystem::zero();
        let chan_a = WaitChannel::new();
        let chan_b = WaitChannel::new();

        {
            let mut guard = procs.process_pool[0].lock();
            guard.deref_mut_info().state = Procstate::SLEEPING;
            guard.deref_mut_info().waitchannel = &chan_a;
        }
        {
            let mut guard = procs.process_pool[1].lock();
            guard.deref_mut_info().state = Procstate::SLEEPING;
            guard.deref_mut_info().waitchannel = &chan_b;
        }

        procs.wakeup_pool(&chan_a);

        let zero = procs.process_pool[0].lock();
        assert_eq!(zero.deref_info().state, Procstate::RUNNABLE);
        drop(zero);
        let one = procs.process_pool[1].lock();
        assert_eq!(one.deref_info().state, Procstate::SLEEPING);
    }

    #[test]
    fn kill_flags_by_pid_and_promotes_sleepers() {
        let procs = ProcessSystem::zero();
        {
            let mut guard = procs.process_pool[0].lock();
            guard.deref_mut_info().pid = 42;
            guard.deref_mut_info().state = Procstate::SLEEPING;
        }

        assert!(procs.kill(42).is_ok());
        assert!(procs.process_pool[0].killed());
        let guard = procs.process_pool[0].lock();
        assert_eq!(guard.deref_info().state, Procstate::RUNNABLE);
        drop(guard);

        assert!(procs.kill(777).is_err());
    }

    #[test]
    fn clear_resets_identity_and_accounting() {
        let procs = ProcessSystem::zero();
        let mut guard = procs.process_pool[0].lock();
        {
            let info = guard.deref_mut_info();
            info.pid = 9;
            info.state = Procstate::ZOMBIE;
            info.xstate = 7;
            info.ctime = 3;
            info.rtime = 5;
            info.stime = 2;
            info.endtime = 11;
            info.sched_count = 4;
        }
        procs.process_pool[0].kill();

        guard.clear(None);

        let info = guard.deref_info();
        assert_eq!(info.pid, 0);
        assert_eq!(info.state, Procstate::UNUSED);
        assert_eq!(info.xstate, 0);
        assert_eq!((info.ctime, info.rtime, info.stime, info.endtime), (0, 0, 0, 0));
        assert_eq!(info.sched_count, 0);
        assert!(info.waitchannel.is_null());
        drop(guard);
        assert!(!procs.process_pool[0].killed());
    }

    #[test]
    fn update_time_charges_by_state() {
        let procs = ProcessSystem::zero();
        {
            let mut guard = procs.process_pool[0].lock();
            guard.deref_mut_info().state = Procstate::RUNNING;
        }
        {
            let mut guard = procs.process_pool[1].lock();
            guard.deref_mut_info().state = Procstate::SLEEPING;
        }

        procs.update_time();
        procs.update_time();

        let zero = procs.process_pool[0].lock();
        assert_eq!(zero.deref_info().rtime, 2);
        assert_eq!(zero.deref_info().stime, 0);
        drop(zero);
        let one = procs.process_pool[1].lock();
        assert_eq!(one.deref_info().stime, 2);
        assert_eq!(one.deref_info().rtime, 0);
    }
}
