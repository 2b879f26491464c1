//! Scheduling disciplines.
//!
//! All five disciplines share one contract: a selection pass picks at most
//! one RUNNABLE process, bumps its `sched_count`, and context-switches to
//! it with its lock held; on the way back the CPU's process pointer is
//! cleared and the lock released. `on_tick` is the other half of the
//! contract: the timer-interrupt return path asks the discipline whether
//! the running process must give up the CPU.
//!
//! Exactly one discipline is compiled in (Cargo feature); `Active` and
//! `SchedState` alias its scheduler and its per-process state, so the tick
//! path never dispatches dynamically. The modules themselves always
//! compile, which keeps every discipline's logic under unit test no matter
//! which one a build selects.

pub mod fcfs;
pub mod lottery;
pub mod mlfq;
pub mod priority;
pub mod round_robin;

use crate::proc::{Cpu, Proc, ProcInfo};

/// Verdict of `Scheduler::on_tick`.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Preempt {
    /// Let the process keep its CPU.
    Keep,
    /// The process must yield now.
    Yield,
}

/// A scheduling discipline.
pub trait Scheduler {
    /// Run one selection pass on this CPU: pick at most one RUNNABLE
    /// process and run it until it comes back via swtch.
    ///
    /// # Safety
    ///
    /// Must be called from the per-CPU scheduler loop with `cpu` being the
    /// caller's own CPU record.
    unsafe fn select(&self, cpu: *mut Cpu);

    /// Decide whether `p`, the process running on this CPU, must yield
    /// after a timer tick. Called without p->lock held.
    fn on_tick(&self, p: &Proc) -> Preempt;

    /// Column header for the console process dump.
    fn dump_header(&self) -> &'static str;

    /// One process row of the console process dump. `info` is read without
    /// the lock; torn values are tolerated.
    fn dump_row(&self, info: &ProcInfo, name: &str);
}

cfg_if::cfg_if! {
    if #[cfg(feature = "mlfq")] {
        pub type Active = mlfq::Mlfq;
        pub type SchedState = mlfq::MlfqState;
    } else if #[cfg(feature = "pbs")] {
        pub type Active = priority::Pbs;
        pub type SchedState = priority::PbsState;
    } else if #[cfg(feature = "lbs")] {
        pub type Active = lottery::Lottery;
        pub type SchedState = lottery::LotteryState;
    } else if #[cfg(feature = "fcfs")] {
        pub type Active = fcfs::Fcfs;
        pub type SchedState = fcfs::FcfsState;
    } else if #[cfg(feature = "round-robin")] {
        pub type Active = round_robin::RoundRobin;
        pub type SchedState = round_robin::RoundRobinState;
    } else {
        compile_error!("select a scheduling discipline feature");
    }
}
