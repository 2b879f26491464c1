//! First-come-first-served: run the RUNNABLE process with the smallest
//! creation tick to completion; the clock never preempts it.

use super::{Preempt, Scheduler};
use crate::kernel::kernel;
use crate::println;
use crate::proc::{Cpu, Proc, ProcGuard, ProcInfo, Procstate};

pub struct Fcfs;

impl Fcfs {
    pub const fn new() -> Self {
        Self
    }
}

/// FCFS orders by `ctime`, which already lives in the shared accounting.
pub struct FcfsState;

impl FcfsState {
    pub const fn new() -> Self {
        Self
    }

    pub fn reset(&mut self, _now: u32) {}

    pub fn inherited(&self) -> Self {
        Self
    }

    pub fn tick_running(&mut self) {}
}

impl Scheduler for Fcfs {
    unsafe fn select(&self, cpu: *mut Cpu) {
        // Scan for the oldest RUNNABLE process, keeping only the current
        // best candidate locked. Replacing `best` drops (and so unlocks)
        // the previous candidate; two process locks overlap only for the
        // moment of that swap.
        let mut best: Option<ProcGuard> = None;
        for p in kernel().procs.pool() {
            let guard = p.lock();
            if guard.deref_info().state == Procstate::RUNNABLE {
                let better = match &best {
                    Some(b) => guard.deref_info().ctime < b.deref_info().ctime,
                    None => true,
                };
                if better {
                    best = Some(guard);
                }
            }
        }

        if let Some(mut best) = best {
            unsafe { best.run(cpu) };
        }
    }

    fn on_tick(&self, _p: &Proc) -> Preempt {
        Preempt::Keep
    }

    fn dump_header(&self) -> &'static str {
        "PID State Name ctime"
    }

    fn dump_row(&self, info: &ProcInfo, name: &str) {
        println!(
            "{} {} {} {}",
            info.pid,
            info.state.as_str(),
            name,
            info.ctime
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcessSystem;

    #[test]
    fn never_preempts_on_tick() {
        let procs = ProcessSystem::zero();
        assert_eq!(Fcfs::new().on_tick(&procs.pool()[0]), Preempt::Keep);
    }
}
