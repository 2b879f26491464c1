//! Round-robin: run the first RUNNABLE process in table order, preempt on
//! every timer tick.

use super::{Preempt, Scheduler};
use crate::kernel::kernel;
use crate::println;
use crate::proc::{Cpu, Proc, ProcInfo, Procstate};

pub struct RoundRobin;

impl RoundRobin {
    pub const fn new() -> Self {
        Self
    }
}

/// Round-robin keeps no per-process state.
pub struct RoundRobinState;

impl RoundRobinState {
    pub const fn new() -> Self {
        Self
    }

    pub fn reset(&mut self, _now: u32) {}

    pub fn inherited(&self) -> Self {
        Self
    }

    pub fn tick_running(&mut self) {}
}

impl Scheduler for RoundRobin {
    unsafe fn select(&self, cpu: *mut Cpu) {
        for p in kernel().procs.pool() {
            let mut guard = p.lock();
            if guard.deref_info().state == Procstate::RUNNABLE {
                unsafe { guard.run(cpu) };
                return;
            }
        }
    }

    fn on_tick(&self, _p: &Proc) -> Preempt {
        Preempt::Yield
    }

    fn dump_header(&self) -> &'static str {
        "PID State Name"
    }

    fn dump_row(&self, info: &ProcInfo, name: &str) {
        println!("{} {} {}", info.pid, info.state.as_str(), name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::ProcessSystem;

    #[test]
    fn always_preempts_on_tick() {
        let procs = ProcessSystem::zero();
        assert_eq!(
            RoundRobin::new().on_tick(&procs.pool()[0]),
            Preempt::Yield
        );
    }
}
