//! Priority-based scheduling: the process with the smallest dynamic
//! priority runs next. Dynamic priority folds in a niceness estimate of
//! how I/O-bound the latest burst was, so sleepers drift toward better
//! priorities. The clock never preempts; `set_priority` does when it
//! raises someone above the caller.

use crate::param::DEFPRIORITY;

pub struct Pbs;

impl Pbs {
    pub const fn new() -> Self {
        Self
    }
}

/// Per-process priority state.
pub struct PbsState {
    /// Static priority, 0..=100; smaller runs earlier.
    pub priority: u32,
}

impl PbsState {
    pub const fn new() -> Self {
        Self {
            priority: DEFPRIORITY,
        }
    }

    pub fn reset(&mut self, _now: u32) {
        self.priority = DEFPRIORITY;
    }

    pub fn inherited(&self) -> Self {
        Self::new()
    }

    pub fn tick_running(&mut self) {}
}

/// niceness = stime * 10 / (rtime + stime) over the latest burst, or 5
/// when the process has not run since selection.
pub fn dynamic_priority(priority: u32, rtime: u32, stime: u32) -> u32 {
    let niceness = if rtime + stime != 0 {
        (stime * 10 / (rtime + stime)) as i64
    } else {
        5
    };
    (priority as i64 - niceness + 5).clamp(0, 100) as u32
}

/// Selection key: smaller dynamic priority wins, then fewer selections,
/// then earlier creation.
pub fn selection_key(
    priority: u32,
    rtime: u32,
    stime: u32,
    sched_count: u32,
    ctime: u32,
) -> (u32, u32, u32) {
    (dynamic_priority(priority, rtime, stime), sched_count, ctime)
}

#[cfg(feature = "pbs")]
mod active {
    use super::{dynamic_priority, selection_key, Pbs};
    use crate::kernel::kernel;
    use crate::println;
    use crate::proc::{proc_yield, Cpu, Proc, ProcGuard, ProcInfo, Procstate};
    use crate::sched::{Preempt, Scheduler};

    fn key_of(info: &ProcInfo) -> (u32, u32, u32) {
        selection_key(
            info.sched.priority,
            info.rtime,
            info.stime,
            info.sched_count,
            info.ctime,
        )
    }

    /// Reassign `pid`'s static priority, returning the old one. The
    /// caller's CPU yields when the change makes the target more urgent.
    pub fn set_priority(priority: u32, pid: i32) -> Result<u32, ()> {
        for p in kernel().procs.pool() {
            let mut guard = p.lock();
            if guard.deref_info().pid == pid {
                let info = guard.deref_mut_info();
                let old = info.sched.priority;
                info.sched.priority = priority;
                // Dynamic priority restarts with the next burst.
                info.rtime = 0;
                info.stime = 0;
                drop(guard);

                if old > priority {
                    proc_yield();
                }
                return Ok(old);
            }
        }
        Err(())
    }

    impl Scheduler for Pbs {
        unsafe fn select(&self, cpu: *mut Cpu) {
            // Keep only the best candidate locked while scanning;
            // replacing it unlocks the loser, so two process locks overlap
            // only during the swap.
            let mut best: Option<ProcGuard> = None;
            for p in kernel().procs.pool() {
                let guard = p.lock();
                if guard.deref_info().state == Procstate::RUNNABLE {
                    let take = match &best {
                        Some(b) => key_of(guard.deref_info()) < key_of(b.deref_info()),
                        None => true,
                    };
                    if take {
                        best = Some(guard);
                    }
                }
            }

            if let Some(mut best) = best {
                // The burst accounting behind dynamic priority restarts
                // every time the process is picked.
                let info = best.deref_mut_info();
                info.rtime = 0;
                info.stime = 0;
                unsafe { best.run(cpu) };
            }
        }

        fn on_tick(&self, _p: &Proc) -> Preempt {
            Preempt::Keep
        }

        fn dump_header(&self) -> &'static str {
            "PID Priority State Name rtime stime sched_count"
        }

        fn dump_row(&self, info: &ProcInfo, name: &str) {
            println!(
                "{} {} {} {} {} {} {}",
                info.pid,
                dynamic_priority(info.sched.priority, info.rtime, info.stime),
                info.state.as_str(),
                name,
                info.rtime,
                info.stime,
                info.sched_count
            );
        }
    }
}

#[cfg(feature = "pbs")]
pub use active::set_priority;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_burst_has_neutral_niceness() {
        assert_eq!(dynamic_priority(60, 0, 0), 60);
    }

    #[test]
    fn sleepy_bursts_improve_priority() {
        // stime 3 of 4 ticks: niceness 7, dp = 60 - 7 + 5.
        assert_eq!(dynamic_priority(60, 1, 3), 58);
        // All-sleep burst: niceness 10.
        assert_eq!(dynamic_priority(60, 0, 5), 55);
        // All-run burst: niceness 0.
        assert_eq!(dynamic_priority(60, 5, 0), 65);
    }

    #[test]
    fn dynamic_priority_clamps_to_bounds() {
        assert_eq!(dynamic_priority(100, 4, 0), 100);
        assert_eq!(dynamic_priority(0, 0, 9), 0);
        assert_eq!(dynamic_priority(2, 0, 9), 0);
    }

    #[test]
    fn selection_key_breaks_ties_by_schedules_then_age() {
        // Smaller dynamic priority wins outright.
        assert!(selection_key(10, 0, 0, 9, 9) < selection_key(60, 0, 0, 0, 0));
        // Equal dp: fewer selections win.
        assert!(selection_key(60, 0, 0, 1, 9) < selection_key(60, 0, 0, 2, 0));
        // Equal dp and selections: older wins.
        assert!(selection_key(60, 0, 0, 1, 3) < selection_key(60, 0, 0, 1, 4));
    }

    #[test]
    fn default_priority_is_restored_on_reset() {
        let mut state = PbsState { priority: 10 };
        state.reset(0);
        assert_eq!(state.priority, DEFPRIORITY);
        // Children do not inherit a raised priority.
        assert_eq!(PbsState { priority: 3 }.inherited().priority, DEFPRIORITY);
    }
}
