//! Lottery scheduling: each process holds tickets and a weighted random
//! draw picks the winner; the clock preempts on every tick so the lottery
//! reruns often.

use crate::spinlock::Spinlock;

/// Park-Miller linear congruential generator,
/// x = (7^5 * x) mod (2^31 - 1), computed without overflowing 31 bits via
/// Schrage's method: (2^31 - 1) = 127773 * (7^5) + 2836. From "Random
/// number generators: good ones are hard to find", Park and Miller, CACM
/// 31(10), October 1988, p. 1195.
pub struct Lcg {
    next: u64,
}

impl Lcg {
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    pub fn rand(&mut self) -> i64 {
        // Transform to [1, 0x7ffffffe] range.
        let x = (self.next % 0x7fff_fffe) as i64 + 1;
        let hi = x / 127_773;
        let lo = x % 127_773;
        let mut x = 16_807 * lo - 2_836 * hi;
        if x < 0 {
            x += 0x7fff_ffff;
        }
        // Transform back to [0, 0x7ffffffd] range.
        x -= 1;
        self.next = x as u64;
        x
    }

    /// A draw uniform over [lo, hi].
    pub fn range(&mut self, lo: i64, hi: i64) -> i64 {
        let (lo, hi) = if lo > hi { (hi, lo) } else { (lo, hi) };
        lo + self.rand() % (hi - lo + 1)
    }
}

pub struct Lottery {
    rand: Spinlock<Lcg>,
}

impl Lottery {
    pub const fn new() -> Self {
        Self {
            rand: Spinlock::new("lottery", Lcg::new()),
        }
    }
}

/// Per-process lottery state.
pub struct LotteryState {
    /// Share of the draw; fork passes it on.
    pub tickets: i64,
}

impl LotteryState {
    pub const fn new() -> Self {
        Self { tickets: 1 }
    }

    pub fn reset(&mut self, _now: u32) {
        self.tickets = 1;
    }

    pub fn inherited(&self) -> Self {
        Self {
            tickets: self.tickets,
        }
    }

    pub fn tick_running(&mut self) {}
}

#[cfg(feature = "lbs")]
mod active {
    use super::Lottery;
    use crate::kernel::kernel;
    use crate::println;
    use crate::proc::{myproc, Cpu, Proc, ProcInfo, Procstate};
    use crate::sched::{Preempt, Scheduler};

    /// Set the current process's ticket count. Negative requests are
    /// clamped to zero; a zero-ticket process only runs when no
    /// positive-ticket process is RUNNABLE.
    pub fn settickets(tickets: i64) {
        let p = myproc();
        // SAFETY: p is the current process.
        let mut guard = unsafe { (*p).lock() };
        guard.deref_mut_info().sched.tickets = tickets.max(0);
    }

    impl Scheduler for Lottery {
        unsafe fn select(&self, cpu: *mut Cpu) {
            // First pass: count the tickets in the RUNNABLE pool.
            let mut total = 0;
            for p in kernel().procs.pool() {
                let guard = p.lock();
                if guard.deref_info().state == Procstate::RUNNABLE {
                    total += guard.deref_info().sched.tickets;
                }
            }
            if total == 0 {
                // Nobody holds a ticket; run the first RUNNABLE process so
                // an all-zero pool still makes progress.
                for p in kernel().procs.pool() {
                    let mut guard = p.lock();
                    if guard.deref_info().state == Procstate::RUNNABLE {
                        unsafe { guard.run(cpu) };
                        return;
                    }
                }
                return;
            }

            let winning = self.rand.lock().range(1, total);

            // Second pass: the prefix sum that reaches the winning ticket
            // owns it. A zero-ticket process never moves the prefix, so it
            // can only be picked when it has no positive competitor.
            let mut prefix = 0;
            for p in kernel().procs.pool() {
                let mut guard = p.lock();
                if guard.deref_info().state == Procstate::RUNNABLE {
                    prefix += guard.deref_info().sched.tickets;
                    if prefix >= winning {
                        unsafe { guard.run(cpu) };
                        return;
                    }
                }
            }
        }

        fn on_tick(&self, _p: &Proc) -> Preempt {
            Preempt::Yield
        }

        fn dump_header(&self) -> &'static str {
            "PID State Name tickets"
        }

        fn dump_row(&self, info: &ProcInfo, name: &str) {
            println!(
                "{} {} {} {}",
                info.pid,
                info.state.as_str(),
                name,
                info.sched.tickets
            );
        }
    }
}

#[cfg(feature = "lbs")]
pub use active::settickets;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lcg_reproduces_the_park_miller_sequence() {
        let mut lcg = Lcg::new();
        assert_eq!(lcg.rand(), 33_613);
        assert_eq!(lcg.rand(), 564_950_497);
        assert_eq!(lcg.rand(), 1_097_816_498);
    }

    #[test]
    fn range_is_inclusive_and_never_below_lo() {
        let mut lcg = Lcg::new();
        for _ in 0..10_000 {
            let draw = lcg.range(1, 10);
            assert!((1..=10).contains(&draw));
        }
    }

    #[test]
    fn range_accepts_swapped_bounds() {
        let mut lcg = Lcg::new();
        let draw = lcg.range(10, 1);
        assert!((1..=10).contains(&draw));
    }

    #[test]
    fn positive_draw_skips_zero_ticket_prefix() {
        // A zero-ticket process contributes nothing to the prefix sum, and
        // the draw starts at 1, so the prefix can only reach the draw at a
        // positive-ticket process.
        let tickets = [0i64, 3, 0, 7];
        let total: i64 = tickets.iter().sum();
        let mut lcg = Lcg::new();
        for _ in 0..1_000 {
            let winning = lcg.range(1, total);
            let mut prefix = 0;
            let mut winner = None;
            for (i, t) in tickets.iter().enumerate() {
                prefix += t;
                if prefix >= winning {
                    winner = Some(i);
                    break;
                }
            }
            assert!(matches!(winner, Some(1) | Some(3)));
        }
    }

    #[test]
    fn forked_state_copies_tickets() {
        let mut state = LotteryState::new();
        state.tickets = 9;
        assert_eq!(state.inherited().tickets, 9);
        state.reset(0);
        assert_eq!(state.tickets, 1);
    }
}
