//! Multi-level feedback queue: NMLFQ FIFO levels, level 0 highest. A
//! process spends a `1 << level` tick budget per selection, is demoted
//! when it burns all of it, keeps its level when it sleeps first, and is
//! promoted after waiting AGETICKS in a queue.

use array_macro::array;

use crate::param::{NMLFQ, NPROC};
use crate::spinlock::Spinlock;

/// A FIFO of process-slot indices, stored as a circular buffer.
pub struct Ring {
    slots: [usize; NPROC],
    head: usize,
    size: usize,
}

impl Ring {
    pub const fn new() -> Self {
        Self {
            slots: [0; NPROC],
            head: 0,
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn push(&mut self, idx: usize) {
        if self.size == NPROC {
            panic!("mlfq queue full");
        }
        self.slots[(self.head + self.size) % NPROC] = idx;
        self.size += 1;
    }

    pub fn pop(&mut self) -> Option<usize> {
        if self.size == 0 {
            return None;
        }
        let idx = self.slots[self.head];
        self.head = (self.head + 1) % NPROC;
        self.size -= 1;
        Some(idx)
    }

    /// Remove the first occurrence of `idx`, keeping the FIFO order of the
    /// remaining entries. Returns whether anything was removed.
    pub fn remove(&mut self, idx: usize) -> bool {
        let mut pos = None;
        for i in 0..self.size {
            if self.slots[(self.head + i) % NPROC] == idx {
                pos = Some(i);
                break;
            }
        }
        let pos = match pos {
            Some(pos) => pos,
            None => return false,
        };
        for i in pos..self.size - 1 {
            self.slots[(self.head + i) % NPROC] = self.slots[(self.head + i + 1) % NPROC];
        }
        self.size -= 1;
        true
    }
}

pub struct Mlfq {
    /// One queue per level. Always taken after the process lock.
    queues: Spinlock<[Ring; NMLFQ]>,
}

impl Mlfq {
    pub const fn new() -> Self {
        Self {
            queues: Spinlock::new("mlfq", array![_ => Ring::new(); NMLFQ]),
        }
    }
}

/// Per-process MLFQ state.
pub struct MlfqState {
    /// Queue level, 0..NMLFQ; 0 is the highest priority.
    pub level: usize,

    /// Whether the slot index currently sits in a queue.
    pub in_queue: bool,

    /// Remaining tick budget at this level; refilled to 1 << level on
    /// selection.
    pub quanta: i64,

    /// Tick of the last enqueue or selection; drives aging.
    pub q_in_time: u32,

    /// Ticks run at each level.
    pub qrtime: [u32; NMLFQ],
}

impl MlfqState {
    pub const fn new() -> Self {
        Self {
            level: 0,
            in_queue: false,
            quanta: 1,
            q_in_time: 0,
            qrtime: [0; NMLFQ],
        }
    }

    pub fn reset(&mut self, now: u32) {
        self.q_in_time = now;
    }

    pub fn inherited(&self) -> Self {
        Self::new()
    }

    pub fn tick_running(&mut self) {
        self.qrtime[self.level] += 1;
        self.quanta -= 1;
    }
}

#[cfg(feature = "mlfq")]
mod active {
    use super::Mlfq;
    use crate::kernel::kernel;
    use crate::param::{AGETICKS, NMLFQ};
    use crate::println;
    use crate::proc::{Cpu, Proc, ProcInfo, Procstate};
    use crate::sched::{Preempt, Scheduler};

    impl Scheduler for Mlfq {
        unsafe fn select(&self, cpu: *mut Cpu) {
            let pool = kernel().procs.pool();
            let now = kernel().ticks_value();

            // Aging: promote whoever has waited too long; it re-enters a
            // queue at the new level right below.
            for (i, p) in pool.iter().enumerate() {
                let mut guard = p.lock();
                let info = guard.deref_mut_info();
                if info.state == Procstate::RUNNABLE
                    && now.wrapping_sub(info.sched.q_in_time) >= AGETICKS
                {
                    if info.sched.in_queue {
                        self.queues.lock()[info.sched.level].remove(i);
                        info.sched.in_queue = false;
                    }
                    if info.sched.level > 0 {
                        info.sched.level -= 1;
                    }
                    info.sched.q_in_time = now;
                }
            }

            // Every RUNNABLE process waits in the queue of its level.
            for (i, p) in pool.iter().enumerate() {
                let mut guard = p.lock();
                let info = guard.deref_mut_info();
                if info.state == Procstate::RUNNABLE && !info.sched.in_queue {
                    self.queues.lock()[info.sched.level].push(i);
                    info.sched.in_queue = true;
                }
            }

            // Pop the head of the highest non-empty queue, discarding
            // entries that stopped being RUNNABLE while queued.
            for level in 0..NMLFQ {
                loop {
                    let idx = { self.queues.lock()[level].pop() };
                    let idx = match idx {
                        Some(idx) => idx,
                        None => break,
                    };

                    let mut guard = pool[idx].lock();
                    let info = guard.deref_mut_info();
                    info.sched.in_queue = false;
                    if info.state != Procstate::RUNNABLE {
                        continue;
                    }

                    info.sched.q_in_time = now;
                    info.sched.quanta = 1 << info.sched.level;
                    unsafe { guard.run(cpu) };
                    guard.deref_mut_info().sched.q_in_time = kernel().ticks_value();
                    return;
                }
            }
        }

        fn on_tick(&self, p: &Proc) -> Preempt {
            let mut guard = p.lock();
            let info = guard.deref_mut_info();
            if info.sched.quanta <= 0 {
                // Budget exhausted at this level: demote and give way.
                if info.sched.level < NMLFQ - 1 {
                    info.sched.level += 1;
                }
                return Preempt::Yield;
            }
            let level = info.sched.level;
            drop(guard);

            // A waiter in a higher-priority queue wins the CPU; the
            // running process keeps its level.
            let queues = self.queues.lock();
            if queues[..level].iter().any(|q| !q.is_empty()) {
                return Preempt::Yield;
            }
            Preempt::Keep
        }

        fn dump_header(&self) -> &'static str {
            "PID Priority State rtime stime sched_count q0 q1 q2 q3 q4"
        }

        fn dump_row(&self, info: &ProcInfo, _name: &str) {
            println!(
                "{} {} {} {} {} {} {} {} {} {} {}",
                info.pid,
                info.sched.level,
                info.state.as_str(),
                info.rtime,
                info.stime,
                info.sched_count,
                info.sched.qrtime[0],
                info.sched.qrtime[1],
                info.sched.qrtime[2],
                info.sched.qrtime[3],
                info.sched.qrtime[4]
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_fifo() {
        let mut ring = Ring::new();
        ring.push(3);
        ring.push(1);
        ring.push(4);
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(4));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn ring_wraps_around() {
        let mut ring = Ring::new();
        // Walk head far enough that pushes wrap the backing array.
        for round in 0..3 {
            for i in 0..NPROC - 1 {
                ring.push(round * NPROC + i);
            }
            for i in 0..NPROC - 1 {
                assert_eq!(ring.pop(), Some(round * NPROC + i));
            }
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn removal_preserves_fifo_order_of_the_rest() {
        let mut ring = Ring::new();
        for i in [10, 20, 30, 40, 50] {
            ring.push(i);
        }
        assert!(ring.remove(30));
        assert_eq!(ring.pop(), Some(10));
        assert_eq!(ring.pop(), Some(20));
        assert_eq!(ring.pop(), Some(40));
        assert_eq!(ring.pop(), Some(50));
    }

    #[test]
    fn removal_works_across_the_wrap_boundary() {
        let mut ring = Ring::new();
        for i in 0..NPROC - 2 {
            ring.push(i);
            ring.pop();
        }
        // head is now near the end of the backing array.
        for i in [7, 8, 9, 11] {
            ring.push(i);
        }
        assert!(ring.remove(8));
        assert_eq!(ring.pop(), Some(7));
        assert_eq!(ring.pop(), Some(9));
        assert_eq!(ring.pop(), Some(11));
        assert!(ring.is_empty());
    }

    #[test]
    fn removing_a_missing_index_is_a_noop() {
        let mut ring = Ring::new();
        ring.push(1);
        assert!(!ring.remove(2));
        assert_eq!(ring.len(), 1);
    }

    #[test]
    #[should_panic(expected = "mlfq queue full")]
    fn overfull_ring_panics() {
        let mut ring = Ring::new();
        for i in 0..=NPROC {
            ring.push(i);
        }
    }

    #[test]
    fn quanta_budget_follows_the_level() {
        let mut state = MlfqState::new();
        state.level = 3;
        state.quanta = 1 << state.level;
        for _ in 0..1 << state.level {
            assert!(state.quanta > 0);
            state.tick_running();
        }
        assert_eq!(state.quanta, 0);
        assert_eq!(state.qrtime[3], 8);
        assert_eq!(state.qrtime[0], 0);
    }

    #[test]
    fn fresh_state_starts_hot() {
        let state = MlfqState::new();
        assert_eq!(state.level, 0);
        assert_eq!(state.quanta, 1);
        assert!(!state.in_queue);
    }
}
