//! Process-related system call bodies.

use crate::kernel::Kernel;
use crate::proc::CurrentProc;
use crate::vm::UVAddr;

impl Kernel {
    /// Terminate the current process; status reported to wait(). No
    /// return.
    pub fn sys_exit(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let n = proc.argint(0);
        self.procs.exit_current(n)
    }

    /// Create a process; returns the child's PID.
    pub fn sys_fork(&self, _proc: &mut CurrentProc) -> Result<usize, ()> {
        Ok(self.procs.fork()? as usize)
    }

    /// Wait for a child to exit; returns its PID.
    pub fn sys_wait(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let addr = UVAddr::new(proc.argaddr(0));
        Ok(self.procs.wait(addr)? as usize)
    }

    /// Wait for a child to exit; additionally report the child's running
    /// time and waiting time to the given user addresses.
    pub fn sys_waitx(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let addr = UVAddr::new(proc.argaddr(0));
        let wtime_addr = UVAddr::new(proc.argaddr(1));
        let rtime_addr = UVAddr::new(proc.argaddr(2));

        let mut rtime: u32 = 0;
        let mut wtime: u32 = 0;
        let pid = self.procs.waitx(addr, &mut rtime, &mut wtime)?;

        let memory = &mut proc.deref_mut_data().memory;
        memory.copy_out(wtime_addr, &wtime)?;
        memory.copy_out(rtime_addr, &rtime)?;
        Ok(pid as usize)
    }

    /// Return the current process's PID.
    pub fn sys_getpid(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        Ok(proc.pid() as usize)
    }

    /// Terminate process PID.
    pub fn sys_kill(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let pid = proc.argint(0);
        self.procs.kill(pid)?;
        Ok(0)
    }

    /// Grow the process's memory by n bytes; returns the old break.
    pub fn sys_sbrk(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let n = proc.argint(0);
        proc.deref_mut_data().memory.resize(n)
    }

    /// Pause for n clock ticks.
    pub fn sys_sleep(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let n = proc.argint(0) as u32;
        let mut ticks = self.ticks.lock();
        let ticks0 = *ticks;
        while ticks.wrapping_sub(ticks0) < n {
            if proc.killed() {
                return Err(());
            }
            ticks.sleep();
        }
        Ok(0)
    }

    /// How many clock tick interrupts have occurred since start.
    pub fn sys_uptime(&self, _proc: &mut CurrentProc) -> Result<usize, ()> {
        Ok(*self.ticks.lock() as usize)
    }

    /// Record a mask of system calls to report on return; fork passes the
    /// mask on.
    pub fn sys_trace(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let mask = proc.argint(0) as u32;
        proc.deref_mut_data().trace_mask = mask;
        Ok(0)
    }

    /// Arrange for a user handler to run every n user-mode ticks; n = 0
    /// disarms.
    pub fn sys_sigalarm(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let n = proc.argint(0);
        let handler = proc.argaddr(1);
        if n < 0 {
            return Err(());
        }
        proc.deref_mut_data().alarm.arm(n as u32, handler);
        Ok(0)
    }

    /// Return from an alarm handler: restore the saved trapframe verbatim
    /// and hand back the restored a0 so the return-value write is
    /// invisible.
    pub fn sys_sigreturn(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let data = proc.deref_mut_data();
        let a0 = data.restore_trap_frame();
        data.alarm.finish();
        Ok(a0)
    }

    /// Set the current process's lottery tickets. Fails unless the lottery
    /// scheduler is compiled in.
    #[cfg(feature = "lbs")]
    pub fn sys_settickets(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let tickets = proc.argint(0) as i64;
        crate::sched::lottery::settickets(tickets);
        Ok(0)
    }

    #[cfg(not(feature = "lbs"))]
    pub fn sys_settickets(&self, _proc: &mut CurrentProc) -> Result<usize, ()> {
        Err(())
    }

    /// Reassign a process's static priority; returns the old one. Fails
    /// unless the priority scheduler is compiled in.
    #[cfg(feature = "pbs")]
    pub fn sys_set_priority(&self, proc: &mut CurrentProc) -> Result<usize, ()> {
        let priority = proc.argint(0);
        let pid = proc.argint(1);
        if !(0..=100).contains(&priority) {
            return Err(());
        }
        Ok(crate::sched::priority::set_priority(priority as u32, pid)? as usize)
    }

    #[cfg(not(feature = "pbs"))]
    pub fn sys_set_priority(&self, _proc: &mut CurrentProc) -> Result<usize, ()> {
        Err(())
    }
}
