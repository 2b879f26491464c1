//! System call dispatch, argument access and tracing.

use core::str;

use crate::kernel::kernel;
use crate::println;
use crate::proc::CurrentProc;

pub const SYS_FORK: usize = 1;
pub const SYS_EXIT: usize = 2;
pub const SYS_WAIT: usize = 3;
pub const SYS_KILL: usize = 6;
pub const SYS_GETPID: usize = 11;
pub const SYS_SBRK: usize = 12;
pub const SYS_SLEEP: usize = 13;
pub const SYS_UPTIME: usize = 14;
pub const SYS_TRACE: usize = 22;
pub const SYS_SIGALARM: usize = 23;
pub const SYS_SIGRETURN: usize = 24;
pub const SYS_SETTICKETS: usize = 25;
pub const SYS_SET_PRIORITY: usize = 26;
pub const SYS_WAITX: usize = 27;

/// Names for trace output, indexed by syscall number. The file-system
/// numbers are listed so traces of them print sensibly even though their
/// handlers live in the file layer.
const NAMES: [&str; 28] = [
    "", "fork", "exit", "wait", "pipe", "read", "kill", "exec", "fstat", "chdir", "dup", "getpid",
    "sbrk", "sleep", "uptime", "open", "write", "mknod", "unlink", "link", "mkdir", "close",
    "trace", "sigalarm", "sigreturn", "settickets", "set_priority", "waitx",
];

impl CurrentProc {
    fn argraw(&self, n: usize) -> usize {
        let tf = self.deref_data().trap_frame();
        match n {
            0 => tf.a0,
            1 => tf.a1,
            2 => tf.a2,
            3 => tf.a3,
            4 => tf.a4,
            5 => tf.a5,
            _ => panic!("argraw"),
        }
    }

    /// Fetch the nth 32-bit system call argument.
    pub fn argint(&self, n: usize) -> i32 {
        self.argraw(n) as i32
    }

    /// Retrieve an argument as a pointer. Doesn't check for legality,
    /// since copyout/copyin will do that.
    pub fn argaddr(&self, n: usize) -> usize {
        self.argraw(n)
    }
}

/// Dispatch the system call in a7 and leave its return value in a0.
pub fn syscall(proc: &mut CurrentProc) {
    let num = proc.deref_data().trap_frame().a7;
    let k = kernel();

    let ret = match num {
        SYS_FORK => k.sys_fork(proc),
        SYS_EXIT => k.sys_exit(proc),
        SYS_WAIT => k.sys_wait(proc),
        SYS_KILL => k.sys_kill(proc),
        SYS_GETPID => k.sys_getpid(proc),
        SYS_SBRK => k.sys_sbrk(proc),
        SYS_SLEEP => k.sys_sleep(proc),
        SYS_UPTIME => k.sys_uptime(proc),
        SYS_TRACE => k.sys_trace(proc),
        SYS_SIGALARM => k.sys_sigalarm(proc),
        SYS_SIGRETURN => k.sys_sigreturn(proc),
        SYS_SETTICKETS => k.sys_settickets(proc),
        SYS_SET_PRIORITY => k.sys_set_priority(proc),
        SYS_WAITX => k.sys_waitx(proc),
        _ => {
            // SAFETY: name is only written by the process itself.
            let name = unsafe { &(*proc.raw()).name };
            let length = name.iter().position(|&c| c == 0).unwrap_or(name.len());
            println!(
                "{} {}: unknown sys call {}",
                proc.pid(),
                str::from_utf8(&name[..length]).unwrap_or("???"),
                num
            );
            Err(())
        }
    };

    let ret = match ret {
        Ok(value) => value,
        Err(()) => usize::MAX,
    };

    if num < NAMES.len() && proc.deref_data().trace_mask & (1 << num) != 0 {
        println!(
            "{}: syscall {} -> {}",
            proc.pid(),
            NAMES[num],
            ret as isize
        );
    }

    proc.deref_mut_data().trap_frame_mut().a0 = ret;
}
