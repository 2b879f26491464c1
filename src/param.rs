/// Maximum number of processes.
pub const NPROC: usize = 64;

/// Maximum number of CPUs.
pub const NCPU: usize = 8;

/// Open files per process.
pub const NOFILE: usize = 16;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Maximum length of process name.
pub const MAXPROCNAME: usize = 16;

/// Number of MLFQ levels; level 0 is the highest priority.
pub const NMLFQ: usize = 5;

/// Ticks a RUNNABLE process may wait in an MLFQ queue before it is
/// promoted one level.
pub const AGETICKS: u32 = 30;

/// Default static priority of a PBS process.
pub const DEFPRIORITY: u32 = 60;
