//! Boundary to the file-system layer.
//!
//! The process core only needs to duplicate and close file references,
//! hold a working-directory inode, and run the one-time mount. The layer
//! that implements those operations is linked in separately; this module
//! declares its entry points and wraps the reference-counted handles so
//! the rest of the kernel never touches the raw pointers.

use core::ptr::NonNull;

/// Opaque open-file object owned by the file layer.
#[repr(C)]
pub struct RawFile {
    _opaque: [u8; 0],
}

/// Opaque in-memory inode owned by the file layer.
#[repr(C)]
pub struct RawInode {
    _opaque: [u8; 0],
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "riscv64")] {
        extern "C" {
            fn fsinit(dev: u32);
            fn namei(path: *const u8) -> *mut RawInode;
            fn idup(ip: *mut RawInode) -> *mut RawInode;
            fn iput(ip: *mut RawInode);
            fn begin_op();
            fn end_op();
            fn filedup(f: *mut RawFile) -> *mut RawFile;
            fn fileclose(f: *mut RawFile);
        }
    } else {
        // Host shims; the test target never opens files.
        unsafe fn fsinit(_dev: u32) {}
        unsafe fn namei(_path: *const u8) -> *mut RawInode {
            NonNull::dangling().as_ptr()
        }
        unsafe fn idup(ip: *mut RawInode) -> *mut RawInode {
            ip
        }
        unsafe fn iput(_ip: *mut RawInode) {}
        unsafe fn begin_op() {}
        unsafe fn end_op() {}
        unsafe fn filedup(f: *mut RawFile) -> *mut RawFile {
            f
        }
        unsafe fn fileclose(_f: *mut RawFile) {}
    }
}

/// Mount the root file system. Must run in process context (it may sleep).
pub fn init(dev: u32) {
    // SAFETY: single collaborator call with no preconditions of ours.
    unsafe { fsinit(dev) };
}

/// A counted reference to an open file.
pub struct RcFile(NonNull<RawFile>);

impl RcFile {
    /// Close this reference.
    pub fn close(self) {
        // SAFETY: the pointer came from the file layer and this reference
        // is consumed.
        unsafe { fileclose(self.0.as_ptr()) };
    }
}

impl Clone for RcFile {
    fn clone(&self) -> Self {
        // SAFETY: the pointer came from the file layer.
        Self(unsafe { NonNull::new_unchecked(filedup(self.0.as_ptr())) })
    }
}

/// A counted reference to an inode.
pub struct RcInode(NonNull<RawInode>);

impl RcInode {
    /// Look up the root directory.
    pub fn root() -> Self {
        // SAFETY: namei on "/" always resolves after fsinit.
        Self(unsafe { NonNull::new_unchecked(namei(b"/\0".as_ptr())) })
    }

    /// Drop this reference inside its own file-system transaction.
    pub fn put(self) {
        let _tx = Tx::begin();
        // SAFETY: the pointer came from the file layer and this reference
        // is consumed.
        unsafe { iput(self.0.as_ptr()) };
    }
}

impl Clone for RcInode {
    fn clone(&self) -> Self {
        // SAFETY: the pointer came from the file layer.
        Self(unsafe { NonNull::new_unchecked(idup(self.0.as_ptr())) })
    }
}

/// An open file-system transaction; ends when dropped.
pub struct Tx(());

impl Tx {
    pub fn begin() -> Self {
        // SAFETY: begin_op has no preconditions of ours.
        unsafe { begin_op() };
        Self(())
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        // SAFETY: paired with the begin_op in Tx::begin.
        unsafe { end_op() };
    }
}
