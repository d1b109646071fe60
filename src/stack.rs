// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! Fiber stack allocation.
//!
//! Each stack is a private anonymous mapping with an unmapped guard region
//! below it (stacks grow down on every architecture this crate targets), so
//! an overflowing fiber faults instead of silently corrupting its neighbor.
//! Mirrors `stack_protected.rs` in the coroutine crate this runtime grew out
//! of, ported from the long-gone `mmap` crate onto `nix::sys::mman`.

use std::ptr::NonNull;

use nix::sys::mman::{mmap, mprotect, MapFlags, ProtFlags};

use crate::error::{Error, Result};

/// A fiber's stack: one guard page followed by the usable region.
pub struct Stack {
    /// Base of the full mapping, guard page included.
    mapping: NonNull<std::ffi::c_void>,
    /// Size of the full mapping in bytes, guard page included.
    mapping_len: usize,
    /// Size of the usable (non-guard) region in bytes.
    usable_len: usize,
}

// The mapping is exclusively owned by this Stack and only ever touched
// through raw pointers the fiber's own context switch derives; it is safe
// to hand off to whichever worker thread resumes the fiber.
unsafe impl Send for Stack {}

fn page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .unwrap_or(4096)
}

impl Stack {
    /// Allocate a stack with at least `requested` usable bytes, rounded up
    /// to a whole number of pages, plus one leading guard page.
    pub fn new(requested: usize) -> Result<Stack> {
        let page = page_size();
        let usable_len = requested.max(page).div_ceil(page) * page;
        let mapping_len = usable_len + page;

        let mapping = unsafe {
            mmap(
                None,
                std::num::NonZeroUsize::new(mapping_len).unwrap(),
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_STACK | MapFlags::MAP_ANONYMOUS,
                None::<std::os::fd::BorrowedFd>,
                0,
            )
        }
        .map_err(|e| {
            log::error!("stack allocation of {} bytes failed: {}", mapping_len, e);
            Error::Io(std::io::Error::from(e))
        })
        .map(|ptr| NonNull::new(ptr).expect("mmap returned null pointer on success"))?;

        // The guard page is the *low* address: the stack grows down from
        // the high end of the mapping toward it.
        unsafe {
            mprotect(mapping.as_ptr(), page, ProtFlags::PROT_NONE).map_err(|e| {
                log::error!("guard page mprotect failed: {}", e);
                Error::Io(std::io::Error::from(e))
            })?;
        }

        Ok(Stack {
            mapping,
            mapping_len,
            usable_len,
        })
    }

    /// Lowest usable address (just above the guard page).
    pub fn bottom(&self) -> *mut u8 {
        unsafe { (self.mapping.as_ptr() as *mut u8).add(self.mapping_len - self.usable_len) }
    }

    /// One past the highest usable address — the initial stack pointer,
    /// since the stack grows toward lower addresses.
    pub fn top(&self) -> *mut u8 {
        unsafe { (self.mapping.as_ptr() as *mut u8).add(self.mapping_len) }
    }

    pub fn usable_len(&self) -> usize {
        self.usable_len
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munmap(self.mapping.as_ptr(), self.mapping_len);
        }
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("base", &self.mapping.as_ptr())
            .field("usable_len", &self.usable_len)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocates_requested_size_rounded_to_page() {
        let stack = Stack::new(1).unwrap();
        assert!(stack.usable_len() >= 1);
        assert!(stack.top() as usize > stack.bottom() as usize);
    }

    #[test]
    fn top_minus_bottom_equals_usable_len() {
        let stack = Stack::new(64 * 1024).unwrap();
        let span = stack.top() as usize - stack.bottom() as usize;
        assert_eq!(span, stack.usable_len());
    }
}
