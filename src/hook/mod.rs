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

//! Syscall interception: turns blocking POSIX calls into coroutine-
//! suspending operations when made from inside a fiber on a non-blocking
//! socket. Grounded on the original hook layer's `hook.cc` — one
//! `do_io`-equivalent retry loop shared by every read/write-shaped call,
//! plus direct overrides for `sleep`/`connect`/`close`, which don't fit
//! that shape.
//!
//! These functions are exported `#[no_mangle] extern "C"` from the
//! `cdylib` build target so that `LD_PRELOAD`-ing the built `.so` shadows
//! libc's own symbols via `RTLD_NEXT` resolution (see `table`). The rlib
//! build of this crate does not install hooks; only code actually running
//! under the preloaded library sees interception.

pub mod fcntl;
pub mod io;
pub mod sleep;
mod table;

use std::cell::Cell;
use std::os::unix::io::RawFd;
use std::sync::{Arc, OnceLock};

use crate::iomanager::{Event, IOManager};

thread_local! {
    static ENABLED: Cell<bool> = Cell::new(true);
}

/// Whether the calling thread's hooked syscalls should suspend the current
/// fiber instead of blocking the OS thread. Off by default outside any
/// fiber (there is nothing to suspend), on inside one.
pub fn is_enabled() -> bool {
    ENABLED.with(Cell::get) && crate::fiber::Fiber::current().is_some()
}

pub fn set_enabled(v: bool) {
    ENABLED.with(|c| c.set(v));
}

static GLOBAL_IO_MANAGER: OnceLock<Arc<IOManager>> = OnceLock::new();

/// Bind the reactor hooked syscalls suspend into. Called once by
/// `IOManager::new`; a process only ever has one reactor that hooks can
/// address, matching the original's single `IOManager::GetThis()`.
pub fn bind_io_manager(mgr: Arc<IOManager>) {
    let _ = GLOBAL_IO_MANAGER.set(mgr);
}

pub fn global_io_manager() -> Option<Arc<IOManager>> {
    GLOBAL_IO_MANAGER.get().cloned()
}

fn set_errno(e: i32) {
    unsafe {
        *libc::__errno_location() = e;
    }
}

/// Shared retry loop for read/write-shaped syscalls on a non-blocking fd:
/// attempt the call, and if it would block, arm `event` on `fd` (with an
/// optional cancelling timeout) and yield until either the fd is ready or
/// the timeout fires, then retry.
pub(crate) fn do_io<F>(fd: RawFd, event: Event, timeout_ms: Option<u64>, mut attempt: F) -> libc::ssize_t
where
    F: FnMut() -> libc::ssize_t,
{
    if !is_enabled() {
        return attempt();
    }

    let ctx = crate::fd_manager::get(fd);
    let is_socket = ctx.as_ref().map(|c| c.is_socket()).unwrap_or(false);
    if !is_socket {
        return attempt();
    }
    if ctx.as_ref().map(|c| c.user_nonblock()).unwrap_or(false) {
        return attempt();
    }

    loop {
        let rc = attempt();
        if rc != -1 {
            return rc;
        }
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno != libc::EAGAIN && errno != libc::EWOULDBLOCK {
            return rc;
        }

        let Some(mgr) = global_io_manager() else {
            return rc;
        };

        let timed_out = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let timer = timeout_ms.map(|ms| {
            let flag = timed_out.clone();
            let mgr_for_timer = mgr.clone();
            mgr.timers().add(ms, move || {
                flag.store(true, std::sync::atomic::Ordering::SeqCst);
                let _ = mgr_for_timer.cancel_event(fd, event);
            })
        });

        if let Err(e) = mgr.add_event(fd, event, None, None) {
            if let Some(t) = &timer {
                t.cancel();
            }
            log::error!("hook: add_event({fd}, {event:?}) failed: {e}");
            set_errno(libc::EINVAL);
            return -1;
        }

        crate::fiber::Fiber::yield_hold();

        if let Some(t) = &timer {
            t.cancel();
        }

        if timed_out.load(std::sync::atomic::Ordering::SeqCst) {
            set_errno(libc::ETIMEDOUT);
            return -1;
        }
    }
}
