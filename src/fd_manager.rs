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

//! Per-fd bookkeeping for the hook layer.
//!
//! Every fd the hooked `socket`/`accept`/`open` family hands back gets an
//! entry here recording whether it's a socket (only sockets get suspended
//! on readiness; regular files are always "ready") and the user-requested
//! send/recv timeouts `setsockopt(SO_RCVTIMEO/SO_SNDTIMEO)` would otherwise
//! have configured. Ported from the original hook layer's `FdCtx`/
//! `FdManager` pair.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use log::debug;
use parking_lot::RwLock;

/// -1 means "no timeout configured", matching the original's sentinel.
const NO_TIMEOUT: i64 = -1;

pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    is_closed: AtomicBool,
    /// The fd's actual O_NONBLOCK bit, forced on for every socket we hook.
    sys_nonblock: AtomicBool,
    /// Whether the user asked for O_NONBLOCK — hooked calls must preserve
    /// the illusion of blocking I/O unless this is set.
    user_nonblock: AtomicBool,
    recv_timeout_ms: AtomicI64,
    send_timeout_ms: AtomicI64,
}

impl FdCtx {
    fn new(fd: RawFd, is_socket: bool) -> FdCtx {
        FdCtx {
            fd,
            is_socket,
            is_closed: AtomicBool::new(false),
            sys_nonblock: AtomicBool::new(false),
            user_nonblock: AtomicBool::new(false),
            recv_timeout_ms: AtomicI64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicI64::new(NO_TIMEOUT),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::SeqCst)
    }

    pub fn set_sys_nonblock(&self, v: bool) {
        self.sys_nonblock.store(v, Ordering::SeqCst);
    }

    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_user_nonblock(&self, v: bool) {
        self.user_nonblock.store(v, Ordering::SeqCst);
    }

    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::SeqCst)
    }

    pub fn set_recv_timeout_ms(&self, ms: Option<u64>) {
        self.recv_timeout_ms
            .store(ms.map(|v| v as i64).unwrap_or(NO_TIMEOUT), Ordering::SeqCst);
    }

    pub fn recv_timeout_ms(&self) -> Option<u64> {
        match self.recv_timeout_ms.load(Ordering::SeqCst) {
            NO_TIMEOUT => None,
            v => Some(v as u64),
        }
    }

    pub fn set_send_timeout_ms(&self, ms: Option<u64>) {
        self.send_timeout_ms
            .store(ms.map(|v| v as i64).unwrap_or(NO_TIMEOUT), Ordering::SeqCst);
    }

    pub fn send_timeout_ms(&self) -> Option<u64> {
        match self.send_timeout_ms.load(Ordering::SeqCst) {
            NO_TIMEOUT => None,
            v => Some(v as u64),
        }
    }
}

#[derive(Default)]
struct Table {
    slots: Vec<Option<Arc<FdCtx>>>,
}

impl Table {
    fn ensure_capacity(&mut self, fd: RawFd) {
        let idx = fd as usize;
        if idx >= self.slots.len() {
            // Grow 1.5x like the original's contextResize, not just to fd+1,
            // so a tight fd-churning loop doesn't reallocate every call.
            let new_len = (self.slots.len() * 3 / 2).max(idx + 1);
            self.slots.resize(new_len, None);
        }
    }
}

fn table() -> &'static RwLock<Table> {
    static TABLE: OnceLock<RwLock<Table>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(Table::default()))
}

/// Look up the context for `fd`, if one was ever created.
pub fn get(fd: RawFd) -> Option<Arc<FdCtx>> {
    if fd < 0 {
        return None;
    }
    let t = table().read();
    t.slots.get(fd as usize).and_then(|s| s.clone())
}

/// Look up or lazily create the context for `fd`. Used both when a hooked
/// `socket()`/`accept()` call hands back a freshly seen fd, and when some
/// other hooked call (`read`, `fcntl`, ...) observes an fd for the first
/// time (e.g. one inherited from before hooks were installed).
pub fn get_or_create(fd: RawFd, is_socket: bool) -> Arc<FdCtx> {
    if let Some(existing) = get(fd) {
        return existing;
    }
    let mut t = table().write();
    t.ensure_capacity(fd);
    let idx = fd as usize;
    if let Some(ctx) = &t.slots[idx] {
        return ctx.clone();
    }
    debug!("fd_manager: new context for fd {} (socket={})", fd, is_socket);
    let ctx = Arc::new(FdCtx::new(fd, is_socket));
    t.slots[idx] = Some(ctx.clone());
    ctx
}

/// Mark `fd` closed and drop this table's reference to its context. Any
/// `Arc<FdCtx>` clone already held by an in-flight coroutine stays valid
/// until that coroutine drops it.
pub fn close(fd: RawFd) {
    if fd < 0 {
        return;
    }
    let mut t = table().write();
    if let Some(slot) = t.slots.get_mut(fd as usize) {
        if let Some(ctx) = slot.take() {
            ctx.is_closed.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let fd = 9001;
        let a = get_or_create(fd, true);
        let b = get_or_create(fd, false);
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is_socket());
        close(fd);
    }

    #[test]
    fn close_marks_closed_and_drops_from_table() {
        let fd = 9002;
        let ctx = get_or_create(fd, true);
        close(fd);
        assert!(ctx.is_closed());
        assert!(get(fd).is_none());
    }

    #[test]
    fn timeouts_round_trip() {
        let fd = 9003;
        let ctx = get_or_create(fd, true);
        assert_eq!(ctx.recv_timeout_ms(), None);
        ctx.set_recv_timeout_ms(Some(500));
        assert_eq!(ctx.recv_timeout_ms(), Some(500));
        close(fd);
    }
}
