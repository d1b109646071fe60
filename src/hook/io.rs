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

//! Hooked socket and I/O syscalls.
//!
//! `socket`/`accept` register the fd with the fd table and force it
//! non-blocking at the kernel level, regardless of what the caller asked
//! for — the illusion of blocking I/O is maintained entirely in userland
//! by `do_io`. `connect` gets its own routine since a non-blocking
//! connect's "still in progress" signal is `EINPROGRESS`, not `EAGAIN`,
//! and completion is detected via `SO_ERROR`, not a retry of `connect`
//! itself.

use std::os::unix::io::RawFd;

use super::{do_io, global_io_manager, is_enabled, table};
use crate::config::Config;
use crate::fd_manager;
use crate::fiber;
use crate::iomanager::Event;

fn force_nonblocking(fd: RawFd) {
    unsafe {
        let flags = table::real_fcntl()(fd, libc::F_GETFL, 0);
        if flags != -1 {
            table::real_fcntl()(fd, libc::F_SETFL, (flags | libc::O_NONBLOCK) as libc::c_long);
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn socket(domain: libc::c_int, kind: libc::c_int, protocol: libc::c_int) -> libc::c_int {
    let fd = table::real_socket()(domain, kind, protocol);
    if fd < 0 {
        return fd;
    }
    let is_stream_or_dgram = matches!(kind & 0xf, libc::SOCK_STREAM | libc::SOCK_DGRAM);
    if is_stream_or_dgram {
        let ctx = fd_manager::get_or_create(fd, true);
        ctx.set_sys_nonblock(true);
        if kind & libc::SOCK_NONBLOCK != 0 {
            ctx.set_user_nonblock(true);
        }
        force_nonblocking(fd);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn connect(
    fd: libc::c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> libc::c_int {
    if !is_enabled() {
        return table::real_connect()(fd, addr, addrlen);
    }

    let ctx = fd_manager::get(fd);
    if ctx.as_ref().map(|c| c.user_nonblock()).unwrap_or(false) {
        return table::real_connect()(fd, addr, addrlen);
    }

    let rc = table::real_connect()(fd, addr, addrlen);
    if rc == 0 {
        return 0;
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    if errno != libc::EINPROGRESS {
        return rc;
    }

    let Some(mgr) = global_io_manager() else {
        return rc;
    };

    let timeout_ms = Config::get().tcp_connect_timeout_ms() as u64;
    let timed_out = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = timed_out.clone();
    let mgr_for_timer = mgr.clone();
    let timer = mgr.timers().add(timeout_ms, move || {
        flag.store(true, std::sync::atomic::Ordering::SeqCst);
        let _ = mgr_for_timer.cancel_event(fd, Event::WRITE);
    });

    if let Err(e) = mgr.add_event(fd, Event::WRITE, None, None) {
        timer.cancel();
        log::error!("hook: connect add_event({fd}) failed: {e}");
        *libc::__errno_location() = libc::EINVAL;
        return -1;
    }
    fiber::Fiber::yield_hold();
    timer.cancel();

    if timed_out.load(std::sync::atomic::Ordering::SeqCst) {
        *libc::__errno_location() = libc::ETIMEDOUT;
        return -1;
    }

    let mut so_error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let got = table::real_getsockopt()(
        fd,
        libc::SOL_SOCKET,
        libc::SO_ERROR,
        &mut so_error as *mut _ as *mut libc::c_void,
        &mut len,
    );
    if got == 0 && so_error != 0 {
        *libc::__errno_location() = so_error;
        return -1;
    }
    0
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    fd: libc::c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> libc::c_int {
    let recv_timeout = fd_manager::get(fd).and_then(|c| c.recv_timeout_ms());
    let rc = do_io(fd, Event::READ, recv_timeout, || {
        table::real_accept()(fd, addr, addrlen) as libc::ssize_t
    });
    if rc >= 0 {
        let new_fd = rc as RawFd;
        let ctx = fd_manager::get_or_create(new_fd, true);
        ctx.set_sys_nonblock(true);
        force_nonblocking(new_fd);
    }
    rc as libc::c_int
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: libc::c_int, buf: *mut libc::c_void, count: libc::size_t) -> libc::ssize_t {
    let timeout = fd_manager::get(fd).and_then(|c| c.recv_timeout_ms());
    do_io(fd, Event::READ, timeout, || table::real_read()(fd, buf, count))
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: libc::c_int, buf: *const libc::c_void, count: libc::size_t) -> libc::ssize_t {
    let timeout = fd_manager::get(fd).and_then(|c| c.send_timeout_ms());
    do_io(fd, Event::WRITE, timeout, || table::real_write()(fd, buf, count))
}

#[no_mangle]
pub unsafe extern "C" fn recv(
    fd: libc::c_int,
    buf: *mut libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
) -> libc::ssize_t {
    let timeout = fd_manager::get(fd).and_then(|c| c.recv_timeout_ms());
    do_io(fd, Event::READ, timeout, || table::real_recv()(fd, buf, len, flags))
}

#[no_mangle]
pub unsafe extern "C" fn send(
    fd: libc::c_int,
    buf: *const libc::c_void,
    len: libc::size_t,
    flags: libc::c_int,
) -> libc::ssize_t {
    let timeout = fd_manager::get(fd).and_then(|c| c.send_timeout_ms());
    do_io(fd, Event::WRITE, timeout, || table::real_send()(fd, buf, len, flags))
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: libc::c_int) -> libc::c_int {
    if let Some(mgr) = global_io_manager() {
        mgr.cancel_all(fd);
    }
    fd_manager::close(fd);
    table::real_close()(fd)
}
