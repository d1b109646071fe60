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

//! `fcntl`/`ioctl`/`setsockopt`/`getsockopt`: the narrow slice of each that
//! the rest of the hook layer actually depends on — toggling and
//! inspecting the user-visible non-blocking flag, and the recv/send
//! timeout socket options `do_io` consults.
//!
//! `fcntl` and `ioctl` are C variadics; matching that exactly requires an
//! unstable Rust feature, so (as in several other hook shims for the same
//! syscalls) this takes the third argument as a plain `c_long`. On the
//! calling convention this crate targets, that register holds whatever
//! the caller actually passed for commands that take an argument, and is
//! simply unread for ones that don't — this only malfunctions for `fcntl`
//! commands taking a variadic argument wider than a `c_long`, none of
//! which this layer forwards.

use super::table;
use crate::fd_manager;

#[no_mangle]
pub unsafe extern "C" fn fcntl(fd: libc::c_int, cmd: libc::c_int, arg: libc::c_long) -> libc::c_int {
    match cmd {
        libc::F_SETFL => {
            let flags = arg as libc::c_int;
            if let Some(ctx) = fd_manager::get(fd) {
                ctx.set_user_nonblock(flags & libc::O_NONBLOCK != 0);
                // Always keep the real fd non-blocking at the kernel level;
                // user_nonblock only governs whether do_io suspends.
                let forced = flags | libc::O_NONBLOCK;
                return table::real_fcntl()(fd, cmd, forced as libc::c_long);
            }
            table::real_fcntl()(fd, cmd, arg)
        }
        libc::F_GETFL => {
            let real = table::real_fcntl()(fd, cmd, arg);
            if real == -1 {
                return real;
            }
            match fd_manager::get(fd) {
                Some(ctx) if !ctx.user_nonblock() => real & !libc::O_NONBLOCK,
                _ => real,
            }
        }
        _ => table::real_fcntl()(fd, cmd, arg),
    }
}

#[no_mangle]
pub unsafe extern "C" fn ioctl(fd: libc::c_int, request: libc::c_ulong, arg: libc::c_long) -> libc::c_int {
    const FIONBIO: libc::c_ulong = 0x5421;
    if request == FIONBIO {
        if let Some(ctx) = fd_manager::get(fd) {
            let nonblock = *(arg as *const libc::c_int) != 0;
            ctx.set_user_nonblock(nonblock);
            return 0;
        }
    }
    table::real_ioctl()(fd, request, arg)
}

fn timeval_to_ms(tv: &libc::timeval) -> u64 {
    (tv.tv_sec as u64) * 1000 + (tv.tv_usec as u64) / 1000
}

#[no_mangle]
pub unsafe extern "C" fn setsockopt(
    fd: libc::c_int,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *const libc::c_void,
    optlen: libc::socklen_t,
) -> libc::c_int {
    if level == libc::SOL_SOCKET
        && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
        && !optval.is_null()
        && optlen as usize >= std::mem::size_of::<libc::timeval>()
    {
        let tv = &*(optval as *const libc::timeval);
        let ms = timeval_to_ms(tv);
        let ms = if ms == 0 { None } else { Some(ms) };
        let ctx = fd_manager::get_or_create(fd, true);
        if optname == libc::SO_RCVTIMEO {
            ctx.set_recv_timeout_ms(ms);
        } else {
            ctx.set_send_timeout_ms(ms);
        }
        return 0;
    }
    table::real_setsockopt()(fd, level, optname, optval, optlen)
}

#[no_mangle]
pub unsafe extern "C" fn getsockopt(
    fd: libc::c_int,
    level: libc::c_int,
    optname: libc::c_int,
    optval: *mut libc::c_void,
    optlen: *mut libc::socklen_t,
) -> libc::c_int {
    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO) && !optval.is_null()
    {
        if let Some(ctx) = fd_manager::get(fd) {
            let ms = if optname == libc::SO_RCVTIMEO {
                ctx.recv_timeout_ms()
            } else {
                ctx.send_timeout_ms()
            };
            let tv = libc::timeval {
                tv_sec: (ms.unwrap_or(0) / 1000) as libc::time_t,
                tv_usec: ((ms.unwrap_or(0) % 1000) * 1000) as libc::suseconds_t,
            };
            std::ptr::write(optval as *mut libc::timeval, tv);
            if !optlen.is_null() {
                *optlen = std::mem::size_of::<libc::timeval>() as libc::socklen_t;
            }
            return 0;
        }
    }
    table::real_getsockopt()(fd, level, optname, optval, optlen)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fcntl_masks_user_visible_nonblock_but_keeps_kernel_fd_nonblocking() {
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        unsafe {
            let current = libc::fcntl(read_fd, libc::F_GETFL, 0);
            let rc = fcntl(read_fd, libc::F_SETFL, (current & !libc::O_NONBLOCK) as libc::c_long);
            assert_eq!(rc, 0);

            let user_visible = fcntl(read_fd, libc::F_GETFL, 0);
            assert_eq!(user_visible & libc::O_NONBLOCK, 0);

            let real_flags = table::real_fcntl()(read_fd, libc::F_GETFL, 0);
            assert_ne!(real_flags & libc::O_NONBLOCK, 0);

            let mut buf = [0u8; 1];
            let n = libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1);
            assert_eq!(n, -1);
            assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EAGAIN));
        }
        nix::unistd::close(read_fd).ok();
        nix::unistd::close(write_fd).ok();
    }
}
