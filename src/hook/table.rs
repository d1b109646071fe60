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

//! Resolution of the libc symbols the hook functions shadow.
//!
//! Each `real_*` accessor does a one-time `dlsym(RTLD_NEXT, ...)` lookup
//! and caches the address, exactly `HOOK_FUN`'s job in the original hook
//! layer's macro. `RTLD_NEXT` only makes sense when these symbols are
//! loaded ahead of libc on the search path (an `LD_PRELOAD`'d `cdylib`
//! build of this crate) — see the crate root docs.

use std::ffi::CString;
use std::sync::OnceLock;

macro_rules! real_fn {
    ($accessor:ident, $sym:literal, $ty:ty) => {
        pub fn $accessor() -> $ty {
            static ADDR: OnceLock<usize> = OnceLock::new();
            let addr = *ADDR.get_or_init(|| unsafe {
                let name = CString::new($sym).unwrap();
                let ptr = libc::dlsym(libc::RTLD_NEXT, name.as_ptr());
                assert!(!ptr.is_null(), concat!("dlsym could not resolve ", $sym));
                ptr as usize
            });
            unsafe { std::mem::transmute::<usize, $ty>(addr) }
        }
    };
}

pub type SleepFn = unsafe extern "C" fn(libc::c_uint) -> libc::c_uint;
pub type UsleepFn = unsafe extern "C" fn(libc::c_uint) -> libc::c_int;
pub type NanosleepFn = unsafe extern "C" fn(*const libc::timespec, *mut libc::timespec) -> libc::c_int;
pub type SocketFn = unsafe extern "C" fn(libc::c_int, libc::c_int, libc::c_int) -> libc::c_int;
pub type ConnectFn =
    unsafe extern "C" fn(libc::c_int, *const libc::sockaddr, libc::socklen_t) -> libc::c_int;
pub type AcceptFn =
    unsafe extern "C" fn(libc::c_int, *mut libc::sockaddr, *mut libc::socklen_t) -> libc::c_int;
pub type ReadFn = unsafe extern "C" fn(libc::c_int, *mut libc::c_void, libc::size_t) -> libc::ssize_t;
pub type WriteFn =
    unsafe extern "C" fn(libc::c_int, *const libc::c_void, libc::size_t) -> libc::ssize_t;
pub type RecvFn =
    unsafe extern "C" fn(libc::c_int, *mut libc::c_void, libc::size_t, libc::c_int) -> libc::ssize_t;
pub type SendFn =
    unsafe extern "C" fn(libc::c_int, *const libc::c_void, libc::size_t, libc::c_int) -> libc::ssize_t;
pub type CloseFn = unsafe extern "C" fn(libc::c_int) -> libc::c_int;
pub type FcntlFn = unsafe extern "C" fn(libc::c_int, libc::c_int, libc::c_long) -> libc::c_int;
pub type IoctlFn = unsafe extern "C" fn(libc::c_int, libc::c_ulong, libc::c_long) -> libc::c_int;
pub type SetsockoptFn = unsafe extern "C" fn(
    libc::c_int,
    libc::c_int,
    libc::c_int,
    *const libc::c_void,
    libc::socklen_t,
) -> libc::c_int;
pub type GetsockoptFn = unsafe extern "C" fn(
    libc::c_int,
    libc::c_int,
    libc::c_int,
    *mut libc::c_void,
    *mut libc::socklen_t,
) -> libc::c_int;

real_fn!(real_sleep, "sleep", SleepFn);
real_fn!(real_usleep, "usleep", UsleepFn);
real_fn!(real_nanosleep, "nanosleep", NanosleepFn);
real_fn!(real_socket, "socket", SocketFn);
real_fn!(real_connect, "connect", ConnectFn);
real_fn!(real_accept, "accept", AcceptFn);
real_fn!(real_read, "read", ReadFn);
real_fn!(real_write, "write", WriteFn);
real_fn!(real_recv, "recv", RecvFn);
real_fn!(real_send, "send", SendFn);
real_fn!(real_close, "close", CloseFn);
real_fn!(real_fcntl, "fcntl", FcntlFn);
real_fn!(real_ioctl, "ioctl", IoctlFn);
real_fn!(real_setsockopt, "setsockopt", SetsockoptFn);
real_fn!(real_getsockopt, "getsockopt", GetsockoptFn);
