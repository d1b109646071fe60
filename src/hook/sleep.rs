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

//! `sleep`/`usleep`/`nanosleep`: turned into a timer-driven yield instead
//! of a blocking syscall so a sleeping fiber never parks its OS thread.

use super::{global_io_manager, is_enabled, table};
use crate::fiber;

fn sleep_ms(ms: u64) {
    let Some(mgr) = global_io_manager() else {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    };
    let Some(handle) = fiber::Fiber::current() else {
        std::thread::sleep(std::time::Duration::from_millis(ms));
        return;
    };

    let mgr_for_timer = mgr.clone();
    mgr.timers().add(ms, move || {
        mgr_for_timer.schedule_fiber(handle.clone(), None);
    });
    fiber::Fiber::yield_hold();
}

#[no_mangle]
pub unsafe extern "C" fn sleep(seconds: libc::c_uint) -> libc::c_uint {
    if !is_enabled() {
        return table::real_sleep()(seconds);
    }
    sleep_ms(seconds as u64 * 1000);
    0
}

#[no_mangle]
pub unsafe extern "C" fn usleep(useconds: libc::c_uint) -> libc::c_int {
    if !is_enabled() {
        return table::real_usleep()(useconds);
    }
    sleep_ms((useconds as u64) / 1000);
    0
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(req: *const libc::timespec, rem: *mut libc::timespec) -> libc::c_int {
    if !is_enabled() || req.is_null() {
        return table::real_nanosleep()(req, rem);
    }
    let req = &*req;
    let ms = (req.tv_sec as u64) * 1000 + (req.tv_nsec as u64) / 1_000_000;
    sleep_ms(ms);
    if !rem.is_null() {
        (*rem).tv_sec = 0;
        (*rem).tv_nsec = 0;
    }
    0
}
