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

//! End-to-end scenarios against a live `IOManager`.
//!
//! `Fiber::total_live()` is a single process-wide counter, so the tests
//! that check it assume `cargo test` is run with `--test-threads=1` for
//! this binary (or that it happens to be the only live-fiber-sensitive
//! test executing at the time) — otherwise a concurrently running test's
//! in-flight fibers shift the before/after delta.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use hyperfiber::config::Config;
use hyperfiber::iomanager::{Event, IOManager};
use hyperfiber::{fiber, scheduler};

/// `RUST_LOG=debug cargo test` surfaces the `log` traffic every module
/// emits; harmless to call more than once across tests in this binary.
fn init_logging() {
    let _ = env_logger::try_init();
}

/// Two coroutines sleeping on a single-threaded manager run concurrently,
/// not sequentially: B's 300ms sleep overlaps A's 200ms one.
#[test]
fn two_sleeps_one_worker_run_concurrently() {
    init_logging();
    let mgr = IOManager::new("two-sleeps", 1).unwrap();
    mgr.start();

    let start = Instant::now();
    let t_a = Arc::new(Mutex::new(None));
    let t_b = Arc::new(Mutex::new(None));

    let ta = t_a.clone();
    let mgr_a = mgr.clone();
    let fiber_a = fiber::Fiber::spawn(
        move || {
            let timers = mgr_a.timers();
            let handle = fiber::Fiber::current().unwrap();
            let mgr_for_timer = mgr_a.clone();
            timers.add(200, move || mgr_for_timer.schedule_fiber(handle.clone(), None));
            fiber::Fiber::yield_hold();
            *ta.lock().unwrap() = Some(start.elapsed());
        },
        64 * 1024,
    )
    .unwrap();

    let tb = t_b.clone();
    let mgr_b = mgr.clone();
    let fiber_b = fiber::Fiber::spawn(
        move || {
            let timers = mgr_b.timers();
            let handle = fiber::Fiber::current().unwrap();
            let mgr_for_timer = mgr_b.clone();
            timers.add(300, move || mgr_for_timer.schedule_fiber(handle.clone(), None));
            fiber::Fiber::yield_hold();
            *tb.lock().unwrap() = Some(start.elapsed());
        },
        64 * 1024,
    )
    .unwrap();

    mgr.schedule_fiber(fiber_a, None);
    mgr.schedule_fiber(fiber_b, None);

    // Poll instead of a fixed sleep so the assertion can't flake shorter.
    let deadline = Instant::now() + Duration::from_secs(2);
    while (t_a.lock().unwrap().is_none() || t_b.lock().unwrap().is_none()) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    let total = start.elapsed();
    mgr.stop();

    let ta = t_a.lock().unwrap().expect("A never finished");
    let tb = t_b.lock().unwrap().expect("B never finished");
    let delta = tb.as_millis() as i64 - ta.as_millis() as i64;
    assert!((delta - 100).abs() < 80, "t_B - t_A = {}ms, expected ~100ms", delta);
    assert!(total < Duration::from_millis(500), "total runtime {:?} looks sequential", total);
}

/// `connect()` to an address known to black-hole SYNs should time out at
/// the configured bound, not hang indefinitely. Drives the same
/// `add_event`/timer machinery the hooked `connect` uses, without going
/// through the hooked symbol itself (which would collide with this test
/// binary's own use of `libc::connect`).
#[test]
fn connect_timeout_fires_at_configured_bound() {
    init_logging();
    // Only this test reads `Config` in this binary, so setting the env var
    // ahead of the first `Config::get()` call is race-free; the singleton
    // caches it process-wide after that.
    std::env::set_var("HYPERFIBER_TCP_CONNECT_TIMEOUT_MS", "100");
    let timeout_ms = Config::get().tcp_connect_timeout_ms() as u64;
    let mgr = IOManager::new("connect-timeout", 1).unwrap();
    mgr.start();

    let (tx, rx) = std::sync::mpsc::channel();
    let mgr2 = mgr.clone();
    let fib = fiber::Fiber::spawn(
        move || {
            let start = Instant::now();
            let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
            hyperfiber::fd_manager::get_or_create(fd, true);
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL, 0);
                libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
            }

            let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
            addr.sin_family = libc::AF_INET as libc::sa_family_t;
            addr.sin_port = 1u16.to_be();
            addr.sin_addr.s_addr = u32::from_be_bytes([240, 0, 0, 1]).to_be();

            let rc = unsafe {
                libc::connect(
                    fd,
                    &addr as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            };
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);

            let result = if rc == 0 {
                (0i32, 0i32, start.elapsed())
            } else if errno == libc::EINPROGRESS {
                let timed_out = Arc::new(std::sync::atomic::AtomicBool::new(false));
                let flag = timed_out.clone();
                let mgr3 = mgr2.clone();
                let timer = mgr2.timers().add(timeout_ms, move || {
                    flag.store(true, Ordering::SeqCst);
                    let _ = mgr3.cancel_event(fd, Event::WRITE);
                });
                mgr2.add_event(fd, Event::WRITE, None, None).unwrap();
                fiber::Fiber::yield_hold();
                timer.cancel();
                if timed_out.load(Ordering::SeqCst) {
                    (-1, libc::ETIMEDOUT, start.elapsed())
                } else {
                    (0, 0, start.elapsed())
                }
            } else {
                (-1, errno, start.elapsed())
            };
            unsafe {
                libc::close(fd);
            }
            tx.send(result).unwrap();
        },
        64 * 1024,
    )
    .unwrap();
    mgr.schedule_fiber(fib, None);

    let (rc, errno, elapsed) = rx.recv_timeout(Duration::from_secs(30)).unwrap();
    mgr.stop();

    assert_eq!(rc, -1);
    assert_eq!(errno, libc::ETIMEDOUT);
    assert!(
        elapsed.as_millis() >= (timeout_ms as u128).saturating_sub(30)
            && elapsed.as_millis() <= timeout_ms as u128 + 2000,
        "elapsed = {:?}, configured timeout = {}ms",
        elapsed,
        timeout_ms
    );
}

/// A socketpair echo: the reader suspends until the writer's delayed write
/// lands, and no fiber or scheduled task is left behind afterward.
#[test]
fn socketpair_echo_wakes_reader_exactly_once() {
    init_logging();
    let mgr = IOManager::new("echo", 2).unwrap();
    mgr.start();

    let mut fds = [0i32; 2];
    let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    assert_eq!(rc, 0);
    let [read_fd, write_fd] = fds;
    for fd in [read_fd, write_fd] {
        hyperfiber::fd_manager::get_or_create(fd, true);
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    let live_before = fiber::Fiber::total_live();
    let (tx, rx) = std::sync::mpsc::channel();
    let mgr_r = mgr.clone();
    let reader = fiber::Fiber::spawn(
        move || {
            let mut buf = [0u8; 4];
            let mut got = 0usize;
            while got < 4 {
                let n = unsafe {
                    libc::read(
                        read_fd,
                        buf.as_mut_ptr().add(got) as *mut libc::c_void,
                        4 - got,
                    )
                };
                if n > 0 {
                    got += n as usize;
                } else {
                    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                    if errno == libc::EAGAIN {
                        mgr_r.add_event(read_fd, Event::READ, None, None).unwrap();
                        fiber::Fiber::yield_hold();
                    } else {
                        break;
                    }
                }
            }
            tx.send(buf).unwrap();
        },
        64 * 1024,
    )
    .unwrap();
    mgr.schedule_fiber(reader, None);

    let mgr_w = mgr.clone();
    mgr_w.timers().add(50, move || {
        unsafe {
            libc::write(write_fd, [1u8, 2, 3, 4].as_ptr() as *const libc::c_void, 4);
        }
    });

    let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(got, [1, 2, 3, 4]);

    std::thread::sleep(Duration::from_millis(20));
    mgr.stop();
    unsafe {
        libc::close(read_fd);
        libc::close(write_fd);
    }
    assert_eq!(fiber::Fiber::total_live(), live_before);
}

/// Closing the fd a coroutine is blocked reading from wakes that coroutine
/// promptly instead of leaving it parked forever — mirrors the order the
/// hooked `close()` uses: cancel the fd's armed events, then actually close
/// it, so the woken reader observes either EBADF (closed before it got to
/// run) or, in the race where it ran first, EAGAIN-and-retry-never-fires is
/// not possible since `cancel_event` always reschedules unconditionally.
#[test]
fn cancel_all_on_close_wakes_blocked_reader() {
    init_logging();
    let mgr = IOManager::new("cancel-close", 1).unwrap();
    mgr.start();

    let mut fds = [0i32; 2];
    unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) };
    let [read_fd, write_fd] = fds;
    hyperfiber::fd_manager::get_or_create(read_fd, true);
    unsafe {
        let flags = libc::fcntl(read_fd, libc::F_GETFL, 0);
        libc::fcntl(read_fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }

    let (tx, rx) = std::sync::mpsc::channel();
    let mgr_r = mgr.clone();
    let reader = fiber::Fiber::spawn(
        move || {
            mgr_r.add_event(read_fd, Event::READ, None, None).unwrap();
            fiber::Fiber::yield_hold();
            let mut buf = [0u8; 1];
            let n = unsafe { libc::read(read_fd, buf.as_mut_ptr() as *mut libc::c_void, 1) };
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            tx.send((n, errno)).unwrap();
        },
        64 * 1024,
    )
    .unwrap();
    mgr.schedule_fiber(reader, None);
    std::thread::sleep(Duration::from_millis(20));

    // Same order the hooked `close()` uses: cancel first, then close the fd
    // the reader is blocked on (not its peer).
    mgr.cancel_all(read_fd);
    unsafe {
        libc::close(read_fd);
    }

    let (n, errno) = rx.recv_timeout(Duration::from_millis(200)).unwrap();
    assert!(n == 0 || errno == libc::EBADF, "n={} errno={}", n, errno);

    mgr.stop();
    unsafe {
        libc::close(write_fd);
    }
}

/// A recurring timer firing every 50ms for ~525ms should land in [9, 11]
/// firings, matching the allowed jitter window.
#[test]
fn recurring_timer_fires_in_expected_range() {
    init_logging();
    let mgr = IOManager::new("recurring", 1).unwrap();
    mgr.start();

    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let handle = mgr.timers().add_recurring(50, move || {
        c.fetch_add(1, Ordering::SeqCst);
    });

    std::thread::sleep(Duration::from_millis(525));
    handle.cancel();
    mgr.stop();

    let n = count.load(Ordering::SeqCst);
    assert!((9..=11).contains(&n), "recurring timer fired {} times", n);
}

/// A 4-thread scheduler shut down after 1000 short tasks returns only once
/// every task has reached TERM, and the live-fiber counter is back to its
/// pre-test value.
#[test]
fn shutdown_is_deterministic_across_many_tasks() {
    init_logging();
    let sched = scheduler::Scheduler::new("shutdown-determinism", 4);
    sched.start();

    let live_before = fiber::Fiber::total_live();
    let completed = Arc::new(AtomicUsize::new(0));

    for _ in 0..1000 {
        let completed = completed.clone();
        let fib = fiber::Fiber::spawn(
            move || {
                std::thread::sleep(Duration::from_micros(200));
                completed.fetch_add(1, Ordering::SeqCst);
            },
            64 * 1024,
        )
        .unwrap();
        sched.schedule_fiber(fib, None);
    }

    sched.stop();

    assert_eq!(completed.load(Ordering::SeqCst), 1000);
    assert_eq!(fiber::Fiber::total_live(), live_before);
}

/// `stop()` called twice behaves the same as calling it once.
#[test]
fn stop_is_idempotent() {
    init_logging();
    let sched = scheduler::Scheduler::new("idempotent-stop", 2);
    sched.start();
    sched.schedule(|| {}, None);
    sched.stop();
    sched.stop();
}
