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

//! epoll-based reactor.
//!
//! `IOManager` folds an event loop into the scheduler's run loop by
//! implementing `scheduler::Hooks`: `idle()` blocks in `epoll_wait` instead
//! of parking on a condvar, and a ready fd reschedules whatever fiber or
//! callback was waiting on it. A self-pipe wakes a blocked `epoll_wait`
//! whenever new work lands on the scheduler queue from another thread.
//! Ported from the original reactor's `IOManager`/`FdContext`.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use log::{debug, error, warn};
use nix::sys::epoll::{epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp};
use nix::unistd::{close, pipe, read, write};
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::fiber;
use crate::scheduler::{Hooks, Scheduler};
use crate::timer::TimerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Event(u32);

impl Event {
    pub const NONE: Event = Event(0);
    pub const READ: Event = Event(0b01);
    pub const WRITE: Event = Event(0b10);

    pub fn contains(self, other: Event) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    fn to_epoll(self) -> EpollFlags {
        let mut flags = EpollFlags::empty();
        if self.contains(Event::READ) {
            flags |= EpollFlags::EPOLLIN;
        }
        if self.contains(Event::WRITE) {
            flags |= EpollFlags::EPOLLOUT;
        }
        flags
    }
}

impl std::ops::BitOr for Event {
    type Output = Event;
    fn bitor(self, rhs: Event) -> Event {
        Event(self.0 | rhs.0)
    }
}

impl std::ops::BitAndAssign for Event {
    fn bitand_assign(&mut self, rhs: Event) {
        self.0 &= rhs.0;
    }
}

impl std::ops::Not for Event {
    type Output = Event;
    fn not(self) -> Event {
        Event(!self.0 & 0b11)
    }
}

enum Waiter {
    Fiber(fiber::Handle),
    Callback(Box<dyn FnOnce() + Send>),
}

struct EventSlot {
    waiter: Option<Waiter>,
    thread: Option<usize>,
}

impl EventSlot {
    fn empty() -> EventSlot {
        EventSlot {
            waiter: None,
            thread: None,
        }
    }
}

struct FdContext {
    fd: RawFd,
    armed: Event,
    read: EventSlot,
    write: EventSlot,
}

impl FdContext {
    fn slot_mut(&mut self, event: Event) -> &mut EventSlot {
        if event == Event::READ {
            &mut self.read
        } else {
            &mut self.write
        }
    }
}

struct Core {
    epoll_fd: RawFd,
    tickle_read: RawFd,
    tickle_write: RawFd,
    fd_contexts: Mutex<Vec<Option<Box<FdContext>>>>,
    pending_events: AtomicUsize,
    timers: TimerManager,
}

impl Core {
    fn new() -> Result<Core> {
        let epoll_fd = epoll_create1(EpollCreateFlags::empty()).map_err(io_err)?;
        let (tickle_read, tickle_write) = pipe().map_err(io_err)?;
        nix::fcntl::fcntl(
            tickle_read,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .map_err(io_err)?;

        let mut ev = EpollEvent::new(EpollFlags::EPOLLIN, tickle_read as u64);
        epoll_ctl(epoll_fd, EpollOp::EpollCtlAdd, tickle_read, Some(&mut ev)).map_err(io_err)?;

        debug!("reactor core created: epoll_fd={}, tickle pipe=({}, {})", epoll_fd, tickle_read, tickle_write);
        Ok(Core {
            epoll_fd,
            tickle_read,
            tickle_write,
            fd_contexts: Mutex::new(Vec::new()),
            pending_events: AtomicUsize::new(0),
            timers: TimerManager::new(),
        })
    }

    fn ensure_context(fds: &mut Vec<Option<Box<FdContext>>>, fd: RawFd) -> &mut Box<FdContext> {
        let idx = fd as usize;
        if idx >= fds.len() {
            let new_len = (fds.len() * 3 / 2).max(idx + 1);
            fds.resize_with(new_len, || None);
        }
        if fds[idx].is_none() {
            fds[idx] = Some(Box::new(FdContext {
                fd,
                armed: Event::NONE,
                read: EventSlot::empty(),
                write: EventSlot::empty(),
            }));
        }
        fds[idx].as_mut().unwrap()
    }

    fn drain_tickle_pipe(&self) {
        let mut buf = [0u8; 256];
        loop {
            match read(self.tickle_read, &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(nix::errno::Errno::EAGAIN) => break,
                Err(_) => break,
            }
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        let _ = close(self.epoll_fd);
        let _ = close(self.tickle_read);
        let _ = close(self.tickle_write);
    }
}

fn io_err(e: nix::errno::Errno) -> Error {
    Error::Io(std::io::Error::from(e))
}

struct ReactorHooks {
    core: Arc<Core>,
    scheduler: OnceLock<Weak<Scheduler>>,
}

impl ReactorHooks {
    fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.get().and_then(Weak::upgrade)
    }

    fn schedule_waiter(&self, sched: &Arc<Scheduler>, slot: EventSlot) {
        match slot.waiter {
            Some(Waiter::Fiber(handle)) => sched.schedule_fiber(handle, slot.thread),
            Some(Waiter::Callback(cb)) => sched.schedule(cb, slot.thread),
            None => {}
        }
    }
}

impl Hooks for ReactorHooks {
    fn tickle(&self) {
        let _ = write(self.core.tickle_write, &[1u8]);
    }

    fn has_more_work(&self) -> bool {
        self.core.pending_events.load(Ordering::SeqCst) > 0
    }

    fn idle(&self) {
        let mut events: [EpollEvent; 256] = [EpollEvent::empty(); 256];
        let timeout_ms = self
            .core
            .timers
            .next_timeout_ms()
            .map(|ms| ms.min(5_000) as isize)
            .unwrap_or(5_000);

        let n = match epoll_wait(self.core.epoll_fd, &mut events, timeout_ms as isize) {
            Ok(n) => n,
            Err(nix::errno::Errno::EINTR) => return,
            Err(e) => {
                error!("epoll_wait on fd {} failed: {}", self.core.epoll_fd, e);
                return;
            }
        };

        let due = self.core.timers.collect_expired();
        if !due.is_empty() {
            if let Some(sched) = self.scheduler() {
                for mut cb in due {
                    sched.schedule(move || cb(), None);
                }
            }
        }

        let Some(sched) = self.scheduler() else {
            return;
        };

        for ev in &events[..n] {
            let fd = ev.data() as RawFd;
            if fd == self.core.tickle_read {
                self.core.drain_tickle_pipe();
                continue;
            }

            let flags = ev.events();
            let mut ready = Event::NONE;
            if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                ready = ready | Event::READ;
            }
            if flags.intersects(EpollFlags::EPOLLOUT | EpollFlags::EPOLLERR | EpollFlags::EPOLLHUP) {
                ready = ready | Event::WRITE;
            }

            let mut fds = self.core.fd_contexts.lock();
            let Some(ctx) = fds.get_mut(fd as usize).and_then(|s| s.as_mut()) else {
                continue;
            };

            let mut fired = Vec::new();
            for event in [Event::READ, Event::WRITE] {
                if ready.contains(event) && ctx.armed.contains(event) {
                    ctx.armed &= !event;
                    let slot = std::mem::replace(ctx.slot_mut(event), EventSlot::empty());
                    fired.push(slot);
                    self.core.pending_events.fetch_sub(1, Ordering::SeqCst);
                }
            }

            if ctx.armed.is_none() {
                let _ = epoll_ctl(self.core.epoll_fd, EpollOp::EpollCtlDel, fd, None);
            } else {
                let mut epev = EpollEvent::new(ctx.armed.to_epoll(), fd as u64);
                let _ = epoll_ctl(self.core.epoll_fd, EpollOp::EpollCtlMod, fd, Some(&mut epev));
            }
            drop(fds);

            for slot in fired {
                self.schedule_waiter(&sched, slot);
            }
        }
    }
}

/// The I/O reactor: a scheduler whose idle loop is an epoll wait instead of
/// a condvar park.
pub struct IOManager {
    scheduler: Arc<Scheduler>,
    core: Arc<Core>,
}

impl IOManager {
    pub fn new(name: impl Into<String>, thread_count: usize) -> Result<Arc<IOManager>> {
        let core = Arc::new(Core::new()?);
        let hooks = Arc::new(ReactorHooks {
            core: core.clone(),
            scheduler: OnceLock::new(),
        });
        let scheduler = Scheduler::with_hooks(name, thread_count, Some(hooks.clone() as Arc<dyn Hooks>));
        let _ = hooks.scheduler.set(Arc::downgrade(&scheduler));

        let mgr = Arc::new(IOManager { scheduler, core });
        crate::hook::bind_io_manager(mgr.clone());
        Ok(mgr)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn start(&self) {
        self.scheduler.start();
    }

    pub fn stop(&self) {
        self.scheduler.stop();
    }

    pub fn schedule<F>(&self, cb: F, thread: Option<usize>)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.schedule(cb, thread);
    }

    pub fn schedule_fiber(&self, handle: fiber::Handle, thread: Option<usize>) {
        self.scheduler.schedule_fiber(handle, thread);
    }

    /// Arm `event` on `fd`. With `cb` absent, the currently executing
    /// fiber is captured as the waiter; the caller must `Fiber::yield_hold()`
    /// immediately after this returns. Returns `AlreadyArmed` if `event` is
    /// already registered on `fd` — callers must `del_event`/`cancel_event`
    /// first rather than relying on an implicit upgrade.
    pub fn add_event(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<Box<dyn FnOnce() + Send>>,
        thread: Option<usize>,
    ) -> Result<()> {
        let waiter = match cb {
            Some(cb) => Waiter::Callback(cb),
            None => {
                let handle = fiber::Fiber::current()
                    .ok_or(Error::Contract("add_event with no callback requires a running fiber"))?;
                Waiter::Fiber(handle)
            }
        };

        let mut fds = self.core.fd_contexts.lock();
        let ctx = Core::ensure_context(&mut fds, fd);

        if ctx.armed.contains(event) {
            warn!("add_event: fd {} event {:?} is already armed", fd, event);
            return Err(Error::AlreadyArmed { fd, event });
        }

        let op = if ctx.armed.is_none() {
            EpollOp::EpollCtlAdd
        } else {
            EpollOp::EpollCtlMod
        };
        ctx.armed = ctx.armed | event;
        let mut epev = EpollEvent::new(ctx.armed.to_epoll(), fd as u64);
        epoll_ctl(self.core.epoll_fd, op, fd, Some(&mut epev)).map_err(io_err)?;

        *ctx.slot_mut(event) = EventSlot {
            waiter: Some(waiter),
            thread,
        };
        self.core.pending_events.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Disarm `event` on `fd` without running its waiter.
    pub fn del_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let mut fds = self.core.fd_contexts.lock();
        let Some(ctx) = fds.get_mut(fd as usize).and_then(|s| s.as_mut()) else {
            return Ok(());
        };
        if !ctx.armed.contains(event) {
            return Ok(());
        }

        ctx.armed &= !event;
        *ctx.slot_mut(event) = EventSlot::empty();
        self.core.pending_events.fetch_sub(1, Ordering::SeqCst);

        if ctx.armed.is_none() {
            let _ = epoll_ctl(self.core.epoll_fd, EpollOp::EpollCtlDel, fd, None);
        } else {
            let mut epev = EpollEvent::new(ctx.armed.to_epoll(), fd as u64);
            epoll_ctl(self.core.epoll_fd, EpollOp::EpollCtlMod, fd, Some(&mut epev)).map_err(io_err)?;
        }
        Ok(())
    }

    /// Disarm `event` on `fd` and immediately reschedule its waiter, as if
    /// the event had fired — used to wake a fiber blocked on an fd that's
    /// being torn down out from under it.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> Result<()> {
        let slot = {
            let mut fds = self.core.fd_contexts.lock();
            let Some(ctx) = fds.get_mut(fd as usize).and_then(|s| s.as_mut()) else {
                return Ok(());
            };
            if !ctx.armed.contains(event) {
                return Ok(());
            }
            ctx.armed &= !event;
            let slot = std::mem::replace(ctx.slot_mut(event), EventSlot::empty());
            self.core.pending_events.fetch_sub(1, Ordering::SeqCst);

            if ctx.armed.is_none() {
                let _ = epoll_ctl(self.core.epoll_fd, EpollOp::EpollCtlDel, fd, None);
            } else {
                let mut epev = EpollEvent::new(ctx.armed.to_epoll(), fd as u64);
                let _ = epoll_ctl(self.core.epoll_fd, EpollOp::EpollCtlMod, fd, Some(&mut epev));
            }
            slot
        };

        match slot.waiter {
            Some(Waiter::Fiber(handle)) => self.scheduler.schedule_fiber(handle, slot.thread),
            Some(Waiter::Callback(cb)) => self.scheduler.schedule(cb, slot.thread),
            None => {}
        }
        Ok(())
    }

    /// Cancel every armed event on `fd` and drop its context — called when
    /// `fd` is being closed.
    pub fn cancel_all(&self, fd: RawFd) {
        debug!("cancel_all: tearing down fd {}", fd);
        let _ = self.cancel_event(fd, Event::READ);
        let _ = self.cancel_event(fd, Event::WRITE);
        let mut fds = self.core.fd_contexts.lock();
        if let Some(slot) = fds.get_mut(fd as usize) {
            *slot = None;
        }
    }

    pub fn timers(&self) -> &TimerManager {
        &self.core.timers
    }

    pub fn pending_event_count(&self) -> usize {
        self.core.pending_events.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn wakes_a_fiber_on_fd_readability() {
        let mgr = IOManager::new("test-io", 2).unwrap();
        mgr.start();

        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        nix::fcntl::fcntl(
            read_fd,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .unwrap();

        let (tx, rx) = channel();
        let mgr2 = mgr.clone();
        let fib = fiber::Fiber::spawn(
            move || {
                mgr2.add_event(read_fd, Event::READ, None, None).unwrap();
                fiber::Fiber::yield_hold();
                let mut buf = [0u8; 1];
                nix::unistd::read(read_fd, &mut buf).unwrap();
                tx.send(buf[0]).unwrap();
            },
            64 * 1024,
        )
        .unwrap();
        mgr.schedule_fiber(fib, None);

        std::thread::sleep(Duration::from_millis(20));
        nix::unistd::write(write_fd, &[9u8]).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, 9);

        nix::unistd::close(read_fd).ok();
        nix::unistd::close(write_fd).ok();
        mgr.stop();
    }

    #[test]
    fn pending_event_count_tracks_armed_fd_direction_pairs() {
        let mgr = IOManager::new("test-io-pending", 1).unwrap();
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        nix::fcntl::fcntl(
            read_fd,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .unwrap();

        assert_eq!(mgr.pending_event_count(), 0);

        mgr.add_event(read_fd, Event::READ, Some(Box::new(|| {})), None)
            .unwrap();
        assert_eq!(mgr.pending_event_count(), 1);

        mgr.add_event(read_fd, Event::WRITE, Some(Box::new(|| {})), None)
            .unwrap();
        assert_eq!(mgr.pending_event_count(), 2);

        mgr.del_event(read_fd, Event::READ).unwrap();
        assert_eq!(mgr.pending_event_count(), 1);

        mgr.cancel_all(read_fd);
        assert_eq!(mgr.pending_event_count(), 0);

        nix::unistd::close(read_fd).ok();
        nix::unistd::close(write_fd).ok();
    }

    #[test]
    fn add_event_twice_without_clearing_is_rejected() {
        let mgr = IOManager::new("test-io-dup", 1).unwrap();
        let (read_fd, write_fd) = nix::unistd::pipe().unwrap();
        nix::fcntl::fcntl(
            read_fd,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )
        .unwrap();

        mgr.add_event(read_fd, Event::READ, Some(Box::new(|| {})), None)
            .unwrap();
        let second = mgr.add_event(read_fd, Event::READ, Some(Box::new(|| {})), None);
        assert!(matches!(second, Err(Error::AlreadyArmed { .. })));

        nix::unistd::close(read_fd).ok();
        nix::unistd::close(write_fd).ok();
    }
}
