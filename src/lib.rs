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

//! A userland, high-concurrency I/O runtime for Linux: stackful coroutines
//! scheduled cooperatively across a thread pool, an epoll-based reactor
//! that suspends a coroutine instead of blocking its thread on I/O, and a
//! syscall interception layer that makes ordinary-looking blocking POSIX
//! calls (`read`, `accept`, `sleep`, ...) do exactly that transparently.
//!
//! Two ways to use this crate:
//!
//! - As a library (the `rlib` target): build an [`IOManager`], spawn
//!   [`Fiber`]s or plain callbacks onto it with [`Scheduler::schedule`]/
//!   [`Scheduler::schedule_fiber`], and call [`IOManager::add_event`] from
//!   inside a fiber to suspend it on fd readiness.
//! - As an `LD_PRELOAD` shim (the `cdylib` target): every hooked libc
//!   symbol in [`hook`] suspends the calling fiber automatically, so
//!   existing blocking-style code runs unmodified as long as it executes
//!   inside a fiber scheduled on this crate's runtime.
//!
//! Dynamic tuning (stack size, connect timeouts, ...) is resolved once at
//! startup by [`config::Config`]; see that module's docs for the
//! environment variables it reads.

pub mod config;
pub mod context;
pub mod error;
pub mod fd_manager;
pub mod fiber;
pub mod hook;
pub mod iomanager;
pub mod scheduler;
pub mod stack;
pub mod timer;

pub use error::{Error, Result};
pub use fiber::{Fiber, State as FiberState};
pub use iomanager::{Event, IOManager};
pub use scheduler::{Scheduler, Task};
pub use timer::{TimerHandle, TimerManager};

/// Spawn a fiber running `entry` with the default stack size from
/// [`config::Config`], ready to be handed to a scheduler.
pub fn spawn<F>(entry: F) -> Result<fiber::Handle>
where
    F: FnOnce() + Send + 'static,
{
    Fiber::spawn(entry, config::Config::get().fiber_stack_size())
}
