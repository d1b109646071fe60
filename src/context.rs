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

//! Raw register-context switching.
//!
//! `swap`/`make` are the two primitives spec.md §4.1 asks for. Rather than
//! hand-rolling an assembly trampoline (what the teacher crate did via a
//! `build.rs`-compiled `ctxswtch.S`, long bit-rotted on modern toolchains),
//! this builds on the platform's `ucontext` family through `libc`, exactly
//! the "hand-rolled ucontext-equivalent" fallback spec.md §9 sanctions.

use std::mem;

use crate::stack::Stack;

/// Signature `makecontext` actually invokes: its varargs are `int`s, so a
/// pointer-width argument has to be split across two of them.
pub type EntryFn = extern "C" fn(libc::c_int, libc::c_int);

/// Reassemble the `usize` argument `Context::new` split across the two
/// `int`s `EntryFn` receives.
#[inline]
pub fn combine_arg(hi: libc::c_int, lo: libc::c_int) -> usize {
    ((hi as u32 as usize) << 32) | (lo as u32 as usize)
}

#[derive(Debug)]
pub struct Context {
    ctx: Box<libc::ucontext_t>,
}

unsafe impl Send for Context {}

impl Context {
    /// An empty context, only ever used as a `swap()` target for the very
    /// first switch *out of* the thread's native stack (the main coroutine).
    pub fn empty() -> Context {
        Context {
            ctx: Box::new(unsafe { mem::zeroed() }),
        }
    }

    /// Build a context that, when first switched to, calls `entry(hi, lo)`
    /// on `stack`, where `combine_arg(hi, lo) == arg`. `entry` must never
    /// return — the fiber trampoline always swaps back out instead.
    pub fn new(stack: &Stack, entry: EntryFn, arg: usize) -> Context {
        let mut ctx: Box<libc::ucontext_t> = Box::new(unsafe { mem::zeroed() });

        unsafe {
            libc::getcontext(ctx.as_mut());
        }

        ctx.uc_stack.ss_sp = stack.bottom() as *mut libc::c_void;
        ctx.uc_stack.ss_size = stack.usable_len();
        ctx.uc_link = std::ptr::null_mut();

        let hi = (arg >> 32) as u32 as libc::c_int;
        let lo = (arg & 0xffff_ffff) as u32 as libc::c_int;

        unsafe {
            let entry_fn: extern "C" fn() = mem::transmute(entry);
            libc::makecontext(ctx.as_mut(), entry_fn, 2, hi, lo);
        }

        log::debug!("created call frame, entry {:#x}, arg {:#x}", entry as usize, arg);
        Context { ctx }
    }

    /// Save the caller's registers into `from`, then load and resume `to`.
    /// Returns once some other context later swaps back into `from`.
    pub fn swap(from: &mut Context, to: &Context) {
        log::debug!("swapping contexts");
        unsafe {
            libc::swapcontext(from.ctx.as_mut(), to.ctx.as_ref());
        }
    }
}
