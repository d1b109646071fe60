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

//! Crate-wide error type.
//!
//! The hook layer never raises across the FFI boundary (see `hook`); this
//! type is for the embedding API (`Scheduler`, `IOManager`, `Fiber`) where
//! ordinary `Result` propagation applies.

use std::io;
use std::os::unix::io::RawFd;

use crate::iomanager::Event;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("operation timed out")]
    TimedOut,

    #[error("bad file descriptor")]
    BadFileDescriptor,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("fd {fd} event {event:?} is already armed")]
    AlreadyArmed { fd: RawFd, event: Event },

    #[error("contract violation: {0}")]
    Contract(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::TimedOut => io::Error::from_raw_os_error(libc::ETIMEDOUT),
            Error::BadFileDescriptor => io::Error::from_raw_os_error(libc::EBADF),
            Error::Io(e) => e,
            Error::AlreadyArmed { .. } => io::Error::from_raw_os_error(libc::EINVAL),
            Error::Contract(_) => io::Error::from_raw_os_error(libc::EINVAL),
        }
    }
}
