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

//! In-process tunables.
//!
//! The full system reads these from an external dynamic-config subsystem
//! (see the crate-level docs). That subsystem is out of scope here; this
//! module is the narrow surface the core actually consults, resolved once
//! from environment variables over compiled-in defaults.

use std::sync::OnceLock;

const DEFAULT_FIBER_STACK_SIZE: usize = 1024 * 1024;
const DEFAULT_TCP_CONNECT_TIMEOUT_MS: i32 = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct Config {
    fiber_stack_size: usize,
    tcp_connect_timeout_ms: i32,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    /// Process-wide config, lazily resolved on first access and fixed for
    /// the lifetime of the process.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(Config::from_env)
    }

    fn from_env() -> Config {
        let fiber_stack_size = env_usize("HYPERFIBER_FIBER_STACK_SIZE")
            .unwrap_or(DEFAULT_FIBER_STACK_SIZE);
        let tcp_connect_timeout_ms = env_i32("HYPERFIBER_TCP_CONNECT_TIMEOUT_MS")
            .unwrap_or(DEFAULT_TCP_CONNECT_TIMEOUT_MS);

        log::info!(
            "config resolved: fiber_stack_size={}, tcp_connect_timeout_ms={}",
            fiber_stack_size,
            tcp_connect_timeout_ms
        );
        Config {
            fiber_stack_size,
            tcp_connect_timeout_ms,
        }
    }

    pub fn fiber_stack_size(&self) -> usize {
        self.fiber_stack_size
    }

    pub fn tcp_connect_timeout_ms(&self) -> i32 {
        self.tcp_connect_timeout_ms
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_i32(key: &str) -> Option<i32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_without_env() {
        // Only valid when the env vars are unset in the test process;
        // don't assert on the singleton since other tests may have raced
        // Config::get() first. Exercise the pure constructor instead.
        let cfg = Config {
            fiber_stack_size: DEFAULT_FIBER_STACK_SIZE,
            tcp_connect_timeout_ms: DEFAULT_TCP_CONNECT_TIMEOUT_MS,
        };
        assert_eq!(cfg.fiber_stack_size(), 1024 * 1024);
        assert_eq!(cfg.tcp_connect_timeout_ms(), 10_000);
    }
}
