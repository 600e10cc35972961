// The MIT License (MIT)
//
// Copyright (c) 2020, National Cybersecurity Agency of France (ANSSI)
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Tools to help debugging through the application log.
//!
//! Log lines go through a process-wide `slog` logger draining to the terminal.
//! In release builds the `release_max_level_warn` feature of `slog` compiles
//! the `debug!`-level traffic out entirely.

use std::io;
use std::panic::{RefUnwindSafe, UnwindSafe};
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};

use slog::Drain;
use spin::{Mutex, MutexGuard};

/// Set to `true` to disable debug output at runtime (used by the noisier
/// stress tests).
pub static DISABLE_DEBUG: AtomicBool = AtomicBool::new(false);

struct SafeDrain<D>(Mutex<D>); // Don't really know why this is required
impl<D: Drain> Drain for SafeDrain<D> {
    type Ok = D::Ok;
    type Err = D::Err;
    fn log(&self, r: &slog::Record, v: &slog::OwnedKVList) -> Result<D::Ok, D::Err> {
        self.0.lock().log(r, v)
    }
}
impl<D: Drain> UnwindSafe for SafeDrain<D> {}
impl<D: Drain> RefUnwindSafe for SafeDrain<D> {}

struct StdoutWriter;

impl io::Write for StdoutWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        print!(
            "{}",
            str::from_utf8(data).map_err(|x| io::Error::new(io::ErrorKind::InvalidData, x))?
        );
        Ok(data.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()
    }
}

lazy_static! {
    static ref LOGGER: Mutex<slog::Logger> = Mutex::new(slog::Logger::root(
        SafeDrain(Mutex::new(
            slog_term::CompactFormat::new(slog_term::PlainDecorator::new(StdoutWriter))
                .build()
                .fuse()
        )),
        slog::o!()
    ));
}

/// Returns a handle on the process-wide logger.
pub fn logger() -> MutexGuard<'static, slog::Logger> {
    LOGGER.lock()
}

/// Writes a line to the application log, unless [`DISABLE_DEBUG`] is set.
///
/// [`DISABLE_DEBUG`]: static.DISABLE_DEBUG.html
pub fn output_str(x: &str) {
    if !DISABLE_DEBUG.load(Ordering::SeqCst) {
        slog::debug!(&*logger(), "{}", x);
    }
}

/// Formats a message to the application log, `println!`-like.
#[macro_export]
macro_rules! debug {
    ($msg:expr) => {{
        $crate::debug::output_str($msg);
    }};
    ($fmt:expr, $($arg:tt)+) => {{
        $crate::debug::output_str(&::std::format!($fmt, $($arg)+));
    }};
}

/// Makes an error and add an error message to the application log at
/// evaluation time.
#[macro_export]
macro_rules! err {
    ($x:expr) => {{
        let e = $x;
        debug!("Error at {}:{}: {:?}", file!(), line!(), e);
        Err(e)
    }};
}

/// Forwards an error up (`try!`-like) while adding an error message to the
/// application log.
#[macro_export]
macro_rules! get {
    ($x:expr) => {{
        match $x {
            Ok(x) => x,
            Err(e) => {
                debug!("  Error at {}:{}: {:?}", file!(), line!(), e);
                Err(e)?
            }
        }
    }};
}
