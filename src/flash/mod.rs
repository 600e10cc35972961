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

//! Low-level flash handling.
//!
//! Flash memory is presented as a linear byte address space. Memory can be
//! written from 1 to 0 at any bit level, but writing from 0 to 1 requires
//! erasing a whole sector. The record engine encodes every one of its state
//! transitions so that this rule is never violated.
//!
//! The [`Flash`] trait is the contract a media driver has to fulfil; the
//! [`RamFlash`] type is an emulator backing the trait with plain memory, used
//! by the store singletons and by the test suites.
//!
//! [`Flash`]: trait.Flash.html
//! [`RamFlash`]: struct.RamFlash.html

mod tests;

use std::sync::Arc;

use spin::Mutex;

/// Errors that can happen when performing IO on the flash.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum IOError {
    /// An address or range was given out of the bounds of the device.
    OutOfBounds,

    /// The device did not complete the operation in time.
    ///
    /// The engine treats this the same as any other IO failure; it neither
    /// retries nor hides it.
    Timeout,
}

/// Contract for a byte-addressed flash device.
///
/// Writes must AND the supplied bytes into the existing contents: writing
/// over unmodified `0xFF` bytes is equivalent to a copy, writing a 0 over a 0
/// is a no-op, and writing a 1 over a 0 is allowed to silently leave the 0.
pub trait Flash {
    /// Returns the size of the device in bytes.
    fn capacity(&self) -> u32;

    /// Reads `buf.len()` bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Errors if the requested range exceeds the device capacity, in which
    /// case `buf` is left untouched.
    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), IOError>;

    /// ANDs `data` into the device contents starting at `addr`.
    ///
    /// # Errors
    ///
    /// Errors if the requested range exceeds the device capacity, in which
    /// case nothing is written.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), IOError>;

    /// Sets every byte in `[start, end)` to `0xFF`.
    ///
    /// `end` is clamped to the device capacity.
    ///
    /// # Errors
    ///
    /// Errors if `start` is past the end of the device or past `end`.
    fn erase(&mut self, start: u32, end: u32) -> Result<(), IOError>;
}

/// RAM-backed flash emulator.
///
/// The backing array is shared between clones, so several handles can alias
/// the same emulated device the way several drivers would share one bus. A
/// fresh device comes up fully erased.
#[derive(Clone)]
pub struct RamFlash {
    /// Backing memory, shared between all handles on the device
    mem: Arc<Mutex<Vec<u8>>>,
}

impl RamFlash {
    /// Creates an erased device of `capacity` bytes.
    pub fn new(capacity: u32) -> RamFlash {
        RamFlash {
            mem: Arc::new(Mutex::new(vec![0xFF; capacity as usize])),
        }
    }

    /// Overwrites bytes verbatim, bypassing the AND discipline.
    ///
    /// Emulates an external actor corrupting the media; only the test suites
    /// have a use for it.
    #[cfg(test)]
    pub fn poke(&self, addr: u32, data: &[u8]) {
        let mut mem = self.mem.lock();
        let addr = addr as usize;
        mem[addr..addr + data.len()].copy_from_slice(data);
    }
}

impl Flash for RamFlash {
    fn capacity(&self) -> u32 {
        self.mem.lock().len() as u32
    }

    fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), IOError> {
        let mem = self.mem.lock();
        let addr = addr as usize;
        if addr + buf.len() > mem.len() {
            return err!(IOError::OutOfBounds);
        }
        buf.copy_from_slice(&mem[addr..addr + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), IOError> {
        let mut mem = self.mem.lock();
        let addr = addr as usize;
        if addr + data.len() > mem.len() {
            return err!(IOError::OutOfBounds);
        }
        for (i, &b) in data.iter().enumerate() {
            mem[addr + i] &= b;
        }
        Ok(())
    }

    fn erase(&mut self, start: u32, end: u32) -> Result<(), IOError> {
        let mut mem = self.mem.lock();
        let (start, mut end) = (start as usize, end as usize);
        if start >= mem.len() || end < start {
            return err!(IOError::OutOfBounds);
        }
        if end > mem.len() {
            end = mem.len();
        }
        for b in &mut mem[start..end] {
            *b = 0xFF;
        }
        Ok(())
    }
}
