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

//! Integer-keyed string table.
//!
//! A thin preset over the record engine for numbered strings (canned
//! messages, script fragments): keys are [`Key`] numbers widened to the
//! engine's four-byte integer discipline, values are strings of up to
//! [`LENGTH_MAX`] bytes.
//!
//! [`Key`]: type.Key.html
//! [`LENGTH_MAX`]: constant.LENGTH_MAX.html

mod tests;

use spin::Mutex;

use crate::dict::{Cursor, KeySpec};
use crate::flash::{Flash, RamFlash};
use crate::strsub;
use crate::vol::{Error, Volume, VolumeConfig};

/// A string table key.
pub type Key = u16;

/// Maximum length of a stored string.
pub const LENGTH_MAX: usize = 500;

/// Size of each string table sector.
pub const SECTOR_SIZE: u32 = 0x8000;

/// One slot: 8-byte header, 4-byte key, up to 500 value bytes.
const RECORD_SIZE: u16 = 512;

/// On-flash width of a key.
const KEY_SIZE: usize = 4;

/// Bucket count of the string table index.
const HASHSIZE: usize = 17;

/// On-flash layout version of the string table.
const VERSION: u16 = 1;

/// Integer-keyed string store over two flash sectors.
pub struct StrTab<F: Flash> {
    /// The record engine, behind the facade lock
    vol: Mutex<Volume<F>>,

    /// Position of the simple iterator; one client at a time
    it: Mutex<Option<Cursor>>,
}

/// Widens a table key to its on-flash representation.
fn key_of(key: Key) -> [u8; KEY_SIZE] {
    (key as u32).to_le_bytes()
}

/// Splits a raw record into the key number and the value bytes.
fn split_record(key_and_data: &[u8]) -> (Key, Vec<u8>) {
    let key = u32::from_le_bytes([
        key_and_data[0],
        key_and_data[1],
        key_and_data[2],
        key_and_data[3],
    ]) as Key;
    (key, key_and_data[KEY_SIZE..].to_vec())
}

impl<F: Flash> StrTab<F> {
    /// Binds a string table to a flash device, with its two sectors at the
    /// given addresses.
    pub fn new(name: &'static str, flash: F, sector1_addr: u32, sector2_addr: u32) -> StrTab<F> {
        let config = VolumeConfig {
            name,
            sector1_addr,
            sector2_addr,
            sector_size: SECTOR_SIZE,
            record_size: RECORD_SIZE,
            key_spec: KeySpec::U32,
            key_size: KEY_SIZE as u16,
            local_size: 0,
            hashsize: HASHSIZE,
            version: VERSION,
            write_cb: None,
        };
        StrTab {
            vol: Mutex::new(Volume::new(config, flash)),
            it: Mutex::new(None),
        }
    }

    /// Starts and loads the string table, resetting it first if the flash
    /// does not hold a valid one.
    pub fn start(&self) -> Result<(), Error> {
        let mut vol = self.vol.lock();
        if vol.validate().is_err() {
            debug!("Resetting string table volume");
            get!(vol.reset());
        } else {
            get!(vol.load());
        }
        Ok(())
    }

    /// Unloads the string table, freeing the index.
    pub fn stop(&self) {
        self.vol.lock().unload();
    }

    /// Erases the string table, yielding an empty one.
    pub fn erase(&self) -> Result<(), Error> {
        self.vol.lock().reset().map(|_| ())
    }

    /// Tells whether an entry exists for a key.
    pub fn valid(&self, key: Key) -> bool {
        self.vol.lock().record_status(&key_of(key)).is_ok()
    }

    /// Returns the length of the string stored for a key.
    pub fn length(&self, key: Key) -> Result<usize, Error> {
        let len = get!(self.vol.lock().record_head_length(&key_of(key))) as usize;
        Ok(len.saturating_sub(KEY_SIZE))
    }

    /// Copies the string stored for a key into `value`, truncating if it
    /// does not fit, and returns the number of bytes copied.
    pub fn get(&self, key: Key, value: &mut [u8]) -> Result<usize, Error> {
        let key_and_data = get!(self.vol.lock().record_get(&key_of(key)));
        let data = &key_and_data[KEY_SIZE.min(key_and_data.len())..];
        let n = data.len().min(value.len());
        value[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Creates or updates the string for a key.
    pub fn set(&self, key: Key, value: &[u8]) -> Result<(), Error> {
        if value.len() > LENGTH_MAX {
            return err!(Error::Param);
        }
        self.vol.lock().record_set(&key_of(key), value)
    }

    /// Deletes the string for a key.
    pub fn delete(&self, key: Key) -> Result<(), Error> {
        self.vol.lock().record_delete(&key_of(key))
    }

    /// Starts an iteration and returns the first key/string pair.
    ///
    /// The iteration position lives in the facade; only one client may
    /// iterate at a time.
    ///
    /// # Errors
    ///
    /// `Eof` on an empty table.
    pub fn first(&self) -> Result<(Key, Vec<u8>), Error> {
        let vol = self.vol.lock();
        let mut it = self.it.lock();
        *it = None;
        let (cur, key_and_data) = get!(vol.record_first());
        *it = Some(cur);
        Ok(split_record(&key_and_data))
    }

    /// Returns the next key/string pair of the running iteration.
    ///
    /// # Errors
    ///
    /// `Eof` past the last pair or when no iteration is running.
    pub fn next(&self) -> Result<(Key, Vec<u8>), Error> {
        let vol = self.vol.lock();
        let mut it = self.it.lock();
        let cur = (*it).ok_or(Error::Eof)?;
        match vol.record_next(cur) {
            Ok((cur, key_and_data)) => {
                *it = Some(cur);
                Ok(split_record(&key_and_data))
            }
            Err(e) => {
                *it = None;
                Err(e)
            }
        }
    }

    /// Dumps the string table state onto the application log.
    pub fn log_status(&self) {
        self.vol.lock().log_status(true);
    }
}

impl<F: Flash> strsub::Source for StrTab<F> {
    /// Resolves a bracketed decimal key to the string stored for it.
    fn replace(&self, key: &str) -> Option<String> {
        let key: Key = key.trim().parse().ok()?;
        let mut buf = [0u8; LENGTH_MAX];
        let n = self.get(key, &mut buf).ok()?;
        let text = &buf[..n];
        let end = text.iter().position(|&b| b == 0).unwrap_or(n);
        Some(String::from_utf8_lossy(&text[..end]).into_owned())
    }
}

lazy_static! {
    /// Process-wide string table over the RAM emulator, the configuration
    /// the host build runs with.
    pub static ref STRTAB: StrTab<RamFlash> =
        StrTab::new("strtab", RamFlash::new(2 * SECTOR_SIZE), 0, SECTOR_SIZE);
}
