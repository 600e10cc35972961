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

//! String-keyed configuration registry.
//!
//! A thin preset over the record engine: keys are strings of up to
//! [`KEY_LENGTH`] bytes, NUL-padded into a fixed-width binary key; values
//! are byte strings of up to [`VALUE_LENGTH_MAX`] bytes. One record slot
//! holds one key/value pair.
//!
//! Every operation serialises on a facade-level lock; the simple `first` /
//! `next` iteration additionally keeps its position in the facade and is
//! meant for one client at a time.
//!
//! [`KEY_LENGTH`]: constant.KEY_LENGTH.html
//! [`VALUE_LENGTH_MAX`]: constant.VALUE_LENGTH_MAX.html

mod tests;

use spin::Mutex;

use crate::dict::{Cursor, KeySpec};
use crate::flash::{Flash, RamFlash};
use crate::strsub;
use crate::vol::{Error, Volume, VolumeConfig};

/// Fixed on-flash width of a registry key.
pub const KEY_LENGTH: usize = 24;

/// Maximum length of a registry value.
pub const VALUE_LENGTH_MAX: usize = 224;

/// Size of each registry sector.
pub const SECTOR_SIZE: u32 = 0x8000;

/// One slot: 8-byte header, 24-byte key, 224-byte value.
const RECORD_SIZE: u16 = 256;

/// Bucket count of the registry index.
const HASHSIZE: usize = 53;

/// On-flash layout version of the registry.
const VERSION: u16 = 1;

/// String-keyed configuration store over two flash sectors.
pub struct Registry<F: Flash> {
    /// The record engine, behind the facade lock
    vol: Mutex<Volume<F>>,

    /// Position of the simple iterator; one client at a time
    it: Mutex<Option<Cursor>>,
}

/// NUL-pads a key string to its on-flash width.
fn key_of(id: &str) -> Result<[u8; KEY_LENGTH], Error> {
    if id.len() > KEY_LENGTH {
        return err!(Error::Param);
    }
    let mut key = [0u8; KEY_LENGTH];
    key[..id.len()].copy_from_slice(id.as_bytes());
    Ok(key)
}

/// Splits a raw record into the key string and the value bytes.
fn split_record(key_and_data: &[u8]) -> (String, Vec<u8>) {
    let key = &key_and_data[..KEY_LENGTH.min(key_and_data.len())];
    let end = key.iter().position(|&b| b == 0).unwrap_or(key.len());
    (
        String::from_utf8_lossy(&key[..end]).into_owned(),
        key_and_data[KEY_LENGTH.min(key_and_data.len())..].to_vec(),
    )
}

impl<F: Flash> Registry<F> {
    /// Binds a registry to a flash device, with its two sectors at the given
    /// addresses.
    pub fn new(name: &'static str, flash: F, sector1_addr: u32, sector2_addr: u32) -> Registry<F> {
        let config = VolumeConfig {
            name,
            sector1_addr,
            sector2_addr,
            sector_size: SECTOR_SIZE,
            record_size: RECORD_SIZE,
            key_spec: KeySpec::Binary(6),
            key_size: KEY_LENGTH as u16,
            local_size: 0,
            hashsize: HASHSIZE,
            version: VERSION,
            write_cb: None,
        };
        Registry {
            vol: Mutex::new(Volume::new(config, flash)),
            it: Mutex::new(None),
        }
    }

    /// Starts and loads the registry.
    ///
    /// If the flash does not hold a valid registry of the configured
    /// version, it is reset first - observable as the registry coming up
    /// empty.
    pub fn start(&self) -> Result<(), Error> {
        let mut vol = self.vol.lock();
        if vol.validate().is_err() {
            debug!("Resetting registry volume");
            get!(vol.reset());
        } else {
            get!(vol.load());
        }
        Ok(())
    }

    /// Unloads the registry, freeing the index.
    pub fn stop(&self) {
        self.vol.lock().unload();
    }

    /// Erases the registry, yielding an empty one.
    pub fn erase(&self) -> Result<(), Error> {
        self.vol.lock().reset().map(|_| ())
    }

    /// Checks whether a key holds a non-empty value.
    pub fn value_valid(&self, id: &str) -> bool {
        let key = match key_of(id) {
            Ok(key) => key,
            Err(_) => return false,
        };
        match self.vol.lock().record_get(&key) {
            Ok(key_and_data) => key_and_data.len() > KEY_LENGTH,
            Err(_) => false,
        }
    }

    /// Returns the length of the value stored for a key.
    pub fn value_length(&self, id: &str) -> Result<usize, Error> {
        let key = get!(key_of(id));
        let len = get!(self.vol.lock().record_head_length(&key)) as usize;
        Ok(len.saturating_sub(KEY_LENGTH))
    }

    /// Copies the value stored for a key into `value`, truncating if it does
    /// not fit, and returns the number of bytes copied.
    ///
    /// # Errors
    ///
    /// `NotFound` for an absent key, `Invalid` for a key holding an empty
    /// value.
    pub fn value_get(&self, id: &str, value: &mut [u8]) -> Result<usize, Error> {
        let key = get!(key_of(id));
        let key_and_data = get!(self.vol.lock().record_get(&key));
        if key_and_data.len() <= KEY_LENGTH {
            return err!(Error::Invalid);
        }
        let data = &key_and_data[KEY_LENGTH..];
        let n = data.len().min(value.len());
        value[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    /// Creates or updates the value for a key.
    pub fn value_set(&self, id: &str, value: &[u8]) -> Result<(), Error> {
        if value.len() > VALUE_LENGTH_MAX {
            return err!(Error::Param);
        }
        let key = get!(key_of(id));
        self.vol.lock().record_set(&key, value)
    }

    /// Deletes the value for a key.
    pub fn value_delete(&self, id: &str) -> Result<(), Error> {
        let key = get!(key_of(id));
        self.vol.lock().record_delete(&key)
    }

    /// Starts an iteration and returns the first key/value pair.
    ///
    /// The iteration position lives in the facade; only one client may
    /// iterate at a time.
    ///
    /// # Errors
    ///
    /// `Eof` on an empty registry.
    pub fn first(&self) -> Result<(String, Vec<u8>), Error> {
        let vol = self.vol.lock();
        let mut it = self.it.lock();
        *it = None;
        let (cur, key_and_data) = get!(vol.record_first());
        *it = Some(cur);
        Ok(split_record(&key_and_data))
    }

    /// Returns the next key/value pair of the running iteration.
    ///
    /// # Errors
    ///
    /// `Eof` past the last pair or when no iteration is running.
    pub fn next(&self) -> Result<(String, Vec<u8>), Error> {
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

    /// Dumps the registry state onto the application log.
    pub fn log_status(&self) {
        self.vol.lock().log_status(true);
    }
}

impl<F: Flash> strsub::Source for Registry<F> {
    /// Resolves a bracketed key to the registry value for it, read as text
    /// up to the first NUL.
    fn replace(&self, key: &str) -> Option<String> {
        let mut buf = [0u8; VALUE_LENGTH_MAX];
        let n = self.value_get(key, &mut buf).ok()?;
        let text = &buf[..n];
        let end = text.iter().position(|&b| b == 0).unwrap_or(n);
        Some(String::from_utf8_lossy(&text[..end]).into_owned())
    }
}

lazy_static! {
    /// Process-wide registry over the RAM emulator, the configuration the
    /// host build runs with.
    pub static ref REGISTRY: Registry<RamFlash> =
        Registry::new("registry", RamFlash::new(2 * SECTOR_SIZE), 0, SECTOR_SIZE);
}
