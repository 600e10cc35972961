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

//! Two-sector log-structured record engine.
//!
//! # High-level overview
//!
//! The engine persists fixed-size records over two flash sectors that
//! alternate as the active log. It acts as much as possible without erasing
//! any sector, as an erase is really slow: updating a record appends a new
//! copy at the next free slot and marks the previous copy as invalid, so that
//! it is not picked up at the next load. A hash index ([`Dictionary`]) maps
//! each key to the slot of its only valid record and is rebuilt in RAM by a
//! linear scan at load time.
//!
//! When the active sector runs out of slots, the records still reachable
//! from the index are copied to the other sector and the roles of the two
//! sectors are swapped; the invalid records are not carried over, which is
//! the sole compaction mechanism.
//!
//! # Atomicity and timeline
//!
//! A record is written while being marked as not-yet-valid, and only once it
//! is completely on flash its flags are advanced to valid; only then is the
//! superseded copy marked invalid. Every flag transition clears bits and
//! never sets one, so a sector never has to be erased to advance its state,
//! and an interrupted operation leaves a state the load-time machine can
//! classify from the two sector headers alone.
//!
//! # Sector layout
//!
//! A sector starts with one header page ([`PAGE_SIZE`] bytes), the rest is a
//! contiguous array of record slots of `record_size` bytes each:
//!
//! ```none
//! offset  0: u32 flags        EMPTY        0xFFFFFFFF
//!                             INITIALIZING 0xAAFFFFFF
//!                             VALID        0xAAAAFFFF
//!                             INVALID      0xAAAAAAAA
//! offset  4: u32 reserved     0x55555555 once the header is written
//! offset  8: u32 reserved     0x55555555 once the header is written
//! offset 12: u32 version      stored complemented, so erased reads as 0
//! ```
//!
//! The four flag values are bit-supersets of each other in erase order, so a
//! sector state may advance without an erase.
//!
//! # Record slot layout
//!
//! ```none
//! offset 0: u16 flags         EMPTY   0xFFFF
//!                             PENDING 0xFFFE   first record for its key
//!                             NEW     0xFFFC   supersedes a valid record
//!                             VALID   0xFFF8
//!                             INVALID 0xFFF0
//! offset 2: u16 reserved      0xFFFF
//! offset 4: u16 length        bytes of key+payload
//! offset 6: u16 checksum      (0x10000 - sum(key+payload)) & 0xFFFF
//! offset 8: key then payload
//! ```
//!
//! All multi-byte integers are little-endian.
//!
//! [`Dictionary`]: ../dict/struct.Dictionary.html
//! [`PAGE_SIZE`]: constant.PAGE_SIZE.html


use crate::dict::{Cursor, Dictionary, KeySpec};
use crate::flash::{Flash, IOError};

/// Size of the sector header page, and alignment of the record array.
pub const PAGE_SIZE: u32 = 256;

/// Number of slots kept free so that a write that triggers a sector swap
/// always has room for its replacement record in the new sector.
pub const HEADROOM: u16 = 2;

/// Size of a record header on flash.
const RECORD_HEAD_SIZE: u32 = 8;

// Sector flags, in bit-clearing lifecycle order.
const SECTOR_EMPTY: u32 = 0xFFFF_FFFF;
const SECTOR_INITIALIZING: u32 = 0xAAFF_FFFF;
const SECTOR_VALID: u32 = 0xAAAA_FFFF;
const SECTOR_INVALID: u32 = 0xAAAA_AAAA;

// Record flags, in bit-clearing lifecycle order.
const RECORD_EMPTY: u16 = 0xFFFF;
const RECORD_PENDING: u16 = 0xFFFE;
const RECORD_NEW: u16 = 0xFFFC;
const RECORD_VALID: u16 = 0xFFF8;
const RECORD_INVALID: u16 = 0xFFF0;

/// An error that can happen during an engine operation.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// Generic failure with no more precise classification.
    Fail,

    /// A parameter was rejected (wrong key width, oversized payload).
    Param,

    /// The requested key has no valid record.
    NotFound,

    /// The slot holds no record at all.
    Empty,

    /// The slot holds a record that was marked invalid.
    Invalid,

    /// A flash IO error occured during the requested operation.
    Io(IOError),

    /// A checksum did not match its payload.
    Checksum,

    /// An allocation failed.
    OutOfMemory,

    /// The engine is busy with another operation.
    Busy,

    /// The media did not answer in time.
    Timeout,

    /// No slot is left for a new key.
    Full,

    /// Iteration went past the last record.
    Eof,

    /// The sector on flash carries another version than the configured one.
    VersionMismatch,

    /// The data on flash cannot be interpreted at all.
    Corruption,

    /// The slot contents do not match any known state.
    Unknown,
}

impl From<IOError> for Error {
    fn from(e: IOError) -> Error {
        Error::Io(e)
    }
}

/// Outcome of reading one record slot, when no valid record is there.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum SlotRead {
    /// The slot is erased (and so is everything after it)
    Empty,

    /// The slot holds a record that was superseded or deleted
    Invalid,

    /// The slot flags or length make no sense
    Unknown,

    /// The media failed
    Io(IOError),
}

impl From<IOError> for SlotRead {
    fn from(e: IOError) -> SlotRead {
        SlotRead::Io(e)
    }
}

/// On-flash record header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct RecordHead {
    /// Lifecycle flags of the slot
    pub flags: u16,

    /// Reserved, 0xFFFF
    pub reserved: u16,

    /// Bytes of key+payload actually written
    pub length: u16,

    /// Two's complement of the 16-bit sum of the key+payload bytes
    pub checksum: u16,
}

impl RecordHead {
    fn to_bytes(&self) -> [u8; 8] {
        let mut b = [0u8; 8];
        b[0..2].copy_from_slice(&self.flags.to_le_bytes());
        b[2..4].copy_from_slice(&self.reserved.to_le_bytes());
        b[4..6].copy_from_slice(&self.length.to_le_bytes());
        b[6..8].copy_from_slice(&self.checksum.to_le_bytes());
        b
    }

    fn from_bytes(b: &[u8; 8]) -> RecordHead {
        RecordHead {
            flags: u16::from_le_bytes([b[0], b[1]]),
            reserved: u16::from_le_bytes([b[2], b[3]]),
            length: u16::from_le_bytes([b[4], b[5]]),
            checksum: u16::from_le_bytes([b[6], b[7]]),
        }
    }
}

/// Hook invoked with the assembled header and key+payload bytes just before
/// a record reaches the flash; returning an error aborts the write.
pub type WriteHook = Box<dyn Fn(&RecordHead, &[u8]) -> Result<(), Error> + Send>;

/// Static configuration of a [`Volume`].
///
/// [`Volume`]: struct.Volume.html
pub struct VolumeConfig {
    /// Name used in log lines
    pub name: &'static str,

    /// Byte address of the first sector
    pub sector1_addr: u32,

    /// Byte address of the second sector
    pub sector2_addr: u32,

    /// Size of each sector in bytes
    pub sector_size: u32,

    /// Size of each record slot in bytes, header included
    pub record_size: u16,

    /// Key discipline of the index
    pub key_spec: KeySpec,

    /// Bytes the key occupies at the front of each record
    pub key_size: u16,

    /// Payloads up to this size are also cached in the index nodes and can
    /// be read without touching the flash (0 disables the cache)
    pub local_size: u16,

    /// Bucket count of the index
    pub hashsize: usize,

    /// Expected sector version; a mismatch at load forces a reset
    pub version: u16,

    /// Optional pre-write hook
    pub write_cb: Option<WriteHook>,
}

/// In-use, invalid and error record counts of a loaded volume.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub struct Counters {
    /// Records reachable from the index
    pub inuse: u32,

    /// Slots consumed by superseded or deleted records
    pub invalid: u32,

    /// Slots skipped over because their contents made no sense
    pub error: u32,
}

/// Index bookkeeping for one key: where its valid record lives, how long its
/// payload is, and optionally the payload itself.
struct Entry {
    /// Slot of the valid record in the active sector
    idx: u16,

    /// Payload length, key excluded
    length: u16,

    /// Payload cache; either the full payload or empty
    local: Vec<u8>,
}

/// Two-sector record store over a flash device.
pub struct Volume<F: Flash> {
    /// Static configuration
    config: VolumeConfig,

    /// The media this volume lives on
    flash: F,

    /// Key index; `None` between `unload`/`delete` and the next `load`
    dict: Option<Dictionary<Entry>>,

    /// Address of the active sector
    sector: u32,

    /// First free slot of the active sector
    next_idx: u16,

    /// Count of records reachable from the index
    inuse: u32,

    /// Count of slots holding invalidated records
    invalid: u32,

    /// Count of slots skipped as uninterpretable
    error: u32,
}

/// Computes the record checksum of key+payload bytes.
///
/// The law is `(checksum + sum(bytes)) mod 2^16 == 0`; the exact same
/// relation is used when writing and when validating.
fn checksum(key_and_data: &[u8]) -> u16 {
    let mut sum = 0u16;
    for &b in key_and_data {
        sum = sum.wrapping_add(b as u16);
    }
    0u16.wrapping_sub(sum)
}

/// Returns true iff `flags` is one of the four legal sector states.
fn sector_flags_legal(flags: u32) -> bool {
    flags == SECTOR_EMPTY
        || flags == SECTOR_INITIALIZING
        || flags == SECTOR_VALID
        || flags == SECTOR_INVALID
}

impl<F: Flash> Volume<F> {
    /// Binds a configuration to a flash device.
    ///
    /// The volume starts unloaded; call [`load`] before any record
    /// operation.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is not internally consistent (slots
    /// smaller than a record header, sectors smaller than the header page,
    /// overlapping sectors, key wider than a slot).
    ///
    /// [`load`]: #method.load
    pub fn new(config: VolumeConfig, flash: F) -> Volume<F> {
        assert!(
            config.record_size as u32 > RECORD_HEAD_SIZE,
            "record_size must leave room for key and payload"
        );
        assert!(
            config.key_size > 0 && config.key_size as u32 + RECORD_HEAD_SIZE <= config.record_size as u32,
            "key does not fit in a record slot"
        );
        assert!(
            config.sector_size > PAGE_SIZE,
            "sector_size must leave room for record slots"
        );
        let span = config.sector_size;
        assert!(
            config.sector1_addr + span <= config.sector2_addr
                || config.sector2_addr + span <= config.sector1_addr,
            "sectors overlap"
        );
        let slots = (config.sector_size - PAGE_SIZE) / config.record_size as u32;
        assert!(slots <= u16::max_value() as u32, "too many slots per sector");
        assert!(slots > HEADROOM as u32, "sector too small to hold any record");
        Volume {
            config,
            flash,
            dict: None,
            sector: 0,
            next_idx: 0,
            inuse: 0,
            invalid: 0,
            error: 0,
        }
    }

    /// Returns the number of record slots per sector.
    pub fn max_records(&self) -> u16 {
        ((self.config.sector_size - PAGE_SIZE) / self.config.record_size as u32) as u16
    }

    /// Returns the record counters as of the last operation.
    pub fn counters(&self) -> Counters {
        Counters {
            inuse: self.inuse,
            invalid: self.invalid,
            error: self.error,
        }
    }

    /// Returns true if the volume is loaded.
    pub fn is_loaded(&self) -> bool {
        self.dict.is_some()
    }

    /// Returns the configuration this volume was built with.
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    fn dict(&self) -> Result<&Dictionary<Entry>, Error> {
        self.dict.as_ref().ok_or(Error::Fail)
    }

    fn dict_mut(&mut self) -> Result<&mut Dictionary<Entry>, Error> {
        self.dict.as_mut().ok_or(Error::Fail)
    }

    /// Reads one sector header, returning its flags and stored version.
    fn sector_header(&self, sector_addr: u32) -> Result<(u32, u16), IOError> {
        let mut buf = [0u8; 16];
        get!(self.flash.read(sector_addr, &mut buf));
        let flags = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let version = !u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]) as u16;
        Ok((flags, version))
    }

    /// Advances one sector header to `flags`, stamping the configured
    /// version.
    fn set_sector_flags(&mut self, sector_addr: u32, flags: u32) -> Result<(), Error> {
        let mut buf = [0x55u8; 16];
        buf[0..4].copy_from_slice(&flags.to_le_bytes());
        buf[12..16].copy_from_slice(&(!(self.config.version as u32)).to_le_bytes());
        get!(self.flash.write(sector_addr, &buf));
        let (read_flags, read_version) = get!(self.sector_header(sector_addr));
        if read_flags != flags || read_version != self.config.version {
            debug!(
                "'{}' failed setting sector flags {:x} at {:x}",
                self.config.name, flags, sector_addr
            );
        }
        Ok(())
    }

    fn erase_sector(&mut self, sector_addr: u32) -> Result<(), Error> {
        get!(self
            .flash
            .erase(sector_addr, sector_addr + self.config.sector_size));
        Ok(())
    }

    /// Byte address of a record slot.
    fn slot_offset(&self, sector_addr: u32, idx: u16) -> u32 {
        sector_addr + PAGE_SIZE + self.config.record_size as u32 * idx as u32
    }

    /// Reads and classifies the header of a record slot.
    ///
    /// Only a valid record with a sane length comes back as `Ok`.
    fn read_head(&self, sector_addr: u32, idx: u16) -> Result<RecordHead, SlotRead> {
        debug_assert!(idx < self.max_records());
        let mut buf = [0u8; 8];
        self.flash.read(self.slot_offset(sector_addr, idx), &mut buf)?;
        let head = RecordHead::from_bytes(&buf);
        if head.flags == RECORD_EMPTY {
            return Err(SlotRead::Empty);
        }
        if head.flags != RECORD_VALID {
            // PENDING and NEW are interrupted writes that never became
            // valid; they count as invalid, not as corruption.
            return Err(match head.flags {
                RECORD_INVALID | RECORD_PENDING | RECORD_NEW => SlotRead::Invalid,
                _ => SlotRead::Unknown,
            });
        }
        if head.length < self.config.key_size
            || head.length as u32 > self.config.record_size as u32 - RECORD_HEAD_SIZE
        {
            return Err(SlotRead::Unknown);
        }
        Ok(head)
    }

    /// Reads a whole record (header and key+payload) from a slot of the
    /// active sector.
    fn read_record(&self, idx: u16) -> Result<(RecordHead, Vec<u8>), SlotRead> {
        let head = self.read_head(self.sector, idx)?;
        let mut key_and_data = vec![0u8; head.length as usize];
        if head.length > 0 {
            self.flash.read(
                self.slot_offset(self.sector, idx) + RECORD_HEAD_SIZE,
                &mut key_and_data,
            )?;
        }
        Ok((head, key_and_data))
    }

    /// Writes a whole record into a slot.
    fn write_record(
        &mut self,
        sector_addr: u32,
        idx: u16,
        head: &RecordHead,
        key_and_data: &[u8],
    ) -> Result<(), Error> {
        debug_assert!(idx < self.max_records());
        debug_assert!(head.flags != RECORD_EMPTY);
        let mut buf = Vec::with_capacity(8 + key_and_data.len());
        buf.extend_from_slice(&head.to_bytes());
        buf.extend_from_slice(key_and_data);
        get!(self.flash.write(self.slot_offset(sector_addr, idx), &buf));
        Ok(())
    }

    /// Advances the flags of a record slot (a pure bit-clear).
    fn set_record_flags(&mut self, sector_addr: u32, idx: u16, flags: u16) -> Result<(), Error> {
        debug_assert!(idx < self.max_records());
        get!(self
            .flash
            .write(self.slot_offset(sector_addr, idx), &flags.to_le_bytes()));
        Ok(())
    }

    /// Points the index at slot `idx` for the key at the front of
    /// `key_and_data`, caching the payload when it fits.
    fn insert_lookup(&mut self, key_and_data: &[u8], idx: u16) {
        let key_size = self.config.key_size as usize;
        let local_size = self.config.local_size as usize;
        let (key, data) = key_and_data.split_at(key_size);
        let local = if data.len() <= local_size {
            data.to_vec()
        } else {
            Vec::new()
        };
        let entry = Entry {
            idx,
            length: data.len() as u16,
            local,
        };
        // Unconditional remove + install: if the key was already seen, the
        // later slot superseded the earlier one.
        let dict = self.dict.as_mut().expect("index must exist at insert time");
        dict.remove(key);
        dict.install(key, entry);
    }

    /// Rebuilds the index by a linear scan of the active sector.
    ///
    /// Slots failing their checksum are flipped to INVALID on flash; the
    /// append cursor ends up on the first empty slot.
    ///
    /// # Errors
    ///
    /// Errors with `VersionMismatch` if the active sector carries another
    /// version than the configured one.
    fn construct_lookup(&mut self) -> Result<(), Error> {
        self.inuse = 0;
        self.invalid = 0;
        self.error = 0;
        let max = self.max_records();
        let mut idx: u16 = 0;
        while idx < max {
            match self.read_record(idx) {
                Err(SlotRead::Empty) => break, // last record
                Err(SlotRead::Invalid) => self.invalid += 1,
                Err(SlotRead::Unknown) => {
                    self.error += 1;
                }
                Err(SlotRead::Io(_)) => {
                    self.error += 1;
                }
                Ok((head, key_and_data)) => {
                    if checksum(&key_and_data) == head.checksum {
                        self.insert_lookup(&key_and_data, idx);
                    } else {
                        debug!(
                            "    Found record with bad checksum at slot {}, invalidating",
                            idx
                        );
                        let _ = self.set_record_flags(self.sector, idx, RECORD_INVALID);
                        self.error += 1;
                        self.invalid += 1;
                    }
                }
            }
            idx += 1;
        }
        self.next_idx = idx;
        // A key seen twice occupies two slots but is one record; count keys.
        self.inuse = self.dict.as_ref().map_or(0, |d| d.count()) as u32;

        let (_, version) = get!(self.sector_header(self.sector));
        if version != self.config.version {
            return err!(Error::VersionMismatch);
        }
        Ok(())
    }

    /// Copies every record reachable from the index into the other sector,
    /// promotes it and retires the old one.
    ///
    /// The index is only touched once the flash is settled: destination
    /// valid, source invalid and erased.
    fn swap_sectors(&mut self) -> Result<(), Error> {
        let (src, dst) = if self.sector == self.config.sector1_addr {
            (self.config.sector1_addr, self.config.sector2_addr)
        } else {
            (self.config.sector2_addr, self.config.sector1_addr)
        };
        debug!(
            "'{}' swap sectors dst {:x} src {:x}",
            self.config.name, dst, src
        );

        let (dst_flags, _) = get!(self.sector_header(dst));
        if dst_flags != SECTOR_EMPTY {
            debug!("'{}' swap sectors dst not empty", self.config.name);
            get!(self.erase_sector(dst));
        }
        get!(self.set_sector_flags(dst, SECTOR_INITIALIZING));

        // Walk the index and copy the records it references, remembering the
        // slot renumbering so it can be applied once the flash is settled.
        let cursors = {
            let dict = get!(self.dict());
            let mut cursors = Vec::with_capacity(dict.count());
            let mut cur = dict.first();
            while let Some(c) = cur {
                cursors.push(c);
                cur = dict.next(c);
            }
            cursors
        };
        let mut dst_idx: u16 = 0;
        let mut moves: Vec<(Cursor, u16)> = Vec::with_capacity(cursors.len());
        let mut unreadable: Vec<Vec<u8>> = Vec::new();
        for c in cursors {
            let idx = get!(self.dict()).value_at(c).idx;
            match self.read_record(idx) {
                Ok((head, key_and_data)) => {
                    get!(self.write_record(dst, dst_idx, &head, &key_and_data));
                    moves.push((c, dst_idx));
                    dst_idx += 1;
                }
                Err(e) => {
                    debug!(
                        "'{}' swap could not read record at slot {}: {:?}",
                        self.config.name, idx, e
                    );
                    unreadable.push(get!(self.dict()).key_at(c).to_vec());
                }
            }
        }

        get!(self.set_sector_flags(dst, SECTOR_VALID));
        self.sector = dst;
        get!(self.set_sector_flags(src, SECTOR_INVALID));
        get!(self.erase_sector(src));

        // Flash is settled, now repoint the index.
        let dict = self.dict.as_mut().expect("index checked above");
        for (c, new_idx) in moves {
            dict.value_at_mut(c).idx = new_idx;
        }
        for key in unreadable {
            dict.remove(&key);
        }
        self.next_idx = dst_idx;
        self.inuse = dict.count() as u32;
        self.invalid = 0;
        self.error = 0;
        debug!("'{}' swap sectors completed", self.config.name);
        Ok(())
    }

    /// Promotes `sector_addr` to the active, VALID sector.
    fn promote(&mut self, sector_addr: u32) -> Result<(), Error> {
        self.sector = sector_addr;
        self.set_sector_flags(sector_addr, SECTOR_VALID)
    }

    /// Adopts `sector_addr` as the active sector and compacts it into the
    /// other one.
    fn adopt_and_swap(&mut self, sector_addr: u32) -> Result<(), Error> {
        self.sector = sector_addr;
        get!(self.construct_lookup());
        self.swap_sectors()
    }

    /// Chooses (and possibly repairs) the active sector from the pair of
    /// sector states left on flash, then rebuilds the index from it.
    fn init_sectors(&mut self) -> Result<(), Error> {
        let s1 = self.config.sector1_addr;
        let s2 = self.config.sector2_addr;
        let (mut flags1, _) = get!(self.sector_header(s1));
        let (mut flags2, _) = get!(self.sector_header(s2));

        // A header in none of the legal states is corruption; erase it.
        if !sector_flags_legal(flags1) {
            debug!("'{}' sector 1 corrupt ({:x}), erasing", self.config.name, flags1);
            get!(self.erase_sector(s1));
            flags1 = SECTOR_EMPTY;
        }
        if !sector_flags_legal(flags2) {
            debug!("'{}' sector 2 corrupt ({:x}), erasing", self.config.name, flags2);
            get!(self.erase_sector(s2));
            flags2 = SECTOR_EMPTY;
        }
        self.next_idx = 0;

        match (flags1, flags2) {
            (SECTOR_EMPTY, SECTOR_EMPTY) => {
                get!(self.erase_sector(s1));
                get!(self.promote(s1));
            }
            (SECTOR_EMPTY, SECTOR_INITIALIZING) => {
                get!(self.promote(s2));
            }
            (SECTOR_EMPTY, SECTOR_VALID) => {
                self.sector = s2;
            }
            (SECTOR_EMPTY, SECTOR_INVALID) => {
                get!(self.adopt_and_swap(s2));
            }

            (SECTOR_INITIALIZING, SECTOR_EMPTY) => {
                get!(self.erase_sector(s2));
                get!(self.promote(s1));
            }
            (SECTOR_INITIALIZING, SECTOR_INITIALIZING) => {
                get!(self.erase_sector(s2));
                get!(self.promote(s1));
            }
            (SECTOR_INITIALIZING, SECTOR_VALID) => {
                get!(self.erase_sector(s1));
                get!(self.adopt_and_swap(s2));
            }
            (SECTOR_INITIALIZING, SECTOR_INVALID) => {
                get!(self.erase_sector(s2));
                get!(self.promote(s1));
            }

            (SECTOR_VALID, SECTOR_EMPTY) => {
                self.sector = s1;
            }
            (SECTOR_VALID, SECTOR_INITIALIZING) => {
                get!(self.erase_sector(s2));
                get!(self.adopt_and_swap(s1));
            }
            (SECTOR_VALID, _) => {
                // The other sector is VALID or INVALID; either way it lost.
                get!(self.erase_sector(s2));
                self.sector = s1;
            }

            (SECTOR_INVALID, SECTOR_EMPTY) => {
                get!(self.erase_sector(s2));
                get!(self.adopt_and_swap(s1));
            }
            (SECTOR_INVALID, SECTOR_INITIALIZING) => {
                get!(self.erase_sector(s1));
                get!(self.promote(s2));
            }
            (SECTOR_INVALID, SECTOR_VALID) => {
                get!(self.erase_sector(s1));
                self.sector = s2;
            }
            (SECTOR_INVALID, SECTOR_INVALID) => {
                // Both sectors invalid, try to recover the first one.
                get!(self.erase_sector(s2));
                get!(self.adopt_and_swap(s1));
            }

            (_, _) => unreachable!("sector flags were normalised above"),
        }

        self.construct_lookup()
    }

    /// Loads the volume: runs the sector state machine, then rebuilds the
    /// index by scanning the chosen active sector.
    ///
    /// # Errors
    ///
    /// Errors with `VersionMismatch` if the active sector carries another
    /// version than the configured one (the expected recovery is [`reset`]),
    /// or with an IO error from the media.
    ///
    /// [`reset`]: #method.reset
    pub fn load(&mut self) -> Result<Counters, Error> {
        debug!("Loading volume '{}'", self.config.name);
        self.sector = 0;
        self.next_idx = 0;
        self.inuse = 0;
        self.invalid = 0;
        self.error = 0;
        self.dict = Some(Dictionary::new(self.config.key_spec, self.config.hashsize));

        match self.init_sectors() {
            Ok(()) => {
                self.log_status(false);
                Ok(self.counters())
            }
            Err(e) => {
                debug!("'{}' failed loading with {:?}", self.config.name, e);
                Err(e)
            }
        }
    }

    /// Checks that the flash holds a loadable volume of the configured
    /// version, without loading it.
    ///
    /// # Errors
    ///
    /// `VersionMismatch` if a sector is in a written state but carries
    /// another version; `Fail` if neither sector is in a written state.
    pub fn validate(&self) -> Result<(), Error> {
        let (flags1, version1) = get!(self.sector_header(self.config.sector1_addr));
        let (flags2, version2) = get!(self.sector_header(self.config.sector2_addr));

        if flags1 == SECTOR_INITIALIZING || flags1 == SECTOR_VALID || flags1 == SECTOR_INVALID {
            return if version1 == self.config.version {
                Ok(())
            } else {
                err!(Error::VersionMismatch)
            };
        }
        if flags2 == SECTOR_INITIALIZING || flags2 == SECTOR_VALID || flags2 == SECTOR_INVALID {
            return if version2 == self.config.version {
                Ok(())
            } else {
                err!(Error::VersionMismatch)
            };
        }
        err!(Error::Fail)
    }

    /// Erases both sectors and reloads, yielding an empty volume.
    pub fn reset(&mut self) -> Result<Counters, Error> {
        self.dict = None;
        get!(self.erase_sector(self.config.sector1_addr));
        get!(self.erase_sector(self.config.sector2_addr));

        let (flags1, version1) = get!(self.sector_header(self.config.sector1_addr));
        let (flags2, version2) = get!(self.sector_header(self.config.sector2_addr));
        if version1 != 0 || version2 != 0 || flags1 != SECTOR_EMPTY || flags2 != SECTOR_EMPTY {
            debug!("'{}' failed resetting", self.config.name);
        }

        self.load()
    }

    /// Erases both sectors and tears the index down.
    pub fn delete(&mut self) -> Result<(), Error> {
        get!(self.erase_sector(self.config.sector1_addr));
        get!(self.erase_sector(self.config.sector2_addr));
        self.dict = None;
        Ok(())
    }

    /// Tears the index down, leaving the flash untouched.
    pub fn unload(&mut self) {
        self.dict = None;
    }

    /// Creates or updates the record for the key at the front of the
    /// supplied bytes.
    ///
    /// Writing the exact bytes a key already holds is a no-op on flash.
    ///
    /// # Errors
    ///
    /// `Param` if the key width does not match the configuration or the
    /// record does not fit in a slot; `Full` if the key is new and the
    /// volume is out of slots; otherwise IO and swap errors.
    pub fn record_set(&mut self, key: &[u8], data: &[u8]) -> Result<(), Error> {
        if key.len() != self.config.key_size as usize {
            return err!(Error::Param);
        }
        let total = key.len() + data.len();
        if total as u32 > self.config.record_size as u32 - RECORD_HEAD_SIZE {
            return err!(Error::Param);
        }
        let mut key_and_data = Vec::with_capacity(total);
        key_and_data.extend_from_slice(key);
        key_and_data.extend_from_slice(data);

        let mut prev_idx = get!(self.dict()).get(key).map(|e| e.idx);
        let flags;
        if let Some(idx) = prev_idx {
            flags = RECORD_NEW;
            // No update required if the stored bytes already match.
            if let Ok((head, existing)) = self.read_record(idx) {
                if head.length as usize == total && existing == key_and_data {
                    return Ok(());
                }
            }
        } else {
            if get!(self.dict()).count() >= (self.max_records() - HEADROOM) as usize {
                debug!(
                    "'{}' volume full ({} records)",
                    self.config.name,
                    get!(self.dict()).count()
                );
                return err!(Error::Full);
            }
            flags = RECORD_PENDING;
        }

        // If the sector is out of slots, compact into the other one. The
        // superseded record moved with everything else, so its slot has to
        // be fetched again from the index.
        if self.next_idx >= self.max_records() {
            get!(self.swap_sectors());
            prev_idx = get!(self.dict()).get(key).map(|e| e.idx);
        }

        let head = RecordHead {
            flags,
            reserved: 0xFFFF,
            length: total as u16,
            checksum: checksum(&key_and_data),
        };

        if let Some(cb) = &self.config.write_cb {
            get!(cb(&head, &key_and_data));
        }

        let idx = self.next_idx;
        if let Err(e) = self.write_record(self.sector, idx, &head, &key_and_data) {
            let _ = self.set_record_flags(self.sector, idx, RECORD_INVALID);
            self.next_idx += 1;
            self.invalid += 1;
            self.error += 1;
            return err!(e);
        }
        let res = self.set_record_flags(self.sector, idx, RECORD_VALID);
        self.next_idx += 1;
        self.inuse += 1;
        get!(res);

        self.insert_lookup(&key_and_data, idx);

        if let Some(prev) = prev_idx {
            // Only now that the replacement is valid, retire the old copy.
            let _ = self.set_record_flags(self.sector, prev, RECORD_INVALID);
            self.inuse -= 1;
            self.invalid += 1;
        }

        Ok(())
    }

    /// Reads the key+payload bytes stored for a key.
    ///
    /// Served from the index cache when the payload fits in it, from the
    /// flash otherwise.
    pub fn record_get(&self, key: &[u8]) -> Result<Vec<u8>, Error> {
        if key.len() != self.config.key_size as usize {
            return err!(Error::Param);
        }
        let cur = get!(self.dict()).at(key).ok_or(Error::NotFound)?;
        self.record_at(cur)
    }

    /// Reads the record under an index cursor.
    fn record_at(&self, cur: Cursor) -> Result<Vec<u8>, Error> {
        let dict = get!(self.dict());
        let entry = dict.value_at(cur);
        if entry.length as usize <= self.config.local_size as usize {
            let mut out = vec![0u8; self.config.key_size as usize];
            let key = dict.key_at(cur);
            out[..key.len()].copy_from_slice(key);
            out.extend_from_slice(&entry.local);
            return Ok(out);
        }
        match self.read_record(entry.idx) {
            Ok((_, key_and_data)) => Ok(key_and_data),
            Err(SlotRead::Empty) => err!(Error::Empty),
            Err(SlotRead::Invalid) => err!(Error::Invalid),
            Err(SlotRead::Unknown) => err!(Error::Unknown),
            Err(SlotRead::Io(e)) => err!(Error::Io(e)),
        }
    }

    /// Returns the key+payload length stored on flash for a key.
    pub fn record_head_length(&self, key: &[u8]) -> Result<u16, Error> {
        if key.len() != self.config.key_size as usize {
            return err!(Error::Param);
        }
        let idx = get!(self.dict()).get(key).ok_or(Error::NotFound)?.idx;
        match self.read_head(self.sector, idx) {
            Ok(head) => Ok(head.length),
            Err(SlotRead::Io(e)) => err!(Error::Io(e)),
            Err(_) => err!(Error::Fail),
        }
    }

    /// Tells whether a key currently has a valid record.
    pub fn record_status(&self, key: &[u8]) -> Result<(), Error> {
        if key.len() != self.config.key_size as usize {
            return err!(Error::Param);
        }
        match get!(self.dict()).get(key) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound),
        }
    }

    /// Deletes the record for a key: the slot is invalidated on flash and
    /// the key leaves the index.
    pub fn record_delete(&mut self, key: &[u8]) -> Result<(), Error> {
        if key.len() != self.config.key_size as usize {
            return err!(Error::Param);
        }
        let idx = match get!(self.dict()).get(key) {
            Some(entry) => entry.idx,
            None => return Err(Error::NotFound),
        };
        get!(self.set_record_flags(self.sector, idx, RECORD_INVALID));
        self.inuse -= 1;
        self.invalid += 1;
        get!(self.dict_mut()).remove(key);
        Ok(())
    }

    /// Starts an iteration, returning the first record with its cursor.
    ///
    /// The iteration order is unspecified but stable; any mutation of the
    /// volume invalidates outstanding cursors.
    ///
    /// # Errors
    ///
    /// `Eof` on an empty volume.
    pub fn record_first(&self) -> Result<(Cursor, Vec<u8>), Error> {
        let cur = get!(self.dict()).first().ok_or(Error::Eof)?;
        Ok((cur, get!(self.record_at(cur))))
    }

    /// Returns the record following `cur` in iteration order.
    ///
    /// # Errors
    ///
    /// `Eof` past the last record.
    pub fn record_next(&self, cur: Cursor) -> Result<(Cursor, Vec<u8>), Error> {
        let cur = get!(self.dict()).next(cur).ok_or(Error::Eof)?;
        Ok((cur, get!(self.record_at(cur))))
    }

    /// Returns a cursor on the entry for a key, if present.
    pub fn entry_at(&self, key: &[u8]) -> Option<Cursor> {
        self.dict.as_ref()?.at(key)
    }

    /// Returns a cursor on the first entry, if any.
    pub fn entry_first(&self) -> Option<Cursor> {
        self.dict.as_ref()?.first()
    }

    /// Returns a cursor on the entry following `cur`, if any.
    pub fn entry_next(&self, cur: Cursor) -> Option<Cursor> {
        self.dict.as_ref()?.next(cur)
    }

    /// Returns the key under a cursor.
    pub fn entry_key(&self, cur: Cursor) -> Result<&[u8], Error> {
        Ok(get!(self.dict()).key_at(cur))
    }

    /// Returns the cached payload under a cursor.
    ///
    /// Empty unless the payload fits in the configured cache size.
    pub fn entry_data(&self, cur: Cursor) -> Result<&[u8], Error> {
        Ok(&get!(self.dict()).value_at(cur).local[..])
    }

    /// Returns the cached payload under a cursor, mutably, for in-place
    /// edition followed by [`entry_save`].
    ///
    /// [`entry_save`]: #method.entry_save
    pub fn entry_data_mut(&mut self, cur: Cursor) -> Result<&mut [u8], Error> {
        Ok(&mut get!(self.dict_mut()).value_at_mut(cur).local[..])
    }

    /// Re-persists the entry under a cursor from its cached payload.
    ///
    /// # Errors
    ///
    /// `Fail` if the payload is not covered by the cache (nothing to save
    /// from).
    pub fn entry_save(&mut self, cur: Cursor) -> Result<(), Error> {
        let (key, data) = {
            let dict = get!(self.dict());
            let entry = dict.value_at(cur);
            if entry.local.len() != entry.length as usize {
                return err!(Error::Fail);
            }
            (dict.key_at(cur).to_vec(), entry.local.clone())
        };
        let mut padded = vec![0u8; self.config.key_size as usize];
        padded[..key.len()].copy_from_slice(&key);
        self.record_set(&padded, &data)
    }

    /// Deletes the record under a cursor.
    ///
    /// The cursor (and any other outstanding one) is invalid afterwards.
    pub fn entry_delete(&mut self, cur: Cursor) -> Result<(), Error> {
        let (key, idx) = {
            let dict = get!(self.dict());
            (dict.key_at(cur).to_vec(), dict.value_at(cur).idx)
        };
        get!(self.set_record_flags(self.sector, idx, RECORD_INVALID));
        self.inuse -= 1;
        self.invalid += 1;
        get!(self.dict_mut()).remove(&key);
        Ok(())
    }

    /// Dumps the state of the volume onto the application log.
    pub fn log_status(&self, verbose: bool) {
        let count = self.dict.as_ref().map_or(0, |d| d.count());
        debug!(
            "'{}' {} / {} records loaded",
            self.config.name,
            count,
            self.max_records()
        );
        if !verbose {
            return;
        }
        let sector1 = self.sector_header(self.config.sector1_addr);
        let sector2 = self.sector_header(self.config.sector2_addr);
        debug!("  record  : {} recordsize", self.config.record_size);
        debug!(
            "          : {:#08x} 1st sector {:x?}",
            self.config.sector1_addr, sector1
        );
        debug!(
            "          : {:#08x} 2nd sector {:x?}",
            self.config.sector2_addr, sector2
        );
        debug!("          : {:#08x} sector size", self.config.sector_size);
        debug!("          : {} inuse", self.inuse);
        debug!("          : {} invalid", self.invalid);
        debug!("          : {} error", self.error);
        if let Some(dict) = &self.dict {
            let size = dict.hashtab_size();
            let mut empty = 0;
            let mut used = 0;
            let mut max = 0;
            for i in 0..size {
                let cnt = dict.hashtab_cnt(i);
                if cnt > max {
                    max = cnt;
                }
                if cnt == 0 {
                    empty += 1;
                } else {
                    used += 1;
                }
            }
            debug!("          : {} index buckets ({} keys)", size, dict.count());
            debug!(
                "          : index chains - max {}, empty {}, used {}",
                max, empty, used
            );
        }
    }
}
