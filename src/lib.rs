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

//! Fault-tolerant key/value persistence for bit-clearing flash media.
//!
//! The crate provides a dictionary semantic (insert, update, read, delete,
//! iterate) over two fixed-size flash sectors that alternate as an append-only
//! log, with an in-memory hash index rebuilt at load time. It is designed for
//! NOR-flash-like media where erases are expensive, writes can only clear bits
//! (1 to 0), and power may be lost in the middle of any operation.
//!
//! Module map:
//!  * [`flash`] - the media contract (read, AND-write, erase) and a RAM-backed
//!    emulator implementing it
//!  * [`dict`] - the in-memory hash index with its four key disciplines
//!  * [`vol`] - the two-sector record engine (layout, recovery, compaction)
//!  * [`registry`] - string-keyed configuration store built on the engine
//!  * [`strtab`] - integer-keyed string table built on the engine
//!  * [`strsub`] - the string-substitution seam the stores plug into
//!
//! [`flash`]: flash/index.html
//! [`dict`]: dict/index.html
//! [`vol`]: vol/index.html
//! [`registry`]: registry/index.html
//! [`strtab`]: strtab/index.html
//! [`strsub`]: strsub/index.html

#![warn(missing_docs)]

#[macro_use]
extern crate lazy_static;

#[macro_use]
pub mod debug;

pub mod dict;
pub mod flash;
pub mod registry;
pub mod strsub;
pub mod strtab;
pub mod vol;
