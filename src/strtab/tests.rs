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

#![cfg(test)]
#![allow(unused_variables, unused_mut)]

use super::*;
use speculate::speculate; // Must be imported into the current scope.

use crate::strsub::{self, Source};

fn fresh() -> StrTab<RamFlash> {
    let flash = RamFlash::new(2 * SECTOR_SIZE);
    let tab = StrTab::new("strtab", flash, 0, SECTOR_SIZE);
    tab.start().unwrap();
    tab
}

speculate! {
    describe "strtab" {
        before {
            let tab = fresh();
        }

        it "starts empty" {
            assert!(!tab.valid(1));
            assert_eq!(tab.first().unwrap_err(), Error::Eof);
        }

        it "round-trips numbered strings" {
            tab.set(1, b"first message").unwrap();
            tab.set(1000, b"second message").unwrap();
            assert!(tab.valid(1) && tab.valid(1000));
            assert_eq!(tab.length(1).unwrap(), 13);
            let mut buf = [0u8; LENGTH_MAX];
            let n = tab.get(1000, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"second message");
        }

        it "updates in place" {
            tab.set(7, b"before").unwrap();
            tab.set(7, b"after").unwrap();
            let mut buf = [0u8; 16];
            let n = tab.get(7, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"after");
        }

        it "deletes entries" {
            tab.set(3, b"doomed").unwrap();
            tab.delete(3).unwrap();
            assert!(!tab.valid(3));
            let mut buf = [0u8; 8];
            assert_eq!(tab.get(3, &mut buf).unwrap_err(), Error::NotFound);
        }

        it "rejects oversized strings" {
            let long = vec![b'x'; LENGTH_MAX + 1];
            assert_eq!(tab.set(1, &long).unwrap_err(), Error::Param);
            let max = vec![b'x'; LENGTH_MAX];
            tab.set(1, &max).unwrap();
            assert_eq!(tab.length(1).unwrap(), LENGTH_MAX);
        }

        it "keeps distinct keys distinct across the u16 range" {
            tab.set(0, b"zero").unwrap();
            tab.set(0xFFFF, b"last").unwrap();
            let mut buf = [0u8; 8];
            let n = tab.get(0, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"zero");
            let n = tab.get(0xFFFF, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"last");
        }

        it "iterates every entry once" {
            tab.set(10, b"ten").unwrap();
            tab.set(20, b"twenty").unwrap();
            tab.set(30, b"thirty").unwrap();
            tab.delete(20).unwrap();
            let mut pairs = Vec::new();
            let mut item = tab.first();
            while let Ok((key, value)) = item {
                pairs.push((key, value));
                item = tab.next();
            }
            pairs.sort();
            assert_eq!(pairs, vec![
                (10, b"ten".to_vec()),
                (30, b"thirty".to_vec()),
            ]);
        }

        it "substitutes bracketed decimal keys" {
            tab.set(42, b"the answer").unwrap();
            assert_eq!(tab.replace("42").unwrap(), "the answer");
            assert_eq!(tab.replace("43"), None);
            assert_eq!(tab.replace("not-a-number"), None);
            let sources: &[&dyn Source] = &[&tab];
            assert_eq!(
                strsub::substitute("say [42]", sources),
                "say the answer"
            );
        }
    }

    describe "strtab_singleton" {
        it "serves the process-wide instance" {
            STRTAB.start().unwrap();
            STRTAB.set(1, b"hello").unwrap();
            let mut buf = [0u8; 8];
            assert_eq!(STRTAB.get(1, &mut buf).unwrap(), 5);
            assert_eq!(&buf[..5], b"hello");
            STRTAB.log_status();
        }
    }
}
