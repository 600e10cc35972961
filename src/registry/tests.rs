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

fn fresh() -> (RamFlash, Registry<RamFlash>) {
    let flash = RamFlash::new(2 * SECTOR_SIZE);
    let reg = Registry::new("registry", flash.clone(), 0, SECTOR_SIZE);
    reg.start().unwrap();
    (flash, reg)
}

speculate! {
    describe "registry" {
        before {
            let (flash, reg) = fresh();
        }

        it "starts empty on a blank device" {
            assert_eq!(reg.first().unwrap_err(), Error::Eof);
            assert!(!reg.value_valid("anything"));
        }

        it "round-trips values" {
            reg.value_set("test", b"123\0").unwrap();
            let mut buf = [0u8; VALUE_LENGTH_MAX];
            let n = reg.value_get("test", &mut buf).unwrap();
            assert_eq!(&buf[..n], b"123\0");
            assert_eq!(reg.value_length("test").unwrap(), 4);
            assert!(reg.value_valid("test"));
        }

        it "truncates into a short caller buffer" {
            reg.value_set("motd", b"hello world").unwrap();
            let mut buf = [0u8; 5];
            assert_eq!(reg.value_get("motd", &mut buf).unwrap(), 5);
            assert_eq!(&buf, b"hello");
        }

        it "deletes values for good" {
            reg.value_set("gone", b"soon").unwrap();
            reg.value_delete("gone").unwrap();
            assert!(!reg.value_valid("gone"));
            let mut buf = [0u8; 8];
            assert_eq!(reg.value_get("gone", &mut buf).unwrap_err(), Error::NotFound);
            assert_eq!(reg.value_delete("gone").unwrap_err(), Error::NotFound);
        }

        it "rejects oversized keys and values" {
            let long_key = "k".repeat(KEY_LENGTH + 1);
            assert_eq!(reg.value_set(&long_key, b"v").unwrap_err(), Error::Param);
            let long_value = vec![0x42u8; VALUE_LENGTH_MAX + 1];
            assert_eq!(reg.value_set("key", &long_value).unwrap_err(), Error::Param);
            // Exactly at the limits is fine
            let max_key = "k".repeat(KEY_LENGTH);
            let max_value = vec![0x42u8; VALUE_LENGTH_MAX];
            reg.value_set(&max_key, &max_value).unwrap();
            assert_eq!(reg.value_length(&max_key).unwrap(), VALUE_LENGTH_MAX);
        }

        it "treats an empty value as invalid on read" {
            reg.value_set("empty", b"").unwrap();
            assert!(!reg.value_valid("empty"));
            assert_eq!(reg.value_length("empty").unwrap(), 0);
            let mut buf = [0u8; 4];
            assert_eq!(reg.value_get("empty", &mut buf).unwrap_err(), Error::Invalid);
        }

        it "survives a stop/start cycle" {
            reg.value_set("keep", b"me").unwrap();
            reg.stop();
            reg.start().unwrap();
            let mut buf = [0u8; 2];
            assert_eq!(reg.value_get("keep", &mut buf).unwrap(), 2);
            assert_eq!(&buf, b"me");
        }

        it "recovers an unusable device by resetting it" {
            // Shred both sector headers with garbage the engine cannot adopt
            let mut writer = flash.clone();
            writer.write(0, &[0x12, 0x34, 0x56, 0x78]).unwrap();
            writer.write(SECTOR_SIZE, &[0x21, 0x43, 0x65, 0x87]).unwrap();
            let reg2 = Registry::new("registry", flash.clone(), 0, SECTOR_SIZE);
            reg2.start().unwrap();
            assert_eq!(reg2.first().unwrap_err(), Error::Eof);
        }

        it "comes up empty after an erase" {
            reg.value_set("a", b"1").unwrap();
            reg.erase().unwrap();
            assert!(!reg.value_valid("a"));
        }

        it "iterates every pair once" {
            reg.value_set("one", b"1").unwrap();
            reg.value_set("two", b"22").unwrap();
            reg.value_set("three", b"333").unwrap();
            let mut pairs = Vec::new();
            let mut item = reg.first();
            while let Ok((key, value)) = item {
                pairs.push((key, value));
                item = reg.next();
            }
            pairs.sort();
            assert_eq!(pairs, vec![
                ("one".to_string(), b"1".to_vec()),
                ("three".to_string(), b"333".to_vec()),
                ("two".to_string(), b"22".to_vec()),
            ]);
            // A next without a running iteration is Eof
            assert_eq!(reg.next().unwrap_err(), Error::Eof);
        }

        it "substitutes bracketed keys in scripts" {
            reg.value_set("test", b"123\0").unwrap();
            reg.value_set("host", b"coral").unwrap();
            assert_eq!(reg.replace("test").unwrap(), "123");
            assert_eq!(reg.replace("missing"), None);
            let sources: &[&dyn Source] = &[&reg];
            assert_eq!(
                strsub::substitute("echo [test] on [host]", sources),
                "echo 123 on coral"
            );
        }
    }

    describe "registry_singleton" {
        it "serves the process-wide instance" {
            REGISTRY.start().unwrap();
            REGISTRY.value_set("test", b"123\0").unwrap();
            let mut buf = [0u8; 4];
            assert_eq!(REGISTRY.value_get("test", &mut buf).unwrap(), 4);
            assert_eq!(&buf, b"123\0");
            REGISTRY.log_status();
        }
    }
}
