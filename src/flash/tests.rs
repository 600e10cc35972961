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

use super::*;
use speculate::speculate; // Must be imported into the current scope.

speculate! {
    describe "ram_flash" {
        before {
            let mut flash = RamFlash::new(256);
        }

        it "comes up erased" {
            let mut buf = [0u8; 256];
            flash.read(0, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == 0xFF));
        }

        it "only clears bits on write" {
            flash.write(4, &[0x0F]).unwrap();
            let mut buf = [0u8; 1];
            flash.read(4, &mut buf).unwrap();
            assert_eq!(buf[0], 0x0F);
            // Trying to set bits back must silently leave the zeros
            flash.write(4, &[0xF3]).unwrap();
            flash.read(4, &mut buf).unwrap();
            assert_eq!(buf[0], 0x03);
        }

        it "erases back to 0xFF" {
            flash.write(0, &[0x00; 16]).unwrap();
            flash.erase(0, 256).unwrap();
            let mut buf = [0u8; 16];
            flash.read(0, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == 0xFF));
        }

        it "clamps erase to the device capacity" {
            flash.write(250, &[0x00; 6]).unwrap();
            flash.erase(250, 0x1000).unwrap();
            let mut buf = [0u8; 6];
            flash.read(250, &mut buf).unwrap();
            assert!(buf.iter().all(|&b| b == 0xFF));
        }

        it "rejects out of bounds accesses" {
            let mut buf = [0u8; 2];
            assert_eq!(flash.read(255, &mut buf).unwrap_err(), IOError::OutOfBounds);
            assert_eq!(flash.write(255, &[0, 0]).unwrap_err(), IOError::OutOfBounds);
            assert_eq!(flash.erase(256, 257).unwrap_err(), IOError::OutOfBounds);
        }

        it "rejects a write that does not fit, without writing anything" {
            assert_eq!(flash.write(254, &[0, 0, 0]).unwrap_err(), IOError::OutOfBounds);
            let mut buf = [0u8; 2];
            flash.read(254, &mut buf).unwrap();
            assert_eq!(buf, [0xFF, 0xFF]);
        }

        it "shares the backing array between clones" {
            let alias = flash.clone();
            flash.write(0, &[0x42]).unwrap();
            let mut buf = [0u8; 1];
            alias.read(0, &mut buf).unwrap();
            assert_eq!(buf[0], 0x42);
        }
    }
}
