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

//! In-memory hash index mapping keys to record bookkeeping values.
//!
//! The aim is to have something low-weight, even though it may not be the
//! fastest running map implementation: the bucket count is fixed at
//! construction and will not evolve, even if the index becomes overloaded.
//!
//! An index is parameterised at construction on one of four key disciplines
//! (see [`KeySpec`]) and never mixes them. Probes and stored keys are byte
//! slices; how they are hashed, compared and stored depends on the
//! discipline.
//!
//! Iteration is bucket-major, in insertion order within a bucket. The order
//! is unspecified but stable as long as the index is not mutated; any
//! mutation invalidates outstanding [`Cursor`]s.
//!
//! [`KeySpec`]: enum.KeySpec.html
//! [`Cursor`]: struct.Cursor.html


/// The key discipline of an index.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum KeySpec {
    /// NUL-terminated string keys, copied into the index.
    ///
    /// The logical key is the probe prefix before the first NUL byte (the
    /// whole probe if it contains none). Hash is the classic polynomial
    /// `h = 31.h + byte`; comparison is byte equality of the logical keys.
    Str,

    /// Same hash and comparison as [`Str`], but the index borrows the
    /// caller's bytes (installed through [`Dictionary::install_static`])
    /// instead of copying them.
    ///
    /// [`Str`]: #variant.Str
    /// [`Dictionary::install_static`]: struct.Dictionary.html#method.install_static
    ConstStr,

    /// Keys are exactly four little-endian bytes; hash is the value itself.
    U32,

    /// Keys are exactly `n` little-endian 32-bit words; hash is their
    /// wrapping sum, comparison is word-wise equality.
    Binary(u16),
}

impl KeySpec {
    /// Returns the fixed byte width of keys under this discipline, if any.
    fn width(self) -> Option<usize> {
        match self {
            KeySpec::Str | KeySpec::ConstStr => None,
            KeySpec::U32 => Some(4),
            KeySpec::Binary(n) => Some(n as usize * 4),
        }
    }

    /// Returns the logical key for a probe.
    ///
    /// # Panics
    ///
    /// Panics if the probe does not have the width the discipline requires.
    fn canonical(self, probe: &[u8]) -> &[u8] {
        match self.width() {
            None => match probe.iter().position(|&b| b == 0) {
                Some(n) => &probe[..n],
                None => probe,
            },
            Some(w) => {
                assert_eq!(probe.len(), w, "probe width does not match key discipline");
                probe
            }
        }
    }

    /// Hashes the logical key of a probe into a bucket number.
    fn hash(self, key: &[u8], hashsize: usize) -> usize {
        match self {
            KeySpec::Str | KeySpec::ConstStr => {
                let mut h = 0usize;
                for &b in key {
                    h = h.wrapping_mul(31).wrapping_add(b as usize);
                }
                h % hashsize
            }
            KeySpec::U32 => {
                u32::from_le_bytes([key[0], key[1], key[2], key[3]]) as usize % hashsize
            }
            KeySpec::Binary(_) => {
                let mut h = 0u32;
                for w in key.chunks(4) {
                    h = h.wrapping_add(u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
                }
                h as usize % hashsize
            }
        }
    }
}

/// Storage for one key: either copied into the index or borrowed for the
/// whole program lifetime.
enum KeyBuf {
    /// Key bytes owned by the node
    Owned(Box<[u8]>),

    /// Key bytes borrowed from the caller, never freed
    Static(&'static [u8]),
}

impl KeyBuf {
    fn bytes(&self) -> &[u8] {
        match self {
            KeyBuf::Owned(b) => b,
            KeyBuf::Static(b) => b,
        }
    }
}

/// One table entry
struct Node<V> {
    /// Handle to the key
    key: KeyBuf,

    /// Value carried for the key
    value: V,
}

/// Hash index over one key discipline.
pub struct Dictionary<V> {
    /// Key discipline, fixed at construction
    spec: KeySpec,

    /// Vector of buckets, each bucket containing a vector of nodes
    buckets: Vec<Vec<Node<V>>>,

    /// Number of keys installed
    count: usize,
}

/// A position inside a [`Dictionary`], for resumable iteration.
///
/// A cursor stays valid only as long as the index is not structurally
/// mutated (install or remove); read or rewrite a value through it, then
/// fetch a fresh one.
///
/// [`Dictionary`]: struct.Dictionary.html
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Cursor {
    /// Number of the bucket the node lives in
    bucket: usize,

    /// Index of the node inside the bucket
    pos: usize,
}

/// Iterator over a `Dictionary`, yielding `(key, value)` pairs.
pub struct Iter<'a, V: 'a> {
    /// Reference to the index
    dict: &'a Dictionary<V>,

    /// Number of the bucket for the next node to return
    bucket: usize,

    /// Index inside the bucket for the next node to return
    pos: usize,
}

impl<V> Dictionary<V> {
    /// Creates a new index with a fixed number of buckets.
    ///
    /// # Panics
    ///
    /// Panics if `hashsize` is 0.
    pub fn new(spec: KeySpec, hashsize: usize) -> Dictionary<V> {
        assert_ne!(hashsize, 0, "Cannot initialize an index with no buckets");
        Dictionary {
            spec,
            buckets: (0..hashsize).map(|_| Vec::new()).collect(),
            count: 0,
        }
    }

    /// Locates a probe, returning its bucket and position if present.
    fn lookup(&self, probe: &[u8]) -> (usize, Option<usize>) {
        let key = self.spec.canonical(probe);
        let bucket = self.spec.hash(key, self.buckets.len());
        let pos = self.buckets[bucket]
            .iter()
            .position(|n| n.key.bytes() == key);
        (bucket, pos)
    }

    /// Installs a value for a key if the key is absent.
    ///
    /// If the key is already present its value is returned unchanged and
    /// `value` is dropped; use [`replace`] to overwrite.
    ///
    /// [`replace`]: #method.replace
    pub fn install(&mut self, probe: &[u8], value: V) -> &mut V {
        let (bucket, pos) = self.lookup(probe);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                let key = KeyBuf::Owned(self.spec.canonical(probe).to_vec().into_boxed_slice());
                self.buckets[bucket].push(Node { key, value });
                self.count += 1;
                self.buckets[bucket].len() - 1
            }
        };
        &mut self.buckets[bucket][pos].value
    }

    /// Installs a value for a borrowed key if the key is absent.
    ///
    /// This is the zero-copy path for the [`ConstStr`] discipline; the index
    /// stores the reference verbatim and never copies the bytes.
    ///
    /// [`ConstStr`]: enum.KeySpec.html#variant.ConstStr
    pub fn install_static(&mut self, probe: &'static [u8], value: V) -> &mut V {
        let (bucket, pos) = self.lookup(probe);
        let pos = match pos {
            Some(pos) => pos,
            None => {
                let key = KeyBuf::Static(self.spec.canonical(probe));
                self.buckets[bucket].push(Node { key, value });
                self.count += 1;
                self.buckets[bucket].len() - 1
            }
        };
        &mut self.buckets[bucket][pos].value
    }

    /// Installs or overwrites the value for a key.
    pub fn replace(&mut self, probe: &[u8], value: V) -> &mut V {
        let (bucket, pos) = self.lookup(probe);
        let pos = match pos {
            Some(pos) => {
                self.buckets[bucket][pos].value = value;
                pos
            }
            None => {
                let key = KeyBuf::Owned(self.spec.canonical(probe).to_vec().into_boxed_slice());
                self.buckets[bucket].push(Node { key, value });
                self.count += 1;
                self.buckets[bucket].len() - 1
            }
        };
        &mut self.buckets[bucket][pos].value
    }

    /// Returns a reference to the value for a probe, if present.
    pub fn get(&self, probe: &[u8]) -> Option<&V> {
        let (bucket, pos) = self.lookup(probe);
        pos.map(move |p| &self.buckets[bucket][p].value)
    }

    /// Returns a mutable reference to the value for a probe, if present.
    pub fn get_mut(&mut self, probe: &[u8]) -> Option<&mut V> {
        let (bucket, pos) = self.lookup(probe);
        pos.map(move |p| &mut self.buckets[bucket][p].value)
    }

    /// Removes a key from the index.
    ///
    /// Returns true if a key was actually removed.
    pub fn remove(&mut self, probe: &[u8]) -> bool {
        self.take(probe).is_some()
    }

    /// Removes a key from the index, and returns its value by move, if
    /// possible.
    pub fn take(&mut self, probe: &[u8]) -> Option<V> {
        let (bucket, pos) = self.lookup(probe);
        pos.map(|p| {
            self.count -= 1;
            self.buckets[bucket].remove(p).value
        })
    }

    /// Removes every key, invoking `cb` on each before it is freed.
    pub fn remove_all<F: FnMut(&[u8], &mut V)>(&mut self, mut cb: F) {
        for bucket in &mut self.buckets {
            for node in bucket.iter_mut() {
                cb(node.key.bytes(), &mut node.value);
                self.count -= 1;
            }
            bucket.clear();
        }
        debug_assert_eq!(self.count, 0, "remove_all left keys behind");
    }

    /// Returns the number of keys installed.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Returns the number of buckets.
    pub fn hashtab_size(&self) -> usize {
        self.buckets.len()
    }

    /// Returns the chain length of one bucket.
    ///
    /// # Panics
    ///
    /// Panics if `idx` is not a valid bucket number.
    pub fn hashtab_cnt(&self, idx: usize) -> usize {
        self.buckets[idx].len()
    }

    /// Returns an iterator over references to the entries of the index.
    pub fn iter(&self) -> Iter<V> {
        Iter {
            dict: self,
            bucket: 0,
            pos: 0,
        }
    }

    /// Returns a cursor on the first entry, if any.
    pub fn first(&self) -> Option<Cursor> {
        self.skip_empty(Cursor { bucket: 0, pos: 0 })
    }

    /// Returns a cursor on the entry following `cur`, if any.
    pub fn next(&self, cur: Cursor) -> Option<Cursor> {
        self.skip_empty(Cursor {
            bucket: cur.bucket,
            pos: cur.pos + 1,
        })
    }

    /// Returns a cursor positioned on a probe, if present.
    pub fn at(&self, probe: &[u8]) -> Option<Cursor> {
        let (bucket, pos) = self.lookup(probe);
        pos.map(|pos| Cursor { bucket, pos })
    }

    /// Returns the key under a cursor.
    ///
    /// # Panics
    ///
    /// Panics if `cur` does not point at an entry.
    pub fn key_at(&self, cur: Cursor) -> &[u8] {
        self.buckets[cur.bucket][cur.pos].key.bytes()
    }

    /// Returns the value under a cursor.
    ///
    /// # Panics
    ///
    /// Panics if `cur` does not point at an entry.
    pub fn value_at(&self, cur: Cursor) -> &V {
        &self.buckets[cur.bucket][cur.pos].value
    }

    /// Returns the value under a cursor, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `cur` does not point at an entry.
    pub fn value_at_mut(&mut self, cur: Cursor) -> &mut V {
        &mut self.buckets[cur.bucket][cur.pos].value
    }

    /// Advances a candidate cursor to the first occupied position at or
    /// after it.
    fn skip_empty(&self, mut cur: Cursor) -> Option<Cursor> {
        while cur.bucket < self.buckets.len() {
            if cur.pos < self.buckets[cur.bucket].len() {
                return Some(cur);
            }
            cur.bucket += 1;
            cur.pos = 0;
        }
        None
    }
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a [u8], &'a V);

    fn next(&mut self) -> Option<(&'a [u8], &'a V)> {
        let cur = self.dict.skip_empty(Cursor {
            bucket: self.bucket,
            pos: self.pos,
        })?;
        self.bucket = cur.bucket;
        self.pos = cur.pos + 1;
        let node = &self.dict.buckets[cur.bucket][cur.pos];
        Some((node.key.bytes(), &node.value))
    }
}
