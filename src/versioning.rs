//! Vector-clock versioning and versioned values.

use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Outcome of comparing two vector clocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occurred {
    Before,
    After,
    Concurrently,
    Equal,
}

impl Occurred {
    /// The outcome seen from the other clock's side.
    pub fn inverse(self) -> Occurred {
        match self {
            Occurred::Before => Occurred::After,
            Occurred::After => Occurred::Before,
            other => other,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockError {
    #[error("clock serialization truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("clock entries out of order at index {index}")]
    UnsortedEntries { index: usize },
}

/// One writer's counter within a clock. Entries are kept sorted by node id
/// and a node id appears at most once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClockEntry {
    pub node_id: u16,
    pub counter: u64,
}

/// A partial-order version: per-writer counters plus the wall-clock time of
/// the last mutation. The timestamp never participates in comparison.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    entries: Vec<ClockEntry>,
    timestamp: u64,
}

impl VectorClock {
    pub fn new() -> Self {
        VectorClock {
            entries: Vec::new(),
            timestamp: now_ms(),
        }
    }

    /// Serialized size in bytes: entry count, entries, timestamp.
    pub fn size_in_bytes(&self) -> usize {
        2 + self.entries.len() * 10 + 8
    }

    pub fn entries(&self) -> &[ClockEntry] {
        &self.entries
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn counter_of(&self, node_id: u16) -> u64 {
        self.entries
            .binary_search_by_key(&node_id, |e| e.node_id)
            .map(|i| self.entries[i].counter)
            .unwrap_or(0)
    }

    /// Returns a copy with `node_id`'s counter bumped and the timestamp
    /// refreshed to `time_ms`.
    pub fn incremented(&self, node_id: u16, time_ms: u64) -> VectorClock {
        let mut entries = self.entries.clone();
        match entries.binary_search_by_key(&node_id, |e| e.node_id) {
            Ok(i) => entries[i].counter += 1,
            Err(i) => entries.insert(
                i,
                ClockEntry {
                    node_id,
                    counter: 1,
                },
            ),
        }
        VectorClock {
            entries,
            timestamp: time_ms,
        }
    }

    /// Per-node maximum of both clocks; timestamp is the max of both.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut entries = Vec::with_capacity(self.entries.len().max(other.entries.len()));
        let (mut i, mut j) = (0, 0);
        while i < self.entries.len() && j < other.entries.len() {
            let (a, b) = (self.entries[i], other.entries[j]);
            match a.node_id.cmp(&b.node_id) {
                Ordering::Less => {
                    entries.push(a);
                    i += 1;
                }
                Ordering::Greater => {
                    entries.push(b);
                    j += 1;
                }
                Ordering::Equal => {
                    entries.push(ClockEntry {
                        node_id: a.node_id,
                        counter: a.counter.max(b.counter),
                    });
                    i += 1;
                    j += 1;
                }
            }
        }
        entries.extend_from_slice(&self.entries[i..]);
        entries.extend_from_slice(&other.entries[j..]);
        VectorClock {
            entries,
            timestamp: self.timestamp.max(other.timestamp),
        }
    }

    /// Happens-before comparison over the counter vectors.
    pub fn compare(&self, other: &VectorClock) -> Occurred {
        let mut self_bigger = false;
        let mut other_bigger = false;
        let (mut i, mut j) = (0, 0);
        while i < self.entries.len() && j < other.entries.len() {
            let (a, b) = (self.entries[i], other.entries[j]);
            match a.node_id.cmp(&b.node_id) {
                Ordering::Less => {
                    self_bigger = true;
                    i += 1;
                }
                Ordering::Greater => {
                    other_bigger = true;
                    j += 1;
                }
                Ordering::Equal => {
                    match a.counter.cmp(&b.counter) {
                        Ordering::Less => other_bigger = true,
                        Ordering::Greater => self_bigger = true,
                        Ordering::Equal => {}
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
        if i < self.entries.len() {
            self_bigger = true;
        }
        if j < other.entries.len() {
            other_bigger = true;
        }

        match (self_bigger, other_bigger) {
            (false, false) => Occurred::Equal,
            (true, false) => Occurred::After,
            (false, true) => Occurred::Before,
            (true, true) => Occurred::Concurrently,
        }
    }

    /// Wire form: `u16` entry count, `entry_count x (u16 node id, u64
    /// counter)`, `u64 timestamp`, all big-endian.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size_in_bytes());
        buf.extend_from_slice(&(self.entries.len() as u16).to_be_bytes());
        for entry in &self.entries {
            buf.extend_from_slice(&entry.node_id.to_be_bytes());
            buf.extend_from_slice(&entry.counter.to_be_bytes());
        }
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<VectorClock, ClockError> {
        let (clock, consumed) = Self::from_bytes_prefix(bytes)?;
        debug_assert!(consumed <= bytes.len());
        Ok(clock)
    }

    /// Decodes a clock from the front of `bytes`, returning it together
    /// with the number of bytes consumed. Streamed values carry the clock
    /// as a prefix of the value blob.
    pub fn from_bytes_prefix(bytes: &[u8]) -> Result<(VectorClock, usize), ClockError> {
        if bytes.len() < 2 {
            return Err(ClockError::Truncated {
                expected: 2,
                got: bytes.len(),
            });
        }
        let count = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let expected = 2 + count * 10 + 8;
        if bytes.len() < expected {
            return Err(ClockError::Truncated {
                expected,
                got: bytes.len(),
            });
        }

        let mut entries: Vec<ClockEntry> = Vec::with_capacity(count);
        let mut offset = 2;
        for index in 0..count {
            let node_id = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let counter = u64::from_be_bytes(
                bytes[offset + 2..offset + 10]
                    .try_into()
                    .expect("slice is 8 bytes"),
            );
            if entries.last().is_some_and(|last| last.node_id >= node_id) {
                return Err(ClockError::UnsortedEntries { index });
            }
            entries.push(ClockEntry { node_id, counter });
            offset += 10;
        }
        let timestamp = u64::from_be_bytes(
            bytes[offset..offset + 8]
                .try_into()
                .expect("slice is 8 bytes"),
        );
        Ok((VectorClock { entries, timestamp }, expected))
    }
}

impl fmt::Debug for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clock(")?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", entry.node_id, entry.counter)?;
        }
        write!(f, ") ts={}", self.timestamp)
    }
}

/// A value paired with the clock that produced it. Two versioned values of
/// the same key whose clocks compare `Concurrently` are siblings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Versioned<V> {
    pub value: V,
    pub version: VectorClock,
}

impl<V> Versioned<V> {
    pub fn new(value: V, version: VectorClock) -> Self {
        Versioned { value, version }
    }

    pub fn map<U>(self, f: impl FnOnce(V) -> U) -> Versioned<U> {
        Versioned {
            value: f(self.value),
            version: self.version,
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
