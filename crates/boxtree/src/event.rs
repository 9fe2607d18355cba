//! Events stored in the box-tree.
//!
//! An event is an immutable record of a signal, its squared error, and one
//! coordinate per dimension of the tree.  Events are persisted as fixed-width
//! little-endian records, so a payload written by [`encode_events`] and read
//! back by [`decode_events`] is bit-identical to what was saved.

use std::fmt::Debug;
use std::mem::size_of;

use boxtree_storage::StorageError;
use smallvec::SmallVec;

/// Coordinates of an event.  Up to four dimensions are stored inline.
pub type Coordinates = SmallVec<[f64; 4]>;

/// The storage contract shared by every event type the tree can hold.
pub trait Event: Clone + Debug + Send + Sync + 'static {
    /// Name recorded in the persisted tree index, so a container written with
    /// one event type is never reopened as another.
    const KIND: &'static str;

    fn signal(&self) -> f64;

    fn error_squared(&self) -> f64;

    fn coordinates(&self) -> &[f64];

    /// Size of one persisted record for a tree with `dimensions` dimensions.
    fn record_len(dimensions: usize) -> usize;

    /// Appends this event's record to `out`.
    fn encode_into(&self, out: &mut Vec<u8>);

    /// Decodes a record of exactly [`Event::record_len`] bytes.
    fn decode(record: &[u8], dimensions: usize) -> Self;

    /// Heap memory owned by this event, beyond `size_of::<Self>()`.
    fn heap_bytes(&self) -> usize {
        0
    }
}

fn heap_coordinate_bytes(coordinates: &Coordinates) -> usize {
    if coordinates.spilled() {
        coordinates.capacity() * size_of::<f64>()
    } else {
        0
    }
}

fn read_f64(bytes: &[u8], at: usize) -> f64 {
    let mut buf = [0; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    f64::from_le_bytes(buf)
}

fn decode_coordinates(bytes: &[u8], dimensions: usize) -> Coordinates {
    (0..dimensions).map(|d| read_f64(bytes, d * 8)).collect()
}

/// An event carrying only a signal, an error, and coordinates.
#[derive(Clone, Debug, PartialEq)]
pub struct LeanEvent {
    pub signal: f64,
    pub error_squared: f64,
    pub coordinates: Coordinates,
}

impl LeanEvent {
    pub fn new(signal: f64, error_squared: f64, coordinates: &[f64]) -> Self {
        Self {
            signal,
            error_squared,
            coordinates: Coordinates::from_slice(coordinates),
        }
    }
}

impl Event for LeanEvent {
    const KIND: &'static str = "lean";

    fn signal(&self) -> f64 {
        self.signal
    }

    fn error_squared(&self) -> f64 {
        self.error_squared
    }

    fn coordinates(&self) -> &[f64] {
        &self.coordinates
    }

    fn record_len(dimensions: usize) -> usize {
        (2 + dimensions) * size_of::<f64>()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.signal.to_le_bytes());
        out.extend_from_slice(&self.error_squared.to_le_bytes());
        for c in &self.coordinates {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }

    fn decode(record: &[u8], dimensions: usize) -> Self {
        Self {
            signal: read_f64(record, 0),
            error_squared: read_f64(record, 8),
            coordinates: decode_coordinates(&record[16..], dimensions),
        }
    }

    fn heap_bytes(&self) -> usize {
        heap_coordinate_bytes(&self.coordinates)
    }
}

/// An event that also records which run and detector produced it.
#[derive(Clone, Debug, PartialEq)]
pub struct ExtendedEvent {
    pub signal: f64,
    pub error_squared: f64,
    pub run_index: u16,
    pub detector_id: u32,
    pub coordinates: Coordinates,
}

impl ExtendedEvent {
    pub fn new(
        signal: f64,
        error_squared: f64,
        run_index: u16,
        detector_id: u32,
        coordinates: &[f64],
    ) -> Self {
        Self {
            signal,
            error_squared,
            run_index,
            detector_id,
            coordinates: Coordinates::from_slice(coordinates),
        }
    }
}

impl Event for ExtendedEvent {
    const KIND: &'static str = "extended";

    fn signal(&self) -> f64 {
        self.signal
    }

    fn error_squared(&self) -> f64 {
        self.error_squared
    }

    fn coordinates(&self) -> &[f64] {
        &self.coordinates
    }

    fn record_len(dimensions: usize) -> usize {
        (2 + dimensions) * size_of::<f64>() + size_of::<u16>() + size_of::<u32>()
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.signal.to_le_bytes());
        out.extend_from_slice(&self.error_squared.to_le_bytes());
        out.extend_from_slice(&self.run_index.to_le_bytes());
        out.extend_from_slice(&self.detector_id.to_le_bytes());
        for c in &self.coordinates {
            out.extend_from_slice(&c.to_le_bytes());
        }
    }

    fn decode(record: &[u8], dimensions: usize) -> Self {
        Self {
            signal: read_f64(record, 0),
            error_squared: read_f64(record, 8),
            run_index: u16::from_le_bytes([record[16], record[17]]),
            detector_id: u32::from_le_bytes([record[18], record[19], record[20], record[21]]),
            coordinates: decode_coordinates(&record[22..], dimensions),
        }
    }

    fn heap_bytes(&self) -> usize {
        heap_coordinate_bytes(&self.coordinates)
    }
}

/// Serializes `events` as consecutive fixed-width records.
pub fn encode_events<E: Event>(events: &[E], dimensions: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(events.len() * E::record_len(dimensions));
    for event in events {
        event.encode_into(&mut out);
    }
    out
}

/// Parses a payload written by [`encode_events`].
pub fn decode_events<E: Event>(payload: &[u8], dimensions: usize) -> Result<Vec<E>, StorageError> {
    let record_len = E::record_len(dimensions);
    if payload.len() % record_len != 0 {
        return Err(StorageError::Corrupt(format!(
            "payload of {} bytes is not a whole number of {}-byte {} records",
            payload.len(),
            record_len,
            E::KIND
        )));
    }
    Ok(payload
        .chunks_exact(record_len)
        .map(|record| E::decode(record, dimensions))
        .collect())
}
