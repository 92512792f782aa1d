// rust/feed-core/src/record.rs

use serde::{Deserialize, Serialize};

use crate::error::{FeedError, Result};

/// A reusable container for one decoded database entry.
///
/// Records are allocated once per channel slot and overwritten in place as
/// they cycle between a channel's empty and filled queues.
pub trait Record: Default + Send + 'static {
    /// Replaces the contents of this record with the entry encoded in `bytes`.
    fn decode_from(&mut self, bytes: &[u8]) -> Result<()>;

    /// Class label carried by the record, if any.
    fn label(&self) -> Option<i32> {
        None
    }
}

/// Opaque record bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord(pub Vec<u8>);

impl RawRecord {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Record for RawRecord {
    fn decode_from(&mut self, bytes: &[u8]) -> Result<()> {
        self.0.clear();
        self.0.extend_from_slice(bytes);
        Ok(())
    }
}

/// A labelled sample of `channels x height x width` bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Datum {
    pub channels: u32,
    pub height: u32,
    pub width: u32,
    pub data: Vec<u8>,
    pub label: i32,
    /// True when `data` holds a compressed image rather than raw pixels.
    pub encoded: bool,
}

impl Datum {
    pub fn new(channels: u32, height: u32, width: u32, data: Vec<u8>, label: i32) -> Self {
        Self {
            channels,
            height,
            width,
            data,
            label,
            encoded: false,
        }
    }

    /// Number of bytes the sample shape calls for.
    pub fn sample_len(&self) -> usize {
        self.channels as usize * self.height as usize * self.width as usize
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| FeedError::decode(format!("failed to encode datum: {e}")))
    }
}

impl Record for Datum {
    fn decode_from(&mut self, bytes: &[u8]) -> Result<()> {
        *self = bincode::deserialize(bytes)
            .map_err(|e| FeedError::decode(format!("failed to decode datum: {e}")))?;
        Ok(())
    }

    fn label(&self) -> Option<i32> {
        Some(self.label)
    }
}

/// Turns a decoded record into one sample of a batch.
pub trait Transform<R>: Send + 'static {
    /// Shape of the sample produced from `record`, in bytes per dimension.
    fn sample_shape(&self, record: &R) -> Result<Vec<usize>>;

    /// Writes the sample for `record` into `out`, which is exactly as long as
    /// the product of [`Transform::sample_shape`].
    fn apply(&mut self, record: &R, out: &mut [u8]) -> Result<()>;
}

/// Copies record payload bytes unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Transform<RawRecord> for Passthrough {
    fn sample_shape(&self, record: &RawRecord) -> Result<Vec<usize>> {
        Ok(vec![record.0.len()])
    }

    fn apply(&mut self, record: &RawRecord, out: &mut [u8]) -> Result<()> {
        if record.0.len() != out.len() {
            return Err(FeedError::shape(format!(
                "raw record of {} bytes does not fit a {}-byte sample",
                record.0.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&record.0);
        Ok(())
    }
}

impl Transform<Datum> for Passthrough {
    fn sample_shape(&self, record: &Datum) -> Result<Vec<usize>> {
        if record.encoded {
            return Err(FeedError::decode("encoded datums need an image-decoding transform"));
        }
        Ok(vec![
            record.channels as usize,
            record.height as usize,
            record.width as usize,
        ])
    }

    fn apply(&mut self, record: &Datum, out: &mut [u8]) -> Result<()> {
        if record.encoded {
            return Err(FeedError::decode("encoded datums need an image-decoding transform"));
        }
        if record.data.len() != record.sample_len() {
            return Err(FeedError::shape(format!(
                "datum declares {}x{}x{} but carries {} bytes",
                record.channels,
                record.height,
                record.width,
                record.data.len()
            )));
        }
        if record.data.len() != out.len() {
            return Err(FeedError::shape(format!(
                "datum of {} bytes does not fit a {}-byte sample",
                record.data.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&record.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_record_reuses_allocation() {
        let mut record = RawRecord(Vec::with_capacity(64));
        let capacity = record.0.capacity();
        record.decode_from(b"hello").unwrap();
        assert_eq!(record.as_bytes(), b"hello");
        record.decode_from(b"hi").unwrap();
        assert_eq!(record.as_bytes(), b"hi");
        assert_eq!(record.0.capacity(), capacity);
        assert_eq!(record.label(), None);
    }

    #[test]
    fn test_datum_decode() {
        let datum = Datum::new(1, 2, 2, vec![1, 2, 3, 4], 7);
        let bytes = datum.to_bytes().unwrap();

        let mut decoded = Datum::default();
        decoded.decode_from(&bytes).unwrap();
        assert_eq!(decoded, datum);
        assert_eq!(decoded.label(), Some(7));
    }

    #[test]
    fn test_datum_decode_garbage_fails() {
        let mut datum = Datum::default();
        let err = datum.decode_from(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, FeedError::Decode { .. }));
    }

    #[test]
    fn test_passthrough_datum() {
        let datum = Datum::new(3, 1, 2, vec![9; 6], 0);
        let mut transform = Passthrough;
        assert_eq!(transform.sample_shape(&datum).unwrap(), vec![3, 1, 2]);

        let mut out = [0u8; 6];
        transform.apply(&datum, &mut out).unwrap();
        assert_eq!(out, [9; 6]);

        let mut short = [0u8; 4];
        assert!(transform.apply(&datum, &mut short).is_err());
    }

    #[test]
    fn test_passthrough_rejects_inconsistent_datum() {
        let mut transform = Passthrough;
        let lying = Datum::new(2, 2, 2, vec![0; 3], 0);
        let mut out = [0u8; 8];
        assert!(matches!(
            transform.apply(&lying, &mut out),
            Err(FeedError::Shape { .. })
        ));

        let encoded = Datum {
            encoded: true,
            ..Datum::new(1, 1, 1, vec![0], 0)
        };
        assert!(Transform::<Datum>::sample_shape(&transform, &encoded).is_err());
    }

    #[test]
    fn test_passthrough_raw() {
        let record = RawRecord(b"abc".to_vec());
        let mut transform = Passthrough;
        assert_eq!(transform.sample_shape(&record).unwrap(), vec![3]);
        let mut out = [0u8; 3];
        transform.apply(&record, &mut out).unwrap();
        assert_eq!(&out, b"abc");
    }
}
