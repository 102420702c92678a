//! Fragment: one inbound payload decoded as little-endian 16-bit signed samples.

/// Bytes per sample on the wire.
pub const SAMPLE_WIDTH: usize = 2;

/// One received fragment. Immutable once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    samples: Vec<i16>,
}

impl Fragment {
    /// Decode a raw payload. Odd-length payloads are rejected; empty payloads are valid.
    pub fn decode(bytes: &[u8]) -> Result<Self, FragmentError> {
        if bytes.len() % SAMPLE_WIDTH != 0 {
            return Err(FragmentError::OddLength(bytes.len()));
        }
        let samples = bytes
            .chunks_exact(SAMPLE_WIDTH)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        Ok(Self { samples })
    }

    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Leading sample (command code when this is a session's first fragment).
    pub fn head(&self) -> Option<i16> {
        self.samples.first().copied()
    }

    /// Everything after the leading sample.
    pub fn tail(&self) -> &[i16] {
        self.samples.get(1..).unwrap_or(&[])
    }

    /// Encode samples back to the wire layout (used by simulators and tests).
    pub fn encode(&self) -> Vec<u8> {
        self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("payload length {0} is not a multiple of the sample width")]
    OddLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian() {
        let f = Fragment::decode(&[0x01, 0x00, 0xff, 0xff, 0x00, 0x80]).unwrap();
        assert_eq!(f.samples(), &[1, -1, i16::MIN]);
        assert_eq!(f.head(), Some(1));
        assert_eq!(f.tail(), &[-1, i16::MIN]);
    }

    #[test]
    fn rejects_odd_length() {
        assert_eq!(
            Fragment::decode(&[1, 2, 3]),
            Err(FragmentError::OddLength(3))
        );
    }

    #[test]
    fn empty_payload_has_no_head() {
        let f = Fragment::decode(&[]).unwrap();
        assert_eq!(f.head(), None);
        assert!(f.tail().is_empty());
    }

    #[test]
    fn encode_matches_wire_layout() {
        let f = Fragment::from_samples(vec![0, 300, -2]);
        assert_eq!(Fragment::decode(&f.encode()).unwrap(), f);
    }
}
