//! Hardware transaction: scoped word buffers, transfer-then-wait, IEEE-754 bit reinterpretation.
//!
//! Buffers are handed out by a `BufferPool` and released on drop, so a transaction releases
//! both of its buffers on every exit path, including transfer errors.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

/// Accelerator output word count (one logit per label slot).
pub const OUTPUT_SIZE: usize = 11;

/// Allocator for device-visible word buffers. Cloning shares the accounting.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    live: Arc<AtomicUsize>,
    allocations: Arc<AtomicU64>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer of `words` 32-bit words.
    pub fn allocate(&self, words: usize) -> Result<DmaBuffer, DeviceError> {
        if words == 0 {
            return Err(DeviceError::EmptyBuffer);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(DmaBuffer {
            words: vec![0u32; words],
            live: self.live.clone(),
        })
    }

    /// Buffers currently allocated and not yet released.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total allocations since the pool was created.
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }
}

/// Fixed-length word buffer. Released back to its pool on drop.
#[derive(Debug)]
pub struct DmaBuffer {
    words: Vec<u32>,
    live: Arc<AtomicUsize>,
}

impl DmaBuffer {
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.words
    }

    pub fn as_mut_slice(&mut self) -> &mut [u32] {
        &mut self.words
    }

    /// Fill the whole buffer. `src` must match the buffer length exactly.
    pub fn copy_from(&mut self, src: &[u32]) -> Result<(), DeviceError> {
        if src.len() != self.words.len() {
            return Err(DeviceError::LengthMismatch {
                expected: self.words.len(),
                actual: src.len(),
            });
        }
        self.words.copy_from_slice(src);
        Ok(())
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A device that consumes an input word buffer and fills an output word buffer.
pub trait Accelerator: Send {
    /// Start the outbound and inbound transfers and block until both complete.
    fn transfer(&mut self, input: &DmaBuffer, output: &mut DmaBuffer) -> Result<(), DeviceError>;
}

/// One scoped use of the accelerator: input and output buffers live exactly as long as this value.
pub struct HardwareTransaction {
    input: DmaBuffer,
    output: DmaBuffer,
}

impl HardwareTransaction {
    /// Acquire both buffers. If the second allocation fails the first is released.
    pub fn begin(
        pool: &BufferPool,
        input_words: usize,
        output_words: usize,
    ) -> Result<Self, DeviceError> {
        let input = pool.allocate(input_words)?;
        debug!(words = input_words, "input buffer allocated");
        let output = pool.allocate(output_words)?;
        debug!(words = output_words, "output buffer allocated");
        Ok(Self { input, output })
    }

    /// Copy `words` in, run the transfer pair, and decode the output words as floats.
    /// Consumes the transaction; both buffers are released whatever the outcome.
    pub fn run(
        mut self,
        device: &mut dyn Accelerator,
        words: &[u32],
    ) -> Result<Vec<f32>, DeviceError> {
        self.input.copy_from(words)?;
        debug!("input buffer data prepared");
        device.transfer(&self.input, &mut self.output)?;
        let logits = words_to_floats(self.output.as_slice());
        debug!(?logits, "output buffer received");
        Ok(logits)
    }
}

impl Drop for HardwareTransaction {
    fn drop(&mut self) {
        debug!("input and output buffers freed");
    }
}

/// Reinterpret float bit patterns as words (no numeric conversion).
pub fn floats_to_words(values: &[f32]) -> Vec<u32> {
    values.iter().map(|v| v.to_bits()).collect()
}

/// Reinterpret words as float bit patterns.
pub fn words_to_floats(words: &[u32]) -> Vec<f32> {
    words.iter().map(|&w| f32::from_bits(w)).collect()
}

/// Index of the largest value; ties resolve to the lowest index. NaNs are skipped.
pub fn argmax(values: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &v) in values.iter().enumerate() {
        if v.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if v <= b => {}
            _ => best = Some((i, v)),
        }
    }
    best.map(|(i, _)| i)
}

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("zero-length buffer requested")]
    EmptyBuffer,
    #[error("buffer length mismatch: expected {expected} words, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("device I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("transfer failed: {0}")]
    Transfer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echoes the first output-length input words back.
    struct Echo;

    impl Accelerator for Echo {
        fn transfer(&mut self, input: &DmaBuffer, output: &mut DmaBuffer) -> Result<(), DeviceError> {
            let n = output.len();
            output.as_mut_slice().copy_from_slice(&input.as_slice()[..n]);
            Ok(())
        }
    }

    struct Broken;

    impl Accelerator for Broken {
        fn transfer(&mut self, _: &DmaBuffer, _: &mut DmaBuffer) -> Result<(), DeviceError> {
            Err(DeviceError::Transfer("channel halted".into()))
        }
    }

    #[test]
    fn bit_patterns_survive_exactly() {
        let values: Vec<f32> = vec![0.0, -0.0, 1.5, f32::MIN_POSITIVE, f32::MAX, -3.25e-7, f32::INFINITY];
        let words = floats_to_words(&values);
        assert_eq!(words[1], 0x8000_0000);
        let back = words_to_floats(&words);
        for (a, b) in values.iter().zip(&back) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn transaction_round_trips_through_device() {
        let pool = BufferPool::new();
        let input: Vec<f32> = (0..32).map(|i| i as f32 * 0.25 - 3.0).collect();
        let tx = HardwareTransaction::begin(&pool, 32, OUTPUT_SIZE).unwrap();
        assert_eq!(pool.live(), 2);
        let logits = tx.run(&mut Echo, &floats_to_words(&input)).unwrap();
        assert_eq!(logits.len(), OUTPUT_SIZE);
        for (a, b) in input.iter().zip(&logits) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn buffers_released_on_transfer_error() {
        let pool = BufferPool::new();
        let tx = HardwareTransaction::begin(&pool, 8, OUTPUT_SIZE).unwrap();
        let r = tx.run(&mut Broken, &[0u32; 8]);
        assert!(matches!(r, Err(DeviceError::Transfer(_))));
        assert_eq!(pool.live(), 0);
        assert_eq!(pool.allocations(), 2);
    }

    #[test]
    fn buffers_released_on_length_mismatch() {
        let pool = BufferPool::new();
        let tx = HardwareTransaction::begin(&pool, 8, OUTPUT_SIZE).unwrap();
        let r = tx.run(&mut Echo, &[0u32; 7]);
        assert!(matches!(
            r,
            Err(DeviceError::LengthMismatch {
                expected: 8,
                actual: 7
            })
        ));
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn failed_begin_releases_first_buffer() {
        let pool = BufferPool::new();
        assert!(HardwareTransaction::begin(&pool, 8, 0).is_err());
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn argmax_unique_and_ties() {
        assert_eq!(argmax(&[0.1, 3.0, -2.0]), Some(1));
        assert_eq!(argmax(&[5.0, 1.0, 5.0, 5.0]), Some(0));
        assert_eq!(argmax(&[-1.0, 2.0, 2.0]), Some(1));
        assert_eq!(argmax(&[f32::NAN, 1.0, 0.5]), Some(1));
        assert_eq!(argmax(&[]), None);
        assert_eq!(argmax(&[f32::NAN]), None);
    }
}
