//! Feature & inference bridge: assembled samples in, label out.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::features::{self, FeatureExtractor, INPUT_SIZE, TARGET_LEN};
use crate::hardware::{self, Accelerator, BufferPool, DeviceError, HardwareTransaction, OUTPUT_SIZE};
use crate::labels::{Label, LABELS};

/// Turns a waveform into a classification through the accelerator. Cheap to clone.
#[derive(Clone)]
pub struct InferenceBridge {
    extractor: Arc<dyn FeatureExtractor>,
    pool: BufferPool,
}

impl InferenceBridge {
    pub fn new(extractor: Arc<dyn FeatureExtractor>, pool: BufferPool) -> Self {
        Self { extractor, pool }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Normalize, fit to `TARGET_LEN`, extract features, and encode them as input words.
    pub fn prepare(&self, waveform: &[i16]) -> Result<Vec<u32>, InferenceError> {
        let signal = features::fit_to_length(features::normalize(waveform), TARGET_LEN);
        let feats = self.extractor.extract(&signal);
        if feats.len() != INPUT_SIZE {
            return Err(InferenceError::FeatureShape {
                expected: INPUT_SIZE,
                actual: feats.len(),
            });
        }
        Ok(hardware::floats_to_words(&feats))
    }

    /// Full classification: features, one hardware transaction, argmax, label lookup.
    /// Blocks for the duration of the transfer.
    pub fn classify(
        &self,
        waveform: &[i16],
        device: &mut dyn Accelerator,
    ) -> Result<Label, InferenceError> {
        let words = self.prepare(waveform)?;
        let tx = HardwareTransaction::begin(&self.pool, INPUT_SIZE, OUTPUT_SIZE)?;
        let output = tx.run(device, &words)?;
        let logits: [f32; OUTPUT_SIZE] =
            output
                .try_into()
                .map_err(|v: Vec<f32>| InferenceError::OutputShape {
                    expected: OUTPUT_SIZE,
                    actual: v.len(),
                })?;
        let label = predict(&logits)?;
        debug!(?logits, "logits");
        info!(%label, "predicted class");
        Ok(label)
    }
}

/// Label of the largest logit (first index wins ties).
pub fn predict(logits: &[f32; OUTPUT_SIZE]) -> Result<Label, InferenceError> {
    let index = hardware::argmax(logits).ok_or(InferenceError::NoPrediction)?;
    Ok(LABELS[index])
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("feature extractor produced {actual} values, expected {expected}")]
    FeatureShape { expected: usize, actual: usize },
    #[error("device returned {actual} output words, expected {expected}")]
    OutputShape { expected: usize, actual: usize },
    #[error("no finite logit in device output")]
    NoPrediction,
    #[error("hardware: {0}")]
    Device(#[from] DeviceError),
    #[error("hardware did not complete within {0:?}")]
    TimedOut(Duration),
    #[error("accelerator still held by an earlier transaction")]
    Busy,
    #[error("inference worker aborted: {0}")]
    Aborted(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::DmaBuffer;

    const WINDOW_START: usize = TARGET_LEN / 2 - INPUT_SIZE / 2;

    /// Extractor that returns the centre INPUT_SIZE samples unchanged.
    struct Passthrough;

    impl FeatureExtractor for Passthrough {
        fn extract(&self, waveform: &[f32]) -> Vec<f32> {
            waveform[WINDOW_START..WINDOW_START + INPUT_SIZE].to_vec()
        }
    }

    struct Short;

    impl FeatureExtractor for Short {
        fn extract(&self, _: &[f32]) -> Vec<f32> {
            vec![0.0; 3]
        }
    }

    /// Device that answers with fixed logits and records what it was sent.
    struct Fixed {
        logits: [f32; OUTPUT_SIZE],
        seen: Vec<u32>,
    }

    impl Accelerator for Fixed {
        fn transfer(&mut self, input: &DmaBuffer, output: &mut DmaBuffer) -> Result<(), DeviceError> {
            self.seen = input.as_slice().to_vec();
            output.copy_from(&hardware::floats_to_words(&self.logits))
        }
    }

    fn logits_peaking_at(i: usize) -> [f32; OUTPUT_SIZE] {
        let mut l = [0.0f32; OUTPUT_SIZE];
        l[i] = 4.0;
        l
    }

    #[test]
    fn classify_maps_argmax_to_label() {
        let pool = BufferPool::new();
        let bridge = InferenceBridge::new(Arc::new(Passthrough), pool.clone());
        let mut dev = Fixed {
            logits: logits_peaking_at(9),
            seen: Vec::new(),
        };
        let label = bridge.classify(&[100, -200, 300], &mut dev).unwrap();
        assert_eq!(label, Label::Up);
        assert_eq!(dev.seen.len(), INPUT_SIZE);
        assert_eq!(pool.live(), 0);
    }

    #[test]
    fn short_waveform_is_centred_before_extraction() {
        let bridge = InferenceBridge::new(Arc::new(Passthrough), BufferPool::new());
        // TARGET_LEN - 2 deficit: 7999 zeros on the left, 16384 / 32768 = 0.5 lands at index 7999.
        let words = bridge.prepare(&[16384, 16384]).unwrap();
        let feats = hardware::words_to_floats(&words);
        assert_eq!(feats[7998 - WINDOW_START], 0.0);
        assert_eq!(feats[7999 - WINDOW_START], 0.5);
        assert_eq!(feats[8000 - WINDOW_START], 0.5);
        assert_eq!(feats[8001 - WINDOW_START], 0.0);
    }

    #[test]
    fn wrong_feature_length_is_rejected() {
        let pool = BufferPool::new();
        let bridge = InferenceBridge::new(Arc::new(Short), pool.clone());
        let mut dev = Fixed {
            logits: logits_peaking_at(0),
            seen: Vec::new(),
        };
        let r = bridge.classify(&[1, 2, 3], &mut dev);
        assert!(matches!(
            r,
            Err(InferenceError::FeatureShape {
                expected: INPUT_SIZE,
                actual: 3
            })
        ));
        assert_eq!(pool.allocations(), 0);
    }

    #[test]
    fn predict_ties_pick_lowest_index() {
        let mut l = [1.0f32; OUTPUT_SIZE];
        l[7] = 2.0;
        l[8] = 2.0;
        assert_eq!(predict(&l).unwrap(), Label::Odm);
        assert!(matches!(
            predict(&[f32::NAN; OUTPUT_SIZE]),
            Err(InferenceError::NoPrediction)
        ));
    }
}
