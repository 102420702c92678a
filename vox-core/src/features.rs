//! Waveform preparation and feature extraction.
//!
//! The classifier expects a log-mel spectrogram of a fixed-length 8 kHz waveform:
//! 64 mel bands x 81 frames, flattened band-major into `INPUT_SIZE` values.

use std::f64::consts::PI;

/// Microphone sample rate (Hz).
pub const SAMPLE_RATE: u32 = 8000;
/// Samples per classified waveform (2 seconds).
pub const TARGET_LEN: usize = 16000;
pub const N_MELS: usize = 64;
pub const N_FFT: usize = 400;
pub const HOP_LENGTH: usize = 200;
/// Frames produced for a `TARGET_LEN` waveform with centred framing.
pub const N_FRAMES: usize = TARGET_LEN / HOP_LENGTH + 1;
/// Accelerator input word count.
pub const INPUT_SIZE: usize = N_MELS * N_FRAMES;

const I16_SCALE: f32 = 32768.0;
const POWER_FLOOR: f64 = 1e-10;

/// Scale signed 16-bit samples into [-1.0, 1.0).
pub fn normalize(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / I16_SCALE).collect()
}

/// Bring a waveform to exactly `target` samples.
/// Shorter input is zero-padded on both sides (left gets the smaller half); longer input keeps
/// its first `target` samples; input already at `target` is returned unchanged.
pub fn fit_to_length(mut waveform: Vec<f32>, target: usize) -> Vec<f32> {
    if waveform.len() >= target {
        waveform.truncate(target);
        return waveform;
    }
    let deficit = target - waveform.len();
    let left = deficit / 2;
    let right = deficit - left;
    let mut out = Vec::with_capacity(target);
    out.resize(left, 0.0);
    out.extend_from_slice(&waveform);
    out.resize(out.len() + right, 0.0);
    out
}

/// Waveform in, fixed-size feature vector out. Implementations must be deterministic.
pub trait FeatureExtractor: Send + Sync {
    /// Features for a unit-scaled waveform of `TARGET_LEN` samples.
    fn extract(&self, waveform: &[f32]) -> Vec<f32>;

    /// Number of values `extract` returns.
    fn output_len(&self) -> usize {
        INPUT_SIZE
    }
}

/// Log-power mel spectrogram: periodic Hann window, centred frames with reflect padding,
/// HTK mel scale with unnormalised triangular filters, `10 * log10(max(power, 1e-10))`.
pub struct LogMelSpectrogram {
    sample_rate: u32,
    n_fft: usize,
    hop_length: usize,
    n_mels: usize,
    window: Vec<f64>,
    cos_table: Vec<f64>,
    sin_table: Vec<f64>,
    /// `n_mels` rows of `n_fft / 2 + 1` weights.
    filterbank: Vec<Vec<f64>>,
}

impl LogMelSpectrogram {
    pub fn new(sample_rate: u32, n_fft: usize, hop_length: usize, n_mels: usize) -> Self {
        let n_fft = n_fft.max(2);
        let window = (0..n_fft)
            .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / n_fft as f64).cos())
            .collect();
        let cos_table = (0..n_fft)
            .map(|j| (2.0 * PI * j as f64 / n_fft as f64).cos())
            .collect();
        let sin_table = (0..n_fft)
            .map(|j| (2.0 * PI * j as f64 / n_fft as f64).sin())
            .collect();
        let filterbank = mel_filterbank(sample_rate, n_fft / 2 + 1, n_mels);
        Self {
            sample_rate,
            n_fft,
            hop_length: hop_length.max(1),
            n_mels,
            window,
            cos_table,
            sin_table,
            filterbank,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Frames produced for `len` input samples.
    pub fn frame_count(&self, len: usize) -> usize {
        len / self.hop_length + 1
    }

    fn power_spectrum(&self, frame: &[f64], out: &mut [f64]) {
        let n = self.n_fft;
        for (k, bin) in out.iter_mut().enumerate() {
            let mut re = 0.0;
            let mut im = 0.0;
            for (i, &x) in frame.iter().enumerate() {
                let j = (k * i) % n;
                re += x * self.cos_table[j];
                im -= x * self.sin_table[j];
            }
            *bin = re * re + im * im;
        }
    }
}

impl Default for LogMelSpectrogram {
    fn default() -> Self {
        Self::new(SAMPLE_RATE, N_FFT, HOP_LENGTH, N_MELS)
    }
}

impl FeatureExtractor for LogMelSpectrogram {
    fn extract(&self, waveform: &[f32]) -> Vec<f32> {
        let frames = self.frame_count(waveform.len());
        let n_freqs = self.n_fft / 2 + 1;
        let half = (self.n_fft / 2) as isize;
        let mut frame = vec![0.0f64; self.n_fft];
        let mut power = vec![0.0f64; n_freqs];
        let mut out = vec![0.0f32; self.n_mels * frames];

        for t in 0..frames {
            let start = (t * self.hop_length) as isize - half;
            for (i, slot) in frame.iter_mut().enumerate() {
                let sample = reflect_sample(waveform, start + i as isize);
                *slot = sample * self.window[i];
            }
            self.power_spectrum(&frame, &mut power);
            for (m, weights) in self.filterbank.iter().enumerate() {
                let energy: f64 = weights.iter().zip(&power).map(|(w, p)| w * p).sum();
                out[m * frames + t] = (10.0 * energy.max(POWER_FLOOR).log10()) as f32;
            }
        }
        out
    }

    fn output_len(&self) -> usize {
        self.n_mels * self.frame_count(TARGET_LEN)
    }
}

/// Sample at a possibly out-of-range index, mirroring around the ends without repeating them.
fn reflect_sample(samples: &[f32], index: isize) -> f64 {
    let n = samples.len() as isize;
    if n == 0 {
        return 0.0;
    }
    if n == 1 {
        return samples[0] as f64;
    }
    let period = 2 * (n - 1);
    let mut i = index.rem_euclid(period);
    if i >= n {
        i = period - i;
    }
    samples[i as usize] as f64
}

fn hz_to_mel(hz: f64) -> f64 {
    2595.0 * (1.0 + hz / 700.0).log10()
}

fn mel_to_hz(mel: f64) -> f64 {
    700.0 * (10f64.powf(mel / 2595.0) - 1.0)
}

/// Corner frequencies of the triangular filters: `n_mels + 2` points from 0 Hz to Nyquist.
fn mel_points(sample_rate: u32, n_mels: usize) -> Vec<f64> {
    let m_max = hz_to_mel(sample_rate as f64 / 2.0);
    (0..n_mels + 2)
        .map(|i| mel_to_hz(m_max * i as f64 / (n_mels + 1) as f64))
        .collect()
}

fn mel_filterbank(sample_rate: u32, n_freqs: usize, n_mels: usize) -> Vec<Vec<f64>> {
    let nyquist = sample_rate as f64 / 2.0;
    let freqs: Vec<f64> = (0..n_freqs)
        .map(|k| nyquist * k as f64 / (n_freqs.saturating_sub(1).max(1)) as f64)
        .collect();
    let f_pts = mel_points(sample_rate, n_mels);
    (0..n_mels)
        .map(|m| {
            let lower = f_pts[m + 1] - f_pts[m];
            let upper = f_pts[m + 2] - f_pts[m + 1];
            freqs
                .iter()
                .map(|&f| {
                    let down = (f - f_pts[m]) / lower;
                    let up = (f_pts[m + 2] - f) / upper;
                    down.min(up).max(0.0)
                })
                .collect()
        })
        .collect()
}
