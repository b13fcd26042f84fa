use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Samples per 20 ms frame at the 16 kHz input rate.
pub const INPUT_FRAME_SAMPLES: usize = 320;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1, // mono
    )?;
    Ok(resampler)
}

/// Resamples an unbounded mono stream pushed in arbitrary slices.
///
/// Input is buffered until a full resampler chunk is available. Equal rates
/// pass straight through.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32, chunk_size: usize) -> anyhow::Result<Self> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(in_rate as f64, out_rate as f64, chunk_size)?)
        };
        Ok(Self {
            resampler,
            pending: Vec::new(),
        })
    }

    pub fn push(&mut self, input: &[f32]) -> anyhow::Result<Vec<f32>> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(input.to_vec());
        };
        self.pending.extend_from_slice(input);

        let mut output = Vec::new();
        loop {
            let needed = resampler.input_frames_next();
            if self.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = self.pending.drain(..needed).collect();
            let resampled = resampler.process(&[chunk], None)?;
            if let Some(channel) = resampled.into_iter().next() {
                output.extend(channel);
            }
        }
        Ok(output)
    }

    /// Drops buffered input that has not been resampled yet.
    pub fn reset(&mut self) {
        self.pending.clear();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

/// Little-endian PCM16 bytes to samples. A trailing odd byte is ignored.
pub fn pcm16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Converts a slice of i16 samples to a vector of f32 samples.
pub fn convert_i16_to_f32(pcm16: &[i16]) -> Vec<f32> {
    pcm16
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Converts f32 samples to little-endian PCM16 bytes, clamping out-of-range values.
pub fn f32_to_pcm16_bytes(pcm32: &[f32]) -> Vec<u8> {
    pcm32
        .iter()
        .flat_map(|&sample| {
            let v = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            v.to_le_bytes()
        })
        .collect()
}

/// Averages interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
