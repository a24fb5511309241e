use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use common::Waveform;

/// Decode target for peak extraction. Full fidelity is wasted on a
/// thumbnail, so everything is downmixed to mono at this rate first.
pub const TARGET_SAMPLE_RATE: u32 = 22_050;

const FALLBACK_PEAKS: usize = 100;
const FALLBACK_PEAK: f32 = 0.5;
const FALLBACK_SAMPLE_RATE: u32 = 44_100;

/// Flat placeholder waveform recorded when decoding fails; the asset
/// still completes and clients can render something.
pub fn fallback_waveform() -> Waveform {
    Waveform {
        peaks: vec![FALLBACK_PEAK; FALLBACK_PEAKS],
        length: FALLBACK_PEAKS,
        sample_rate: FALLBACK_SAMPLE_RATE,
    }
}

#[derive(Debug)]
pub enum WaveformError {
    Io(std::io::Error),
    Decode(String),
}

impl std::fmt::Display for WaveformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WaveformError::Io(err) => write!(f, "io error: {}", err),
            WaveformError::Decode(err) => write!(f, "decode error: {}", err),
        }
    }
}

impl std::error::Error for WaveformError {}

impl From<std::io::Error> for WaveformError {
    fn from(err: std::io::Error) -> Self {
        WaveformError::Io(err)
    }
}

pub fn generate_waveform(path: &Path, samples: usize) -> Result<Waveform, WaveformError> {
    let pcm = decode_mono(path)?;
    Ok(Waveform {
        peaks: peaks_from_samples(&pcm, samples),
        length: samples,
        sample_rate: TARGET_SAMPLE_RATE,
    })
}

/// Splits the signal into `count` contiguous chunks and keeps the peak
/// amplitude of each, normalized to 0.0..=1.0. Always returns exactly
/// `count` values; chunks past the end of a short signal stay at zero.
pub fn peaks_from_samples(samples: &[i16], count: usize) -> Vec<f32> {
    let mut peaks = vec![0.0f32; count];
    if samples.is_empty() || count == 0 {
        return peaks;
    }
    let chunk = samples.len().div_ceil(count).max(1);
    for (i, peak) in peaks.iter_mut().enumerate() {
        let start = i * chunk;
        if start >= samples.len() {
            break;
        }
        let end = (start + chunk).min(samples.len());
        let max = samples[start..end]
            .iter()
            .map(|s| i32::from(*s).unsigned_abs())
            .max()
            .unwrap_or(0);
        *peak = max as f32 / 32768.0;
    }
    peaks
}

fn decode_mono(path: &Path) -> Result<Vec<i16>, WaveformError> {
    let file = std::fs::File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
        hint.with_extension(ext);
    }
    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|err| WaveformError::Decode(err.to_string()))?;
    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| WaveformError::Decode("no default audio track".to_string()))?;
    let codec_params = track.codec_params.clone();
    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|err| WaveformError::Decode(err.to_string()))?;

    let mut resampler: Option<MonoResampler> = None;
    let mut pcm: Vec<i16> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::ResetRequired) => {
                return Err(WaveformError::Decode("decoder reset required".to_string()));
            }
            Err(SymphoniaError::IoError(_)) => break,
            Err(err) => return Err(WaveformError::Decode(err.to_string())),
        };
        let decoded = decoder
            .decode(&packet)
            .map_err(|err| WaveformError::Decode(err.to_string()))?;

        let spec = *decoded.spec();
        let channels = spec.channels.count();
        if channels == 0 {
            return Err(WaveformError::Decode("stream has no channels".to_string()));
        }
        let mut sample_buf = SampleBuffer::<i16>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);
        let mono = downmix(sample_buf.samples(), channels);

        if spec.rate == TARGET_SAMPLE_RATE {
            pcm.extend_from_slice(&mono);
        } else {
            let resampler = resampler
                .get_or_insert_with(|| MonoResampler::new(spec.rate, TARGET_SAMPLE_RATE));
            pcm.extend(resampler.process(&mono));
        }
    }

    Ok(pcm)
}

fn downmix(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels == 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i64 = frame.iter().map(|s| i64::from(*s)).sum();
            (sum / channels as i64) as i16
        })
        .collect()
}

/// Streaming linear interpolator over a single channel. Carries one frame
/// of history between calls so chunk boundaries stay continuous.
struct MonoResampler {
    input_rate: u32,
    output_rate: u32,
    buffer: Vec<i16>,
    position: f64,
}

impl MonoResampler {
    fn new(input_rate: u32, output_rate: u32) -> Self {
        Self {
            input_rate,
            output_rate,
            buffer: Vec::new(),
            position: 0.0,
        }
    }

    fn process(&mut self, input: &[i16]) -> Vec<i16> {
        self.buffer.extend_from_slice(input);
        if self.buffer.len() < 2 {
            return Vec::new();
        }

        let step = self.input_rate as f64 / self.output_rate as f64;
        let mut out = Vec::new();
        while self.position + 1.0 < self.buffer.len() as f64 {
            let idx = self.position.floor() as usize;
            let frac = self.position - idx as f64;
            let s0 = self.buffer[idx] as f64;
            let s1 = self.buffer[idx + 1] as f64;
            let sample = s0 + (s1 - s0) * frac;
            out.push(sample.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16);
            self.position += step;
        }

        let drop = (self.position.floor() - 1.0).max(0.0) as usize;
        if drop > 0 {
            self.buffer.drain(0..drop);
            self.position -= drop as f64;
        }
        out
    }
}
