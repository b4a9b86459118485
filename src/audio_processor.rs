use hound::WavReader;
use std::io::Cursor;
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::AudioConfig;
use crate::error::AnalysisError;

/// Container formats accepted for upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioContainer {
    Wav,
    Mp3,
    Flac,
    Ogg,
}

impl AudioContainer {
    /// Resolves a declared MIME type. Parameters after `;` are ignored.
    pub fn from_content_type(content_type: &str) -> Result<Self, AnalysisError> {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "audio/wav" | "audio/x-wav" | "audio/wave" | "audio/vnd.wave" => Ok(Self::Wav),
            "audio/mpeg" | "audio/mp3" => Ok(Self::Mp3),
            "audio/flac" | "audio/x-flac" => Ok(Self::Flac),
            "audio/ogg" => Ok(Self::Ogg),
            _ => Err(AnalysisError::UnsupportedFormat(format!(
                "content type {:?} is not accepted",
                content_type
            ))),
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "wav" | "wave" => Some(Self::Wav),
            "mp3" => Some(Self::Mp3),
            "flac" => Some(Self::Flac),
            "ogg" | "oga" => Some(Self::Ogg),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Wav => "audio/wav",
            Self::Mp3 => "audio/mpeg",
            Self::Flac => "audio/flac",
            Self::Ogg => "audio/ogg",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Flac => "flac",
            Self::Ogg => "ogg",
        }
    }
}

/// A decoded upload at the canonical sample rate.
///
/// Per-channel buffers are kept for localization; `samples()` is the mono
/// downmix used for classification.
#[derive(Debug, Clone)]
pub struct AudioSample {
    channels: Vec<Vec<f32>>,
    mono: Vec<f32>,
    sample_rate: u32,
}

impl AudioSample {
    /// Builds a sample from equal-length channel buffers.
    pub fn from_channels(mut channels: Vec<Vec<f32>>, sample_rate: u32) -> Self {
        let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
        for channel in &mut channels {
            channel.truncate(frames);
        }

        let mono = if channels.len() == 1 {
            channels[0].clone()
        } else {
            (0..frames)
                .map(|i| channels.iter().map(|c| c[i]).sum::<f32>() / channels.len() as f32)
                .collect()
        };

        Self {
            channels,
            mono,
            sample_rate,
        }
    }

    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self::from_channels(vec![samples], sample_rate)
    }

    pub fn samples(&self) -> &[f32] {
        &self.mono
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn len(&self) -> usize {
        self.mono.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mono.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.mono.len() as f64 / self.sample_rate as f64
    }

    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|c| c.iter())
            .fold(0.0f32, |acc, &s| acc.max(s.abs()))
    }
}

struct DecodedAudio {
    channels: Vec<Vec<f32>>,
    sample_rate: u32,
}

pub struct AudioProcessor {
    target_sample_rate: u32,
    min_duration_secs: f64,
    max_duration_secs: f64,
    silence_threshold: f32,
}

impl AudioProcessor {
    pub fn new(target_sample_rate: u32) -> Self {
        Self::from_config(&AudioConfig {
            sample_rate: target_sample_rate,
            ..AudioConfig::default()
        })
    }

    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            target_sample_rate: config.sample_rate,
            min_duration_secs: config.min_duration_secs,
            max_duration_secs: config.max_duration_secs,
            silence_threshold: config.silence_threshold,
        }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    /// Reads a file from disk, inferring the container from its extension.
    pub fn load_audio_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<AudioSample> {
        let path = path.as_ref();
        let container = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(AudioContainer::from_extension)
            .ok_or_else(|| anyhow::anyhow!("Cannot infer audio format of {:?}", path))?;
        let bytes = std::fs::read(path)?;
        Ok(self.decode(&bytes, container.content_type())?)
    }

    /// Decodes an upload, downmixes a mono view and resamples to the
    /// canonical rate. Validation happens before any model work.
    pub fn decode(&self, bytes: &[u8], content_type: &str) -> Result<AudioSample, AnalysisError> {
        let container = AudioContainer::from_content_type(content_type)?;

        if bytes.is_empty() {
            return Err(AnalysisError::EmptyOrCorruptAudio("upload is empty".into()));
        }

        let decoded = match container {
            AudioContainer::Wav => Self::decode_wav(bytes)?,
            other => Self::decode_compressed(bytes, other)?,
        };

        let frames = decoded.channels.first().map(Vec::len).unwrap_or(0);
        if frames == 0 || decoded.sample_rate == 0 {
            return Err(AnalysisError::EmptyOrCorruptAudio("no audio frames decoded".into()));
        }

        let seconds = frames as f64 / decoded.sample_rate as f64;
        if seconds < self.min_duration_secs || seconds > self.max_duration_secs {
            return Err(AnalysisError::DurationOutOfRange {
                seconds,
                min: self.min_duration_secs,
                max: self.max_duration_secs,
            });
        }

        let channels = if decoded.sample_rate != self.target_sample_rate {
            decoded
                .channels
                .iter()
                .map(|c| self.resample(c, decoded.sample_rate, self.target_sample_rate))
                .collect()
        } else {
            decoded.channels
        };

        let sample = AudioSample::from_channels(channels, self.target_sample_rate);
        if sample.peak() < self.silence_threshold {
            return Err(AnalysisError::EmptyOrCorruptAudio("audio is near-silent".into()));
        }

        log::debug!(
            "Decoded {:?} upload: {} channel(s), {:.2}s at {} Hz (source {} Hz)",
            container,
            sample.channel_count(),
            sample.duration_secs(),
            sample.sample_rate(),
            decoded.sample_rate
        );

        Ok(sample)
    }

    fn decode_wav(bytes: &[u8]) -> Result<DecodedAudio, AnalysisError> {
        let mut reader = WavReader::new(Cursor::new(bytes)).map_err(Self::map_wav_error)?;
        let spec = reader.spec();

        let interleaved = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<Vec<f32>, _>>()
                .map_err(Self::map_wav_error)?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|sample| sample as f32 / scale))
                    .collect::<std::result::Result<Vec<f32>, _>>()
                    .map_err(Self::map_wav_error)?
            }
        };

        Ok(DecodedAudio {
            channels: deinterleave(&interleaved, spec.channels as usize),
            sample_rate: spec.sample_rate,
        })
    }

    fn map_wav_error(err: hound::Error) -> AnalysisError {
        match err {
            hound::Error::Unsupported | hound::Error::TooWide => {
                AnalysisError::UnsupportedFormat(format!("wav: {}", err))
            }
            other => AnalysisError::EmptyOrCorruptAudio(format!("wav: {}", other)),
        }
    }

    fn decode_compressed(bytes: &[u8], container: AudioContainer) -> Result<DecodedAudio, AnalysisError> {
        let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

        let mut hint = Hint::new();
        hint.with_extension(container.extension());
        hint.mime_type(container.content_type());

        // A probe miss means the bytes do not match the declared container.
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| AnalysisError::EmptyOrCorruptAudio(format!("{:?}: {}", container, e)))?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| AnalysisError::EmptyOrCorruptAudio("no audio track found".into()))?;
        let track_id = track.id;
        let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);

        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(Self::map_symphonia_error)?;

        let mut channels: Vec<Vec<f32>> = Vec::new();

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(SymphoniaError::ResetRequired) => break,
                Err(e) => return Err(Self::map_symphonia_error(e)),
            };

            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let n_channels = spec.channels.count();
                    if sample_rate == 0 {
                        sample_rate = spec.rate;
                    }
                    if channels.is_empty() {
                        channels = vec![Vec::new(); n_channels];
                    }

                    let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    for frame in buffer.samples().chunks(n_channels) {
                        for (channel, &sample) in channels.iter_mut().zip(frame) {
                            channel.push(sample);
                        }
                    }
                }
                Err(SymphoniaError::DecodeError(msg)) => {
                    // Corrupted packets are skipped; an all-bad stream ends up empty.
                    log::debug!("Skipping undecodable packet: {}", msg);
                }
                Err(e) => return Err(Self::map_symphonia_error(e)),
            }
        }

        Ok(DecodedAudio { channels, sample_rate })
    }

    fn map_symphonia_error(err: SymphoniaError) -> AnalysisError {
        match err {
            SymphoniaError::Unsupported(what) => AnalysisError::UnsupportedFormat(what.to_string()),
            other => AnalysisError::EmptyOrCorruptAudio(other.to_string()),
        }
    }

    /// Linear interpolation resampling.
    pub fn resample(&self, audio: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
        if audio.is_empty() || from_rate == to_rate {
            return audio.to_vec();
        }

        let ratio = to_rate as f64 / from_rate as f64;
        let new_length = (audio.len() as f64 * ratio) as usize;
        let last = audio.len() - 1;

        (0..new_length)
            .map(|i| {
                let src_index = i as f64 / ratio;
                let floor = (src_index.floor() as usize).min(last);
                let ceil = (floor + 1).min(last);
                let fraction = (src_index - floor as f64) as f32;
                audio[floor] * (1.0 - fraction) + audio[ceil] * fraction
            })
            .collect()
    }
}

fn deinterleave(interleaved: &[f32], n_channels: usize) -> Vec<Vec<f32>> {
    let n_channels = n_channels.max(1);
    let mut channels = vec![Vec::with_capacity(interleaved.len() / n_channels); n_channels];
    for frame in interleaved.chunks_exact(n_channels) {
        for (channel, &sample) in channels.iter_mut().zip(frame) {
            channel.push(sample);
        }
    }
    channels
}

/// Encodes channel buffers as 16-bit PCM WAV.
pub fn encode_wav(channels: &[Vec<f32>], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: channels.len().max(1) as u16,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let frames = channels.iter().map(Vec::len).min().unwrap_or(0);
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for i in 0..frames {
            for channel in channels {
                let sample = (channel[i].clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
                writer.write_sample(sample)?;
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
