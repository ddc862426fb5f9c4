use serde::Deserialize;
use validator::{Validate, ValidationError};

/// Block size, in samples per channel, delivered per capture callback.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[serde(try_from = "u32")]
pub enum BlockSize {
    #[strum(serialize = "1024")]
    S1024 = 1024,
    #[strum(serialize = "2048")]
    S2048 = 2048,
    #[strum(serialize = "4096")]
    S4096 = 4096,
    #[strum(serialize = "8192")]
    S8192 = 8192,
}

impl BlockSize {
    pub fn samples(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1024 => Ok(Self::S1024),
            2048 => Ok(Self::S2048),
            4096 => Ok(Self::S4096),
            8192 => Ok(Self::S8192),
            other => Err(format!(
                "block size must be one of 1024, 2048, 4096, 8192 (got {other})"
            )),
        }
    }
}

/// Channel count; mono or stereo only.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[serde(try_from = "u16")]
pub enum Channels {
    #[strum(serialize = "1")]
    Mono = 1,
    #[strum(serialize = "2")]
    Stereo = 2,
}

impl Channels {
    pub fn count(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Channels {
    type Error = String;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Mono),
            2 => Ok(Self::Stereo),
            other => Err(format!("channels must be 1 or 2 (got {other})")),
        }
    }
}

/// Sample storage format.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    I16,
    I24,
    I32,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> u32 {
        match self {
            Self::I16 => 2,
            Self::I24 => 3,
            Self::I32 => 4,
        }
    }
}

/// Sample rate, in Hz.
#[derive(Deserialize, Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[serde(try_from = "u32")]
pub enum SampleRate {
    #[strum(serialize = "16000")]
    Hz16000 = 16_000,
    #[strum(serialize = "22050")]
    Hz22050 = 22_050,
    #[strum(serialize = "44100")]
    Hz44100 = 44_100,
    #[strum(serialize = "48000")]
    Hz48000 = 48_000,
    #[strum(serialize = "88200")]
    Hz88200 = 88_200,
    #[strum(serialize = "96000")]
    Hz96000 = 96_000,
    #[strum(serialize = "176400")]
    Hz176400 = 176_400,
    #[strum(serialize = "192000")]
    Hz192000 = 192_000,
}

impl SampleRate {
    pub fn hz(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            16_000 => Ok(Self::Hz16000),
            22_050 => Ok(Self::Hz22050),
            44_100 => Ok(Self::Hz44100),
            48_000 => Ok(Self::Hz48000),
            88_200 => Ok(Self::Hz88200),
            96_000 => Ok(Self::Hz96000),
            176_400 => Ok(Self::Hz176400),
            192_000 => Ok(Self::Hz192000),
            other => Err(format!("unsupported sample rate {other}")),
        }
    }
}

fn validate_fanout_capacity(value: u32) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::new("fanout_queue_capacity_zero")
            .with_message("fanout queue capacity must be greater than zero".into()));
    }
    Ok(())
}

/// Immutable capture parameters, validated eagerly at construction time rather
/// than deferred to device-open time.
#[derive(Deserialize, Validate, Clone, Debug)]
pub struct CaptureConfig {
    #[serde(default)]
    pub device_index: usize,
    #[serde(default = "default_block_size")]
    pub block_size: BlockSize,
    #[serde(default = "default_channels")]
    pub channels: Channels,
    #[serde(default = "default_sample_format")]
    pub sample_format: SampleFormat,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: SampleRate,
    #[serde(default = "default_fanout_queue_capacity")]
    #[validate(custom(function = "validate_fanout_capacity"))]
    pub fanout_queue_capacity: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            block_size: default_block_size(),
            channels: default_channels(),
            sample_format: default_sample_format(),
            sample_rate: default_sample_rate(),
            fanout_queue_capacity: default_fanout_queue_capacity(),
        }
    }
}

impl CaptureConfig {
    pub fn bytes_per_block(&self) -> usize {
        self.block_size.samples() as usize
            * self.channels.count() as usize
            * self.sample_format.bytes_per_sample() as usize
    }
}

fn default_block_size() -> BlockSize {
    BlockSize::S2048
}

fn default_channels() -> Channels {
    Channels::Stereo
}

fn default_sample_format() -> SampleFormat {
    SampleFormat::I16
}

fn default_sample_rate() -> SampleRate {
    SampleRate::Hz48000
}

fn default_fanout_queue_capacity() -> u32 {
    256
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_sample_rate() {
        assert!(SampleRate::try_from(44_000_u32).is_err());
        assert!(SampleRate::try_from(44_100_u32).is_ok());
    }

    #[test]
    fn rejects_unsupported_block_size() {
        assert!(BlockSize::try_from(3000_u32).is_err());
        assert!(BlockSize::try_from(4096_u32).is_ok());
    }

    #[test]
    fn bytes_per_block_accounts_for_channels_and_format() {
        let cfg = CaptureConfig {
            device_index: 0,
            block_size: BlockSize::S1024,
            channels: Channels::Stereo,
            sample_format: SampleFormat::I16,
            sample_rate: SampleRate::Hz48000,
            fanout_queue_capacity: 256,
        };
        assert_eq!(cfg.bytes_per_block(), 1024 * 2 * 2);
    }

    #[test]
    fn zero_fanout_capacity_fails_validation() {
        let cfg = CaptureConfig {
            device_index: 0,
            block_size: BlockSize::S1024,
            channels: Channels::Mono,
            sample_format: SampleFormat::I16,
            sample_rate: SampleRate::Hz48000,
            fanout_queue_capacity: 0,
        };
        assert!(cfg.validate().is_err());
    }
}
