use heapless::Vec;

use super::AudioLocation;
use crate::{CodecError, CODEC_CONFIG_LEN};

/// Codec_Specific_Configuration LTV types (LC3).
pub mod ltv_type {
    pub const SAMPLING_FREQUENCY: u8 = 0x01;
    pub const FRAME_DURATION: u8 = 0x02;
    pub const AUDIO_CHANNEL_ALLOCATION: u8 = 0x03;
    pub const OCTETS_PER_CODEC_FRAME: u8 = 0x04;
    pub const CODEC_FRAME_BLOCKS_PER_SDU: u8 = 0x05;
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SamplingFrequency {
    Hz8000 = 0x01,
    Hz11025 = 0x02,
    Hz16000 = 0x03,
    Hz22050 = 0x04,
    Hz24000 = 0x05,
    Hz32000 = 0x06,
    Hz44100 = 0x07,
    #[default]
    Hz48000 = 0x08,
    Hz88200 = 0x09,
    Hz96000 = 0x0A,
    Hz176400 = 0x0B,
    Hz192000 = 0x0C,
    Hz384000 = 0x0D,
}

impl SamplingFrequency {
    pub fn hz(&self) -> u32 {
        match self {
            SamplingFrequency::Hz8000 => 8000,
            SamplingFrequency::Hz11025 => 11025,
            SamplingFrequency::Hz16000 => 16000,
            SamplingFrequency::Hz22050 => 22050,
            SamplingFrequency::Hz24000 => 24000,
            SamplingFrequency::Hz32000 => 32000,
            SamplingFrequency::Hz44100 => 44100,
            SamplingFrequency::Hz48000 => 48000,
            SamplingFrequency::Hz88200 => 88200,
            SamplingFrequency::Hz96000 => 96000,
            SamplingFrequency::Hz176400 => 176400,
            SamplingFrequency::Hz192000 => 192000,
            SamplingFrequency::Hz384000 => 384000,
        }
    }

    fn from_raw(raw: u8) -> Result<Self, CodecError> {
        Ok(match raw {
            0x01 => SamplingFrequency::Hz8000,
            0x02 => SamplingFrequency::Hz11025,
            0x03 => SamplingFrequency::Hz16000,
            0x04 => SamplingFrequency::Hz22050,
            0x05 => SamplingFrequency::Hz24000,
            0x06 => SamplingFrequency::Hz32000,
            0x07 => SamplingFrequency::Hz44100,
            0x08 => SamplingFrequency::Hz48000,
            0x09 => SamplingFrequency::Hz88200,
            0x0A => SamplingFrequency::Hz96000,
            0x0B => SamplingFrequency::Hz176400,
            0x0C => SamplingFrequency::Hz192000,
            0x0D => SamplingFrequency::Hz384000,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameDuration {
    Duration7500Us = 0x00,
    #[default]
    Duration10000Us = 0x01,
}

impl FrameDuration {
    pub fn us(&self) -> u32 {
        match self {
            FrameDuration::Duration7500Us => 7500,
            FrameDuration::Duration10000Us => 10000,
        }
    }

    fn from_raw(raw: u8) -> Result<Self, CodecError> {
        Ok(match raw {
            0x00 => FrameDuration::Duration7500Us,
            0x01 => FrameDuration::Duration10000Us,
            _ => return Err(CodecError::InvalidValue),
        })
    }
}

/// One ASE's LC3 configuration, as carried in the Config Codec operation and
/// echoed back in the Codec Configured ASE status.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfiguration {
    pub sampling_frequency: SamplingFrequency,
    pub frame_duration: FrameDuration,
    pub audio_channel_allocation: AudioLocation,
    pub octets_per_codec_frame: u16,
    pub codec_frame_blocks_per_sdu: u8,
}

impl Default for CodecConfiguration {
    fn default() -> Self {
        Self {
            sampling_frequency: SamplingFrequency::default(),
            frame_duration: FrameDuration::default(),
            audio_channel_allocation: AudioLocation::MONO,
            octets_per_codec_frame: 0,
            codec_frame_blocks_per_sdu: 1,
        }
    }
}

impl CodecConfiguration {
    pub fn sampling_frequency_hz(&self) -> u32 {
        self.sampling_frequency.hz()
    }

    pub fn frame_duration_us(&self) -> u32 {
        self.frame_duration.us()
    }

    pub fn channel_count(&self) -> u8 {
        self.audio_channel_allocation.channel_count()
    }

    /// SDU interval implied by this configuration: one SDU carries
    /// `codec_frame_blocks_per_sdu` frame blocks.
    pub fn sdu_interval_us(&self) -> u32 {
        self.frame_duration_us() * self.codec_frame_blocks_per_sdu.max(1) as u32
    }

    /// Largest SDU this configuration produces per interval.
    pub fn max_sdu_size(&self) -> u16 {
        self.octets_per_codec_frame
            * self.channel_count() as u16
            * self.codec_frame_blocks_per_sdu.max(1) as u16
    }

    /// Serialize as Codec_Specific_Configuration LTVs.
    pub fn to_ltv(&self) -> Vec<u8, CODEC_CONFIG_LEN> {
        let mut out = Vec::new();
        // Infallible: the five LTVs total 19 bytes, within capacity.
        let _ = out.extend_from_slice(&[
            0x02,
            ltv_type::SAMPLING_FREQUENCY,
            self.sampling_frequency as u8,
            0x02,
            ltv_type::FRAME_DURATION,
            self.frame_duration as u8,
        ]);
        let allocation = self.audio_channel_allocation.bits().to_le_bytes();
        let _ = out.extend_from_slice(&[
            0x05,
            ltv_type::AUDIO_CHANNEL_ALLOCATION,
            allocation[0],
            allocation[1],
            allocation[2],
            allocation[3],
        ]);
        let octets = self.octets_per_codec_frame.to_le_bytes();
        let _ = out.extend_from_slice(&[
            0x03,
            ltv_type::OCTETS_PER_CODEC_FRAME,
            octets[0],
            octets[1],
            0x02,
            ltv_type::CODEC_FRAME_BLOCKS_PER_SDU,
            self.codec_frame_blocks_per_sdu,
        ]);
        out
    }

    /// Parse from Codec_Specific_Configuration LTVs. Unknown types are
    /// skipped, absent types keep their defaults.
    pub fn from_ltv(data: &[u8]) -> Result<Self, CodecError> {
        let mut conf = CodecConfiguration::default();
        let mut rest = data;
        while !rest.is_empty() {
            let len = rest[0] as usize;
            if len == 0 || rest.len() < 1 + len {
                return Err(CodecError::Truncated);
            }
            let ltv = &rest[1..1 + len];
            match (ltv[0], len - 1) {
                (ltv_type::SAMPLING_FREQUENCY, 1) => {
                    conf.sampling_frequency = SamplingFrequency::from_raw(ltv[1])?;
                }
                (ltv_type::FRAME_DURATION, 1) => {
                    conf.frame_duration = FrameDuration::from_raw(ltv[1])?;
                }
                (ltv_type::AUDIO_CHANNEL_ALLOCATION, 4) => {
                    let raw = u32::from_le_bytes([ltv[1], ltv[2], ltv[3], ltv[4]]);
                    conf.audio_channel_allocation =
                        AudioLocation::from_bits(raw).ok_or(CodecError::InvalidValue)?;
                }
                (ltv_type::OCTETS_PER_CODEC_FRAME, 2) => {
                    conf.octets_per_codec_frame = u16::from_le_bytes([ltv[1], ltv[2]]);
                }
                (ltv_type::CODEC_FRAME_BLOCKS_PER_SDU, 1) => {
                    conf.codec_frame_blocks_per_sdu = ltv[1];
                }
                _ => {}
            }
            rest = &rest[1 + len..];
        }
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn media_48_2() -> CodecConfiguration {
        CodecConfiguration {
            sampling_frequency: SamplingFrequency::Hz48000,
            frame_duration: FrameDuration::Duration10000Us,
            audio_channel_allocation: AudioLocation::FrontLeft,
            octets_per_codec_frame: 100,
            codec_frame_blocks_per_sdu: 1,
        }
    }

    #[test]
    fn ltv_round_trip() {
        let conf = media_48_2();
        let ltv = conf.to_ltv();
        assert_eq!(CodecConfiguration::from_ltv(&ltv).unwrap(), conf);
    }

    #[test]
    fn derived_qos_values() {
        let conf = media_48_2();
        assert_eq!(conf.sdu_interval_us(), 10000);
        assert_eq!(conf.max_sdu_size(), 100);

        let stereo = CodecConfiguration {
            audio_channel_allocation: AudioLocation::FrontLeft | AudioLocation::FrontRight,
            codec_frame_blocks_per_sdu: 2,
            ..conf
        };
        assert_eq!(stereo.sdu_interval_us(), 20000);
        assert_eq!(stereo.max_sdu_size(), 400);
    }

    #[test]
    fn unknown_ltv_is_skipped() {
        // Vendor LTV ahead of a valid sampling frequency.
        let data = [0x02, 0xF0, 0xAA, 0x02, 0x01, 0x03];
        let conf = CodecConfiguration::from_ltv(&data).unwrap();
        assert_eq!(conf.sampling_frequency, SamplingFrequency::Hz16000);
    }

    #[test]
    fn truncated_ltv_is_rejected() {
        let data = [0x05, 0x03, 0x01];
        assert_eq!(
            CodecConfiguration::from_ltv(&data),
            Err(CodecError::Truncated)
        );
    }

    #[test]
    fn mono_counts_one_channel() {
        assert_eq!(AudioLocation::MONO.channel_count(), 1);
        assert_eq!(
            (AudioLocation::FrontLeft | AudioLocation::FrontRight).channel_count(),
            2
        );
    }
}
