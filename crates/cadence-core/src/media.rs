//! Media format, frame length and scenario types.

/// Coarse data format classification used by buffering and delay logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    /// Not yet known.
    #[default]
    Unknown,
    /// Linear PCM.
    Pcm,
    /// Packetized (e.g. IEC 61937) data with PCM-like timing.
    Packetized,
    /// Raw compressed bitstream.
    RawCompressed,
}

impl DataFormat {
    /// PCM and packetized data have frame-based timing.
    pub fn is_pcm_or_packetized(self) -> bool {
        matches!(self, Self::Pcm | Self::Packetized)
    }
}

/// Media format of a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct MediaFormat {
    /// Data format.
    pub data_format: DataFormat,
    /// Sample rate in Hz (0 when unknown).
    pub sample_rate: u32,
    /// Channel count.
    pub channels: u16,
    /// Bits per sample.
    pub bits_per_sample: u16,
}

impl MediaFormat {
    /// Convenience constructor for interleaved PCM.
    pub fn pcm(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Self {
        Self {
            data_format: DataFormat::Pcm,
            sample_rate,
            channels,
            bits_per_sample,
        }
    }

    /// Returns `true` once a usable sample rate is known.
    pub fn is_valid(&self) -> bool {
        self.data_format != DataFormat::Unknown && self.sample_rate > 0
    }

    /// Bytes for one sample across all channels.
    pub fn bytes_per_frame_sample(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bits_per_sample / 8)
    }

    /// Samples per channel contained in `us` microseconds.
    pub fn samples_for_us(&self, us: u32) -> u32 {
        ((u64::from(us) * u64::from(self.sample_rate)) / 1_000_000) as u32
    }

    /// Bytes needed to carry `us` microseconds.
    pub fn bytes_for_us(&self, us: u32) -> usize {
        self.samples_for_us(us) as usize * self.bytes_per_frame_sample()
    }

    /// Duration in microseconds of `bytes` bytes. Zero if the format is
    /// not PCM-like or incomplete.
    pub fn us_for_bytes(&self, bytes: usize) -> u32 {
        let per_sample = self.bytes_per_frame_sample();
        if per_sample == 0 || self.sample_rate == 0 {
            return 0;
        }
        let samples = (bytes / per_sample) as u64;
        ((samples * 1_000_000) / u64::from(self.sample_rate)) as u32
    }
}

/// A frame length expressed both in samples and in time.
///
/// Either representation may be zero when unknown.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FrameLength {
    /// Samples per channel in one frame.
    pub samples: u32,
    /// Sample rate the sample count refers to.
    pub sample_rate: u32,
    /// Frame duration in microseconds.
    pub us: u32,
}

impl FrameLength {
    /// Frame length known only in time.
    pub fn from_us(us: u32) -> Self {
        Self {
            samples: 0,
            sample_rate: 0,
            us,
        }
    }

    /// Frame length in samples at a given rate; time is derived.
    pub fn from_samples(samples: u32, sample_rate: u32) -> Self {
        let us = if sample_rate == 0 {
            0
        } else {
            ((u64::from(samples) * 1_000_000) / u64::from(sample_rate)) as u32
        };
        Self {
            samples,
            sample_rate,
            us,
        }
    }

    /// Returns `true` if nothing is known.
    pub fn is_unknown(&self) -> bool {
        self.samples == 0 && self.sample_rate == 0 && self.us == 0
    }

    /// Compares two frame lengths for a meaningful change.
    ///
    /// When both carry a sample rate the comparison is on
    /// `(samples, sample_rate)`, otherwise on microseconds.
    pub fn differs_from(&self, other: &FrameLength) -> bool {
        if self.sample_rate != 0 && other.sample_rate != 0 {
            self.samples != other.samples || self.sample_rate != other.sample_rate
        } else {
            self.us != other.us
        }
    }
}

/// Scenario tag attached to a subgraph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Scenario {
    /// No extra constraints.
    #[default]
    Default,
    /// Voice path: fixed period, votes handled by the voice-path manager.
    Voice,
}

/// Timestamp in microseconds.
pub type Timestamp = i64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_sizes() {
        let fmt = MediaFormat::pcm(48_000, 2, 16);
        assert_eq!(fmt.samples_for_us(5_000), 240);
        assert_eq!(fmt.bytes_for_us(5_000), 960);
        assert_eq!(fmt.us_for_bytes(960), 5_000);
    }

    #[test]
    fn frame_length_compares_samples_when_rates_known() {
        let a = FrameLength::from_samples(480, 48_000);
        let b = FrameLength::from_samples(441, 44_100);
        // Both are 10 ms but the sample grids differ.
        assert_eq!(a.us, b.us);
        assert!(a.differs_from(&b));
    }

    #[test]
    fn frame_length_compares_time_otherwise() {
        let a = FrameLength::from_us(5_000);
        let b = FrameLength::from_samples(240, 48_000);
        assert!(!a.differs_from(&b));
        assert!(a.differs_from(&FrameLength::from_us(10_000)));
    }

    #[test]
    fn unknown_frame_length() {
        assert!(FrameLength::default().is_unknown());
        assert!(!FrameLength::from_us(1).is_unknown());
    }
}
