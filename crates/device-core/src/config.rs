//! Encoder configuration builders.

use serde::{Deserialize, Serialize};

use crate::handle::FrameSize;

/// Elementary stream codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    H264,
    Hevc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Preset {
    Default,
    LowLatencyDefault,
    LowLatencyHighQuality,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Profile {
    Auto,
    Baseline,
    Main,
    High,
}

/// Pixel layout of encoder input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferFormat {
    /// 4:2:0, full-resolution luma plane followed by interleaved chroma.
    Nv12,
    Argb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Level {
    AutoSelect,
    /// Level times ten, e.g. 41 for 4.1.
    Fixed(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateControlMode {
    ConstantQp {
        inter_p: u32,
        inter_b: u32,
        intra: u32,
    },
    VariableBitrate {
        average: u32,
        /// If `None`, the encoder picks a default peak.
        max: Option<u32>,
    },
    ConstantBitrate {
        average: u32,
    },
    /// CBR tuned for low delay: the peak equals the average.
    ConstantBitrateLowDelayHq {
        bitrate: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateControlParams {
    pub mode: RateControlMode,
    pub average_bitrate: u32,
    pub max_bitrate: u32,
    /// Zero lets the encoder size the VBV buffer.
    pub vbv_buffer_size: u32,
    pub zero_reorder_delay: bool,
}

/// Timing information written to the sequence VUI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VuiTiming {
    pub timing_info_present: bool,
    pub num_units_in_tick: u32,
    pub time_scale: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264Config {
    pub repeat_sps_pps: bool,
    pub output_aud: bool,
    pub output_picture_timing_sei: bool,
    /// 1 = 4:2:0.
    pub chroma_format_idc: u32,
    pub level: Level,
    pub idr_period: u32,
    pub vui: VuiTiming,
}

/// Full encoder configuration, usually obtained from a preset and then
/// overridden.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeConfig {
    pub profile: Profile,
    pub gop_length: u32,
    pub rc: RateControlParams,
    pub h264: H264Config,
}

impl EncodeConfig {
    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_rate_control_mode(mut self, mode: RateControlMode) -> Self {
        match &mode {
            RateControlMode::ConstantQp { .. } => {}
            RateControlMode::VariableBitrate { average, max } => {
                self.rc.average_bitrate = *average;
                if let Some(max) = max {
                    self.rc.max_bitrate = *max;
                }
            }
            RateControlMode::ConstantBitrate { average } => {
                self.rc.average_bitrate = *average;
            }
            RateControlMode::ConstantBitrateLowDelayHq { bitrate } => {
                self.rc.average_bitrate = *bitrate;
                self.rc.max_bitrate = *bitrate;
            }
        }
        self.rc.mode = mode;
        self
    }

    pub fn with_vbv_buffer_size(mut self, size: u32) -> Self {
        self.rc.vbv_buffer_size = size;
        self
    }

    pub fn with_zero_reorder_delay(mut self, enabled: bool) -> Self {
        self.rc.zero_reorder_delay = enabled;
        self
    }

    /// GOP length and IDR period move together.
    pub fn with_gop_length(mut self, frames: u32) -> Self {
        self.gop_length = frames;
        self.h264.idr_period = frames;
        self
    }

    pub fn with_vui_timing(mut self, num_units_in_tick: u32, time_scale: u32) -> Self {
        self.h264.vui = VuiTiming {
            timing_info_present: true,
            num_units_in_tick,
            time_scale,
        };
        self
    }

    pub fn with_h264(mut self, f: impl FnOnce(&mut H264Config)) -> Self {
        f(&mut self.h264);
        self
    }
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            profile: Profile::Auto,
            gop_length: 30,
            rc: RateControlParams {
                mode: RateControlMode::ConstantQp {
                    inter_p: 28,
                    inter_b: 31,
                    intra: 25,
                },
                average_bitrate: 0,
                max_bitrate: 0,
                vbv_buffer_size: 0,
                zero_reorder_delay: false,
            },
            h264: H264Config {
                repeat_sps_pps: false,
                output_aud: false,
                output_picture_timing_sei: false,
                chroma_format_idc: 1,
                level: Level::AutoSelect,
                idr_period: 30,
                vui: VuiTiming::default(),
            },
        }
    }
}

/// Parameters for initializing an opened encoder session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderInitParams {
    pub codec: Codec,
    pub preset: Preset,
    pub size: FrameSize,
    pub frame_rate_num: u32,
    pub frame_rate_den: u32,
    /// Picture-type decision made by the encoder.
    pub enable_ptd: bool,
    pub buffer_format: BufferFormat,
    pub encode_config: Option<EncodeConfig>,
}

impl EncoderInitParams {
    pub fn new(codec: Codec, size: FrameSize, format: BufferFormat) -> Self {
        Self {
            codec,
            preset: Preset::Default,
            size,
            frame_rate_num: 30,
            frame_rate_den: 1,
            // Only display order is supported.
            enable_ptd: true,
            buffer_format: format,
            encode_config: None,
        }
    }

    pub fn with_preset(mut self, preset: Preset) -> Self {
        self.preset = preset;
        self
    }

    pub fn with_frame_rate(mut self, numerator: u32, denominator: u32) -> Self {
        self.frame_rate_num = numerator;
        self.frame_rate_den = denominator;
        self
    }

    pub fn with_encode_config(mut self, encode_config: EncodeConfig) -> Self {
        self.encode_config = Some(encode_config);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn low_delay_cbr_pins_peak_to_average() {
        let config = EncodeConfig::default()
            .with_rate_control_mode(RateControlMode::ConstantBitrateLowDelayHq { bitrate: 4_000_000 });
        assert_eq!(config.rc.average_bitrate, 4_000_000);
        assert_eq!(config.rc.max_bitrate, 4_000_000);
    }

    #[test]
    fn gop_length_sets_idr_period() {
        let config = EncodeConfig::default().with_gop_length(15);
        assert_eq!(config.gop_length, 15);
        assert_eq!(config.h264.idr_period, 15);
    }

    #[test]
    fn vbr_without_peak_keeps_previous_max() {
        let mut config = EncodeConfig::default();
        config.rc.max_bitrate = 9;
        let config = config.with_rate_control_mode(RateControlMode::VariableBitrate {
            average: 5,
            max: None,
        });
        assert_eq!(config.rc.average_bitrate, 5);
        assert_eq!(config.rc.max_bitrate, 9);
    }
}
