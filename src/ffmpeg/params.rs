use serde::Serialize;

use super::capabilities::HwEncoderKind;

/// Video encoding parameters, resolved once from config and threaded through
/// every ffmpeg invocation (and every cache key).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pix_fmt: String,
    pub profile: String,
    pub level: String,
    pub preset: String,
    pub bitrate_kbps: Option<u32>,
    pub crf: Option<u32>,
    pub cq: Option<u32>,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            pix_fmt: "yuv420p".into(),
            profile: "high".into(),
            level: "4.2".into(),
            preset: "medium".into(),
            bitrate_kbps: None,
            crf: Some(23),
            cq: Some(23),
        }
    }
}

impl VideoParams {
    /// Encoder flags for the selected hardware kind. `None` selects libx264.
    pub fn to_ffmpeg_args(&self, hw_kind: Option<HwEncoderKind>) -> Vec<String> {
        let mut opts: Vec<String> = vec![
            "-fps_mode".into(),
            "cfr".into(),
            "-r".into(),
            self.fps.to_string(),
            "-s".into(),
            format!("{}x{}", self.width, self.height),
            "-pix_fmt".into(),
            self.pix_fmt.clone(),
            "-profile:v".into(),
            self.profile.clone(),
            "-level:v".into(),
            self.level.clone(),
        ];

        match hw_kind {
            Some(HwEncoderKind::Nvenc) => {
                opts.extend(["-c:v".into(), "h264_nvenc".into()]);
                opts.extend(["-preset".into(), self.preset.clone()]);
                if let Some(cq) = self.cq {
                    opts.extend(["-cq".into(), cq.to_string()]);
                } else if let Some(b) = self.bitrate_kbps {
                    opts.extend(["-b:v".into(), format!("{b}k")]);
                } else {
                    opts.extend(["-cq".into(), "23".into()]);
                }
                if std::env::var("NVENC_FAST").as_deref() == Ok("1") {
                    opts.extend([
                        "-rc-lookahead".into(),
                        "0".into(),
                        "-bf".into(),
                        "0".into(),
                        "-spatial_aq".into(),
                        "0".into(),
                        "-temporal_aq".into(),
                        "0".into(),
                    ]);
                }
            }
            Some(HwEncoderKind::Qsv) => {
                opts.extend(["-c:v".into(), "h264_qsv".into()]);
                if let Some(b) = self.bitrate_kbps {
                    opts.extend(["-b:v".into(), format!("{b}k")]);
                } else {
                    opts.extend(["-global_quality".into(), self.cq.unwrap_or(23).to_string()]);
                }
            }
            Some(HwEncoderKind::Vaapi) => {
                opts.extend(["-c:v".into(), "h264_vaapi".into()]);
                if let Some(b) = self.bitrate_kbps {
                    opts.extend(["-b:v".into(), format!("{b}k")]);
                } else {
                    opts.extend(["-qp".into(), self.cq.unwrap_or(23).to_string()]);
                }
            }
            Some(HwEncoderKind::Amf) => {
                opts.extend(["-c:v".into(), "h264_amf".into()]);
                if let Some(b) = self.bitrate_kbps {
                    opts.extend(["-b:v".into(), format!("{b}k")]);
                } else {
                    opts.extend(["-qp".into(), self.cq.unwrap_or(23).to_string()]);
                }
            }
            Some(HwEncoderKind::VideoToolbox) => {
                opts.extend(["-c:v".into(), "h264_videotoolbox".into()]);
                if let Some(b) = self.bitrate_kbps {
                    opts.extend(["-b:v".into(), format!("{b}k")]);
                } else {
                    opts.extend(["-b:v".into(), "5M".into()]);
                }
            }
            None => {
                opts.extend(["-c:v".into(), "libx264".into()]);
                // NVENC preset names (p1..p7) have no libx264 equivalent; map them.
                let preset = match self.preset.as_str() {
                    "p7" => "ultrafast",
                    "p6" => "veryfast",
                    "p5" => "medium",
                    "p4" => "slow",
                    "p3" => "slower",
                    "p1" | "p2" => "veryslow",
                    other => other,
                };
                opts.extend(["-preset".into(), preset.into()]);
                if let Some(crf) = self.crf {
                    opts.extend(["-crf".into(), crf.to_string()]);
                } else if let Some(b) = self.bitrate_kbps {
                    opts.extend(["-b:v".into(), format!("{b}k")]);
                } else {
                    opts.extend(["-crf".into(), "23".into()]);
                }
            }
        }

        opts
    }
}

/// Audio encoding parameters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub channels: u32,
    pub codec: String,
    pub bitrate_kbps: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 2,
            codec: "aac".into(),
            bitrate_kbps: 192,
        }
    }
}

impl AudioParams {
    pub fn to_ffmpeg_args(&self) -> Vec<String> {
        vec![
            "-c:a".into(),
            self.codec.clone(),
            "-b:a".into(),
            format!("{}k", self.bitrate_kbps),
            "-ar".into(),
            self.sample_rate.to_string(),
            "-ac".into(),
            self.channels.to_string(),
        ]
    }

    pub fn channel_layout(&self) -> &'static str {
        if self.channels == 1 {
            "mono"
        } else {
            "stereo"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_encoder_args() {
        let p = VideoParams::default();
        let args = p.to_ffmpeg_args(None);
        let joined = args.join(" ");
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-crf 23"));
        assert!(joined.contains("-s 1920x1080"));
        assert!(joined.contains("-fps_mode cfr"));
    }

    #[test]
    fn test_nvenc_encoder_args() {
        let p = VideoParams {
            preset: "p5".into(),
            ..Default::default()
        };
        let args = p.to_ffmpeg_args(Some(HwEncoderKind::Nvenc));
        let joined = args.join(" ");
        assert!(joined.contains("-c:v h264_nvenc"));
        assert!(joined.contains("-cq 23"));
        assert!(joined.contains("-preset p5"));
    }

    #[test]
    fn test_nvenc_preset_mapped_for_cpu() {
        let p = VideoParams {
            preset: "p5".into(),
            ..Default::default()
        };
        let joined = p.to_ffmpeg_args(None).join(" ");
        assert!(joined.contains("-preset medium"));
    }

    #[test]
    fn test_bitrate_takes_over_when_no_crf() {
        let p = VideoParams {
            crf: None,
            bitrate_kbps: Some(4500),
            ..Default::default()
        };
        let joined = p.to_ffmpeg_args(None).join(" ");
        assert!(joined.contains("-b:v 4500k"));
        assert!(!joined.contains("-crf"));
    }

    #[test]
    fn test_audio_args() {
        let a = AudioParams::default();
        let joined = a.to_ffmpeg_args().join(" ");
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-ar 48000"));
        assert!(joined.contains("-ac 2"));
        assert_eq!(a.channel_layout(), "stereo");
        let mono = AudioParams {
            channels: 1,
            ..Default::default()
        };
        assert_eq!(mono.channel_layout(), "mono");
    }
}
