use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{RenderError, RenderResult};
use crate::ffmpeg::audio::add_bgm_to_video;
use crate::ffmpeg::capabilities::profile_flags;
use crate::ffmpeg::probe::{media_duration, media_info, MediaInfo};
use crate::ffmpeg::runner::run_ffmpeg;
use crate::render::VideoRenderer;

/// Phase 3: concatenate the per-scene MP4s into the final video and mix the
/// optional global BGM under it.
pub struct FinalizePhase {
    config: Arc<Config>,
    temp_dir: PathBuf,
    renderer: Arc<VideoRenderer>,
    final_copy_only: bool,
}

impl FinalizePhase {
    pub fn new(
        config: Arc<Config>,
        temp_dir: PathBuf,
        renderer: Arc<VideoRenderer>,
        final_copy_only: bool,
    ) -> Self {
        Self {
            config,
            temp_dir,
            renderer,
            final_copy_only,
        }
    }

    pub async fn run(&self, scene_clips: &[PathBuf]) -> RenderResult<PathBuf> {
        if scene_clips.is_empty() {
            return Err(RenderError::Pipeline("no scene clips to finalize".into()));
        }

        let output = self.temp_dir.join("final_output.mp4");
        if self.params_match(scene_clips).await? {
            info!("all scene clips share parameters; concatenating with stream copy");
            match self.renderer.concat_clips(scene_clips, &output).await {
                Ok(()) => {}
                Err(e) if self.final_copy_only => {
                    return Err(RenderError::Pipeline(format!(
                        "--final-copy-only requested but stream-copy concat failed: {e}"
                    )));
                }
                Err(e) => {
                    warn!("stream-copy concat failed ({e}); re-encoding");
                    self.reencode_concat(scene_clips, &output).await?;
                }
            }
        } else {
            warn!("scene clip parameters differ");
            if self.final_copy_only {
                return Err(RenderError::Pipeline(
                    "--final-copy-only requested but scene parameters mismatch".into(),
                ));
            }
            self.reencode_concat(scene_clips, &output).await?;
        }

        let final_path = if let Some(bgm) = &self.config.bgm {
            let with_bgm = self.temp_dir.join("final_output_bgm.mp4");
            add_bgm_to_video(
                &output,
                &bgm.path,
                &with_bgm,
                &self.renderer.audio_params,
                bgm.volume,
                bgm.start_time,
                bgm.fade_in,
                bgm.fade_out,
            )
            .await?;
            with_bgm
        } else {
            output
        };

        let duration = media_duration(&final_path).await?;
        info!(duration, path = %final_path.display(), "finalized video");
        Ok(final_path)
    }

    /// All clips must agree on video and audio stream parameters for a
    /// stream-copy concat to be valid.
    async fn params_match(&self, clips: &[PathBuf]) -> RenderResult<bool> {
        let mut base: Option<MediaInfo> = None;
        for clip in clips {
            let info = media_info(clip).await?;
            match &base {
                None => base = Some(info),
                Some(reference) => {
                    if !streams_equal(reference, &info) {
                        warn!(
                            clip = %clip.display(),
                            "stream parameters differ from the first scene clip"
                        );
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    async fn reencode_concat(&self, clips: &[PathBuf], output: &Path) -> RenderResult<()> {
        let mut args: Vec<String> = vec!["ffmpeg".into(), "-y".into()];
        args.extend(profile_flags());
        args.extend(self.renderer.thread_flags());
        for clip in clips {
            args.extend(["-i".into(), clip.display().to_string()]);
        }

        let n = clips.len();
        let video_inputs: String = (0..n).map(|i| format!("[{i}:v]")).collect();
        let audio_inputs: String = (0..n).map(|i| format!("[{i}:a]")).collect();
        let filter = format!(
            "{video_inputs}concat=n={n}:v=1:a=0[v_out];{audio_inputs}concat=n={n}:v=0:a=1[a_out]"
        );
        args.extend(["-filter_complex".into(), filter]);
        args.extend([
            "-map".into(),
            "[v_out]".into(),
            "-map".into(),
            "[a_out]".into(),
        ]);
        args.extend(
            self.renderer
                .video_params
                .to_ffmpeg_args(self.renderer.effective_hw_kind()),
        );
        args.extend(self.renderer.audio_params.to_ffmpeg_args());
        args.extend(["-shortest".into(), output.display().to_string()]);

        run_ffmpeg(&args).await?;
        info!("re-encode concat complete");
        Ok(())
    }
}

fn streams_equal(a: &MediaInfo, b: &MediaInfo) -> bool {
    match (&a.video, &b.video) {
        (Some(av), Some(bv)) => {
            if av.codec != bv.codec
                || av.width != bv.width
                || av.height != bv.height
                || av.pix_fmt != bv.pix_fmt
                || (av.fps - bv.fps).abs() > 0.01
            {
                return false;
            }
        }
        (None, None) => {}
        _ => return false,
    }
    match (&a.audio, &b.audio) {
        (Some(aa), Some(ba)) => {
            aa.codec == ba.codec
                && aa.sample_rate == ba.sample_rate
                && aa.channels == ba.channels
        }
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ffmpeg::probe::{AudioInfo, VideoInfo};

    fn info(width: u32, sample_rate: u32) -> MediaInfo {
        MediaInfo {
            video: Some(VideoInfo {
                codec: "h264".into(),
                width,
                height: 1080,
                pix_fmt: "yuv420p".into(),
                fps: 30.0,
            }),
            audio: Some(AudioInfo {
                codec: "aac".into(),
                sample_rate,
                channels: 2,
            }),
        }
    }

    #[test]
    fn test_streams_equal_same() {
        assert!(streams_equal(&info(1920, 48000), &info(1920, 48000)));
    }

    #[test]
    fn test_streams_differ_on_resolution() {
        assert!(!streams_equal(&info(1920, 48000), &info(1280, 48000)));
    }

    #[test]
    fn test_streams_differ_on_audio() {
        assert!(!streams_equal(&info(1920, 48000), &info(1920, 44100)));
    }

    #[test]
    fn test_streams_differ_on_missing_audio() {
        let mut no_audio = info(1920, 48000);
        no_audio.audio = None;
        assert!(!streams_equal(&info(1920, 48000), &no_audio));
    }

    #[test]
    fn test_streams_differ_on_fps() {
        let mut other = info(1920, 48000);
        other.video.as_mut().unwrap().fps = 29.97;
        assert!(!streams_equal(&info(1920, 48000), &other));
    }
}
