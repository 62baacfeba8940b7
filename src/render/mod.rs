pub mod characters;
pub mod clip;
pub mod face;
pub mod overlays;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::cache::CacheManager;
use crate::config::{BackgroundLayout, Config};
use crate::error::{RenderError, RenderResult};
use crate::ffmpeg::capabilities::{
    self, profile_flags, thread_flags, HwEncoderKind,
};
use crate::ffmpeg::layout::background_fit_steps;
use crate::ffmpeg::params::{AudioParams, VideoParams};
use crate::ffmpeg::runner::run_ffmpeg;
use crate::plugins::PluginRegistry;
use crate::subtitle::SubtitleRasterizer;

/// Which GPU overlay backend survived probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuOverlayBackend {
    Cuda,
    OpenCl,
    None,
}

/// Per-run counters of which filter path clips actually took.
#[derive(Debug, Default)]
pub struct PathCounters {
    pub cuda_overlay: AtomicUsize,
    pub opencl_overlay: AtomicUsize,
    pub gpu_scale_only: AtomicUsize,
    pub cpu: AtomicUsize,
}

impl PathCounters {
    pub fn summary(&self) -> String {
        format!(
            "cuda_overlay={}, opencl_overlay={}, gpu_scale_only={}, cpu={}",
            self.cuda_overlay.load(Ordering::Relaxed),
            self.opencl_overlay.load(Ordering::Relaxed),
            self.gpu_scale_only.load(Ordering::Relaxed),
            self.cpu.load(Ordering::Relaxed),
        )
    }
}

/// Shared clip/scene renderer state: capability flags probed once, encoder
/// parameters, cache, and the plugin registry.
pub struct VideoRenderer {
    pub config: Arc<Config>,
    pub temp_dir: PathBuf,
    pub cache: Arc<CacheManager>,
    pub registry: Arc<PluginRegistry>,
    pub rasterizer: Arc<dyn SubtitleRasterizer>,
    pub video_params: VideoParams,
    pub audio_params: AudioParams,
    pub hw_kind: Option<HwEncoderKind>,
    pub jobs: Option<String>,
    pub clip_workers: AtomicUsize,
    pub has_cuda_filters: bool,
    pub has_gpu_scale: bool,
    pub gpu_overlay_backend: GpuOverlayBackend,
    pub cuda_scale_only_ok: bool,
    pub scale_filter: &'static str,
    pub scale_flags: String,
    pub path_counters: PathCounters,
}

impl VideoRenderer {
    #[allow(clippy::too_many_arguments)]
    pub async fn create(
        config: Arc<Config>,
        temp_dir: PathBuf,
        cache: Arc<CacheManager>,
        registry: Arc<PluginRegistry>,
        rasterizer: Arc<dyn SubtitleRasterizer>,
        video_params: VideoParams,
        audio_params: AudioParams,
        hw_kind: Option<HwEncoderKind>,
        jobs: Option<String>,
        clip_workers: usize,
    ) -> Self {
        let has_cuda_filters = capabilities::has_cuda_filters().await;
        let has_gpu_scale = capabilities::has_gpu_scale_filters().await;
        let has_opencl = capabilities::has_opencl_filters().await;
        let gpu_overlay_backend = if has_cuda_filters && hw_kind == Some(HwEncoderKind::Nvenc) {
            GpuOverlayBackend::Cuda
        } else if has_opencl {
            GpuOverlayBackend::OpenCl
        } else {
            GpuOverlayBackend::None
        };
        let scale_filter = capabilities::preferred_cuda_scale_filter().await;
        info!(
            cuda = has_cuda_filters,
            gpu_scale = has_gpu_scale,
            opencl = has_opencl,
            hw = hw_kind.map(|k| k.as_str()).unwrap_or("none"),
            "renderer capabilities probed"
        );

        Self {
            config,
            temp_dir,
            cache,
            registry,
            rasterizer,
            video_params,
            audio_params,
            hw_kind,
            jobs,
            clip_workers: AtomicUsize::new(clip_workers.max(1)),
            has_cuda_filters,
            has_gpu_scale,
            gpu_overlay_backend,
            cuda_scale_only_ok: has_gpu_scale,
            scale_filter,
            scale_flags: "bicubic".into(),
            path_counters: PathCounters::default(),
        }
    }

    pub fn clip_workers(&self) -> usize {
        self.clip_workers.load(Ordering::Relaxed)
    }

    pub fn set_clip_workers(&self, workers: usize) {
        self.clip_workers.store(workers.max(1), Ordering::Relaxed);
    }

    pub fn thread_flags(&self) -> Vec<String> {
        thread_flags(self.jobs.as_deref(), self.clip_workers(), self.hw_kind)
    }

    /// Encoder kind after honoring `DISABLE_HWENC` retro-toggles set during
    /// a CPU fallback retry.
    pub fn effective_hw_kind(&self) -> Option<HwEncoderKind> {
        if std::env::var("DISABLE_HWENC").as_deref() == Ok("1") {
            None
        } else {
            self.hw_kind
        }
    }

    /// Normalize arbitrary media into the run's canonical parameters
    /// (resolution, fps, pixel format, audio params), cached by content key.
    pub async fn normalize_media(
        &self,
        input: &Path,
        layout: Option<&BackgroundLayout>,
    ) -> RenderResult<PathBuf> {
        let key = json!({
            "op": "normalize_media",
            "input": input.canonicalize().unwrap_or_else(|_| input.to_path_buf()),
            "video_params": self.video_params,
            "audio_params": self.audio_params,
            "fit": layout.map(|l| l.fit.as_str()),
            "anchor": layout.map(|l| l.anchor.as_str()),
            "fill": layout.map(|l| l.fill_color.clone()),
            "pos_x": layout.map(|l| l.position.x.as_expr()),
            "pos_y": layout.map(|l| l.position.y.as_expr()),
        });
        let input = input.to_path_buf();
        let params = self.video_params.clone();
        let audio = self.audio_params.clone();
        let layout = layout.cloned();
        let flags = self.thread_flags();
        let scale_flags = self.scale_flags.clone();
        self.cache
            .get_or_create(&key, "normalized", "mp4", |out| async move {
                let steps = match &layout {
                    Some(layout) => background_fit_steps(
                        params.width,
                        params.height,
                        layout.fit,
                        &layout.fill_color,
                        layout.anchor,
                        &layout.position.x.as_expr(),
                        &layout.position.y.as_expr(),
                        &scale_flags,
                    ),
                    None => vec![format!(
                        "scale={}:{}:flags={}",
                        params.width, params.height, scale_flags
                    )],
                };
                let mut vf = steps.join(",");
                vf.push_str(&format!(",fps={}", params.fps));

                let mut args: Vec<String> = vec!["ffmpeg".into(), "-y".into()];
                args.extend(profile_flags());
                args.extend(flags);
                args.extend(["-i".into(), input.display().to_string()]);
                args.extend(["-vf".into(), vf]);
                args.extend(params.to_ffmpeg_args(None));
                args.extend(audio.to_ffmpeg_args());
                args.push(out.display().to_string());
                run_ffmpeg(&args).await?;
                Ok(out)
            })
            .await
    }

    /// Pre-render a scene-base: the fitted background (image looped or video)
    /// composited with the static overlays, at exact target w/h/fps.
    pub async fn render_scene_base(
        &self,
        bg_path: &Path,
        bg_is_video: bool,
        layout: &BackgroundLayout,
        duration: f64,
        static_overlays: &[StaticOverlay],
        file_name: &str,
    ) -> RenderResult<PathBuf> {
        let key = json!({
            "op": "scene_base",
            "bg": bg_path.canonicalize().unwrap_or_else(|_| bg_path.to_path_buf()),
            "is_video": bg_is_video,
            "duration": format!("{duration:.3}"),
            "fit": layout.fit.as_str(),
            "anchor": layout.anchor.as_str(),
            "fill": layout.fill_color,
            "pos_x": layout.position.x.as_expr(),
            "pos_y": layout.position.y.as_expr(),
            "overlays": static_overlays.iter().map(StaticOverlay::key).collect::<Vec<_>>(),
            "video_params": self.video_params,
            "hw_kind": self.effective_hw_kind().map(|k| k.as_str()),
        });

        let params = self.video_params.clone();
        let layout = layout.clone();
        let overlays = static_overlays.to_vec();
        let bg_path = bg_path.to_path_buf();
        let flags = self.thread_flags();
        let scale_flags = self.scale_flags.clone();
        let hw = self.effective_hw_kind();
        self.cache
            .get_or_create(&key, file_name, "mp4", |out| async move {
                let mut args: Vec<String> = vec!["ffmpeg".into(), "-y".into()];
                args.extend(profile_flags());
                args.extend(flags);
                if bg_is_video {
                    args.extend([
                        "-stream_loop".into(),
                        "-1".into(),
                        "-i".into(),
                        bg_path.display().to_string(),
                    ]);
                } else {
                    args.extend(["-loop".into(), "1".into(), "-i".into(), bg_path.display().to_string()]);
                }
                for overlay in &overlays {
                    args.extend([
                        "-loop".into(),
                        "1".into(),
                        "-i".into(),
                        overlay.path.display().to_string(),
                    ]);
                }

                let fit_steps = background_fit_steps(
                    params.width,
                    params.height,
                    layout.fit,
                    &layout.fill_color,
                    layout.anchor,
                    &layout.position.x.as_expr(),
                    &layout.position.y.as_expr(),
                    &scale_flags,
                );
                let mut chains: Vec<String> = Vec::new();
                chains.push(format!(
                    "[0:v]{},fps={}[bg]",
                    fit_steps.join(","),
                    params.fps
                ));
                let mut current = "[bg]".to_string();
                for (i, overlay) in overlays.iter().enumerate() {
                    let idx = i + 1;
                    let scaled = format!("[ov_scaled_{idx}]");
                    chains.push(format!(
                        "[{idx}:v]scale=iw*{}:ih*{}:flags={scale_flags},format=rgba{scaled}",
                        overlay.scale, overlay.scale
                    ));
                    let (x, y) = overlay.position_exprs();
                    let label = format!("[base_{idx}]");
                    chains.push(format!("{current}{scaled}overlay=x={x}:y={y}{label}"));
                    current = label;
                }
                chains.push(format!("{current}format=yuv420p[final_v]"));

                args.extend(["-filter_complex".into(), chains.join(";")]);
                args.extend(["-map".into(), "[final_v]".into()]);
                args.extend(["-t".into(), format!("{duration:.3}")]);
                args.extend(params.to_ffmpeg_args(hw));
                args.push("-an".into());
                args.push(out.display().to_string());
                run_ffmpeg(&args).await?;
                Ok(out)
            })
            .await
            .map(|path| {
                debug!(base = %path.display(), "scene base ready");
                path
            })
    }

    /// Stream-copy concat of per-line clips into one scene file.
    pub async fn concat_clips(&self, clips: &[PathBuf], output: &Path) -> RenderResult<()> {
        if clips.is_empty() {
            return Err(RenderError::Pipeline("no clips to concatenate".into()));
        }
        if clips.len() == 1 {
            std::fs::copy(&clips[0], output)?;
            return Ok(());
        }
        let list_path = output.with_extension("concat.txt");
        let mut list = String::new();
        for clip in clips {
            let canonical = clip.canonicalize().unwrap_or_else(|_| clip.clone());
            list.push_str(&format!("file '{}'\n", canonical.display()));
        }
        std::fs::write(&list_path, list)?;

        let args: Vec<String> = vec![
            "ffmpeg".into(),
            "-y".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.display().to_string(),
            "-c".into(),
            "copy".into(),
            output.display().to_string(),
        ];
        let result = run_ffmpeg(&args).await;
        let _ = std::fs::remove_file(&list_path);
        result.map(|_| ())
    }
}

/// A character or insert image baked into a scene-base or run-base.
#[derive(Debug, Clone)]
pub struct StaticOverlay {
    pub path: PathBuf,
    pub scale: f64,
    pub anchor: crate::ffmpeg::layout::Anchor,
    pub x: String,
    pub y: String,
}

impl StaticOverlay {
    fn key(&self) -> serde_json::Value {
        json!({
            "path": self.path.display().to_string(),
            "scale": format!("{:.2}", self.scale),
            "anchor": self.anchor.as_str(),
            "x": self.x,
            "y": self.y,
        })
    }

    fn position_exprs(&self) -> (String, String) {
        crate::ffmpeg::layout::overlay_position_exprs(
            "W", "H", "w", "h", self.anchor, &self.x, &self.y,
        )
    }
}
