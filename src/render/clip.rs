use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::characters::{build_character_overlays, collect_character_inputs};
use super::face::apply_face_overlays;
use super::VideoRenderer;
use crate::config::{BackgroundLayout, CharacterConfig, EffectSpec, InsertConfig};
use crate::effects::{resolve_background_effects, resolve_screen_effects};
use crate::error::{RenderError, RenderResult};
use crate::face_anim::FaceAnim;
use crate::ffmpeg::capabilities::{
    dump_gpu_diagnostics, hw_filter_mode, profile_flags, set_hw_filter_mode, HwEncoderKind,
    HwFilterMode,
};
use crate::ffmpeg::filter::FilterGraph;
use crate::ffmpeg::layout::{background_fit_steps, overlay_position_exprs, BackgroundFit};
use crate::ffmpeg::probe::has_audio_stream;
use crate::ffmpeg::runner::run_ffmpeg;

/// The background input a clip renders over, as chosen by the scene planner.
#[derive(Debug, Clone)]
pub struct BackgroundSource {
    pub path: PathBuf,
    pub is_video: bool,
    pub start_time: f64,
    /// Already normalized to the run's codec/fps parameters.
    pub normalized: bool,
    /// Already at target w/h/fps (scene-base or run-base); fit is skipped.
    pub pre_scaled: bool,
    pub layout: BackgroundLayout,
}

/// Everything the clip builder needs for one line.
#[derive(Debug, Clone)]
pub struct ClipSpec {
    pub audio_path: Option<PathBuf>,
    pub duration: f64,
    pub audio_delay: f64,
    pub background: BackgroundSource,
    pub characters: Vec<CharacterConfig>,
    pub insert: Option<InsertConfig>,
    pub background_effects: Vec<EffectSpec>,
    pub screen_effects: Vec<EffectSpec>,
    pub face_anim: Option<FaceAnim>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterPath {
    CudaOverlay,
    OpenclOverlay,
    GpuScaleHybrid,
    Cpu,
}

/// Render one clip with a single ffmpeg invocation. On a GPU-path failure
/// the process backs off to CPU filters and the clip is retried once.
pub async fn render_clip(
    renderer: &VideoRenderer,
    spec: &ClipSpec,
    output: &Path,
) -> RenderResult<PathBuf> {
    match render_clip_inner(renderer, spec, output, false).await {
        Ok(path) => Ok(path),
        Err(e) if should_fallback(&e) => {
            warn!("GPU filter/encoder path failed; retrying clip on CPU ({e})");
            dump_gpu_diagnostics().await;
            set_hw_filter_mode(HwFilterMode::Cpu);

            let saved: Vec<(&str, Option<String>)> = [
                "DISABLE_HWENC",
                "FFMPEG_FILTER_THREADS",
                "FFMPEG_FILTER_COMPLEX_THREADS",
                "DISABLE_ALPHA_HARD_THRESHOLD",
            ]
            .into_iter()
            .map(|k| (k, std::env::var(k).ok()))
            .collect();
            std::env::set_var("DISABLE_HWENC", "1");
            std::env::set_var("FFMPEG_FILTER_THREADS", "1");
            std::env::set_var("FFMPEG_FILTER_COMPLEX_THREADS", "1");
            std::env::set_var("DISABLE_ALPHA_HARD_THRESHOLD", "1");

            let result = render_clip_inner(renderer, spec, output, true).await;

            for (key, value) in saved {
                match value {
                    Some(v) => std::env::set_var(key, v),
                    None => std::env::remove_var(key),
                }
            }
            result
        }
        Err(e) => Err(e),
    }
}

/// GPU failure signatures that justify one CPU retry: the exit codes NVENC
/// paths die with, or CUDA filter names in stderr.
fn should_fallback(error: &RenderError) -> bool {
    match error {
        RenderError::Ffmpeg { code, stderr } => {
            *code == 218
                || *code == 234
                || stderr.to_lowercase().contains("nvenc")
                || stderr.contains("overlay_cuda")
                || stderr.contains("scale_cuda")
        }
        RenderError::Timeout(_) => hw_filter_mode() != HwFilterMode::Cpu,
        _ => false,
    }
}

async fn render_clip_inner(
    renderer: &VideoRenderer,
    spec: &ClipSpec,
    output: &Path,
    force_cpu: bool,
) -> RenderResult<PathBuf> {
    let t0 = Instant::now();
    let width = renderer.video_params.width;
    let height = renderer.video_params.height;
    let fps = renderer.video_params.fps;
    let duration = spec.duration;

    let mut graph = FilterGraph::new();

    // --- Inputs ------------------------------------------------------------
    let background = &spec.background;
    let bg_index = if background.is_video {
        graph.add_input([
            "-ss".to_string(),
            format!("{}", background.start_time),
            "-i".to_string(),
            background.path.display().to_string(),
        ])
    } else {
        graph.add_input([
            "-loop".to_string(),
            "1".to_string(),
            "-i".to_string(),
            background.path.display().to_string(),
        ])
    };
    debug_assert_eq!(bg_index, 0);

    let speech_index = spec
        .audio_path
        .as_ref()
        .map(|p| graph.add_input(["-i", &p.display().to_string()]));

    let mut insert_index = None;
    let mut insert_is_image = false;
    let mut insert_has_audio = false;
    if let Some(insert) = &spec.insert {
        insert_is_image = renderer.config.system.is_image_path(&insert.path);
        if insert_is_image {
            insert_index =
                Some(graph.add_input(["-loop", "1", "-i", &insert.path.display().to_string()]));
        } else {
            insert_index = Some(graph.add_input(["-i", &insert.path.display().to_string()]));
            insert_has_audio = has_audio_stream(&insert.path).await;
        }
    }

    let char_inputs = collect_character_inputs(renderer, &spec.characters, &mut graph).await?;
    let any_character_visible = !char_inputs.is_empty();

    // --- Path selection ----------------------------------------------------
    // Face overlays composite RGBA PNGs even when the base character was
    // baked into a scene-base, so they force the CPU overlay path too.
    let uses_alpha_overlay =
        any_character_visible || insert_is_image || spec.face_anim.is_some();
    let global_mode = hw_filter_mode();
    let video_cfg = &renderer.config.video;

    let mut use_cuda = renderer.has_cuda_filters
        && renderer.hw_kind == Some(HwEncoderKind::Nvenc)
        && (video_cfg.gpu_overlay_experimental || !uses_alpha_overlay)
        && !force_cpu
        && global_mode != HwFilterMode::Cpu;

    let scale_only_available = renderer.has_gpu_scale || renderer.has_cuda_filters;
    let mut use_gpu_scale_only = !use_cuda
        && scale_only_available
        && renderer.hw_kind == Some(HwEncoderKind::Nvenc)
        && video_cfg.gpu_scale_with_cpu_overlay
        && !force_cpu
        && (global_mode != HwFilterMode::Cpu || renderer.cuda_scale_only_ok);

    if !spec.background_effects.is_empty() && (use_cuda || use_gpu_scale_only) {
        info!("background effects requested; falling back to the CPU overlay path");
        use_cuda = false;
        use_gpu_scale_only = false;
    }

    let requires_cpu_fit = !background.pre_scaled
        && (background.layout.fit != BackgroundFit::Stretch
            || background.layout.position.x.as_expr() != "0"
            || background.layout.position.y.as_expr() != "0");
    if requires_cpu_fit && (use_cuda || use_gpu_scale_only) {
        info!(
            "background fit '{}' requires CPU filters; disabling GPU scaling",
            background.layout.fit.as_str()
        );
        use_cuda = false;
        use_gpu_scale_only = false;
    }

    let use_opencl = !use_cuda
        && !force_cpu
        && renderer.gpu_overlay_backend == super::GpuOverlayBackend::OpenCl
        && global_mode != HwFilterMode::Cpu;

    let path = if use_cuda {
        FilterPath::CudaOverlay
    } else if use_opencl {
        FilterPath::OpenclOverlay
    } else if use_gpu_scale_only {
        FilterPath::GpuScaleHybrid
    } else {
        FilterPath::Cpu
    };
    match path {
        FilterPath::CudaOverlay => {
            info!("filter path: CUDA scale + overlay (no RGBA overlays)");
            renderer.path_counters.cuda_overlay.fetch_add(1, Ordering::Relaxed);
        }
        FilterPath::OpenclOverlay => {
            info!("filter path: OpenCL overlays");
            renderer.path_counters.opencl_overlay.fetch_add(1, Ordering::Relaxed);
        }
        FilterPath::GpuScaleHybrid => {
            info!("filter path: GPU scale + CPU overlays");
            renderer.path_counters.gpu_scale_only.fetch_add(1, Ordering::Relaxed);
        }
        FilterPath::Cpu => {
            debug!("filter path: CPU scale + overlays");
            renderer.path_counters.cpu.fetch_add(1, Ordering::Relaxed);
        }
    }

    // --- Background --------------------------------------------------------
    let apply_fps = !background.pre_scaled;
    if background.pre_scaled {
        graph.add_chain("[0:v]null[bg]");
    } else {
        match path {
            FilterPath::CudaOverlay => {
                graph.add_chain("[0:v]format=rgba,hwupload_cuda[hw_bg_in]");
                graph.add_chain(format!(
                    "[hw_bg_in]{}={width}:{height}{}[bg]",
                    renderer.scale_filter,
                    fps_suffix(apply_fps, fps)
                ));
            }
            FilterPath::GpuScaleHybrid => {
                graph.add_chain("[0:v]format=rgba,hwupload_cuda[hw_bg_in]");
                graph.add_chain(format!(
                    "[hw_bg_in]{}={width}:{height}{}[bg_gpu_scaled]",
                    renderer.scale_filter,
                    fps_suffix(apply_fps, fps)
                ));
                graph.add_chain("[bg_gpu_scaled]hwdownload,format=rgba[bg]");
            }
            FilterPath::OpenclOverlay | FilterPath::Cpu => {
                let steps = background_fit_steps(
                    width,
                    height,
                    background.layout.fit,
                    &background.layout.fill_color,
                    background.layout.anchor,
                    &background.layout.position.x.as_expr(),
                    &background.layout.position.y.as_expr(),
                    &renderer.scale_flags,
                );
                let mut chain = steps.join(",");
                if apply_fps {
                    chain.push_str(&format!(",fps={fps}"));
                }
                graph.add_chain(format!("[0:v]{chain}[bg]"));
            }
        }
    }

    let mut current = "[bg]".to_string();
    if let Some(effect) = resolve_background_effects(
        &spec.background_effects,
        &current,
        duration,
        width,
        height,
    ) {
        for chain in effect.filter_chain {
            graph.add_chain(chain);
        }
        current = effect.output_label;
    }

    // OpenCL composes on the GPU: lift the background after CPU fitting.
    if path == FilterPath::OpenclOverlay {
        graph.add_chain(format!("{current}format=rgba,hwupload[bg_gpu]"));
        current = "[bg_gpu]".to_string();
    }

    let mut overlay_streams: Vec<String> = Vec::new();
    let mut overlay_filters: Vec<String> = Vec::new();

    // --- Insert media overlay ----------------------------------------------
    if let (Some(insert), Some(index)) = (&spec.insert, insert_index) {
        let scale = insert.scale;
        let (x, y) = overlay_position_exprs(
            "W",
            "H",
            "w",
            "h",
            insert.anchor,
            &insert.position.x.as_expr(),
            &insert.position.y.as_expr(),
        );
        match path {
            FilterPath::CudaOverlay => {
                let pix = if insert_is_image { "rgba" } else { "nv12" };
                graph.add_chain(format!(
                    "[{index}:v]format={pix},hwupload_cuda,{}=iw*{scale}:ih*{scale}[insert_scaled]",
                    renderer.scale_filter
                ));
                overlay_streams.push("[insert_scaled]".into());
                overlay_filters.push(format!("overlay_cuda=x={x}:y={y}"));
            }
            FilterPath::OpenclOverlay => {
                graph.add_chain(format!(
                    "[{index}:v]scale=iw*{scale}:ih*{scale}[insert_scaled]"
                ));
                graph.add_chain("[insert_scaled]format=rgba,hwupload[insert_gpu]");
                overlay_streams.push("[insert_gpu]".into());
                overlay_filters.push(format!("overlay_opencl=x={x}:y={y}"));
            }
            _ => {
                graph.add_chain(format!(
                    "[{index}:v]scale=iw*{scale}:ih*{scale}:flags={}[insert_scaled]",
                    renderer.scale_flags
                ));
                overlay_streams.push("[insert_scaled]".into());
                overlay_filters.push(format!("overlay=x={x}:y={y}"));
            }
        }
    }

    // --- Character overlays -------------------------------------------------
    let placements = build_character_overlays(
        renderer,
        &spec.characters,
        &char_inputs,
        duration,
        &mut graph,
        &mut overlay_streams,
        &mut overlay_filters,
        path == FilterPath::CudaOverlay,
        path == FilterPath::OpenclOverlay,
    );

    // --- Face animation ----------------------------------------------------
    if let Some(face_anim) = &spec.face_anim {
        apply_face_overlays(
            renderer,
            face_anim,
            &spec.characters,
            &placements,
            &mut graph,
            &mut overlay_streams,
            &mut overlay_filters,
        )
        .await?;
    }

    // --- Compose overlay chain ---------------------------------------------
    if !overlay_streams.is_empty() {
        if path == FilterPath::OpenclOverlay {
            for filter in overlay_filters.iter_mut() {
                if filter.starts_with("overlay=") {
                    *filter = filter.replacen("overlay=", "overlay_opencl=", 1);
                }
            }
        }
        let mut chain = current.clone();
        for (i, stream) in overlay_streams.iter().enumerate() {
            chain.push_str(stream);
            chain.push_str(&overlay_filters[i]);
            if i < overlay_streams.len() - 1 {
                chain.push_str(&format!("[tmp_overlay_{i}];[tmp_overlay_{i}]"));
            } else {
                chain.push_str("[composed]");
            }
        }
        graph.add_chain(chain);
        if path == FilterPath::OpenclOverlay {
            graph.add_chain("[composed]hwdownload,format=yuv420p[composed_cpu]");
            current = "[composed_cpu]".to_string();
        } else {
            current = "[composed]".to_string();
        }
    }

    // --- Screen effects ----------------------------------------------------
    if let Some(effect) =
        resolve_screen_effects(&spec.screen_effects, &current, duration, width, height)
    {
        for chain in effect.filter_chain {
            graph.add_chain(chain);
        }
        current = effect.output_label;
    }

    // --- Format normalization ----------------------------------------------
    let hw = if force_cpu {
        None
    } else {
        renderer.effective_hw_kind()
    };
    if path == FilterPath::CudaOverlay && hw == Some(HwEncoderKind::Nvenc) {
        // Frames stay on the GPU straight into NVENC.
        graph.add_chain(format!("{current}null[final_v]"));
    } else {
        graph.add_chain(format!("{current}format=yuv420p[final_v]"));
    }

    // --- Audio ---------------------------------------------------------------
    let speech_has_audio = match (&spec.audio_path, speech_index) {
        (Some(path), Some(_)) => has_audio_stream(path).await,
        _ => false,
    };
    let audio_src = if let (Some(insert), Some(index), true) =
        (&spec.insert, insert_index, insert_has_audio)
    {
        graph.add_chain(format!(
            "[{index}:a]volume={}[insert_audio_vol]",
            insert.volume
        ));
        if speech_has_audio {
            graph.add_chain(format!(
                "[{}:a][insert_audio_vol]amix=inputs=2:duration=longest:dropout_transition=0[mixed_a]",
                speech_index.unwrap()
            ));
            "[mixed_a]".to_string()
        } else {
            "[insert_audio_vol]".to_string()
        }
    } else if speech_has_audio {
        format!("[{}:a]", speech_index.unwrap())
    } else {
        graph.add_chain(format!(
            "anullsrc=channel_layout={}:sample_rate={}[sil]",
            renderer.audio_params.channel_layout(),
            renderer.audio_params.sample_rate
        ));
        "[sil]".to_string()
    };

    let delay_ms = (spec.audio_delay * 1000.0).round().max(0.0) as u64;
    graph.add_chain(format!(
        "{audio_src}adelay={delay_ms}:all=1,apad=pad_dur={duration}[final_a]"
    ));

    // --- Assemble & run -----------------------------------------------------
    let mut args: Vec<String> = vec![
        "ffmpeg".into(),
        "-y".into(),
        "-hide_banner".into(),
        "-loglevel".into(),
        "warning".into(),
    ];
    args.extend(profile_flags());
    args.extend(renderer.thread_flags());
    args.extend(graph.input_args());
    args.extend(["-filter_complex".into(), graph.render()]);
    args.extend(["-map".into(), "[final_v]".into(), "-map".into(), "[final_a]".into()]);
    args.extend(["-t".into(), duration.to_string()]);
    args.extend(renderer.video_params.to_ffmpeg_args(hw));
    args.extend(renderer.audio_params.to_ffmpeg_args());
    args.extend(["-shortest".into(), output.display().to_string()]);

    let out = run_ffmpeg(&args).await?;
    if !out.stderr.is_empty() {
        debug!("ffmpeg stderr (non-fatal):\n{}", out.stderr.trim_end());
    }
    info!(
        clip = %output.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default(),
        elapsed = ?t0.elapsed(),
        "rendered clip"
    );
    Ok(output.to_path_buf())
}

fn fps_suffix(apply: bool, fps: u32) -> String {
    if apply {
        format!(",fps={fps}")
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_fallback_on_gpu_exit_codes() {
        for code in [218, 234] {
            assert!(should_fallback(&RenderError::Ffmpeg {
                code,
                stderr: String::new()
            }));
        }
        assert!(!should_fallback(&RenderError::Ffmpeg {
            code: 1,
            stderr: "generic failure".into()
        }));
    }

    #[test]
    fn test_should_fallback_on_stderr_markers() {
        for marker in ["h264_nvenc busy", "overlay_cuda error", "scale_cuda error", "NVENC init"] {
            assert!(
                should_fallback(&RenderError::Ffmpeg {
                    code: 1,
                    stderr: marker.into()
                }),
                "marker {marker} should trigger fallback"
            );
        }
    }

    #[test]
    fn test_no_fallback_for_other_errors() {
        assert!(!should_fallback(&RenderError::Pipeline("x".into())));
        assert!(!should_fallback(&RenderError::Tts("x".into())));
    }

    #[test]
    fn test_fps_suffix() {
        assert_eq!(fps_suffix(true, 30), ",fps=30");
        assert_eq!(fps_suffix(false, 30), "");
    }
}
