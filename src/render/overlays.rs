use std::path::{Path, PathBuf};

use tracing::info;

use super::VideoRenderer;
use crate::config::ForegroundOverlay;
use crate::error::RenderResult;
use crate::ffmpeg::capabilities::profile_flags;
use crate::ffmpeg::filter::FilterGraph;
use crate::ffmpeg::layout::overlay_position_exprs;
use crate::ffmpeg::probe::has_audio_stream;
use crate::ffmpeg::runner::run_ffmpeg;
use crate::subtitle::SubtitleEvent;

/// Overlay scene-level foreground media and the collected subtitles onto a
/// concatenated scene clip in a single pass. Subtitles are rasterized to
/// PNGs and shown over their `(start, duration)` windows, so per-line clips
/// stay subtitle-free and cache across text edits.
pub async fn apply_scene_overlays(
    renderer: &VideoRenderer,
    scene_clip: &Path,
    fg_overlays: &[ForegroundOverlay],
    subtitles: &[SubtitleEvent],
    output: &Path,
) -> RenderResult<PathBuf> {
    if fg_overlays.is_empty() && subtitles.is_empty() {
        return Ok(scene_clip.to_path_buf());
    }

    let mut graph = FilterGraph::new();
    graph.add_input(["-i", &scene_clip.display().to_string()]);

    struct Planned {
        index: usize,
        scale: f64,
        x: String,
        y: String,
        enable: Option<String>,
    }
    let mut planned: Vec<Planned> = Vec::new();

    for overlay in fg_overlays {
        let is_video = renderer.config.system.is_video_path(&overlay.path);
        let index = if is_video {
            graph.add_input(["-i", &overlay.path.display().to_string()])
        } else {
            graph.add_input(["-loop", "1", "-i", &overlay.path.display().to_string()])
        };
        let (x, y) = overlay_position_exprs(
            "W",
            "H",
            "w",
            "h",
            overlay.anchor,
            &overlay.position.x.as_expr(),
            &overlay.position.y.as_expr(),
        );
        let enable = overlay.duration.map(|d| {
            format!(
                "between(t,{:.3},{:.3})",
                overlay.start_time,
                overlay.start_time + d
            )
        });
        planned.push(Planned {
            index,
            scale: overlay.scale,
            x,
            y,
            enable,
        });
    }

    for event in subtitles {
        let png = renderer
            .rasterizer
            .render(&event.text, &event.style, &renderer.cache)
            .await?;
        let index = graph.add_input(["-loop", "1", "-i", &png.display().to_string()]);
        let (x, y) = overlay_position_exprs(
            "W",
            "H",
            "w",
            "h",
            event.style.anchor,
            &event.style.position.x.as_expr(),
            &event.style.position.y.as_expr(),
        );
        let y = renderer
            .registry
            .resolve_subtitle_y_expr(&y, &event.style.effects);
        planned.push(Planned {
            index,
            scale: 1.0,
            x,
            y,
            enable: Some(format!(
                "between(t,{:.3},{:.3})",
                event.start,
                event.start + event.duration
            )),
        });
    }

    let mut current = "[0:v]".to_string();
    for (i, p) in planned.iter().enumerate() {
        let prepared = format!("[fg_prep_{i}]");
        if (p.scale - 1.0).abs() > 1e-6 {
            graph.add_chain(format!(
                "[{}:v]scale=iw*{}:ih*{}:flags={},format=rgba{prepared}",
                p.index, p.scale, p.scale, renderer.scale_flags
            ));
        } else {
            graph.add_chain(format!("[{}:v]format=rgba{prepared}", p.index));
        }
        let out = format!("[fg_{i}]");
        let enable = p
            .enable
            .as_ref()
            .map(|e| format!(":enable='{e}'"))
            .unwrap_or_default();
        graph.add_chain(format!(
            "{current}{prepared}overlay=x={}:y={}{enable}{out}",
            p.x, p.y
        ));
        current = out;
    }
    graph.add_chain(format!("{current}format=yuv420p[with_fg]"));

    let scene_has_audio = has_audio_stream(scene_clip).await;
    let mut args: Vec<String> = vec!["ffmpeg".into(), "-y".into()];
    args.extend(profile_flags());
    args.extend(renderer.thread_flags());
    args.extend(graph.input_args());
    args.extend(["-filter_complex".into(), graph.render()]);
    args.extend(["-map".into(), "[with_fg]".into()]);
    if scene_has_audio {
        args.extend(["-map".into(), "0:a".into(), "-c:a".into(), "copy".into()]);
    }
    args.extend(
        renderer
            .video_params
            .to_ffmpeg_args(renderer.effective_hw_kind()),
    );
    // PNG inputs loop forever; the scene clip bounds the output.
    args.extend(["-shortest".into(), output.display().to_string()]);

    run_ffmpeg(&args).await?;
    info!(
        overlays = fg_overlays.len(),
        subtitles = subtitles.len(),
        "applied scene overlays"
    );
    Ok(output.to_path_buf())
}
