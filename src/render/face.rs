use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::characters::{scaled_overlay, CharacterPlacement};
use super::VideoRenderer;
use crate::config::CharacterConfig;
use crate::error::RenderResult;
use crate::face_anim::{FaceAnim, MouthSeg, MouthState};
use crate::ffmpeg::filter::FilterGraph;
use crate::ffmpeg::layout::overlay_position_exprs;

/// Sum of `between(t, start, end)` windows, optionally clipped to begin at
/// `start_offset`.
fn enable_expr<I>(segments: I, start_offset: f64) -> Option<String>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut parts = Vec::new();
    for (mut start, end) in segments {
        if start_offset > 0.0 {
            if end <= start_offset {
                continue;
            }
            if start < start_offset {
                start = start_offset;
            }
        }
        if end <= start {
            continue;
        }
        parts.push(format!("between(t,{start:.3},{end:.3})"));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("+"))
    }
}

fn first_existing(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates.iter().find(|p| p.exists()).cloned()
}

/// Face part image: expression-specific directory first, then the shared one.
fn face_part(base_dir: &Path, expression: &str, part: &str, name: &str) -> Option<PathBuf> {
    first_existing(&[
        base_dir.join(expression).join(part).join(name),
        base_dir.join(part).join(name),
    ])
}

fn alpha_threshold() -> Option<u32> {
    if std::env::var("DISABLE_ALPHA_HARD_THRESHOLD").as_deref() == Ok("1") {
        return None;
    }
    match std::env::var("FACE_ALPHA_THRESHOLD") {
        Ok(v) => v.parse().ok().or(Some(128)),
        Err(_) => Some(128),
    }
}

/// Placement fallback when the target character is configured on the line
/// but was baked into a scene-base (so no live overlay placement exists).
fn placement_from_config(characters: &[CharacterConfig], target: &str) -> Option<CharacterPlacement> {
    let ch = characters.iter().find(|c| c.name == target)?;
    let (x_expr, y_expr) = overlay_position_exprs(
        "W",
        "H",
        "w",
        "h",
        ch.anchor,
        &ch.position.x.as_expr(),
        &ch.position.y.as_expr(),
    );
    Some(CharacterPlacement {
        x_expr,
        y_expr,
        x_num: 0,
        y_num: 0,
        enter_effect: ch.enter.clone().unwrap_or_default().to_lowercase(),
        enter_duration: ch.enter_duration,
        fade: String::new(),
        scale_orig: ch.scale,
        expression: ch.expression.clone(),
        dynamic_position: false,
    })
}

/// Add mouth/eye overlays for the speaking character.
///
/// Face overlays anchor to the numeric base placement so they land exactly
/// on the character at rest; when the base position is dynamic (slides or
/// positional effects) they inherit the dynamic expression instead. Mouth
/// segments are deferred past the enter animation; blinks are not.
#[allow(clippy::too_many_arguments)]
pub async fn apply_face_overlays(
    renderer: &VideoRenderer,
    face_anim: &FaceAnim,
    characters: &[CharacterConfig],
    placements: &HashMap<String, CharacterPlacement>,
    graph: &mut FilterGraph,
    overlay_streams: &mut Vec<String>,
    overlay_filters: &mut Vec<String>,
) -> RenderResult<()> {
    let target = face_anim.target_name.as_str();
    if target.is_empty() {
        return Ok(());
    }
    let placement = match placements.get(target) {
        Some(p) => p.clone(),
        None => match placement_from_config(characters, target) {
            Some(p) => p,
            None => return Ok(()),
        },
    };

    let use_dynamic =
        placement.dynamic_position || placement.enter_effect.starts_with("slide");
    let (x_pos, y_pos) = if use_dynamic {
        (placement.x_expr.clone(), placement.y_expr.clone())
    } else {
        (placement.x_num.to_string(), placement.y_num.to_string())
    };

    let base_dir = PathBuf::from("assets/characters").join(target);
    let expression = placement.expression.as_str();
    let scale = placement.scale_orig;

    let use_face_cache = std::env::var("FACE_CACHE_DISABLE").as_deref() != Ok("1");
    let add_overlay = |graph: &mut FilterGraph,
                           path: PathBuf,
                           label: String,
                           pre_scaled: bool,
                           enable: String,
                           overlay_streams: &mut Vec<String>,
                           overlay_filters: &mut Vec<String>| {
        let index = graph.add_input(["-loop", "1", "-i", &path.display().to_string()]);
        if pre_scaled {
            graph.add_chain(format!(
                "[{index}:v]format=rgba{}[{label}]",
                placement.fade
            ));
        } else {
            graph.add_chain(format!(
                "[{index}:v]format=rgba{},scale=iw*{scale}:ih*{scale}[{label}]",
                placement.fade
            ));
        }
        overlay_streams.push(format!("[{label}]"));
        overlay_filters.push(format!("overlay=x={x_pos}:y={y_pos}:enable='{enable}'"));
    };

    // Eyes: closed image shown during blink windows; never deferred.
    if let Some(eyes_close) = face_part(&base_dir, expression, "eyes", "close.png") {
        let eyes = face_anim.eyes.iter().map(|b| (b.start, b.end));
        if let Some(enable) = enable_expr(eyes, 0.0) {
            let (path, pre_scaled) = prepare(renderer, &eyes_close, scale, use_face_cache).await;
            let label = graph.label("eyes_close");
            add_overlay(
                graph,
                path,
                label,
                pre_scaled,
                enable,
                overlay_streams,
                overlay_filters,
            );
        }
    }

    if face_anim.mouth.is_empty() {
        return Ok(());
    }

    let delayed = matches!(
        placement.enter_effect.as_str(),
        "fade" | "slide_left" | "slide_right" | "slide_top" | "slide_bottom"
    ) && placement.enter_duration > 0.0;
    let start_offset = if delayed { placement.enter_duration } else { 0.0 };
    if start_offset > 0.0 {
        debug!(
            "deferring mouth animation until {start_offset:.2}s (enter={})",
            placement.enter_effect
        );
    }

    for (state, file) in [(MouthState::Half, "half.png"), (MouthState::Open, "open.png")] {
        let segments: Vec<&MouthSeg> = face_anim
            .mouth
            .iter()
            .filter(|s| s.state == state)
            .collect();
        if segments.is_empty() {
            continue;
        }
        let Some(image) = face_part(&base_dir, expression, "mouth", file) else {
            continue;
        };
        let windows = segments.iter().map(|s| (s.start, s.end));
        let Some(enable) = enable_expr(windows, start_offset) else {
            continue;
        };
        let (path, pre_scaled) = prepare(renderer, &image, scale, use_face_cache).await;
        let label = graph.label("mouth");
        add_overlay(
            graph,
            path,
            label,
            pre_scaled,
            enable,
            overlay_streams,
            overlay_filters,
        );
    }

    Ok(())
}

/// Substitute the cached pre-scaled variant when available.
async fn prepare(
    renderer: &VideoRenderer,
    path: &Path,
    scale: f64,
    use_cache: bool,
) -> (PathBuf, bool) {
    if !use_cache {
        return (path.to_path_buf(), false);
    }
    match scaled_overlay(renderer, path, scale, alpha_threshold()).await {
        Ok(cached) => (cached, true),
        Err(e) => {
            debug!("face overlay pre-scale failed ({e}); scaling in-graph");
            (path.to_path_buf(), false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_expr_joins_windows() {
        let expr = enable_expr(vec![(0.0, 1.0), (2.0, 2.5)], 0.0).unwrap();
        assert_eq!(expr, "between(t,0.000,1.000)+between(t,2.000,2.500)");
    }

    #[test]
    fn test_enable_expr_clips_to_offset() {
        // Window fully before the offset disappears; straddling one is clipped.
        let expr = enable_expr(vec![(0.0, 0.2), (0.1, 1.0)], 0.4).unwrap();
        assert_eq!(expr, "between(t,0.400,1.000)");
    }

    #[test]
    fn test_enable_expr_empty_is_none() {
        assert!(enable_expr(vec![], 0.0).is_none());
        assert!(enable_expr(vec![(0.0, 0.3)], 0.5).is_none());
    }

    #[test]
    fn test_placement_fallback_uses_config() {
        use crate::config::{CharacterConfig, Coord, Position};
        use crate::ffmpeg::layout::Anchor;
        let characters = vec![CharacterConfig {
            name: "metan".into(),
            expression: "smile".into(),
            visible: true,
            scale: 0.9,
            anchor: Anchor::BottomLeft,
            position: Position {
                x: Coord::Num(10.0),
                y: Coord::Num(0.0),
            },
            enter: Some("fade".into()),
            leave: None,
            enter_duration: 0.5,
            leave_duration: 0.3,
            effects: vec![],
        }];
        let p = placement_from_config(&characters, "metan").unwrap();
        assert_eq!(p.expression, "smile");
        assert_eq!(p.enter_effect, "fade");
        assert_eq!(p.scale_orig, 0.9);
        assert!(placement_from_config(&characters, "nobody").is_none());
    }
}
