use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde_json::json;
use tracing::{debug, warn};

use super::VideoRenderer;
use crate::config::CharacterConfig;
use crate::effects::resolve_character_effects;
use crate::error::RenderResult;
use crate::ffmpeg::filter::FilterGraph;
use crate::ffmpeg::layout::{overlay_position_exprs, overlay_position_numeric};
use crate::ffmpeg::runner::run_ffmpeg;

/// Resolve a character base image: `assets/characters/<name>/<expr>/base.png`
/// with legacy flat and default fallbacks.
pub fn resolve_character_image(name: &str, expression: &str) -> Option<PathBuf> {
    let base_dir = PathBuf::from("assets/characters").join(name);
    let candidates = [
        base_dir.join(expression).join("base.png"),
        base_dir.join(format!("{expression}.png")),
        base_dir.join("default").join("base.png"),
        base_dir.join("default.png"),
    ];
    candidates.into_iter().find(|c| c.exists())
}

/// PNG pixel dimensions read straight from the IHDR chunk.
pub fn png_dimensions(path: &Path) -> Option<(u32, u32)> {
    let mut header = [0u8; 24];
    use std::io::Read;
    let mut file = std::fs::File::open(path).ok()?;
    file.read_exact(&mut header).ok()?;
    if &header[0..8] != b"\x89PNG\r\n\x1a\n" || &header[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(header[16..20].try_into().unwrap());
    let height = u32::from_be_bytes(header[20..24].try_into().unwrap());
    Some((width, height))
}

/// Pre-scaled (and optionally alpha-hard-thresholded) overlay variant,
/// cached by source content + scale + threshold.
pub async fn scaled_overlay(
    renderer: &VideoRenderer,
    src: &Path,
    scale: f64,
    alpha_threshold: Option<u32>,
) -> RenderResult<PathBuf> {
    let st = std::fs::metadata(src)?;
    let mtime = st
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let key = json!({
        "op": "overlay_scaled",
        "src": src.canonicalize().unwrap_or_else(|_| src.to_path_buf()),
        "mtime": mtime,
        "size": st.len(),
        "scale": format!("{scale:.4}"),
        "alpha_thr": alpha_threshold,
    });
    let src = src.to_path_buf();
    renderer
        .cache
        .get_or_create(&key, "overlay_scaled", "png", |out| async move {
            let mut vf = format!("format=rgba,scale=iw*{scale}:ih*{scale}:flags=lanczos");
            if let Some(thr) = alpha_threshold {
                vf.push_str(&format!(
                    ",geq=r='r(X\\,Y)':g='g(X\\,Y)':b='b(X\\,Y)':a='if(gte(alpha(X\\,Y)\\,{thr})\\,255\\,0)'"
                ));
            }
            let args: Vec<String> = vec![
                "ffmpeg".into(),
                "-y".into(),
                "-i".into(),
                src.display().to_string(),
                "-vf".into(),
                vf,
                "-frames:v".into(),
                "1".into(),
                out.display().to_string(),
            ];
            run_ffmpeg(&args).await?;
            Ok(out)
        })
        .await
}

fn alpha_threshold_from_env(var: &str) -> Option<u32> {
    if std::env::var("DISABLE_ALPHA_HARD_THRESHOLD").as_deref() == Ok("1") {
        return None;
    }
    match std::env::var(var) {
        Ok(v) => v.parse().ok().or(Some(128)),
        Err(_) => Some(128),
    }
}

/// One prepared character input: its ffmpeg input index and the scale still
/// to apply in the graph (1.0 when a pre-scaled variant was substituted).
#[derive(Debug)]
pub struct CharacterInput {
    pub config_index: usize,
    pub ffmpeg_index: usize,
    pub effective_scale: f64,
    pub image_path: PathBuf,
}

/// Placement data face overlays anchor to.
#[derive(Debug, Clone)]
pub struct CharacterPlacement {
    pub x_expr: String,
    pub y_expr: String,
    pub x_num: i64,
    pub y_num: i64,
    pub enter_effect: String,
    pub enter_duration: f64,
    pub fade: String,
    pub scale_orig: f64,
    pub expression: String,
    pub dynamic_position: bool,
}

/// Register inputs for all visible characters. Pre-scales non-unit-scale
/// images through the overlay cache unless `CHAR_CACHE_DISABLE=1`.
pub async fn collect_character_inputs(
    renderer: &VideoRenderer,
    characters: &[CharacterConfig],
    graph: &mut FilterGraph,
) -> RenderResult<Vec<CharacterInput>> {
    let mut inputs = Vec::new();
    let use_cache = std::env::var("CHAR_CACHE_DISABLE").as_deref() != Ok("1");

    for (i, ch) in characters.iter().enumerate() {
        if !ch.visible {
            continue;
        }
        let Some(image_path) = resolve_character_image(&ch.name, &ch.expression) else {
            warn!(
                "character image not found for {}/{} (and default); skipping",
                ch.name, ch.expression
            );
            continue;
        };

        let (path, effective_scale) = if use_cache && (ch.scale - 1.0).abs() > 1e-6 {
            match scaled_overlay(
                renderer,
                &image_path,
                ch.scale,
                alpha_threshold_from_env("CHAR_ALPHA_THRESHOLD"),
            )
            .await
            {
                Ok(cached) => (cached, 1.0),
                Err(e) => {
                    debug!("pre-scaled overlay failed ({e}); scaling in-graph");
                    (image_path.clone(), ch.scale)
                }
            }
        } else {
            (image_path.clone(), ch.scale)
        };

        let ffmpeg_index = graph.add_input(["-loop", "1", "-i", &path.display().to_string()]);
        inputs.push(CharacterInput {
            config_index: i,
            ffmpeg_index,
            effective_scale,
            image_path,
        });
    }
    Ok(inputs)
}

fn normalize_effect_name(raw: Option<&String>) -> String {
    raw.map(|s| s.to_lowercase()).unwrap_or_default()
}

fn escape_commas(expr: &str) -> String {
    expr.replace(',', "\\,")
}

/// Build overlay filter stages for the visible characters and return the
/// placement map used by face animation.
#[allow(clippy::too_many_arguments)]
pub fn build_character_overlays(
    renderer: &VideoRenderer,
    characters: &[CharacterConfig],
    inputs: &[CharacterInput],
    duration: f64,
    graph: &mut FilterGraph,
    overlay_streams: &mut Vec<String>,
    overlay_filters: &mut Vec<String>,
    use_cuda: bool,
    use_opencl: bool,
) -> HashMap<String, CharacterPlacement> {
    let mut placements = HashMap::new();

    for input in inputs {
        let ch = &characters[input.config_index];
        let i = input.config_index;
        let scale = input.effective_scale;

        let (x_base, y_base) = overlay_position_exprs(
            "W",
            "H",
            "w",
            "h",
            ch.anchor,
            &ch.position.x.as_expr(),
            &ch.position.y.as_expr(),
        );

        let enter = normalize_effect_name(ch.enter.as_ref());
        let leave = normalize_effect_name(ch.leave.as_ref());
        let enter_duration = ch.enter_duration.max(0.0);
        let leave_duration = ch.leave_duration.max(0.0);
        let leave_start = (duration - leave_duration).max(0.0);

        let mut fade = String::new();
        if enter == "fade" {
            fade.push_str(&format!(",fade=t=in:st=0:d={enter_duration}:alpha=1"));
        }
        if leave == "fade" {
            fade.push_str(&format!(
                ",fade=t=out:st={leave_start}:d={leave_duration}:alpha=1"
            ));
        }

        let mut x_expr = x_base.clone();
        let mut y_expr = y_base.clone();
        let mut dynamic = false;

        match enter.as_str() {
            "slide_left" => {
                x_expr = format!(
                    "if(lt(t,{enter_duration}), -w+({x_base}+w)*t/{enter_duration}, {x_expr})"
                );
                dynamic = true;
            }
            "slide_right" => {
                x_expr = format!(
                    "if(lt(t,{enter_duration}), W+({x_base}-W)*t/{enter_duration}, {x_expr})"
                );
                dynamic = true;
            }
            "slide_top" => {
                y_expr = format!(
                    "if(lt(t,{enter_duration}), -h+({y_base}+h)*t/{enter_duration}, {y_expr})"
                );
                dynamic = true;
            }
            "slide_bottom" => {
                y_expr = format!(
                    "if(lt(t,{enter_duration}), H+({y_base}-H)*t/{enter_duration}, {y_expr})"
                );
                dynamic = true;
            }
            _ => {}
        }

        match leave.as_str() {
            "slide_left" => {
                x_expr = format!(
                    "if(gt(t,{leave_start}), {x_base} + (-w-{x_base})*(t-{leave_start})/{leave_duration}, {x_expr})"
                );
                dynamic = true;
            }
            "slide_right" => {
                x_expr = format!(
                    "if(gt(t,{leave_start}), {x_base} + (W-{x_base})*(t-{leave_start})/{leave_duration}, {x_expr})"
                );
                dynamic = true;
            }
            "slide_top" => {
                y_expr = format!(
                    "if(gt(t,{leave_start}), {y_base} + (-h-{y_base})*(t-{leave_start})/{leave_duration}, {y_expr})"
                );
                dynamic = true;
            }
            "slide_bottom" => {
                y_expr = format!(
                    "if(gt(t,{leave_start}), {y_base} + (H-{y_base})*(t-{leave_start})/{leave_duration}, {y_expr})"
                );
                dynamic = true;
            }
            _ => {}
        }

        if let Some(effect) = resolve_character_effects(&ch.effects, &x_expr, &y_expr, duration) {
            if !effect.filter_chain.is_empty() {
                graph.add_chain(effect.filter_chain.join(";"));
            }
            if let Some(x) = effect.x_expr {
                x_expr = x;
            }
            if let Some(y) = effect.y_expr {
                y_expr = y;
            }
            dynamic = dynamic || effect.dynamic;
        }

        let x_expr = escape_commas(&x_expr);
        let y_expr = escape_commas(&y_expr);
        let ffmpeg_index = input.ffmpeg_index;

        if use_cuda {
            graph.add_chain(format!(
                "[{ffmpeg_index}:v]format=rgba{fade},hwupload_cuda,{}=iw*{scale}:ih*{scale}[char_scaled_{i}]",
                renderer.scale_filter
            ));
            overlay_streams.push(format!("[char_scaled_{i}]"));
            overlay_filters.push(format!("overlay_cuda=x={x_expr}:y={y_expr}"));
        } else if use_opencl {
            graph.add_chain(format!(
                "[{ffmpeg_index}:v]scale=iw*{scale}:ih*{scale},format=rgba{fade},hwupload[char_gpu_{i}]"
            ));
            overlay_streams.push(format!("[char_gpu_{i}]"));
            overlay_filters.push(format!("overlay_opencl=x={x_expr}:y={y_expr}"));
        } else if (scale - 1.0).abs() < 1e-6 {
            graph.add_chain(format!(
                "[{ffmpeg_index}:v]format=rgba{fade}[char_scaled_{i}]"
            ));
            overlay_streams.push(format!("[char_scaled_{i}]"));
            overlay_filters.push(format!("overlay=x={x_expr}:y={y_expr}"));
        } else {
            graph.add_chain(format!(
                "[{ffmpeg_index}:v]scale=iw*{scale}:ih*{scale}:flags={},format=rgba{fade}[char_scaled_{i}]",
                renderer.scale_flags
            ));
            overlay_streams.push(format!("[char_scaled_{i}]"));
            overlay_filters.push(format!("overlay=x={x_expr}:y={y_expr}"));
        }

        // Numeric placement of the base at rest, for face overlay anchoring.
        let (img_w, img_h) = png_dimensions(&input.image_path).unwrap_or((0, 0));
        let (x_num, y_num) = overlay_position_numeric(
            renderer.video_params.width as f64,
            renderer.video_params.height as f64,
            img_w as f64 * ch.scale,
            img_h as f64 * ch.scale,
            ch.anchor,
            ch.position.x.as_f64().unwrap_or(0.0),
            ch.position.y.as_f64().unwrap_or(0.0),
        );

        placements.insert(
            ch.name.clone(),
            CharacterPlacement {
                x_expr,
                y_expr,
                x_num,
                y_num,
                enter_effect: enter,
                enter_duration,
                fade,
                scale_orig: ch.scale,
                expression: ch.expression.clone(),
                dynamic_position: dynamic,
            },
        );
    }

    placements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CharacterConfig, Coord, Position};
    use crate::ffmpeg::layout::Anchor;

    fn character(name: &str) -> CharacterConfig {
        CharacterConfig {
            name: name.into(),
            expression: "default".into(),
            visible: true,
            scale: 1.0,
            anchor: Anchor::BottomCenter,
            position: Position {
                x: Coord::Num(0.0),
                y: Coord::Num(0.0),
            },
            enter: None,
            leave: None,
            enter_duration: 0.3,
            leave_duration: 0.3,
            effects: vec![],
        }
    }

    #[test]
    fn test_png_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.png");
        // Minimal PNG header with a 64x128 IHDR (checksum not validated here).
        let mut data = Vec::new();
        data.extend_from_slice(b"\x89PNG\r\n\x1a\n");
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&64u32.to_be_bytes());
        data.extend_from_slice(&128u32.to_be_bytes());
        std::fs::write(&path, data).unwrap();
        assert_eq!(png_dimensions(&path), Some((64, 128)));
    }

    #[test]
    fn test_png_dimensions_rejects_other_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        std::fs::write(&path, b"hello this is not a png file").unwrap();
        assert_eq!(png_dimensions(&path), None);
    }

    #[test]
    fn test_resolve_character_image_missing() {
        assert!(resolve_character_image("no_such_character", "default").is_none());
    }

    #[test]
    fn test_slide_enter_expression_shape() {
        // The slide expressions are pure string math; verify via a minimal
        // character passed through the builder using a head-less renderer is
        // covered by clip tests. Here pin the piecewise form itself.
        let ch = {
            let mut c = character("zundamon");
            c.enter = Some("slide_left".into());
            c.enter_duration = 0.4;
            c
        };
        let (x_base, _) = overlay_position_exprs(
            "W",
            "H",
            "w",
            "h",
            ch.anchor,
            &ch.position.x.as_expr(),
            &ch.position.y.as_expr(),
        );
        let expr = format!(
            "if(lt(t,{0}), -w+({x_base}+w)*t/{0}, {x_base})",
            ch.enter_duration
        );
        assert_eq!(expr, "if(lt(t,0.4), -w+((W-w)/2+w)*t/0.4, (W-w)/2)");
    }
}
