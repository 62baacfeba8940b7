use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::debug;

use crate::cache::CacheManager;
use crate::config::SubtitleConfig;
use crate::error::{RenderError, RenderResult};
use crate::ffmpeg::runner::run_ffmpeg;

/// A subtitle shown over a scene clip.
#[derive(Debug, Clone)]
pub struct SubtitleEvent {
    pub text: String,
    pub start: f64,
    pub duration: f64,
    pub style: SubtitleConfig,
}

/// Merge per-line overrides (a loose key table from the screenplay) onto the
/// global subtitle style.
pub fn resolve_style(
    global: &SubtitleConfig,
    overrides: Option<&BTreeMap<String, Value>>,
) -> SubtitleConfig {
    let mut style = global.clone();
    let Some(map) = overrides else {
        return style;
    };
    if let Some(v) = map.get("font").and_then(Value::as_str) {
        style.font = Some(v.to_string());
    }
    if let Some(v) = map.get("font_size").and_then(Value::as_u64) {
        style.font_size = v as u32;
    }
    if let Some(v) = map.get("font_color").and_then(Value::as_str) {
        style.font_color = v.to_string();
    }
    if let Some(v) = map.get("outline_color").and_then(Value::as_str) {
        style.outline_color = v.to_string();
    }
    if let Some(v) = map.get("anchor").and_then(Value::as_str) {
        if let Some(anchor) = crate::ffmpeg::layout::Anchor::parse(v) {
            style.anchor = anchor;
        }
    }
    if let Some(effects) = map.get("effects") {
        if let Ok(parsed) = serde_json::from_value(effects.clone()) {
            style.effects = parsed;
        }
    }
    style
}

/// Canonical cache key material for a rendered subtitle PNG.
pub fn style_key(text: &str, style: &SubtitleConfig) -> Value {
    json!({
        "op": "subtitle_png",
        "text": text,
        "font": style.font,
        "font_size": style.font_size,
        "font_color": style.font_color,
        "outline_color": style.outline_color,
    })
}

/// Rasterizes subtitle text to a transparent PNG. The pipeline only depends
/// on this interface; the default implementation drives ffmpeg drawtext.
pub trait SubtitleRasterizer: Send + Sync {
    fn render<'a>(
        &'a self,
        text: &'a str,
        style: &'a SubtitleConfig,
        cache: &'a CacheManager,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = RenderResult<PathBuf>> + Send + 'a>>;
}

/// Default rasterizer: transparent canvas + drawtext, one PNG per
/// `(text, style)` cache key.
pub struct DrawtextRasterizer;

impl SubtitleRasterizer for DrawtextRasterizer {
    fn render<'a>(
        &'a self,
        text: &'a str,
        style: &'a SubtitleConfig,
        cache: &'a CacheManager,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = RenderResult<PathBuf>> + Send + 'a>>
    {
        Box::pin(async move {
            let key = style_key(text, style);
            cache
                .get_or_create(&key, "subtitle", "png", |out| async move {
                    render_drawtext_png(text, style, &out).await?;
                    Ok(out)
                })
                .await
        })
    }
}

async fn render_drawtext_png(
    text: &str,
    style: &SubtitleConfig,
    output: &Path,
) -> RenderResult<()> {
    // Generous canvas; the overlay step positions the PNG, so exact fit is
    // not required, only transparency outside the glyphs.
    let lines: Vec<&str> = text.lines().collect();
    let canvas_h = (style.font_size as usize + 16) * lines.len().max(1) + 16;
    let escaped = escape_drawtext(text);
    let mut drawtext = format!(
        "drawtext=text='{escaped}':fontsize={}:fontcolor={}:bordercolor={}:borderw=3:x=(w-text_w)/2:y=(h-text_h)/2",
        style.font_size, style.font_color, style.outline_color
    );
    if let Some(font) = &style.font {
        drawtext.push_str(&format!(":font='{font}'"));
    }

    let args: Vec<String> = vec![
        "ffmpeg".into(),
        "-y".into(),
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        format!("color=c=black@0.0:s=1920x{canvas_h},format=rgba"),
        "-vf".into(),
        drawtext,
        "-frames:v".into(),
        "1".into(),
        output.display().to_string(),
    ];
    run_ffmpeg(&args).await?;
    debug!(path = %output.display(), "rendered subtitle PNG");
    Ok(())
}

/// Escape for a single-quoted drawtext value.
fn escape_drawtext(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('\'', "\\'")
        .replace(':', "\\:")
        .replace('%', "\\%")
}

// ---------------------------------------------------------------------------
// Subtitle file output
// ---------------------------------------------------------------------------

/// Write collected subtitle events as an SRT file.
pub fn write_srt(events: &[SubtitleEvent], output: &Path) -> RenderResult<()> {
    let mut out = String::new();
    for (i, event) in events.iter().enumerate() {
        out.push_str(&format!("{}\n", i + 1));
        out.push_str(&format!(
            "{} --> {}\n",
            format_srt_time(event.start),
            format_srt_time(event.start + event.duration),
        ));
        out.push_str(&event.text);
        out.push_str("\n\n");
    }
    std::fs::write(output, out).map_err(RenderError::Io)
}

/// Write collected subtitle events as an ASS file with a single default
/// style derived from the global config.
pub fn write_ass(events: &[SubtitleEvent], style: &SubtitleConfig, output: &Path) -> RenderResult<()> {
    let mut out = String::new();
    out.push_str("[Script Info]\nScriptType: v4.00+\nPlayResX: 1920\nPlayResY: 1080\n\n");
    out.push_str("[V4+ Styles]\n");
    out.push_str(
        "Format: Name, Fontname, Fontsize, PrimaryColour, OutlineColour, Bold, Alignment\n",
    );
    out.push_str(&format!(
        "Style: Default,{},{},&H00FFFFFF,&H00000000,0,2\n\n",
        style.font.as_deref().unwrap_or("Sans"),
        style.font_size
    ));
    out.push_str("[Events]\nFormat: Layer, Start, End, Style, Text\n");
    for event in events {
        let text = event.text.replace('\n', "\\N");
        out.push_str(&format!(
            "Dialogue: 0,{},{},Default,{}\n",
            format_ass_time(event.start),
            format_ass_time(event.start + event.duration),
            text
        ));
    }
    std::fs::write(output, out).map_err(RenderError::Io)
}

/// "HH:MM:SS,mmm"
fn format_srt_time(secs: f64) -> String {
    let total_ms = (secs * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    let s = total_s % 60;
    let total_m = total_s / 60;
    let m = total_m % 60;
    let h = total_m / 60;
    format!("{h:02}:{m:02}:{s:02},{ms:03}")
}

/// "H:MM:SS.cc" (centiseconds)
fn format_ass_time(secs: f64) -> String {
    let total_cs = (secs * 100.0).round() as u64;
    let cs = total_cs % 100;
    let total_s = total_cs / 100;
    let s = total_s % 60;
    let total_m = total_s / 60;
    let m = total_m % 60;
    let h = total_m / 60;
    format!("{h}:{m:02}:{s:02}.{cs:02}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    fn base_style() -> SubtitleConfig {
        let config = load_config_str(
            "background:\n  default: bg.png\nscenes: []\n",
        )
        .unwrap();
        config.subtitle
    }

    #[test]
    fn test_format_srt_time() {
        assert_eq!(format_srt_time(0.0), "00:00:00,000");
        assert_eq!(format_srt_time(65.5), "00:01:05,500");
        assert_eq!(format_srt_time(3661.123), "01:01:01,123");
    }

    #[test]
    fn test_format_ass_time() {
        assert_eq!(format_ass_time(0.0), "0:00:00.00");
        assert_eq!(format_ass_time(65.5), "0:01:05.50");
        assert_eq!(format_ass_time(3661.12), "1:01:01.12");
    }

    #[test]
    fn test_style_override_merge() {
        let global = base_style();
        let mut overrides = BTreeMap::new();
        overrides.insert("font_size".to_string(), json!(64));
        overrides.insert("font_color".to_string(), json!("yellow"));
        let style = resolve_style(&global, Some(&overrides));
        assert_eq!(style.font_size, 64);
        assert_eq!(style.font_color, "yellow");
        assert_eq!(style.outline_color, global.outline_color);
    }

    #[test]
    fn test_style_key_varies_on_text_and_size() {
        let style = base_style();
        let a = style_key("hello", &style);
        let b = style_key("goodbye", &style);
        assert_ne!(
            CacheManager::generate_hash(&a),
            CacheManager::generate_hash(&b)
        );
        let mut bigger = style.clone();
        bigger.font_size += 2;
        let c = style_key("hello", &bigger);
        assert_ne!(
            CacheManager::generate_hash(&a),
            CacheManager::generate_hash(&c)
        );
    }

    #[test]
    fn test_escape_drawtext() {
        assert_eq!(escape_drawtext("a:b"), "a\\:b");
        assert_eq!(escape_drawtext("it's"), "it\\'s");
        assert_eq!(escape_drawtext("100%"), "100\\%");
    }

    #[test]
    fn test_write_srt_and_ass() {
        let dir = tempfile::tempdir().unwrap();
        let events = vec![
            SubtitleEvent {
                text: "Hello".into(),
                start: 0.0,
                duration: 2.5,
                style: base_style(),
            },
            SubtitleEvent {
                text: "multi\nline".into(),
                start: 2.5,
                duration: 1.0,
                style: base_style(),
            },
        ];

        let srt_path = dir.path().join("out.srt");
        write_srt(&events, &srt_path).unwrap();
        let srt = std::fs::read_to_string(&srt_path).unwrap();
        assert!(srt.contains("1\n00:00:00,000 --> 00:00:02,500\nHello\n"));
        assert!(srt.contains("2\n00:00:02,500 --> 00:00:03,500\nmulti\nline\n"));

        let ass_path = dir.path().join("out.ass");
        write_ass(&events, &base_style(), &ass_path).unwrap();
        let ass = std::fs::read_to_string(&ass_path).unwrap();
        assert!(ass.contains("[Events]"));
        assert!(ass.contains("Dialogue: 0,0:00:00.00,0:00:02.50,Default,Hello"));
        assert!(ass.contains("multi\\Nline"));
    }
}
