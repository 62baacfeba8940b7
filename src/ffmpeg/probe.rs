use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::debug;

use super::runner::run_ffmpeg;
use crate::error::{RenderError, RenderResult};

/// First video stream of a media file.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub pix_fmt: String,
    pub fps: f64,
}

/// First audio stream of a media file.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioInfo {
    pub codec: String,
    pub sample_rate: u32,
    pub channels: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MediaInfo {
    pub video: Option<VideoInfo>,
    pub audio: Option<AudioInfo>,
}

type MemoKey = (String, i64, u64);

static INFO_MEMO: Mutex<Option<HashMap<MemoKey, MediaInfo>>> = Mutex::new(None);
static DURATION_MEMO: Mutex<Option<HashMap<MemoKey, f64>>> = Mutex::new(None);

fn memo_key(path: &Path) -> RenderResult<MemoKey> {
    let canon = path
        .canonicalize()
        .unwrap_or_else(|_| path.to_path_buf());
    let st = std::fs::metadata(path)?;
    let mtime = st
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok((canon.display().to_string(), mtime, st.len()))
}

#[derive(Deserialize)]
struct ProbeStreams {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    pix_fmt: Option<String>,
    r_frame_rate: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    format: ProbeFormatInner,
}

#[derive(Deserialize)]
struct ProbeFormatInner {
    duration: Option<String>,
}

fn parse_fps(r_frame_rate: &str) -> f64 {
    let mut parts = r_frame_rate.splitn(2, '/');
    let num: f64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    let den: f64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0.0);
    if den > 0.0 {
        num / den
    } else {
        0.0
    }
}

/// Stream metadata for a media file, memoized by `(abspath, mtime, size)`.
pub async fn media_info(path: &Path) -> RenderResult<MediaInfo> {
    let key = memo_key(path)?;
    if let Some(info) = INFO_MEMO
        .lock()
        .unwrap()
        .as_ref()
        .and_then(|m| m.get(&key).cloned())
    {
        return Ok(info);
    }

    let args: Vec<String> = vec![
        "ffprobe".into(),
        "-v".into(),
        "error".into(),
        "-show_streams".into(),
        "-of".into(),
        "json".into(),
        path.display().to_string(),
    ];
    let out = run_ffmpeg(&args).await?;
    let parsed: ProbeStreams = serde_json::from_str(&out.stdout)
        .map_err(|e| RenderError::Other(format!("ffprobe output parse failed for {}: {e}", path.display())))?;

    let mut info = MediaInfo::default();
    for s in parsed.streams {
        match s.codec_type.as_deref() {
            Some("video") if info.video.is_none() => {
                info.video = Some(VideoInfo {
                    codec: s.codec_name.unwrap_or_default(),
                    width: s.width.unwrap_or(0),
                    height: s.height.unwrap_or(0),
                    pix_fmt: s.pix_fmt.unwrap_or_default(),
                    fps: s.r_frame_rate.as_deref().map(parse_fps).unwrap_or(0.0),
                });
            }
            Some("audio") if info.audio.is_none() => {
                info.audio = Some(AudioInfo {
                    codec: s.codec_name.unwrap_or_default(),
                    sample_rate: s.sample_rate.and_then(|r| r.parse().ok()).unwrap_or(0),
                    channels: s.channels.unwrap_or(0),
                });
            }
            _ => {}
        }
    }

    INFO_MEMO
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .insert(key, info.clone());
    Ok(info)
}

/// Container duration in seconds, memoized by `(abspath, mtime, size)`.
pub async fn media_duration(path: &Path) -> RenderResult<f64> {
    let key = memo_key(path)?;
    if let Some(d) = DURATION_MEMO
        .lock()
        .unwrap()
        .as_ref()
        .and_then(|m| m.get(&key).copied())
    {
        return Ok(d);
    }

    let args: Vec<String> = vec![
        "ffprobe".into(),
        "-v".into(),
        "error".into(),
        "-show_entries".into(),
        "format=duration".into(),
        "-of".into(),
        "json".into(),
        path.display().to_string(),
    ];
    let out = run_ffmpeg(&args).await?;
    let parsed: ProbeFormat = serde_json::from_str(&out.stdout)
        .map_err(|e| RenderError::Other(format!("ffprobe duration parse failed for {}: {e}", path.display())))?;
    let duration = parsed
        .format
        .duration
        .as_deref()
        .and_then(|d| d.parse::<f64>().ok())
        .ok_or_else(|| {
            RenderError::Other(format!("no duration reported for {}", path.display()))
        })?;
    let duration = (duration * 100.0).round() / 100.0;

    debug!(path = %path.display(), duration, "probed media duration");
    DURATION_MEMO
        .lock()
        .unwrap()
        .get_or_insert_with(HashMap::new)
        .insert(key, duration);
    Ok(duration)
}

/// True when the file carries an audio stream.
pub async fn has_audio_stream(path: &Path) -> bool {
    media_info(path)
        .await
        .map(|i| i.audio.is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fps() {
        assert_eq!(parse_fps("30/1"), 30.0);
        assert_eq!(parse_fps("30000/1001"), 30000.0 / 1001.0);
        assert_eq!(parse_fps("0/0"), 0.0);
        assert_eq!(parse_fps("garbage"), 0.0);
    }

    #[test]
    fn test_probe_json_shapes() {
        let raw = r#"{"streams":[
            {"codec_type":"video","codec_name":"h264","width":1920,"height":1080,
             "pix_fmt":"yuv420p","r_frame_rate":"30/1"},
            {"codec_type":"audio","codec_name":"aac","sample_rate":"48000","channels":2}
        ]}"#;
        let parsed: ProbeStreams = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.streams.len(), 2);
        assert_eq!(parsed.streams[0].codec_name.as_deref(), Some("h264"));
        assert_eq!(parsed.streams[1].sample_rate.as_deref(), Some("48000"));
    }

    #[test]
    fn test_memo_key_requires_existing_file() {
        assert!(memo_key(Path::new("/definitely/not/here.mp4")).is_err());
    }
}
