use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{RenderError, RenderResult};

/// Mouth openness derived from speech loudness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouthState {
    Close,
    Half,
    Open,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouthSeg {
    pub start: f64,
    pub end: f64,
    pub state: MouthState,
}

/// A closed-eyes interval. Baseline is eyes open, so the schedule is sparse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlinkSeg {
    pub start: f64,
    pub end: f64,
}

/// Face animation plan for one line, attached to its `LineData`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceAnim {
    pub target_name: String,
    pub mouth: Vec<MouthSeg>,
    pub eyes: Vec<BlinkSeg>,
    pub meta: FaceAnimMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceAnimMeta {
    pub mouth_fps: u32,
    pub thr_half: f64,
    pub thr_open: f64,
    pub blink_min_interval: f64,
    pub blink_max_interval: f64,
    pub blink_close_frames: u32,
}

// ---------------------------------------------------------------------------
// WAV decoding
// ---------------------------------------------------------------------------

/// Decode a PCM WAV into mono samples in [-1, 1]. Supports 8/16/24/32-bit
/// PCM; multi-channel input is averaged per frame.
pub fn wav_to_mono_samples(path: &Path) -> RenderResult<(Vec<f64>, u32)> {
    let mut file = std::fs::File::open(path)?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    parse_wav(&data).map_err(|e| RenderError::Other(format!("{}: {e}", path.display())))
}

fn parse_wav(data: &[u8]) -> Result<(Vec<f64>, u32), String> {
    if data.len() < 12 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
        return Err("not a RIFF/WAVE file".into());
    }

    let mut channels: u32 = 0;
    let mut sample_rate: u32 = 0;
    let mut bits_per_sample: u32 = 0;
    let mut pcm: Option<&[u8]> = None;

    let mut pos = 12;
    while pos + 8 <= data.len() {
        let chunk_id = &data[pos..pos + 4];
        let chunk_size = u32::from_le_bytes(data[pos + 4..pos + 8].try_into().unwrap()) as usize;
        let body_start = pos + 8;
        let body_end = (body_start + chunk_size).min(data.len());
        match chunk_id {
            b"fmt " => {
                let body = &data[body_start..body_end];
                if body.len() < 16 {
                    return Err("truncated fmt chunk".into());
                }
                let format = u16::from_le_bytes(body[0..2].try_into().unwrap());
                if format != 1 && format != 0xFFFE {
                    return Err(format!("unsupported WAV format tag {format}"));
                }
                channels = u16::from_le_bytes(body[2..4].try_into().unwrap()) as u32;
                sample_rate = u32::from_le_bytes(body[4..8].try_into().unwrap());
                bits_per_sample = u16::from_le_bytes(body[14..16].try_into().unwrap()) as u32;
            }
            b"data" => {
                pcm = Some(&data[body_start..body_end]);
            }
            _ => {}
        }
        // Chunks are word-aligned.
        pos = body_start + chunk_size + (chunk_size & 1);
    }

    let pcm = pcm.ok_or("no data chunk")?;
    if channels == 0 || sample_rate == 0 {
        return Err("missing fmt chunk".into());
    }
    let bytes_per_sample = match bits_per_sample {
        8 => 1,
        16 => 2,
        24 => 3,
        32 => 4,
        other => return Err(format!("unsupported bit depth {other}")),
    };

    let frame_bytes = bytes_per_sample * channels as usize;
    let max_abs = match bits_per_sample {
        8 => 128.0,
        16 => 32768.0,
        24 => (1u32 << 23) as f64,
        _ => (1u64 << 31) as f64,
    };

    let mut samples = Vec::with_capacity(pcm.len() / frame_bytes);
    for frame in pcm.chunks_exact(frame_bytes) {
        let mut acc = 0.0_f64;
        for ch in 0..channels as usize {
            let s = &frame[ch * bytes_per_sample..(ch + 1) * bytes_per_sample];
            let value: f64 = match bits_per_sample {
                8 => (s[0] as i32 - 128) as f64,
                16 => i16::from_le_bytes(s.try_into().unwrap()) as f64,
                24 => {
                    let raw = (s[0] as i32) | ((s[1] as i32) << 8) | ((s[2] as i8 as i32) << 16);
                    raw as f64
                }
                _ => i32::from_le_bytes(s.try_into().unwrap()) as f64,
            };
            acc += value;
        }
        samples.push(acc / channels as f64 / max_abs);
    }
    Ok((samples, sample_rate))
}

// ---------------------------------------------------------------------------
// Mouth timeline
// ---------------------------------------------------------------------------

/// RMS-per-window mouth state timeline at `fps`. Thresholds are relative to
/// the loudest window; `thr_open` is raised above `thr_half` when needed.
pub fn compute_mouth_timeline(
    wav_path: &Path,
    fps: u32,
    thr_half_ratio: f64,
    thr_open_ratio: f64,
) -> RenderResult<Vec<MouthSeg>> {
    let thr_open_ratio = if thr_open_ratio <= thr_half_ratio {
        thr_half_ratio + 1e-6
    } else {
        thr_open_ratio
    };

    let (samples, sample_rate) = wav_to_mono_samples(wav_path)?;
    if sample_rate == 0 || fps == 0 {
        return Ok(vec![]);
    }
    if samples.is_empty() {
        return Ok(vec![MouthSeg {
            start: 0.0,
            end: 0.0,
            state: MouthState::Close,
        }]);
    }

    let win_frames = std::cmp::max(1, (sample_rate / fps) as usize);
    let n_windows = samples.len().div_ceil(win_frames);

    let mut rms_vals = Vec::with_capacity(n_windows);
    for i in 0..n_windows {
        let start = i * win_frames;
        let end = ((i + 1) * win_frames).min(samples.len());
        let window = &samples[start..end];
        let energy: f64 = window.iter().map(|v| v * v).sum();
        rms_vals.push((energy / window.len() as f64).sqrt());
    }

    let peak = rms_vals.iter().cloned().fold(0.0_f64, f64::max);
    let fps = fps as f64;
    if peak <= 1e-9 {
        return Ok(vec![MouthSeg {
            start: 0.0,
            end: n_windows as f64 / fps,
            state: MouthState::Close,
        }]);
    }

    let state_for = |rms: f64| -> MouthState {
        let ratio = rms / peak;
        if ratio >= thr_open_ratio {
            MouthState::Open
        } else if ratio >= thr_half_ratio {
            MouthState::Half
        } else {
            MouthState::Close
        }
    };

    let mut segments: Vec<MouthSeg> = Vec::new();
    let mut current: Option<(MouthState, f64)> = None;
    for (i, rms) in rms_vals.iter().enumerate() {
        let state = state_for(*rms);
        match current {
            None => current = Some((state, i as f64 / fps)),
            Some((cur_state, start)) if cur_state != state => {
                segments.push(MouthSeg {
                    start,
                    end: i as f64 / fps,
                    state: cur_state,
                });
                current = Some((state, i as f64 / fps));
            }
            Some(_) => {}
        }
    }
    if let Some((state, start)) = current {
        segments.push(MouthSeg {
            start,
            end: n_windows as f64 / fps,
            state,
        });
    }
    Ok(segments)
}

// ---------------------------------------------------------------------------
// Blink timeline
// ---------------------------------------------------------------------------

/// 32-bit seed from the first 8 hex chars of `md5(text)`.
pub fn blink_seed(text: &str) -> u32 {
    let digest = Md5::digest(text.as_bytes());
    u32::from_be_bytes(digest[0..4].try_into().unwrap())
}

/// Deterministic blink schedule: closed intervals at random gaps in
/// `[min_interval, max_interval]`, each `close_frames/fps` long, never past
/// `duration`. The same seed always yields the same schedule.
pub fn generate_blink_timeline(
    duration: f64,
    fps: u32,
    min_interval: f64,
    max_interval: f64,
    close_frames: u32,
    seed: u32,
) -> Vec<BlinkSeg> {
    if duration <= 0.0 {
        return vec![];
    }
    let mut rng = StdRng::seed_from_u64(seed as u64);
    let close_dur = close_frames.max(1) as f64 / fps.max(1) as f64;

    let mut segments = Vec::new();
    let mut t = 0.0;
    loop {
        let interval = if max_interval > min_interval {
            rng.gen_range(min_interval..max_interval)
        } else {
            min_interval
        };
        if interval <= 0.0 {
            break;
        }
        t += interval;
        if t >= duration {
            break;
        }
        segments.push(BlinkSeg {
            start: t,
            end: (t + close_dur).min(duration),
        });
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    /// Write a minimal 16-bit PCM WAV.
    fn write_wav(path: &Path, samples: &[f64], sample_rate: u32) {
        let mut data: Vec<u8> = Vec::new();
        let pcm: Vec<u8> = samples
            .iter()
            .flat_map(|s| {
                let v = (s.clamp(-1.0, 1.0) * 32767.0) as i16;
                v.to_le_bytes()
            })
            .collect();
        data.extend_from_slice(b"RIFF");
        data.extend_from_slice(&(36 + pcm.len() as u32).to_le_bytes());
        data.extend_from_slice(b"WAVE");
        data.extend_from_slice(b"fmt ");
        data.extend_from_slice(&16u32.to_le_bytes());
        data.extend_from_slice(&1u16.to_le_bytes()); // PCM
        data.extend_from_slice(&1u16.to_le_bytes()); // mono
        data.extend_from_slice(&sample_rate.to_le_bytes());
        data.extend_from_slice(&(sample_rate * 2).to_le_bytes());
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(b"data");
        data.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
        data.extend_from_slice(&pcm);
        std::fs::write(path, data).unwrap();
    }

    #[test]
    fn test_wav_roundtrip_mono16() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wav");
        let samples: Vec<f64> = (0..100).map(|i| (i as f64 / 100.0) * 0.5).collect();
        write_wav(&path, &samples, 16000);
        let (decoded, sr) = wav_to_mono_samples(&path).unwrap();
        assert_eq!(sr, 16000);
        assert_eq!(decoded.len(), 100);
        assert!((decoded[50] - samples[50]).abs() < 1e-3);
    }

    #[test]
    fn test_mouth_timeline_silence_then_tone() {
        // 2s @16kHz: first second silent, second second a 0.5-amplitude 200Hz sine.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wav");
        let sr = 16000u32;
        let mut samples = vec![0.0; sr as usize];
        samples.extend((0..sr).map(|i| 0.5 * (2.0 * PI * 200.0 * i as f64 / sr as f64).sin()));
        write_wav(&path, &samples, sr);

        let segs = compute_mouth_timeline(&path, 10, 0.2, 0.5).unwrap();
        assert_eq!(segs.len(), 2, "expected close then open: {segs:?}");
        assert_eq!(segs[0].state, MouthState::Close);
        assert!((segs[0].start).abs() < 1e-9);
        assert!((segs[0].end - 1.0).abs() <= 0.1 + 1e-9);
        assert_eq!(segs[1].state, MouthState::Open);
        assert!((segs[1].end - 2.0).abs() <= 0.1 + 1e-9);
    }

    #[test]
    fn test_mouth_timeline_all_silence_is_one_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wav");
        write_wav(&path, &vec![0.0; 16000], 16000);
        let segs = compute_mouth_timeline(&path, 15, 0.2, 0.5).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].state, MouthState::Close);
    }

    #[test]
    fn test_mouth_segments_cover_and_do_not_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wav");
        let sr = 8000u32;
        let samples: Vec<f64> = (0..sr * 3)
            .map(|i| {
                let t = i as f64 / sr as f64;
                (t.sin() * 0.8) * (2.0 * PI * 150.0 * t).sin()
            })
            .collect();
        write_wav(&path, &samples, sr);
        let fps = 12;
        let segs = compute_mouth_timeline(&path, fps, 0.2, 0.5).unwrap();
        assert!(!segs.is_empty());
        assert!((segs[0].start).abs() < 1e-9);
        for pair in segs.windows(2) {
            assert!((pair[0].end - pair[1].start).abs() < 1e-9, "gap in {pair:?}");
            assert_ne!(pair[0].state, pair[1].state);
        }
        let n_windows = (samples.len() as f64 / (sr / fps) as f64).ceil();
        let expected_end = n_windows / fps as f64;
        assert!((segs.last().unwrap().end - expected_end).abs() < 1e-9);
    }

    #[test]
    fn test_swapped_thresholds_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.wav");
        let sr = 8000u32;
        let samples: Vec<f64> = (0..sr)
            .map(|i| 0.9 * (2.0 * PI * 220.0 * i as f64 / sr as f64).sin())
            .collect();
        write_wav(&path, &samples, sr);
        // thr_open <= thr_half must not panic and still classifies loudest as open
        let segs = compute_mouth_timeline(&path, 10, 0.5, 0.2).unwrap();
        assert!(segs.iter().any(|s| s.state == MouthState::Open));
    }

    #[test]
    fn test_blink_determinism_and_seed_sensitivity() {
        let seed = blink_seed("s1_1");
        let a = generate_blink_timeline(10.0, 30, 2.0, 5.0, 2, seed);
        let b = generate_blink_timeline(10.0, 30, 2.0, 5.0, 2, seed);
        assert_eq!(a, b);
        assert!(!a.is_empty());

        let other = generate_blink_timeline(10.0, 30, 2.0, 5.0, 2, blink_seed("s1_2"));
        assert_ne!(a, other);
    }

    #[test]
    fn test_blink_segments_bounded_and_disjoint() {
        let segs = generate_blink_timeline(12.0, 30, 2.0, 5.0, 2, blink_seed("scene_3"));
        for seg in &segs {
            assert!(seg.start >= 0.0);
            assert!(seg.end <= 12.0);
            assert!((seg.end - seg.start) <= 2.0 / 30.0 + 1e-9);
        }
        for pair in segs.windows(2) {
            assert!(pair[0].end <= pair[1].start, "overlap in {pair:?}");
        }
    }

    #[test]
    fn test_blink_zero_duration_empty() {
        assert!(generate_blink_timeline(0.0, 30, 2.0, 5.0, 2, 1).is_empty());
    }

    #[test]
    fn test_blink_seed_is_md5_prefix() {
        // md5("s1_1") = 5a39... ; the seed is its first 4 bytes big-endian.
        let digest = Md5::digest(b"s1_1");
        let expected = u32::from_be_bytes(digest[0..4].try_into().unwrap());
        assert_eq!(blink_seed("s1_1"), expected);
    }
}
