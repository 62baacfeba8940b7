use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use serde_json::json;
use tracing::{debug, warn};

use super::{LineData, LineDataMap, LineKind};
use crate::cache::CacheManager;
use crate::config::{Config, Line, Scene, TalkLine};
use crate::error::{RenderError, RenderResult};
use crate::face_anim::{
    blink_seed, compute_mouth_timeline, generate_blink_timeline, FaceAnim, FaceAnimMeta, MouthSeg,
};
use crate::ffmpeg::audio::{create_silent_audio, mix_audio_tracks, AudioTrack};
use crate::ffmpeg::params::AudioParams;
use crate::ffmpeg::probe::media_duration;
use crate::text::{is_effective_subtitle_text, normalize_subtitle_text, parse_reading_markup};
use crate::timeline::Timeline;
use crate::tts::TtsClient;

/// Phase 1: synthesize speech for every line, mix layers and sound effects,
/// measure durations, and plan face animation. Scenes and lines run
/// sequentially; the TTS engine serializes requests anyway.
pub struct AudioPhase {
    config: Arc<Config>,
    temp_dir: PathBuf,
    cache: Arc<CacheManager>,
    tts: TtsClient,
    audio_params: AudioParams,
    used_voices: Vec<(u32, String)>,
}

impl AudioPhase {
    pub fn new(
        config: Arc<Config>,
        temp_dir: PathBuf,
        cache: Arc<CacheManager>,
        tts: TtsClient,
    ) -> Self {
        let audio_params = AudioParams {
            sample_rate: config.video.audio_sample_rate,
            channels: config.video.audio_channels,
            codec: config.video.audio_codec.clone(),
            bitrate_kbps: config.video.audio_bitrate_kbps,
        };
        Self {
            config,
            temp_dir,
            cache,
            tts,
            audio_params,
            used_voices: Vec::new(),
        }
    }

    pub fn used_voices(&self) -> &[(u32, String)] {
        &self.used_voices
    }

    pub async fn run(&mut self, timeline: &mut Timeline) -> RenderResult<LineDataMap> {
        let mut line_data_map = LineDataMap::new();
        let config = self.config.clone();

        for scene in &config.scenes {
            let bg = config.scene_background(scene)?;
            timeline.add_scene_change(&scene.id, &bg.display().to_string());

            for (index, line) in scene.lines.iter().enumerate() {
                let line_id = scene.line_id(index);
                match line {
                    Line::Wait(wait) => {
                        timeline.add_event(
                            format!("(Wait {}s)", wait.duration),
                            wait.duration,
                            None,
                        );
                        line_data_map.insert(
                            line_id,
                            LineData {
                                kind: LineKind::Wait,
                                audio_path: None,
                                duration: wait.duration,
                                pre_duration: 0.0,
                                post_duration: 0.0,
                                text: None,
                                tts_text: None,
                                line_index: index,
                                face_anim: None,
                            },
                        );
                    }
                    Line::Talk(talk) => {
                        let data = self
                            .process_talk_line(scene, talk, index, &line_id, timeline)
                            .await?;
                        line_data_map.insert(line_id, data);
                    }
                }
            }
        }

        Ok(line_data_map)
    }

    async fn process_talk_line(
        &mut self,
        scene: &Scene,
        talk: &TalkLine,
        index: usize,
        line_id: &str,
        timeline: &mut Timeline,
    ) -> RenderResult<LineData> {
        let reading_display = self.config.subtitle.reading_display;

        // Split display text (subtitle) from TTS text. An explicit reading
        // overrides the markup-derived reading; an explicit subtitle_text
        // overrides the markup-derived display.
        let (disp_from_markup, tts_from_markup) =
            parse_reading_markup(&talk.text, reading_display);
        let tts_text = talk
            .reading
            .clone()
            .unwrap_or(tts_from_markup);
        let display_text = talk
            .subtitle_text
            .clone()
            .unwrap_or(disp_from_markup);
        let display_text = normalize_subtitle_text(&display_text);
        let effective_text = is_effective_subtitle_text(Some(&display_text))
            .then(|| display_text.trim().to_string());

        eprintln!(
            "  {} {line_id}: '{}'",
            "audio:".cyan(),
            preview(&display_text)
        );

        let audio_path = self.generate_line_audio(&tts_text, talk, line_id).await?;

        // Line duration: insert video wins, then explicit insert duration,
        // then the synthesized audio itself.
        let duration = if let Some(insert) = &talk.insert {
            if self.config.system.is_video_path(&insert.path) {
                media_duration(&insert.path).await?
            } else if let Some(d) = insert.duration {
                d
            } else {
                media_duration(&audio_path).await?
            }
        } else {
            media_duration(&audio_path).await?
        };

        let speaker_label = talk.speaker_name.clone().unwrap_or_else(|| "Unknown".into());
        timeline.add_event(
            format!("{speaker_label}: \"{display_text}\""),
            duration,
            effective_text.clone(),
        );

        let face_anim = self
            .plan_face_anim(scene, talk, line_id, &audio_path, duration)
            .await;

        Ok(LineData {
            kind: LineKind::Talk,
            audio_path: Some(audio_path),
            duration,
            pre_duration: 0.0,
            post_duration: 0.0,
            text: effective_text,
            tts_text: Some(tts_text),
            line_index: index,
            face_anim,
        })
    }

    /// Synthesize one line's speech track: a single voice, or layered voices
    /// plus sound effects mixed into one WAV.
    async fn generate_line_audio(
        &mut self,
        tts_text: &str,
        talk: &TalkLine,
        line_id: &str,
    ) -> RenderResult<PathBuf> {
        if !talk.voice_layers.is_empty() {
            return self.generate_layered_audio(tts_text, talk, line_id).await;
        }

        let mut tracks: Vec<AudioTrack> = Vec::new();
        let mut max_end = 0.0_f64;

        let speech_path = if tts_text.trim().is_empty() {
            // No speech: a silent base track long enough for the sound
            // effects, never zero-length.
            let mut required = 0.0_f64;
            for se in &talk.sound_effects {
                let d = media_duration(&se.path).await?;
                required = required.max(se.start_time + d);
            }
            let silent = self.temp_dir.join(format!("{line_id}_speech.wav"));
            create_silent_audio(&silent, required.max(0.001), &self.audio_params).await?;
            silent
        } else {
            self.synthesize_cached(tts_text, talk.speaker_id, talk.speed, talk.pitch, line_id)
                .await?
        };

        if talk.sound_effects.is_empty() {
            return Ok(speech_path);
        }

        let speech_duration = media_duration(&speech_path).await?;
        tracks.push((speech_path.display().to_string(), 0.0, 1.0));
        max_end = max_end.max(speech_duration);
        for se in &talk.sound_effects {
            let d = media_duration(&se.path).await?;
            tracks.push((se.path.display().to_string(), se.start_time, se.volume));
            max_end = max_end.max(se.start_time + d);
        }

        let mixed = self.temp_dir.join(format!("{line_id}_mixed.wav"));
        mix_audio_tracks(&tracks, &mixed, max_end.max(0.001), &self.audio_params).await?;
        Ok(mixed)
    }

    /// Layered synthesis: each layer speaks its own text at its own offset
    /// and volume, mixed together with the line's sound effects.
    async fn generate_layered_audio(
        &mut self,
        base_text: &str,
        talk: &TalkLine,
        line_id: &str,
    ) -> RenderResult<PathBuf> {
        let mut tracks: Vec<AudioTrack> = Vec::new();
        let mut max_end = 0.0_f64;

        for (i, layer) in talk.voice_layers.iter().enumerate() {
            let layer_text = layer
                .reading
                .clone()
                .or_else(|| layer.text.clone())
                .unwrap_or_else(|| base_text.to_string());
            if layer_text.trim().is_empty() {
                continue;
            }
            let speaker = layer.speaker_id.or(talk.speaker_id);
            let speed = layer.speed.or(talk.speed);
            let pitch = layer.pitch.or(talk.pitch);
            let layer_path = self
                .synthesize_cached(
                    &layer_text,
                    speaker,
                    speed,
                    pitch,
                    &format!("{line_id}_voice{}", i + 1),
                )
                .await?;
            let d = media_duration(&layer_path).await?;
            tracks.push((layer_path.display().to_string(), layer.start_time, layer.volume));
            max_end = max_end.max(layer.start_time + d);
        }

        for se in &talk.sound_effects {
            let d = media_duration(&se.path).await?;
            tracks.push((se.path.display().to_string(), se.start_time, se.volume));
            max_end = max_end.max(se.start_time + d);
        }

        if tracks.is_empty() {
            let silent = self.temp_dir.join(format!("{line_id}_speech.wav"));
            create_silent_audio(&silent, 0.001, &self.audio_params).await?;
            return Ok(silent);
        }

        let mixed = self.temp_dir.join(format!("{line_id}_mixed.wav"));
        mix_audio_tracks(&tracks, &mixed, max_end.max(0.001), &self.audio_params).await?;
        Ok(mixed)
    }

    /// Synthesize once per distinct (text, speaker, speed, pitch, engine,
    /// audio params) combination; later runs hit the cache.
    async fn synthesize_cached(
        &mut self,
        text: &str,
        speaker: Option<u32>,
        speed: Option<f64>,
        pitch: Option<f64>,
        name: &str,
    ) -> RenderResult<PathBuf> {
        let speaker = speaker.ok_or_else(|| {
            RenderError::Validation(format!(
                "speaker id not found for line '{}'; set voice.speaker or defaults.speaker_id",
                preview(text)
            ))
        })?;
        let speed = speed.unwrap_or(1.0);
        let pitch = pitch.unwrap_or(0.0);

        let key = json!({
            "op": "tts",
            "text": text,
            "speaker": speaker,
            "speed": speed,
            "pitch": pitch,
            "tts_url": self.tts.base_url(),
            "audio_params": self.audio_params,
        });
        let tts = self.tts.clone();
        let text_owned = text.to_string();
        let path = self
            .cache
            .get_or_create(&key, &format!("{name}_speech"), "wav", |out| async move {
                tts.synthesize(&text_owned, speaker, speed, pitch, &out)
                    .await?;
                Ok(out)
            })
            .await?;
        self.used_voices.push((speaker, text.to_string()));
        Ok(path)
    }

    /// Mouth timeline from the speech audio (cached by content) plus a
    /// deterministic blink schedule seeded by the line id.
    async fn plan_face_anim(
        &self,
        _scene: &Scene,
        talk: &TalkLine,
        line_id: &str,
        audio_path: &Path,
        duration: f64,
    ) -> Option<FaceAnim> {
        let anim_cfg = &self.config.video.face_anim;
        let target_name = talk
            .speaker_name
            .clone()
            .or_else(|| {
                talk.characters
                    .iter()
                    .find(|c| c.visible && !c.name.is_empty())
                    .map(|c| c.name.clone())
            })?;

        let mouth = match self.cached_mouth_timeline(audio_path, anim_cfg).await {
            Ok(segments) => segments,
            Err(e) => {
                warn!("face animation planning failed for {line_id}: {e}");
                return None;
            }
        };

        let eyes = generate_blink_timeline(
            duration,
            self.config.video.fps,
            anim_cfg.blink_min_interval,
            anim_cfg.blink_max_interval,
            anim_cfg.blink_close_frames,
            blink_seed(line_id),
        );

        Some(FaceAnim {
            target_name,
            mouth,
            eyes,
            meta: FaceAnimMeta {
                mouth_fps: anim_cfg.mouth_fps,
                thr_half: anim_cfg.mouth_thr_half,
                thr_open: anim_cfg.mouth_thr_open,
                blink_min_interval: anim_cfg.blink_min_interval,
                blink_max_interval: anim_cfg.blink_max_interval,
                blink_close_frames: anim_cfg.blink_close_frames,
            },
        })
    }

    async fn cached_mouth_timeline(
        &self,
        audio_path: &Path,
        anim_cfg: &crate::config::FaceAnimConfig,
    ) -> RenderResult<Vec<MouthSeg>> {
        let st = std::fs::metadata(audio_path)?;
        let mtime = st
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let key = json!({
            "op": "mouth_timeline",
            "audio_path": audio_path.canonicalize().unwrap_or_else(|_| audio_path.to_path_buf()),
            "size": st.len(),
            "mtime": mtime,
            "fps": anim_cfg.mouth_fps,
            "thr_half": anim_cfg.mouth_thr_half,
            "thr_open": anim_cfg.mouth_thr_open,
        });

        let audio = audio_path.to_path_buf();
        let fps = anim_cfg.mouth_fps;
        let thr_half = anim_cfg.mouth_thr_half;
        let thr_open = anim_cfg.mouth_thr_open;
        let json_path = self
            .cache
            .get_or_create(&key, "face_mouth", "json", |out| async move {
                let segments = compute_mouth_timeline(&audio, fps, thr_half, thr_open)?;
                let encoded = serde_json::to_string(&segments)
                    .map_err(|e| RenderError::Other(format!("mouth timeline encode: {e}")))?;
                std::fs::write(&out, encoded)?;
                Ok(out)
            })
            .await?;

        let raw = std::fs::read_to_string(&json_path)?;
        match serde_json::from_str(&raw) {
            Ok(segments) => Ok(segments),
            Err(e) => {
                // A corrupt cache entry falls back to an inline computation.
                debug!("mouth timeline cache unreadable ({e}); recomputing");
                compute_mouth_timeline(
                    audio_path,
                    anim_cfg.mouth_fps,
                    anim_cfg.mouth_thr_half,
                    anim_cfg.mouth_thr_open,
                )
            }
        }
    }
}

fn preview(text: &str) -> String {
    let short: String = text.chars().take(30).collect();
    if text.chars().count() > 30 {
        format!("{short}...")
    } else {
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    #[test]
    fn test_reading_split_precedence() {
        // explicit reading wins over markup for TTS; explicit subtitle_text
        // wins for display
        let raw = r#"
background:
  default: bg.png
defaults:
  speaker_id: 1
scenes:
  - id: s1
    lines:
      - text: "[本文|ほんぶん]"
        reading: "べつのよみ"
        subtitle_text: "表示テキスト"
"#;
        let config = load_config_str(raw).unwrap();
        let talk = config.scenes[0].lines[0].as_talk().unwrap();

        let (disp, tts) =
            parse_reading_markup(&talk.text, config.subtitle.reading_display);
        assert_eq!(disp, "本文");
        assert_eq!(tts, "ほんぶん");
        let effective_tts = talk.reading.clone().unwrap_or(tts);
        let effective_disp = talk.subtitle_text.clone().unwrap_or(disp);
        assert_eq!(effective_tts, "べつのよみ");
        assert_eq!(effective_disp, "表示テキスト");
    }

    #[test]
    fn test_preview_truncates() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(50);
        assert_eq!(preview(&long).chars().count(), 33);
        assert!(preview(&long).ends_with("..."));
    }
}
