use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use colored::Colorize;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{LineDataMap, LineKind};
use crate::cache::CacheManager;
use crate::config::{Config, InsertConfig, Line, Scene, TalkLine};
use crate::error::{RenderError, RenderResult};
use crate::ffmpeg::capabilities::{
    ffmpeg_version, hw_encoder_kind, hw_filter_mode, set_hw_filter_mode, HwEncoderKind,
    HwFilterMode,
};
use crate::ffmpeg::params::{AudioParams, VideoParams};
use crate::plugins::PluginRegistry;
use crate::render::characters::resolve_character_image;
use crate::render::clip::{render_clip, BackgroundSource, ClipSpec};
use crate::render::overlays::apply_scene_overlays;
use crate::render::{StaticOverlay, VideoRenderer};
use crate::subtitle::{resolve_style, DrawtextRasterizer, SubtitleEvent};
use crate::text::is_effective_subtitle_text;

/// Profiling sample from one rendered clip, feeding the auto-tune decision.
#[derive(Debug, Clone)]
struct ProfileSample {
    cpu_overlay: bool,
    elapsed: f64,
}

/// Persisted auto-tune outcome, reloaded on the next run as long as the
/// transcoder and hardware are unchanged.
#[derive(Debug, Serialize, Deserialize)]
struct AutotuneHint {
    decided_mode: String,
    clip_workers: usize,
    cpu_ratio: f64,
    avg_elapsed: f64,
    p90_elapsed: f64,
    ffmpeg: String,
    hw_kind: Option<String>,
}

/// Phase 2: plan and render every scene into one MP4 per scene.
pub struct VideoPhase {
    config: Arc<Config>,
    temp_dir: PathBuf,
    cache: Arc<CacheManager>,
    renderer: Arc<VideoRenderer>,
    profile_limit: usize,
    auto_tune_enabled: bool,
    samples: Vec<ProfileSample>,
    retuned: bool,
}

impl VideoPhase {
    pub async fn create(
        config: Arc<Config>,
        temp_dir: PathBuf,
        cache: Arc<CacheManager>,
        registry: Arc<PluginRegistry>,
        jobs: Option<String>,
    ) -> RenderResult<Self> {
        let hw_kind = hw_encoder_kind().await;

        let video_params = VideoParams {
            width: config.video.width,
            height: config.video.height,
            fps: config.video.fps,
            pix_fmt: config.video.pix_fmt.clone(),
            profile: config.video.profile.clone(),
            level: config.video.level.clone(),
            preset: config.video.preset.clone().unwrap_or_else(|| {
                if hw_kind == Some(HwEncoderKind::Nvenc) {
                    "p5".into()
                } else {
                    "veryfast".into()
                }
            }),
            bitrate_kbps: config.video.bitrate_kbps,
            crf: config.video.crf,
            cq: config.video.cq,
        };
        let audio_params = AudioParams {
            sample_rate: config.video.audio_sample_rate,
            channels: config.video.audio_channels,
            codec: config.video.audio_codec.clone(),
            bitrate_kbps: config.video.audio_bitrate_kbps,
        };

        load_autotune_hint(cache.cache_dir(), hw_kind).await;
        let clip_workers = determine_clip_workers(jobs.as_deref(), hw_kind);

        let renderer = Arc::new(
            VideoRenderer::create(
                config.clone(),
                temp_dir.clone(),
                cache.clone(),
                registry,
                Arc::new(DrawtextRasterizer),
                video_params,
                audio_params,
                hw_kind,
                jobs,
                clip_workers,
            )
            .await,
        );

        Ok(Self {
            profile_limit: config.video.profile_first_clips,
            auto_tune_enabled: config.video.auto_tune,
            config,
            temp_dir,
            cache,
            renderer,
            samples: Vec::new(),
            retuned: false,
        })
    }

    pub fn renderer(&self) -> Arc<VideoRenderer> {
        self.renderer.clone()
    }

    /// Render every scene in script order. Returns the per-scene MP4s.
    pub async fn run(&mut self, mut line_data_map: LineDataMap) -> RenderResult<Vec<PathBuf>> {
        info!(
            clip_workers = self.renderer.clip_workers(),
            hw = self.renderer.hw_kind.map(|k| k.as_str()).unwrap_or("none"),
            "video phase started"
        );
        let t0 = Instant::now();
        let config = self.config.clone();
        let mut scene_clips = Vec::new();

        for (scene_idx, scene) in config.scenes.iter().enumerate() {
            eprintln!(
                "  {} scene {}/{} '{}'",
                "video:".cyan(),
                scene_idx + 1,
                config.scenes.len(),
                scene.id
            );
            let clip = self.render_scene(scene, &mut line_data_map).await?;
            scene_clips.push(clip);
            self.maybe_retune().await;
        }

        info!(
            elapsed = ?t0.elapsed(),
            paths = %self.renderer.path_counters.summary(),
            "video phase completed"
        );
        Ok(scene_clips)
    }

    async fn render_scene(
        &mut self,
        scene: &Scene,
        line_data_map: &mut LineDataMap,
    ) -> RenderResult<PathBuf> {
        let scene_hash = self.scene_hash(scene);
        let scene_file = format!("scene_{}", scene.id);
        if let Some(cached) = self.cache.get_cached_path(&scene_hash, &scene_file, "mp4") {
            debug!(scene = %scene.id, "scene cache hit");
            return Ok(cached);
        }

        let bg_path = self.config.scene_background(scene)?;
        let bg_is_video = self.config.system.is_video_path(&bg_path);
        let base_layout = self.config.background_layout(scene, None);

        // Character enter/leave padding extends each talk line.
        for (idx, line) in scene.lines.iter().enumerate() {
            let Some(talk) = line.as_talk() else { continue };
            let data = line_data_map
                .get_mut(&scene.line_id(idx))
                .ok_or_else(|| {
                    RenderError::Pipeline(format!("missing line data for {}", scene.line_id(idx)))
                })?;
            let enter_pad = talk
                .characters
                .iter()
                .filter(|c| c.enter.is_some())
                .map(|c| c.enter_duration)
                .fold(0.0, f64::max);
            let leave_pad = talk
                .characters
                .iter()
                .filter(|c| c.leave.is_some())
                .map(|c| c.leave_duration)
                .fold(0.0, f64::max);
            data.pre_duration = enter_pad;
            data.post_duration = leave_pad;
            data.duration += enter_pad + leave_pad;
        }

        let durations: Vec<f64> = (0..scene.lines.len())
            .map(|idx| line_data_map[&scene.line_id(idx)].duration)
            .collect();
        let scene_duration: f64 = durations.iter().sum();
        let mut start_times = Vec::with_capacity(durations.len());
        let mut acc = 0.0;
        for d in &durations {
            start_times.push(acc);
            acc += d;
        }

        // --- Static overlay planning ----------------------------------------
        let talk_lines: Vec<&TalkLine> =
            scene.lines.iter().filter_map(Line::as_talk).collect();
        let char_maps: Vec<BTreeMap<CharKey, StaticOverlay>> =
            talk_lines.iter().map(|t| norm_char_entries(t)).collect();

        let mut static_char_keys: BTreeSet<CharKey> = BTreeSet::new();
        let mut static_overlays: Vec<StaticOverlay> = Vec::new();
        if let Some(first) = char_maps.first() {
            let mut common: BTreeSet<CharKey> = first.keys().cloned().collect();
            for map in &char_maps[1..] {
                common = common
                    .intersection(&map.keys().cloned().collect())
                    .cloned()
                    .collect();
            }
            for key in &common {
                static_overlays.push(first[key].clone());
            }
            static_char_keys = common;
        }

        // A single image insert shared by every talk line is baked into the
        // base; a shared insert video is only pre-normalized once.
        let mut static_insert_in_base = false;
        let mut scene_insert_video: Option<PathBuf> = None;
        if let Some(first_insert) = talk_lines.first().and_then(|t| t.insert.as_ref()) {
            let all_same = talk_lines
                .iter()
                .all(|t| t.insert.as_ref() == Some(first_insert));
            if all_same && first_insert.path.exists() {
                if self.config.system.is_image_path(&first_insert.path) {
                    static_overlays.push(insert_overlay(first_insert));
                    static_insert_in_base = true;
                } else if self.config.system.is_video_path(&first_insert.path) {
                    match self.renderer.normalize_media(&first_insert.path, None).await {
                        Ok(normalized) => scene_insert_video = Some(normalized),
                        Err(e) => warn!(
                            "failed to pre-normalize common insert video {}: {e}",
                            first_insert.path.display()
                        ),
                    }
                }
            }
        }

        // --- Scene base -----------------------------------------------------
        let min_lines = self.config.video.scene_base_min_lines;
        let total_lines = scene.lines.len();
        let should_generate_base = !static_overlays.is_empty()
            || (bg_is_video && total_lines >= min_lines)
            || (!bg_is_video && total_lines >= 2);

        let mut scene_base: Option<PathBuf> = None;
        let mut normalized_bg: Option<PathBuf> = None;
        if should_generate_base {
            match self
                .renderer
                .render_scene_base(
                    &bg_path,
                    bg_is_video,
                    &base_layout,
                    scene_duration,
                    &static_overlays,
                    &format!("scene_base_{}", scene.id),
                )
                .await
            {
                Ok(base) => {
                    info!(
                        scene = %scene.id,
                        overlays = static_overlays.len(),
                        "generated scene base"
                    );
                    scene_base = Some(base);
                }
                Err(e) => {
                    warn!("failed to generate scene base for '{}': {e}", scene.id);
                    if bg_is_video {
                        normalized_bg = self
                            .renderer
                            .normalize_media(&bg_path, Some(&base_layout))
                            .await
                            .ok();
                    }
                }
            }
        } else if bg_is_video {
            match self
                .renderer
                .normalize_media(&bg_path, Some(&base_layout))
                .await
            {
                Ok(normalized) => {
                    debug!(scene = %scene.id, "pre-normalized scene background");
                    normalized_bg = Some(normalized);
                }
                Err(e) => warn!(
                    "background pre-normalization failed for '{}' ({e}); using as-is",
                    scene.id
                ),
            }
        }

        // --- Run bases ------------------------------------------------------
        let mut run_bases: Vec<RunBase> = Vec::new();
        if scene_base.is_none() {
            run_bases = self
                .plan_run_bases(scene, &bg_path, bg_is_video, &base_layout, &durations)
                .await;
        }

        // --- Per-line jobs ---------------------------------------------------
        let mut jobs: Vec<LineJob> = Vec::new();
        for (idx, line) in scene.lines.iter().enumerate() {
            let line_id = scene.line_id(idx);
            let data = &line_data_map[&line_id];
            let start_time = start_times[idx];
            let talk = line.as_talk();
            let layout = self
                .config
                .background_layout(scene, talk.and_then(|t| t.background.as_ref()));

            let line_bg_override = talk
                .and_then(|t| t.background.as_ref())
                .and_then(|b| b.path.clone());
            let run_base = run_bases.iter().find(|rb| rb.contains(idx));

            let background = if let Some(override_path) = line_bg_override {
                let is_video = self.config.system.is_video_path(&override_path);
                BackgroundSource {
                    path: override_path,
                    is_video,
                    start_time: 0.0,
                    normalized: false,
                    pre_scaled: false,
                    layout: layout.clone(),
                }
            } else if let Some(base) = &scene_base {
                BackgroundSource {
                    path: base.clone(),
                    is_video: true,
                    start_time,
                    normalized: true,
                    pre_scaled: true,
                    layout: layout.clone(),
                }
            } else if let Some(rb) = run_base {
                BackgroundSource {
                    path: rb.path.clone(),
                    is_video: true,
                    start_time: rb.offset_of(idx),
                    normalized: true,
                    pre_scaled: true,
                    layout: layout.clone(),
                }
            } else if let Some(normalized) = &normalized_bg {
                BackgroundSource {
                    path: normalized.clone(),
                    is_video: true,
                    start_time,
                    normalized: true,
                    pre_scaled: true,
                    layout: layout.clone(),
                }
            } else {
                BackgroundSource {
                    path: bg_path.clone(),
                    is_video: bg_is_video,
                    start_time,
                    normalized: false,
                    pre_scaled: false,
                    layout: layout.clone(),
                }
            };

            match data.kind {
                LineKind::Wait => {
                    let cache_key = json!({
                        "type": "wait",
                        "duration": data.duration,
                        "bg": background.path.display().to_string(),
                        "is_bg_video": background.is_video,
                        "start_time": background.start_time,
                        "normalized": background.normalized,
                        "pre_scaled": background.pre_scaled,
                        "layout": layout_key(&background.layout),
                        "video_params": self.renderer.video_params,
                        "audio_params": self.renderer.audio_params,
                        "hw_kind": self.renderer.hw_kind.map(|k| k.as_str()),
                    });
                    jobs.push(LineJob {
                        index: data.line_index,
                        line_id,
                        cache_key,
                        spec: ClipSpec {
                            audio_path: None,
                            duration: data.duration,
                            audio_delay: 0.0,
                            background,
                            characters: vec![],
                            insert: None,
                            background_effects: vec![],
                            screen_effects: vec![],
                            face_anim: None,
                        },
                        fg_overlays: vec![],
                        subtitle: None,
                        cpu_overlay: false,
                    });
                }
                LineKind::Talk => {
                    let talk = talk.expect("talk line data for talk line");

                    // Strip overlays already baked into the base this line uses.
                    let strip_keys: BTreeSet<CharKey> = if scene_base.is_some() {
                        static_char_keys.clone()
                    } else if let Some(rb) = run_base {
                        rb.char_keys.clone()
                    } else {
                        BTreeSet::new()
                    };
                    let effective_characters: Vec<_> = talk
                        .characters
                        .iter()
                        .filter(|ch| {
                            if !ch.visible {
                                return true;
                            }
                            !strip_keys.contains(&char_key(ch))
                        })
                        .cloned()
                        .collect();

                    let insert_in_base = (scene_base.is_some() && static_insert_in_base)
                        || run_base.map(|rb| rb.has_insert_image).unwrap_or(false);
                    let mut effective_insert = if insert_in_base {
                        None
                    } else {
                        talk.insert.clone()
                    };
                    if let Some(insert) = &mut effective_insert {
                        if self.config.system.is_video_path(&insert.path) {
                            if let Some(shared) = &scene_insert_video {
                                insert.path = shared.clone();
                            } else if let Ok(normalized) =
                                self.renderer.normalize_media(&insert.path, None).await
                            {
                                insert.path = normalized;
                            }
                        }
                    }

                    let has_subtitle = is_effective_subtitle_text(data.text.as_deref());
                    let any_chars = talk.characters.iter().any(|c| c.visible);
                    let insert_is_image = talk
                        .insert
                        .as_ref()
                        .map(|i| self.config.system.is_image_path(&i.path))
                        .unwrap_or(false);

                    let face_meta = data.face_anim.as_ref().map(|f| f.meta.clone());
                    let cache_key = json!({
                        "type": "talk",
                        "audio_key": json!({
                            "tts_text": data.tts_text,
                            "line": talk,
                            "voice_config": self.config.voice,
                        }),
                        "duration": data.duration,
                        "bg": background.path.display().to_string(),
                        "is_bg_video": background.is_video,
                        "start_time": background.start_time,
                        "normalized": background.normalized,
                        "pre_scaled": background.pre_scaled,
                        "layout": layout_key(&background.layout),
                        "characters": effective_characters,
                        "insert": effective_insert,
                        "static_chars_in_base": !strip_keys.is_empty(),
                        "static_insert_in_base": insert_in_base,
                        "screen_effects": talk.screen_effects,
                        "background_effects": talk.background_effects,
                        "video_params": self.renderer.video_params,
                        "audio_params": self.renderer.audio_params,
                        "hw_kind": self.renderer.hw_kind.map(|k| k.as_str()),
                        "lip_eye_version": "v1",
                        "face_anim": face_meta,
                    });

                    let subtitle = (self.config.subtitle.enabled && has_subtitle).then(|| {
                        SubtitleEvent {
                            text: data.text.clone().unwrap_or_default(),
                            start: start_time,
                            duration: data.duration,
                            style: resolve_style(&self.config.subtitle, talk.subtitle.as_ref()),
                        }
                    });

                    jobs.push(LineJob {
                        index: data.line_index,
                        line_id,
                        cache_key,
                        spec: ClipSpec {
                            audio_path: data.audio_path.clone(),
                            duration: data.duration,
                            audio_delay: data.pre_duration,
                            background,
                            characters: effective_characters,
                            insert: effective_insert,
                            background_effects: talk.background_effects.clone(),
                            screen_effects: talk.screen_effects.clone(),
                            face_anim: data.face_anim.clone(),
                        },
                        fg_overlays: talk.fg_overlays.clone(),
                        subtitle,
                        cpu_overlay: has_subtitle || any_chars || insert_is_image,
                    });
                }
            }
        }

        // --- Render clips with bounded concurrency ---------------------------
        let renderer = self.renderer.clone();
        let cache = self.cache.clone();
        let temp_dir = self.temp_dir.clone();
        let clip_workers = self.renderer.clip_workers();
        let total = jobs.len();

        let mut subtitle_entries: Vec<SubtitleEvent> = Vec::new();
        let mut sample_pool: Vec<(bool, f64)> = Vec::new();
        for job in &jobs {
            if let Some(subtitle) = &job.subtitle {
                subtitle_entries.push(subtitle.clone());
            }
        }
        subtitle_entries.sort_by(|a, b| a.start.total_cmp(&b.start));

        let results: Vec<RenderResult<(usize, PathBuf, bool, f64)>> = stream::iter(jobs)
            .map(|job| {
                let renderer = renderer.clone();
                let cache = cache.clone();
                let temp_dir = temp_dir.clone();
                async move {
                    let t0 = Instant::now();
                    let spec = job.spec;
                    let renderer_for_clip = renderer.clone();
                    let clip = cache
                        .get_or_create(&job.cache_key, &job.line_id, "mp4", |out| {
                            let spec = spec.clone();
                            let renderer = renderer_for_clip;
                            async move { render_clip(&renderer, &spec, &out).await }
                        })
                        .await?;
                    let clip = if job.fg_overlays.is_empty() {
                        clip
                    } else {
                        let out = temp_dir.join(format!("{}_fg.mp4", job.line_id));
                        apply_scene_overlays(&renderer, &clip, &job.fg_overlays, &[], &out)
                            .await?
                    };
                    Ok((job.index, clip, job.cpu_overlay, t0.elapsed().as_secs_f64()))
                }
            })
            .buffer_unordered(clip_workers.max(1))
            .collect()
            .await;

        let mut clips: Vec<Option<PathBuf>> = vec![None; total];
        for result in results {
            let (index, path, cpu_overlay, elapsed) = result?;
            clips[index] = Some(path);
            sample_pool.push((cpu_overlay, elapsed));
        }
        for (cpu_overlay, elapsed) in sample_pool {
            if self.samples.len() < self.profile_limit {
                self.samples.push(ProfileSample {
                    cpu_overlay,
                    elapsed,
                });
            }
        }
        let ordered: Vec<PathBuf> = clips.into_iter().flatten().collect();
        if ordered.len() != total {
            return Err(RenderError::Pipeline(format!(
                "scene '{}' produced {}/{} clips",
                scene.id,
                ordered.len(),
                total
            )));
        }

        // --- Concat + scene-level overlays -----------------------------------
        let scene_output = self.temp_dir.join(format!("scene_output_{}.mp4", scene.id));
        self.renderer.concat_clips(&ordered, &scene_output).await?;
        info!(scene = %scene.id, "concatenated scene clips");

        let mut scene_final = scene_output.clone();
        if !scene.fg_overlays.is_empty() || !subtitle_entries.is_empty() {
            let overlaid = self
                .temp_dir
                .join(format!("scene_output_{}_over.mp4", scene.id));
            scene_final = apply_scene_overlays(
                &self.renderer,
                &scene_output,
                &scene.fg_overlays,
                &subtitle_entries,
                &overlaid,
            )
            .await?;
        }

        if let Some(bgm) = &scene.bgm {
            let with_bgm = self
                .temp_dir
                .join(format!("scene_output_{}_bgm.mp4", scene.id));
            crate::ffmpeg::audio::add_bgm_to_video(
                &scene_final,
                &bgm.path,
                &with_bgm,
                &self.renderer.audio_params,
                bgm.volume,
                bgm.start_time,
                bgm.fade_in,
                bgm.fade_out,
            )
            .await?;
            scene_final = with_bgm;
        }

        self.cache
            .save_to_cache(&scene_final, &scene_hash, &scene_file, "mp4")?;
        Ok(scene_final)
    }

    /// Detect maximal runs of adjacent talk lines sharing a non-empty static
    /// overlay signature and pre-render a base per run.
    async fn plan_run_bases(
        &self,
        scene: &Scene,
        bg_path: &Path,
        bg_is_video: bool,
        layout: &crate::config::BackgroundLayout,
        durations: &[f64],
    ) -> Vec<RunBase> {
        let signatures: Vec<Option<Signature>> = scene
            .lines
            .iter()
            .map(|line| {
                line.as_talk().map(|talk| {
                    let keys: BTreeSet<CharKey> =
                        norm_char_entries(talk).keys().cloned().collect();
                    let insert_sig = talk
                        .insert
                        .as_ref()
                        .filter(|i| self.config.system.is_image_path(&i.path) && i.path.exists())
                        .map(|i| format!("{}@{:.2}", i.path.display(), i.scale));
                    (keys, insert_sig)
                })
            })
            .collect();

        let mut run_bases = Vec::new();
        let pending: Vec<(usize, usize, Signature)> = detect_runs(&signatures)
            .into_iter()
            .map(|(start, end)| (start, end, signatures[start].clone().expect("run on talk")))
            .collect();

        for (start, end, sig) in pending {
            let talk = scene.lines[start].as_talk().expect("run starts on talk");
            let map = norm_char_entries(talk);
            let mut overlays: Vec<StaticOverlay> =
                sig.0.iter().filter_map(|k| map.get(k).cloned()).collect();
            let has_insert_image = sig.1.is_some();
            if has_insert_image {
                if let Some(insert) = &talk.insert {
                    overlays.push(insert_overlay(insert));
                }
            }
            let duration: f64 = durations[start..=end].iter().sum();
            match self
                .renderer
                .render_scene_base(
                    bg_path,
                    bg_is_video,
                    layout,
                    duration,
                    &overlays,
                    &format!("scene_base_{}_run_{}_{}", scene.id, start + 1, end + 1),
                )
                .await
            {
                Ok(path) => {
                    let mut offsets = Vec::with_capacity(end - start + 1);
                    let mut acc = 0.0;
                    for d in &durations[start..=end] {
                        offsets.push(acc);
                        acc += d;
                    }
                    info!(
                        scene = %scene.id,
                        lines = %format!("{}-{}", start + 1, end + 1),
                        "generated run base"
                    );
                    run_bases.push(RunBase {
                        start,
                        end,
                        path,
                        char_keys: sig.0.clone(),
                        has_insert_image,
                        offsets,
                    });
                }
                Err(e) => debug!("run base generation failed: {e}"),
            }
        }
        run_bases
    }

    fn scene_hash(&self, scene: &Scene) -> serde_json::Value {
        json!({
            "scene": scene,
            "voice_config": self.config.voice,
            "video_config": self.config.video,
            "subtitle_config": self.config.subtitle,
            "bgm_config": self.config.bgm,
            "background_default": self.config.background.default,
            "hw_kind": self.renderer.hw_kind.map(|k| k.as_str()),
            "video_params": self.renderer.video_params,
            "audio_params": self.renderer.audio_params,
        })
    }

    /// After enough profiled clips, decide the process-wide filter mode and
    /// concurrency, and persist the decision for the next run.
    async fn maybe_retune(&mut self) {
        if !self.auto_tune_enabled || self.retuned || self.samples.len() < self.profile_limit {
            return;
        }
        self.retuned = true;

        let cpu_count = self.samples.iter().filter(|s| s.cpu_overlay).count();
        let cpu_ratio = cpu_count as f64 / self.samples.len() as f64;
        let mut elapsed: Vec<f64> = self
            .samples
            .iter()
            .map(|s| s.elapsed)
            .filter(|v| *v > 0.0)
            .collect();
        elapsed.sort_by(f64::total_cmp);
        let avg_elapsed = elapsed.iter().sum::<f64>() / elapsed.len().max(1) as f64;
        let p90_elapsed = if elapsed.is_empty() {
            0.0
        } else {
            elapsed[(0.9 * (elapsed.len() - 1) as f64) as usize]
        };

        if cpu_ratio >= 0.5 {
            if std::env::var("FFMPEG_FILTER_THREADS_CAP").is_err() {
                std::env::set_var("FFMPEG_FILTER_THREADS_CAP", "2");
            }
            if std::env::var("FFMPEG_FILTER_COMPLEX_THREADS_CAP").is_err() {
                std::env::set_var("FFMPEG_FILTER_COMPLEX_THREADS_CAP", "2");
            }
            set_hw_filter_mode(HwFilterMode::Cpu);

            let nproc = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(8);
            let mut target = 2;
            if nproc >= 16 && cpu_ratio >= 0.8 {
                target = 4;
            } else if nproc >= 12 && cpu_ratio >= 0.6 {
                target = 3;
            }
            let target = target.min(nproc).max(1);
            let previous = self.renderer.clip_workers();
            self.renderer.set_clip_workers(target);
            info!(
                cpu_ratio,
                avg_elapsed,
                p90_elapsed,
                "auto-tune: forcing CPU filters, clip_workers {previous} -> {target}"
            );
        } else {
            info!(
                cpu_ratio,
                avg_elapsed, p90_elapsed, "auto-tune: keeping current concurrency"
            );
        }
        std::env::set_var("FFMPEG_PROFILE_MODE", "0");

        let hint = AutotuneHint {
            decided_mode: if cpu_ratio >= 0.5 { "cpu" } else { "auto" }.into(),
            clip_workers: self.renderer.clip_workers(),
            cpu_ratio,
            avg_elapsed,
            p90_elapsed,
            ffmpeg: ffmpeg_version().await,
            hw_kind: self.renderer.hw_kind.map(|k| k.as_str().to_string()),
        };
        let hint_path = self.cache.cache_dir().join("autotune_hint.json");
        match serde_json::to_string(&hint) {
            Ok(encoded) => {
                if let Err(e) = std::fs::write(&hint_path, encoded) {
                    warn!("failed to persist auto-tune hint: {e}");
                } else {
                    info!(path = %hint_path.display(), "saved auto-tune hint");
                }
            }
            Err(e) => warn!("failed to encode auto-tune hint: {e}"),
        }
    }
}

/// A pre-rendered base covering a run of adjacent lines.
#[derive(Debug)]
struct RunBase {
    start: usize,
    end: usize,
    path: PathBuf,
    char_keys: BTreeSet<CharKey>,
    has_insert_image: bool,
    offsets: Vec<f64>,
}

impl RunBase {
    fn contains(&self, idx: usize) -> bool {
        (self.start..=self.end).contains(&idx)
    }

    fn offset_of(&self, idx: usize) -> f64 {
        self.offsets.get(idx - self.start).copied().unwrap_or(0.0)
    }
}

struct LineJob {
    index: usize,
    line_id: String,
    cache_key: serde_json::Value,
    spec: ClipSpec,
    fg_overlays: Vec<crate::config::ForegroundOverlay>,
    subtitle: Option<SubtitleEvent>,
    cpu_overlay: bool,
}

/// Quantized identity of a statically-placed character overlay.
pub type CharKey = (String, String, String, String, String, String);

/// Static-overlay signature of one line: its character keys plus an optional
/// image-insert identity. `None` marks a wait line, which breaks any run.
type Signature = (BTreeSet<CharKey>, Option<String>);

/// Maximal runs of adjacent lines sharing the same non-empty signature.
/// Returns inclusive `(start, end)` index pairs, each covering >= 2 lines.
fn detect_runs(signatures: &[Option<Signature>]) -> Vec<(usize, usize)> {
    let keep = |start: usize, end: usize, sig: &Signature| -> bool {
        end - start + 1 >= 2 && !sig.0.is_empty()
    };

    let mut runs = Vec::new();
    let mut run_start: Option<usize> = None;
    let mut run_sig: Option<Signature> = None;
    for (i, sig) in signatures.iter().enumerate() {
        if let (Some(current), Some(next)) = (&run_sig, sig) {
            if current == next {
                continue;
            }
        }
        if let (Some(start), Some(current)) = (run_start, &run_sig) {
            if keep(start, i - 1, current) {
                runs.push((start, i - 1));
            }
        }
        run_start = sig.is_some().then_some(i);
        run_sig = sig.clone();
    }
    if let (Some(start), Some(current)) = (run_start, &run_sig) {
        let end = signatures.len() - 1;
        if keep(start, end, current) {
            runs.push((start, end));
        }
    }
    runs
}

fn quantize(coord: &crate::config::Coord) -> String {
    match coord.as_f64() {
        Some(v) => format!("{v:.2}"),
        None => coord.as_expr(),
    }
}

fn char_key(ch: &crate::config::CharacterConfig) -> CharKey {
    (
        ch.name.clone(),
        ch.expression.clone(),
        format!("{:.2}", ch.scale),
        ch.anchor.as_str().to_string(),
        quantize(&ch.position.x),
        quantize(&ch.position.y),
    )
}

/// Static character overlays of one line: visible, not animated, image
/// present on disk.
fn norm_char_entries(talk: &TalkLine) -> BTreeMap<CharKey, StaticOverlay> {
    let mut entries = BTreeMap::new();
    for ch in &talk.characters {
        if !ch.visible || ch.enter.is_some() || ch.leave.is_some() {
            continue;
        }
        let Some(path) = resolve_character_image(&ch.name, &ch.expression) else {
            continue;
        };
        entries.insert(
            char_key(ch),
            StaticOverlay {
                path,
                scale: ch.scale,
                anchor: ch.anchor,
                x: ch.position.x.as_expr(),
                y: ch.position.y.as_expr(),
            },
        );
    }
    entries
}

fn insert_overlay(insert: &InsertConfig) -> StaticOverlay {
    StaticOverlay {
        path: insert.path.clone(),
        scale: insert.scale,
        anchor: insert.anchor,
        x: insert.position.x.as_expr(),
        y: insert.position.y.as_expr(),
    }
}

fn layout_key(layout: &crate::config::BackgroundLayout) -> serde_json::Value {
    json!({
        "fit": layout.fit.as_str(),
        "fill": layout.fill_color,
        "anchor": layout.anchor.as_str(),
        "x": layout.position.x.as_expr(),
        "y": layout.position.y.as_expr(),
    })
}

/// Deterministic clip-worker count from `--jobs`, hardware kind, and the
/// current filter mode.
pub fn determine_clip_workers(jobs: Option<&str>, hw_kind: Option<HwEncoderKind>) -> usize {
    let nproc = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    let cpu_filters = hw_filter_mode() == HwFilterMode::Cpu;

    let auto_base = |floor: usize| -> usize {
        let base = std::cmp::max(floor, nproc / 2);
        if cpu_filters || hw_kind == Some(HwEncoderKind::Nvenc) {
            std::cmp::min(2, std::cmp::max(1, base))
        } else {
            base
        }
    };

    match jobs.map(|j| j.trim().to_ascii_lowercase()) {
        None => auto_base(1),
        Some(j) if j.is_empty() || j == "auto" || j == "0" => auto_base(2),
        Some(j) => match j.parse::<i64>() {
            Ok(v) if v > 0 => {
                let decided = std::cmp::max(1, std::cmp::min(v as usize, nproc));
                if hw_kind == Some(HwEncoderKind::Nvenc) && !cpu_filters {
                    std::cmp::min(2, decided)
                } else {
                    decided
                }
            }
            _ => auto_base(2),
        },
    }
}

/// Load the persisted auto-tune hint; a hint from a different ffmpeg build
/// or hardware kind is ignored.
async fn load_autotune_hint(cache_dir: &Path, hw_kind: Option<HwEncoderKind>) {
    let hint_path = cache_dir.join("autotune_hint.json");
    let Ok(raw) = std::fs::read_to_string(&hint_path) else {
        return;
    };
    let Ok(hint) = serde_json::from_str::<AutotuneHint>(&raw) else {
        warn!("ignoring unreadable auto-tune hint");
        return;
    };

    let current_ffmpeg = ffmpeg_version().await;
    let current_hw = hw_kind.map(|k| k.as_str().to_string());
    if (!hint.ffmpeg.is_empty() && hint.ffmpeg != current_ffmpeg)
        || (hint.hw_kind.is_some() && hint.hw_kind != current_hw)
    {
        info!(
            "ignoring outdated auto-tune hint (ffmpeg {} -> {}, hw {:?} -> {:?})",
            hint.ffmpeg, current_ffmpeg, hint.hw_kind, current_hw
        );
        return;
    }
    if hint.decided_mode == "cpu" {
        info!("auto-tune hint: forcing HW filter mode to 'cpu'");
        set_hw_filter_mode(HwFilterMode::Cpu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_str;

    fn talk_line(yaml: &str) -> TalkLine {
        let raw = format!(
            r#"
background:
  default: bg.png
defaults:
  speaker_id: 1
scenes:
  - id: s1
    lines:
{yaml}
"#
        );
        let config = load_config_str(&raw).unwrap();
        config.scenes[0].lines[0].as_talk().unwrap().clone()
    }

    #[test]
    fn test_char_key_quantizes_positions() {
        let talk = talk_line(
            r#"      - text: hi
        characters:
          - {name: a, visible: true, scale: 1.004, position: {x: 10.001, y: 0}}
"#,
        );
        let key = char_key(&talk.characters[0]);
        assert_eq!(key.2, "1.00");
        assert_eq!(key.4, "10.00");
        assert_eq!(key.5, "0.00");
    }

    #[test]
    fn test_norm_char_entries_excludes_animated() {
        let talk = talk_line(
            r#"      - text: hi
        characters:
          - {name: a, visible: true, enter: fade}
          - {name: b, visible: false}
"#,
        );
        // Both are excluded: one animated, one invisible (and neither has an
        // image on disk in the test environment anyway).
        assert!(norm_char_entries(&talk).is_empty());
    }

    #[test]
    fn test_determine_clip_workers_explicit() {
        let _guard = crate::ffmpeg::capabilities::TEST_MODE_LOCK.lock().unwrap();
        crate::ffmpeg::capabilities::reset_hw_filter_mode_for_tests();
        assert_eq!(determine_clip_workers(Some("3"), None), 3.min(
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
        ));
        // NVENC caps explicit values at 2
        assert!(determine_clip_workers(Some("8"), Some(HwEncoderKind::Nvenc)) <= 2);
    }

    #[test]
    fn test_determine_clip_workers_invalid_falls_back() {
        let _guard = crate::ffmpeg::capabilities::TEST_MODE_LOCK.lock().unwrap();
        crate::ffmpeg::capabilities::reset_hw_filter_mode_for_tests();
        let auto = determine_clip_workers(Some("auto"), None);
        assert_eq!(determine_clip_workers(Some("bananas"), None), auto);
        assert_eq!(determine_clip_workers(Some("0"), None), auto);
        assert!(auto >= 1);
    }

    #[test]
    fn test_autotune_hint_roundtrip() {
        let hint = AutotuneHint {
            decided_mode: "cpu".into(),
            clip_workers: 3,
            cpu_ratio: 0.75,
            avg_elapsed: 2.1,
            p90_elapsed: 3.3,
            ffmpeg: "6.1".into(),
            hw_kind: Some("nvenc".into()),
        };
        let encoded = serde_json::to_string(&hint).unwrap();
        let decoded: AutotuneHint = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.decided_mode, "cpu");
        assert_eq!(decoded.clip_workers, 3);
        assert_eq!(decoded.hw_kind.as_deref(), Some("nvenc"));
    }

    fn sig(names: &[&str]) -> Option<Signature> {
        let keys: BTreeSet<CharKey> = names
            .iter()
            .map(|n| {
                (
                    n.to_string(),
                    "default".to_string(),
                    "1.00".to_string(),
                    "bottom_center".to_string(),
                    "0.00".to_string(),
                    "0.00".to_string(),
                )
            })
            .collect();
        Some((keys, None))
    }

    #[test]
    fn test_detect_runs_finds_maximal_spans() {
        // lines: a a a | b b | (wait) | a a
        let signatures = vec![
            sig(&["a"]),
            sig(&["a"]),
            sig(&["a"]),
            sig(&["b"]),
            sig(&["b"]),
            None,
            sig(&["a"]),
            sig(&["a"]),
        ];
        assert_eq!(detect_runs(&signatures), vec![(0, 2), (3, 4), (6, 7)]);
    }

    #[test]
    fn test_detect_runs_skips_single_lines_and_empty_sets() {
        let signatures = vec![
            sig(&["a"]),
            sig(&["b"]),
            // empty character set never forms a run
            sig(&[]),
            sig(&[]),
        ];
        assert!(detect_runs(&signatures).is_empty());
    }

    #[test]
    fn test_detect_runs_wait_breaks_run() {
        let signatures = vec![sig(&["a"]), None, sig(&["a"])];
        assert!(detect_runs(&signatures).is_empty());
    }

    #[test]
    fn test_detect_runs_whole_scene() {
        let signatures = vec![sig(&["a", "b"]), sig(&["a", "b"]), sig(&["a", "b"])];
        assert_eq!(detect_runs(&signatures), vec![(0, 2)]);
    }

    #[test]
    fn test_run_base_offsets() {
        let rb = RunBase {
            start: 2,
            end: 4,
            path: PathBuf::from("x.mp4"),
            char_keys: BTreeSet::new(),
            has_insert_image: false,
            offsets: vec![0.0, 1.5, 3.25],
        };
        assert!(rb.contains(2));
        assert!(rb.contains(4));
        assert!(!rb.contains(5));
        assert_eq!(rb.offset_of(3), 1.5);
        assert_eq!(rb.offset_of(4), 3.25);
    }
}
