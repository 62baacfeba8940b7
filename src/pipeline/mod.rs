pub mod audio;
pub mod finalize;
pub mod video;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use colored::Colorize;
use tracing::info;

use crate::cache::CacheManager;
use crate::config::Config;
use crate::error::{RenderError, RenderResult};
use crate::face_anim::FaceAnim;
use crate::ffmpeg::capabilities::{ffmpeg_major_version, ffmpeg_version};
use crate::plugins;
use crate::subtitle::{self, SubtitleEvent};
use crate::timeline::Timeline;
use crate::tts::TtsClient;

/// Oldest ffmpeg major with every filter this pipeline assembles.
const MIN_FFMPEG_MAJOR: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Talk,
    Wait,
}

/// The audio phase's output for one line, consumed by the video phase.
/// Lines are addressed by `line_id` (`<scene>_<index+1>`); `line_index` is
/// the position in the scene's line array, not a back-pointer.
#[derive(Debug, Clone)]
pub struct LineData {
    pub kind: LineKind,
    pub audio_path: Option<PathBuf>,
    pub duration: f64,
    pub pre_duration: f64,
    pub post_duration: f64,
    pub text: Option<String>,
    pub tts_text: Option<String>,
    pub line_index: usize,
    pub face_anim: Option<FaceAnim>,
}

pub type LineDataMap = HashMap<String, LineData>;

/// Output format toggles picked on the command line.
#[derive(Debug, Clone, Default)]
pub struct OutputOptions {
    pub timeline_md: bool,
    pub timeline_csv: bool,
    pub subtitle_srt: bool,
    pub subtitle_ass: bool,
    pub voice_report: bool,
    pub final_copy_only: bool,
}

/// Pipeline settings derived from the CLI.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub no_cache: bool,
    pub cache_refresh: bool,
    pub jobs: Option<String>,
    pub plugin_dirs: Vec<PathBuf>,
    pub enable_plugins: Vec<String>,
    pub disable_plugins: Vec<String>,
    pub output: OutputOptions,
}

/// Drive the three phases in order and write the final MP4 plus side
/// reports. Owns the temp directory, cache, timeline and TTS client.
pub async fn run(config: Config, output_path: &Path, options: RunOptions) -> RenderResult<()> {
    check_dependencies().await?;

    if config.scenes.is_empty() {
        eprintln!(
            "{} script has no scenes; nothing to render",
            "render:".cyan().bold()
        );
        return Ok(());
    }

    let config = Arc::new(config);
    let temp_dir = tempfile::tempdir()?;
    info!(dir = %temp_dir.path().display(), "using temporary directory");

    let cache = Arc::new(CacheManager::new(
        default_cache_dir(),
        options.no_cache,
        options.cache_refresh,
        Some(8192),
        Some(24 * 14),
    )?);

    let mut plugin_config = config.plugins.clone();
    plugin_config.allow.extend(options.enable_plugins.clone());
    plugin_config.deny.extend(options.disable_plugins.clone());
    let registry = Arc::new(plugins::initialize_registry(
        &plugin_config,
        &options.plugin_dirs,
    ));

    let tts = TtsClient::new(&config.voice.url);
    let mut timeline = Timeline::new();

    // Phase 1: audio
    eprintln!("{} audio phase", "render:".cyan().bold());
    let mut audio_phase = audio::AudioPhase::new(
        config.clone(),
        temp_dir.path().to_path_buf(),
        cache.clone(),
        tts.clone(),
    );
    let line_data_map = audio_phase.run(&mut timeline).await?;
    let used_voices = audio_phase.used_voices().to_vec();
    eprintln!(
        "{} planned {:.1}s of content",
        "render:".cyan().bold(),
        timeline.total_duration()
    );

    // Phase 2: video
    eprintln!("{} video phase", "render:".cyan().bold());
    let mut video_phase = video::VideoPhase::create(
        config.clone(),
        temp_dir.path().to_path_buf(),
        cache.clone(),
        registry.clone(),
        options.jobs.clone(),
    )
    .await?;
    let scene_clips = video_phase.run(line_data_map).await?;

    // Subtitle files are cut from the timeline: every spoken event carries
    // its effective text and global start time.
    let subtitle_events: Vec<SubtitleEvent> = timeline
        .events()
        .iter()
        .filter(|e| !e.is_scene_change)
        .filter_map(|e| {
            e.text.as_ref().map(|text| SubtitleEvent {
                text: text.clone(),
                start: e.start_time,
                duration: e.duration,
                style: config.subtitle.clone(),
            })
        })
        .collect();

    // Phase 3: finalize
    eprintln!("{} finalize phase", "render:".cyan().bold());
    let final_path = finalize::FinalizePhase::new(
        config.clone(),
        temp_dir.path().to_path_buf(),
        video_phase.renderer(),
        options.output.final_copy_only,
    )
    .run(&scene_clips)
    .await?;

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    // Temp files may live on another filesystem; fall back to copy.
    if std::fs::rename(&final_path, output_path).is_err() {
        std::fs::copy(&final_path, output_path)?;
    }
    eprintln!(
        "{} wrote {}",
        "render:".cyan().bold(),
        output_path.display()
    );

    write_reports(&config, output_path, &timeline, &subtitle_events, &used_voices, &options, &tts)
        .await?;
    Ok(())
}

async fn write_reports(
    config: &Config,
    output_path: &Path,
    timeline: &Timeline,
    subtitle_events: &[SubtitleEvent],
    used_voices: &[(u32, String)],
    options: &RunOptions,
    tts: &TtsClient,
) -> RenderResult<()> {
    let stem = output_path.with_extension("");
    let out = &options.output;

    if out.timeline_md {
        timeline.save_as_md(&stem.with_extension("timeline.md"))?;
    }
    if out.timeline_csv {
        timeline.save_as_csv(&stem.with_extension("timeline.csv"))?;
    }
    if out.subtitle_srt && !subtitle_events.is_empty() {
        subtitle::write_srt(subtitle_events, &stem.with_extension("srt"))?;
    }
    if out.subtitle_ass && !subtitle_events.is_empty() {
        subtitle::write_ass(subtitle_events, &config.subtitle, &stem.with_extension("ass"))?;
    }
    if out.voice_report && !used_voices.is_empty() {
        crate::reporting::write_voice_report(
            used_voices,
            tts,
            &stem.with_extension("voices.md"),
        )
        .await?;
    }
    Ok(())
}

/// Verify the external tools exist and are recent enough before any work.
async fn check_dependencies() -> RenderResult<()> {
    let version = ffmpeg_version().await;
    if version == "unknown" {
        return Err(RenderError::Dependency(
            "ffmpeg not found or not executable".into(),
        ));
    }
    let major = ffmpeg_major_version().await;
    // Distro builds report strings like "n6.1" or "4.4.2-0ubuntu1"; only a
    // clean major below the floor is rejected.
    if major > 0 && major < MIN_FFMPEG_MAJOR {
        return Err(RenderError::Dependency(format!(
            "ffmpeg {version} is too old (need >= {MIN_FFMPEG_MAJOR}.0)"
        )));
    }
    let probe_args: Vec<String> = vec!["ffprobe".into(), "-version".into()];
    crate::ffmpeg::runner::run_ffmpeg(&probe_args)
        .await
        .map_err(|_| RenderError::Dependency("ffprobe not found or not executable".into()))?;
    info!(%version, "ffmpeg dependency check passed");
    Ok(())
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_data_wait_invariant() {
        let data = LineData {
            kind: LineKind::Wait,
            audio_path: None,
            duration: 1.5,
            pre_duration: 0.0,
            post_duration: 0.0,
            text: None,
            tts_text: None,
            line_index: 0,
            face_anim: None,
        };
        assert!(data.audio_path.is_none());
        assert!(data.duration >= 0.0);
    }
}
