use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RenderError, RenderResult};
use crate::ffmpeg::layout::{Anchor, BackgroundFit};

const DEFAULTS_YAML: &str = include_str!("../assets/defaults.yaml");

/// A coordinate that may be a number or an ffmpeg expression string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Coord {
    Num(f64),
    Expr(String),
}

impl Default for Coord {
    fn default() -> Self {
        Coord::Num(0.0)
    }
}

impl Coord {
    /// Expression fragment for filter assembly.
    pub fn as_expr(&self) -> String {
        match self {
            Coord::Num(n) => {
                if n.fract() == 0.0 {
                    format!("{}", *n as i64)
                } else {
                    format!("{n}")
                }
            }
            Coord::Expr(s) => s.clone(),
        }
    }

    /// Numeric value when the coordinate is a plain number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Coord::Num(n) => Some(*n),
            Coord::Expr(s) => s.parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    #[serde(default)]
    pub x: Coord,
    #[serde(default)]
    pub y: Coord,
}

// ---------------------------------------------------------------------------
// Global sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub pix_fmt: String,
    pub profile: String,
    pub level: String,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub crf: Option<u32>,
    #[serde(default)]
    pub cq: Option<u32>,
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
    pub audio_codec: String,
    pub audio_bitrate_kbps: u32,
    #[serde(default)]
    pub background_fit: Option<BackgroundFit>,
    pub scene_base_min_lines: usize,
    pub profile_first_clips: usize,
    pub auto_tune: bool,
    pub gpu_scale_with_cpu_overlay: bool,
    pub gpu_overlay_experimental: bool,
    pub face_anim: FaceAnimConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceAnimConfig {
    pub mouth_fps: u32,
    pub mouth_thr_half: f64,
    pub mouth_thr_open: f64,
    pub blink_min_interval: f64,
    pub blink_max_interval: f64,
    pub blink_close_frames: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub url: String,
    #[serde(default)]
    pub speaker: Option<u32>,
    pub speed: f64,
    pub pitch: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleConfig {
    pub enabled: bool,
    #[serde(default)]
    pub font: Option<String>,
    pub font_size: u32,
    pub font_color: String,
    pub outline_color: String,
    pub anchor: Anchor,
    pub position: Position,
    pub reading_display: ReadingDisplay,
    #[serde(default)]
    pub effects: Vec<EffectSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReadingDisplay {
    #[default]
    None,
    Paren,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BgmConfig {
    pub path: PathBuf,
    #[serde(default = "default_bgm_volume")]
    pub volume: f64,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub fade_in: f64,
    #[serde(default)]
    pub fade_out: f64,
}

fn default_bgm_volume() -> f64 {
    0.5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default)]
    pub default: Option<PathBuf>,
    #[serde(default)]
    pub fit: Option<BackgroundFit>,
    pub fill_color: String,
    pub anchor: Anchor,
    pub position: Position,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            paths: Vec::new(),
            allow: Vec::new(),
            deny: Vec::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LineDefaults {
    #[serde(default)]
    pub speaker_id: Option<u32>,
    #[serde(default)]
    pub speaker_name: Option<String>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub pitch: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub video_extensions: Vec<String>,
    pub image_extensions: Vec<String>,
}

impl SystemConfig {
    pub fn is_video_path(&self, path: &Path) -> bool {
        has_extension(path, &self.video_extensions)
    }

    pub fn is_image_path(&self, path: &Path) -> bool {
        has_extension(path, &self.image_extensions)
    }
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();
    extensions.iter().any(|candidate| *candidate == ext)
}

// ---------------------------------------------------------------------------
// Scenes and lines
// ---------------------------------------------------------------------------

/// An overlay/subtitle effect reference: either a bare name or a parameter
/// table with a `type` key. Parameters stay as JSON values because plugin
/// builders consume them generically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EffectSpec {
    Name(String),
    Table(BTreeMap<String, serde_json::Value>),
}

impl EffectSpec {
    /// Normalize to `(type, params)`; `None` when the entry has no usable type.
    pub fn normalized(&self) -> Option<(String, BTreeMap<String, serde_json::Value>)> {
        match self {
            EffectSpec::Name(name) => {
                let t = name.trim().to_lowercase();
                if t.is_empty() {
                    None
                } else {
                    Some((t, BTreeMap::new()))
                }
            }
            EffectSpec::Table(map) => {
                let t = map.get("type")?.as_str()?.trim().to_lowercase();
                if t.is_empty() {
                    return None;
                }
                let params = map
                    .iter()
                    .filter(|(k, v)| k.as_str() != "type" && !v.is_null())
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Some((t, params))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CharacterConfig {
    pub name: String,
    #[serde(default = "default_expression")]
    pub expression: String,
    #[serde(default)]
    pub visible: bool,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub anchor: Anchor,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub enter: Option<String>,
    #[serde(default)]
    pub leave: Option<String>,
    #[serde(default = "default_enter_leave_duration")]
    pub enter_duration: f64,
    #[serde(default = "default_enter_leave_duration")]
    pub leave_duration: f64,
    #[serde(default)]
    pub effects: Vec<EffectSpec>,
}

fn default_expression() -> String {
    "default".into()
}
fn default_scale() -> f64 {
    1.0
}
fn default_enter_leave_duration() -> f64 {
    0.3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertConfig {
    pub path: PathBuf,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_insert_anchor")]
    pub anchor: Anchor,
    #[serde(default)]
    pub position: Position,
    #[serde(default = "default_scale")]
    pub volume: f64,
    #[serde(default)]
    pub duration: Option<f64>,
}

fn default_insert_anchor() -> Anchor {
    Anchor::MiddleCenter
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoundEffectConfig {
    pub path: PathBuf,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default = "default_scale")]
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceLayerConfig {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub reading: Option<String>,
    #[serde(default)]
    pub speaker_id: Option<u32>,
    #[serde(default)]
    pub speaker_name: Option<String>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub pitch: Option<f64>,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default = "default_scale")]
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForegroundOverlay {
    pub path: PathBuf,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub anchor: Anchor,
    #[serde(default)]
    pub position: Position,
    #[serde(default)]
    pub start_time: f64,
    #[serde(default)]
    pub duration: Option<f64>,
}

/// Per-line background override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackgroundOverride {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub fit: Option<BackgroundFit>,
    #[serde(default)]
    pub fill_color: Option<String>,
    #[serde(default)]
    pub anchor: Option<Anchor>,
    #[serde(default)]
    pub position: Option<Position>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TalkLine {
    pub text: String,
    #[serde(default)]
    pub reading: Option<String>,
    #[serde(default)]
    pub subtitle_text: Option<String>,
    #[serde(default)]
    pub speaker_id: Option<u32>,
    #[serde(default)]
    pub speaker_name: Option<String>,
    #[serde(default)]
    pub speed: Option<f64>,
    #[serde(default)]
    pub pitch: Option<f64>,
    #[serde(default)]
    pub voice_layers: Vec<VoiceLayerConfig>,
    #[serde(default)]
    pub sound_effects: Vec<SoundEffectConfig>,
    #[serde(default)]
    pub characters: Vec<CharacterConfig>,
    #[serde(default)]
    pub insert: Option<InsertConfig>,
    #[serde(default)]
    pub fg_overlays: Vec<ForegroundOverlay>,
    #[serde(default)]
    pub subtitle: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub screen_effects: Vec<EffectSpec>,
    #[serde(default)]
    pub background_effects: Vec<EffectSpec>,
    #[serde(default)]
    pub background: Option<BackgroundOverride>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WaitLine {
    pub duration: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Line {
    Talk(TalkLine),
    Wait(WaitLine),
}

impl Line {
    pub fn as_talk(&self) -> Option<&TalkLine> {
        match self {
            Line::Talk(t) => Some(t),
            Line::Wait(_) => None,
        }
    }

    pub fn is_wait(&self) -> bool {
        matches!(self, Line::Wait(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    #[serde(default)]
    pub bg: Option<PathBuf>,
    #[serde(default)]
    pub bgm: Option<BgmConfig>,
    #[serde(default)]
    pub transition: Option<serde_json::Value>,
    #[serde(default)]
    pub fg_overlays: Vec<ForegroundOverlay>,
    #[serde(default)]
    pub background: Option<BackgroundOverride>,
    #[serde(deserialize_with = "deserialize_lines", default)]
    pub lines: Vec<Line>,
}

impl Scene {
    pub fn line_id(&self, index: usize) -> String {
        format!("{}_{}", self.id, index + 1)
    }
}

// Raw YAML lines are maps with either a `wait` key or a `text` key; `wait`
// accepts a bare number or `{duration: ..}`.
fn deserialize_lines<'de, D>(deserializer: D) -> Result<Vec<Line>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawWait {
        Num(f64),
        Table { duration: f64 },
    }

    let raw: Vec<serde_yml::Value> = Vec::deserialize(deserializer)?;
    let mut lines = Vec::with_capacity(raw.len());
    for (i, value) in raw.into_iter().enumerate() {
        let is_wait = value.is_mapping() && value.get("wait").is_some();
        if is_wait {
            let wait_value = value.get("wait").cloned().unwrap_or_default();
            let wait: RawWait = serde_yml::from_value(wait_value)
                .map_err(|e| D::Error::custom(format!("line {}: invalid wait: {e}", i + 1)))?;
            let duration = match wait {
                RawWait::Num(d) => d,
                RawWait::Table { duration } => duration,
            };
            if duration < 0.0 {
                return Err(D::Error::custom(format!(
                    "line {}: wait duration must be >= 0",
                    i + 1
                )));
            }
            lines.push(Line::Wait(WaitLine { duration }));
        } else {
            let talk: TalkLine = serde_yml::from_value(value)
                .map_err(|e| D::Error::custom(format!("line {}: {e}", i + 1)))?;
            lines.push(Line::Talk(talk));
        }
    }
    Ok(lines)
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub video: VideoConfig,
    pub voice: VoiceConfig,
    pub subtitle: SubtitleConfig,
    #[serde(default)]
    pub bgm: Option<BgmConfig>,
    pub background: BackgroundConfig,
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub defaults: LineDefaults,
    pub system: SystemConfig,
    #[serde(default)]
    pub scenes: Vec<Scene>,
}

/// The background layout a given line renders with, after merging
/// global → scene → line overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundLayout {
    pub fit: BackgroundFit,
    pub fill_color: String,
    pub anchor: Anchor,
    pub position: Position,
}

impl Config {
    /// Resolve the effective background layout for one line of a scene.
    pub fn background_layout(
        &self,
        scene: &Scene,
        line_override: Option<&BackgroundOverride>,
    ) -> BackgroundLayout {
        let global_fit = self
            .video
            .background_fit
            .or(self.background.fit)
            .unwrap_or_default();

        let mut layout = BackgroundLayout {
            fit: global_fit,
            fill_color: self.background.fill_color.clone(),
            anchor: self.background.anchor,
            position: self.background.position.clone(),
        };
        for ov in [scene.background.as_ref(), line_override].into_iter().flatten() {
            if let Some(fit) = ov.fit {
                layout.fit = fit;
            }
            if let Some(color) = &ov.fill_color {
                layout.fill_color = color.clone();
            }
            if let Some(anchor) = ov.anchor {
                layout.anchor = anchor;
            }
            if let Some(position) = &ov.position {
                layout.position = position.clone();
            }
        }
        layout
    }

    /// Background image/video path for a scene, falling back to the global
    /// default.
    pub fn scene_background(&self, scene: &Scene) -> RenderResult<PathBuf> {
        scene
            .bg
            .clone()
            .or_else(|| self.background.default.clone())
            .ok_or_else(|| {
                RenderError::Validation(format!(
                    "scene '{}' has no background and background.default is unset",
                    scene.id
                ))
            })
    }
}

/// Deep-merge `over` onto `base`: maps merge recursively, everything else is
/// replaced by `over`.
fn merge_yaml(base: serde_yml::Value, over: serde_yml::Value) -> serde_yml::Value {
    match (base, over) {
        (serde_yml::Value::Mapping(mut base_map), serde_yml::Value::Mapping(over_map)) => {
            for (k, v) in over_map {
                let merged = match base_map.remove(&k) {
                    Some(existing) => merge_yaml(existing, v),
                    None => v,
                };
                base_map.insert(k, merged);
            }
            serde_yml::Value::Mapping(base_map)
        }
        (_, over) => over,
    }
}

/// Load and validate the merged configuration: the screenplay YAML layered
/// over the built-in defaults, with line defaults folded into talk lines.
pub fn load_config(script_path: &Path) -> RenderResult<Config> {
    if !script_path.exists() {
        return Err(RenderError::ScriptNotFound(script_path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(script_path)?;
    load_config_str(&raw)
}

pub fn load_config_str(raw: &str) -> RenderResult<Config> {
    let defaults: serde_yml::Value = serde_yml::from_str(DEFAULTS_YAML)
        .map_err(|e| RenderError::Other(format!("builtin defaults are invalid: {e}")))?;
    let script: serde_yml::Value =
        serde_yml::from_str(raw).map_err(|e| RenderError::ScriptParse(e.to_string()))?;

    let merged = merge_yaml(defaults, script);
    let mut config: Config =
        serde_yml::from_value(merged).map_err(|e| RenderError::ScriptParse(e.to_string()))?;

    validate(&config)?;
    apply_line_defaults(&mut config);
    Ok(config)
}

fn validate(config: &Config) -> RenderResult<()> {
    if config.video.face_anim.mouth_thr_open <= config.video.face_anim.mouth_thr_half {
        return Err(RenderError::Validation(
            "video.face_anim: mouth_thr_open must be greater than mouth_thr_half".into(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for scene in &config.scenes {
        if scene.id.trim().is_empty() {
            return Err(RenderError::Validation("scene with empty id".into()));
        }
        if !seen.insert(scene.id.clone()) {
            return Err(RenderError::Validation(format!(
                "duplicate scene id '{}'",
                scene.id
            )));
        }
        if scene.bg.is_none() && config.background.default.is_none() {
            return Err(RenderError::Validation(format!(
                "scene '{}' has no bg and background.default is unset",
                scene.id
            )));
        }
    }
    Ok(())
}

fn apply_line_defaults(config: &mut Config) {
    let defaults = config.defaults.clone();
    let voice = config.voice.clone();
    for scene in &mut config.scenes {
        for line in &mut scene.lines {
            if let Line::Talk(talk) = line {
                if talk.speaker_id.is_none() {
                    talk.speaker_id = defaults.speaker_id.or(voice.speaker);
                }
                if talk.speaker_name.is_none() {
                    talk.speaker_name = defaults.speaker_name.clone();
                }
                if talk.speed.is_none() {
                    talk.speed = defaults.speed.or(Some(voice.speed));
                }
                if talk.pitch.is_none() {
                    talk.pitch = defaults.pitch.or(Some(voice.pitch));
                }
            }
        }
    }
}
