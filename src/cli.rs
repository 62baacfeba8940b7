use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TimelineFormat {
    Md,
    Csv,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SubtitleFileFormat {
    Srt,
    Ass,
    Both,
}

/// Render a YAML screenplay to a single MP4 via FFmpeg and VOICEVOX.
#[derive(Debug, Parser)]
#[command(name = "sceneforge", version, about)]
pub struct Cli {
    /// Path to the screenplay YAML.
    pub script: PathBuf,

    /// Output MP4 path.
    #[arg(short, long, default_value = "output.mp4")]
    pub output: PathBuf,

    /// Disable the artifact cache entirely for this run.
    #[arg(long)]
    pub no_cache: bool,

    /// Regenerate every artifact, refreshing cache entries in place.
    #[arg(long, conflicts_with = "no_cache")]
    pub cache_refresh: bool,

    /// Worker/thread budget: a number, or "auto".
    #[arg(long)]
    pub jobs: Option<String>,

    /// Timeline report format.
    #[arg(long, value_enum, default_value = "md")]
    pub timeline: TimelineFormat,

    /// Skip timeline report output.
    #[arg(long)]
    pub no_timeline: bool,

    /// Subtitle file format.
    #[arg(long, value_enum, default_value = "srt")]
    pub subtitle_file: SubtitleFileFormat,

    /// Skip subtitle file output.
    #[arg(long)]
    pub no_subtitle_file: bool,

    /// Write a voice-usage report next to the output.
    #[arg(long)]
    pub voice_report: bool,

    /// Fail instead of re-encoding when scene clips cannot be concatenated
    /// with stream copy.
    #[arg(long)]
    pub final_copy_only: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,

    /// Extra plugin directories (repeatable).
    #[arg(long = "plugin-dir")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Allow only these plugin ids (repeatable).
    #[arg(long = "enable-plugin")]
    pub enable_plugins: Vec<String>,

    /// Reject these plugin ids (repeatable).
    #[arg(long = "disable-plugin")]
    pub disable_plugins: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_invocation() {
        let cli = Cli::try_parse_from(["sceneforge", "script.yaml"]).unwrap();
        assert_eq!(cli.script, PathBuf::from("script.yaml"));
        assert_eq!(cli.output, PathBuf::from("output.mp4"));
        assert!(!cli.no_cache);
        assert_eq!(cli.timeline, TimelineFormat::Md);
        assert_eq!(cli.subtitle_file, SubtitleFileFormat::Srt);
    }

    #[test]
    fn test_full_invocation() {
        let cli = Cli::try_parse_from([
            "sceneforge",
            "s.yaml",
            "-o",
            "final.mp4",
            "--cache-refresh",
            "--jobs",
            "auto",
            "--timeline",
            "both",
            "--subtitle-file",
            "ass",
            "--final-copy-only",
            "--log-json",
            "--plugin-dir",
            "/opt/plugins",
            "--disable-plugin",
            "bad_one",
        ])
        .unwrap();
        assert_eq!(cli.output, PathBuf::from("final.mp4"));
        assert!(cli.cache_refresh);
        assert_eq!(cli.jobs.as_deref(), Some("auto"));
        assert_eq!(cli.timeline, TimelineFormat::Both);
        assert_eq!(cli.subtitle_file, SubtitleFileFormat::Ass);
        assert!(cli.final_copy_only);
        assert_eq!(cli.plugin_dirs, vec![PathBuf::from("/opt/plugins")]);
        assert_eq!(cli.disable_plugins, vec!["bad_one".to_string()]);
    }

    #[test]
    fn test_no_cache_conflicts_with_refresh() {
        assert!(Cli::try_parse_from(["sceneforge", "s.yaml", "--no-cache", "--cache-refresh"])
            .is_err());
    }
}
