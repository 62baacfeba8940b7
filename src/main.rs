mod cache;
mod cli;
mod config;
mod effects;
mod error;
mod face_anim;
mod ffmpeg;
mod pipeline;
mod plugins;
mod render;
mod reporting;
mod subtitle;
mod text;
mod timeline;
mod tts;

use clap::Parser;
use colored::Colorize;

use cli::{Cli, SubtitleFileFormat, TimelineFormat};
use error::RenderResult;
use pipeline::{OutputOptions, RunOptions};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.log_json {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
    }

    // A .env next to the script can carry VOICEVOX_URL and friends.
    let _ = dotenvy::dotenv();

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "error:".red().bold(), e);
        if let Some(hint) = e.hint() {
            eprintln!("{} {}", "hint:".yellow().bold(), hint);
        }
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> RenderResult<()> {
    let config = config::load_config(&cli.script)?;

    let output = OutputOptions {
        timeline_md: !cli.no_timeline
            && matches!(cli.timeline, TimelineFormat::Md | TimelineFormat::Both),
        timeline_csv: !cli.no_timeline
            && matches!(cli.timeline, TimelineFormat::Csv | TimelineFormat::Both),
        subtitle_srt: !cli.no_subtitle_file
            && matches!(
                cli.subtitle_file,
                SubtitleFileFormat::Srt | SubtitleFileFormat::Both
            ),
        subtitle_ass: !cli.no_subtitle_file
            && matches!(
                cli.subtitle_file,
                SubtitleFileFormat::Ass | SubtitleFileFormat::Both
            ),
        voice_report: cli.voice_report,
        final_copy_only: cli.final_copy_only,
    };

    let options = RunOptions {
        no_cache: cli.no_cache,
        cache_refresh: cli.cache_refresh,
        jobs: cli.jobs,
        plugin_dirs: cli.plugin_dirs,
        enable_plugins: cli.enable_plugins,
        disable_plugins: cli.disable_plugins,
        output,
    };

    pipeline::run(config, &cli.output, options).await
}
