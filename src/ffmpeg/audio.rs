use std::path::Path;

use tracing::{debug, info};

use super::capabilities::profile_flags;
use super::params::AudioParams;
use super::probe::{has_audio_stream, media_duration};
use super::runner::run_ffmpeg;
use crate::error::RenderResult;

/// One input of a mix: (path, start offset seconds, volume).
pub type AudioTrack = (String, f64, f64);

/// Generate a silent WAV of the given duration.
pub async fn create_silent_audio(
    output: &Path,
    duration: f64,
    params: &AudioParams,
) -> RenderResult<()> {
    let mut args: Vec<String> = vec!["ffmpeg".into(), "-y".into()];
    args.extend(profile_flags());
    args.extend([
        "-f".into(),
        "lavfi".into(),
        "-i".into(),
        format!(
            "anullsrc=r={}:cl={}",
            params.sample_rate,
            params.channel_layout()
        ),
        "-t".into(),
        duration.to_string(),
        "-c:a".into(),
        "pcm_s16le".into(),
        "-ar".into(),
        params.sample_rate.to_string(),
        "-ac".into(),
        params.channels.to_string(),
        output.display().to_string(),
    ]);
    run_ffmpeg(&args).await?;
    debug!(path = %output.display(), duration, "created silent audio");
    Ok(())
}

/// Per-track volume/adelay chains feeding one amix.
fn build_mix_filter(tracks: &[AudioTrack]) -> String {
    let mut parts: Vec<String> = Vec::new();
    for (i, (_, start, vol)) in tracks.iter().enumerate() {
        let delay_ms = (start * 1000.0).round().max(0.0) as u64;
        parts.push(format!("[{i}:a]volume={vol},adelay={delay_ms}:all=1[a{i}]"));
    }
    let mix_in: String = (0..tracks.len()).map(|i| format!("[a{i}]")).collect();
    parts.push(format!(
        "{mix_in}amix=inputs={}:dropout_transition=0[aout]",
        tracks.len()
    ));
    parts.join(";")
}

/// Mix several audio tracks (each with its own delay and volume) into one
/// WAV trimmed to `total_duration`.
pub async fn mix_audio_tracks(
    tracks: &[AudioTrack],
    output: &Path,
    total_duration: f64,
    params: &AudioParams,
) -> RenderResult<()> {
    let mut args: Vec<String> = vec!["ffmpeg".into(), "-y".into()];
    for (path, _, _) in tracks {
        args.extend(["-i".into(), path.clone()]);
    }
    args.extend([
        "-filter_complex".into(),
        build_mix_filter(tracks),
        "-map".into(),
        "[aout]".into(),
        "-c:a".into(),
        "pcm_s16le".into(),
        "-ar".into(),
        params.sample_rate.to_string(),
        "-ac".into(),
        params.channels.to_string(),
        "-t".into(),
        total_duration.to_string(),
        output.display().to_string(),
    ]);

    run_ffmpeg(&args).await?;
    info!(path = %output.display(), tracks = tracks.len(), "mixed audio tracks");
    Ok(())
}

/// Mux a BGM track under an existing video. Video stream is copied; audio is
/// re-encoded through the filter graph.
#[allow(clippy::too_many_arguments)]
pub async fn add_bgm_to_video(
    video: &Path,
    bgm: &Path,
    output: &Path,
    params: &AudioParams,
    volume: f64,
    start_time: f64,
    fade_in: f64,
    fade_out: f64,
) -> RenderResult<()> {
    let bgm_duration = media_duration(bgm).await?;

    let mut af = vec![format!("volume={volume}")];
    if fade_in > 0.0 {
        af.push(format!("afade=t=in:st=0:d={fade_in}"));
    }
    if fade_out > 0.0 {
        let st = (bgm_duration - fade_out).max(0.0);
        af.push(format!("afade=t=out:st={st}:d={fade_out}"));
    }
    let bgm_chain = format!("[1:a]{}[bgm_filtered]", af.join(","));
    let delayed = format!(
        "[bgm_filtered]adelay={}:all=1[delayed_bgm]",
        (start_time * 1000.0).round().max(0.0) as u64
    );

    let video_has_audio = has_audio_stream(video).await;
    let mut args: Vec<String> = vec!["ffmpeg".into(), "-y".into()];
    args.extend(profile_flags());
    args.extend([
        "-i".into(),
        video.display().to_string(),
        "-i".into(),
        bgm.display().to_string(),
        "-filter_complex".into(),
    ]);

    if video_has_audio {
        args.push(format!(
            "{bgm_chain};{delayed};[0:a][delayed_bgm]amix=inputs=2:duration=shortest[aout]"
        ));
        args.extend(["-map".into(), "0:v".into(), "-map".into(), "[aout]".into()]);
    } else {
        args.push(format!("{bgm_chain};{delayed}"));
        args.extend([
            "-map".into(),
            "0:v".into(),
            "-map".into(),
            "[delayed_bgm]".into(),
        ]);
    }

    args.extend(["-c:v".into(), "copy".into()]);
    args.extend(params.to_ffmpeg_args());
    args.extend(["-shortest".into(), output.display().to_string()]);

    run_ffmpeg(&args).await?;
    info!(video = %video.display(), bgm = %bgm.display(), "added BGM");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_mix_filter_delays_and_volumes() {
        let tracks: Vec<AudioTrack> =
            vec![("a.wav".into(), 0.0, 1.0), ("b.wav".into(), 1.5, 0.5)];
        let filter = build_mix_filter(&tracks);
        assert!(filter.starts_with("[0:a]volume=1,adelay=0:all=1[a0];"));
        assert!(filter.contains("[1:a]volume=0.5,adelay=1500:all=1[a1]"));
        assert!(filter.ends_with("[a0][a1]amix=inputs=2:dropout_transition=0[aout]"));
    }

    #[test]
    fn test_build_mix_filter_single_track() {
        let tracks: Vec<AudioTrack> = vec![("solo.wav".into(), 0.25, 0.8)];
        let filter = build_mix_filter(&tracks);
        assert!(filter.contains("adelay=250:all=1"));
        assert!(filter.contains("amix=inputs=1"));
    }
}
