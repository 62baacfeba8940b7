use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use crate::error::{RenderError, RenderResult};

/// Completed ffmpeg/ffprobe invocation.
#[derive(Debug)]
pub struct FfmpegOutput {
    pub stdout: String,
    pub stderr: String,
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok()?.parse::<f64>().ok().filter(|v| *v > 0.0)
}

/// Run ffmpeg/ffprobe asynchronously with timeout management.
///
/// The timeout comes from `FFMPEG_RUN_TIMEOUT_SEC` (applies to ffmpeg, not
/// ffprobe). On timeout or cancellation the child is terminated, then killed
/// after `FFMPEG_KILL_GRACE_SEC` (default 5s).
pub async fn run_ffmpeg(args: &[String]) -> RenderResult<FfmpegOutput> {
    let exe = args.first().map(String::as_str).unwrap_or("ffmpeg");
    let base = std::path::Path::new(exe)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| exe.to_string());
    let timeout = if base.starts_with("ffmpeg") {
        env_f64("FFMPEG_RUN_TIMEOUT_SEC")
    } else {
        None
    };

    let cmd_str = args.join(" ");
    if std::env::var("FFMPEG_LOG_CMD").as_deref() == Ok("1") {
        info!(command = %cmd_str, "running");
    } else {
        debug!(command = %cmd_str, "running");
    }

    let t0 = Instant::now();
    let mut child = Command::new(exe)
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RenderError::Dependency(format!("{base} not found on PATH"))
            } else {
                RenderError::Io(e)
            }
        })?;

    let mut stdout_pipe = child.stdout.take().expect("stdout piped");
    let mut stderr_pipe = child.stderr.take().expect("stderr piped");
    let drain = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let _ = tokio::join!(
            stdout_pipe.read_to_end(&mut out),
            stderr_pipe.read_to_end(&mut err)
        );
        (out, err)
    };

    let ((out, err), status) = match timeout {
        Some(secs) => {
            let fut = async {
                let io = drain.await;
                let status = child.wait().await;
                (io, status)
            };
            match tokio::time::timeout(Duration::from_secs_f64(secs), fut).await {
                Ok(r) => r,
                Err(_) => {
                    let grace = env_f64("FFMPEG_KILL_GRACE_SEC").unwrap_or(5.0);
                    error!("command timed out after {secs:.1}s; sending terminate");
                    terminate_with_grace(&mut child, grace).await;
                    return Err(RenderError::Timeout(secs));
                }
            }
        }
        None => {
            let io = drain.await;
            let status = child.wait().await;
            (io, status)
        }
    };

    let status = status.map_err(RenderError::Io)?;
    let stdout = String::from_utf8_lossy(&out).to_string();
    let stderr = String::from_utf8_lossy(&err).to_string();

    let code = status.code().unwrap_or(-1);
    debug!(rc = code, elapsed = ?t0.elapsed(), "command finished");

    if !status.success() {
        error!(rc = code, command = %cmd_str, "ffmpeg command failed");
        if !stderr.is_empty() {
            error!("stderr:\n{}", stderr.trim_end());
        }
        return Err(RenderError::Ffmpeg { code, stderr });
    }

    if !stderr.is_empty() {
        debug!("stderr (on success):\n{}", stderr.trim_end());
    }

    Ok(FfmpegOutput { stdout, stderr })
}

async fn terminate_with_grace(child: &mut tokio::process::Child, grace: f64) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SIGTERM first so ffmpeg can flush its output file.
            let _ = std::process::Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .status();
            if tokio::time::timeout(Duration::from_secs_f64(grace.max(0.1)), child.wait())
                .await
                .is_ok()
            {
                return;
            }
            warn!("process did not terminate in {grace:.1}s; killing");
        }
    }
    let _ = child.kill().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_dependency_error() {
        let args: Vec<String> = vec!["ffmpeg-definitely-not-installed".into(), "-version".into()];
        let err = run_ffmpeg(&args).await.unwrap_err();
        assert!(matches!(err, RenderError::Dependency(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_captures_stderr() {
        // `false` exits 1 with no output; sh lets us emit stderr too.
        let args: Vec<String> = vec![
            "sh".into(),
            "-c".into(),
            "echo boom >&2; exit 3".into(),
        ];
        let err = run_ffmpeg(&args).await.unwrap_err();
        match err {
            RenderError::Ffmpeg { code, stderr } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_captures_stdout() {
        let args: Vec<String> = vec!["sh".into(), "-c".into(), "echo hello".into()];
        let out = run_ffmpeg(&args).await.unwrap();
        assert_eq!(out.stdout.trim(), "hello");
    }
}
