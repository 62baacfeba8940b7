use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Script not found: {0}")]
    ScriptNotFound(PathBuf),

    #[error("Failed to parse script: {0}")]
    ScriptParse(String),

    #[error("Invalid script: {0}")]
    Validation(String),

    #[error("Missing dependency: {0}")]
    Dependency(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("FFmpeg failed (exit {code}): {stderr}")]
    Ffmpeg { code: i32, stderr: String },

    #[error("Command timed out after {0:.1}s")]
    Timeout(f64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RenderError {
    /// Return an actionable hint for the user, if applicable.
    pub fn hint(&self) -> Option<String> {
        match self {
            RenderError::ScriptNotFound(_) => {
                Some("Check the script path. The first argument must be a YAML screenplay file.".into())
            }
            RenderError::ScriptParse(_) => Some(
                "Check YAML syntax in the screenplay. Keys must be properly indented and values properly quoted.".into(),
            ),
            RenderError::Validation(_) => Some(
                "Each scene needs an 'id' and a 'lines' list; each line is either a talk line with 'text' or a wait line with 'wait'.".into(),
            ),
            RenderError::Dependency(_) => Some(
                "Ensure ffmpeg and ffprobe are installed and on your PATH. Install via: brew install ffmpeg (macOS) or apt install ffmpeg (Linux).".into(),
            ),
            RenderError::Tts(_) => Some(
                "Ensure the VOICEVOX engine is running and reachable. Set VOICEVOX_URL (default http://127.0.0.1:50021) or voice.url in the script.".into(),
            ),
            RenderError::Ffmpeg { .. } => Some(
                "The full ffmpeg stderr is in the log. Re-run with RUST_LOG=debug and FFMPEG_LOG_CMD=1 to see the exact command line.".into(),
            ),
            RenderError::Timeout(_) => Some(
                "Raise FFMPEG_RUN_TIMEOUT_SEC (0 disables the timeout) or lower the clip worker count with --jobs.".into(),
            ),
            _ => None,
        }
    }

    /// Process exit code: 2 for config/dependency problems the user must fix,
    /// 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            RenderError::ScriptNotFound(_)
            | RenderError::ScriptParse(_)
            | RenderError::Validation(_)
            | RenderError::Dependency(_) => 2,
            _ => 1,
        }
    }
}

pub type RenderResult<T> = Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(RenderError::Validation("x".into()).exit_code(), 2);
        assert_eq!(RenderError::Dependency("x".into()).exit_code(), 2);
        assert_eq!(RenderError::Pipeline("x".into()).exit_code(), 1);
        assert_eq!(
            RenderError::Ffmpeg {
                code: 218,
                stderr: String::new()
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_hints_present_for_user_facing_errors() {
        assert!(RenderError::Dependency("ffmpeg".into()).hint().is_some());
        assert!(RenderError::Tts("down".into()).hint().is_some());
        assert!(RenderError::Io(std::io::Error::other("x")).hint().is_none());
    }
}
