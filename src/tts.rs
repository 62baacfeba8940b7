use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{RenderError, RenderResult};

const MAX_ATTEMPTS: u32 = 5;
const BACKOFF_MIN_SECS: f64 = 4.0;
const BACKOFF_MAX_SECS: f64 = 10.0;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// VOICEVOX-protocol speech synthesis client.
///
/// Synthesis is two HTTP calls: `POST /audio_query` returns a JSON query,
/// whose `speedScale`/`pitchScale` are mutated, then `POST /synthesis` with
/// the query body returns WAV bytes. Blocking HTTP runs on the blocking pool.
#[derive(Debug, Clone)]
pub struct TtsClient {
    base_url: String,
}

impl TtsClient {
    /// `VOICEVOX_URL` overrides the configured engine URL.
    pub fn new(configured_url: &str) -> Self {
        let base_url = std::env::var("VOICEVOX_URL")
            .ok()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| configured_url.to_string());
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Synthesize `text` to a WAV at `output`. Retries transient failures
    /// with exponential backoff (5 attempts, 4-10s waits).
    pub async fn synthesize(
        &self,
        text: &str,
        speaker: u32,
        speed: f64,
        pitch: f64,
        output: &Path,
    ) -> RenderResult<()> {
        let base_url = self.base_url.clone();
        let text = text.to_string();
        let output: PathBuf = output.to_path_buf();

        let mut last_err: Option<RenderError> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let base_url = base_url.clone();
            let text = text.clone();
            let output = output.clone();
            let result = tokio::task::spawn_blocking(move || {
                synthesize_blocking(&base_url, &text, speaker, speed, pitch, &output)
            })
            .await
            .map_err(|e| RenderError::Tts(format!("synthesis task failed: {e}")))?;

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let wait = backoff_secs(attempt);
                    if attempt < MAX_ATTEMPTS {
                        warn!(
                            attempt,
                            "TTS request failed ({e}); retrying in {wait:.0}s"
                        );
                        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RenderError::Tts("synthesis failed".into())))
    }

    /// Fetch the speaker catalogue: `style id -> (style name, speaker name)`.
    pub async fn speakers(&self) -> RenderResult<Vec<SpeakerStyle>> {
        let base_url = self.base_url.clone();
        tokio::task::spawn_blocking(move || speakers_blocking(&base_url))
            .await
            .map_err(|e| RenderError::Tts(format!("speakers task failed: {e}")))?
    }
}

#[derive(Debug, Clone)]
pub struct SpeakerStyle {
    pub id: u32,
    pub style_name: String,
    pub speaker_name: String,
}

/// Exponential backoff clamped to the 4-10s band.
fn backoff_secs(attempt: u32) -> f64 {
    let raw = BACKOFF_MIN_SECS * 2.0_f64.powi(attempt.saturating_sub(1) as i32);
    raw.clamp(BACKOFF_MIN_SECS, BACKOFF_MAX_SECS)
}

fn synthesize_blocking(
    base_url: &str,
    text: &str,
    speaker: u32,
    speed: f64,
    pitch: f64,
    output: &Path,
) -> RenderResult<()> {
    let query_url = format!(
        "{base_url}/audio_query?text={}&speaker={speaker}",
        urlencode(text)
    );
    let query_raw = ureq::post(&query_url)
        .config()
        .timeout_global(Some(REQUEST_TIMEOUT))
        .build()
        .send_empty()
        .map_err(|e| RenderError::Tts(format!("audio_query failed: {e}")))?
        .body_mut()
        .read_to_string()
        .map_err(|e| RenderError::Tts(format!("failed to read audio_query body: {e}")))?;
    let mut query: serde_json::Value = serde_json::from_str(&query_raw)
        .map_err(|e| RenderError::Tts(format!("audio_query returned invalid JSON: {e}")))?;

    query["speedScale"] = serde_json::json!(speed);
    query["pitchScale"] = serde_json::json!(pitch);

    let synth_url = format!("{base_url}/synthesis?speaker={speaker}");
    let mut response = ureq::post(&synth_url)
        .config()
        .timeout_global(Some(REQUEST_TIMEOUT))
        .build()
        .header("Content-Type", "application/json")
        .send(query.to_string().as_bytes())
        .map_err(|e| RenderError::Tts(format!("synthesis failed: {e}")))?;

    let wav = response
        .body_mut()
        .read_to_vec()
        .map_err(|e| RenderError::Tts(format!("failed to read synthesis body: {e}")))?;
    if wav.is_empty() {
        return Err(RenderError::Tts("synthesis returned no audio".into()));
    }
    std::fs::write(output, &wav)?;
    info!(
        speaker,
        bytes = wav.len(),
        "synthesized '{}...'",
        text.chars().take(20).collect::<String>()
    );
    Ok(())
}

fn speakers_blocking(base_url: &str) -> RenderResult<Vec<SpeakerStyle>> {
    let url = format!("{base_url}/speakers");
    let raw = ureq::get(&url)
        .config()
        .timeout_global(Some(REQUEST_TIMEOUT))
        .build()
        .call()
        .map_err(|e| RenderError::Tts(format!("speakers query failed: {e}")))?
        .body_mut()
        .read_to_string()
        .map_err(|e| RenderError::Tts(format!("failed to read speakers body: {e}")))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .map_err(|e| RenderError::Tts(format!("speakers returned invalid JSON: {e}")))?;

    let mut styles = Vec::new();
    for group in value.as_array().into_iter().flatten() {
        let speaker_name = group["name"].as_str().unwrap_or("unknown").to_string();
        for style in group["styles"].as_array().into_iter().flatten() {
            if let Some(id) = style["id"].as_u64() {
                styles.push(SpeakerStyle {
                    id: id as u32,
                    style_name: style["name"].as_str().unwrap_or("").to_string(),
                    speaker_name: speaker_name.clone(),
                });
            }
        }
    }
    Ok(styles)
}

/// Percent-encode for a query component.
fn urlencode(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 3);
    for byte in text.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char)
            }
            _ => {
                use std::fmt::Write;
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_band() {
        assert_eq!(backoff_secs(1), 4.0);
        assert_eq!(backoff_secs(2), 8.0);
        assert_eq!(backoff_secs(3), 10.0);
        assert_eq!(backoff_secs(5), 10.0);
    }

    #[test]
    fn test_urlencode() {
        assert_eq!(urlencode("abc-123"), "abc-123");
        assert_eq!(urlencode("a b"), "a%20b");
        assert_eq!(urlencode("こん"), "%E3%81%93%E3%82%93");
    }

    #[test]
    fn test_env_overrides_configured_url() {
        // Can't mutate env safely across parallel tests; exercise the
        // fallback path instead.
        if std::env::var("VOICEVOX_URL").is_err() {
            let client = TtsClient::new("http://host:50021");
            assert_eq!(client.base_url(), "http://host:50021");
        }
    }

    #[test]
    fn test_speaker_catalogue_parse_shape() {
        let raw = serde_json::json!([
            {"name": "ずんだもん", "styles": [
                {"id": 3, "name": "ノーマル"},
                {"id": 1, "name": "あまあま"}
            ]}
        ]);
        // Re-run the extraction logic inline to pin the shape we consume.
        let mut ids = Vec::new();
        for group in raw.as_array().into_iter().flatten() {
            for style in group["styles"].as_array().into_iter().flatten() {
                ids.push(style["id"].as_u64().unwrap());
            }
        }
        assert_eq!(ids, vec![3, 1]);
    }
}
