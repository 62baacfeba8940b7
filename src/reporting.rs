use std::collections::BTreeMap;
use std::path::Path;

use tracing::info;

use crate::error::{RenderError, RenderResult};
use crate::tts::{SpeakerStyle, TtsClient};

/// Markdown report of every speaker style the run synthesized with,
/// resolved against the engine's speaker catalogue.
pub async fn write_voice_report(
    used_voices: &[(u32, String)],
    client: &TtsClient,
    output: &Path,
) -> RenderResult<()> {
    let catalogue = client.speakers().await.unwrap_or_default();
    let by_id: BTreeMap<u32, &SpeakerStyle> =
        catalogue.iter().map(|s| (s.id, s)).collect();

    // Unique speaker ids, known ones first, then by name/id.
    let mut entries: BTreeMap<u32, Option<&SpeakerStyle>> = BTreeMap::new();
    for (speaker_id, _) in used_voices {
        entries.insert(*speaker_id, by_id.get(speaker_id).copied());
    }

    let mut known: Vec<(&SpeakerStyle, u32)> = Vec::new();
    let mut unknown: Vec<u32> = Vec::new();
    for (id, style) in &entries {
        match style {
            Some(style) => known.push((style, *id)),
            None => unknown.push(*id),
        }
    }
    known.sort_by(|a, b| (&a.0.speaker_name, a.1).cmp(&(&b.0.speaker_name, b.1)));

    let mut out = String::from("# Voice usage report\n\n---\n");
    for (style, _) in &known {
        out.push_str(&format!(
            "* VOICEVOX: {} - {}\n",
            style.speaker_name, style.style_name
        ));
    }
    for id in &unknown {
        out.push_str(&format!("* Unknown speaker id: {id}\n"));
    }

    std::fs::write(output, out).map_err(RenderError::Io)?;
    info!(path = %output.display(), "wrote voice usage report");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_report_lists_unknown_ids_when_engine_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("voices.md");
        // Port 9 is discard; the speakers call fails fast and every id is
        // reported as unknown.
        let client = TtsClient::new("http://127.0.0.1:9");
        let used = vec![(3, "hello".to_string()), (3, "again".to_string()), (7, "x".to_string())];
        write_voice_report(&used, &client, &output).await.unwrap();
        let content = std::fs::read_to_string(&output).unwrap();
        assert!(content.contains("* Unknown speaker id: 3"));
        assert!(content.contains("* Unknown speaker id: 7"));
        // deduplicated
        assert_eq!(content.matches("speaker id: 3").count(), 1);
    }
}
