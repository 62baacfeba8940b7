use crate::config::ReadingDisplay;

/// Split inline reading markup into `(display_text, tts_text)`.
///
/// Two syntaxes are supported:
/// - `[display|reading]`
/// - `display{reading}` where `display` is a run without braces/whitespace
///
/// With `ReadingDisplay::Paren` the display side becomes `display（reading）`.
pub fn parse_reading_markup(text: &str, display: ReadingDisplay) -> (String, String) {
    if text.is_empty() {
        return (String::new(), String::new());
    }
    let (disp, tts) = replace_bracket_markup(text, display);
    let disp = replace_curly_markup(&disp, display, true);
    let tts = replace_curly_markup(&tts, display, false);
    (disp, tts)
}

fn rendered_display(display: ReadingDisplay, d: &str, r: &str) -> String {
    match display {
        ReadingDisplay::Paren => format!("{d}（{r}）"),
        ReadingDisplay::None => d.to_string(),
    }
}

/// Handle `[display|reading]` occurrences, producing both sides at once.
fn replace_bracket_markup(text: &str, display: ReadingDisplay) -> (String, String) {
    let mut disp = String::with_capacity(text.len());
    let mut tts = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '[' {
            // Find a closing bracket with exactly one pipe and no nesting.
            if let Some(rel_end) = chars[i + 1..].iter().position(|&c| c == ']') {
                let inner: String = chars[i + 1..i + 1 + rel_end].iter().collect();
                let parts: Vec<&str> = inner.split('|').collect();
                let valid = parts.len() == 2
                    && !parts[0].is_empty()
                    && !parts[1].is_empty()
                    && !inner.contains('[');
                if valid {
                    disp.push_str(&rendered_display(display, parts[0], parts[1]));
                    tts.push_str(parts[1]);
                    i += rel_end + 2;
                    continue;
                }
            }
        }
        disp.push(chars[i]);
        tts.push(chars[i]);
        i += 1;
    }
    (disp, tts)
}

/// Handle `display{reading}` occurrences on one side of the split.
fn replace_curly_markup(text: &str, display: ReadingDisplay, for_display: bool) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '{' {
            if let Some(rel_end) = chars[i + 1..].iter().position(|&c| c == '}') {
                let reading: String = chars[i + 1..i + 1 + rel_end].iter().collect();
                if !reading.is_empty() && !reading.contains('{') {
                    // Pull the display run back off the output: the longest
                    // trailing run without braces or whitespace.
                    let boundary = out
                        .char_indices()
                        .rev()
                        .take_while(|(_, c)| !c.is_whitespace() && *c != '{' && *c != '}')
                        .map(|(idx, _)| idx)
                        .last();
                    if let Some(start) = boundary {
                        let d = out[start..].to_string();
                        out.truncate(start);
                        if for_display {
                            out.push_str(&rendered_display(display, &d, &reading));
                        } else {
                            out.push_str(&reading);
                        }
                        i += rel_end + 2;
                        continue;
                    }
                }
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// Normalize line-break hints in subtitle text: `\r\n`/`\r`, literal `\n`
/// sequences from YAML, and `<br>` tags all become real newlines.
pub fn normalize_subtitle_text(text: &str) -> String {
    let mut value = text.replace("\r\n", "\n").replace('\r', "\n");
    value = value.replace("\\n", "\n");

    // <br>, <br/>, <BR />
    let mut out = String::with_capacity(value.len());
    let bytes = value.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'<' {
            let rest = &value[i..];
            let lower: String = rest.chars().take(6).collect::<String>().to_lowercase();
            if lower.starts_with("<br") {
                if let Some(end) = rest.find('>') {
                    let tag = &rest[3..end];
                    if tag.trim().is_empty() || tag.trim() == "/" {
                        out.push('\n');
                        i += end + 1;
                        continue;
                    }
                }
            }
        }
        let c = value[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
    }
    out
}

/// Whether the text should produce a subtitle entry: non-empty after
/// normalization, and not just an empty quoted string.
pub fn is_effective_subtitle_text(text: Option<&str>) -> bool {
    let Some(text) = text else {
        return false;
    };
    let normalized = normalize_subtitle_text(text);
    let trimmed = normalized.trim();
    if trimmed.is_empty() || trimmed == "\"\"" || trimmed == "''" {
        return false;
    }
    if trimmed.len() >= 2 {
        let first = trimmed.chars().next().unwrap();
        let last = trimmed.chars().last().unwrap();
        if first == last && (first == '"' || first == '\'') {
            let inner: String = trimmed
                .chars()
                .skip(1)
                .take(trimmed.chars().count().saturating_sub(2))
                .collect();
            if inner.trim().is_empty() {
                return false;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_text_passes_through() {
        let (disp, tts) = parse_reading_markup("こんにちは", ReadingDisplay::None);
        assert_eq!(disp, "こんにちは");
        assert_eq!(tts, "こんにちは");
    }

    #[test]
    fn test_bracket_markup_split() {
        let (disp, tts) = parse_reading_markup("[明日|あした]は晴れ", ReadingDisplay::None);
        assert_eq!(disp, "明日は晴れ");
        assert_eq!(tts, "あしたは晴れ");
    }

    #[test]
    fn test_bracket_markup_paren_display() {
        let (disp, tts) = parse_reading_markup("[明日|あした]", ReadingDisplay::Paren);
        assert_eq!(disp, "明日（あした）");
        assert_eq!(tts, "あした");
    }

    #[test]
    fn test_curly_markup_split() {
        let (disp, tts) = parse_reading_markup("明日{あした}は晴れ", ReadingDisplay::None);
        assert_eq!(disp, "明日は晴れ");
        assert_eq!(tts, "あしたは晴れ");
    }

    #[test]
    fn test_unbalanced_markup_left_alone() {
        let (disp, tts) = parse_reading_markup("a [b c", ReadingDisplay::None);
        assert_eq!(disp, "a [b c");
        assert_eq!(tts, "a [b c");
    }

    #[test]
    fn test_multiple_markups_in_one_line() {
        let (disp, tts) =
            parse_reading_markup("[今日|きょう]と[明日|あした]", ReadingDisplay::None);
        assert_eq!(disp, "今日と明日");
        assert_eq!(tts, "きょうとあした");
    }

    #[test]
    fn test_normalize_line_breaks() {
        assert_eq!(normalize_subtitle_text("a\r\nb"), "a\nb");
        assert_eq!(normalize_subtitle_text("a\\nb"), "a\nb");
        assert_eq!(normalize_subtitle_text("a<br>b"), "a\nb");
        assert_eq!(normalize_subtitle_text("a<BR/>b"), "a\nb");
        assert_eq!(normalize_subtitle_text("a<br />b"), "a\nb");
        assert_eq!(normalize_subtitle_text("a<brX>b"), "a<brX>b");
    }

    #[test]
    fn test_effective_subtitle_text() {
        assert!(is_effective_subtitle_text(Some("hi")));
        assert!(!is_effective_subtitle_text(None));
        assert!(!is_effective_subtitle_text(Some("")));
        assert!(!is_effective_subtitle_text(Some("   ")));
        assert!(!is_effective_subtitle_text(Some("\"\"")));
        assert!(!is_effective_subtitle_text(Some("''")));
        assert!(!is_effective_subtitle_text(Some("\"  \"")));
        assert!(is_effective_subtitle_text(Some("\"quoted\"")));
    }
}
