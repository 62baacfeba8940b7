use std::path::Path;

use crate::error::{RenderError, RenderResult};

/// One timeline row. `text` carries the effective subtitle text when the
/// event corresponds to a spoken line.
#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub start_time: f64,
    pub duration: f64,
    pub description: String,
    pub text: Option<String>,
    pub is_scene_change: bool,
}

/// Append-only schedule of everything that happens in the final video.
/// The audio phase appends in line order, so events are already sorted.
#[derive(Debug, Default)]
pub struct Timeline {
    events: Vec<TimelineEvent>,
    current_time: f64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_event(&mut self, description: impl Into<String>, duration: f64, text: Option<String>) {
        self.events.push(TimelineEvent {
            start_time: self.current_time,
            duration,
            description: description.into(),
            text,
            is_scene_change: false,
        });
        self.current_time += duration;
    }

    pub fn add_scene_change(&mut self, scene_id: &str, bg: &str) {
        self.events.push(TimelineEvent {
            start_time: self.current_time,
            duration: 0.0,
            description: format!("Scene Change (Background: {bg})"),
            text: None,
            is_scene_change: true,
        });
        let _ = scene_id;
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn total_duration(&self) -> f64 {
        self.current_time
    }

    pub fn save_as_md(&self, output: &Path) -> RenderResult<()> {
        let mut out = String::from("# Video Timeline\n\n");
        for event in &self.events {
            out.push_str(&format!(
                "- {} - {}\n",
                format_timestamp(event.start_time),
                event.description
            ));
        }
        std::fs::write(output, out).map_err(RenderError::Io)
    }

    pub fn save_as_csv(&self, output: &Path) -> RenderResult<()> {
        let mut out = String::from("start_time,duration,description\n");
        for event in &self.events {
            out.push_str(&format!(
                "{},{},{}\n",
                format_timestamp(event.start_time),
                event.duration,
                csv_quote(&event.description)
            ));
        }
        std::fs::write(output, out).map_err(RenderError::Io)
    }
}

fn format_timestamp(seconds: f64) -> String {
    let total = seconds as u64;
    let s = total % 60;
    let m = (total / 60) % 60;
    let h = total / 3600;
    format!("{h:02}:{m:02}:{s:02}")
}

fn csv_quote(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_accumulate_time() {
        let mut tl = Timeline::new();
        tl.add_scene_change("s1", "bg.png");
        tl.add_event("A: \"hi\"", 2.5, Some("hi".into()));
        tl.add_event("(Wait 1s)", 1.0, None);
        assert_eq!(tl.events().len(), 3);
        assert_eq!(tl.events()[1].start_time, 0.0);
        assert_eq!(tl.events()[2].start_time, 2.5);
        assert_eq!(tl.total_duration(), 3.5);
    }

    #[test]
    fn test_scene_change_has_zero_duration() {
        let mut tl = Timeline::new();
        tl.add_event("x", 2.0, None);
        tl.add_scene_change("s2", "other.png");
        assert_eq!(tl.events()[1].start_time, 2.0);
        assert_eq!(tl.total_duration(), 2.0);
        assert!(tl.events()[1].is_scene_change);
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00:00");
        assert_eq!(format_timestamp(75.0), "00:01:15");
        assert_eq!(format_timestamp(3605.0), "01:00:05");
    }

    #[test]
    fn test_save_md_and_csv() {
        let dir = tempfile::tempdir().unwrap();
        let mut tl = Timeline::new();
        tl.add_event("A: \"hello, world\"", 2.0, None);

        let md = dir.path().join("timeline.md");
        tl.save_as_md(&md).unwrap();
        let content = std::fs::read_to_string(&md).unwrap();
        assert!(content.starts_with("# Video Timeline"));
        assert!(content.contains("- 00:00:00 - A: \"hello, world\""));

        let csv = dir.path().join("timeline.csv");
        tl.save_as_csv(&csv).unwrap();
        let content = std::fs::read_to_string(&csv).unwrap();
        assert!(content.starts_with("start_time,duration,description\n"));
        // comma and quotes force quoting
        assert!(content.contains("\"A: \"\"hello, world\"\"\""));
    }
}
