use serde::{Deserialize, Serialize};

/// How a background is fitted into the target frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundFit {
    #[default]
    Stretch,
    Contain,
    Cover,
    FitWidth,
    FitHeight,
}

impl BackgroundFit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stretch => "stretch",
            Self::Contain => "contain",
            Self::Cover => "cover",
            Self::FitWidth => "fit_width",
            Self::FitHeight => "fit_height",
        }
    }
}

/// 9-way anchor for overlays and background placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    TopLeft,
    TopCenter,
    TopRight,
    MiddleLeft,
    MiddleCenter,
    MiddleRight,
    BottomLeft,
    #[default]
    BottomCenter,
    BottomRight,
}

impl Anchor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TopLeft => "top_left",
            Self::TopCenter => "top_center",
            Self::TopRight => "top_right",
            Self::MiddleLeft => "middle_left",
            Self::MiddleCenter => "middle_center",
            Self::MiddleRight => "middle_right",
            Self::BottomLeft => "bottom_left",
            Self::BottomCenter => "bottom_center",
            Self::BottomRight => "bottom_right",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "top_left" => Some(Self::TopLeft),
            "top_center" => Some(Self::TopCenter),
            "top_right" => Some(Self::TopRight),
            "middle_left" => Some(Self::MiddleLeft),
            "middle_center" => Some(Self::MiddleCenter),
            "middle_right" => Some(Self::MiddleRight),
            "bottom_left" => Some(Self::BottomLeft),
            "bottom_center" => Some(Self::BottomCenter),
            "bottom_right" => Some(Self::BottomRight),
            _ => None,
        }
    }
}

/// Overlay position expressions for an anchor plus offsets. The container and
/// content dimensions are expression fragments (`"W"`/`"H"`/`"w"`/`"h"`,
/// `"iw"`, a literal number, ...), so the same math serves overlay x/y, pad
/// x/y and crop x/y.
pub fn overlay_position_exprs(
    bg_w: &str,
    bg_h: &str,
    fg_w: &str,
    fg_h: &str,
    anchor: Anchor,
    offset_x: &str,
    offset_y: &str,
) -> (String, String) {
    let center_x = format!("({bg_w}-{fg_w})/2");
    let right_x = format!("{bg_w}-{fg_w}");
    let middle_y = format!("({bg_h}-{fg_h})/2");
    let bottom_y = format!("{bg_h}-{fg_h}");

    let (x, y) = match anchor {
        Anchor::TopLeft => ("0".to_string(), "0".to_string()),
        Anchor::TopCenter => (center_x, "0".to_string()),
        Anchor::TopRight => (right_x, "0".to_string()),
        Anchor::MiddleLeft => ("0".to_string(), middle_y),
        Anchor::MiddleCenter => (center_x, middle_y),
        Anchor::MiddleRight => (right_x, middle_y),
        Anchor::BottomLeft => ("0".to_string(), bottom_y),
        Anchor::BottomCenter => (center_x, bottom_y),
        Anchor::BottomRight => (right_x, bottom_y),
    };

    let with_offset = |base: String, off: &str| -> String {
        if off.trim().is_empty() || off == "0" {
            base
        } else if base == "0" {
            format!("({off})")
        } else {
            format!("{base}+({off})")
        }
    };

    (with_offset(x, offset_x), with_offset(y, offset_y))
}

/// Numeric anchor placement for a known content size; used to pin face
/// animation overlays onto their base character.
#[allow(clippy::too_many_arguments)]
pub fn overlay_position_numeric(
    bg_w: f64,
    bg_h: f64,
    fg_w: f64,
    fg_h: f64,
    anchor: Anchor,
    offset_x: f64,
    offset_y: f64,
) -> (i64, i64) {
    let (x, y) = match anchor {
        Anchor::TopLeft => (0.0, 0.0),
        Anchor::TopCenter => ((bg_w - fg_w) / 2.0, 0.0),
        Anchor::TopRight => (bg_w - fg_w, 0.0),
        Anchor::MiddleLeft => (0.0, (bg_h - fg_h) / 2.0),
        Anchor::MiddleCenter => ((bg_w - fg_w) / 2.0, (bg_h - fg_h) / 2.0),
        Anchor::MiddleRight => (bg_w - fg_w, (bg_h - fg_h) / 2.0),
        Anchor::BottomLeft => (0.0, bg_h - fg_h),
        Anchor::BottomCenter => ((bg_w - fg_w) / 2.0, bg_h - fg_h),
        Anchor::BottomRight => (bg_w - fg_w, bg_h - fg_h),
    };
    (
        (x + offset_x).round() as i64,
        (y + offset_y).round() as i64,
    )
}

/// Sequential filters fitting a background into `width`x`height`.
#[allow(clippy::too_many_arguments)]
pub fn background_fit_steps(
    width: u32,
    height: u32,
    fit: BackgroundFit,
    fill_color: &str,
    anchor: Anchor,
    offset_x: &str,
    offset_y: &str,
    scale_flags: &str,
) -> Vec<String> {
    let w = width.to_string();
    let h = height.to_string();
    match fit {
        BackgroundFit::Stretch => {
            vec![format!("scale={width}:{height}:flags={scale_flags}")]
        }
        BackgroundFit::Contain => {
            let (pad_x, pad_y) =
                overlay_position_exprs(&w, &h, "iw", "ih", anchor, offset_x, offset_y);
            vec![
                format!(
                    "scale={width}:{height}:flags={scale_flags}:force_original_aspect_ratio=decrease"
                ),
                format!("pad={width}:{height}:x={pad_x}:y={pad_y}:color={fill_color}"),
            ]
        }
        BackgroundFit::Cover => {
            let (crop_x, crop_y) =
                overlay_position_exprs("iw", "ih", &w, &h, anchor, offset_x, offset_y);
            vec![
                format!(
                    "scale={width}:{height}:flags={scale_flags}:force_original_aspect_ratio=increase"
                ),
                format!("crop={width}:{height}:{crop_x}:{crop_y}"),
            ]
        }
        BackgroundFit::FitWidth => {
            let crop_h = format!("min({height}\\,ih)");
            let (crop_x, crop_y) =
                overlay_position_exprs("iw", "ih", &w, &crop_h, anchor, offset_x, offset_y);
            let (pad_x, pad_y) =
                overlay_position_exprs(&w, &h, "iw", "ih", anchor, offset_x, offset_y);
            vec![
                format!("scale={width}:-2:flags={scale_flags}"),
                format!("crop={width}:{crop_h}:{crop_x}:{crop_y}"),
                format!("pad={width}:{height}:x={pad_x}:y={pad_y}:color={fill_color}"),
            ]
        }
        BackgroundFit::FitHeight => {
            let crop_w = format!("min({width}\\,iw)");
            let (crop_x, crop_y) =
                overlay_position_exprs("iw", "ih", &crop_w, &h, anchor, offset_x, offset_y);
            let (pad_x, pad_y) =
                overlay_position_exprs(&w, &h, "iw", "ih", anchor, offset_x, offset_y);
            vec![
                format!("scale=-2:{height}:flags={scale_flags}"),
                format!("crop={crop_w}:{height}:{crop_x}:{crop_y}"),
                format!("pad={width}:{height}:x={pad_x}:y={pad_y}:color={fill_color}"),
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anchor_parse_all() {
        for name in [
            "top_left",
            "top_center",
            "top_right",
            "middle_left",
            "middle_center",
            "middle_right",
            "bottom_left",
            "bottom_center",
            "bottom_right",
        ] {
            let a = Anchor::parse(name).unwrap();
            assert_eq!(a.as_str(), name);
        }
        assert!(Anchor::parse("center").is_none());
    }

    #[test]
    fn test_overlay_exprs_bottom_center() {
        let (x, y) =
            overlay_position_exprs("W", "H", "w", "h", Anchor::BottomCenter, "0", "-40");
        assert_eq!(x, "(W-w)/2");
        assert_eq!(y, "H-h+(-40)");
    }

    #[test]
    fn test_overlay_exprs_top_left_offsets() {
        let (x, y) = overlay_position_exprs("W", "H", "w", "h", Anchor::TopLeft, "12", "0");
        assert_eq!(x, "(12)");
        assert_eq!(y, "0");
    }

    #[test]
    fn test_numeric_placement_matches_expression_semantics() {
        // 1920x1080 frame, 400x600 character at bottom_center with y offset -20
        let (x, y) = overlay_position_numeric(
            1920.0,
            1080.0,
            400.0,
            600.0,
            Anchor::BottomCenter,
            0.0,
            -20.0,
        );
        assert_eq!(x, 760);
        assert_eq!(y, 460);
    }

    #[test]
    fn test_stretch_is_single_scale() {
        let steps = background_fit_steps(
            1920,
            1080,
            BackgroundFit::Stretch,
            "#000000",
            Anchor::MiddleCenter,
            "0",
            "0",
            "bicubic",
        );
        assert_eq!(steps, vec!["scale=1920:1080:flags=bicubic".to_string()]);
    }

    #[test]
    fn test_contain_scales_then_pads() {
        let steps = background_fit_steps(
            1280,
            720,
            BackgroundFit::Contain,
            "#112233",
            Anchor::MiddleCenter,
            "0",
            "0",
            "bicubic",
        );
        assert_eq!(steps.len(), 2);
        assert!(steps[0].contains("force_original_aspect_ratio=decrease"));
        assert!(steps[1].starts_with("pad=1280:720:x=(1280-iw)/2:y=(720-ih)/2"));
        assert!(steps[1].ends_with("color=#112233"));
    }

    #[test]
    fn test_cover_scales_then_crops() {
        let steps = background_fit_steps(
            1280,
            720,
            BackgroundFit::Cover,
            "#000000",
            Anchor::TopCenter,
            "0",
            "0",
            "bicubic",
        );
        assert_eq!(steps.len(), 2);
        assert!(steps[0].contains("force_original_aspect_ratio=increase"));
        assert_eq!(steps[1], "crop=1280:720:(iw-1280)/2:0");
    }

    #[test]
    fn test_fit_width_has_three_stages() {
        let steps = background_fit_steps(
            1920,
            1080,
            BackgroundFit::FitWidth,
            "#000000",
            Anchor::MiddleCenter,
            "0",
            "0",
            "lanczos",
        );
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], "scale=1920:-2:flags=lanczos");
        assert!(steps[1].starts_with("crop=1920:min(1080\\,ih)"));
        assert!(steps[2].starts_with("pad=1920:1080"));
    }
}
