use std::collections::BTreeMap;
use std::f64::consts::PI;

use serde_json::Value;
use tracing::debug;

use crate::config::EffectSpec;

type Params = BTreeMap<String, Value>;

/// Result of resolving character effects: overlay x/y overrides plus any
/// extra filter statements they need.
#[derive(Debug, Clone, Default)]
pub struct CharEffectResult {
    pub filter_chain: Vec<String>,
    pub x_expr: Option<String>,
    pub y_expr: Option<String>,
    pub dynamic: bool,
}

/// A pad+crop snippet rewriting a full stream (background or screen shake).
#[derive(Debug, Clone)]
pub struct StreamEffectResult {
    pub filter_chain: Vec<String>,
    pub output_label: String,
    pub dynamic: bool,
}

fn param_f64(params: &Params, keys: &[&str], default: f64) -> f64 {
    for key in keys {
        if let Some(v) = params.get(*key) {
            if let Some(n) = v.as_f64() {
                return n;
            }
        }
    }
    default
}

/// Amplitude may be a scalar or `{x:…, y:…}` / `{horizontal:…, vertical:…}`.
fn amplitudes(params: &Params, default: f64) -> (f64, f64) {
    match params.get("amplitude") {
        Some(Value::Object(map)) => {
            let ax = map
                .get("x")
                .or_else(|| map.get("horizontal"))
                .and_then(Value::as_f64)
                .unwrap_or(default);
            let ay = map
                .get("y")
                .or_else(|| map.get("vertical"))
                .and_then(Value::as_f64)
                .unwrap_or(ax);
            (ax.abs(), ay.abs())
        }
        Some(v) => {
            let a = v.as_f64().unwrap_or(default).abs();
            (a, a)
        }
        None => (default.abs(), default.abs()),
    }
}

fn frequency(params: &Params, default: f64) -> f64 {
    let f = param_f64(params, &["freq", "frequency"], default);
    if f <= 0.0 {
        default
    } else {
        f
    }
}

fn offsets(params: &Params) -> (f64, f64) {
    match params.get("offset") {
        Some(Value::Object(map)) => (
            map.get("x").and_then(Value::as_f64).unwrap_or(0.0),
            map.get("y").and_then(Value::as_f64).unwrap_or(0.0),
        ),
        _ => (0.0, 0.0),
    }
}

fn phase_shift(params: &Params, default: f64) -> f64 {
    if let Some(v) = params.get("phase_offset").and_then(Value::as_f64) {
        return v;
    }
    if let Some(deg) = params.get("phase_offset_deg").and_then(Value::as_f64) {
        return deg.to_radians();
    }
    default
}

fn easing(params: &Params, default: &str) -> (String, f64) {
    let mut kind = default.to_string();
    let mut power = 1.0;
    match params.get("easing") {
        Some(Value::String(s)) => {
            let s = s.trim().to_lowercase();
            if !s.is_empty() {
                kind = s;
            }
        }
        Some(Value::Object(map)) => {
            if let Some(s) = map.get("type").and_then(Value::as_str) {
                kind = s.trim().to_lowercase();
            }
            power = map.get("power").and_then(Value::as_f64).unwrap_or(1.0);
        }
        _ => {}
    }
    (kind, power.clamp(0.1, 6.0))
}

/// Time-dependent envelope over the clip duration.
fn envelope_expr(duration: f64, kind: &str, power: f64) -> String {
    let duration = duration.max(0.001);
    let progress = format!("min(max(t/{duration:.6},0),1)");
    match kind {
        "constant" => "1".to_string(),
        "linear" | "ease_out" | "ease_out_linear" => format!("pow(1-{progress},{power})"),
        "ease_in" | "ease_in_linear" => format!("pow({progress},{power})"),
        _ if power == 1.0 => format!("sin({progress}*PI)"),
        _ => format!("pow(sin({progress}*PI),{power})"),
    }
}

fn escape_commas(expr: &str) -> String {
    expr.replace(',', "\\,")
}

// ---------------------------------------------------------------------------
// Character effects
// ---------------------------------------------------------------------------

/// Apply `char:*` effects to the overlay position expressions.
pub fn resolve_character_effects(
    effects: &[EffectSpec],
    base_x: &str,
    base_y: &str,
    duration: f64,
) -> Option<CharEffectResult> {
    if effects.is_empty() {
        return None;
    }

    let mut current_x = base_x.to_string();
    let mut current_y = base_y.to_string();
    let mut dynamic = false;

    for spec in effects {
        let Some((effect_type, params)) = spec.normalized() else {
            continue;
        };
        match effect_type.as_str() {
            "char:shake_char" => {
                let (ax, ay) = amplitudes(&params, 18.0);
                let freq = frequency(&params, 8.0);
                let (kind, power) = easing(&params, "ease_in_out");
                let env = envelope_expr(duration, &kind, power);
                let omega = 2.0 * PI * freq;
                let phase = phase_shift(&params, PI / 2.0);
                let (ox, oy) = offsets(&params);
                current_x = format!(
                    "({current_x})+({ox:.6})+({ax:.6}*{env}*sin({omega:.6}*t))"
                );
                current_y = format!(
                    "({current_y})+({oy:.6})+({ay:.6}*{env}*sin({omega:.6}*t+{phase:.6}))"
                );
                dynamic = dynamic || ax > 0.0 || ay > 0.0;
            }
            "char:bob_char" => {
                let (_, ay) = amplitudes(&params, 12.0);
                let freq = frequency(&params, 1.2);
                let (kind, power) = easing(&params, "constant");
                let env = envelope_expr(duration, &kind, power);
                let omega = 2.0 * PI * freq;
                let phase = phase_shift(&params, 0.0);
                let (_, oy) = offsets(&params);
                current_y = format!(
                    "({current_y})+({oy:.6})+({ay:.6}*{env}*sin({omega:.6}*t+{phase:.6}))"
                );
                dynamic = dynamic || ay > 0.0;
            }
            "char:sway_char" => {
                let (ax, _) = amplitudes(&params, 16.0);
                let freq = frequency(&params, 1.0);
                let (kind, power) = easing(&params, "constant");
                let env = envelope_expr(duration, &kind, power);
                let omega = 2.0 * PI * freq;
                let phase = phase_shift(&params, 0.0);
                let (ox, _) = offsets(&params);
                current_x = format!(
                    "({current_x})+({ox:.6})+({ax:.6}*{env}*sin({omega:.6}*t+{phase:.6}))"
                );
                dynamic = dynamic || ax > 0.0;
            }
            other => {
                debug!("unsupported character effect type: {other}");
            }
        }
    }

    if current_x == base_x && current_y == base_y {
        return None;
    }
    Some(CharEffectResult {
        filter_chain: vec![],
        x_expr: (current_x != base_x).then_some(current_x),
        y_expr: (current_y != base_y).then_some(current_y),
        dynamic,
    })
}

// ---------------------------------------------------------------------------
// Background / screen shake
// ---------------------------------------------------------------------------

struct ShakeSpec {
    pad_x: u32,
    pad_y: u32,
    x_expr: String,
    y_expr: String,
    dynamic: bool,
}

fn build_shake(params: &Params, duration: f64, default_amp: f64, clamp_to: Option<(u32, u32)>) -> Option<ShakeSpec> {
    let (mut ax, mut ay) = amplitudes(params, default_amp);
    if let Some((width, height)) = clamp_to {
        ax = ax.min((width as f64 / 2.0 - 2.0).max(0.0));
        ay = ay.min((height as f64 / 2.0 - 2.0).max(0.0));
    }
    let freq = frequency(params, 8.0);
    let (kind, power) = easing(params, "ease_in_out");
    let env = envelope_expr(duration, &kind, power);
    let phase = phase_shift(params, PI / 2.0);
    let (ox, oy) = offsets(params);
    let dynamic = ax > 0.0 || ay > 0.0;

    if !dynamic && ox.abs() < 1e-6 && oy.abs() < 1e-6 {
        return None;
    }

    let padding = param_f64(params, &["padding"], 0.0).max(0.0);
    let mut pad_x = (ox.abs() + ax + padding).ceil() as u32;
    let mut pad_y = (oy.abs() + ay + padding).ceil() as u32;
    if pad_x == 0 && (ox.abs() > 0.0 || dynamic) {
        pad_x = 1;
    }
    if pad_y == 0 && (oy.abs() > 0.0 || dynamic) {
        pad_y = 1;
    }

    let omega = 2.0 * PI * freq;
    let shift_x = format!("({ox:.6})+({ax:.6}*{env}*sin({omega:.6}*t))");
    let shift_y = format!("({oy:.6})+({ay:.6}*{env}*sin({omega:.6}*t+{phase:.6}))");
    // Crop offsets stay inside the padded frame.
    let x_expr = format!("min(max({pad_x}-({shift_x}),0),{})", pad_x * 2);
    let y_expr = format!("min(max({pad_y}-({shift_y}),0),{})", pad_y * 2);

    Some(ShakeSpec {
        pad_x,
        pad_y,
        x_expr,
        y_expr,
        dynamic,
    })
}

fn shake_filters(
    spec: &ShakeSpec,
    input_label: &str,
    width: u32,
    height: u32,
    id_prefix: &str,
    index: usize,
) -> (Vec<String>, String) {
    let pad_label = format!("[{id_prefix}_pad_{index}]");
    let crop_label = format!("[{id_prefix}_shake_{index}]");
    let pad = format!(
        "{input_label}pad=iw+{}:ih+{}:{}:{}:color=0x00000000{pad_label}",
        spec.pad_x * 2,
        spec.pad_y * 2,
        spec.pad_x,
        spec.pad_y
    );
    let crop = format!(
        "{pad_label}crop={width}:{height}:{}:{}{crop_label}",
        escape_commas(&spec.x_expr),
        escape_commas(&spec.y_expr)
    );
    (vec![pad, crop], crop_label)
}

fn resolve_stream_shake(
    effects: &[EffectSpec],
    wanted_type: &str,
    input_label: &str,
    duration: f64,
    width: u32,
    height: u32,
    id_prefix: &str,
    default_amp: f64,
    clamp: bool,
) -> Option<StreamEffectResult> {
    if effects.is_empty() {
        return None;
    }

    let mut filter_chain: Vec<String> = Vec::new();
    let mut current = input_label.to_string();
    let mut dynamic = false;

    for (index, spec) in effects.iter().enumerate() {
        let Some((effect_type, params)) = spec.normalized() else {
            continue;
        };
        if effect_type != wanted_type {
            debug!("unsupported {id_prefix} effect type: {effect_type}");
            continue;
        }
        let clamp_to = clamp.then_some((width, height));
        let Some(shake) = build_shake(&params, duration, default_amp, clamp_to) else {
            continue;
        };
        let (filters, out) =
            shake_filters(&shake, &current, width, height, id_prefix, index + 1);
        filter_chain.extend(filters);
        current = out;
        dynamic = dynamic || shake.dynamic;
    }

    if current == input_label {
        return None;
    }
    Some(StreamEffectResult {
        filter_chain,
        output_label: current,
        dynamic,
    })
}

/// `bg:shake_bg` effects applied to the fitted background stream.
pub fn resolve_background_effects(
    effects: &[EffectSpec],
    input_label: &str,
    duration: f64,
    width: u32,
    height: u32,
) -> Option<StreamEffectResult> {
    resolve_stream_shake(
        effects,
        "bg:shake_bg",
        input_label,
        duration,
        width,
        height,
        "bg",
        24.0,
        false,
    )
}

/// `screen:shake_screen` effects applied to the final composed stream.
/// Amplitudes are clamped to stay inside the frame.
pub fn resolve_screen_effects(
    effects: &[EffectSpec],
    input_label: &str,
    duration: f64,
    width: u32,
    height: u32,
) -> Option<StreamEffectResult> {
    resolve_stream_shake(
        effects,
        "screen:shake_screen",
        input_label,
        duration,
        width,
        height,
        "screen",
        24.0,
        true,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(entries: &[(&str, Value)]) -> EffectSpec {
        let mut map = BTreeMap::new();
        for (k, v) in entries {
            map.insert(k.to_string(), v.clone());
        }
        EffectSpec::Table(map)
    }

    #[test]
    fn test_envelope_variants() {
        assert_eq!(envelope_expr(2.0, "constant", 1.0), "1");
        assert_eq!(
            envelope_expr(2.0, "ease_in", 2.0),
            "pow(min(max(t/2.000000,0),1),2)"
        );
        assert_eq!(
            envelope_expr(2.0, "linear", 1.0),
            "pow(1-min(max(t/2.000000,0),1),1)"
        );
        assert_eq!(
            envelope_expr(2.0, "ease_in_out", 1.0),
            "sin(min(max(t/2.000000,0),1)*PI)"
        );
        assert_eq!(
            envelope_expr(2.0, "ease_in_out", 2.0),
            "pow(sin(min(max(t/2.000000,0),1)*PI),2)"
        );
    }

    #[test]
    fn test_envelope_guards_zero_duration() {
        assert!(envelope_expr(0.0, "ease_in", 1.0).contains("t/0.001000"));
    }

    #[test]
    fn test_char_shake_rewrites_both_axes() {
        let spec = table(&[
            ("type", json!("char:shake_char")),
            ("amplitude", json!(10)),
            ("freq", json!(2.0)),
        ]);
        let result = resolve_character_effects(&[spec], "(W-w)/2", "H-h", 3.0).unwrap();
        let x = result.x_expr.unwrap();
        let y = result.y_expr.unwrap();
        assert!(x.starts_with("((W-w)/2)"));
        assert!(x.contains("10.000000"));
        assert!(x.contains("sin(12.566371*t)"));
        // y axis carries the default pi/2 phase offset
        assert!(y.contains("+1.570796"));
        assert!(result.dynamic);
    }

    #[test]
    fn test_char_bob_touches_only_y() {
        let spec = table(&[("type", json!("char:bob_char")), ("amplitude", json!(6))]);
        let result = resolve_character_effects(&[spec], "0", "100", 2.0).unwrap();
        assert!(result.x_expr.is_none());
        assert!(result.y_expr.is_some());
    }

    #[test]
    fn test_char_sway_touches_only_x() {
        let spec = table(&[("type", json!("char:sway_char"))]);
        let result = resolve_character_effects(&[spec], "0", "100", 2.0).unwrap();
        assert!(result.x_expr.is_some());
        assert!(result.y_expr.is_none());
    }

    #[test]
    fn test_unknown_character_effect_is_skipped() {
        let spec = EffectSpec::Name("char:explode".into());
        assert!(resolve_character_effects(&[spec], "0", "0", 1.0).is_none());
    }

    #[test]
    fn test_per_axis_amplitude() {
        let spec = table(&[
            ("type", json!("char:shake_char")),
            ("amplitude", json!({"x": 4, "y": 9})),
        ]);
        let result = resolve_character_effects(&[spec], "0", "0", 1.0).unwrap();
        assert!(result.x_expr.unwrap().contains("4.000000"));
        assert!(result.y_expr.unwrap().contains("9.000000"));
    }

    #[test]
    fn test_background_shake_pads_then_crops() {
        let spec = table(&[
            ("type", json!("bg:shake_bg")),
            ("amplitude", json!(12)),
            ("padding", json!(2)),
        ]);
        let result =
            resolve_background_effects(&[spec], "[bg]", 2.0, 1920, 1080, ).unwrap();
        assert_eq!(result.filter_chain.len(), 2);
        // 12 + 2 padding = 14 per side
        assert!(result.filter_chain[0].contains("pad=iw+28:ih+28:14:14"));
        assert!(result.filter_chain[0].starts_with("[bg]"));
        assert!(result.filter_chain[1].contains("crop=1920:1080:"));
        assert_eq!(result.output_label, "[bg_shake_1]");
        assert!(result.dynamic);
    }

    #[test]
    fn test_screen_shake_amplitude_clamped() {
        let spec = table(&[
            ("type", json!("screen:shake_screen")),
            ("amplitude", json!(10000)),
        ]);
        let result = resolve_screen_effects(&[spec], "[v]", 2.0, 640, 480).unwrap();
        // clamped to width/2-2 = 318, height/2-2 = 238
        assert!(result.filter_chain[0].contains("pad=iw+636:ih+476:318:238"));
    }

    #[test]
    fn test_zero_amplitude_no_offset_is_noop() {
        let spec = table(&[
            ("type", json!("bg:shake_bg")),
            ("amplitude", json!(0)),
        ]);
        assert!(resolve_background_effects(&[spec], "[bg]", 2.0, 1920, 1080).is_none());
    }

    #[test]
    fn test_crop_exprs_escape_commas() {
        let spec = table(&[("type", json!("screen:shake_screen")), ("amplitude", json!(8))]);
        let result = resolve_screen_effects(&[spec], "[v]", 1.0, 1280, 720).unwrap();
        let crop = &result.filter_chain[1];
        assert!(crop.contains("\\,"));
    }
}
