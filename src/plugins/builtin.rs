use std::collections::BTreeMap;
use std::f64::consts::PI;

use serde_json::Value;

type Params = BTreeMap<String, Value>;

fn coerce_f64(params: &Params, keys: &[&str], default: f64, min: Option<f64>) -> f64 {
    let mut value = default;
    for key in keys {
        if let Some(v) = params.get(*key).and_then(Value::as_f64) {
            value = v;
            break;
        }
    }
    match min {
        Some(min) => value.max(min),
        None => value,
    }
}

fn coerce_i64(params: &Params, key: &str, default: i64, min: i64) -> i64 {
    params
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or(default)
        .max(min)
}

pub fn build_blur(params: &Params) -> Option<Vec<String>> {
    let sigma = coerce_f64(params, &["sigma", "r"], 10.0, Some(0.0));
    Some(vec![format!("gblur=sigma={sigma:.4}")])
}

pub fn build_vignette(_params: &Params) -> Option<Vec<String>> {
    Some(vec!["vignette".into()])
}

pub fn build_eq(params: &Params) -> Option<Vec<String>> {
    let allowed = [
        "contrast",
        "brightness",
        "saturation",
        "gamma",
        "gamma_r",
        "gamma_g",
        "gamma_b",
    ];
    let parts: Vec<String> = allowed
        .iter()
        .filter_map(|key| {
            params
                .get(*key)
                .and_then(Value::as_f64)
                .map(|v| format!("{key}={v:.6}"))
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(vec![format!("eq={}", parts.join(":"))])
}

pub fn build_hue(params: &Params) -> Option<Vec<String>> {
    let parts: Vec<String> = ["h", "s", "b"]
        .iter()
        .filter_map(|key| {
            params
                .get(*key)
                .and_then(Value::as_f64)
                .map(|v| format!("{key}={v:.6}"))
        })
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(vec![format!("hue={}", parts.join(":"))])
}

pub fn build_curves(params: &Params) -> Option<Vec<String>> {
    let preset = params.get("preset")?.as_str()?.trim();
    if preset.is_empty() {
        return None;
    }
    Some(vec![format!("curves=preset={preset}")])
}

pub fn build_unsharp(params: &Params) -> Option<Vec<String>> {
    let lx = coerce_i64(params, "lx", 5, 0);
    let ly = coerce_i64(params, "ly", 5, 0);
    let la = coerce_f64(params, &["la"], 1.0, Some(0.0));
    let cx = coerce_i64(params, "cx", 5, 0);
    let cy = coerce_i64(params, "cy", 5, 0);
    let ca = coerce_f64(params, &["ca"], 0.0, Some(0.0));
    Some(vec![format!("unsharp={lx}:{ly}:{la}:{cx}:{cy}:{ca}")])
}

pub fn build_lut3d(params: &Params) -> Option<Vec<String>> {
    let file = params.get("file")?.as_str()?.trim();
    if file.is_empty() {
        return None;
    }
    Some(vec![format!("lut3d=file={file}")])
}

pub fn build_rotate(params: &Params) -> Option<Vec<String>> {
    let angle = params
        .get("angle")
        .and_then(Value::as_f64)
        .or_else(|| {
            params
                .get("degrees")
                .and_then(Value::as_f64)
                .map(|deg| deg * PI / 180.0)
        })
        .unwrap_or(0.0);
    let fill = params
        .get("fill")
        .and_then(Value::as_str)
        .unwrap_or("0x00000000");
    Some(vec![format!("rotate={angle:.6}:fillcolor={fill}")])
}

/// `text:bounce_text` — rewrite the subtitle overlay `y` expression with an
/// absolute-sine bounce.
pub fn build_subtitle_bounce(base_y_expr: &str, params: &Params) -> Option<String> {
    let amp = coerce_f64(params, &["amplitude", "amount"], 36.0, None).abs();
    let freq = coerce_f64(params, &["frequency"], 2.0, Some(0.0001));
    let phase = params
        .get("phase_offset")
        .and_then(Value::as_f64)
        .or_else(|| {
            params
                .get("phase_offset_deg")
                .and_then(Value::as_f64)
                .map(f64::to_radians)
        })
        .unwrap_or(0.0);
    let baseline = coerce_f64(params, &["baseline_shift"], 0.0, None);
    let omega = 2.0 * PI * freq;
    Some(format!(
        "({base_y_expr})-(({amp:.6})*abs(sin({omega:.6}*t+{phase:.6})))+({baseline:.6})"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(entries: &[(&str, Value)]) -> Params {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_blur_default_and_param() {
        assert_eq!(build_blur(&params(&[])).unwrap(), vec!["gblur=sigma=10.0000"]);
        assert_eq!(
            build_blur(&params(&[("sigma", json!(0))])).unwrap(),
            vec!["gblur=sigma=0.0000"]
        );
        // negative clamps to zero
        assert_eq!(
            build_blur(&params(&[("sigma", json!(-4))])).unwrap(),
            vec!["gblur=sigma=0.0000"]
        );
    }

    #[test]
    fn test_vignette_stable() {
        assert_eq!(build_vignette(&params(&[])).unwrap(), vec!["vignette"]);
    }

    #[test]
    fn test_eq_requires_params() {
        assert!(build_eq(&params(&[])).is_none());
        let out = build_eq(&params(&[("contrast", json!(1.2)), ("gamma", json!(0.9))])).unwrap();
        assert_eq!(out, vec!["eq=contrast=1.200000:gamma=0.900000"]);
    }

    #[test]
    fn test_hue() {
        let out = build_hue(&params(&[("h", json!(90))])).unwrap();
        assert_eq!(out, vec!["hue=h=90.000000"]);
        assert!(build_hue(&params(&[])).is_none());
    }

    #[test]
    fn test_curves_requires_preset() {
        assert!(build_curves(&params(&[])).is_none());
        let out = build_curves(&params(&[("preset", json!("vintage"))])).unwrap();
        assert_eq!(out, vec!["curves=preset=vintage"]);
    }

    #[test]
    fn test_unsharp_defaults() {
        assert_eq!(
            build_unsharp(&params(&[])).unwrap(),
            vec!["unsharp=5:5:1:5:5:0"]
        );
    }

    #[test]
    fn test_rotate_degrees_converted() {
        let out = build_rotate(&params(&[("degrees", json!(180))])).unwrap();
        assert_eq!(out, vec![format!("rotate={:.6}:fillcolor=0x00000000", PI)]);
    }

    #[test]
    fn test_subtitle_bounce_expression() {
        let y = build_subtitle_bounce("H-h-60", &params(&[("amplitude", json!(20))])).unwrap();
        assert!(y.starts_with("(H-h-60)-((20.000000)*abs(sin("));
        assert!(y.ends_with("+(0.000000)"));
    }
}
