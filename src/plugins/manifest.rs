use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

/// Where a plugin came from; later sources override earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PluginSource {
    Builtin,
    Package,
    User,
}

impl PluginSource {
    pub fn priority(&self) -> u8 {
        match self {
            Self::Builtin => 1,
            Self::Package => 2,
            Self::User => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Builtin => "builtin",
            Self::Package => "package",
            Self::User => "user",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginKind {
    Overlay,
    Subtitle,
    Audio,
    Transition,
}

impl PluginKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "overlay" => Some(Self::Overlay),
            "subtitle" => Some(Self::Subtitle),
            "audio" => Some(Self::Audio),
            "transition" => Some(Self::Transition),
            _ => None,
        }
    }
}

/// A declarative effect definition from an external plugin: a filter
/// template with `{param}` placeholders and default values.
#[derive(Debug, Clone)]
pub struct EffectTemplate {
    pub template: String,
    pub defaults: BTreeMap<String, Value>,
    pub aliases: Vec<String>,
}

/// Validated plugin manifest (`plugin.yaml`).
#[derive(Debug, Clone)]
pub struct PluginManifest {
    pub plugin_id: String,
    pub version: String,
    pub kind: PluginKind,
    pub provides: Vec<String>,
    pub enabled: bool,
    pub description: Option<String>,
    pub effects: BTreeMap<String, EffectTemplate>,
    pub source: PluginSource,
    pub base_path: PathBuf,
}

const ALLOWED_KEYS: &[&str] = &[
    "id",
    "version",
    "kind",
    "provides",
    "enabled",
    "description",
    "defaults",
    "effects",
    "capabilities",
    "compat",
];

// Filter templates run inside our ffmpeg invocation; these tokens would let
// a manifest reach outside the filter graph.
const FORBIDDEN_TEMPLATE_TOKENS: &[&str] = &["movie=", "amovie=", "sendcmd", "system"];

/// Parse and validate a raw manifest mapping. Returns `None` (with a log
/// line) on any violation; a bad plugin never aborts the run.
pub fn parse_manifest(
    raw: &serde_yml::Value,
    source: PluginSource,
    base_path: &Path,
) -> Option<PluginManifest> {
    let map = raw.as_mapping()?;

    for key in map.keys() {
        let key_str = key.as_str().unwrap_or_default();
        if !ALLOWED_KEYS.contains(&key_str) {
            warn!(
                "plugin manifest at {} has unknown key '{key_str}'; rejecting",
                base_path.display()
            );
            return None;
        }
    }

    let plugin_id = raw.get("id")?.as_str()?.trim().to_string();
    let version = raw.get("version")?.as_str()?.trim().to_string();
    if plugin_id.is_empty() || version.is_empty() {
        return None;
    }
    let kind = PluginKind::parse(raw.get("kind")?.as_str()?)?;

    let provides: Vec<String> = match raw.get("provides") {
        None => vec![plugin_id.clone()],
        Some(serde_yml::Value::String(s)) => vec![s.trim().to_string()],
        Some(serde_yml::Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(_) => return None,
    };
    if provides.is_empty() {
        return None;
    }

    let enabled = raw.get("enabled").and_then(|v| v.as_bool()).unwrap_or(true);
    let description = raw
        .get("description")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let mut effects = BTreeMap::new();
    if let Some(serde_yml::Value::Mapping(effect_map)) = raw.get("effects") {
        for (name, body) in effect_map {
            let Some(name) = name.as_str() else { continue };
            let Some(template) = parse_effect_template(body, base_path) else {
                return None;
            };
            effects.insert(name.to_string(), template);
        }
    }

    Some(PluginManifest {
        plugin_id,
        version,
        kind,
        provides,
        enabled,
        description,
        effects,
        source,
        base_path: base_path.to_path_buf(),
    })
}

fn parse_effect_template(body: &serde_yml::Value, base_path: &Path) -> Option<EffectTemplate> {
    let template = body.get("template")?.as_str()?.to_string();
    let lowered = template.to_lowercase();
    for token in FORBIDDEN_TEMPLATE_TOKENS {
        if lowered.contains(token) {
            warn!(
                "plugin at {} uses forbidden template token '{token}'; rejecting",
                base_path.display()
            );
            return None;
        }
    }

    let mut defaults = BTreeMap::new();
    if let Some(serde_yml::Value::Mapping(map)) = body.get("defaults") {
        for (k, v) in map {
            if let (Some(k), Ok(v)) = (k.as_str(), serde_yml::from_value::<Value>(v.clone())) {
                defaults.insert(k.to_string(), v);
            }
        }
    }

    let aliases = match body.get("aliases") {
        Some(serde_yml::Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };

    Some(EffectTemplate {
        template,
        defaults,
        aliases,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Option<PluginManifest> {
        let raw: serde_yml::Value = serde_yml::from_str(yaml).unwrap();
        parse_manifest(&raw, PluginSource::User, Path::new("/plugins/test"))
    }

    #[test]
    fn test_valid_manifest() {
        let m = parse(
            r#"
id: my_blur
version: "1.2.0"
kind: overlay
provides: [blur]
effects:
  blur:
    template: "gblur=sigma={sigma}"
    defaults: {sigma: 8}
    aliases: [gblur]
"#,
        )
        .unwrap();
        assert_eq!(m.plugin_id, "my_blur");
        assert_eq!(m.provides, vec!["blur"]);
        assert!(m.enabled);
        let eff = &m.effects["blur"];
        assert_eq!(eff.template, "gblur=sigma={sigma}");
        assert_eq!(eff.aliases, vec!["gblur"]);
        assert_eq!(eff.defaults["sigma"].as_i64(), Some(8));
    }

    #[test]
    fn test_unknown_key_rejects() {
        assert!(parse(
            r#"
id: x
version: "1"
kind: overlay
run_command: "curl evil"
"#
        )
        .is_none());
    }

    #[test]
    fn test_missing_required_fields_reject() {
        assert!(parse("id: x\nkind: overlay\n").is_none());
        assert!(parse("version: \"1\"\nkind: overlay\n").is_none());
        assert!(parse("id: x\nversion: \"1\"\nkind: sorcery\n").is_none());
    }

    #[test]
    fn test_provides_defaults_to_id() {
        let m = parse("id: vignette\nversion: \"1\"\nkind: overlay\n").unwrap();
        assert_eq!(m.provides, vec!["vignette"]);
    }

    #[test]
    fn test_forbidden_template_token_rejects() {
        assert!(parse(
            r#"
id: x
version: "1"
kind: overlay
effects:
  x:
    template: "movie=/etc/passwd"
"#
        )
        .is_none());
    }

    #[test]
    fn test_source_priority_order() {
        assert!(PluginSource::User.priority() > PluginSource::Package.priority());
        assert!(PluginSource::Package.priority() > PluginSource::Builtin.priority());
    }
}
