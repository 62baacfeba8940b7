pub mod builtin;
pub mod manifest;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{EffectSpec, PluginsConfig};
use manifest::{EffectTemplate, PluginKind, PluginManifest, PluginSource};

type Params = BTreeMap<String, Value>;
type NativeBuilder = fn(&Params) -> Option<Vec<String>>;

/// How an effect is produced: a compiled-in builder or a declarative
/// template from an external plugin manifest.
#[derive(Clone)]
enum Builder {
    Native(NativeBuilder),
    Template(EffectTemplate),
}

#[derive(Clone)]
struct EffectEntry {
    canonical: String,
    builder: Builder,
    source: PluginSource,
}

/// Overlay/subtitle effect registry with source-priority resolution
/// (user > package > builtin). Later registrations replace earlier ones only
/// at strictly higher priority.
#[derive(Default)]
pub struct PluginRegistry {
    overlay: HashMap<String, EffectEntry>,
    subtitle: HashMap<String, EffectEntry>,
}

impl PluginRegistry {
    /// Registry preloaded with the builtin effect pack.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        let builtins: &[(&str, &[&str], NativeBuilder)] = &[
            ("blur", &["gblur"], builtin::build_blur),
            ("vignette", &[], builtin::build_vignette),
            ("eq", &[], builtin::build_eq),
            ("hue", &[], builtin::build_hue),
            ("curves", &[], builtin::build_curves),
            ("unsharp", &[], builtin::build_unsharp),
            ("lut3d", &[], builtin::build_lut3d),
            ("rotate", &[], builtin::build_rotate),
        ];
        for (name, aliases, builder) in builtins {
            registry.register_overlay(
                name,
                aliases,
                Builder::Native(*builder),
                PluginSource::Builtin,
            );
        }
        registry
    }

    fn register_overlay(
        &mut self,
        name: &str,
        aliases: &[&str],
        builder: Builder,
        source: PluginSource,
    ) {
        let entry = EffectEntry {
            canonical: name.to_string(),
            builder,
            source,
        };
        for key in std::iter::once(name).chain(aliases.iter().copied()) {
            match self.overlay.get(key) {
                Some(existing) if existing.source.priority() >= source.priority() => {
                    debug!(
                        "keeping {} registration for '{key}' over {}",
                        existing.source.as_str(),
                        source.as_str()
                    );
                }
                _ => {
                    self.overlay.insert(key.to_string(), entry.clone());
                }
            }
        }
    }

    fn register_subtitle(
        &mut self,
        name: &str,
        aliases: &[&str],
        builder: Builder,
        source: PluginSource,
    ) {
        let entry = EffectEntry {
            canonical: name.to_string(),
            builder,
            source,
        };
        for key in std::iter::once(name).chain(aliases.iter().copied()) {
            match self.subtitle.get(key) {
                Some(existing) if existing.source.priority() >= source.priority() => {}
                _ => {
                    self.subtitle.insert(key.to_string(), entry.clone());
                }
            }
        }
    }

    /// Load every discovered plugin manifest into the registry.
    pub fn load_external(&mut self, manifests: &[PluginManifest]) {
        for manifest in manifests {
            if !manifest.enabled {
                continue;
            }
            debug!(
                "loading plugin '{}' v{} from {}{}",
                manifest.plugin_id,
                manifest.version,
                manifest.base_path.display(),
                manifest
                    .description
                    .as_deref()
                    .map(|d| format!(" ({d})"))
                    .unwrap_or_default()
            );
            for effect_id in &manifest.provides {
                let Some(template) = manifest.effects.get(effect_id) else {
                    warn!(
                        "plugin '{}' provides '{effect_id}' but defines no effect for it",
                        manifest.plugin_id
                    );
                    continue;
                };
                let aliases: Vec<&str> = template.aliases.iter().map(String::as_str).collect();
                match manifest.kind {
                    PluginKind::Overlay => self.register_overlay(
                        effect_id,
                        &aliases,
                        Builder::Template(template.clone()),
                        manifest.source,
                    ),
                    PluginKind::Subtitle => self.register_subtitle(
                        effect_id,
                        &aliases,
                        Builder::Template(template.clone()),
                        manifest.source,
                    ),
                    PluginKind::Audio | PluginKind::Transition => {
                        debug!(
                            "plugin '{}': kind has no registry yet; skipping",
                            manifest.plugin_id
                        );
                    }
                }
            }
        }
    }

    /// Translate overlay effect specs into filter strings, preserving input
    /// order. A failing builder logs and is skipped.
    pub fn resolve_overlay_effects(&self, effects: &[EffectSpec]) -> Vec<String> {
        let mut filters = Vec::new();
        for spec in effects {
            let Some((effect_type, params)) = spec.normalized() else {
                continue;
            };
            let Some(entry) = self.overlay.get(&effect_type) else {
                warn!("unsupported overlay effect type: {effect_type}");
                continue;
            };
            match build_filters(&entry.builder, &params) {
                Some(built) => filters.extend(built),
                None => debug!(
                    "overlay effect '{}' produced no filters for params {params:?}",
                    entry.canonical
                ),
            }
        }
        filters
    }

    /// Rewrite the subtitle overlay `y` expression through subtitle effects.
    pub fn resolve_subtitle_y_expr(&self, base_y: &str, effects: &[EffectSpec]) -> String {
        let mut y = base_y.to_string();
        for spec in effects {
            let Some((effect_type, params)) = spec.normalized() else {
                continue;
            };
            // The builtin bounce is always available under both names.
            if effect_type == "text:bounce_text" || effect_type == "bounce_text" {
                if let Some(entry) = self.subtitle.get(&effect_type) {
                    if let Builder::Template(t) = &entry.builder {
                        y = substitute_template(&t.template, &params, &t.defaults)
                            .replace("{y}", &y);
                        continue;
                    }
                }
                if let Some(expr) = builtin::build_subtitle_bounce(&y, &params) {
                    y = expr;
                }
            } else if let Some(entry) = self.subtitle.get(&effect_type) {
                if let Builder::Template(t) = &entry.builder {
                    y = substitute_template(&t.template, &params, &t.defaults).replace("{y}", &y);
                }
            } else {
                warn!("unsupported subtitle effect type: {effect_type}");
            }
        }
        y
    }

    #[cfg(test)]
    fn overlay_source(&self, name: &str) -> Option<PluginSource> {
        self.overlay.get(name).map(|e| e.source)
    }
}

fn build_filters(builder: &Builder, params: &Params) -> Option<Vec<String>> {
    match builder {
        Builder::Native(f) => f(params),
        Builder::Template(t) => {
            Some(vec![substitute_template(&t.template, params, &t.defaults)])
        }
    }
}

/// Replace `{param}` placeholders from params, falling back to defaults.
fn substitute_template(template: &str, params: &Params, defaults: &Params) -> String {
    let mut out = template.to_string();
    for (key, value) in defaults.iter().chain(params.iter()) {
        let placeholder = format!("{{{key}}}");
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        out = out.replace(&placeholder, &rendered);
    }
    out
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Default search roots: `./plugins` and `~/.sceneforge/plugins` as user
/// sources, plus configured paths as package sources.
pub fn default_plugin_roots(config: &PluginsConfig) -> Vec<(PathBuf, PluginSource)> {
    let mut roots = vec![(PathBuf::from("plugins"), PluginSource::User)];
    if let Some(home) = std::env::var_os("HOME") {
        roots.push((
            PathBuf::from(home).join(".sceneforge").join("plugins"),
            PluginSource::User,
        ));
    }
    for path in &config.paths {
        roots.push((path.clone(), PluginSource::Package));
    }
    let mut seen = std::collections::HashSet::new();
    roots.retain(|(p, _)| seen.insert(p.clone()));
    roots
}

/// Scan roots for `plugin.yaml` manifests, honoring allow/deny lists.
pub fn discover_plugins(
    roots: &[(PathBuf, PluginSource)],
    allow: &[String],
    deny: &[String],
) -> Vec<PluginManifest> {
    let mut manifests = Vec::new();
    for (root, source) in roots {
        if !root.exists() {
            continue;
        }
        scan_root(root, *source, allow, deny, &mut manifests, 0);
    }
    manifests
}

fn scan_root(
    dir: &Path,
    source: PluginSource,
    allow: &[String],
    deny: &[String],
    out: &mut Vec<PluginManifest>,
    depth: usize,
) {
    if depth > 4 {
        return;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            scan_root(&path, source, allow, deny, out, depth + 1);
            continue;
        }
        if path.file_name().and_then(|n| n.to_str()) != Some("plugin.yaml") {
            continue;
        }
        let Ok(raw) = std::fs::read_to_string(&path) else {
            warn!("failed to read manifest {}", path.display());
            continue;
        };
        let Ok(value) = serde_yml::from_str::<serde_yml::Value>(&raw) else {
            warn!("invalid YAML in manifest {}", path.display());
            continue;
        };
        let base = path.parent().unwrap_or(dir);
        let Some(manifest) = manifest::parse_manifest(&value, source, base) else {
            warn!("invalid manifest for plugin at {}", path.display());
            continue;
        };
        if !allow.is_empty() && !allow.contains(&manifest.plugin_id) {
            debug!("plugin '{}' not in allow list; skipping", manifest.plugin_id);
            continue;
        }
        if deny.contains(&manifest.plugin_id) {
            debug!("plugin '{}' denied; skipping", manifest.plugin_id);
            continue;
        }
        out.push(manifest);
    }
}

/// Build the registry for a run: builtins, then external plugins discovered
/// from the configured roots.
pub fn initialize_registry(config: &PluginsConfig, extra_paths: &[PathBuf]) -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    if !config.enabled {
        info!("plugin system disabled; using builtin effects only");
        return registry;
    }
    let mut merged = config.clone();
    merged.paths.extend(extra_paths.iter().cloned());
    let roots = default_plugin_roots(&merged);
    let manifests = discover_plugins(&roots, &config.allow, &config.deny);
    if !manifests.is_empty() {
        info!("loaded {} external plugin(s)", manifests.len());
    }
    registry.load_external(&manifests);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn effect(name: &str) -> EffectSpec {
        EffectSpec::Name(name.into())
    }

    fn effect_with(name: &str, params: &[(&str, Value)]) -> EffectSpec {
        let mut map = BTreeMap::new();
        map.insert("type".into(), json!(name));
        for (k, v) in params {
            map.insert(k.to_string(), v.clone());
        }
        EffectSpec::Table(map)
    }

    fn user_plugin(provides: &str, template: &str) -> PluginManifest {
        let yaml = format!(
            r#"
id: user_{provides}
version: "1.0.0"
kind: overlay
provides: [{provides}]
effects:
  {provides}:
    template: "{template}"
"#
        );
        let raw: serde_yml::Value = serde_yml::from_str(&yaml).unwrap();
        manifest::parse_manifest(&raw, PluginSource::User, Path::new("/u")).unwrap()
    }

    #[test]
    fn test_builtin_blur_resolution() {
        let registry = PluginRegistry::with_builtins();
        let out = registry.resolve_overlay_effects(&[effect_with("blur", &[("sigma", json!(0))])]);
        assert_eq!(out, vec!["gblur=sigma=0.0000"]);
    }

    #[test]
    fn test_alias_resolves_to_same_builder() {
        let registry = PluginRegistry::with_builtins();
        let a = registry.resolve_overlay_effects(&[effect("blur")]);
        let b = registry.resolve_overlay_effects(&[effect("gblur")]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_vignette_stable_string() {
        let registry = PluginRegistry::with_builtins();
        let out = registry.resolve_overlay_effects(&[effect("vignette")]);
        assert_eq!(out, vec!["vignette"]);
    }

    #[test]
    fn test_user_plugin_overrides_builtin() {
        let mut registry = PluginRegistry::with_builtins();
        registry.load_external(&[user_plugin("blur", "custom_blur")]);
        let out = registry.resolve_overlay_effects(&[effect_with("blur", &[])]);
        assert_eq!(out, vec!["custom_blur"]);
        assert_eq!(registry.overlay_source("blur"), Some(PluginSource::User));
    }

    #[test]
    fn test_builtin_survives_when_user_plugin_denied() {
        // Deny is applied at discovery; a registry without the user plugin
        // resolves to the builtin output.
        let registry = PluginRegistry::with_builtins();
        let out = registry.resolve_overlay_effects(&[effect_with("blur", &[("sigma", json!(5))])]);
        assert_eq!(out, vec!["gblur=sigma=5.0000"]);
    }

    #[test]
    fn test_equal_priority_does_not_replace() {
        let mut registry = PluginRegistry::with_builtins();
        registry.load_external(&[user_plugin("blur", "first")]);
        registry.load_external(&[user_plugin("blur", "second")]);
        let out = registry.resolve_overlay_effects(&[effect("blur")]);
        assert_eq!(out, vec!["first"]);
    }

    #[test]
    fn test_unknown_effect_skipped_in_order() {
        let registry = PluginRegistry::with_builtins();
        let out = registry.resolve_overlay_effects(&[
            effect("vignette"),
            effect("no_such_effect"),
            effect_with("blur", &[("sigma", json!(1))]),
        ]);
        assert_eq!(out, vec!["vignette", "gblur=sigma=1.0000"]);
    }

    #[test]
    fn test_template_substitution_with_defaults() {
        let yaml = r#"
id: tint
version: "1.0.0"
kind: overlay
provides: [tint]
effects:
  tint:
    template: "colorbalance=rs={rs}:bs={bs}"
    defaults: {rs: 0.1, bs: 0.2}
"#;
        let raw: serde_yml::Value = serde_yml::from_str(yaml).unwrap();
        let manifest =
            manifest::parse_manifest(&raw, PluginSource::User, Path::new("/u")).unwrap();
        let mut registry = PluginRegistry::with_builtins();
        registry.load_external(&[manifest]);
        let out =
            registry.resolve_overlay_effects(&[effect_with("tint", &[("bs", json!(0.5))])]);
        assert_eq!(out, vec!["colorbalance=rs=0.1:bs=0.5"]);
    }

    #[test]
    fn test_subtitle_bounce_builtin_rewrites_y() {
        let registry = PluginRegistry::with_builtins();
        let y = registry.resolve_subtitle_y_expr(
            "H-h-60",
            &[effect_with("text:bounce_text", &[("amplitude", json!(12))])],
        );
        assert!(y.contains("abs(sin("));
        assert!(y.starts_with("(H-h-60)"));
        // alias works too
        let y2 = registry
            .resolve_subtitle_y_expr("H-h-60", &[effect_with("bounce_text", &[("amplitude", json!(12))])]);
        assert_eq!(y, y2);
    }

    #[test]
    fn test_discover_plugins_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("myplugin");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("plugin.yaml"),
            r#"
id: disk_blur
version: "0.1.0"
kind: overlay
provides: [blur]
effects:
  blur:
    template: "boxblur=2:1"
"#,
        )
        .unwrap();

        let roots = vec![(dir.path().to_path_buf(), PluginSource::User)];
        let found = discover_plugins(&roots, &[], &[]);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].plugin_id, "disk_blur");

        // deny filters it out
        let denied = discover_plugins(&roots, &[], &["disk_blur".to_string()]);
        assert!(denied.is_empty());

        // allow list without it filters it out
        let filtered = discover_plugins(&roots, &["other".to_string()], &[]);
        assert!(filtered.is_empty());
    }
}
