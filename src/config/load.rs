// src/config/load.rs
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::{Settings, DEFAULT_CONFIG_PATH, ENV_CONFIG_PATH, ENV_SUCCESS_THRESHOLD};

/// Load settings from an explicit path. Supports TOML or JSON formats.
pub fn load_from(path: &Path) -> Result<Settings, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.display().to_string(),
        });
    }
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    let mut settings = parse_settings(&content, ext.as_str())?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

/// Load settings using env var + fallback:
/// 1) $FEED_GATE_CONFIG_PATH
/// 2) config/feed_gate.toml
pub fn load_default() -> Result<Settings, ConfigError> {
    let path = std::env::var(ENV_CONFIG_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
    load_from(&path)
}

/// Parse without env overrides or validation (callers that build settings in code
/// call `validate` themselves).
pub fn parse_settings(s: &str, hint_ext: &str) -> Result<Settings, ConfigError> {
    if hint_ext == "json" {
        return serde_json::from_str(s).map_err(|e| ConfigError::Parse(e.to_string()));
    }
    match toml::from_str::<Settings>(s) {
        Ok(v) => Ok(v),
        Err(toml_err) => {
            // Extension-less files may still be JSON.
            serde_json::from_str(s).map_err(|_| ConfigError::Parse(toml_err.to_string()))
        }
    }
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Some(t) = parse_threshold_env(std::env::var(ENV_SUCCESS_THRESHOLD).ok()) {
        settings.gate.success_threshold = t;
    }
}

// parse optional float env and clamp to <0.0..=1.0>
fn parse_threshold_env(raw: Option<String>) -> Option<f64> {
    raw.and_then(|s| s.trim().parse::<f64>().ok())
        .map(|v| v.clamp(0.0, 1.0))
}

pub fn validate(settings: &Settings) -> Result<(), ConfigError> {
    if settings.sources.is_empty() {
        return Err(ConfigError::EmptyRegistry);
    }
    let t = settings.gate.success_threshold;
    if !(0.0..=1.0).contains(&t) || t.is_nan() {
        return Err(ConfigError::BadThreshold(t));
    }

    let providers: HashSet<&str> = settings.providers.iter().map(|p| p.id.as_str()).collect();
    let mut seen = HashSet::new();
    for s in &settings.sources {
        if !seen.insert(s.id.as_str()) {
            return Err(ConfigError::DuplicateSource(s.id.clone()));
        }
        for p in std::iter::once(&s.primary).chain(s.fallbacks.iter()) {
            if !providers.contains(p.as_str()) {
                return Err(ConfigError::UnknownProvider {
                    source_id: s.id.clone(),
                    provider: p.clone(),
                });
            }
        }
    }

    for st in &settings.healing.strategies {
        if st.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts(st.name.clone()));
        }
    }

    let esc = &settings.escalation;
    if esc.default_threshold == 0 {
        return Err(ConfigError::ZeroAlertThreshold("default".into()));
    }
    if let Some(r) = esc.rules.iter().find(|r| r.threshold == 0) {
        return Err(ConfigError::ZeroAlertThreshold(r.kind.as_str().into()));
    }

    check_alias_cycles(settings)?;
    Ok(())
}

fn check_alias_cycles(settings: &Settings) -> Result<(), ConfigError> {
    let map: HashMap<&str, &str> = settings
        .aliases
        .iter()
        .map(|a| (a.from.as_str(), a.to.as_str()))
        .collect();
    for a in &settings.aliases {
        let mut visited = HashSet::new();
        let mut cur = a.from.as_str();
        while let Some(next) = map.get(cur) {
            if !visited.insert(cur) {
                return Err(crate::error::CacheError::AliasCycle {
                    from: a.from.clone(),
                    to: a.to.clone(),
                }
                .into());
            }
            cur = next;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    const MINIMAL: &str = r#"
[[providers]]
id = "fred"
url_template = "https://api.example.test/series/{series}?key={api_key}"
api_key_env = "FRED_API_KEY"

[[sources]]
id = "DGS10"
category = "economic"
criticality = "critical"
primary = "fred"
"#;

    #[test]
    fn minimal_toml_fills_defaults() {
        let s = parse_settings(MINIMAL, "toml").unwrap();
        validate(&s).unwrap();
        assert!((s.gate.success_threshold - 0.80).abs() < 1e-12);
        assert_eq!(s.orchestrator.retry_attempts, 3);
        assert_eq!(s.health.interval_secs, 30);
        assert_eq!(s.healing.strategies.len(), 4);
        assert_eq!(s.providers[0].requests, 60);
    }

    #[test]
    fn json_is_accepted() {
        let json = r#"{
            "providers": [{"id": "fixture", "kind": "static"}],
            "sources": [{"id": "SPY", "category": "price", "primary": "fixture"}]
        }"#;
        let s = parse_settings(json, "json").unwrap();
        validate(&s).unwrap();
        assert_eq!(s.sources[0].id, "SPY");
    }

    #[test]
    fn empty_registry_is_rejected() {
        let s = parse_settings("[gate]\nsuccess_threshold = 0.8\n", "toml").unwrap();
        assert!(matches!(validate(&s), Err(ConfigError::EmptyRegistry)));
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let bad = MINIMAL.replace("primary = \"fred\"", "primary = \"fred\"\nfallbacks = [\"nope\"]");
        let s = parse_settings(&bad, "toml").unwrap();
        assert!(matches!(
            validate(&s),
            Err(ConfigError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn alias_cycle_is_rejected() {
        let cyc = format!(
            "{MINIMAL}\n[[aliases]]\nfrom = \"a\"\nto = \"b\"\n[[aliases]]\nfrom = \"b\"\nto = \"a\"\n"
        );
        let s = parse_settings(&cyc, "toml").unwrap();
        assert!(matches!(validate(&s), Err(ConfigError::Cache(_))));
    }

    #[test]
    fn zero_alert_threshold_is_rejected() {
        let zero = format!("{MINIMAL}\n[[escalation.rules]]\nkind = \"stale-cache\"\nthreshold = 0\nwindow_secs = 60\n");
        let s = parse_settings(&zero, "toml").unwrap();
        assert!(matches!(
            validate(&s),
            Err(ConfigError::ZeroAlertThreshold(k)) if k == "stale-cache"
        ));
    }

    #[test]
    fn threshold_env_is_clamped() {
        assert_eq!(parse_threshold_env(Some("1.7".into())), Some(1.0));
        assert_eq!(parse_threshold_env(Some(" 0.9 ".into())), Some(0.9));
        assert_eq!(parse_threshold_env(Some("abc".into())), None);
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_path() {
        let tmp = tempfile::tempdir().unwrap();
        let p = tmp.path().join("gate.toml");
        std::fs::write(&p, MINIMAL).unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        env::set_var(ENV_SUCCESS_THRESHOLD, "0.9");
        let s = load_default().unwrap();
        assert!((s.gate.success_threshold - 0.9).abs() < 1e-12);
        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var(ENV_SUCCESS_THRESHOLD);
    }

    #[serial_test::serial]
    #[test]
    fn missing_file_is_an_error() {
        env::set_var(ENV_CONFIG_PATH, "/definitely/not/here.toml");
        assert!(matches!(load_default(), Err(ConfigError::NotFound { .. })));
        env::remove_var(ENV_CONFIG_PATH);
    }
}
