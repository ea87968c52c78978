//! Validation policy configuration and resolution.
//!
//! Presets are named bundles of evidence requirements loaded from
//! `.gatehouse/config.toml`. Resolution precedence is explicit override >
//! per-task preset > project default, and a named preset that does not exist
//! is a hard error — never a silent fallback.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::core::entity::Entity;
use crate::core::error::GatehouseError;
use crate::core::paths;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StalePolicy {
    /// Stale evidence is reported but does not fail the check.
    #[default]
    Warn,
    /// Stale evidence fails the check on its own.
    Block,
}

/// Consolidated enforcement switches threaded into guards as one value,
/// constructed once at the command boundary.
#[derive(Debug, Clone, Default)]
pub struct EnforcementPolicy {
    /// Require every policy evidence glob to match in the current round.
    pub evidence: bool,
    /// Enable the TDD gate (exit codes, HMAC, focus markers, phase ordering).
    pub tdd: bool,
    pub stale_policy: StalePolicy,
    /// HMAC-SHA256 signing key for command evidence; when set, signature
    /// verification supersedes raw exit-code checks and a mismatch is fatal.
    pub signing_key: Option<Vec<u8>>,
    /// Regexes that must not appear in any test file (focus markers etc.).
    pub blocked_patterns: Vec<String>,
    /// Globs selecting the test files the blocked-pattern scan covers.
    pub test_globs: Vec<String>,
    /// Whether the REFACTOR phase may be absent from supplied TDD evidence.
    pub refactor_waived: bool,
    /// Post-training packages that require a context7 marker in the round.
    pub context7_packages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PresetConfig {
    #[serde(default)]
    pub required_evidence: Vec<String>,
    #[serde(default)]
    pub blocking_validators: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TddConfig {
    #[serde(default)]
    pub enforce: bool,
    #[serde(default)]
    pub blocked_patterns: Vec<String>,
    #[serde(default)]
    pub test_globs: Vec<String>,
    #[serde(default)]
    pub refactor_waived: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvidenceConfig {
    #[serde(default)]
    pub enforce: bool,
    #[serde(default)]
    pub stale_policy: StalePolicy,
    /// Hex-encoded HMAC key; absent means exit-code checks only.
    #[serde(default)]
    pub signing_key_hex: Option<String>,
    #[serde(default)]
    pub context7_packages: Vec<String>,
}

/// The `.gatehouse/config.toml` schema.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GatehouseConfig {
    #[serde(default = "default_preset_name")]
    pub default_preset: String,
    #[serde(default, rename = "preset")]
    pub presets: BTreeMap<String, PresetConfig>,
    #[serde(default)]
    pub tdd: TddConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
}

fn default_preset_name() -> String {
    "default".to_string()
}

impl GatehouseConfig {
    /// Load from `.gatehouse/config.toml`. A missing file means an empty
    /// config (no presets configured), not an error.
    pub fn load(project_root: &Path) -> Result<Self, GatehouseError> {
        let path = paths::config_path(project_root);
        if !path.exists() {
            return Ok(Self {
                default_preset: default_preset_name(),
                ..Self::default()
            });
        }
        let content = fs::read_to_string(&path)?;
        toml::from_str(&content)
            .map_err(|e| GatehouseError::ConfigError(format!("{}: {}", path.display(), e)))
    }

    pub fn enforcement(&self) -> Result<EnforcementPolicy, GatehouseError> {
        let signing_key = match &self.evidence.signing_key_hex {
            Some(hex) => Some(decode_hex(hex).ok_or_else(|| {
                GatehouseError::ConfigError(
                    "evidence.signing_key_hex is not valid hex".to_string(),
                )
            })?),
            None => None,
        };
        Ok(EnforcementPolicy {
            evidence: self.evidence.enforce,
            tdd: self.tdd.enforce,
            stale_policy: self.evidence.stale_policy,
            signing_key,
            blocked_patterns: self.tdd.blocked_patterns.clone(),
            test_globs: self.tdd.test_globs.clone(),
            refactor_waived: self.tdd.refactor_waived,
            context7_packages: self.evidence.context7_packages.clone(),
        })
    }
}

/// A resolved policy for one task.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Policy {
    pub preset: String,
    pub required_evidence: Vec<String>,
    pub blocking_validators: Vec<String>,
}

/// Resolve the policy for a task. Precedence: explicit override > the task's
/// own `metadata.preset` > the project default. Naming a preset that is not
/// configured fails.
pub fn resolve_for_task(
    config: &GatehouseConfig,
    task: Option<&Entity>,
    override_preset: Option<&str>,
) -> Result<Policy, GatehouseError> {
    let name = override_preset
        .map(|s| s.to_string())
        .or_else(|| task.and_then(|t| t.meta_str("preset").map(|s| s.to_string())))
        .unwrap_or_else(|| config.default_preset.clone());

    match config.presets.get(&name) {
        Some(preset) => Ok(Policy {
            preset: name,
            required_evidence: preset.required_evidence.clone(),
            blocking_validators: preset.blocking_validators.clone(),
        }),
        // An unconfigured default preset resolves to an empty policy; an
        // explicitly named one must exist.
        None if name == config.default_preset
            && override_preset.is_none()
            && task.and_then(|t| t.meta_str("preset")).is_none() =>
        {
            Ok(Policy {
                preset: name,
                required_evidence: Vec::new(),
                blocking_validators: Vec::new(),
            })
        }
        None => Err(GatehouseError::UnknownPreset(name)),
    }
}

/// Starter `.gatehouse/config.toml` written by `gatehouse init`.
pub fn default_config_toml() -> &'static str {
    r#"# Gatehouse project configuration.

default_preset = "default"

[preset.default]
required_evidence = ["command-test.txt"]
blocking_validators = ["test"]

[tdd]
enforce = false
blocked_patterns = ["\\.only\\(", "\\bfdescribe\\(", "\\bfit\\("]
test_globs = ["tests/**", "src/**/*_test.*"]

[evidence]
enforce = false
stale_policy = "warn"
# signing_key_hex = "..."
"#
}

fn decode_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

/// Simple glob match supporting `*` and `**` segments.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern.contains("**") {
        let parts: Vec<&str> = pattern.split("**").collect();
        if parts.len() == 2 {
            let prefix = parts[0];
            let suffix = parts[1];
            return (suffix.is_empty() || text.ends_with(suffix))
                && (prefix.is_empty() || text.starts_with(prefix));
        }
    }

    if pattern.contains('*') && !pattern.contains("**") {
        let parts: Vec<&str> = pattern.split('*').collect();
        if parts.len() == 2 {
            let prefix = parts[0];
            let suffix = parts[1];
            return text.starts_with(prefix) && text.ends_with(suffix);
        }
    }

    pattern == text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::EntityKind;

    fn config_with_presets() -> GatehouseConfig {
        let mut presets = BTreeMap::new();
        presets.insert(
            "default".to_string(),
            PresetConfig {
                required_evidence: vec!["command-test.txt".into()],
                blocking_validators: vec!["test".into()],
            },
        );
        presets.insert(
            "session-close".to_string(),
            PresetConfig {
                required_evidence: vec!["command-test.txt".into(), "command-lint.txt".into()],
                blocking_validators: vec!["test".into(), "lint".into()],
            },
        );
        GatehouseConfig {
            default_preset: "default".to_string(),
            presets,
            ..GatehouseConfig::default()
        }
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "foo"));
        assert!(glob_match("command-*.txt", "command-test.txt"));
        assert!(glob_match("**/.credentials", "foo/bar/.credentials"));
        assert!(glob_match("tests/**", "tests/lock.rs"));
        assert!(!glob_match("command-*.txt", "report.md"));
    }

    #[test]
    fn test_resolution_precedence() {
        let config = config_with_presets();
        let mut task = Entity::new("T1", EntityKind::Task, "wip");
        task.metadata
            .insert("preset".into(), serde_json::json!("session-close"));

        // Task preset beats default.
        let policy = resolve_for_task(&config, Some(&task), None).unwrap();
        assert_eq!(policy.preset, "session-close");

        // Override beats task preset.
        let policy = resolve_for_task(&config, Some(&task), Some("default")).unwrap();
        assert_eq!(policy.preset, "default");

        // No task, no override: project default.
        let policy = resolve_for_task(&config, None, None).unwrap();
        assert_eq!(policy.preset, "default");
        assert_eq!(policy.required_evidence, vec!["command-test.txt"]);
    }

    #[test]
    fn test_unknown_preset_fails() {
        let config = config_with_presets();
        let err = resolve_for_task(&config, None, Some("no-such-preset")).unwrap_err();
        assert!(matches!(err, GatehouseError::UnknownPreset(_)));
    }

    #[test]
    fn test_unconfigured_default_resolves_empty() {
        let config = GatehouseConfig::default();
        let policy = resolve_for_task(&config, None, None).unwrap();
        assert!(policy.required_evidence.is_empty());
    }

    #[test]
    fn test_config_load_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = GatehouseConfig::load(tmp.path()).unwrap();
        assert_eq!(config.default_preset, "default");
        assert!(config.presets.is_empty());
    }

    #[test]
    fn test_config_parse_and_enforcement() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".gatehouse");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("config.toml"),
            r#"
default_preset = "default"

[preset.default]
required_evidence = ["command-test.txt"]
blocking_validators = ["test"]

[tdd]
enforce = true
blocked_patterns = ["\\.only\\("]
test_globs = ["tests/**"]

[evidence]
enforce = true
stale_policy = "block"
signing_key_hex = "0011aabb"
"#,
        )
        .unwrap();
        let config = GatehouseConfig::load(tmp.path()).unwrap();
        let enforcement = config.enforcement().unwrap();
        assert!(enforcement.tdd);
        assert!(enforcement.evidence);
        assert_eq!(enforcement.stale_policy, StalePolicy::Block);
        assert_eq!(enforcement.signing_key, Some(vec![0x00, 0x11, 0xaa, 0xbb]));
    }

    #[test]
    fn test_bad_signing_key_is_config_error() {
        let config = GatehouseConfig {
            evidence: EvidenceConfig {
                signing_key_hex: Some("zz".into()),
                ..EvidenceConfig::default()
            },
            ..GatehouseConfig::default()
        };
        assert!(config.enforcement().is_err());
    }
}
