//! Runtime feature flags registry.
//!
//! Independent of Cargo compile-time features: these are switches an operator
//! can flip while the engine is running, via `set`/`is_enabled`.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::LazyLock;

#[derive(Clone, Debug)]
pub struct FeatureFlag {
    pub name: String,
    pub enabled: bool,
    pub description: String,
}

static FLAGS: LazyLock<RwLock<HashMap<String, FeatureFlag>>> = LazyLock::new(|| {
    let mut map = HashMap::new();
    map.insert(
        "codec-gzip".to_string(),
        FeatureFlag {
            name: "codec-gzip".to_string(),
            enabled: true,
            description: "Gzip codec available for blob/extent payload compression.".to_string(),
        },
    );
    map.insert(
        "auto-tiering".to_string(),
        FeatureFlag {
            name: "auto-tiering".to_string(),
            enabled: true,
            description: "Tiered blob router auto-promotes/demotes on access.".to_string(),
        },
    );
    map.insert(
        "extent-compression".to_string(),
        FeatureFlag {
            name: "extent-compression".to_string(),
            enabled: false,
            description:
                "Whether buildExtent actually compresses the data section (not yet wired; the compressed flag is otherwise metadata-only)."
                    .to_string(),
        },
    );
    map.insert(
        "metadata-retry".to_string(),
        FeatureFlag {
            name: "metadata-retry".to_string(),
            enabled: true,
            description: "Retry-with-backoff for retryable-busy transaction failures.".to_string(),
        },
    );
    RwLock::new(map)
});

/// Enable or disable a feature flag. Returns true if the flag existed.
pub fn set(name: &str, enabled: bool) -> bool {
    let mut g = FLAGS.write();
    if let Some(f) = g.get_mut(name) {
        f.enabled = enabled;
        true
    } else {
        false
    }
}

/// Ensure a feature exists (register if missing) with the given default.
pub fn ensure(name: &str, default_enabled: bool, description: &str) {
    let mut g = FLAGS.write();
    g.entry(name.to_string()).or_insert_with(|| FeatureFlag {
        name: name.to_string(),
        enabled: default_enabled,
        description: description.to_string(),
    });
}

/// Returns whether a feature is enabled (false if unknown).
#[must_use]
pub fn is_enabled(name: &str) -> bool {
    FLAGS.read().get(name).is_some_and(|f| f.enabled)
}

/// Get a feature by name.
#[must_use]
pub fn get(name: &str) -> Option<FeatureFlag> {
    FLAGS.read().get(name).cloned()
}

/// List all known feature flags.
#[must_use]
pub fn list() -> Vec<FeatureFlag> {
    FLAGS.read().values().cloned().collect()
}

/// Initialize runtime feature flags from environment variables.
/// Supported: `FSX_AUTO_TIERING`, `FSX_EXTENT_COMPRESSION`.
pub fn init_from_env() {
    if let Ok(v) = std::env::var("FSX_AUTO_TIERING") {
        let _ = set("auto-tiering", matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
    }
    if let Ok(v) = std::env::var("FSX_EXTENT_COMPRESSION") {
        let _ = set(
            "extent-compression",
            matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_flag_is_disabled() {
        assert!(!is_enabled("does-not-exist"));
    }

    #[test]
    fn ensure_then_toggle() {
        ensure("t-feature-flags-toggle", true, "test flag");
        assert!(is_enabled("t-feature-flags-toggle"));
        assert!(set("t-feature-flags-toggle", false));
        assert!(!is_enabled("t-feature-flags-toggle"));
    }
}
