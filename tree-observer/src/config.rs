//! Configuration for tree observation.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, WatcherError};

/// Tuning and filtering for a [`TreeObserver`](crate::TreeObserver).
///
/// The timing defaults are empirical. Settling needs roughly
/// `poll_interval * retry_count` after the last write, and the quiet window
/// should be at least as long as one settle cycle so a batch is not split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObserverConfig {
    /// Delay between two fingerprints of a changing directory.
    pub poll_interval_ms: u64,

    /// Number of identical fingerprints required before a directory is settled.
    pub retry_count: u32,

    /// Trailing quiet window before a batch is delivered.
    pub quiet_window_ms: u64,

    /// Ignore entries whose name starts with a dot.
    pub skip_hidden: bool,

    /// Do not descend into package bundles (e.g. `Foo.app`).
    pub skip_packages: bool,

    /// Directory extensions treated as package bundles.
    pub package_extensions: Vec<String>,

    /// Glob patterns for directories that are never descended into.
    pub exclude_patterns: Vec<String>,
}

impl ObserverConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self {
            poll_interval_ms: 500,
            retry_count: 3,
            quiet_window_ms: 1000,
            skip_hidden: true,
            skip_packages: true,
            package_extensions: Self::default_package_extensions(),
            exclude_patterns: Vec::new(),
        }
    }

    /// Parse a config from TOML. Missing keys fall back to defaults.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).map_err(|e| WatcherError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the settle poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = saturating_millis(interval);
        self
    }

    /// Set the settle retry count.
    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count;
        self
    }

    /// Set the debounce quiet window.
    pub fn with_quiet_window(mut self, window: Duration) -> Self {
        self.quiet_window_ms = saturating_millis(window);
        self
    }

    /// Include hidden entries.
    pub fn include_hidden(mut self) -> Self {
        self.skip_hidden = false;
        self
    }

    /// Descend into package bundles.
    pub fn include_packages(mut self) -> Self {
        self.skip_packages = false;
        self
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn quiet_window(&self) -> Duration {
        Duration::from_millis(self.quiet_window_ms)
    }

    /// Check the config for values the observer cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(WatcherError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry_count == 0 {
            return Err(WatcherError::Config(
                "retry_count must be at least 1".to_string(),
            ));
        }
        for pattern in &self.exclude_patterns {
            glob::Pattern::new(pattern)
                .map_err(|e| WatcherError::Config(format!("invalid exclude pattern {pattern}: {e}")))?;
        }
        Ok(())
    }

    /// Whether `path` names a package bundle.
    pub fn is_package(&self, path: &Path) -> bool {
        if !self.skip_packages {
            return false;
        }
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                self.package_extensions
                    .iter()
                    .any(|p| p.eq_ignore_ascii_case(ext))
            })
    }

    /// Check if a path should be excluded.
    pub fn should_exclude(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();

        for pattern in &self.exclude_patterns {
            if let Ok(glob) = glob::Pattern::new(pattern) {
                if glob.matches(&path_str) {
                    return true;
                }
            }
        }

        false
    }

    fn default_package_extensions() -> Vec<String> {
        [
            "app",
            "bundle",
            "framework",
            "plugin",
            "kext",
            "component",
            "vst",
            "vst3",
            "xcodeproj",
            "xcworkspace",
            "logicx",
            "band",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self::new()
    }
}
