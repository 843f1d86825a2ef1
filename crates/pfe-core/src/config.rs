#![forbid(unsafe_code)]

//! Escalation levels, thresholds, and layered configuration resolution.
//!
//! An operation's feedback escalates through [`EscalationLevel`]s as time
//! passes. The thresholds that drive it come from three layers of
//! increasing specificity:
//!
//! ```text
//! global defaults  <  operation-type layer  <  component layer
//! ```
//!
//! Each [`ConfigLayer`] field is an `Option`:
//! - `Some(v)` - override the value from the less specific layers
//! - `None` - fall through
//!
//! # Example
//!
//! ```
//! use pfe_core::config::{ConfigLayer, EscalationConfig, resolve};
//!
//! let global = EscalationConfig::default();
//! let by_type = ConfigLayer::new().inline_ms(300);
//! let component = ConfigLayer::new();
//!
//! let effective = resolve(&global, &by_type, &component);
//! assert_eq!(effective.inline_threshold_ms, 300);
//!
//! let effective = resolve(&global, &by_type, &ConfigLayer::new().inline_ms(400));
//! assert_eq!(effective.inline_threshold_ms, 400);
//! ```
//!
//! # Invariants
//!
//! 1. Thresholds of a resolved config are non-decreasing
//!    (`inline <= overlay <= modal`).
//! 2. A disabled level is never reached; elapsed time jumps straight to the
//!    next enabled level.
//! 3. Resolution is pure: the same layers always yield the same config.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Environment variable for the inline threshold (ms).
pub const ENV_INLINE_MS: &str = "PFE_ESCALATION_INLINE_MS";
/// Environment variable for the overlay threshold (ms).
pub const ENV_OVERLAY_MS: &str = "PFE_ESCALATION_OVERLAY_MS";
/// Environment variable for the modal threshold (ms).
pub const ENV_MODAL_MS: &str = "PFE_ESCALATION_MODAL_MS";
/// Environment variable for the timeout (ms, `0` disables it).
pub const ENV_TIMEOUT_MS: &str = "PFE_ESCALATION_TIMEOUT_MS";
/// Environment variable listing disabled levels (`inline,overlay,modal`).
pub const ENV_DISABLE: &str = "PFE_ESCALATION_DISABLE";

// ============================================================================
// Levels
// ============================================================================

/// Feedback intensity tier, ordered by intensity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum EscalationLevel {
    /// No feedback shown.
    #[default]
    None,
    /// Lightweight inline indicator.
    Inline,
    /// Overlay with progress.
    Overlay,
    /// Blocking modal with cancel affordance.
    Modal,
}

impl EscalationLevel {
    /// Levels that are reached by a timer, in escalation order.
    pub const TIMED: [EscalationLevel; 3] = [Self::Inline, Self::Overlay, Self::Modal];

    /// Get the stable string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Inline => "inline",
            Self::Overlay => "overlay",
            Self::Modal => "modal",
        }
    }

    /// Index into [`Self::TIMED`], `None` for [`EscalationLevel::None`].
    #[must_use]
    pub const fn timed_index(self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Inline => Some(0),
            Self::Overlay => Some(1),
            Self::Modal => Some(2),
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "inline" => Some(Self::Inline),
            "overlay" => Some(Self::Overlay),
            "modal" => Some(Self::Modal),
            _ => None,
        }
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while validating or loading configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A threshold is lower than the one of the previous level.
    ThresholdsOutOfOrder {
        level: EscalationLevel,
        threshold_ms: u64,
        previous_ms: u64,
    },
    /// An environment variable could not be parsed.
    InvalidValue { key: String, value: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ThresholdsOutOfOrder {
                level,
                threshold_ms,
                previous_ms,
            } => write!(
                f,
                "{level} threshold {threshold_ms}ms is below the previous level's {previous_ms}ms"
            ),
            ConfigError::InvalidValue { key, value } => {
                write!(f, "invalid value for {key}: {value:?}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

// ============================================================================
// Effective config
// ============================================================================

/// What happens when an operation runs for too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum TimeoutPolicy {
    /// Never time out.
    #[default]
    Never,
    /// Cancel with a timeout reason after this many milliseconds
    /// (0 fires on the first tick).
    AfterMs(u64),
}

impl TimeoutPolicy {
    /// Time from start until the operation is cancelled, if ever.
    #[must_use]
    pub const fn duration(self) -> Option<Duration> {
        match self {
            Self::Never => None,
            Self::AfterMs(ms) => Some(Duration::from_millis(ms)),
        }
    }
}

/// Per-level enable flags. `None` is always reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LevelFlags {
    pub inline: bool,
    pub overlay: bool,
    pub modal: bool,
}

impl Default for LevelFlags {
    fn default() -> Self {
        Self {
            inline: true,
            overlay: true,
            modal: true,
        }
    }
}

impl LevelFlags {
    /// Check whether `level` may be shown.
    #[must_use]
    pub const fn is_enabled(&self, level: EscalationLevel) -> bool {
        match level {
            EscalationLevel::None => true,
            EscalationLevel::Inline => self.inline,
            EscalationLevel::Overlay => self.overlay,
            EscalationLevel::Modal => self.modal,
        }
    }

    fn set(&mut self, level: EscalationLevel, enabled: bool) {
        match level {
            EscalationLevel::None => {}
            EscalationLevel::Inline => self.inline = enabled,
            EscalationLevel::Overlay => self.overlay = enabled,
            EscalationLevel::Modal => self.modal = enabled,
        }
    }
}

/// Fully resolved escalation settings for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EscalationConfig {
    /// Elapsed time before inline feedback (ms).
    pub inline_threshold_ms: u64,
    /// Elapsed time before overlay feedback (ms).
    pub overlay_threshold_ms: u64,
    /// Elapsed time before modal feedback (ms).
    pub modal_threshold_ms: u64,
    /// Scheduled cancellation.
    pub timeout: TimeoutPolicy,
    /// Which levels may be shown.
    pub enabled: LevelFlags,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            inline_threshold_ms: 200,
            overlay_threshold_ms: 500,
            modal_threshold_ms: 2000,
            timeout: TimeoutPolicy::Never,
            enabled: LevelFlags::default(),
        }
    }
}

impl EscalationConfig {
    /// Set all three thresholds (builder pattern).
    #[must_use]
    pub fn with_thresholds(mut self, inline_ms: u64, overlay_ms: u64, modal_ms: u64) -> Self {
        self.inline_threshold_ms = inline_ms;
        self.overlay_threshold_ms = overlay_ms;
        self.modal_threshold_ms = modal_ms;
        self
    }

    /// Set the timeout policy (builder pattern).
    #[must_use]
    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable one level (builder pattern).
    #[must_use]
    pub fn with_level(mut self, level: EscalationLevel, enabled: bool) -> Self {
        self.enabled.set(level, enabled);
        self
    }

    /// Threshold for `level` in milliseconds; `None` for [`EscalationLevel::None`].
    #[must_use]
    pub const fn threshold_ms(&self, level: EscalationLevel) -> Option<u64> {
        match level {
            EscalationLevel::None => None,
            EscalationLevel::Inline => Some(self.inline_threshold_ms),
            EscalationLevel::Overlay => Some(self.overlay_threshold_ms),
            EscalationLevel::Modal => Some(self.modal_threshold_ms),
        }
    }

    /// Threshold for `level` as a duration offset from the operation start.
    #[must_use]
    pub fn threshold(&self, level: EscalationLevel) -> Option<Duration> {
        self.threshold_ms(level).map(Duration::from_millis)
    }

    /// Enabled timed levels with their offsets, in escalation order.
    pub fn armed_levels(&self) -> impl Iterator<Item = (EscalationLevel, Duration)> + '_ {
        EscalationLevel::TIMED
            .into_iter()
            .filter(|level| self.enabled.is_enabled(*level))
            .filter_map(|level| self.threshold(level).map(|t| (level, t)))
    }

    /// Level an operation should show after running for `elapsed`.
    ///
    /// Thresholds are absolute offsets from the start time, so the answer
    /// depends only on `elapsed`, never on when earlier levels were reached.
    #[must_use]
    pub fn level_at(&self, elapsed: Duration) -> EscalationLevel {
        self.armed_levels()
            .filter(|(_, threshold)| elapsed >= *threshold)
            .map(|(level, _)| level)
            .max()
            .unwrap_or(EscalationLevel::None)
    }

    /// Check that thresholds are ordered ascending.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut previous = 0;
        for level in EscalationLevel::TIMED {
            let threshold_ms = self.threshold_ms(level).unwrap_or(previous);
            if threshold_ms < previous {
                return Err(ConfigError::ThresholdsOutOfOrder {
                    level,
                    threshold_ms,
                    previous_ms: previous,
                });
            }
            previous = threshold_ms;
        }
        Ok(())
    }

    /// Raise any threshold that is lower than the previous level's.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if let Err(err) = self.validate() {
            crate::warn!(
                error = %err,
                "escalation thresholds out of order; raising to keep ascending"
            );
            self.overlay_threshold_ms = self.overlay_threshold_ms.max(self.inline_threshold_ms);
            self.modal_threshold_ms = self.modal_threshold_ms.max(self.overlay_threshold_ms);
        }
        self
    }

    /// Check whether every level above `None` is disabled.
    #[must_use]
    pub fn feedback_disabled(&self) -> bool {
        !(self.enabled.inline || self.enabled.overlay || self.enabled.modal)
    }
}

// ============================================================================
// Layers
// ============================================================================

/// Partial override of an [`EscalationConfig`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConfigLayer {
    pub inline_threshold_ms: Option<u64>,
    pub overlay_threshold_ms: Option<u64>,
    pub modal_threshold_ms: Option<u64>,
    pub timeout: Option<TimeoutPolicy>,
    pub inline_enabled: Option<bool>,
    pub overlay_enabled: Option<bool>,
    pub modal_enabled: Option<bool>,
}

impl ConfigLayer {
    /// Create an empty layer (nothing overridden).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inline_threshold_ms: None,
            overlay_threshold_ms: None,
            modal_threshold_ms: None,
            timeout: None,
            inline_enabled: None,
            overlay_enabled: None,
            modal_enabled: None,
        }
    }

    // ── Builder Methods ────────────────────────────────────────────────

    /// Override the inline threshold in milliseconds.
    #[must_use]
    pub const fn inline_ms(mut self, ms: u64) -> Self {
        self.inline_threshold_ms = Some(ms);
        self
    }

    /// Override the overlay threshold in milliseconds.
    #[must_use]
    pub const fn overlay_ms(mut self, ms: u64) -> Self {
        self.overlay_threshold_ms = Some(ms);
        self
    }

    /// Override the modal threshold in milliseconds.
    #[must_use]
    pub const fn modal_ms(mut self, ms: u64) -> Self {
        self.modal_threshold_ms = Some(ms);
        self
    }

    /// Override the timeout policy.
    #[must_use]
    pub const fn timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Override whether `level` may be shown.
    #[must_use]
    pub const fn enable(mut self, level: EscalationLevel, enabled: bool) -> Self {
        match level {
            EscalationLevel::None => {}
            EscalationLevel::Inline => self.inline_enabled = Some(enabled),
            EscalationLevel::Overlay => self.overlay_enabled = Some(enabled),
            EscalationLevel::Modal => self.modal_enabled = Some(enabled),
        }
        self
    }

    /// Check if any field is overridden.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.inline_threshold_ms.is_none()
            && self.overlay_threshold_ms.is_none()
            && self.modal_threshold_ms.is_none()
            && self.timeout.is_none()
            && self.inline_enabled.is_none()
            && self.overlay_enabled.is_none()
            && self.modal_enabled.is_none()
    }

    /// Apply this layer on top of `config`. Present fields win.
    #[must_use]
    pub fn apply_to(&self, mut config: EscalationConfig) -> EscalationConfig {
        if let Some(v) = self.inline_threshold_ms {
            config.inline_threshold_ms = v;
        }
        if let Some(v) = self.overlay_threshold_ms {
            config.overlay_threshold_ms = v;
        }
        if let Some(v) = self.modal_threshold_ms {
            config.modal_threshold_ms = v;
        }
        if let Some(v) = self.timeout {
            config.timeout = v;
        }
        if let Some(v) = self.inline_enabled {
            config.enabled.inline = v;
        }
        if let Some(v) = self.overlay_enabled {
            config.enabled.overlay = v;
        }
        if let Some(v) = self.modal_enabled {
            config.enabled.modal = v;
        }
        config
    }

    /// Read a layer from the process environment.
    ///
    /// See the `ENV_*` constants for the recognised variables. Unset
    /// variables leave the field empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read a layer through an arbitrary key lookup (used by tests and by
    /// hosts that keep settings outside the environment).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_ms = |key: &str| -> Result<Option<u64>, ConfigError> {
            match lookup(key) {
                None => Ok(None),
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        value: raw,
                    }),
            }
        };

        let mut layer = Self {
            inline_threshold_ms: parse_ms(ENV_INLINE_MS)?,
            overlay_threshold_ms: parse_ms(ENV_OVERLAY_MS)?,
            modal_threshold_ms: parse_ms(ENV_MODAL_MS)?,
            timeout: parse_ms(ENV_TIMEOUT_MS)?.map(|ms| {
                if ms == 0 {
                    TimeoutPolicy::Never
                } else {
                    TimeoutPolicy::AfterMs(ms)
                }
            }),
            ..Self::new()
        };

        if let Some(raw) = lookup(ENV_DISABLE) {
            for name in raw.split(',').filter(|s| !s.trim().is_empty()) {
                let level = EscalationLevel::parse(name).ok_or_else(|| ConfigError::InvalidValue {
                    key: ENV_DISABLE.to_string(),
                    value: raw.clone(),
                })?;
                layer = layer.enable(level, false);
            }
        }

        Ok(layer)
    }
}

/// Merge the three configuration layers into an effective config.
///
/// Precedence is `global < operation_type < component`; the result is
/// normalized so thresholds stay ascending.
#[must_use]
pub fn resolve(
    global: &EscalationConfig,
    operation_type: &ConfigLayer,
    component: &ConfigLayer,
) -> EscalationConfig {
    component
        .apply_to(operation_type.apply_to(global.clone()))
        .normalized()
}

// ============================================================================
// Catalog
// ============================================================================

/// Global defaults plus named per-operation-type layers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ConfigCatalog {
    pub global: EscalationConfig,
    pub operation_types: HashMap<String, ConfigLayer>,
}

impl ConfigCatalog {
    /// Catalog with only a global layer.
    #[must_use]
    pub fn new(global: EscalationConfig) -> Self {
        Self {
            global,
            operation_types: HashMap::new(),
        }
    }

    /// Register the layer for an operation type (builder pattern).
    #[must_use]
    pub fn with_type(mut self, name: impl Into<String>, layer: ConfigLayer) -> Self {
        self.operation_types.insert(name.into(), layer);
        self
    }

    /// Layer for an operation type, if registered.
    #[must_use]
    pub fn type_layer(&self, name: &str) -> Option<&ConfigLayer> {
        self.operation_types.get(name)
    }

    /// Resolve the effective config for an operation.
    #[must_use]
    pub fn resolve_for(
        &self,
        operation_type: Option<&str>,
        component: Option<&ConfigLayer>,
    ) -> EscalationConfig {
        const EMPTY: ConfigLayer = ConfigLayer::new();
        let type_layer = operation_type
            .and_then(|name| self.type_layer(name))
            .unwrap_or(&EMPTY);
        resolve(&self.global, type_layer, component.unwrap_or(&EMPTY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: fn(u64) -> Duration = Duration::from_millis;

    fn thresholds() -> EscalationConfig {
        EscalationConfig::default().with_thresholds(200, 500, 2000)
    }

    #[test]
    fn level_boundaries_are_inclusive() {
        let c = thresholds();
        assert_eq!(c.level_at(MS(0)), EscalationLevel::None);
        assert_eq!(c.level_at(MS(199)), EscalationLevel::None);
        assert_eq!(c.level_at(MS(200)), EscalationLevel::Inline);
        assert_eq!(c.level_at(MS(499)), EscalationLevel::Inline);
        assert_eq!(c.level_at(MS(500)), EscalationLevel::Overlay);
        assert_eq!(c.level_at(MS(1999)), EscalationLevel::Overlay);
        assert_eq!(c.level_at(MS(2000)), EscalationLevel::Modal);
        assert_eq!(c.level_at(MS(60_000)), EscalationLevel::Modal);
    }

    #[test]
    fn disabled_level_is_skipped() {
        let c = thresholds().with_level(EscalationLevel::Inline, false);
        assert_eq!(c.level_at(MS(300)), EscalationLevel::None);
        assert_eq!(c.level_at(MS(500)), EscalationLevel::Overlay);
    }

    #[test]
    fn disabled_top_level_caps_escalation() {
        let c = thresholds().with_level(EscalationLevel::Modal, false);
        assert_eq!(c.level_at(MS(5000)), EscalationLevel::Overlay);
    }

    #[test]
    fn all_disabled_means_no_feedback() {
        let c = thresholds()
            .with_level(EscalationLevel::Inline, false)
            .with_level(EscalationLevel::Overlay, false)
            .with_level(EscalationLevel::Modal, false);
        assert!(c.feedback_disabled());
        assert_eq!(c.armed_levels().count(), 0);
        assert_eq!(c.level_at(MS(10_000)), EscalationLevel::None);
    }

    #[test]
    fn armed_levels_in_order() {
        let levels: Vec<_> = thresholds().armed_levels().collect();
        assert_eq!(
            levels,
            vec![
                (EscalationLevel::Inline, MS(200)),
                (EscalationLevel::Overlay, MS(500)),
                (EscalationLevel::Modal, MS(2000)),
            ]
        );
    }

    #[test]
    fn resolve_type_overrides_global() {
        let global = EscalationConfig::default().with_thresholds(200, 500, 2000);
        let by_type = ConfigLayer::new().inline_ms(300);
        let effective = resolve(&global, &by_type, &ConfigLayer::new());
        assert_eq!(effective.inline_threshold_ms, 300);
        assert_eq!(effective.overlay_threshold_ms, 500);
    }

    #[test]
    fn resolve_component_overrides_type() {
        let global = EscalationConfig::default();
        let by_type = ConfigLayer::new().inline_ms(300);
        let component = ConfigLayer::new().inline_ms(400);
        assert_eq!(
            resolve(&global, &by_type, &component).inline_threshold_ms,
            400
        );
    }

    #[test]
    fn resolve_enable_flags_follow_precedence() {
        let global = EscalationConfig::default().with_level(EscalationLevel::Modal, false);
        let by_type = ConfigLayer::new().enable(EscalationLevel::Modal, true);
        let component = ConfigLayer::new().enable(EscalationLevel::Overlay, false);
        let effective = resolve(&global, &by_type, &component);
        assert!(effective.enabled.modal);
        assert!(!effective.enabled.overlay);
        assert!(effective.enabled.inline);
    }

    #[test]
    fn resolve_timeout_can_be_cleared_by_specific_layer() {
        let global = EscalationConfig::default().with_timeout(TimeoutPolicy::AfterMs(30_000));
        let component = ConfigLayer::new().timeout(TimeoutPolicy::Never);
        let effective = resolve(&global, &ConfigLayer::new(), &component);
        assert_eq!(effective.timeout, TimeoutPolicy::Never);
    }

    #[test]
    fn resolve_normalizes_inverted_thresholds() {
        let global = EscalationConfig::default();
        let component = ConfigLayer::new().inline_ms(900);
        let effective = resolve(&global, &ConfigLayer::new(), &component);
        assert_eq!(effective.inline_threshold_ms, 900);
        assert_eq!(effective.overlay_threshold_ms, 900);
        assert_eq!(effective.modal_threshold_ms, 2000);
        assert!(effective.validate().is_ok());
    }

    #[test]
    fn validate_reports_first_inversion() {
        let c = EscalationConfig::default().with_thresholds(200, 100, 2000);
        assert_eq!(
            c.validate(),
            Err(ConfigError::ThresholdsOutOfOrder {
                level: EscalationLevel::Overlay,
                threshold_ms: 100,
                previous_ms: 200,
            })
        );
    }

    #[test]
    fn empty_layer_is_identity() {
        let layer = ConfigLayer::new();
        assert!(layer.is_empty());
        let base = thresholds();
        assert_eq!(layer.apply_to(base.clone()), base);
    }

    #[test]
    fn from_lookup_reads_all_keys() {
        let layer = ConfigLayer::from_lookup(|key| match key {
            ENV_INLINE_MS => Some("150".into()),
            ENV_MODAL_MS => Some(" 4000 ".into()),
            ENV_TIMEOUT_MS => Some("60000".into()),
            ENV_DISABLE => Some("overlay, Modal".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(layer.inline_threshold_ms, Some(150));
        assert_eq!(layer.overlay_threshold_ms, None);
        assert_eq!(layer.modal_threshold_ms, Some(4000));
        assert_eq!(layer.timeout, Some(TimeoutPolicy::AfterMs(60_000)));
        assert_eq!(layer.overlay_enabled, Some(false));
        assert_eq!(layer.modal_enabled, Some(false));
        assert_eq!(layer.inline_enabled, None);
    }

    #[test]
    fn from_lookup_zero_timeout_means_never() {
        let layer = ConfigLayer::from_lookup(|key| (key == ENV_TIMEOUT_MS).then(|| "0".into()))
            .unwrap();
        assert_eq!(layer.timeout, Some(TimeoutPolicy::Never));
    }

    #[test]
    fn from_lookup_rejects_garbage() {
        let err = ConfigLayer::from_lookup(|key| (key == ENV_OVERLAY_MS).then(|| "soon".into()))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: ENV_OVERLAY_MS.into(),
                value: "soon".into()
            }
        );

        let err = ConfigLayer::from_lookup(|key| (key == ENV_DISABLE).then(|| "popup".into()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_DISABLE));
    }

    #[test]
    fn from_lookup_empty_is_empty_layer() {
        assert!(ConfigLayer::from_lookup(|_| None).unwrap().is_empty());
    }

    #[test]
    fn catalog_resolves_by_type_and_component() {
        let catalog = ConfigCatalog::new(EscalationConfig::default())
            .with_type("build", ConfigLayer::new().inline_ms(300).modal_ms(10_000));

        let plain = catalog.resolve_for(None, None);
        assert_eq!(plain, EscalationConfig::default());

        let build = catalog.resolve_for(Some("build"), None);
        assert_eq!(build.inline_threshold_ms, 300);
        assert_eq!(build.modal_threshold_ms, 10_000);

        let component = ConfigLayer::new().inline_ms(400);
        let tuned = catalog.resolve_for(Some("build"), Some(&component));
        assert_eq!(tuned.inline_threshold_ms, 400);
        assert_eq!(tuned.modal_threshold_ms, 10_000);

        let unknown = catalog.resolve_for(Some("deploy"), None);
        assert_eq!(unknown, EscalationConfig::default());
    }

    #[test]
    fn level_ordering_matches_intensity() {
        assert!(EscalationLevel::None < EscalationLevel::Inline);
        assert!(EscalationLevel::Inline < EscalationLevel::Overlay);
        assert!(EscalationLevel::Overlay < EscalationLevel::Modal);
        assert_eq!(EscalationLevel::Overlay.to_string(), "overlay");
    }

    #[cfg(feature = "serde")]
    #[test]
    fn layer_deserializes_with_missing_fields() {
        let layer: ConfigLayer =
            serde_json::from_str(r#"{"inline_threshold_ms": 250, "modal_enabled": false}"#)
                .unwrap();
        assert_eq!(layer.inline_threshold_ms, Some(250));
        assert_eq!(layer.modal_enabled, Some(false));
        assert!(layer.timeout.is_none());
    }
}
