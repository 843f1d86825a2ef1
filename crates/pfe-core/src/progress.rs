#![forbid(unsafe_code)]

//! Progress payloads and shallow-merge updates.
//!
//! A [`Progress`] is either indeterminate (completion cannot be measured) or
//! determinate (a percentage in `0..=100`), with an optional message. Work
//! reports changes as [`ProgressUpdate`]s whose fields are all optional; a
//! field left out keeps its previous value.
//!
//! # Merge Rules
//!
//! | Update fields | Result |
//! |---------------|--------|
//! | `kind = Indeterminate` | value cleared, message kept unless supplied |
//! | `kind = Determinate`, no value | previous value kept (0 if none) |
//! | `value` without `kind` | implies `Determinate` |
//! | non-finite `value` | ignored |
//! | `message` | replaces the previous message |
//!
//! # Invariants
//!
//! - `value()` is `Some` if and only if the kind is `Determinate`.
//! - Values are always clamped to `0.0..=100.0`.

/// Whether completion of an operation can be measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum ProgressKind {
    /// Unknown completion.
    #[default]
    Indeterminate,
    /// Completion as a percentage.
    Determinate,
}

impl ProgressKind {
    /// Get the stable string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Indeterminate => "indeterminate",
            Self::Determinate => "determinate",
        }
    }
}

/// Current progress of one operation.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Progress {
    kind: ProgressKind,
    value: Option<f32>,
    message: Option<String>,
}

fn clamp_percent(value: f32) -> Option<f32> {
    value.is_finite().then(|| value.clamp(0.0, 100.0))
}

impl Progress {
    /// Indeterminate progress without a message.
    #[must_use]
    pub fn indeterminate() -> Self {
        Self::default()
    }

    /// Determinate progress at `value` percent (clamped, NaN becomes 0).
    #[must_use]
    pub fn determinate(value: f32) -> Self {
        Self {
            kind: ProgressKind::Determinate,
            value: Some(clamp_percent(value).unwrap_or(0.0)),
            message: None,
        }
    }

    /// Attach a message (builder pattern).
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> ProgressKind {
        self.kind
    }

    /// Percentage, present only when determinate.
    #[inline]
    #[must_use]
    pub fn value(&self) -> Option<f32> {
        self.value
    }

    #[inline]
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    #[inline]
    #[must_use]
    pub fn is_determinate(&self) -> bool {
        self.kind == ProgressKind::Determinate
    }

    /// Merge `update` into this progress in place.
    pub fn apply(&mut self, update: &ProgressUpdate) {
        let value = update.value.and_then(clamp_percent);
        let kind = match (update.kind, value) {
            (Some(kind), _) => kind,
            (None, Some(_)) => ProgressKind::Determinate,
            (None, None) => self.kind,
        };

        match kind {
            ProgressKind::Indeterminate => self.value = None,
            ProgressKind::Determinate => {
                self.value = value.or(self.value).or(Some(0.0));
            }
        }
        self.kind = kind;

        if let Some(message) = &update.message {
            self.message = Some(message.clone());
        }
    }

    /// Return a copy with `update` merged in.
    #[must_use]
    pub fn merged(&self, update: &ProgressUpdate) -> Self {
        let mut next = self.clone();
        next.apply(update);
        next
    }
}

/// A partial progress change. Absent fields keep their previous value.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProgressUpdate {
    pub kind: Option<ProgressKind>,
    pub value: Option<f32>,
    pub message: Option<String>,
}

impl ProgressUpdate {
    /// An update that changes nothing.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            kind: None,
            value: None,
            message: None,
        }
    }

    /// Switch to indeterminate progress.
    #[must_use]
    pub const fn indeterminate() -> Self {
        Self {
            kind: Some(ProgressKind::Indeterminate),
            value: None,
            message: None,
        }
    }

    /// Switch to determinate progress at `value` percent.
    #[must_use]
    pub const fn determinate(value: f32) -> Self {
        Self {
            kind: Some(ProgressKind::Determinate),
            value: Some(value),
            message: None,
        }
    }

    /// Build an update from work counters.
    ///
    /// `total == 0` means the amount of work is unknown and yields an
    /// indeterminate update.
    #[must_use]
    pub fn from_counts(current: u64, total: u64, message: Option<String>) -> Self {
        let mut update = if total == 0 {
            Self::indeterminate()
        } else {
            let pct = (current as f64 / total as f64 * 100.0).min(100.0) as f32;
            Self::determinate(pct)
        };
        update.message = message;
        update
    }

    /// Set the percentage (builder pattern).
    #[must_use]
    pub fn value(mut self, value: f32) -> Self {
        self.value = Some(value);
        self
    }

    /// Set the message (builder pattern).
    #[must_use]
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Check whether this update carries no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kind.is_none() && self.value.is_none() && self.message.is_none()
    }
}
