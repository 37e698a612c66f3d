//! Element - Leaf Data Producers
//!
//! An Element is the smallest unit that contributes a value to the
//! aggregated output table: an input widget, a timer, or a
//! programmer-set value. Variants are one sum type dispatched by
//! `match`, not a type hierarchy.

use crate::error::ValidationFailure;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-variant payload of an [`Element`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ElementKind {
    /// Shown (or held) as-is; never reads form input.
    Static,
    /// Free-text input.
    TextInput,
    /// Numeric input with optional bounds.
    NumberInput { min: Option<f64>, max: Option<f64> },
    /// One option out of a fixed list.
    Choice { options: Vec<String> },
    /// Elapsed-time probe. Started when its step is compiled, the
    /// client reports elapsed milliseconds on submit.
    Timer { started: Option<DateTime<Utc>> },
}

/// A leaf value producer owned by a Step.
///
/// Once the owning Step is left behind, the element is an immutable
/// record of what was shown or collected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Element {
    /// Column name in the output table. `None` means "not recorded".
    pub name: Option<String>,
    pub value: Value,
    /// Row multiplicity in the output table.
    pub n_rows: usize,
    /// When padding the table, repeat the last value instead of null.
    pub fill_rows: bool,
    pub kind: ElementKind,
}

impl Element {
    fn with_kind(name: Option<String>, kind: ElementKind) -> Self {
        Self {
            name,
            value: Value::Null,
            n_rows: 1,
            fill_rows: false,
            kind,
        }
    }

    /// A programmer-set value recorded under `name`.
    pub fn value(name: impl Into<String>, value: impl Into<Value>) -> Self {
        let mut el = Self::with_kind(Some(name.into()), ElementKind::Static);
        el.value = value.into();
        el
    }

    /// Display-only content, absent from the output table.
    pub fn display(value: impl Into<Value>) -> Self {
        let mut el = Self::with_kind(None, ElementKind::Static);
        el.value = value.into();
        el
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::with_kind(Some(name.into()), ElementKind::TextInput)
    }

    pub fn number(name: impl Into<String>, min: Option<f64>, max: Option<f64>) -> Self {
        Self::with_kind(Some(name.into()), ElementKind::NumberInput { min, max })
    }

    pub fn choice(name: impl Into<String>, options: Vec<String>) -> Self {
        Self::with_kind(Some(name.into()), ElementKind::Choice { options })
    }

    pub fn timer(name: impl Into<String>) -> Self {
        Self::with_kind(Some(name.into()), ElementKind::Timer { started: None })
    }

    /// Builder: set row multiplicity.
    pub fn rows(mut self, n_rows: usize) -> Self {
        self.n_rows = n_rows;
        self
    }

    /// Builder: pad this column by repeating its last value.
    pub fn fill(mut self) -> Self {
        self.fill_rows = true;
        self
    }

    /// Start the timer clock. No-op for other kinds.
    pub fn start_timer(&mut self, now: DateTime<Utc>) {
        if let ElementKind::Timer { started } = &mut self.kind {
            if started.is_none() {
                *started = Some(now);
            }
        }
    }

    /// Record a raw submitted form value into this element.
    pub fn record(&mut self, raw: &str) -> Result<(), ValidationFailure> {
        let name = self.name.clone().unwrap_or_default();
        match &self.kind {
            ElementKind::Static => Ok(()),
            ElementKind::TextInput => {
                self.value = Value::from(raw);
                Ok(())
            }
            ElementKind::NumberInput { min, max } => {
                let parsed: f64 = raw.trim().parse().map_err(|_| {
                    ValidationFailure::for_element(&name, format!("'{raw}' is not a number"))
                })?;
                if min.is_some_and(|m| parsed < m) || max.is_some_and(|m| parsed > m) {
                    return Err(ValidationFailure::for_element(
                        &name,
                        format!("{parsed} is out of range"),
                    ));
                }
                self.value = Value::from(parsed);
                Ok(())
            }
            ElementKind::Choice { options } => {
                if !options.iter().any(|o| o == raw) {
                    return Err(ValidationFailure::for_element(
                        &name,
                        format!("'{raw}' is not one of the offered options"),
                    ));
                }
                self.value = Value::from(raw);
                Ok(())
            }
            ElementKind::Timer { .. } => {
                let ms: f64 = raw.trim().parse().map_err(|_| {
                    ValidationFailure::for_element(&name, "timer value must be milliseconds")
                })?;
                self.value = Value::from(ms);
                Ok(())
            }
        }
    }

    /// Whether this element expects a form value on submit.
    pub fn takes_input(&self) -> bool {
        !matches!(self.kind, ElementKind::Static)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn number_input_enforces_bounds() {
        let mut el = Element::number("age", Some(0.0), Some(120.0));
        assert!(el.record("abc").is_err());
        assert!(el.record("150").is_err());
        el.record("42").unwrap();
        assert_eq!(el.value, Value::from(42.0));
    }

    #[test]
    fn choice_rejects_unknown_option() {
        let mut el = Element::choice("color", vec!["red".into(), "blue".into()]);
        let err = el.record("green").unwrap_err();
        assert_eq!(err.element.as_deref(), Some("color"));
        el.record("blue").unwrap();
        assert_eq!(el.value, Value::from("blue"));
    }
}
