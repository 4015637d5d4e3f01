#![forbid(unsafe_code)]

//! Runtime value model shared by the parser and the evaluator: the typed
//! [`Value`] union, the declared field schema, and the double-to-string
//! display policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Double,
    Str,
    Bool,
    Opaque,
}

/// One intermediate or final expression result. Only the payload matching
/// the variant is meaningful; `Opaque(None)` stands for a null/missing
/// attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Double(f64),
    Str(String),
    Bool(bool),
    Opaque(Option<String>),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Double(_) => ValueKind::Double,
            Self::Str(_) => ValueKind::Str,
            Self::Bool(_) => ValueKind::Bool,
            Self::Opaque(_) => ValueKind::Opaque,
        }
    }

    /// Render the value as label text. Label rendering must always degrade
    /// gracefully, so this never fails: missing opaque values become the
    /// empty string.
    #[must_use]
    pub fn to_display(&self, format: &FloatFormat) -> String {
        match self {
            Self::Double(v) => format.format(*v),
            Self::Str(v) => v.clone(),
            Self::Bool(true) => "True".to_owned(),
            Self::Bool(false) => "False".to_owned(),
            Self::Opaque(Some(v)) => v.clone(),
            Self::Opaque(None) => String::new(),
        }
    }
}

/// Double-to-string conversion policy shared by everything that renders
/// numeric label text.
///
/// The default renders finite integral doubles without a fractional part
/// (`8`, not `8.0`) and everything else through the shortest form. A fixed
/// number of decimals is selected with a display pattern such as `"0.###"`,
/// `"0.00"`, or `".2"`; unrecognized patterns keep the default rendering
/// rather than erroring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatFormat {
    precision: Option<usize>,
}

impl FloatFormat {
    #[must_use]
    pub fn from_pattern(pattern: &str) -> Self {
        let Some((_, fraction)) = pattern.split_once('.') else {
            return Self::default();
        };
        let marks = fraction
            .chars()
            .take_while(|c| matches!(c, '0' | '#'))
            .count();
        if marks > 0 {
            return Self {
                precision: Some(marks),
            };
        }
        let digits: String = fraction.chars().take_while(char::is_ascii_digit).collect();
        match digits.parse() {
            Ok(precision) => Self {
                precision: Some(precision),
            },
            Err(_) => Self::default(),
        }
    }

    #[must_use]
    pub fn format(&self, value: f64) -> String {
        match self.precision {
            Some(precision) => format!("{value:.precision$}"),
            None => {
                // Large magnitudes keep the shortest form; `{:.0}` would
                // expand them to long digit runs.
                if value.is_finite() && value == value.trunc() && value.abs() < 1e15 {
                    format!("{value:.0}")
                } else {
                    format!("{value}")
                }
            }
        }
    }
}

/// A named, typed column declared by the tabular data source. Immutable
/// once built; the schema is only replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub kind: ValueKind,
}

impl Field {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// The external tabular collaborator: fetch a named column's raw value for
/// the current row. The synthetic `fid` pseudo-field is resolved by the
/// engine, never through this trait.
pub trait AttributeRow {
    fn value(&self, name: &str) -> Option<Value>;
}

impl AttributeRow for BTreeMap<String, Value> {
    fn value(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{AttributeRow, Field, FloatFormat, Value, ValueKind};

    #[test]
    fn default_format_drops_fractional_part_of_integral_doubles() {
        let format = FloatFormat::default();
        assert_eq!(format.format(8.0), "8");
        assert_eq!(format.format(-3.0), "-3");
        assert_eq!(format.format(0.25), "0.25");
    }

    #[test]
    fn pattern_with_decimal_marks_fixes_precision() {
        let format = FloatFormat::from_pattern("0.00");
        assert_eq!(format.format(0.5), "0.50");
        assert_eq!(format.format(8.0), "8.00");

        let hashes = FloatFormat::from_pattern("0.###");
        assert_eq!(hashes.format(1.0 / 3.0), "0.333");

        let printf_style = FloatFormat::from_pattern(".2");
        assert_eq!(printf_style.format(1.005), "1.00");
    }

    #[test]
    fn unrecognized_pattern_keeps_default_rendering() {
        let format = FloatFormat::from_pattern("general");
        assert_eq!(format, FloatFormat::default());
        assert_eq!(format.format(12.5), "12.5");
    }

    #[test]
    fn display_strings_cover_every_kind() {
        let format = FloatFormat::default();
        assert_eq!(Value::Bool(true).to_display(&format), "True");
        assert_eq!(Value::Bool(false).to_display(&format), "False");
        assert_eq!(Value::Str("Lake".to_owned()).to_display(&format), "Lake");
        assert_eq!(Value::Opaque(None).to_display(&format), "");
        assert_eq!(
            Value::Opaque(Some("blob".to_owned())).to_display(&format),
            "blob"
        );
    }

    #[test]
    fn kind_matches_variant() {
        assert_eq!(Value::Double(1.0).kind(), ValueKind::Double);
        assert_eq!(Value::Str(String::new()).kind(), ValueKind::Str);
        assert_eq!(Value::Bool(false).kind(), ValueKind::Bool);
        assert_eq!(Value::Opaque(None).kind(), ValueKind::Opaque);
    }

    #[test]
    fn value_round_trips_through_serde() {
        let value = Value::Str("(pop)".to_owned());
        let encoded = serde_json::to_string(&value).expect("encode");
        let decoded: Value = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn btreemap_rows_resolve_values_by_exact_name() {
        let mut row = BTreeMap::new();
        row.insert("NAME".to_owned(), Value::Str("Lake".to_owned()));

        assert_eq!(row.value("NAME"), Some(Value::Str("Lake".to_owned())));
        assert_eq!(row.value("name"), None);
        let _ = Field::new("NAME", ValueKind::Str);
    }
}
