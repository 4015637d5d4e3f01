#![forbid(unsafe_code)]

//! labelex — an embedded expression language for per-feature map labels.
//!
//! A label expression such as `[NAME] + " (" + [POP]/1000 + "k)"` is parsed
//! once into a flat program and then evaluated against many attribute rows
//! without re-parsing. Evaluation is total: failing rows fall back to
//! literal field substitution so every feature still gets a label.
//!
//! ```
//! use labelex::{Expression, Field, Value, ValueKind};
//! use std::collections::BTreeMap;
//!
//! let mut expr = Expression::new();
//! expr.set_fields(vec![Field::new("NAME", ValueKind::Str)]);
//! expr.parse(r#"[NAME] + " #" + [FID]"#).expect("valid expression");
//!
//! let mut row = BTreeMap::new();
//! row.insert("NAME".to_owned(), Value::Str("Lake".to_owned()));
//! assert_eq!(expr.evaluate(&row, 7), "Lake #7");
//! ```

pub use lx_eval::{EvalError, Expression, Operation};
pub use lx_parse::{Element, Extraction, Op, ParseError, Part, Program, extract, parse_program};
pub use lx_value::{AttributeRow, Field, FloatFormat, Value, ValueKind};

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Expression, Field, Value, ValueKind};

    #[test]
    fn facade_exposes_the_full_engine_surface() {
        let mut expression = Expression::new();
        expression.set_fields(vec![Field::new("NAME", ValueKind::Str)]);
        expression.set_float_format("0.0");
        expression.parse(r#"[NAME] + ": " + 1 / 2"#).expect("parse");

        let mut row = BTreeMap::new();
        row.insert("NAME".to_owned(), Value::Str("Lake".to_owned()));
        assert_eq!(expression.evaluate(&row, 0), "Lake: 0.5");
        assert!(expression.last_error().is_none());
    }
}
