#![forbid(unsafe_code)]

//! Evaluates a compiled label expression program against attribute rows.
//!
//! The compiled [`Program`] is immutable; each evaluation works through a
//! scratch arena of per-element registers (`turned_off`, calculated value)
//! that is rebuilt per row. The first successful row records the exact
//! operator resolution order per part; later rows replay that recorded
//! [`Operation`] sequence instead of re-deriving operator precedence.
//!
//! The [`Expression`] engine surface is total: `evaluate` never fails, it
//! degrades to literal field substitution on the raw text and keeps the
//! diagnostic retrievable through `last_error`.

use std::cmp::Ordering;
use std::sync::LazyLock;

use lx_parse::{Element, Op, ParseError, Part, Program, parse_program};
use lx_value::{AttributeRow, Field, FloatFormat, Value, ValueKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

static FIELD_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]").expect("field reference pattern compiles"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("no operation found among the remaining elements")]
    OperationNotFound,
    #[error("operator '{op}' found where a value was expected")]
    OperatorInsteadOfValue { op: Op },
    #[error("right operand is missing for operator '{op}'")]
    RightOperandMissing { op: Op },
    #[error("left operand is missing for operator '{op}'")]
    LeftOperandMissing { op: Op },
    #[error("operation '{op}' is not supported for operands of kind {left:?} and {right:?}")]
    OperationNotSupported {
        op: Op,
        left: ValueKind,
        right: ValueKind,
    },
    #[error("the plus operator is not allowed for a boolean operand")]
    PlusNotAllowed,
    #[error("division by zero")]
    ZeroDivision,
    #[error("field not found: [{name}]")]
    FieldNotFound { name: String },
}

/// One recorded application of an operator to its resolved operand(s).
/// `left` is `None` for unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub op_element: usize,
    pub left: Option<usize>,
    pub right: usize,
}

/// Per-element scratch register, reset at the start of every evaluation.
/// `value` holds a field's row value first, then any calculated result.
#[derive(Debug, Clone, Default)]
struct Register {
    turned_off: bool,
    value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    Unparsed,
    Valid,
    Invalid,
}

/// The caller-facing engine: parse once, evaluate per feature row.
#[derive(Debug)]
pub struct Expression {
    fields: Vec<Field>,
    format: FloatFormat,
    text: String,
    state: ParseState,
    parse_error: Option<ParseError>,
    program: Option<Program>,
    cache: Option<Vec<Vec<Operation>>>,
    last_error: Option<String>,
}

impl Default for Expression {
    fn default() -> Self {
        Self::new()
    }
}

impl Expression {
    #[must_use]
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            format: FloatFormat::default(),
            text: String::new(),
            state: ParseState::Unparsed,
            parse_error: None,
            program: None,
            cache: None,
            last_error: None,
        }
    }

    /// Set the display format used for all subsequent double-to-string
    /// conversions.
    pub fn set_float_format(&mut self, pattern: &str) {
        self.format = FloatFormat::from_pattern(pattern);
    }

    /// Replace the known field schema. The compiled expression structure is
    /// kept; field references are re-resolved by name on every evaluation,
    /// so only type/name resolution is affected.
    pub fn set_fields(&mut self, fields: Vec<Field>) {
        self.fields = fields;
    }

    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Compile the expression text. Idempotent for identical text: the
    /// cached verdict is returned without re-parsing. New text discards the
    /// compiled program and the recorded operation cache.
    pub fn parse(&mut self, text: &str) -> Result<(), ParseError> {
        if self.state != ParseState::Unparsed && self.text == text {
            return match &self.parse_error {
                None => Ok(()),
                Some(err) => Err(err.clone()),
            };
        }

        debug!(target: "labelex", "compiling expression text");
        text.clone_into(&mut self.text);
        self.program = None;
        self.cache = None;
        self.parse_error = None;

        if text.trim().is_empty() {
            self.state = ParseState::Valid;
            return Ok(());
        }

        match parse_program(text, &self.fields) {
            Ok(program) => {
                self.program = Some(program);
                self.state = ParseState::Valid;
                Ok(())
            }
            Err(err) => {
                self.state = ParseState::Invalid;
                self.last_error = Some(err.to_string());
                self.parse_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Evaluate against one row. Total: never fails. Empty text yields an
    /// empty string; an invalid expression or a failing row yields the
    /// literal-substitution fallback. A successful fresh run freezes the
    /// operation sequence for replay on subsequent rows.
    pub fn evaluate(&mut self, row: &dyn AttributeRow, fid: i64) -> String {
        if self.text.trim().is_empty() {
            return String::new();
        }

        let result = {
            let Some(program) = self.program.as_ref() else {
                return self.fallback(row, fid);
            };
            run(
                program,
                self.cache.as_deref(),
                &self.fields,
                &self.format,
                row,
                fid,
            )
        };

        match result {
            Ok((value, recorded)) => {
                if let Some(operations) = recorded {
                    self.cache = Some(operations);
                }
                value.to_display(&self.format)
            }
            Err(err) => {
                debug!(target: "labelex", error = %err, "evaluation failed; using literal fallback");
                self.last_error = Some(err.to_string());
                self.fallback(row, fid)
            }
        }
    }

    /// The most recent human-readable diagnostic, for UI display only.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Degraded path: substitute raw row values for `[field]` references in
    /// the original text, leaving every other token as plain text. Unknown
    /// names stay untouched so the caller always gets a displayable string.
    fn fallback(&self, row: &dyn AttributeRow, fid: i64) -> String {
        FIELD_REFERENCE
            .replace_all(&self.text, |caps: &regex::Captures<'_>| {
                let name = &caps[1];
                if name.eq_ignore_ascii_case("fid") {
                    return fid.to_string();
                }
                let resolved = self
                    .fields
                    .iter()
                    .find(|field| field.name.eq_ignore_ascii_case(name))
                    .and_then(|field| row.value(&field.name));
                match resolved {
                    Some(value) => value.to_display(&self.format),
                    None => caps[0].to_owned(),
                }
            })
            .into_owned()
    }
}

fn run(
    program: &Program,
    cache: Option<&[Vec<Operation>]>,
    fields: &[Field],
    format: &FloatFormat,
    row: &dyn AttributeRow,
    fid: i64,
) -> Result<(Value, Option<Vec<Vec<Operation>>>), EvalError> {
    trace!(target: "labelex", replaying = cache.is_some(), "evaluating row");

    let mut registers: Vec<Vec<Register>> = program
        .parts
        .iter()
        .map(|part| vec![Register::default(); part.elements.len()])
        .collect();

    // Seed every field register from the row once, instead of walking the
    // whole part tree per row.
    for &(part_index, element_index) in &program.variables {
        if let Element::Field { name } = &program.parts[part_index].elements[element_index] {
            registers[part_index][element_index].value =
                Some(resolve_field(name, fields, row, fid)?);
        }
    }

    let mut part_values: Vec<Option<Value>> = vec![None; program.parts.len()];
    let mut recorded: Vec<Vec<Operation>> = Vec::new();

    // Parts run in construction order: inner brackets were appended before
    // the parts that reference them.
    for (part_index, part) in program.parts.iter().enumerate() {
        let mut operations = Vec::new();
        let mut replay = match cache {
            Some(all) => Some(
                all.get(part_index)
                    .ok_or(EvalError::OperationNotFound)?
                    .iter(),
            ),
            None => None,
        };

        loop {
            let regs = &mut registers[part_index];
            let active: Vec<usize> = (0..part.elements.len())
                .filter(|&j| !regs[j].turned_off)
                .collect();

            if let [only] = active.as_slice() {
                let value = element_value(&part.elements[*only], &regs[*only], &part_values)?;
                part_values[part_index] = Some(value);
                break;
            }
            if active.is_empty() {
                return Err(EvalError::OperationNotFound);
            }

            let operation = match replay.as_mut() {
                Some(iter) => iter.next().copied().ok_or(EvalError::OperationNotFound)?,
                None => find_operation(part, regs)?,
            };
            apply_operation(part, &operation, regs, &part_values, format)?;
            if cache.is_none() {
                operations.push(operation);
            }
        }

        if cache.is_none() {
            recorded.push(operations);
        }
    }

    let value = part_values
        .pop()
        .flatten()
        .ok_or(EvalError::OperationNotFound)?;
    Ok((value, if cache.is_none() { Some(recorded) } else { None }))
}

fn resolve_field(
    name: &str,
    fields: &[Field],
    row: &dyn AttributeRow,
    fid: i64,
) -> Result<Value, EvalError> {
    if name.eq_ignore_ascii_case("fid") {
        return Ok(Value::Double(fid as f64));
    }
    fields
        .iter()
        .find(|field| field.name.eq_ignore_ascii_case(name))
        .and_then(|field| row.value(&field.name))
        .ok_or_else(|| EvalError::FieldNotFound {
            name: name.to_owned(),
        })
}

/// The current value of one element: a calculated result if this pass
/// already produced one, otherwise the literal / seeded field value /
/// referenced part result.
fn element_value(
    element: &Element,
    register: &Register,
    part_values: &[Option<Value>],
) -> Result<Value, EvalError> {
    if let Some(value) = &register.value {
        return Ok(value.clone());
    }
    match element {
        Element::Literal { value } => Ok(value.clone()),
        Element::Part { index } => part_values
            .get(*index)
            .and_then(Clone::clone)
            .ok_or(EvalError::OperationNotFound),
        Element::Field { name } => Err(EvalError::FieldNotFound { name: name.clone() }),
        Element::Op { op } => Err(EvalError::OperatorInsteadOfValue { op: *op }),
    }
}

/// Pick the leftmost not-turned-off operator at the minimum priority value,
/// then resolve its operands. A unary operator sitting where the right
/// operand should be takes over as this round's operation, so unary chains
/// (`2 * -3`, `not not true`) reduce innermost value first.
fn find_operation(part: &Part, regs: &[Register]) -> Result<Operation, EvalError> {
    let mut best: Option<(usize, Op)> = None;
    for (index, element) in part.elements.iter().enumerate() {
        if regs[index].turned_off {
            continue;
        }
        if let Element::Op { op } = element {
            let better = match best {
                None => true,
                Some((_, current)) => op.priority() < current.priority(),
            };
            if better {
                best = Some((index, *op));
            }
        }
    }
    let Some((mut op_index, mut op)) = best else {
        return Err(EvalError::OperationNotFound);
    };

    let right = loop {
        let next = part
            .elements
            .iter()
            .enumerate()
            .skip(op_index + 1)
            .find(|(index, _)| !regs[*index].turned_off);
        match next {
            None => return Err(EvalError::RightOperandMissing { op }),
            Some((index, Element::Op { op: inner })) => {
                if inner.is_unary() {
                    op_index = index;
                    op = *inner;
                } else {
                    return Err(EvalError::OperatorInsteadOfValue { op: *inner });
                }
            }
            Some((index, _)) => break index,
        }
    };

    if op.is_unary() {
        return Ok(Operation {
            op_element: op_index,
            left: None,
            right,
        });
    }

    let left = part
        .elements
        .iter()
        .enumerate()
        .take(op_index)
        .rev()
        .find(|(index, _)| !regs[*index].turned_off)
        .map(|(index, _)| index)
        .ok_or(EvalError::LeftOperandMissing { op })?;

    Ok(Operation {
        op_element: op_index,
        left: Some(left),
        right,
    })
}

fn apply_operation(
    part: &Part,
    operation: &Operation,
    regs: &mut [Register],
    part_values: &[Option<Value>],
    format: &FloatFormat,
) -> Result<(), EvalError> {
    let Element::Op { op } = part.elements[operation.op_element] else {
        return Err(EvalError::OperationNotFound);
    };
    let right = element_value(&part.elements[operation.right], &regs[operation.right], part_values)?;

    let result = match operation.left {
        None => apply_unary(op, right)?,
        Some(left_index) => {
            if let Element::Op { op: left_op } = part.elements[left_index] {
                return Err(EvalError::OperatorInsteadOfValue { op: left_op });
            }
            let left = element_value(&part.elements[left_index], &regs[left_index], part_values)?;
            apply_binary(op, left, right, format)?
        }
    };

    regs[operation.op_element].turned_off = true;
    match operation.left {
        None => regs[operation.right].value = Some(result),
        Some(left_index) => {
            regs[operation.right].turned_off = true;
            regs[left_index].value = Some(result);
        }
    }
    Ok(())
}

fn apply_unary(op: Op, operand: Value) -> Result<Value, EvalError> {
    match (op, operand) {
        (Op::Not, Value::Bool(b)) => Ok(Value::Bool(!b)),
        (Op::ChangeSign, Value::Double(d)) => Ok(Value::Double(-d)),
        (op, other) => Err(EvalError::OperationNotSupported {
            op,
            left: other.kind(),
            right: other.kind(),
        }),
    }
}

fn apply_binary(op: Op, left: Value, right: Value, format: &FloatFormat) -> Result<Value, EvalError> {
    // Line-break concatenation is type-agnostic by contract.
    if op == Op::LineBreak {
        let separator = if cfg!(windows) { "\r\n" } else { "\n" };
        return Ok(Value::Str(format!(
            "{}{separator}{}",
            left.to_display(format),
            right.to_display(format)
        )));
    }

    match (&left, &right) {
        (Value::Double(l), Value::Double(r)) => numeric_op(op, *l, *r),
        (Value::Str(l), Value::Str(r)) => string_op(op, l, r),
        (Value::Bool(l), Value::Bool(r)) => boolean_op(op, *l, *r),
        _ => mixed_op(op, &left, &right, format),
    }
}

fn numeric_op(op: Op, l: f64, r: f64) -> Result<Value, EvalError> {
    let value = match op {
        Op::Lt => return Ok(Value::Bool(l < r)),
        Op::Le => return Ok(Value::Bool(l <= r)),
        Op::Gt => return Ok(Value::Bool(l > r)),
        Op::Ge => return Ok(Value::Bool(l >= r)),
        Op::Eq => return Ok(Value::Bool(l == r)),
        Op::Ne => return Ok(Value::Bool(l != r)),
        Op::Add => l + r,
        Op::Sub => l - r,
        Op::Mul => l * r,
        Op::Div => {
            if r == 0.0 {
                return Err(EvalError::ZeroDivision);
            }
            l / r
        }
        Op::IntDiv => {
            let divisor = r.trunc();
            if divisor == 0.0 {
                return Err(EvalError::ZeroDivision);
            }
            (l.trunc() / divisor).trunc()
        }
        Op::Mod => {
            let divisor = r.trunc();
            if divisor == 0.0 {
                return Err(EvalError::ZeroDivision);
            }
            l.trunc() % divisor
        }
        Op::Pow => l.powf(r),
        other => {
            return Err(EvalError::OperationNotSupported {
                op: other,
                left: ValueKind::Double,
                right: ValueKind::Double,
            });
        }
    };
    Ok(Value::Double(value))
}

/// String comparison is ordinal and case-insensitive.
fn string_op(op: Op, l: &str, r: &str) -> Result<Value, EvalError> {
    if op == Op::Add {
        return Ok(Value::Str(format!("{l}{r}")));
    }
    let order = l.to_lowercase().cmp(&r.to_lowercase());
    let outcome = match op {
        Op::Eq => order == Ordering::Equal,
        Op::Ne => order != Ordering::Equal,
        Op::Lt => order == Ordering::Less,
        Op::Le => order != Ordering::Greater,
        Op::Gt => order == Ordering::Greater,
        Op::Ge => order != Ordering::Less,
        other => {
            return Err(EvalError::OperationNotSupported {
                op: other,
                left: ValueKind::Str,
                right: ValueKind::Str,
            });
        }
    };
    Ok(Value::Bool(outcome))
}

fn boolean_op(op: Op, l: bool, r: bool) -> Result<Value, EvalError> {
    let outcome = match op {
        Op::And => l && r,
        Op::Or => l || r,
        Op::Xor => l ^ r,
        Op::Eq => l == r,
        Op::Ne => l != r,
        other => {
            return Err(EvalError::OperationNotSupported {
                op: other,
                left: ValueKind::Bool,
                right: ValueKind::Bool,
            });
        }
    };
    Ok(Value::Bool(outcome))
}

/// Operands of differing kinds admit only `+`, and only when neither side
/// is boolean; the result is display-string concatenation.
fn mixed_op(op: Op, left: &Value, right: &Value, format: &FloatFormat) -> Result<Value, EvalError> {
    if op != Op::Add {
        return Err(EvalError::OperationNotSupported {
            op,
            left: left.kind(),
            right: right.kind(),
        });
    }
    if matches!(left, Value::Bool(_)) || matches!(right, Value::Bool(_)) {
        return Err(EvalError::PlusNotAllowed);
    }
    Ok(Value::Str(format!(
        "{}{}",
        left.to_display(format),
        right.to_display(format)
    )))
}
