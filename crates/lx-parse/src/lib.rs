#![forbid(unsafe_code)]

//! Turns raw label expression text into a flat, bracket-free program.
//!
//! Parsing runs in three passes. The extractor pulls `[Field]` references
//! and `"string"` literals out of the text, leaving `{f<k>}` / `{s<k>}`
//! placeholders behind so the later passes never have to worry about
//! operator characters hiding inside user text. The bracket flattener then
//! repeatedly reduces the innermost `(...)` span to a `{p<k>}` placeholder,
//! producing one [`Part`] per bracket plus a final outermost part. The
//! element reader parses each span into an alternating value/operator
//! element sequence.

use std::ops::Range;
use std::sync::LazyLock;

use lx_value::{Field, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static FIELD_REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]").expect("field reference pattern compiles"));

static STRING_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""((?:[^"]|"")*)""#).expect("string literal pattern compiles"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed syntax: {detail}")]
    MalformedSyntax { detail: String },
    #[error("unpaired text quote")]
    UnpairedQuote,
    #[error("empty field reference")]
    EmptyFieldReference,
    #[error("unpaired square bracket")]
    UnpairedBracket,
    #[error("field not found: [{name}]")]
    FieldNotFound { name: String },
    #[error("not a number: {text}")]
    NotANumber { text: String },
    #[error("operator expected at position {position} but found '{found}'")]
    OperatorExpected { found: char, position: usize },
    #[error("operand expected at position {position} but found {found}")]
    OperandExpected { found: String, position: usize },
}

/// The fixed operator set. Priority 1 binds tightest; operators of equal
/// priority within a part resolve leftmost-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Pow,
    Mul,
    Div,
    IntDiv,
    Mod,
    Add,
    Sub,
    ChangeSign,
    Eq,
    Ne,
    Le,
    Ge,
    Lt,
    Gt,
    LineBreak,
    Not,
    And,
    Or,
    Xor,
}

impl Op {
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::Pow => 1,
            Self::Mul | Self::Div | Self::IntDiv | Self::Mod => 2,
            Self::Add | Self::Sub | Self::ChangeSign => 3,
            Self::Eq | Self::Ne | Self::Le | Self::Ge | Self::Lt | Self::Gt => 4,
            Self::LineBreak | Self::Not | Self::And => 5,
            Self::Or | Self::Xor => 6,
        }
    }

    #[must_use]
    pub fn is_unary(self) -> bool {
        matches!(self, Self::Not | Self::ChangeSign)
    }

    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Pow => "^",
            Self::Mul => "*",
            Self::Div => "/",
            Self::IntDiv => "\\",
            Self::Mod => "MOD",
            Self::Add => "+",
            Self::Sub | Self::ChangeSign => "-",
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Le => "<=",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::LineBreak => "\\n",
            Self::Not => "not",
            Self::And => "and",
            Self::Or => "or",
            Self::Xor => "xor",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// One atomic token within a part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Element {
    Literal { value: Value },
    Field { name: String },
    Part { index: usize },
    Op { op: Op },
}

/// A fully bracket-delimited (or outermost) span of the expression,
/// flattened into its element sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub elements: Vec<Element>,
}

/// The compiled form of one expression: parts in innermost-first order
/// (a part may reference only earlier parts, so dependencies form a linear
/// chain) plus the flat coordinates of every field reference, so the
/// evaluator can seed a row's values without walking the whole tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub parts: Vec<Part>,
    pub variables: Vec<(usize, usize)>,
}

/// The placeholder-substituted text plus the parallel lookup tables the
/// placeholders index into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    pub fields: Vec<String>,
    pub strings: Vec<String>,
}

/// Pull field references and string literals out of the raw text.
///
/// Fields are extracted before strings, so a field name containing a quote
/// is never mistaken for a string literal. Matches are substituted
/// right-to-left so earlier match offsets never shift.
pub fn extract(raw: &str) -> Result<Extraction, ParseError> {
    if raw.contains('{') || raw.contains('}') {
        return Err(ParseError::MalformedSyntax {
            detail: "curly braces are reserved for internal placeholders".to_owned(),
        });
    }
    let mut text = raw.to_owned();
    let fields = replace_matches(&mut text, &FIELD_REFERENCE, 'f');
    let strings: Vec<String> = replace_matches(&mut text, &STRING_LITERAL, 's')
        .into_iter()
        .map(|s| s.replace("\"\"", "\""))
        .collect();

    // Only checked once string contents are out of the way: `[]` inside a
    // quoted literal is plain text, not a field reference.
    if text.contains("[]") {
        return Err(ParseError::EmptyFieldReference);
    }
    if text.contains('"') {
        return Err(ParseError::UnpairedQuote);
    }
    if text.contains('[') || text.contains(']') {
        return Err(ParseError::UnpairedBracket);
    }

    Ok(Extraction {
        text,
        fields,
        strings,
    })
}

fn replace_matches(text: &mut String, pattern: &Regex, tag: char) -> Vec<String> {
    let found: Vec<(Range<usize>, String)> = pattern
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let inner = caps.get(1)?;
            Some((whole.range(), inner.as_str().to_owned()))
        })
        .collect();

    for (index, (range, _)) in found.iter().enumerate().rev() {
        text.replace_range(range.clone(), &format!("{{{tag}{index}}}"));
    }

    found.into_iter().map(|(_, content)| content).collect()
}

/// Flatten the raw expression into a [`Program`].
///
/// Each iteration locates the first `)` and its innermost matching `(`,
/// reads the span into a new part, and substitutes `{p<index>}` in the
/// outer text; every iteration removes exactly one bracket pair, so the
/// loop terminates with the whole remaining text as the outermost part.
pub fn parse_program(raw: &str, fields: &[Field]) -> Result<Program, ParseError> {
    let extraction = extract(raw)?;
    let mut text = extraction.text.clone();
    let mut parts = Vec::new();

    loop {
        let Some(close) = text.find(')') else {
            parts.push(read_part(&text, &extraction, fields)?);
            break;
        };
        let open = text[..close]
            .rfind('(')
            .ok_or_else(|| ParseError::MalformedSyntax {
                detail: "closing parenthesis without a matching opening one".to_owned(),
            })?;
        parts.push(read_part(&text[open + 1..close], &extraction, fields)?);
        let placeholder = format!("{{p{}}}", parts.len() - 1);
        text.replace_range(open..=close, &placeholder);
    }

    let mut variables = Vec::new();
    for (part_index, part) in parts.iter().enumerate() {
        for (element_index, element) in part.elements.iter().enumerate() {
            if matches!(element, Element::Field { .. }) {
                variables.push((part_index, element_index));
            }
        }
    }

    Ok(Program { parts, variables })
}

/// Read one span into an element sequence, alternating between "expect
/// value" and "expect operator" states. Unary `not` and `-` do not flip
/// the state since a value must still follow them.
pub fn read_part(span: &str, extraction: &Extraction, fields: &[Field]) -> Result<Part, ParseError> {
    let chars: Vec<char> = span.chars().collect();
    let mut elements = Vec::new();
    let mut expect_value = true;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == ' ' || c == '\t' || c == '\r' {
            i += 1;
            continue;
        }

        if expect_value {
            match c {
                // A newline only acts as the line-break operator between
                // values; in operand position it is layout.
                '\n' => {
                    i += 1;
                }
                '{' => {
                    elements.push(read_placeholder(&chars, &mut i, extraction, fields)?);
                    expect_value = false;
                }
                '-' => {
                    elements.push(Element::Op {
                        op: Op::ChangeSign,
                    });
                    i += 1;
                }
                _ if c.is_ascii_digit() => {
                    elements.push(read_number(&chars, &mut i)?);
                    expect_value = false;
                }
                _ if c.is_alphabetic() || c == '_' => {
                    let position = i;
                    let word = read_word(&chars, &mut i);
                    match word.to_ascii_lowercase().as_str() {
                        "true" => {
                            elements.push(Element::Literal {
                                value: Value::Bool(true),
                            });
                            expect_value = false;
                        }
                        "false" => {
                            elements.push(Element::Literal {
                                value: Value::Bool(false),
                            });
                            expect_value = false;
                        }
                        "not" => elements.push(Element::Op { op: Op::Not }),
                        _ => {
                            return Err(ParseError::OperandExpected {
                                found: format!("'{word}'"),
                                position,
                            });
                        }
                    }
                }
                _ => {
                    return Err(ParseError::OperandExpected {
                        found: format!("'{c}'"),
                        position: i,
                    });
                }
            }
        } else {
            let op = read_operator(&chars, &mut i)?;
            elements.push(Element::Op { op });
            expect_value = true;
        }
    }

    if elements.is_empty() || expect_value {
        return Err(ParseError::OperandExpected {
            found: "end of expression".to_owned(),
            position: chars.len(),
        });
    }

    Ok(Part { elements })
}

fn read_placeholder(
    chars: &[char],
    i: &mut usize,
    extraction: &Extraction,
    fields: &[Field],
) -> Result<Element, ParseError> {
    let malformed = |detail: &str| ParseError::MalformedSyntax {
        detail: detail.to_owned(),
    };

    let tag = chars
        .get(*i + 1)
        .copied()
        .ok_or_else(|| malformed("truncated placeholder"))?;
    let mut j = *i + 2;
    let mut digits = String::new();
    while j < chars.len() && chars[j].is_ascii_digit() {
        digits.push(chars[j]);
        j += 1;
    }
    if digits.is_empty() || chars.get(j) != Some(&'}') {
        return Err(malformed("truncated placeholder"));
    }
    let index: usize = digits
        .parse()
        .map_err(|_| malformed("placeholder index out of range"))?;
    *i = j + 1;

    match tag {
        'f' => {
            let name = extraction
                .fields
                .get(index)
                .ok_or_else(|| malformed("dangling field placeholder"))?;
            let known = name.eq_ignore_ascii_case("fid")
                || fields.iter().any(|f| f.name.eq_ignore_ascii_case(name));
            if !known {
                return Err(ParseError::FieldNotFound { name: name.clone() });
            }
            Ok(Element::Field { name: name.clone() })
        }
        's' => {
            let text = extraction
                .strings
                .get(index)
                .ok_or_else(|| malformed("dangling string placeholder"))?;
            Ok(Element::Literal {
                value: Value::Str(text.clone()),
            })
        }
        'p' => Ok(Element::Part { index }),
        _ => Err(malformed("unknown placeholder tag")),
    }
}

/// Digits, an optional fraction, and an optional `e`/`E` exponent whose
/// sign is accepted only immediately after the exponent marker.
fn read_number(chars: &[char], i: &mut usize) -> Result<Element, ParseError> {
    let start = *i;
    while *i < chars.len() && chars[*i].is_ascii_digit() {
        *i += 1;
    }
    if chars.get(*i) == Some(&'.') {
        *i += 1;
        while *i < chars.len() && chars[*i].is_ascii_digit() {
            *i += 1;
        }
    }
    if matches!(chars.get(*i), Some('e' | 'E')) {
        *i += 1;
        if matches!(chars.get(*i), Some('+' | '-')) {
            *i += 1;
        }
        while *i < chars.len() && chars[*i].is_ascii_digit() {
            *i += 1;
        }
    }

    let text: String = chars[start..*i].iter().collect();
    let value: f64 = text
        .parse()
        .map_err(|_| ParseError::NotANumber { text: text.clone() })?;
    Ok(Element::Literal {
        value: Value::Double(value),
    })
}

fn read_word(chars: &[char], i: &mut usize) -> String {
    let start = *i;
    while *i < chars.len() && (chars[*i].is_alphanumeric() || chars[*i] == '_') {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

fn read_operator(chars: &[char], i: &mut usize) -> Result<Op, ParseError> {
    let position = *i;
    let c = chars[position];
    let next = chars.get(position + 1).copied();

    let op = match c {
        '\n' => Op::LineBreak,
        '^' => Op::Pow,
        '*' => Op::Mul,
        '/' => Op::Div,
        '\\' => Op::IntDiv,
        '+' => Op::Add,
        '-' => Op::Sub,
        '=' => {
            if next == Some('=') {
                *i += 1;
            }
            Op::Eq
        }
        '!' => {
            if next != Some('=') {
                return Err(ParseError::OperatorExpected {
                    found: c,
                    position,
                });
            }
            *i += 1;
            Op::Ne
        }
        '<' => match next {
            Some('>') => {
                *i += 1;
                Op::Ne
            }
            Some('=') => {
                *i += 1;
                Op::Le
            }
            _ => Op::Lt,
        },
        '>' => {
            if next == Some('=') {
                *i += 1;
                Op::Ge
            } else {
                Op::Gt
            }
        }
        _ if c.is_alphabetic() => {
            let word = read_word(chars, i);
            return match word.to_ascii_lowercase().as_str() {
                "mod" => Ok(Op::Mod),
                "and" => Ok(Op::And),
                "or" => Ok(Op::Or),
                "xor" => Ok(Op::Xor),
                _ => Err(ParseError::OperatorExpected {
                    found: c,
                    position,
                }),
            };
        }
        _ => {
            return Err(ParseError::OperatorExpected {
                found: c,
                position,
            });
        }
    };

    *i += 1;
    Ok(op)
}

#[cfg(test)]
mod tests {
    use lx_value::{Field, Value, ValueKind};

    use super::{Element, Op, ParseError, extract, parse_program, read_part};

    fn schema() -> Vec<Field> {
        vec![
            Field::new("NAME", ValueKind::Str),
            Field::new("POP", ValueKind::Double),
        ]
    }

    #[test]
    fn extractor_replaces_fields_then_strings() {
        let out = extract(r#"[NAME] + " (" + [POP] + ")""#).expect("extract");
        assert_eq!(out.text, r"{f0} + {s0} + {f1} + {s1}");
        assert_eq!(out.fields, vec!["NAME".to_owned(), "POP".to_owned()]);
        assert_eq!(out.strings, vec![" (".to_owned(), ")".to_owned()]);
    }

    #[test]
    fn extractor_unescapes_doubled_quotes() {
        let out = extract(r#""say ""hi""""#).expect("extract");
        assert_eq!(out.text, "{s0}");
        assert_eq!(out.strings, vec![r#"say "hi""#.to_owned()]);
    }

    #[test]
    fn extractor_keeps_empty_brackets_inside_string_literals() {
        let out = extract(r#""a[]b" + 1"#).expect("extract");
        assert_eq!(out.text, "{s0} + 1");
        assert_eq!(out.strings, vec!["a[]b".to_owned()]);
        assert!(out.fields.is_empty());
    }

    #[test]
    fn extractor_rejects_reserved_and_unpaired_characters() {
        assert!(matches!(
            extract("{f0}"),
            Err(ParseError::MalformedSyntax { .. })
        ));
        assert_eq!(extract(r#""abc"#), Err(ParseError::UnpairedQuote));
        assert_eq!(extract("[] + 1"), Err(ParseError::EmptyFieldReference));
        assert_eq!(extract("[NAME + 1"), Err(ParseError::UnpairedBracket));
        assert_eq!(extract("NAME] + 1"), Err(ParseError::UnpairedBracket));
    }

    #[test]
    fn operator_priorities_follow_the_fixed_table() {
        assert_eq!(Op::Pow.priority(), 1);
        assert_eq!(Op::Mod.priority(), 2);
        assert_eq!(Op::ChangeSign.priority(), 3);
        assert_eq!(Op::Ne.priority(), 4);
        assert_eq!(Op::LineBreak.priority(), 5);
        assert_eq!(Op::And.priority(), 5);
        assert_eq!(Op::Xor.priority(), 6);
        assert!(Op::Not.is_unary());
        assert!(!Op::Sub.is_unary());
    }

    #[test]
    fn reader_alternates_values_and_operators() {
        let extraction = extract("2 + 3 * 4").expect("extract");
        let part = read_part(&extraction.text, &extraction, &schema()).expect("read");
        assert_eq!(part.elements.len(), 5);
        assert_eq!(part.elements[1], Element::Op { op: Op::Add });
        assert_eq!(part.elements[3], Element::Op { op: Op::Mul });
    }

    #[test]
    fn reader_accepts_keywords_exponents_and_unary_chains() {
        let extraction = extract("not true and FALSE").expect("extract");
        let part = read_part(&extraction.text, &extraction, &schema()).expect("read");
        assert_eq!(part.elements[0], Element::Op { op: Op::Not });
        assert_eq!(
            part.elements[1],
            Element::Literal {
                value: Value::Bool(true)
            }
        );

        let extraction = extract("-1.5e-2 MOD 2").expect("extract");
        let part = read_part(&extraction.text, &extraction, &schema()).expect("read");
        assert_eq!(
            part.elements[0],
            Element::Op {
                op: Op::ChangeSign
            }
        );
        assert_eq!(
            part.elements[1],
            Element::Literal {
                value: Value::Double(1.5e-2)
            }
        );
        assert_eq!(part.elements[2], Element::Op { op: Op::Mod });
    }

    #[test]
    fn reader_reports_unknown_fields_and_stray_characters() {
        let extraction = extract("[NOPE]").expect("extract");
        assert_eq!(
            read_part(&extraction.text, &extraction, &schema()),
            Err(ParseError::FieldNotFound {
                name: "NOPE".to_owned()
            })
        );

        let extraction = extract("2 ? 3").expect("extract");
        assert_eq!(
            read_part(&extraction.text, &extraction, &schema()),
            Err(ParseError::OperatorExpected {
                found: '?',
                position: 2
            })
        );

        let extraction = extract("2 + ?").expect("extract");
        assert_eq!(
            read_part(&extraction.text, &extraction, &schema()),
            Err(ParseError::OperandExpected {
                found: "'?'".to_owned(),
                position: 4
            })
        );

        let extraction = extract("2 +").expect("extract");
        assert!(matches!(
            read_part(&extraction.text, &extraction, &schema()),
            Err(ParseError::OperandExpected { .. })
        ));
    }

    #[test]
    fn fid_is_always_a_known_field() {
        let extraction = extract("[fid] + [FID]").expect("extract");
        let part = read_part(&extraction.text, &extraction, &[]).expect("read");
        assert_eq!(
            part.elements[0],
            Element::Field {
                name: "fid".to_owned()
            }
        );
    }

    #[test]
    fn flattener_reduces_innermost_brackets_first() {
        let program = parse_program("(2 + 3) * (4 - (1 + 1))", &schema()).expect("parse");
        // 2+3, 1+1, 4-{p1}, outermost {p0}*{p2}
        assert_eq!(program.parts.len(), 4);
        assert_eq!(
            program.parts[2].elements[2],
            Element::Part { index: 1 }
        );
        assert_eq!(
            program.parts[3].elements,
            vec![
                Element::Part { index: 0 },
                Element::Op { op: Op::Mul },
                Element::Part { index: 2 },
            ]
        );
    }

    #[test]
    fn flattener_rejects_unmatched_closing_parenthesis() {
        assert!(matches!(
            parse_program("2 + 3)", &schema()),
            Err(ParseError::MalformedSyntax { .. })
        ));
    }

    #[test]
    fn variables_collect_every_field_coordinate() {
        let program = parse_program("([POP] + 1) * [POP] + [NAME]", &schema()).expect("parse");
        assert_eq!(program.variables, vec![(0, 0), (1, 2), (1, 4)]);
    }

    #[test]
    fn program_round_trips_through_serde() {
        let program = parse_program("[NAME] + (1 + 2)", &schema()).expect("parse");
        let encoded = serde_json::to_string(&program).expect("encode");
        let decoded: super::Program = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, program);
    }
}
