#![no_main]

use std::collections::BTreeMap;

use labelex::{Expression, Field, Value, ValueKind};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|input: (&str, f64, i64)| {
    let (text, pop, fid) = input;

    let mut expression = Expression::new();
    expression.set_fields(vec![
        Field::new("NAME", ValueKind::Str),
        Field::new("POP", ValueKind::Double),
    ]);

    let mut row = BTreeMap::new();
    row.insert("NAME".to_owned(), Value::Str("Lake".to_owned()));
    row.insert("POP".to_owned(), Value::Double(pop));

    // Evaluation is a total function regardless of parse outcome.
    let _ = expression.parse(text);
    let _ = expression.evaluate(&row, fid);
});
