#![no_main]

use labelex::{Field, ValueKind, parse_program};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|text: &str| {
    let fields = [
        Field::new("NAME", ValueKind::Str),
        Field::new("POP", ValueKind::Double),
        Field::new("WET", ValueKind::Bool),
    ];
    // Parsing must never panic, only return an error.
    let _ = parse_program(text, &fields);
});
