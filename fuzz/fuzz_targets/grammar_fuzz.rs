//! Grammar fuzz target: feed arbitrary text to the document compiler, and
//! arbitrary bytes to a fixed compiled grammar. Neither path may panic.
//! Build with: cargo fuzz run grammar_fuzz (requires nightly and cargo fuzz).

#![cfg_attr(fuzzing, no_main)]

#[cfg(fuzzing)]
use libfuzzer_sys::fuzz_target;

#[cfg(fuzzing)]
fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = wiregram::Grammar::compile(s);
    }
    let codec = wiregram::Codec::from_source(
        "Msg {\n  Length: uint,1\n  Payload: raw; lenfrom:Length\n  Tail: uint,2\n}",
    )
    .expect("fixed grammar compiles");
    let _ = codec.parse_bytes(data);
});

#[cfg(not(fuzzing))]
fn main() {
    eprintln!("Build with: cargo fuzz run grammar_fuzz");
}
