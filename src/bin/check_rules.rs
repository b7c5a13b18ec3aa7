//! Check a grammar document and optionally parse a binary file with it.
//!
//! Usage:
//!   check_rules GRAMMAR.rules [DATA.bin]
//!   check_rules < grammar.rules
//!
//! With one argument the grammar is compiled and its fragments listed.
//! With two, the data file is parsed and the result tree printed.

use anyhow::{Context, Result};
use std::io::Read;
use wiregram::{dump, Codec};

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (source, name) = match args.first() {
        Some(path) => {
            let s = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
            (s, path.clone())
        }
        None => {
            let mut s = String::new();
            std::io::stdin().read_to_string(&mut s).context("reading stdin")?;
            (s, "<stdin>".to_string())
        }
    };

    let codec = Codec::from_source(&source).with_context(|| format!("compiling {}", name))?;
    let mut fragments: Vec<&str> = codec.grammar().fragment_names().collect();
    fragments.sort_unstable();
    eprintln!("{}: ok ({})", name, fragments.join(", "));

    if let Some(data_path) = args.get(1) {
        let data = std::fs::read(data_path).with_context(|| format!("reading {}", data_path))?;
        let tree = codec
            .parse_bytes(&data)
            .with_context(|| format!("parsing {}", data_path))?;
        print!("{}", dump::dump_tree(&tree));
    }
    Ok(())
}
