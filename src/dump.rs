//! Format parsed result trees for display (text dump, one node per line).

use crate::value::{ResultKind, ResultNode, Value};
use std::fmt::Write;

/// Renders a result tree as indented text, one node per line with its
/// bit length and starting byte offset.
pub fn dump_tree(root: &ResultNode) -> String {
    let mut out = String::new();
    dump_node(&mut out, root, 0);
    out
}

fn dump_node(out: &mut String, node: &ResultNode, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
    match &node.kind {
        ResultKind::Terminal(v) => {
            let _ = writeln!(
                out,
                "{} = {} ({} bits @ byte {})",
                node.name,
                format_scalar(v),
                node.bit_len,
                node.byte_offset
            );
        }
        ResultKind::Struct(children) => {
            let _ = writeln!(out, "{} ({} bits @ byte {})", node.name, node.bit_len, node.byte_offset);
            for c in children {
                dump_node(out, c, depth + 1);
            }
        }
        ResultKind::List(items) => {
            let _ = writeln!(
                out,
                "{}[{}] ({} bits @ byte {})",
                node.name,
                items.len(),
                node.bit_len,
                node.byte_offset
            );
            for (i, item) in items.iter().enumerate() {
                for _ in 0..=depth {
                    out.push_str("  ");
                }
                match &item.kind {
                    ResultKind::Terminal(v) => {
                        let _ = writeln!(out, "[{}] = {}", i, format_scalar(v));
                    }
                    ResultKind::Struct(children) => {
                        let _ = writeln!(out, "[{}]", i);
                        for c in children {
                            dump_node(out, c, depth + 2);
                        }
                    }
                    ResultKind::List(_) => {
                        let _ = writeln!(out, "[{}]", i);
                        dump_node(out, item, depth + 2);
                    }
                }
            }
        }
    }
}

fn format_scalar(v: &Value) -> String {
    match v {
        Value::U64(x) => x.to_string(),
        Value::I64(x) => x.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Str(s) => format!("{:?}", s),
        Value::Bytes(b) => format_bytes(b),
        Value::Struct(_) => "{..}".to_string(),
        Value::List(_) => "[..]".to_string(),
    }
}

fn format_bytes(b: &[u8]) -> String {
    const MAX: usize = 16;
    let shown = &b[..b.len().min(MAX)];
    let hex: Vec<String> = shown.iter().map(|x| format!("{:02x}", x)).collect();
    if b.len() > MAX {
        format!("{} .. ({} bytes)", hex.join(" "), b.len())
    } else {
        hex.join(" ")
    }
}
