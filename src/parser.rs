//! Parse grammar-document source into a raw entry tree using PEST.
//!
//! The document is a nested mapping: `Key { ... }` blocks and
//! `Key: descriptor` scalars. This module only recovers that structure plus
//! the terminal descriptor mini-grammar
//! (`type[,length[bit]][;opt:value]*`); compiling entries into typed nodes
//! happens in [`crate::node`].

use pest::Parser;
use pest_derive::Parser as PestParser;

#[derive(PestParser)]
#[grammar = "grammar.pest"]
struct DocumentParser;

/// Errors raised while reading or compiling a grammar document.
#[derive(Debug, thiserror::Error)]
pub enum GrammarError {
    #[error("syntax: {0}")]
    Syntax(String),
    #[error("descriptor `{descriptor}`: {reason}")]
    Descriptor { descriptor: String, reason: String },
    #[error("unknown type `{0}`: not a primitive keyword or fragment name")]
    UnknownType(String),
    #[error("conflicting options on `{node}`: {reason}")]
    ConflictingOptions { node: String, reason: String },
    #[error("duplicate fragment name `{0}`")]
    DuplicateFragment(String),
    #[error("directive `{0}` cannot open a block")]
    DirectiveBlock(String),
    #[error("document has no top-level fragments")]
    Empty,
}

/// One raw mapping entry, before compilation.
#[derive(Debug, Clone)]
pub struct RawEntry {
    pub key: String,
    /// Trailing `...` on the key: the entry is a repeated list.
    pub repeated: bool,
    pub body: RawBody,
}

#[derive(Debug, Clone)]
pub enum RawBody {
    /// Scalar leaf: an unparsed terminal descriptor or directive value.
    Scalar(String),
    /// Nested mapping.
    Block(Vec<RawEntry>),
}

impl RawEntry {
    /// Directive entries (node-local settings) start with a lowercase letter.
    pub fn is_directive(&self) -> bool {
        self.key.chars().next().is_some_and(|c| c.is_ascii_lowercase())
    }
}

/// Parse document source into raw entries.
pub fn parse(source: &str) -> Result<Vec<RawEntry>, GrammarError> {
    let pairs = DocumentParser::parse(Rule::document, source)
        .map_err(|e| GrammarError::Syntax(e.to_string()))?;
    let doc = pairs
        .into_iter()
        .next()
        .ok_or_else(|| GrammarError::Syntax("empty parse".to_string()))?;
    let mut entries = Vec::new();
    for inner in doc.into_inner() {
        if inner.as_rule() == Rule::entry {
            entries.push(build_entry(inner)?);
        }
    }
    Ok(entries)
}

fn build_entry(pair: pest::iterators::Pair<Rule>) -> Result<RawEntry, GrammarError> {
    let mut key = String::new();
    let mut repeated = false;
    let mut body = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::key => {
                let raw = inner.as_str();
                if let Some(stripped) = raw.strip_suffix("...") {
                    key = stripped.to_string();
                    repeated = true;
                } else {
                    key = raw.to_string();
                }
            }
            Rule::scalar => body = Some(RawBody::Scalar(inner.as_str().trim().to_string())),
            Rule::block => {
                let mut children = Vec::new();
                for sub in inner.into_inner() {
                    if sub.as_rule() == Rule::entry {
                        children.push(build_entry(sub)?);
                    }
                }
                body = Some(RawBody::Block(children));
            }
            _ => {}
        }
    }
    let body = body.ok_or_else(|| GrammarError::Syntax(format!("entry `{}` has no body", key)))?;
    let entry = RawEntry { key, repeated, body };
    if entry.is_directive() && matches!(entry.body, RawBody::Block(_)) {
        return Err(GrammarError::DirectiveBlock(entry.key));
    }
    Ok(entry)
}

/// Explicit length from a descriptor: `,N` is bytes, `,Nbit` is bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitLen(pub u64);

/// A parsed terminal descriptor: `type[...][,length[bit]][;key:value]*`.
#[derive(Debug, Clone)]
pub struct Descriptor {
    pub type_name: String,
    /// Trailing `...` on the type name: repeated list of this terminal.
    pub repeated: bool,
    pub length: Option<BitLen>,
    /// Remaining `key:value` options in source order.
    pub options: Vec<(String, String)>,
}

/// Parse the scalar-leaf mini-grammar.
pub fn parse_descriptor(s: &str) -> Result<Descriptor, GrammarError> {
    let mut segments = s.split(';');
    let head = segments
        .next()
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| err(s, "missing type"))?;

    let (type_part, length) = match head.split_once(',') {
        Some((t, l)) => (t.trim(), Some(parse_length(s, l.trim())?)),
        None => (head, None),
    };
    let (type_name, repeated) = match type_part.strip_suffix("...") {
        Some(t) => (t.trim(), true),
        None => (type_part, false),
    };
    if type_name.is_empty() {
        return Err(err(s, "missing type"));
    }

    let mut options = Vec::new();
    for seg in segments {
        let seg = seg.trim();
        if seg.is_empty() {
            continue;
        }
        let (k, v) = seg
            .split_once(':')
            .ok_or_else(|| err(s, "option must be key:value"))?;
        options.push((k.trim().to_string(), v.trim().to_string()));
    }

    Ok(Descriptor {
        type_name: type_name.to_string(),
        repeated,
        length,
        options,
    })
}

fn parse_length(descriptor: &str, l: &str) -> Result<BitLen, GrammarError> {
    let (num, is_bits) = match l.strip_suffix("bits").or_else(|| l.strip_suffix("bit")) {
        Some(n) => (n.trim(), true),
        None => (l, false),
    };
    let n: u64 = num
        .parse()
        .map_err(|_| err(descriptor, "length must be a number"))?;
    let bits = if is_bits {
        n
    } else {
        n.checked_mul(8).ok_or_else(|| err(descriptor, "length is too large"))?
    };
    Ok(BitLen(bits))
}

fn err(descriptor: &str, reason: &str) -> GrammarError {
    GrammarError::Descriptor {
        descriptor: descriptor.to_string(),
        reason: reason.to_string(),
    }
}

/// Parse a delimiter or magic byte literal: `0x0d0a` hex or a plain string
/// with `\n`, `\t`, `\\` escapes.
pub fn parse_byte_literal(s: &str) -> Result<Vec<u8>, GrammarError> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        if hex.is_empty() || hex.len() % 2 != 0 {
            return Err(err(s, "hex literal must have even length"));
        }
        let mut bytes = Vec::with_capacity(hex.len() / 2);
        for chunk in hex.as_bytes().chunks(2) {
            let pair = std::str::from_utf8(chunk).map_err(|_| err(s, "invalid hex"))?;
            bytes.push(u8::from_str_radix(pair, 16).map_err(|_| err(s, "invalid hex"))?);
        }
        return Ok(bytes);
    }
    let unquoted = s
        .strip_prefix('"')
        .and_then(|x| x.strip_suffix('"'))
        .unwrap_or(s);
    let unescaped = unquoted
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\\\", "\\");
    Ok(unescaped.into_bytes())
}
