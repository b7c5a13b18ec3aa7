//! Compiled grammar tree: typed nodes, per-node configuration, and the
//! document context with its fragment table.
//!
//! A [`Grammar`] is compiled once per document and is immutable afterwards;
//! all per-call progress state lives in the codec's run state, so one
//! compiled grammar can drive concurrent decodes. Named type references are
//! resolved at compile time to direct indices into the fragment table
//! instead of being looked up per traversal.

use crate::parser::{self, GrammarError, RawBody, RawEntry};
use std::collections::HashMap;

/// Byte order for multi-byte integers. Default big (network order).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Terminal interpretation variants. A closed set selected by the `variant`
/// config key; there is no runtime registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Variant {
    /// Plain binary integers.
    #[default]
    Standard,
    /// Packed binary-coded decimal: each nibble is one decimal digit.
    Bcd,
    /// ASCII-decimal digits.
    Ascii,
}

/// Per-node settings. Copied by value from the parent at compile time and
/// then overridden locally; a child's override never touches its parent or
/// siblings. Only `endian` and `variant` flow down: lengths, delimiters and
/// scripts are meaningless inherited and always start unset.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub endian: Endianness,
    pub variant: Variant,
    /// Explicit length in bits (`,N` bytes or `,Nbit` in the descriptor,
    /// or a `length` directive).
    pub bit_len: Option<u64>,
    /// Delimiter termination instead of length-bounding.
    pub delimiter: Option<Vec<u8>>,
    /// Resolve length from this sibling field's decoded value.
    pub len_from: Option<String>,
    /// Byte multiplier applied to the `len_from` value.
    pub multiplier: u64,
    /// Operator escape hatch script.
    pub script: Option<String>,
}

impl Config {
    fn inherit(parent: &Config) -> Config {
        Config {
            endian: parent.endian,
            variant: parent.variant,
            multiplier: 1,
            ..Config::default()
        }
    }

    /// Applies one `key:value` setting. Shared by the compiler (directives
    /// and descriptor options) and by per-call operator overrides.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), GrammarError> {
        match key {
            "endian" => {
                self.endian = match value {
                    "big" => Endianness::Big,
                    "little" => Endianness::Little,
                    _ => return Err(bad(key, value, "expected big or little")),
                };
            }
            "variant" => {
                self.variant = match value {
                    "std" | "standard" => Variant::Standard,
                    "bcd" => Variant::Bcd,
                    "ascii" => Variant::Ascii,
                    _ => return Err(bad(key, value, "expected std, bcd, or ascii")),
                };
            }
            "length" | "len" => {
                let (num, bits) = match value.strip_suffix("bits").or_else(|| value.strip_suffix("bit")) {
                    Some(n) => (n.trim(), true),
                    None => (value, false),
                };
                let n: u64 = num.parse().map_err(|_| bad(key, value, "expected a number"))?;
                self.bit_len = Some(if bits {
                    n
                } else {
                    n.checked_mul(8).ok_or_else(|| bad(key, value, "length is too large"))?
                });
            }
            "lenfrom" => self.len_from = Some(value.to_string()),
            "mul" => {
                self.multiplier = value.parse().map_err(|_| bad(key, value, "expected a number"))?;
            }
            "del" => self.delimiter = Some(parser::parse_byte_literal(value)?),
            "eval" => self.script = Some(value.to_string()),
            _ => return Err(bad(key, value, "unknown setting")),
        }
        Ok(())
    }

    /// Reads one setting back as a string (operator `get` on `cfg.*` paths).
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "endian" => Some(
                match self.endian {
                    Endianness::Big => "big",
                    Endianness::Little => "little",
                }
                .to_string(),
            ),
            "variant" => Some(
                match self.variant {
                    Variant::Standard => "std",
                    Variant::Bcd => "bcd",
                    Variant::Ascii => "ascii",
                }
                .to_string(),
            ),
            "length" | "len" => self.bit_len.map(|n| format!("{}bit", n)),
            "lenfrom" => self.len_from.clone(),
            "mul" => Some(self.multiplier.to_string()),
            "eval" => self.script.clone(),
            _ => None,
        }
    }

    /// Clears one setting (operator `del` on `cfg.*` paths).
    pub fn clear(&mut self, key: &str) {
        match key {
            "length" | "len" => self.bit_len = None,
            "lenfrom" => self.len_from = None,
            "del" => self.delimiter = None,
            "eval" => self.script = None,
            _ => {}
        }
    }
}

fn bad(key: &str, value: &str, reason: &str) -> GrammarError {
    GrammarError::Descriptor {
        descriptor: format!("{}:{}", key, value),
        reason: reason.to_string(),
    }
}

/// What a terminal resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalType {
    UInt,
    Int,
    /// Single octet, decoded as an unsigned number.
    Byte,
    Bool,
    /// Opaque bytes.
    Raw,
    /// UTF-8 text.
    Str,
    /// Compile-time-resolved reference into the fragment table.
    Ref(usize),
}

impl TerminalType {
    /// Natural width in bits for primitives that imply one.
    pub fn natural_bits(self) -> Option<u64> {
        match self {
            TerminalType::UInt | TerminalType::Int => Some(32),
            TerminalType::Byte | TerminalType::Bool => Some(8),
            TerminalType::Raw | TerminalType::Str | TerminalType::Ref(_) => None,
        }
    }
}

fn primitive(name: &str) -> Option<TerminalType> {
    match name {
        "uint" => Some(TerminalType::UInt),
        "int" => Some(TerminalType::Int),
        "byte" => Some(TerminalType::Byte),
        "bool" => Some(TerminalType::Bool),
        "raw" => Some(TerminalType::Raw),
        "str" => Some(TerminalType::Str),
        _ => None,
    }
}

/// Node shape: exactly one of terminal, struct, or list.
#[derive(Debug, Clone)]
pub enum NodeKind {
    Terminal(TerminalType),
    Struct(Vec<Node>),
    /// Homogeneous repeated list; the box holds the element template.
    List(Box<Node>),
}

/// One compiled grammar node.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    /// Dotted path from the fragment root, used in errors and operator
    /// config overrides.
    pub path: String,
    pub cfg: Config,
    pub kind: NodeKind,
}

impl Node {
    /// Finds a descendant by simple name, depth-first. Used by the operator
    /// evaluator to invoke children.
    pub fn descendant(&self, name: &str) -> Option<&Node> {
        match &self.kind {
            NodeKind::Terminal(_) => None,
            NodeKind::Struct(children) => {
                for c in children {
                    if c.name == name {
                        return Some(c);
                    }
                    if let Some(found) = c.descendant(name) {
                        return Some(found);
                    }
                }
                None
            }
            NodeKind::List(elem) => {
                if elem.name == name {
                    Some(elem)
                } else {
                    elem.descendant(name)
                }
            }
        }
    }

    /// Finds a descendant by dotted path relative to this node.
    pub fn at_path(&self, path: &str) -> Option<&Node> {
        let mut cur = self;
        for seg in path.split('.') {
            cur = match &cur.kind {
                NodeKind::Struct(children) => children.iter().find(|c| c.name == seg)?,
                NodeKind::List(elem) if elem.name == seg => elem,
                _ => return None,
            };
        }
        Some(cur)
    }
}

/// Compiled document context: the fragment table plus the root fragment.
///
/// Every direct top-level entry of the document becomes a named, reusable
/// fragment; the first one is the root that parse/generate forward to. The
/// table is installed in a dedicated initialization pass before fragment
/// bodies compile, so fragments can reference each other (and themselves)
/// in any order.
#[derive(Debug, Clone)]
pub struct Grammar {
    fragments: Vec<Node>,
    by_name: HashMap<String, usize>,
    root: usize,
}

impl Grammar {
    /// Compiles grammar source into an immutable node tree.
    pub fn compile(source: &str) -> Result<Grammar, GrammarError> {
        let entries = parser::parse(source)?;

        // Document-level directives seed the config every fragment inherits.
        let mut base = Config { multiplier: 1, ..Config::default() };
        let mut fields = Vec::new();
        for e in &entries {
            if e.is_directive() {
                if let RawBody::Scalar(v) = &e.body {
                    base.apply(&e.key, v)?;
                }
            } else {
                fields.push(e);
            }
        }
        if fields.is_empty() {
            return Err(GrammarError::Empty);
        }

        // Root-initialization pass: install every top-level name first so
        // type references (including forward and recursive ones) resolve.
        let mut by_name = HashMap::new();
        for (i, e) in fields.iter().enumerate() {
            if by_name.insert(e.key.clone(), i).is_some() {
                return Err(GrammarError::DuplicateFragment(e.key.clone()));
            }
        }

        let mut fragments = Vec::with_capacity(fields.len());
        for e in &fields {
            fragments.push(compile_entry(e, &base, &e.key, &by_name)?);
        }

        Ok(Grammar { fragments, by_name, root: 0 })
    }

    pub fn root(&self) -> &Node {
        &self.fragments[self.root]
    }

    pub fn fragment(&self, idx: usize) -> &Node {
        &self.fragments[idx]
    }

    pub fn fragment_by_name(&self, name: &str) -> Option<&Node> {
        self.by_name.get(name).map(|&i| &self.fragments[i])
    }

    pub fn fragment_names(&self) -> impl Iterator<Item = &str> {
        self.fragments.iter().map(|f| f.name.as_str())
    }
}

fn compile_entry(
    entry: &RawEntry,
    parent_cfg: &Config,
    path: &str,
    names: &HashMap<String, usize>,
) -> Result<Node, GrammarError> {
    match &entry.body {
        RawBody::Scalar(descriptor) => {
            let d = parser::parse_descriptor(descriptor)?;
            let ty = match primitive(&d.type_name) {
                Some(t) => t,
                None => match names.get(&d.type_name) {
                    Some(&idx) => TerminalType::Ref(idx),
                    None => return Err(GrammarError::UnknownType(d.type_name.clone())),
                },
            };
            if d.repeated || entry.repeated {
                // The comma length sizes each element; semicolon options
                // bound and configure the list as a whole. Interpretation
                // settings reach the elements too.
                let mut elem_cfg = Config::inherit(parent_cfg);
                elem_cfg.bit_len = d.length.map(|l| l.0);
                let mut list_cfg = Config::inherit(parent_cfg);
                for (k, v) in &d.options {
                    match k.as_str() {
                        "endian" | "variant" => {
                            elem_cfg.apply(k, v)?;
                            list_cfg.apply(k, v)?;
                        }
                        _ => list_cfg.apply(k, v)?,
                    }
                }
                check_conflicts(&list_cfg, path)?;
                let elem = Node {
                    name: entry.key.clone(),
                    path: format!("{}[]", path),
                    cfg: elem_cfg,
                    kind: NodeKind::Terminal(ty),
                };
                Ok(Node {
                    name: entry.key.clone(),
                    path: path.to_string(),
                    cfg: list_cfg,
                    kind: NodeKind::List(Box::new(elem)),
                })
            } else {
                let mut cfg = Config::inherit(parent_cfg);
                cfg.bit_len = d.length.map(|l| l.0);
                for (k, v) in &d.options {
                    cfg.apply(k, v)?;
                }
                check_conflicts(&cfg, path)?;
                Ok(Node {
                    name: entry.key.clone(),
                    path: path.to_string(),
                    cfg,
                    kind: NodeKind::Terminal(ty),
                })
            }
        }
        RawBody::Block(children) => {
            let mut cfg = Config::inherit(parent_cfg);
            let mut fields = Vec::new();
            for c in children {
                if c.is_directive() {
                    if let RawBody::Scalar(v) = &c.body {
                        cfg.apply(&c.key, v)?;
                    }
                } else {
                    fields.push(c);
                }
            }
            check_conflicts(&cfg, path)?;
            let mut compiled = Vec::with_capacity(fields.len());
            for f in fields {
                let child_path = format!("{}.{}", path, f.key);
                compiled.push(compile_entry(f, &cfg, &child_path, names)?);
            }
            let body = Node {
                name: entry.key.clone(),
                path: path.to_string(),
                cfg: cfg.clone(),
                kind: NodeKind::Struct(compiled),
            };
            if entry.repeated {
                // `Key... { ... }`: a list of identical struct elements.
                // The repeat marker wins over any explicit length directive,
                // which then bounds the list total, never the element.
                let mut elem = body;
                elem.path = format!("{}[]", path);
                elem.cfg.bit_len = None;
                Ok(Node {
                    name: entry.key.clone(),
                    path: path.to_string(),
                    cfg,
                    kind: NodeKind::List(Box::new(elem)),
                })
            } else {
                Ok(body)
            }
        }
    }
}

fn check_conflicts(cfg: &Config, path: &str) -> Result<(), GrammarError> {
    if cfg.delimiter.is_some() && (cfg.bit_len.is_some() || cfg.len_from.is_some()) {
        return Err(GrammarError::ConflictingOptions {
            node: path.to_string(),
            reason: "delimiter termination excludes length settings".to_string(),
        });
    }
    Ok(())
}
