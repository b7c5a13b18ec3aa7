//! Parse and generate engines: walk a compiled grammar against a bit
//! stream (parse) or a nested field-value input (generate).
//!
//! Both walks are depth-first recursive descent over the same node tree and
//! are mirror images of each other: for any value tree `V` that generate
//! accepts, `parse(generate(V))` reproduces `V` on every decoded field.
//!
//! The compiled [`Grammar`] is never mutated; every call builds a fresh
//! run state (consumption frames, last-decoded values, operator config
//! overrides, transient list flags), so one grammar can serve concurrent
//! calls.

use crate::bits::{BitReader, BitWriter, StreamError};
use crate::expr::{self, OpHost};
use crate::node::{Config, Endianness, Grammar, Node, NodeKind, TerminalType, Variant};
use crate::parser::GrammarError;
use crate::value::{ResultKind, ResultNode, Value};
use byteorder::{BigEndian, ByteOrder};
use std::borrow::Cow;
use std::collections::HashMap;
use std::io::Read;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("grammar: {0}")]
    Grammar(#[from] GrammarError),
    #[error("stream: {0}")]
    Stream(#[from] StreamError),
    #[error("length unresolved for `{0}`")]
    LengthUnresolved(String),
    #[error("field `{field}` not found under `{node}`")]
    FieldNotFound { field: String, node: String },
    #[error("delimiter not found for `{node}`: stream ended after {scanned} bytes")]
    DelimiterNotFound { node: String, scanned: usize },
    #[error("length mismatch for `{node}`: expected {expected} bits, got {got}")]
    LengthMismatch { node: String, expected: u64, got: u64 },
    #[error("operator: {0}")]
    Operator(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("in `{node}`: {source}")]
    At {
        node: String,
        #[source]
        source: Box<CodecError>,
    },
}

impl CodecError {
    fn at(self, node: &Node) -> CodecError {
        // The innermost wrap names the offending node; outer levels pass
        // it through untouched.
        match self {
            e @ CodecError::At { .. } => e,
            other => CodecError::At { node: node.path.clone(), source: Box::new(other) },
        }
    }
}

/// Grammar-driven codec: one compiled grammar, symmetric parse/generate.
#[derive(Debug)]
pub struct Codec {
    grammar: Grammar,
}

impl Codec {
    pub fn new(grammar: Grammar) -> Self {
        Codec { grammar }
    }

    pub fn from_source(source: &str) -> Result<Self, GrammarError> {
        Ok(Codec { grammar: Grammar::compile(source)? })
    }

    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    /// Parses bytes against the document root fragment.
    pub fn parse_bytes(&self, bytes: &[u8]) -> Result<ResultNode, CodecError> {
        self.parse(bytes)
    }

    /// Parses from any reader. The call blocks on the reader's own reads;
    /// bounded-time decoding requires wrapping the stream externally.
    pub fn parse<R: Read>(&self, reader: R) -> Result<ResultNode, CodecError> {
        let mut dec = Decoder {
            grammar: &self.grammar,
            reader: BitReader::new(reader),
            rs: RunState::default(),
        };
        dec.decode_node(self.grammar.root(), None)
    }

    /// Parses bytes against a named fragment instead of the root.
    pub fn parse_fragment(&self, fragment: &str, bytes: &[u8]) -> Result<ResultNode, CodecError> {
        let node = self.grammar.fragment_by_name(fragment).ok_or_else(|| {
            CodecError::FieldNotFound { field: fragment.to_string(), node: "root".to_string() }
        })?;
        let mut dec = Decoder {
            grammar: &self.grammar,
            reader: BitReader::new(bytes),
            rs: RunState::default(),
        };
        dec.decode_node(node, None)
    }

    /// Generates the byte sequence for a nested field-value input matched
    /// against the document root fragment.
    pub fn generate(&self, input: &Value) -> Result<Vec<u8>, CodecError> {
        self.generate_fragment_node(self.grammar.root(), input)
    }

    /// Generates against a named fragment instead of the root.
    pub fn generate_fragment(&self, fragment: &str, input: &Value) -> Result<Vec<u8>, CodecError> {
        let node = self.grammar.fragment_by_name(fragment).ok_or_else(|| {
            CodecError::FieldNotFound { field: fragment.to_string(), node: "root".to_string() }
        })?;
        self.generate_fragment_node(node, input)
    }

    fn generate_fragment_node(&self, node: &Node, input: &Value) -> Result<Vec<u8>, CodecError> {
        let mut enc = Encoder {
            grammar: &self.grammar,
            writer: BitWriter::new(),
            rs: RunState::default(),
        };
        enc.encode_node(node, Some(input), None)?;
        Ok(enc.writer.into_bytes()?)
    }
}

/// Per-call state shared across the whole walk. The compiled tree stays
/// immutable; everything mutable during one traversal lives here.
#[derive(Default)]
struct RunState {
    /// Operator config overrides, keyed `"<node path>#<setting>"`.
    overrides: HashMap<String, String>,
    /// Shared context flags (`ctx.*` in operator scripts). `ctx.stop`
    /// coordinates list termination between a list and its element.
    flags: HashMap<String, Value>,
    /// Last decoded/generated value per node, keyed by path and by name.
    values: HashMap<String, Value>,
}

impl RunState {
    fn record(&mut self, node: &Node, v: Value) {
        self.values.insert(node.path.clone(), v.clone());
        self.values.insert(node.name.clone(), v);
    }

    fn take_stop_flag(&mut self) -> bool {
        match self.flags.remove("stop") {
            Some(v) => v.as_bool().unwrap_or(false) || v.as_u64().is_some_and(|n| n != 0),
            None => false,
        }
    }
}

/// Running consumption of the aggregate currently being walked. Lets later
/// siblings resolve "remaining length" and cross-field references.
struct Frame {
    /// Resolved total bits of this aggregate, when known.
    total: Option<u64>,
    /// Bits consumed (parse) or produced (generate) so far within it.
    consumed: u64,
    siblings: Vec<Sibling>,
}

struct Sibling {
    name: String,
    /// Numeric value, when the sibling decoded to one.
    value: Option<u64>,
    /// `Frame::consumed` right after this sibling finished.
    end: u64,
}

impl Frame {
    fn new(total: Option<u64>) -> Frame {
        Frame { total, consumed: 0, siblings: Vec::new() }
    }

    fn advance(&mut self, name: &str, value: Option<u64>, bits: u64) {
        self.consumed += bits;
        self.siblings.push(Sibling { name: name.to_string(), value, end: self.consumed });
    }

    fn remaining(&self) -> Option<u64> {
        self.total.map(|t| t.saturating_sub(self.consumed))
    }
}

/// A resolved bit length. `exact` lengths (explicit, natural, or
/// field-derived) must be consumed in full by an aggregate; a
/// parent-remaining fallback is only an upper bound.
#[derive(Clone, Copy)]
struct Resolved {
    bits: u64,
    exact: bool,
}

/// Resolve the bit length a node will consume or produce, in strict
/// priority: explicit config, the primitive's natural width, the parent's
/// remaining length (once the parent's own total is known), then a
/// cross-field reference. `Ok(None)` means no strategy applied; only
/// delimiter and operator nodes may proceed without one.
fn resolve_len(
    path: &str,
    cfg: &Config,
    natural: Option<u64>,
    parent: Option<&Frame>,
) -> Result<Option<Resolved>, CodecError> {
    if let Some(n) = cfg.bit_len {
        return Ok(Some(Resolved { bits: n, exact: true }));
    }
    if let Some(n) = natural {
        return Ok(Some(Resolved { bits: n, exact: true }));
    }
    if let Some(rem) = parent.and_then(Frame::remaining) {
        return Ok(Some(Resolved { bits: rem, exact: false }));
    }
    if let Some(field) = &cfg.len_from {
        let frame = parent.ok_or_else(|| CodecError::LengthUnresolved(path.to_string()))?;
        let sib = frame
            .siblings
            .iter()
            .rev()
            .find(|s| &s.name == field)
            .ok_or_else(|| CodecError::LengthUnresolved(format!("{} (field `{}` not yet resolved)", path, field)))?;
        let value = sib
            .value
            .ok_or_else(|| CodecError::LengthUnresolved(format!("{} (field `{}` is not numeric)", path, field)))?;
        let total = value
            .checked_mul(cfg.multiplier)
            .and_then(|bytes| bytes.checked_mul(8))
            .ok_or_else(|| {
                CodecError::LengthUnresolved(format!("{} (length from `{}` overflows)", path, field))
            })?;
        // The referenced total counts from right after the sibling field,
        // so anything the parent consumed since then comes off the top.
        let since = frame.consumed - sib.end;
        if since > total {
            return Err(CodecError::LengthMismatch { node: path.to_string(), expected: total, got: since });
        }
        return Ok(Some(Resolved { bits: total - since, exact: true }));
    }
    Ok(None)
}

// ==================== Parse engine ====================

struct Decoder<'g, R> {
    grammar: &'g Grammar,
    reader: BitReader<R>,
    rs: RunState,
}

impl<'g, R: Read> Decoder<'g, R> {
    fn decode_node(&mut self, node: &Node, parent: Option<&Frame>) -> Result<ResultNode, CodecError> {
        self.decode_node_inner(node, parent).map_err(|e| e.at(node))
    }

    fn decode_node_inner(&mut self, node: &Node, parent: Option<&Frame>) -> Result<ResultNode, CodecError> {
        let cfg = effective_cfg(node, &self.rs)?;
        if cfg.script.is_some() {
            return self.decode_operator(node, &cfg, parent);
        }
        match &node.kind {
            NodeKind::Terminal(TerminalType::Ref(idx)) => {
                // Delegate to the fragment as if it were spliced in place;
                // the result keeps the referring field's name.
                let fragment = self.grammar.fragment(*idx);
                let mut r = self.decode_node(fragment, parent)?;
                r.name = node.name.clone();
                self.rs.record(node, r.to_value());
                Ok(r)
            }
            NodeKind::Terminal(ty) => self.decode_terminal(node, &cfg, *ty, parent),
            NodeKind::Struct(children) => self.decode_struct(node, &cfg, children, parent),
            NodeKind::List(elem) => self.decode_list(node, &cfg, elem, parent),
        }
    }

    fn decode_terminal(
        &mut self,
        node: &Node,
        cfg: &Config,
        ty: TerminalType,
        parent: Option<&Frame>,
    ) -> Result<ResultNode, CodecError> {
        let byte_offset = self.reader.byte_pos();
        if let Some(delim) = &cfg.delimiter {
            return self.decode_delimited(node, cfg, ty, delim, byte_offset);
        }
        let n = resolve_len(&node.path, cfg, ty.natural_bits(), parent)?
            .ok_or_else(|| CodecError::LengthUnresolved(node.path.clone()))?
            .bits;
        let buf = self.reader.read_bits(n)?;
        let value = interpret(cfg, ty, &buf, n)?;
        self.rs.record(node, value.clone());
        Ok(ResultNode {
            name: node.name.clone(),
            kind: ResultKind::Terminal(value),
            bit_len: n,
            byte_offset,
        })
    }

    fn decode_delimited(
        &mut self,
        node: &Node,
        cfg: &Config,
        ty: TerminalType,
        delim: &[u8],
        byte_offset: u64,
    ) -> Result<ResultNode, CodecError> {
        let mut buf: Vec<u8> = Vec::new();
        loop {
            let b = match self.reader.read_byte() {
                Ok(b) => b,
                Err(StreamError::UnexpectedEof { .. }) => {
                    return Err(CodecError::DelimiterNotFound {
                        node: node.path.clone(),
                        scanned: buf.len(),
                    })
                }
                Err(e) => return Err(e.into()),
            };
            buf.push(b);
            if buf.ends_with(delim) {
                break;
            }
        }
        let bit_len = buf.len() as u64 * 8;
        buf.truncate(buf.len() - delim.len());
        let value = match ty {
            TerminalType::Str => Value::Str(String::from_utf8_lossy(&buf).into_owned()),
            _ => interpret(cfg, ty, &buf, buf.len() as u64 * 8).unwrap_or(Value::Bytes(buf)),
        };
        self.rs.record(node, value.clone());
        Ok(ResultNode {
            name: node.name.clone(),
            kind: ResultKind::Terminal(value),
            bit_len,
            byte_offset,
        })
    }

    fn decode_struct(
        &mut self,
        node: &Node,
        cfg: &Config,
        children: &[Node],
        parent: Option<&Frame>,
    ) -> Result<ResultNode, CodecError> {
        let byte_offset = self.reader.byte_pos();
        let total = resolve_len(&node.path, cfg, None, parent)?;
        let mut frame = Frame::new(total.map(|r| r.bits));
        let mut out = Vec::with_capacity(children.len());
        for child in children {
            let r = self.decode_node(child, Some(&frame))?;
            frame.advance(&child.name, r.as_u64(), r.bit_len);
            // Zero-length children are skipped in the aggregate.
            if r.bit_len > 0 {
                out.push(r);
            }
        }
        if let Some(t) = total {
            // An inexact total (parent remaining) is a cap, not a target.
            let bad = if t.exact { frame.consumed != t.bits } else { frame.consumed > t.bits };
            if bad {
                return Err(CodecError::LengthMismatch {
                    node: node.path.clone(),
                    expected: t.bits,
                    got: frame.consumed,
                });
            }
        }
        let result = ResultNode {
            name: node.name.clone(),
            kind: ResultKind::Struct(out),
            bit_len: frame.consumed,
            byte_offset,
        };
        self.rs.record(node, result.to_value());
        Ok(result)
    }

    fn decode_list(
        &mut self,
        node: &Node,
        cfg: &Config,
        elem: &Node,
        parent: Option<&Frame>,
    ) -> Result<ResultNode, CodecError> {
        let byte_offset = self.reader.byte_pos();
        let total = resolve_len(&node.path, cfg, None, parent)?
            .ok_or_else(|| CodecError::LengthUnresolved(node.path.clone()))?
            .bits;
        let mut frame = Frame::new(Some(total));
        let mut items = Vec::new();
        while frame.consumed < total {
            self.reader.backup();
            let r = self.decode_node(elem, Some(&frame))?;
            if r.bit_len == 0 {
                return Err(CodecError::LengthMismatch {
                    node: elem.path.clone(),
                    expected: total - frame.consumed,
                    got: 0,
                });
            }
            if frame.consumed + r.bit_len > total {
                // The element overshot the list total: rewind to its start
                // for a precise position in the error, then fail the
                // aggregate. A nested backup inside the element may have
                // replaced the checkpoint; the rewind is then skipped and
                // only the reported position is coarser.
                if let Err(e) = self.reader.recovery() {
                    if !matches!(e, StreamError::NoCheckpoint) {
                        return Err(e.into());
                    }
                }
                return Err(CodecError::LengthMismatch {
                    node: node.path.clone(),
                    expected: total,
                    got: frame.consumed + r.bit_len,
                });
            }
            self.reader.commit();
            frame.advance(&elem.name, r.as_u64(), r.bit_len);
            items.push(r);
            if self.rs.take_stop_flag() {
                break;
            }
        }
        let result = ResultNode {
            name: node.name.clone(),
            kind: ResultKind::List(items),
            bit_len: frame.consumed,
            byte_offset,
        };
        self.rs.record(node, result.to_value());
        Ok(result)
    }

    fn decode_operator(
        &mut self,
        node: &Node,
        cfg: &Config,
        parent: Option<&Frame>,
    ) -> Result<ResultNode, CodecError> {
        let byte_offset = self.reader.byte_pos();
        let script = cfg.script.clone().unwrap_or_default();
        let total = resolve_len(&node.path, cfg, None, parent)
            .ok()
            .flatten()
            .map(|r| r.bits);
        let mut host = DecodeHost {
            dec: self,
            node,
            frame: Frame::new(total),
            spliced: Vec::new(),
        };
        let last = expr::evaluate(&script, &mut host)?;
        let consumed = host.frame.consumed;
        let spliced = host.spliced;
        let kind = if spliced.is_empty() {
            ResultKind::Terminal(last.into_value())
        } else {
            ResultKind::Struct(spliced)
        };
        let result = ResultNode { name: node.name.clone(), kind, bit_len: consumed, byte_offset };
        self.rs.record(node, result.to_value());
        Ok(result)
    }
}

/// Host wiring for operator scripts during parse: node invocations read
/// from the live bit stream and splice into this node's aggregate.
struct DecodeHost<'a, 'g, R> {
    dec: &'a mut Decoder<'g, R>,
    node: &'a Node,
    frame: Frame,
    spliced: Vec<ResultNode>,
}

impl<'a, 'g, R: Read> OpHost for DecodeHost<'a, 'g, R> {
    fn invoke(&mut self, name: &str) -> Result<Value, CodecError> {
        let child = self
            .node
            .descendant(name)
            .ok_or_else(|| CodecError::FieldNotFound {
                field: name.to_string(),
                node: self.node.path.clone(),
            })?
            .clone();
        let r = self.dec.decode_node(&child, Some(&self.frame))?;
        self.frame.advance(&child.name, r.as_u64(), r.bit_len);
        let v = r.to_value();
        self.spliced.push(r);
        Ok(v)
    }

    fn invoke_fragment(&mut self, name: &str) -> Result<Value, CodecError> {
        let frag = self
            .dec
            .grammar
            .fragment_by_name(name)
            .ok_or_else(|| CodecError::FieldNotFound {
                field: name.to_string(),
                node: "root".to_string(),
            })?
            .clone();
        let r = self.dec.decode_node(&frag, Some(&self.frame))?;
        self.frame.advance(&frag.name, r.as_u64(), r.bit_len);
        let v = r.to_value();
        self.spliced.push(r);
        Ok(v)
    }

    fn get_path(&self, path: &str) -> Option<Value> {
        get_path(self.dec.grammar, self.node, &self.dec.rs, path)
    }

    fn set_path(&mut self, path: &str, v: Value) -> Result<(), CodecError> {
        set_path(self.dec.grammar, self.node, &mut self.dec.rs, path, v)
    }

    fn del_path(&mut self, path: &str) -> Result<(), CodecError> {
        del_path(self.dec.grammar, self.node, &mut self.dec.rs, path)
    }
}

// ==================== Generate engine ====================

struct Encoder<'g> {
    grammar: &'g Grammar,
    writer: BitWriter,
    rs: RunState,
}

impl<'g> Encoder<'g> {
    /// Encodes one node from its input value; returns the bits produced.
    fn encode_node(
        &mut self,
        node: &Node,
        input: Option<&Value>,
        parent: Option<&Frame>,
    ) -> Result<u64, CodecError> {
        self.encode_node_inner(node, input, parent).map_err(|e| e.at(node))
    }

    fn encode_node_inner(
        &mut self,
        node: &Node,
        input: Option<&Value>,
        parent: Option<&Frame>,
    ) -> Result<u64, CodecError> {
        let cfg = effective_cfg(node, &self.rs)?;
        if cfg.script.is_some() {
            return self.encode_operator(node, &cfg, input, parent);
        }
        match &node.kind {
            NodeKind::Terminal(TerminalType::Ref(idx)) => {
                let fragment = self.grammar.fragment(*idx);
                self.encode_node(fragment, input, parent)
            }
            NodeKind::Terminal(ty) => self.encode_terminal(node, &cfg, *ty, input, parent),
            NodeKind::Struct(children) => self.encode_struct(node, &cfg, children, input, parent),
            NodeKind::List(elem) => self.encode_list(node, &cfg, elem, input, parent),
        }
    }

    fn require<'v>(&self, node: &Node, input: Option<&'v Value>) -> Result<&'v Value, CodecError> {
        input.ok_or_else(|| CodecError::FieldNotFound {
            field: node.name.clone(),
            node: node.path.clone(),
        })
    }

    fn encode_terminal(
        &mut self,
        node: &Node,
        cfg: &Config,
        ty: TerminalType,
        input: Option<&Value>,
        parent: Option<&Frame>,
    ) -> Result<u64, CodecError> {
        let value = self.require(node, input)?;
        if let Some(delim) = &cfg.delimiter {
            let body = value.as_bytes().ok_or_else(|| CodecError::Validation(format!(
                "`{}`: delimiter-terminated field needs bytes or string",
                node.path
            )))?;
            self.writer.write_bytes(body)?;
            self.writer.write_bytes(delim)?;
            let bits = (body.len() + delim.len()) as u64 * 8;
            self.rs.record(node, value.clone());
            return Ok(bits);
        }
        let resolved = resolve_len(&node.path, cfg, ty.natural_bits(), parent)?;
        let bits = match ty {
            TerminalType::UInt | TerminalType::Int | TerminalType::Byte | TerminalType::Bool => {
                let n = resolved
                    .ok_or_else(|| CodecError::LengthUnresolved(node.path.clone()))?
                    .bits;
                let raw = numeric_input(node, ty, value)?;
                let buf = num_to_bits(&node.path, cfg, raw, n)?;
                self.writer.write_bits(&buf, n)?;
                n
            }
            TerminalType::Raw | TerminalType::Str => {
                let body = value.as_bytes().ok_or_else(|| CodecError::Validation(format!(
                    "`{}`: expected bytes or string",
                    node.path
                )))?;
                let n = body.len() as u64 * 8;
                if let Some(expected) = resolved {
                    if expected.exact && expected.bits != n {
                        return Err(CodecError::LengthMismatch {
                            node: node.path.clone(),
                            expected: expected.bits,
                            got: n,
                        });
                    }
                }
                self.writer.write_bytes(body)?;
                n
            }
            TerminalType::Ref(_) => unreachable!("refs dispatch before encode_terminal"),
        };
        self.rs.record(node, value.clone());
        Ok(bits)
    }

    fn encode_struct(
        &mut self,
        node: &Node,
        cfg: &Config,
        children: &[Node],
        input: Option<&Value>,
        parent: Option<&Frame>,
    ) -> Result<u64, CodecError> {
        let value = self.require(node, input)?;
        let map = value.as_struct().ok_or_else(|| CodecError::Validation(format!(
            "`{}`: expected a struct value",
            node.path
        )))?;
        let total = resolve_len(&node.path, cfg, None, parent)?;
        let mut frame = Frame::new(total.map(|r| r.bits));
        for child in children {
            let child_input = map.get(&child.name);
            let effective = effective_cfg(child, &self.rs)?;
            if child_input.is_none() && effective.script.is_none() {
                // Parse drops zero-width children from the result tree, so
                // an input missing such a field still mirrors back to the
                // same bytes. Anything wider is a genuine omission.
                let natural = match &child.kind {
                    NodeKind::Terminal(ty) => ty.natural_bits(),
                    _ => None,
                };
                let zero = effective.delimiter.is_none()
                    && matches!(
                        resolve_len(&child.path, &effective, natural, Some(&frame)),
                        Ok(Some(Resolved { bits: 0, .. }))
                    );
                if zero {
                    frame.advance(&child.name, None, 0);
                    continue;
                }
                return Err(CodecError::FieldNotFound {
                    field: child.name.clone(),
                    node: node.path.clone(),
                });
            }
            let bits = self.encode_node(child, child_input, Some(&frame))?;
            let numeric = child_input.and_then(Value::as_u64);
            frame.advance(&child.name, numeric, bits);
        }
        if let Some(t) = total {
            let bad = if t.exact { frame.consumed != t.bits } else { frame.consumed > t.bits };
            if bad {
                return Err(CodecError::LengthMismatch {
                    node: node.path.clone(),
                    expected: t.bits,
                    got: frame.consumed,
                });
            }
        }
        self.rs.record(node, value.clone());
        Ok(frame.consumed)
    }

    fn encode_list(
        &mut self,
        node: &Node,
        cfg: &Config,
        elem: &Node,
        input: Option<&Value>,
        parent: Option<&Frame>,
    ) -> Result<u64, CodecError> {
        let value = self.require(node, input)?;
        let items = value.as_list().ok_or_else(|| CodecError::Validation(format!(
            "`{}`: expected a list value",
            node.path
        )))?;
        let total = resolve_len(&node.path, cfg, None, parent)?;
        let mut frame = Frame::new(total.map(|r| r.bits));
        for item in items {
            let bits = self.encode_node(elem, Some(item), Some(&frame))?;
            if let Some(t) = total {
                if frame.consumed + bits > t.bits {
                    return Err(CodecError::LengthMismatch {
                        node: node.path.clone(),
                        expected: t.bits,
                        got: frame.consumed + bits,
                    });
                }
            }
            frame.advance(&elem.name, item.as_u64(), bits);
        }
        if let Some(t) = total {
            if t.exact && frame.consumed != t.bits {
                return Err(CodecError::LengthMismatch {
                    node: node.path.clone(),
                    expected: t.bits,
                    got: frame.consumed,
                });
            }
        }
        self.rs.record(node, value.clone());
        Ok(frame.consumed)
    }

    fn encode_operator(
        &mut self,
        node: &Node,
        cfg: &Config,
        input: Option<&Value>,
        parent: Option<&Frame>,
    ) -> Result<u64, CodecError> {
        let script = cfg.script.clone().unwrap_or_default();
        let total = resolve_len(&node.path, cfg, None, parent)
            .ok()
            .flatten()
            .map(|r| r.bits);
        let mut host = EncodeHost {
            enc: self,
            node,
            input,
            frame: Frame::new(total),
        };
        expr::evaluate(&script, &mut host)?;
        Ok(host.frame.consumed)
    }
}

/// Host wiring for operator scripts during generate: node invocations pull
/// their values from this node's input struct and write to the stream.
struct EncodeHost<'a, 'g> {
    enc: &'a mut Encoder<'g>,
    node: &'a Node,
    input: Option<&'a Value>,
    frame: Frame,
}

impl<'a, 'g> EncodeHost<'a, 'g> {
    fn child_input(&self, name: &str) -> Option<&'a Value> {
        self.input.and_then(Value::as_struct).and_then(|m| m.get(name))
    }
}

impl<'a, 'g> OpHost for EncodeHost<'a, 'g> {
    fn invoke(&mut self, name: &str) -> Result<Value, CodecError> {
        let child = self
            .node
            .descendant(name)
            .ok_or_else(|| CodecError::FieldNotFound {
                field: name.to_string(),
                node: self.node.path.clone(),
            })?
            .clone();
        let input = self.child_input(name);
        let bits = self.enc.encode_node(&child, input, Some(&self.frame))?;
        let value = input.cloned().unwrap_or(Value::U64(0));
        self.frame.advance(&child.name, value.as_u64(), bits);
        Ok(value)
    }

    fn invoke_fragment(&mut self, name: &str) -> Result<Value, CodecError> {
        let frag = self
            .enc
            .grammar
            .fragment_by_name(name)
            .ok_or_else(|| CodecError::FieldNotFound {
                field: name.to_string(),
                node: "root".to_string(),
            })?
            .clone();
        let input = self.child_input(name);
        let bits = self.enc.encode_node(&frag, input, Some(&self.frame))?;
        let value = input.cloned().unwrap_or(Value::U64(0));
        self.frame.advance(&frag.name, value.as_u64(), bits);
        Ok(value)
    }

    fn get_path(&self, path: &str) -> Option<Value> {
        // A bare child name resolves to the node's input before falling
        // back to already-recorded values, so checksum scripts can read
        // fields that have not been generated yet.
        if !path.contains('.') {
            if let Some(v) = self.child_input(path) {
                return Some(v.clone());
            }
        }
        get_path(self.enc.grammar, self.node, &self.enc.rs, path)
    }

    fn set_path(&mut self, path: &str, v: Value) -> Result<(), CodecError> {
        set_path(self.enc.grammar, self.node, &mut self.enc.rs, path, v)
    }

    fn del_path(&mut self, path: &str) -> Result<(), CodecError> {
        del_path(self.enc.grammar, self.node, &mut self.enc.rs, path)
    }
}

// ==================== Shared helpers ====================

/// Node config with any per-call operator overrides applied.
fn effective_cfg<'n>(node: &'n Node, rs: &RunState) -> Result<Cow<'n, Config>, CodecError> {
    let prefix = format!("{}#", node.path);
    let mut cfg: Option<Config> = None;
    for (k, v) in &rs.overrides {
        if let Some(key) = k.strip_prefix(prefix.as_str()) {
            let c = cfg.get_or_insert_with(|| node.cfg.clone());
            c.apply(key, v)
                .map_err(|e| CodecError::Operator(format!("override {}: {}", k, e)))?;
        }
    }
    Ok(match cfg {
        Some(c) => Cow::Owned(c),
        None => Cow::Borrowed(&node.cfg),
    })
}

/// Resolves an operator path to a node: the operator's own subtree first,
/// then the enclosing fragment (so scripts reach their siblings), then the
/// fragment table. A `root.` prefix is accepted and ignored.
fn find_node<'g>(grammar: &'g Grammar, scope: &'g Node, path: &str) -> Option<&'g Node> {
    let path = path.strip_prefix("root.").unwrap_or(path);
    let local_root = scope
        .path
        .split('.')
        .next()
        .and_then(|frag| grammar.fragment_by_name(frag));
    let resolve_head = |head: &str| -> Option<&'g Node> {
        if scope.name == head {
            return Some(scope);
        }
        scope
            .descendant(head)
            .or_else(|| {
                local_root.and_then(|r| if r.name == head { Some(r) } else { r.descendant(head) })
            })
            .or_else(|| grammar.fragment_by_name(head))
    };
    match path.split_once('.') {
        None => resolve_head(path),
        Some((head, rest)) => resolve_head(head).and_then(|b| b.at_path(rest)),
    }
}

fn get_path(grammar: &Grammar, scope: &Node, rs: &RunState, path: &str) -> Option<Value> {
    if let Some(flag) = path.strip_prefix("ctx.") {
        return rs.flags.get(flag).cloned();
    }
    if let Some((node_path, key)) = path.rsplit_once(".cfg.") {
        let node = find_node(grammar, scope, node_path)?;
        let cfg = effective_cfg(node, rs).ok()?;
        return cfg.get(key).map(Value::Str);
    }
    let bare = path.strip_prefix("root.").unwrap_or(path);
    rs.values.get(bare).or_else(|| rs.values.get(path)).cloned()
}

fn set_path(
    grammar: &Grammar,
    scope: &Node,
    rs: &mut RunState,
    path: &str,
    v: Value,
) -> Result<(), CodecError> {
    if let Some(flag) = path.strip_prefix("ctx.") {
        rs.flags.insert(flag.to_string(), v);
        return Ok(());
    }
    if let Some((node_path, key)) = path.rsplit_once(".cfg.") {
        let node = find_node(grammar, scope, node_path).ok_or_else(|| {
            CodecError::Operator(format!("set: no node at `{}`", node_path))
        })?;
        let text = match &v {
            Value::Str(s) => s.clone(),
            Value::U64(n) => n.to_string(),
            Value::I64(n) => n.to_string(),
            other => {
                return Err(CodecError::Operator(format!(
                    "set: config values must be strings or numbers, got {:?}",
                    other
                )))
            }
        };
        rs.overrides.insert(format!("{}#{}", node.path, key), text);
        return Ok(());
    }
    Err(CodecError::Operator(format!(
        "set: `{}` is not a ctx.* or *.cfg.* path",
        path
    )))
}

fn del_path(grammar: &Grammar, scope: &Node, rs: &mut RunState, path: &str) -> Result<(), CodecError> {
    if let Some(flag) = path.strip_prefix("ctx.") {
        rs.flags.remove(flag);
        return Ok(());
    }
    if let Some((node_path, key)) = path.rsplit_once(".cfg.") {
        let node = find_node(grammar, scope, node_path).ok_or_else(|| {
            CodecError::Operator(format!("del: no node at `{}`", node_path))
        })?;
        rs.overrides.remove(&format!("{}#{}", node.path, key));
        return Ok(());
    }
    Err(CodecError::Operator(format!(
        "del: `{}` is not a ctx.* or *.cfg.* path",
        path
    )))
}

/// Interprets a bit run per the terminal's declared type, endianness, and
/// variant.
fn interpret(cfg: &Config, ty: TerminalType, buf: &[u8], n: u64) -> Result<Value, CodecError> {
    match ty {
        TerminalType::Raw | TerminalType::Ref(_) => Ok(Value::Bytes(buf.to_vec())),
        TerminalType::Str => Ok(Value::Str(String::from_utf8_lossy(buf).into_owned())),
        TerminalType::Bool => Ok(Value::Bool(buf.iter().any(|&b| b != 0))),
        TerminalType::UInt | TerminalType::Byte => match cfg.variant {
            Variant::Standard => Ok(Value::U64(bits_to_num(cfg.endian, buf, n)?)),
            Variant::Bcd => Ok(Value::U64(bcd_to_num(buf, n)?)),
            Variant::Ascii => Ok(Value::U64(ascii_to_num(buf)?)),
        },
        TerminalType::Int => {
            let raw = match cfg.variant {
                Variant::Standard => bits_to_num(cfg.endian, buf, n)?,
                Variant::Bcd => bcd_to_num(buf, n)?,
                Variant::Ascii => ascii_to_num(buf)?,
            };
            Ok(Value::I64(sign_extend(raw, n)))
        }
    }
}

fn numeric_input(node: &Node, ty: TerminalType, value: &Value) -> Result<u64, CodecError> {
    let v = match ty {
        TerminalType::Int => value.as_i64().map(|n| n as u64),
        TerminalType::Bool => value.as_bool().map(u64::from),
        _ => value.as_u64(),
    };
    v.ok_or_else(|| CodecError::Validation(format!("`{}`: expected a numeric value", node.path)))
}

/// Serializes the low `n` bits of a number into the reader/writer bit-run
/// layout (leading partial byte low-aligned).
fn num_to_bits(path: &str, cfg: &Config, value: u64, n: u64) -> Result<Vec<u8>, CodecError> {
    if n > 64 {
        return Err(CodecError::Validation(format!(
            "`{}`: numeric fields are at most 64 bits, got {}",
            path, n
        )));
    }
    match cfg.variant {
        Variant::Standard => {}
        Variant::Bcd => return num_to_bcd(path, value, n),
        Variant::Ascii => return num_to_ascii(path, value, n),
    }
    let n_bytes = ((n + 7) / 8) as usize;
    let mask = if n == 64 { u64::MAX } else { (1u64 << n) - 1 };
    let mut full = [0u8; 8];
    BigEndian::write_u64(&mut full, value & mask);
    let mut buf = full[8 - n_bytes..].to_vec();
    if cfg.endian == Endianness::Little && n % 8 == 0 {
        buf.reverse();
    }
    Ok(buf)
}

fn bits_to_num(endian: Endianness, buf: &[u8], n: u64) -> Result<u64, CodecError> {
    if n > 64 {
        return Err(CodecError::Validation(format!(
            "numeric fields are at most 64 bits, got {}",
            n
        )));
    }
    let mut bytes = buf.to_vec();
    if endian == Endianness::Little && n % 8 == 0 {
        bytes.reverse();
    }
    let mut full = [0u8; 8];
    full[8 - bytes.len()..].copy_from_slice(&bytes);
    Ok(BigEndian::read_u64(&full))
}

fn sign_extend(value: u64, bits: u64) -> i64 {
    if bits == 0 || bits >= 64 {
        return value as i64;
    }
    let shift = 64 - bits;
    ((value << shift) as i64) >> shift
}

fn bcd_to_num(buf: &[u8], n: u64) -> Result<u64, CodecError> {
    if n % 8 != 0 {
        return Err(CodecError::Validation(
            "bcd fields must be whole bytes".to_string(),
        ));
    }
    let mut out: u64 = 0;
    for &b in buf {
        for nibble in [b >> 4, b & 0x0f] {
            if nibble > 9 {
                return Err(CodecError::Validation(format!(
                    "bcd digit out of range: {:#x}",
                    nibble
                )));
            }
            out = out * 10 + u64::from(nibble);
        }
    }
    Ok(out)
}

fn num_to_bcd(path: &str, value: u64, n: u64) -> Result<Vec<u8>, CodecError> {
    if n % 8 != 0 {
        return Err(CodecError::Validation(format!(
            "`{}`: bcd fields must be whole bytes",
            path
        )));
    }
    let digits = (n / 4) as usize;
    let text = format!("{:0width$}", value, width = digits);
    if text.len() > digits {
        return Err(CodecError::Validation(format!(
            "`{}`: {} does not fit in {} bcd digits",
            path, value, digits
        )));
    }
    let mut buf = vec![0u8; (n / 8) as usize];
    for (i, c) in text.bytes().enumerate() {
        let d = c - b'0';
        if i % 2 == 0 {
            buf[i / 2] |= d << 4;
        } else {
            buf[i / 2] |= d;
        }
    }
    Ok(buf)
}

fn ascii_to_num(buf: &[u8]) -> Result<u64, CodecError> {
    let text = std::str::from_utf8(buf)
        .map_err(|_| CodecError::Validation("ascii field is not UTF-8".to_string()))?;
    text.trim()
        .parse()
        .map_err(|_| CodecError::Validation(format!("ascii field is not a number: `{}`", text.trim())))
}

fn num_to_ascii(path: &str, value: u64, n: u64) -> Result<Vec<u8>, CodecError> {
    if n % 8 != 0 {
        return Err(CodecError::Validation(format!(
            "`{}`: ascii fields must be whole bytes",
            path
        )));
    }
    let width = (n / 8) as usize;
    let text = format!("{:0width$}", value, width = width);
    if text.len() > width {
        return Err(CodecError::Validation(format!(
            "`{}`: {} does not fit in {} ascii digits",
            path, value, width
        )));
    }
    Ok(text.into_bytes())
}
