//! Runtime values: plain field values and the decoded result tree.

use std::collections::HashMap;

/// A single field value, either supplied to generate or decoded by parse.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U64(u64),
    I64(i64),
    Bool(bool),
    Bytes(Vec<u8>),
    Str(String),
    Struct(HashMap<String, Value>),
    List(Vec<Value>),
}

impl Value {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(x) => Some(*x),
            Value::I64(x) => (*x).try_into().ok(),
            Value::Bool(b) => Some(u64::from(*b)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(x) => Some(*x),
            Value::U64(x) => (*x).try_into().ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::U64(x) => Some(*x != 0),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Struct(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(v) => Some(v),
            _ => None,
        }
    }
}

/// Shape of one decoded node.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultKind {
    Terminal(Value),
    Struct(Vec<ResultNode>),
    List(Vec<ResultNode>),
}

/// One node of the decoded result tree. Mirrors the grammar node shape and
/// records where and how much of the stream it consumed, so generate can
/// reproduce the exact bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultNode {
    pub name: String,
    pub kind: ResultKind,
    /// Bits this node consumed.
    pub bit_len: u64,
    /// Byte offset of the node's first bit in the stream.
    pub byte_offset: u64,
}

impl ResultNode {
    /// Looks up a descendant by dotted path. Struct segments match child
    /// names; list segments are numeric indices (`"Items.2.Tag"`).
    pub fn get(&self, path: &str) -> Option<&ResultNode> {
        let mut cur = self;
        for seg in path.split('.') {
            cur = match &cur.kind {
                ResultKind::Struct(children) => children.iter().find(|c| c.name == seg)?,
                ResultKind::List(items) => items.get(seg.parse::<usize>().ok()?)?,
                ResultKind::Terminal(_) => return None,
            };
        }
        Some(cur)
    }

    /// The terminal value at this node, if it is a leaf.
    pub fn value(&self) -> Option<&Value> {
        match &self.kind {
            ResultKind::Terminal(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.value().and_then(Value::as_u64)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.value().and_then(Value::as_i64)
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        self.value().and_then(Value::as_bytes)
    }

    /// Converts the result tree into a plain [`Value`] tree (structs to
    /// name→value maps, lists to vectors). Round-trip checks feed this back
    /// into generate.
    pub fn to_value(&self) -> Value {
        match &self.kind {
            ResultKind::Terminal(v) => v.clone(),
            ResultKind::Struct(children) => Value::Struct(
                children
                    .iter()
                    .map(|c| (c.name.clone(), c.to_value()))
                    .collect(),
            ),
            ResultKind::List(items) => Value::List(items.iter().map(ResultNode::to_value).collect()),
        }
    }
}
