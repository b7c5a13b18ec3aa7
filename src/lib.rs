//! # wiregram — Declarative Binary Protocol Codec
//!
//! A grammar language for describing wire formats as nested field
//! mappings, plus a symmetric codec: parse decodes a byte/bit stream into
//! a named result tree, generate mirrors a value tree back to exact bytes.
//!
//! ## Grammar documents
//!
//! A document is a nested mapping. Uppercase-leading keys are fields;
//! lowercase-leading keys are config directives for the enclosing scope.
//! Every top-level field is a named, reusable fragment; the first one is
//! the root.
//!
//! ```text
//! Handshake {
//!   endian: big
//!   Header {
//!     Magic:  raw,2
//!     Length: uint,2
//!   }
//!   Body: raw; lenfrom:Length
//! }
//! ```
//!
//! ## Field descriptors
//!
//! `type[,length[bit]][;key:value]*` — types are `uint`, `int`, `byte`,
//! `bool`, `raw`, `str`, or the name of another fragment. A trailing `...`
//! on the type or key marks a repeated list. Lengths default to bytes; a
//! `bit` suffix counts bits. Options cover `endian`, `variant` (`std`,
//! `bcd`, `ascii`), `length`, `lenfrom`/`mul`, `del` (delimiter
//! termination), and `eval` (operator script).
//!
//! ## Usage
//!
//! ```
//! use wiregram::Codec;
//!
//! let codec = Codec::from_source(
//!     "Msg {
//!        Length:  uint,1
//!        Payload: raw; lenfrom:Length
//!      }",
//! )?;
//! let tree = codec.parse_bytes(&[0x03, b'a', b'b', b'c'])?;
//! assert_eq!(tree.get("Payload").and_then(|n| n.as_bytes()), Some(&b"abc"[..]));
//!
//! let bytes = codec.generate(&tree.to_value())?;
//! assert_eq!(bytes, [0x03, b'a', b'b', b'c']);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod bits;
pub mod codec;
pub mod dump;
pub mod expr;
pub mod node;
pub mod parser;
pub mod rules;
pub mod value;

pub use bits::{BitReader, BitWriter, StreamError};
pub use codec::{Codec, CodecError};
pub use node::{Endianness, Grammar, Variant};
pub use parser::GrammarError;
pub use rules::{RuleSet, RuleSetError};
pub use value::{ResultKind, ResultNode, Value};
