//! Integration tests: compile grammar documents, parse byte streams, and
//! generate them back.

use wiregram::{Codec, CodecError, RuleSet, Value};

const LENGTH_PREFIXED: &str = r#"
Msg {
  Length:  uint,1
  Payload: raw; lenfrom:Length
}
"#;

#[test]
fn test_round_trip_length_prefixed() {
    let codec = Codec::from_source(LENGTH_PREFIXED).expect("compile");
    let bytes = [0x03, b'a', b'b', b'c'];
    let tree = codec.parse_bytes(&bytes).expect("parse");
    assert_eq!(tree.get("Length").and_then(|n| n.as_u64()), Some(3));
    assert_eq!(tree.get("Payload").and_then(|n| n.as_bytes()), Some(&b"abc"[..]));
    assert_eq!(tree.bit_len, 32);

    let out = codec.generate(&tree.to_value()).expect("generate");
    assert_eq!(out, bytes);
}

#[test]
fn test_parse_is_deterministic() {
    let codec = Codec::from_source(LENGTH_PREFIXED).expect("compile");
    let bytes = [0x04, 1, 2, 3, 4];
    let a = codec.parse_bytes(&bytes).expect("parse");
    let b = codec.parse_bytes(&bytes).expect("parse");
    assert_eq!(a, b);
}

#[test]
fn test_cross_field_length_ignores_stream_size() {
    // Payload takes exactly Length bytes even when more input follows.
    let codec = Codec::from_source(LENGTH_PREFIXED).expect("compile");
    let bytes = [0x05, 1, 2, 3, 4, 5, 0xAA, 0xBB, 0xCC];
    let tree = codec.parse_bytes(&bytes).expect("parse");
    assert_eq!(tree.get("Payload").and_then(|n| n.as_bytes()), Some(&[1, 2, 3, 4, 5][..]));
    assert_eq!(tree.bit_len, 48);
}

#[test]
fn test_endianness_big_and_little() {
    let big = Codec::from_source("V { N: uint,4 }").expect("compile");
    let little = Codec::from_source("V { N: uint,4; endian:little }").expect("compile");
    let bytes = [0x00, 0x00, 0x01, 0x00];
    let b = big.parse_bytes(&bytes).expect("parse");
    let l = little.parse_bytes(&bytes).expect("parse");
    assert_eq!(b.get("N").and_then(|n| n.as_u64()), Some(256));
    assert_eq!(l.get("N").and_then(|n| n.as_u64()), Some(16_777_216));

    assert_eq!(big.generate(&b.to_value()).expect("generate"), bytes);
    assert_eq!(little.generate(&l.to_value()).expect("generate"), bytes);
}

#[test]
fn test_endianness_inherited_by_children() {
    let src = r#"
V {
  endian: little
  A: uint,2
  Sub {
    B: uint,2
  }
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[0x01, 0x00, 0x02, 0x00]).expect("parse");
    assert_eq!(tree.get("A").and_then(|n| n.as_u64()), Some(1));
    assert_eq!(tree.get("Sub.B").and_then(|n| n.as_u64()), Some(2));
}

#[test]
fn test_bit_fields_12_4_8() {
    let src = r#"
Bits {
  A: uint,12bit
  B: uint,4bit
  C: uint,8bit
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let bytes = [0xAB, 0xCD, 0xEF];
    let tree = codec.parse_bytes(&bytes).expect("parse");
    assert_eq!(tree.get("A").and_then(|n| n.as_u64()), Some(0xABC));
    assert_eq!(tree.get("B").and_then(|n| n.as_u64()), Some(0xD));
    assert_eq!(tree.get("C").and_then(|n| n.as_u64()), Some(0xEF));
    assert_eq!(tree.bit_len, 24);

    let out = codec.generate(&tree.to_value()).expect("generate");
    assert_eq!(out, bytes);
}

#[test]
fn test_delimiter_scan() {
    let src = r#"
Doc {
  Field: str; del:delim
  Tail:  raw,3
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(b"AAAdelimABC").expect("parse");
    assert_eq!(tree.get("Field").and_then(|n| n.value()).and_then(Value::as_str), Some("AAA"));
    assert_eq!(tree.get("Tail").and_then(|n| n.as_bytes()), Some(&b"ABC"[..]));
    // The delimiter itself counts toward the field's extent.
    assert_eq!(tree.get("Field").map(|n| n.bit_len), Some(64));

    let out = codec.generate(&tree.to_value()).expect("generate");
    assert_eq!(out, b"AAAdelimABC");
}

#[test]
fn test_delimiter_not_found() {
    let codec = Codec::from_source("Doc { Field: str; del:delim }").expect("compile");
    let err = codec.parse_bytes(b"AAAB").expect_err("should fail");
    assert!(err.to_string().contains("delimiter not found"), "got: {}", err);
}

#[test]
fn test_hex_delimiter() {
    let codec = Codec::from_source("Line { Text: str; del:0x0d0a }").expect("compile");
    let tree = codec.parse_bytes(b"hello\r\nrest").expect("parse");
    assert_eq!(tree.get("Text").and_then(|n| n.value()).and_then(Value::as_str), Some("hello"));
}

#[test]
fn test_list_fills_resolved_length() {
    let src = r#"
Doc {
  Count: uint,1
  Items: uint...,1; lenfrom:Count
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[3, 10, 20, 30, 99]).expect("parse");
    let items = tree.get("Items").expect("items");
    assert_eq!(items.bit_len, 24);
    assert_eq!(tree.get("Items.0").and_then(|n| n.as_u64()), Some(10));
    assert_eq!(tree.get("Items.1").and_then(|n| n.as_u64()), Some(20));
    assert_eq!(tree.get("Items.2").and_then(|n| n.as_u64()), Some(30));

    let out = codec.generate(&tree.to_value()).expect("generate");
    assert_eq!(out, [3, 10, 20, 30]);
}

#[test]
fn test_list_element_overshoot_fails() {
    // 3-byte total cannot hold 2-byte elements evenly: the second element
    // would run past the bound.
    let codec = Codec::from_source("Doc { Items: uint...,2; length:3 }").expect("compile");
    let err = codec.parse_bytes(&[1, 2, 3]).expect_err("should fail");
    assert!(err.to_string().contains("length mismatch"), "got: {}", err);
}

#[test]
fn test_struct_length_conservation() {
    let src = r#"
Doc {
  Head {
    length: 4
    A: uint,2
    B: uint,2
  }
  Rest: raw,1
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[0, 1, 0, 2, 9]).expect("parse");
    assert_eq!(tree.get("Head").map(|n| n.bit_len), Some(32));
    assert_eq!(tree.get("Head.B").and_then(|n| n.as_u64()), Some(2));
}

#[test]
fn test_struct_children_exceeding_length_fail() {
    let src = r#"
Doc {
  Head {
    length: 3
    A: uint,2
    B: uint,2
  }
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let err = codec.parse_bytes(&[0, 1, 0, 2]).expect_err("should fail");
    assert!(err.to_string().contains("length mismatch"), "got: {}", err);
}

#[test]
fn test_last_field_takes_parent_remainder() {
    let src = r#"
Doc {
  length: 6
  A: raw,2
  B: raw
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[1, 2, 3, 4, 5, 6]).expect("parse");
    assert_eq!(tree.get("B").and_then(|n| n.as_bytes()), Some(&[3, 4, 5, 6][..]));
}

#[test]
fn test_length_unresolved() {
    let codec = Codec::from_source("Doc { X: raw }").expect("compile");
    let err = codec.parse_bytes(&[1, 2, 3]).expect_err("should fail");
    assert!(err.to_string().contains("length unresolved"), "got: {}", err);
}

#[test]
fn test_unexpected_eof() {
    let codec = Codec::from_source(LENGTH_PREFIXED).expect("compile");
    let err = codec.parse_bytes(&[5, 1, 2]).expect_err("should fail");
    assert!(err.to_string().contains("unexpected EOF"), "got: {}", err);
}

#[test]
fn test_fragment_reference() {
    let src = r#"
Packet {
  Head: Hdr
  Body: raw,2
}
Hdr {
  Magic: raw,2
  Ver:   uint,1
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let bytes = [b'W', b'G', 0x02, 0xAA, 0xBB];
    let tree = codec.parse_bytes(&bytes).expect("parse");
    assert_eq!(tree.get("Head.Magic").and_then(|n| n.as_bytes()), Some(&b"WG"[..]));
    assert_eq!(tree.get("Head.Ver").and_then(|n| n.as_u64()), Some(2));

    let out = codec.generate(&tree.to_value()).expect("generate");
    assert_eq!(out, bytes);

    // A non-root fragment is addressable on its own.
    let hdr = codec.parse_fragment("Hdr", &bytes[..3]).expect("parse fragment");
    assert_eq!(hdr.get("Ver").and_then(|n| n.as_u64()), Some(2));
    let hdr_bytes = codec.generate_fragment("Hdr", &hdr.to_value()).expect("generate fragment");
    assert_eq!(hdr_bytes, &bytes[..3]);
}

#[test]
fn test_fragment_list() {
    let src = r#"
Doc {
  Pairs: Pair...; length:6
}
Pair {
  K: uint,1
  V: uint,2
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[1, 0, 10, 2, 0, 20]).expect("parse");
    assert_eq!(tree.get("Pairs.0.K").and_then(|n| n.as_u64()), Some(1));
    assert_eq!(tree.get("Pairs.1.V").and_then(|n| n.as_u64()), Some(20));
}

#[test]
fn test_repeated_block() {
    let src = r#"
Doc {
  Entry... {
    length: 4
    Tag:  uint,1
    Data: raw,1
  }
}
"#;
    // The repeat marker wins: `length` bounds the list, each element is
    // the 2-byte struct.
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[1, 0xAA, 2, 0xBB]).expect("parse");
    assert_eq!(tree.get("Entry.0.Tag").and_then(|n| n.as_u64()), Some(1));
    assert_eq!(tree.get("Entry.1.Tag").and_then(|n| n.as_u64()), Some(2));
}

#[test]
fn test_bcd_variant() {
    let codec = Codec::from_source("Doc { D: uint,2; variant:bcd }").expect("compile");
    let tree = codec.parse_bytes(&[0x12, 0x34]).expect("parse");
    assert_eq!(tree.get("D").and_then(|n| n.as_u64()), Some(1234));
    assert_eq!(codec.generate(&tree.to_value()).expect("generate"), [0x12, 0x34]);
}

#[test]
fn test_bcd_rejects_hex_digits() {
    let codec = Codec::from_source("Doc { D: uint,1; variant:bcd }").expect("compile");
    assert!(codec.parse_bytes(&[0x1A]).is_err());
}

#[test]
fn test_ascii_variant() {
    let codec = Codec::from_source("Doc { N: uint,4; variant:ascii }").expect("compile");
    let tree = codec.parse_bytes(b"0042").expect("parse");
    assert_eq!(tree.get("N").and_then(|n| n.as_u64()), Some(42));
    assert_eq!(codec.generate(&tree.to_value()).expect("generate"), b"0042");
}

#[test]
fn test_signed_int() {
    let codec = Codec::from_source("Doc { V: int,1 }").expect("compile");
    let tree = codec.parse_bytes(&[0xFF]).expect("parse");
    assert_eq!(tree.get("V").and_then(|n| n.as_i64()), Some(-1));
    assert_eq!(codec.generate(&tree.to_value()).expect("generate"), [0xFF]);
}

#[test]
fn test_natural_widths() {
    // uint defaults to 4 bytes, byte and bool to 1.
    let src = r#"
Doc {
  N: uint
  Y: byte
  F: bool
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[0, 0, 1, 0, 0x7F, 0x01]).expect("parse");
    assert_eq!(tree.get("N").and_then(|n| n.as_u64()), Some(256));
    assert_eq!(tree.get("Y").and_then(|n| n.as_u64()), Some(0x7F));
    assert_eq!(tree.get("F").and_then(|n| n.value()).and_then(Value::as_bool), Some(true));
}

#[test]
fn test_generate_missing_field() {
    let codec = Codec::from_source(LENGTH_PREFIXED).expect("compile");
    let input = Value::Struct([("Length".to_string(), Value::U64(3))].into_iter().collect());
    let err = codec.generate(&input).expect_err("should fail");
    assert!(matches!(
        flatten(&err),
        CodecError::FieldNotFound { field, .. } if field == "Payload"
    ));
}

#[test]
fn test_generate_length_mismatch() {
    let codec = Codec::from_source(LENGTH_PREFIXED).expect("compile");
    let input = Value::Struct(
        [
            ("Length".to_string(), Value::U64(3)),
            ("Payload".to_string(), Value::Bytes(vec![1, 2])),
        ]
        .into_iter()
        .collect(),
    );
    let err = codec.generate(&input).expect_err("should fail");
    assert!(err.to_string().contains("length mismatch"), "got: {}", err);
}

#[test]
fn test_operator_conditional_length() {
    let src = r#"
Doc {
  Kind: uint,1
  Pick {
    eval: set(Data.cfg.length, Kind == 1 ? 2 : 4)
  }
  Data: raw
}
"#;
    let codec = Codec::from_source(src).expect("compile");

    let short = codec.parse_bytes(&[1, 0xAA, 0xBB]).expect("parse");
    assert_eq!(short.get("Data").and_then(|n| n.as_bytes()), Some(&[0xAA, 0xBB][..]));

    let long = codec.parse_bytes(&[2, 1, 2, 3, 4]).expect("parse");
    assert_eq!(long.get("Data").and_then(|n| n.as_bytes()), Some(&[1, 2, 3, 4][..]));

    // The override is per call: the generate direction re-derives it.
    let out = codec.generate(&short.to_value()).expect("generate");
    assert_eq!(out, [1, 0xAA, 0xBB]);
}

#[test]
fn test_operator_stop_flag_terminates_list() {
    let src = r#"
Stream {
  Items: Item...; length:6
}
Item {
  Tag: uint,1
  Halt {
    eval: set(ctx.stop, Tag == 0 ? 1 : 0)
  }
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[5, 7, 0, 9, 9, 9]).expect("parse");
    let items = tree.get("Items").expect("items");
    assert_eq!(items.bit_len, 24);
    assert_eq!(tree.get("Items.2.Tag").and_then(|n| n.as_u64()), Some(0));
    assert!(tree.get("Items.3").is_none());
}

#[test]
fn test_operator_invokes_children() {
    let src = r#"
Doc {
  Body {
    eval: A(); B()
    A: uint,1
    B: uint,1
  }
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[7, 9]).expect("parse");
    assert_eq!(tree.get("Body.A").and_then(|n| n.as_u64()), Some(7));
    assert_eq!(tree.get("Body.B").and_then(|n| n.as_u64()), Some(9));
    assert_eq!(tree.get("Body").map(|n| n.bit_len), Some(16));
}

#[test]
fn test_operator_error_surfaces() {
    let codec =
        Codec::from_source("Doc { Bad { eval: 1 / 0 } Pad: raw,1 }").expect("compile");
    let err = codec.parse_bytes(&[0]).expect_err("should fail");
    assert!(err.to_string().contains("division by zero"), "got: {}", err);
}

#[test]
fn test_rule_set_loads_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("msg.rules"), LENGTH_PREFIXED).expect("write");
    std::fs::write(dir.path().join("pair.rules"), "Pair {\n  K: uint,1\n  V: uint,1\n}")
        .expect("write");
    std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

    let set = RuleSet::load_dir(dir.path()).expect("load");
    assert_eq!(set.len(), 2);
    let mut names: Vec<_> = set.names().collect();
    names.sort_unstable();
    assert_eq!(names, ["msg", "pair"]);

    let tree = set.parse("msg", &[0x02, b'h', b'i']).expect("parse");
    assert_eq!(tree.get("Payload").and_then(|n| n.as_bytes()), Some(&b"hi"[..]));
    let out = set.generate("msg", &tree.to_value()).expect("generate");
    assert_eq!(out, [0x02, b'h', b'i']);

    assert!(set.parse("nope", &[0]).is_err());
}

#[test]
fn test_rule_set_rejects_bad_grammar() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("bad.rules"), "Doc { X: nosuchtype }").expect("write");
    assert!(RuleSet::load_dir(dir.path()).is_err());
}

#[test]
fn test_byte_offsets() {
    let codec = Codec::from_source(LENGTH_PREFIXED).expect("compile");
    let tree = codec.parse_bytes(&[0x02, 1, 2]).expect("parse");
    assert_eq!(tree.get("Length").map(|n| n.byte_offset), Some(0));
    assert_eq!(tree.get("Payload").map(|n| n.byte_offset), Some(1));
}

#[test]
fn test_dump_tree() {
    let codec = Codec::from_source(LENGTH_PREFIXED).expect("compile");
    let tree = codec.parse_bytes(&[0x02, 0xDE, 0xAD]).expect("parse");
    let text = wiregram::dump::dump_tree(&tree);
    assert!(text.contains("Length = 2"), "got: {}", text);
    assert!(text.contains("de ad"), "got: {}", text);
}

#[test]
fn test_huge_length_field_fails_cleanly() {
    // A length field near u64::MAX must not wrap when scaled to bits.
    let src = r#"
Big {
  L: uint,8
  P: raw; lenfrom:L
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let err = codec.parse_bytes(&[0xFF; 8]).expect_err("should fail");
    assert!(err.to_string().contains("length unresolved"), "got: {}", err);
}

#[test]
fn test_sized_parent_remainder_outranks_field_reference() {
    // Inside a parent with a known total, the remaining-length fallback
    // applies before a cross-field reference.
    let src = r#"
Doc {
  length: 6
  L: uint,1
  P: raw; lenfrom:L
  T: raw
}
"#;
    let codec = Codec::from_source(src).expect("compile");
    let tree = codec.parse_bytes(&[2, 10, 11, 20, 21, 22]).expect("parse");
    assert_eq!(
        tree.get("P").and_then(|n| n.as_bytes()),
        Some(&[10, 11, 20, 21, 22][..])
    );
    // T was left zero bytes and drops out of the tree; the mirror still
    // reproduces the input without it.
    assert!(tree.get("T").is_none());
    let out = codec.generate(&tree.to_value()).expect("generate");
    assert_eq!(out, [2, 10, 11, 20, 21, 22]);
}

#[test]
fn test_round_trip_empty_payload() {
    // A zero-length payload is dropped from the result tree; generate
    // accepts its absence and mirrors the stream back.
    let codec = Codec::from_source(LENGTH_PREFIXED).expect("compile");
    let tree = codec.parse_bytes(&[0x00]).expect("parse");
    assert_eq!(tree.get("Length").and_then(|n| n.as_u64()), Some(0));
    assert!(tree.get("Payload").is_none());
    let out = codec.generate(&tree.to_value()).expect("generate");
    assert_eq!(out, [0x00]);
}

#[test]
fn test_nested_list_overshoot_reports_length_mismatch() {
    // The inner list checkpoints on its own elements, so the outer list
    // cannot rewind when its element overshoots; the error must still be
    // the aggregate mismatch.
    let src = r#"
Doc {
  Outer: Pair...; length:3
}
Pair: uint...,1; length:2
"#;
    let codec = Codec::from_source(src).expect("compile");
    let err = codec.parse_bytes(&[1, 2, 3, 4]).expect_err("should fail");
    assert!(matches!(flatten(&err), CodecError::LengthMismatch { .. }), "got: {}", err);
}

#[test]
fn test_conditional_invokes_single_child() {
    // Only the taken ternary arm runs, so one branch reads the stream.
    let src = r#"
Doc {
  Kind: uint,1
  Body {
    eval: Kind == 1 ? A() : B()
    A: raw,1
    B: raw,2
  }
}
"#;
    let codec = Codec::from_source(src).expect("compile");

    let one = codec.parse_bytes(&[1, 0xAA]).expect("parse");
    assert_eq!(one.get("Body.A").and_then(|n| n.as_bytes()), Some(&[0xAA][..]));
    assert!(one.get("Body.B").is_none());

    let two = codec.parse_bytes(&[2, 0xBB, 0xCC]).expect("parse");
    assert_eq!(two.get("Body.B").and_then(|n| n.as_bytes()), Some(&[0xBB, 0xCC][..]));
    assert!(two.get("Body.A").is_none());
}

#[test]
fn test_untaken_conditional_arm_is_inert() {
    // The dead arm may hold expressions that would fail if evaluated.
    let codec =
        Codec::from_source("Doc { V { eval: set(D.cfg.length, 1 == 1 ? 1 : 1 / 0) } D: raw }")
            .expect("compile");
    let tree = codec.parse_bytes(&[0x42]).expect("parse");
    assert_eq!(tree.get("D").and_then(|n| n.as_bytes()), Some(&[0x42][..]));
}

/// Peels `At` wrappers down to the underlying error.
fn flatten(err: &CodecError) -> &CodecError {
    match err {
        CodecError::At { source, .. } => flatten(source),
        other => other,
    }
}
