//! Bit stream tests: MSB-first reads, partial-byte carry, checkpointing,
//! and the writer's alignment rules.

use wiregram::{BitReader, BitWriter, StreamError};

#[test]
fn test_read_bits_msb_first() {
    let mut r = BitReader::new(&[0b1010_0000u8][..]);
    let one = r.read_bits(1).expect("bit");
    assert_eq!(one, [1]);
    let zero = r.read_bits(1).expect("bit");
    assert_eq!(zero, [0]);
    assert_eq!(r.bit_pos(), 2);
}

#[test]
fn test_read_bits_partial_byte_layout() {
    // 12 bits of 0xAB 0xCD: the leading partial byte keeps its bits low.
    let mut r = BitReader::new(&[0xABu8, 0xCD][..]);
    let buf = r.read_bits(12).expect("read");
    assert_eq!(buf, [0x0A, 0xBC]);
    let rest = r.read_bits(4).expect("read");
    assert_eq!(rest, [0x0D]);
}

#[test]
fn test_read_bits_aligned() {
    let mut r = BitReader::new(&[1u8, 2, 3, 4][..]);
    assert_eq!(r.read_bits(16).expect("read"), [1, 2]);
    assert_eq!(r.byte_pos(), 2);
    assert_eq!(r.read_byte().expect("byte"), 3);
}

#[test]
fn test_read_bits_carries_across_calls() {
    // 3 + 5 bits out of one byte.
    let mut r = BitReader::new(&[0b101_11010u8][..]);
    assert_eq!(r.read_bits(3).expect("read"), [0b101]);
    assert_eq!(r.read_bits(5).expect("read"), [0b11010]);
    assert_eq!(r.bit_pos(), 8);
}

#[test]
fn test_read_past_end() {
    let mut r = BitReader::new(&[0xFFu8][..]);
    r.read_bits(8).expect("read");
    assert!(matches!(r.read_bits(1), Err(StreamError::UnexpectedEof { .. })));
}

#[test]
fn test_backup_and_recovery() {
    let mut r = BitReader::new(&[1u8, 2, 3][..]);
    assert_eq!(r.read_byte().expect("byte"), 1);
    r.backup();
    assert_eq!(r.read_byte().expect("byte"), 2);
    assert_eq!(r.read_byte().expect("byte"), 3);
    r.recovery().expect("recovery");
    assert_eq!(r.bit_pos(), 8);
    // Replays the recorded bytes in order.
    assert_eq!(r.read_byte().expect("byte"), 2);
    assert_eq!(r.read_byte().expect("byte"), 3);
}

#[test]
fn test_backup_mid_byte() {
    let mut r = BitReader::new(&[0b1100_1010u8, 0xFF][..]);
    assert_eq!(r.read_bits(3).expect("read"), [0b110]);
    r.backup();
    assert_eq!(r.read_bits(5).expect("read"), [0b01010]);
    r.recovery().expect("recovery");
    assert_eq!(r.bit_pos(), 3);
    assert_eq!(r.read_bits(5).expect("read"), [0b01010]);
}

#[test]
fn test_recovery_without_backup() {
    let mut r = BitReader::new(std::io::empty());
    assert!(matches!(r.recovery(), Err(StreamError::NoCheckpoint)));
}

#[test]
fn test_commit_drops_checkpoint() {
    let mut r = BitReader::new(&[1u8, 2][..]);
    r.backup();
    r.read_byte().expect("byte");
    r.commit();
    assert!(matches!(r.recovery(), Err(StreamError::NoCheckpoint)));
}

#[test]
fn test_second_backup_replaces_first() {
    let mut r = BitReader::new(&[1u8, 2, 3][..]);
    r.backup();
    r.read_byte().expect("byte");
    r.backup();
    r.read_byte().expect("byte");
    r.recovery().expect("recovery");
    assert_eq!(r.read_byte().expect("byte"), 2);
}

#[test]
fn test_writer_round_trips_reader_layout() {
    let mut w = BitWriter::new();
    w.write_bits(&[0x0A, 0xBC], 12).expect("write");
    w.write_bits(&[0x0D], 4).expect("write");
    w.write_bits(&[0xEF], 8).expect("write");
    assert_eq!(w.into_bytes().expect("finish"), [0xAB, 0xCD, 0xEF]);
}

#[test]
fn test_writer_rejects_misaligned_continuation() {
    let mut w = BitWriter::new();
    w.write_bits(&[0x05], 3).expect("write");
    // 3 + 4 = 7 bits would leave the stream off a byte boundary.
    assert!(matches!(
        w.write_bits(&[0x0F], 4),
        Err(StreamError::MisalignedWrite { .. })
    ));
    // 3 + 5 completes the byte.
    w.write_bits(&[0x1F], 5).expect("write");
    assert_eq!(w.into_bytes().expect("finish"), [0b1011_1111]);
}

#[test]
fn test_writer_rejects_pending_partial_at_finish() {
    let mut w = BitWriter::new();
    w.write_bits(&[0x01], 2).expect("write");
    assert!(matches!(w.into_bytes(), Err(StreamError::MisalignedWrite { .. })));
}

#[test]
fn test_writer_whole_bytes() {
    let mut w = BitWriter::new();
    w.write_bytes(&[0xDE, 0xAD]).expect("write");
    assert_eq!(w.bit_pos(), 16);
    assert_eq!(w.into_bytes().expect("finish"), [0xDE, 0xAD]);
}
