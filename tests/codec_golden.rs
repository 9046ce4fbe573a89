//! Bit-exact codec checks against pinned 64-bit window tables.
//!
//! The tables are successive windows of the 128-bit constant
//! `0xabbacafebabe1234deadbeef01c0ffee` at 2, 3, and 5 bits per symbol.
//! Every storage width (u8..u64) and every packed input width must
//! reproduce them exactly, for several window lengths each.

use kgrid::kmer::{Kmer, PackedCursor};
use kgrid::word::Word;

/// Successive 64-bit windows at 2 bits per symbol.
const WINDOWS_2BIT: [u64; 33] = [
    0xabbacafebabe1234,
    0xaeeb2bfaeaf848d3,
    0xbbacafebabe1234d,
    0xeeb2bfaeaf848d37,
    0xbacafebabe1234de,
    0xeb2bfaeaf848d37a,
    0xacafebabe1234dea,
    0xb2bfaeaf848d37ab,
    0xcafebabe1234dead,
    0x2bfaeaf848d37ab6,
    0xafebabe1234deadb,
    0xbfaeaf848d37ab6f,
    0xfebabe1234deadbe,
    0xfaeaf848d37ab6fb,
    0xebabe1234deadbee,
    0xaeaf848d37ab6fbb,
    0xbabe1234deadbeef,
    0xeaf848d37ab6fbbc,
    0xabe1234deadbeef0,
    0xaf848d37ab6fbbc0,
    0xbe1234deadbeef01,
    0xf848d37ab6fbbc07,
    0xe1234deadbeef01c,
    0x848d37ab6fbbc070,
    0x1234deadbeef01c0,
    0x48d37ab6fbbc0703,
    0x234deadbeef01c0f,
    0x8d37ab6fbbc0703f,
    0x34deadbeef01c0ff,
    0xd37ab6fbbc0703ff,
    0x4deadbeef01c0ffe,
    0x37ab6fbbc0703ffb,
    0xdeadbeef01c0ffee,
];

/// Successive 63-bit windows at 3 bits per symbol (21 symbols each).
const WINDOWS_3BIT: [u64; 22] = [
    0x55dd657f5d5f091a,
    0x2eeb2bfaeaf848d3,
    0x77595fd757c2469b,
    0x3acafebabe1234de,
    0x5657f5d5f091a6f5,
    0x32bfaeaf848d37ab,
    0x15fd757c2469bd5b,
    0x2febabe1234deadb,
    0x7f5d5f091a6f56df,
    0x7aeaf848d37ab6fb,
    0x5757c2469bd5b7dd,
    0x3abe1234deadbeef,
    0x55f091a6f56df778,
    0x2f848d37ab6fbbc0,
    0x7c2469bd5b7dde03,
    0x61234deadbeef01c,
    0x091a6f56df7780e0,
    0x48d37ab6fbbc0703,
    0x469bd5b7dde0381f,
    0x34deadbeef01c0ff,
    0x26f56df7780e07ff,
    0x37ab6fbbc0703ffb,
];

/// Successive 60-bit windows at 5 bits per symbol (12 symbols each).
const WINDOWS_5BIT: [u64; 14] = [
    0xabbacafebabe123,
    0x77595fd757c2469,
    0xeb2bfaeaf848d37,
    0x657f5d5f091a6f5,
    0xafebabe1234dead,
    0xfd757c2469bd5b7,
    0xaeaf848d37ab6fb,
    0xd5f091a6f56df77,
    0xbe1234deadbeef0,
    0xc2469bd5b7dde03,
    0x48d37ab6fbbc070,
    0x1a6f56df7780e07,
    0x4deadbeef01c0ff,
    0xbd5b7dde0381ffd,
];

// Packed input streams carrying the same symbol sequences, low symbol
// first within each word, padding bits at the top.
const PACKED_2BIT_U8: [u8; 16] = [
    0xea, 0xae, 0xa3, 0xbf, 0xae, 0xbe, 0x84, 0x1c, 0xb7, 0x7a, 0xbe, 0xfb, 0x40, 0x03, 0xff,
    0xbb,
];

const PACKED_3BIT_U8: [u8; 21] = [
    0x15, 0x1f, 0x1d, 0x11, 0x3f, 0x1d, 0x15, 0x37, 0x20, 0x1c, 0x1a, 0x33, 0x1d, 0x1b, 0x1f,
    0x3d, 0x0, 0x23, 0x18, 0x3f, 0x1f,
];
const PACKED_3BIT_U16: [u16; 8] = [
    0x57d5, 0x7e8b, 0x755d, 0x3906, 0x5cda, 0x3edb, 0x303d, 0x7ec4,
];
const PACKED_3BIT_U32: [u32; 4] = [0x3f45d7d5, 0x1c83755d, 0x1f6ddcda, 0x3f62303d];
const PACKED_3BIT_U64: [u64; 2] = [0x2720dd577f45d7d5, 0x3ffb1181ebedbb9b];

const PACKED_5BIT_U8: [u8; 25] = [
    0x15, 0xe, 0x1d, 0xc, 0x15, 0x1f, 0x15, 0x1a, 0x17, 0x18, 0x9, 0x3, 0x9, 0x17, 0x15, 0xd,
    0x17, 0x1b, 0x17, 0x10, 0x3, 0x10, 0x7, 0x1f, 0x1d,
];
const PACKED_5BIT_U16: [u16; 8] = [
    0x75d5, 0x7eac, 0x5f55, 0xd38, 0x56e9, 0x6eed, 0xe17, 0x7cf0,
];
const PACKED_5BIT_U32: [u32; 4] = [0x3f5675d5, 0x69c5f55, 0x3776d6e9, 0x3e780e17];
const PACKED_5BIT_U64: [u64; 2] = [0x1a717d57f5675d5, 0xf9e0385f776d6e9];

/// Window `i` of the table for a shorter `k` is the table value shifted
/// down to its top `k` symbols.
fn expected_value(table_value: u64, k: usize, sym_bits: u32) -> u64 {
    let shift = (64 / sym_bits - k as u32) * sym_bits;
    table_value >> shift
}

fn expected_kmer<W: Word>(table_value: u64, k: usize, sym_bits: u32) -> Kmer<W> {
    Kmer::from_u64(expected_value(table_value, k, sym_bits), k, sym_bits)
}

fn check_packed<W: Word, S: Word>(data: &[S], table: &[u64], n_kmers: usize, k: usize, b: u32) {
    let mut cursor = PackedCursor::new(data, b);
    let mut kmer: Kmer<W> = Kmer::new(k, b);
    assert_eq!(kmer.fill_from_packed(&mut cursor), k);
    for (i, &t) in table.iter().take(n_kmers).enumerate() {
        if i > 0 {
            assert!(kmer.push_from_packed(&mut cursor), "stream ended at {}", i);
        }
        let expected = expected_kmer::<W>(t, k, b);
        assert_eq!(
            kmer, expected,
            "window {} for k={} b={} storage={} input={}",
            i, k, b, W::BITS, S::BITS
        );
        let total = k as u32 * b;
        assert_eq!(
            kmer.prefix64(),
            expected_value(t, k, b) << (64 - total),
            "prefix64 of window {} for k={} b={}",
            i,
            k,
            b
        );
    }
}

fn check_symbols<W: Word>(syms: &[u8], table: &[u64], n_kmers: usize, k: usize, b: u32) {
    let mut iter = syms.iter().copied();
    let mut kmer: Kmer<W> = Kmer::new(k, b);
    assert_eq!(kmer.fill_from_symbols(&mut iter), k);
    for (i, &t) in table.iter().take(n_kmers).enumerate() {
        if i > 0 {
            kmer.push_symbol(iter.next().expect("symbol stream ended early"));
        }
        assert_eq!(
            kmer,
            expected_kmer::<W>(t, k, b),
            "window {} for k={} b={} storage={}",
            i,
            k,
            b,
            W::BITS
        );
    }
}

fn check_packed_all_storage<S: Word>(data: &[S], table: &[u64], n_kmers: usize, k: usize, b: u32) {
    check_packed::<u8, S>(data, table, n_kmers, k, b);
    check_packed::<u16, S>(data, table, n_kmers, k, b);
    check_packed::<u32, S>(data, table, n_kmers, k, b);
    check_packed::<u64, S>(data, table, n_kmers, k, b);
}

fn check_symbols_all_storage(syms: &[u8], table: &[u64], n_kmers: usize, k: usize, b: u32) {
    check_symbols::<u8>(syms, table, n_kmers, k, b);
    check_symbols::<u16>(syms, table, n_kmers, k, b);
    check_symbols::<u32>(syms, table, n_kmers, k, b);
    check_symbols::<u64>(syms, table, n_kmers, k, b);
}

fn unpack<S: Word>(data: &[S], b: u32) -> Vec<u8> {
    PackedCursor::new(data, b).collect()
}

#[test]
fn windows_2bit_packed() {
    for k in [31, 28, 13, 4, 1] {
        check_packed_all_storage(&PACKED_2BIT_U8, &WINDOWS_2BIT, 33, k, 2);
    }
}

#[test]
fn windows_2bit_symbols() {
    let syms = unpack(&PACKED_2BIT_U8, 2);
    for k in [31, 28, 13, 4, 1] {
        check_symbols_all_storage(&syms, &WINDOWS_2BIT, 33, k, 2);
    }
}

#[test]
fn windows_3bit_packed_every_input_width() {
    for k in [21, 20, 13, 9, 1] {
        // 21 bytes hold 42 symbols; the narrower streams stop earlier.
        check_packed_all_storage(&PACKED_3BIT_U8, &WINDOWS_3BIT, 22, k, 3);
        check_packed_all_storage(&PACKED_3BIT_U16, &WINDOWS_3BIT, 20, k, 3);
        check_packed_all_storage(&PACKED_3BIT_U32, &WINDOWS_3BIT, 20, k, 3);
        check_packed_all_storage(&PACKED_3BIT_U64, &WINDOWS_3BIT, 22, k, 3);
    }
}

#[test]
fn windows_3bit_symbols() {
    let syms = unpack(&PACKED_3BIT_U8, 3);
    for k in [21, 20, 13, 9, 1] {
        check_symbols_all_storage(&syms, &WINDOWS_3BIT, 22, k, 3);
    }
}

#[test]
fn windows_5bit_packed_every_input_width() {
    check_packed_all_storage(&PACKED_5BIT_U8, &WINDOWS_5BIT, 14, 12, 5);
    check_packed_all_storage(&PACKED_5BIT_U16, &WINDOWS_5BIT, 13, 12, 5);
    check_packed_all_storage(&PACKED_5BIT_U32, &WINDOWS_5BIT, 13, 12, 5);
    check_packed_all_storage(&PACKED_5BIT_U64, &WINDOWS_5BIT, 13, 12, 5);
}

#[test]
fn windows_5bit_symbols() {
    let syms = unpack(&PACKED_5BIT_U8, 5);
    for k in [12, 11, 10, 9, 5, 3, 1] {
        check_symbols_all_storage(&syms, &WINDOWS_5BIT, 14, k, 5);
    }
}

#[test]
fn cross_width_streams_agree() {
    // The same symbols at different packing densities produce
    // identical windows, compared as values rather than via tables.
    let from_u8: Vec<u8> = unpack(&PACKED_3BIT_U8, 3);
    let from_u16: Vec<u8> = unpack(&PACKED_3BIT_U16, 3);
    let from_u32: Vec<u8> = unpack(&PACKED_3BIT_U32, 3);
    let from_u64: Vec<u8> = unpack(&PACKED_3BIT_U64, 3);
    assert_eq!(from_u8[..40], from_u16[..]);
    assert_eq!(from_u16[..], from_u32[..]);
    assert_eq!(from_u8[..], from_u64[..]);
}

// Comparison and reversal checks on the 112-bit constant
// 0xabba56781234deadbeef01c0ffee held as little-endian u16 words.
const REV_INPUT: [u16; 7] = [0xffee, 0x1c0, 0xbeef, 0xdead, 0x1234, 0x5678, 0xabba];

#[test]
fn comparisons_are_lexicographic_across_words() {
    // The deciding symbol sits in an upper word, not the lowest one.
    let smaller_w3: [u16; 7] = [0xffee, 0x1c0, 0xbeef, 0x1111, 0x1234, 0x5678, 0xabba];
    let greater_w2: [u16; 7] = [0xffee, 0x1c0, 0xfeef, 0xdead, 0x1234, 0x5678, 0xabba];

    let kmer: Kmer<u16> = Kmer::from_words(&REV_INPUT, 41, 2);
    let kmer_s: Kmer<u16> = Kmer::from_words(&smaller_w3, 41, 2);
    let kmer_g: Kmer<u16> = Kmer::from_words(&greater_w2, 41, 2);

    assert!(kmer > kmer_s);
    assert!(kmer == kmer);
    assert!(kmer_g > kmer);
    assert!(!(kmer_g <= kmer));
    assert!(kmer <= kmer);
    assert!(kmer >= kmer);
    assert!(!(kmer < kmer));
    assert!(!(kmer > kmer));
    assert!(kmer != kmer_g);
    assert!(kmer != kmer_s);
}

#[test]
fn reversal_is_bit_exact_for_every_symbol_width() {
    // (k, bits, expected reversed words)
    let cases: [(usize, u32, [u16; 7]); 5] = [
        (56, 2, [0xaeea, 0x2d95, 0x1c84, 0x7ab7, 0xfbbe, 0x340, 0xbbff]),
        (37, 3, [0x2faa, 0x2795, 0x34a4, 0xdabd, 0x3ebe, 0x2311, 0x6bff]),
        (28, 4, [0xabba, 0x8765, 0x4321, 0xdaed, 0xfeeb, 0xc10, 0xeeff]),
        (22, 5, [0xd375, 0xb13a, 0xba40, 0xd5f5, 0xe77c, 0x8780, 0x1dff]),
        (16, 7, [0xb755, 0xcf2, 0xa644, 0xd6bd, 0x1777, 0x18ee, 0xddfc]),
    ];
    for (k, b, expected) in cases {
        let input: Kmer<u16> = Kmer::from_words(&REV_INPUT, k, b);
        let reversed = input.reversed();
        assert_eq!(
            reversed,
            Kmer::from_words(&expected, k, b),
            "reverse mismatch for k={} b={}",
            k,
            b
        );
        assert_eq!(reversed.reversed(), input, "double reverse for k={} b={}", k, b);
    }
}

#[test]
fn prefix64_of_multi_word_window() {
    // 112-bit window: the prefix is the top 64 bits of the constant.
    let kmer: Kmer<u16> = Kmer::from_words(&REV_INPUT, 56, 2);
    assert_eq!(kmer.prefix64(), 0xabba56781234dead);
    // And per-symbol: the i-th symbol from the top of the prefix equals
    // the (k-1-i)-th symbol loaded from the window.
    for i in 0..32 {
        let from_prefix = ((kmer.prefix64() >> (64 - 2 * (i + 1))) & 0x3) as u8;
        assert_eq!(from_prefix, kmer.get(55 - i as usize));
    }
}
