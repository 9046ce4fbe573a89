//! Alphabet descriptors: symbol ↔ code tables plus bits-per-symbol.
//!
//! Unknown bytes map to code 0 on the silent path ([`Alphabet::code`]);
//! callers that want to reject them use [`Alphabet::try_code`] instead.

/// Sentinel stored in the lookup table for bytes outside the alphabet.
const UNKNOWN: u8 = 255;

pub struct Alphabet {
    pub name: &'static str,
    pub bits_per_symbol: u32,
    /// Number of valid symbol codes (≤ 2^bits_per_symbol).
    pub size: u16,
    from_ascii: [u8; 256],
    to_ascii: &'static [u8],
    complement: Option<&'static [u8]>,
}

const fn lookup_table(pairs: &[(u8, u8)]) -> [u8; 256] {
    let mut t = [UNKNOWN; 256];
    let mut i = 0;
    while i < pairs.len() {
        t[pairs[i].0 as usize] = pairs[i].1;
        i += 1;
    }
    t
}

/// 2-bit nucleotide alphabet (A, C, G, T).
pub static DNA: Alphabet = Alphabet {
    name: "DNA",
    bits_per_symbol: 2,
    size: 4,
    from_ascii: lookup_table(&[
        (b'A', 0),
        (b'a', 0),
        (b'C', 1),
        (b'c', 1),
        (b'G', 2),
        (b'g', 2),
        (b'T', 3),
        (b't', 3),
    ]),
    to_ascii: b"ACGT",
    complement: Some(&[3, 2, 1, 0]),
};

/// 3-bit nucleotide alphabet with the ambiguity code N.
pub static DNA5: Alphabet = Alphabet {
    name: "DNA5",
    bits_per_symbol: 3,
    size: 5,
    from_ascii: lookup_table(&[
        (b'A', 0),
        (b'a', 0),
        (b'C', 1),
        (b'c', 1),
        (b'G', 2),
        (b'g', 2),
        (b'T', 3),
        (b't', 3),
        (b'N', 4),
        (b'n', 4),
    ]),
    to_ascii: b"ACGTN",
    complement: Some(&[3, 2, 1, 0, 4]),
};

impl Alphabet {
    /// Map a byte to its symbol code. Bytes outside the alphabet map to
    /// code 0 silently; this is the historically observed behavior and
    /// the codec relies on it staying silent.
    #[inline]
    pub fn code(&self, b: u8) -> u8 {
        let c = self.from_ascii[b as usize];
        if c == UNKNOWN {
            0
        } else {
            c
        }
    }

    /// Checked variant of [`code`](Self::code) for callers that want to
    /// treat unknown bytes as errors rather than code 0.
    #[inline]
    pub fn try_code(&self, b: u8) -> Option<u8> {
        let c = self.from_ascii[b as usize];
        if c == UNKNOWN {
            None
        } else {
            Some(c)
        }
    }

    #[inline]
    pub fn to_ascii(&self, code: u8) -> u8 {
        self.to_ascii[code as usize]
    }

    /// Complement of a symbol code, if the alphabet defines one.
    #[inline]
    pub fn complement(&self, code: u8) -> Option<u8> {
        self.complement.map(|t| t[code as usize])
    }

    pub fn has_complement(&self) -> bool {
        self.complement.is_some()
    }
}
