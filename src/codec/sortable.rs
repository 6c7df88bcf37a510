//! Order-preserving base64 encoding for sequence numbers.
//!
//! Every `u64` encodes to exactly [`ENCODED_LEN`] characters drawn from
//! [`ALPHABET`], most significant digit first. Because the alphabet is in
//! ascending ASCII order and the width is fixed, comparing two encoded strings
//! lexicographically gives the same answer as comparing the numbers.
//!
//! The leading character carries only the top 4 bits of the value, so it is
//! always one of the first 16 alphabet characters.

use crate::error::CodecError;

/// The 64 digit characters, in ascending ASCII order.
pub const ALPHABET: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

/// Width of every encoded value.
pub const ENCODED_LEN: usize = 11;

/// Bits carried by the leading character (64 - 10 * 6).
const LEADING_BITS: u32 = 4;

const INVALID: u8 = 0xFF;

const _: () = assert!(
    alphabet_is_ordered(ALPHABET),
    "sortable alphabet must be strictly ascending"
);

const fn alphabet_is_ordered(alphabet: &[u8; 64]) -> bool {
    let mut i = 1;
    while i < alphabet.len() {
        if alphabet[i - 1] >= alphabet[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn build_decode_table(alphabet: &[u8; 64]) -> [u8; 256] {
    let mut table = [INVALID; 256];
    let mut i = 0;
    while i < alphabet.len() {
        table[alphabet[i] as usize] = i as u8;
        i += 1;
    }
    table
}

static DECODE: [u8; 256] = build_decode_table(ALPHABET);

/// Largest digit value allowed in the leading position.
const MAX_LEADING: u8 = (1 << LEADING_BITS) - 1;

/// Encode `n` as a fixed-width sortable string.
pub fn encode(n: u64) -> String {
    let mut out = [0u8; ENCODED_LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        let shift = 60 - 6 * i as u32;
        *slot = ALPHABET[((n >> shift) & 0x3F) as usize];
    }
    // Every byte comes from ALPHABET, which is ASCII.
    out.iter().map(|&b| b as char).collect()
}

/// Decode a string produced by [`encode`].
pub fn decode(s: &str) -> Result<u64, CodecError> {
    let bytes = check_shape(s)?;
    let mut n: u64 = 0;
    for &b in bytes {
        n = (n << 6) | DECODE[b as usize] as u64;
    }
    Ok(n)
}

/// Return the encoding of `decode(s) + 1`, computed on the string directly.
pub fn increment(s: &str) -> Result<String, CodecError> {
    let mut bytes = check_shape(s)?.to_vec();
    for i in (0..ENCODED_LEN).rev() {
        let digit = DECODE[bytes[i] as usize];
        let max = if i == 0 { MAX_LEADING } else { 63 };
        if digit < max {
            bytes[i] = ALPHABET[digit as usize + 1];
            return Ok(into_string(bytes));
        }
        bytes[i] = ALPHABET[0];
    }
    Err(CodecError::Overflow)
}

/// Return the encoding of `decode(s) - 1`, computed on the string directly.
pub fn decrement(s: &str) -> Result<String, CodecError> {
    let mut bytes = check_shape(s)?.to_vec();
    for i in (0..ENCODED_LEN).rev() {
        let digit = DECODE[bytes[i] as usize];
        if digit > 0 {
            bytes[i] = ALPHABET[digit as usize - 1];
            return Ok(into_string(bytes));
        }
        bytes[i] = if i == 0 { ALPHABET[0] } else { ALPHABET[63] };
    }
    Err(CodecError::Underflow)
}

fn check_shape(s: &str) -> Result<&[u8], CodecError> {
    let bytes = s.as_bytes();
    if bytes.len() != ENCODED_LEN {
        return Err(CodecError::BadEncoding(format!(
            "{s:?}: expected {ENCODED_LEN} characters, got {}",
            bytes.len()
        )));
    }
    if let Some(pos) = bytes.iter().position(|&b| DECODE[b as usize] == INVALID) {
        return Err(CodecError::BadEncoding(format!(
            "{s:?}: illegal character at offset {pos}"
        )));
    }
    if DECODE[bytes[0] as usize] > MAX_LEADING {
        return Err(CodecError::BadEncoding(format!(
            "{s:?}: leading character out of range"
        )));
    }
    Ok(bytes)
}

fn into_string(bytes: Vec<u8>) -> String {
    bytes.into_iter().map(char::from).collect()
}
