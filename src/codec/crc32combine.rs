//! Combine CRC-32 checksums of adjacent byte ranges.
//!
//! Given `crc(A)`, `crc(B)` and `len(B)`, [`combine`] returns `crc(A ‖ B)`
//! without touching the bytes. Appending `len(B)` zero bytes to a CRC register
//! is a linear operator over GF(2); the operator for `n` zero bytes is built by
//! repeatedly squaring the single-zero-bit operator, so the cost is
//! `O(log len(B))` 32x32 matrix products.
//!
//! Works for any reflected polynomial. [`IEEE`] and [`CASTAGNOLI`] are the
//! two in common use; pack objects are checksummed with Castagnoli (CRC-32C).

use crc::{Crc, CRC_32_ISCSI};

/// Reflected IEEE 802.3 polynomial (zlib, gzip, PNG).
pub const IEEE: u32 = 0xEDB8_8320;

/// Reflected Castagnoli polynomial (CRC-32C).
pub const CASTAGNOLI: u32 = 0x82F6_3B78;

const GF2_DIM: usize = 32;

static CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

type Gf2Matrix = [u32; GF2_DIM];

fn gf2_matrix_times(mat: &Gf2Matrix, mut vec: u32) -> u32 {
    let mut sum = 0;
    let mut row = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[row];
        }
        vec >>= 1;
        row += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut Gf2Matrix, mat: &Gf2Matrix) {
    for (n, slot) in square.iter_mut().enumerate() {
        *slot = gf2_matrix_times(mat, mat[n]);
    }
}

/// Checksum of `A ‖ B` from the checksums of `A` and `B`.
pub fn combine(crc_a: u32, crc_b: u32, len_b: u64, poly: u32) -> u32 {
    if len_b == 0 {
        return crc_a;
    }

    let mut even: Gf2Matrix = [0; GF2_DIM];
    let mut odd: Gf2Matrix = [0; GF2_DIM];

    // operator for one zero bit
    odd[0] = poly;
    let mut row = 1u32;
    for slot in odd.iter_mut().skip(1) {
        *slot = row;
        row <<= 1;
    }

    // two zero bits, then four
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    let mut crc = crc_a;
    let mut len = len_b;
    loop {
        // first pass yields the one-zero-byte operator
        gf2_matrix_square(&mut even, &odd);
        if len & 1 != 0 {
            crc = gf2_matrix_times(&even, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len & 1 != 0 {
            crc = gf2_matrix_times(&odd, crc);
        }
        len >>= 1;
        if len == 0 {
            break;
        }
    }

    crc ^ crc_b
}

/// CRC-32C of `bytes`.
pub fn crc32c(bytes: &[u8]) -> u32 {
    CRC32C.checksum(bytes)
}

/// Running CRC-32C over a sequence of chunks.
///
/// Chunks may be fed either as raw bytes or as `(crc, len)` pairs computed
/// elsewhere; the latter costs a [`combine`] instead of a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc32cAccumulator {
    crc: u32,
    len: u64,
}

impl Crc32cAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold raw bytes into the checksum.
    pub fn update(&mut self, bytes: &[u8]) {
        self.update_checksummed(crc32c(bytes), bytes.len() as u64);
    }

    /// Fold a chunk whose CRC-32C is already known.
    pub fn update_checksummed(&mut self, crc: u32, len: u64) {
        self.crc = combine(self.crc, crc, len, CASTAGNOLI);
        self.len += len;
    }

    /// Checksum of everything folded so far.
    pub fn value(&self) -> u32 {
        self.crc
    }

    /// Total number of bytes folded so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
