//! CRC-64/XZ (a.k.a. CRC-64 ECMA), the checksum OSS reports in
//! `x-oss-hash-crc64ecma`.
//!
//! Besides plain hashing this module can combine the checksums of two
//! adjacent byte ranges into the checksum of their concatenation, which
//! lets the upload path verify a multipart object from per-part checksums
//! without re-reading the file.

use std::io::Read;
use std::path::Path;

/// Reflected form of the CRC-64/XZ polynomial.
const POLY: u64 = 0xC96C_5795_D787_0F42;

/// CRC-64/XZ of a byte slice.
pub fn crc64(data: &[u8]) -> u64 {
    let mut digest = crc64fast::Digest::new();
    digest.write(data);
    digest.sum64()
}

/// CRC-64/XZ of a whole file, read in `block_size` chunks.
///
/// Blocking; async callers wrap this in `spawn_blocking`.
pub fn crc64_file(path: &Path, block_size: usize) -> std::io::Result<u64> {
    let mut file = std::fs::File::open(path)?;
    let mut digest = crc64fast::Digest::new();
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.write(&buf[..n]);
    }
    Ok(digest.sum64())
}

fn gf2_matrix_times(mat: &[u64; 64], mut vec: u64) -> u64 {
    let mut sum = 0;
    let mut i = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[i];
        }
        vec >>= 1;
        i += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u64; 64], mat: &[u64; 64]) {
    for n in 0..64 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// Combines `crc1` (over some prefix) with `crc2` (over the following
/// `len2` bytes) into the CRC of the concatenation.
///
/// Standard zero-extension trick: build the GF(2) operator for appending
/// one zero bit, square it repeatedly, and apply the operators selected by
/// the bits of `len2` to `crc1`.
pub fn crc64_combine(mut crc1: u64, crc2: u64, mut len2: u64) -> u64 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u64; 64];
    let mut odd = [0u64; 64];

    // Operator for one zero bit.
    odd[0] = POLY;
    let mut row: u64 = 1;
    for item in odd.iter_mut().skip(1) {
        *item = row;
        row <<= 1;
    }

    // Two zero bits, then four.
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}
