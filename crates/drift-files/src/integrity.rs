//! Non-cryptographic integrity hashing.
//!
//! Two hashes, neither with any cryptographic claim:
//! - [`xxhash32`]: a simplified xxHash32-style 32-bit hash used for
//!   per-chunk checksums on the wire.
//! - [`file_hash`]: a 64-bit rolling digest over a whole file, rendered as
//!   16 hex digits, used for end-to-end verification after reassembly.
//!
//! Both are pinned by the wire/record formats: changing either breaks
//! interoperability with existing peers and stored digests.

use std::fs::File;
use std::io::Read;
use std::path::Path;

const PRIME1: u32 = 2_654_435_761;
const PRIME2: u32 = 2_246_822_519;
const PRIME3: u32 = 3_266_489_917;
const PRIME5: u32 = 374_761_393;

/// Hash a byte slice with the protocol's 32-bit chunk checksum function.
#[must_use]
pub fn xxhash32(data: &[u8], seed: u32) -> u32 {
    let mut h32 = seed
        .wrapping_add(PRIME5)
        .wrapping_add(data.len() as u32);

    for &byte in data {
        h32 = h32.wrapping_add(u32::from(byte).wrapping_mul(PRIME5));
        h32 = h32.rotate_left(11).wrapping_mul(PRIME1);
    }

    h32 ^= h32 >> 15;
    h32 = h32.wrapping_mul(PRIME2);
    h32 ^= h32 >> 13;
    h32 = h32.wrapping_mul(PRIME3);
    h32 ^= h32 >> 16;

    h32
}

/// Compute the 64-bit rolling digest of a file, as a 16-digit lower-hex
/// string.
///
/// Returns an empty string if the file cannot be opened or read; callers
/// treat that as "no digest available".
#[must_use]
pub fn file_hash<P: AsRef<Path>>(path: P) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };

    let mut hash = 0u64;
    let mut buffer = [0u8; 8192];

    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                for &byte in &buffer[..n] {
                    hash = hash.wrapping_mul(31).wrapping_add(u64::from(byte));
                }
            }
            Err(_) => return String::new(),
        }
    }

    format!("{hash:016x}")
}

/// Verify a chunk payload against its expected checksum.
#[must_use]
pub fn verify_chunk(data: &[u8], expected: u32) -> bool {
    xxhash32(data, 0) == expected
}
