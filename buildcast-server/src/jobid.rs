//! Job identifiers.
//!
//! ULIDs: 26-character Crockford base32, 48 bits of millisecond timestamp
//! followed by 80 random bits, so ids sort by creation time.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

pub const LEN: usize = 26;

/// Generate a new job id.
pub fn generate() -> String {
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let random: u128 = rand::thread_rng().r#gen::<u128>() >> 48;
    encode(now_ms, random)
}

fn encode(timestamp_ms: u64, random: u128) -> String {
    let value = ((timestamp_ms as u128) << 80) | (random & ((1u128 << 80) - 1));
    (0..LEN)
        .rev()
        .map(|i| CROCKFORD[((value >> (i * 5)) & 0x1F) as usize] as char)
        .collect()
}

/// Whether `id` has the shape of a job id.
pub fn is_valid(id: &str) -> bool {
    id.len() == LEN && id.bytes().all(|b| CROCKFORD.contains(&b))
}
