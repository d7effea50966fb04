//! Prefixed random identifiers.
//!
//! Ids look like `chat_7hQk2mZpR4sVbN9x`: a kind prefix, an underscore and
//! sixteen symbols drawn from a 58-symbol alphabet without look-alike
//! characters (`0`, `O`, `I`, `l` are absent), about 93 bits per id.
//! Randomness comes from the 122 random bits of v4 UUIDs.

use uuid::Uuid;

const ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

pub const DEFAULT_ID_LENGTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPrefix {
    Chat,
    Stream,
    Message,
}

impl IdPrefix {
    pub fn as_str(&self) -> &'static str {
        match self {
            IdPrefix::Chat => "chat",
            IdPrefix::Stream => "stream",
            IdPrefix::Message => "msgs",
        }
    }
}

pub fn generate_id(prefix: IdPrefix) -> String {
    generate_id_with_length(prefix, DEFAULT_ID_LENGTH)
}

pub fn generate_id_with_length(prefix: IdPrefix, length: usize) -> String {
    let mut id = String::with_capacity(prefix.as_str().len() + 1 + length);
    id.push_str(prefix.as_str());
    id.push('_');

    let base = ALPHABET.len() as u128;
    let mut pool = random_bits();
    let mut drawn = 0usize;
    for _ in 0..length {
        // 58^20 < 2^122 < 58^21
        if drawn == SYMBOLS_PER_POOL {
            pool = random_bits();
            drawn = 0;
        }
        id.push(ALPHABET[(pool % base) as usize] as char);
        pool /= base;
        drawn += 1;
    }
    id
}

const SYMBOLS_PER_POOL: usize = 20;

/// The 122 random bits of a v4 UUID, packed below bit 122. The version
/// nibble (bits 76..80) and the variant bits (62..64) are dropped.
fn random_bits() -> u128 {
    let raw = Uuid::new_v4().as_u128();
    let high = raw >> 80;
    let mid = (raw >> 64) & 0xFFF;
    let low = raw & ((1u128 << 62) - 1);
    (high << 74) | (mid << 62) | low
}
