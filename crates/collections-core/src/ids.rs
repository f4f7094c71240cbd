//! Random identifier generation for event-log entries.
//!
//! spec requires event ids be drawn from "random >= 64 bits" so that
//! `collections-eventlog`'s collision rejection loop has a real collision
//! bound to rely on. This generates 8 random bytes (64 bits) directly from
//! `ring`'s CSPRNG, hex-encoded to 16 lowercase hex characters — wider than
//! the original's `str(uuid.uuid4())[:8]` truncation, which the distilled
//! spec's numeric invariant supersedes.

use ring::rand::{SecureRandom, SystemRandom};

/// Generates a 16-character lowercase hex event id (64 random bits).
pub fn event_id(rng: &SystemRandom) -> String {
    let mut bytes = [0u8; 8];
    rng.fill(&mut bytes).expect("system RNG unavailable");
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        write!(s, "{:02x}", b).expect("writing to a String never fails");
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn event_id_is_sixteen_hex_chars() {
        let rng = SystemRandom::new();
        let id = event_id(&rng);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn event_id_varies() {
        let rng = SystemRandom::new();
        let a = event_id(&rng);
        let b = event_id(&rng);
        assert_ne!(a, b);
    }
}
