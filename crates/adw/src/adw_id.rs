//! Generates the 8-char lowercase hex `adw_id` assigned on pending->
//! in_progress transition (spec §3). IDs are never reused: the caller
//! passes a predicate checking the task file and `agents/` directory for
//! collisions, and generation retries until it finds a fresh one.

use rand::Rng;

const ADW_ID_LEN: usize = 8;
const HEX_CHARS: &[u8] = b"0123456789abcdef";

pub fn generate() -> String {
    let mut rng = rand::thread_rng();
    (0..ADW_ID_LEN)
        .map(|_| HEX_CHARS[rng.gen_range(0..HEX_CHARS.len())] as char)
        .collect()
}

/// Generates an `adw_id` guaranteed fresh against `exists`, retrying a
/// bounded number of times before giving up (collision at this length is
/// astronomically unlikely; the bound exists only to avoid looping forever
/// on a broken `exists` predicate).
pub fn generate_unique(exists: impl Fn(&str) -> bool) -> Option<String> {
    const MAX_ATTEMPTS: usize = 100;
    for _ in 0..MAX_ATTEMPTS {
        let id = generate();
        if !exists(&id) {
            return Some(id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_eight_lowercase_hex_chars() {
        let id = generate();
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn generate_unique_avoids_collisions() {
        let taken = ["aaaaaaaa", "bbbbbbbb"];
        let id = generate_unique(|id| taken.contains(&id)).unwrap();
        assert!(!taken.contains(&id.as_str()));
    }

    #[test]
    fn generate_unique_gives_up_when_everything_collides() {
        let id = generate_unique(|_| true);
        assert!(id.is_none());
    }
}
