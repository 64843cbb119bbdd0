//! Repository Identifiers
//!
//! Node ids are 36-character GUIDs in the usual 8-4-4-4-12 layout, but the
//! first eight hex digits come from the clock (2ms resolution). Ids created
//! close in time therefore sort adjacently, which matters because most
//! backing stores insert sequential keys far faster than random ones.
//!
//! [`is_valid`] distinguishes repository-issued ids from arbitrary strings
//! passed where an id is expected.

use chrono::Utc;
use uuid::Uuid;

/// Generate a fresh identifier.
///
/// Layout is RFC-4122-shaped: dashes at 8/13/18/23, version nibble `4` at
/// position 14 and the variant nibble at 19; every other nibble outside the
/// time prefix is random.
pub fn generate() -> String {
    let random = Uuid::new_v4().to_string();
    // >> 1 makes the prefix tick every 2 milliseconds
    let time = (Utc::now().timestamp_millis() >> 1) as u64;
    let prefix = format!("{time:x}");
    debug_assert!(prefix.len() >= 8);

    let mut id = String::with_capacity(36);
    id.push_str(&prefix[..8]);
    id.push_str(&random[8..]);
    id
}

/// Check whether `s` has the shape of a repository identifier.
///
/// Pure predicate: 36 chars, five hex groups of widths 8-4-4-4-12, version
/// nibble `4`, and neither 64-bit half all zero (rejects placeholder ids and
/// the reserved "everyone" authority, whose first character is not hex).
pub fn is_valid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 || bytes[14] != b'4' {
        return false;
    }
    let groups: Vec<&str> = s.split('-').collect();
    if groups.len() != 5 {
        return false;
    }
    const WIDTHS: [usize; 5] = [8, 4, 4, 4, 12];
    let mut parsed = [0u64; 5];
    for (i, group) in groups.iter().enumerate() {
        if group.len() != WIDTHS[i] {
            return false;
        }
        match u64::from_str_radix(group, 16) {
            Ok(v) => parsed[i] = v,
            Err(_) => return false,
        }
    }
    let most_sig = (parsed[0] << 32) | (parsed[1] << 16) | parsed[2];
    let least_sig = (parsed[3] << 48) | parsed[4];
    most_sig != 0 && least_sig != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..100 {
            let id = generate();
            assert_eq!(id.len(), 36);
            assert!(is_valid(&id), "{id}");
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
    }

    #[test]
    fn time_prefix_sorts_adjacently() {
        let a = generate();
        let b = generate();
        // first hex digits are a coarse clock, so prefixes match or increase
        assert!(b[..6] >= a[..6]);
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!(!is_valid(""));
        assert!(!is_valid("not-a-guid"));
        assert!(!is_valid("00000000-0000-4000-0000-000000000000")); // all-zero halves
        assert!(!is_valid("S0000000-0001-0001-0000-000000000000")); // everyone authority
        assert!(!is_valid("0123456789abcdef0123456789abcdef0123")); // no groups
        assert!(!is_valid("01234567-89ab-cdef-0123-456789abcde")); // 35 chars
        assert!(!is_valid("01234567-89ab-1def-0123-456789abcdef")); // wrong version nibble
    }

    #[test]
    fn accepts_well_formed_ids() {
        assert!(is_valid("01234567-89ab-4def-8123-456789abcdef"));
    }
}
