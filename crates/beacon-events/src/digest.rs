//! Subscription-set digest for the registered-flavor sync challenge.

use beacon_types::EventKind;
use sha2::{Digest, Sha256};

/// Digest over the sorted (kind, name) pairs of a subscription set.
///
/// Order-independent: equal sets produce equal digests regardless of
/// insertion order. Names are length-prefixed before hashing so adjacent
/// entries cannot collide by concatenation.
pub fn subscription_digest(pairs: &[(EventKind, String)]) -> [u8; 32] {
    let mut sorted: Vec<&(EventKind, String)> = pairs.iter().collect();
    sorted.sort();

    let mut hasher = Sha256::new();
    for (kind, name) in sorted {
        hasher.update([kind.as_u8()]);
        hasher.update((name.len() as u16).to_be_bytes());
        hasher.update(name.as_bytes());
    }
    hasher.finalize().into()
}
