use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Deterministically derive a UUID from a domain tag and a counter.
fn deterministic_uuid(domain: u64, counter: u64) -> Uuid {
    let x0 = domain ^ counter;
    let lo = splitmix64(x0);
    let hi = splitmix64(x0.wrapping_add(0xD1B5_4A32_D192_ED03));
    Uuid::from_u128(((hi as u128) << 64) | (lo as u128))
}

const UUID_DOMAIN_CALL: u64 = 0x4341_4C4C_5F49_445F; // "CALL_ID_" (tag)

/// Identifies one in-flight call in logs.
///
/// Ids come from a process-local counter, so a test that makes the same calls
/// in the same order sees the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallId(Uuid);

impl CallId {
    pub fn next() -> Self {
        static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(0);
        let counter = NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed) + 1;
        CallId(deterministic_uuid(UUID_DOMAIN_CALL, counter))
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Call({})", self.0)
    }
}
