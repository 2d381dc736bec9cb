pub mod message;
pub mod parser;

use std::collections::hash_map::DefaultHasher;
use std::fmt::Write;
use std::hash::{Hash, Hasher};

/// Via branch value with the RFC 3261 `z9hG4bK` magic cookie.
///
/// Derived from Call-ID, CSeq number and method, so the same transaction
/// always yields the same branch.
pub fn generate_branch(call_id: &str, cseq: u32, method: &str) -> String {
    let mut hasher = DefaultHasher::new();
    call_id.hash(&mut hasher);
    cseq.hash(&mut hasher);
    method.hash(&mut hasher);
    let hash_value = hasher.finish();
    // "z9hG4bK" (7) + 16 hex chars
    let mut buf = String::with_capacity(23);
    buf.push_str("z9hG4bK");
    let _ = write!(buf, "{:016x}", hash_value);
    buf
}
