//! Request and back-end query identifiers.

use rand::Rng;

/// Generate a request identifier: 16 lowercase hex characters.
///
/// Attached to every incoming request and echoed back via the
/// `X-Gch-Request-Id` response header.
pub fn request_id() -> String {
    let id: u64 = rand::thread_rng().gen();
    format!("{id:016x}")
}

/// Generate the per-query suffix sent to the analytic back-end.
///
/// The back-end query id is `<request-id>::<suffix>` where the suffix is
/// 8 random bytes rendered as hex, little-endian first. One request may
/// issue several back-end queries, each with its own suffix.
pub fn backend_query_id(request_id: &str) -> String {
    let bytes = rand::thread_rng().gen::<u64>().to_le_bytes();
    let mut suffix = String::with_capacity(16);
    for b in bytes {
        suffix.push_str(&format!("{b:02x}"));
    }
    format!("{request_id}::{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_shape() {
        let id = request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_request_ids_unique() {
        let a = request_id();
        let b = request_id();
        assert_ne!(a, b);
    }

    #[test]
    fn test_backend_query_id_shape() {
        let id = backend_query_id("deadbeefcafe0123");
        let (prefix, suffix) = id.split_once("::").unwrap();
        assert_eq!(prefix, "deadbeefcafe0123");
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
