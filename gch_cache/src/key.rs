use gch_time::Time;
use gch_types::{Target, TimeFrame};

/// Key of one cached finder result.
///
/// Derived as `<date(from)>;<date(until)>;<pattern>;ttl=<label>`: the
/// window bounds contribute their calendar dates only, so every request
/// for the same day range shares an entry, and the TTL label is part of
/// the key so the short and default TTL regimes never share entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(frame: &TimeFrame, target: &Target, ttl_label: &str) -> Self {
        Self(format!(
            "{};{};{};ttl={}",
            Time::from_timestamp(frame.from()).format_date(),
            Time::from_timestamp(frame.until()).format_date(),
            target.pattern(),
            ttl_label,
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_key_format() {
        // 2024-01-01T00:00:00Z .. 2024-01-02T00:00:00Z
        let frame = TimeFrame::new(1704067200, 1704153600).unwrap();
        let key = CacheKey::new(&frame, &Target::new("a.b.*"), "60");
        assert_eq!(key.as_str(), "2024-01-01;2024-01-02;a.b.*;ttl=60");
    }

    #[test]
    fn test_ttl_label_separates_regimes() {
        let frame = TimeFrame::new(1704067200, 1704153600).unwrap();
        let target = Target::new("a.b.*");
        assert_ne!(
            CacheKey::new(&frame, &target, "60"),
            CacheKey::new(&frame, &target, "600")
        );
    }

    proptest! {
        /// Keys are equal iff date-truncated bounds, pattern and TTL label
        /// all agree.
        #[test]
        fn prop_key_determinism(
            from_a in 0i64..4_000_000_000,
            from_b in 0i64..4_000_000_000,
            width_a in 1i64..1_000_000,
            width_b in 1i64..1_000_000,
            pattern_a in prop::sample::select(vec!["a.*", "b.*", "a.b.*"]),
            pattern_b in prop::sample::select(vec!["a.*", "b.*", "a.b.*"]),
            ttl_a in prop::sample::select(vec!["10", "60", "600"]),
            ttl_b in prop::sample::select(vec!["10", "60", "600"]),
        ) {
            let frame_a = TimeFrame::new(from_a, from_a + width_a).unwrap();
            let frame_b = TimeFrame::new(from_b, from_b + width_b).unwrap();
            let target_a = Target::new(pattern_a.clone());
            let target_b = Target::new(pattern_b.clone());

            let key_a = CacheKey::new(&frame_a, &target_a, ttl_a);
            let key_b = CacheKey::new(&frame_b, &target_b, ttl_b);

            let same_dates =
                Time::from_timestamp(frame_a.from()).format_date()
                    == Time::from_timestamp(frame_b.from()).format_date()
                    && Time::from_timestamp(frame_a.until()).format_date()
                        == Time::from_timestamp(frame_b.until()).format_date();
            let same_args = same_dates && pattern_a == pattern_b && ttl_a == ttl_b;

            prop_assert_eq!(key_a == key_b, same_args);
        }
    }
}
