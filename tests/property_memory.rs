//! Property tests for the pure memory primitives: pattern normalization,
//! merge algebra, similarity, and wildcard matching.

use orchflow::domain::models::{jaccard_similarity, normalize_pattern, CommandPattern};
use orchflow::infrastructure::store::wildcard_match;
use proptest::prelude::*;

proptest! {
    /// Normalized patterns contain only placeholders and lowercase tokens.
    #[test]
    fn normalized_tokens_are_placeholders_or_lowercase(input in "[ -~]{0,80}") {
        let normalized = normalize_pattern(&input);
        for token in normalized.split_whitespace() {
            let is_placeholder =
                token == "[NAME]" || token == "[NUMBER]" || token == "[FILE]";
            prop_assert!(
                is_placeholder || token.chars().all(|c| !c.is_uppercase()),
                "token {token:?} from {input:?}"
            );
        }
    }

    /// No bare integer token survives normalization.
    #[test]
    fn normalization_masks_integers(n in -100_000i64..100_000, pre in "[a-z]{1,8}", post in "[a-z]{1,8}") {
        let normalized = normalize_pattern(&format!("{pre} {n} {post}"));
        prop_assert_eq!(normalized, format!("{pre} [NUMBER] {post}"));
    }

    /// Source filenames collapse to the FILE placeholder.
    #[test]
    fn normalization_masks_filenames(stem in "[a-z]{1,10}", ext in prop::sample::select(vec!["js", "ts", "py", "java", "cpp"])) {
        let normalized = normalize_pattern(&format!("edit {stem}.{ext} now"));
        prop_assert_eq!(normalized, "edit [FILE] now");
    }

    /// After k successful merges frequency is k and the success-rate
    /// running mean stays 1.0.
    #[test]
    fn pattern_merge_algebra(k in 1u32..50, times in prop::collection::vec(1.0f64..10_000.0, 1..50)) {
        let k = k.min(times.len() as u32).max(1);
        let mut pattern = CommandPattern::first("p", times[0]);
        for time in times.iter().take(k as usize).skip(1) {
            pattern.merge_success(*time);
        }
        prop_assert_eq!(pattern.frequency, k);
        prop_assert!((pattern.success_rate - 1.0).abs() < 1e-9);
        prop_assert!(pattern.avg_response_time_ms >= 0.0);
    }

    /// Jaccard similarity is symmetric, bounded, and 1 on self.
    #[test]
    fn jaccard_properties(a in "[a-z ]{0,40}", b in "[a-z ]{0,40}") {
        let ab = jaccard_similarity(&a, &b);
        let ba = jaccard_similarity(&b, &a);
        prop_assert!((ab - ba).abs() < 1e-12);
        prop_assert!((0.0..=1.0).contains(&ab));
        prop_assert!((jaccard_similarity(&a, &a) - 1.0).abs() < 1e-12);
    }

    /// A pattern with a trailing star matches every extension of its
    /// prefix, and an exact pattern matches only itself.
    #[test]
    fn wildcard_prefix_matching(prefix in "[a-z/]{1,20}", suffix in "[a-z0-9/]{0,20}") {
        let pattern = format!("{prefix}*");
        let key = format!("{prefix}{suffix}");
        prop_assert!(wildcard_match(&pattern, &key));
        prop_assert!(wildcard_match(&key, &key));
    }
}
