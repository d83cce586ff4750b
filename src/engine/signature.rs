use sha2::{Digest, Sha256};

/// Stable dedup and cache key for an error: SHA-256 over `"{category}:{message}"`, hex encoded.
pub fn compute(category: &str, message: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update(b":");
    hasher.update(message.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            compute("memory", "OOMKilled"),
            "67447c12a0be101a82cf85b1957b7d1df37c99e3e102c66c24f2563700980b0c"
        );
        // empty category and message still hash the separator
        assert_eq!(
            compute("", ""),
            "e7ac0786668e0ff0f02b62bd04f45ff636fd82db63b1104601c975dc005f3a67"
        );
        assert_ne!(compute("memory", "OOMKilled"), compute("network", "OOMKilled"));
    }

    proptest! {
        #[test]
        fn prop_identical_inputs_identical_signature(cat in "[a-z]{1,12}", msg in ".{0,200}") {
            prop_assert_eq!(compute(&cat, &msg), compute(&cat, &msg));
        }

        #[test]
        fn prop_different_message_different_signature(
            cat in "[a-z]{1,12}",
            a in "[ -~]{0,80}",
            b in "[ -~]{0,80}",
        ) {
            prop_assume!(a != b);
            prop_assert_ne!(compute(&cat, &a), compute(&cat, &b));
        }

        #[test]
        fn prop_different_category_different_signature(
            a in "[a-z]{1,12}",
            b in "[a-z]{1,12}",
            msg in "[ -~]{0,80}",
        ) {
            prop_assume!(a != b);
            prop_assert_ne!(compute(&a, &msg), compute(&b, &msg));
        }
    }
}
