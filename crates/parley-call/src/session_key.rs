use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

const RANDOM_SUFFIX_LEN: usize = 12;

/// Identifies one participant's one call attempt: `userId + separator + random`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn generate(user_id: &str, separator: &str) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SUFFIX_LEN)
            .map(|byte| (byte as char).to_ascii_lowercase())
            .collect();
        Self(format!("{user_id}{separator}{suffix}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// User id portion, assuming the key was built with `separator`.
    pub fn user_id<'a>(&'a self, separator: &str) -> &'a str {
        self.0
            .rsplit_once(separator)
            .map(|(user, _)| user)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Glare avoidance: the lexicographically greater key sends the offer.
///
/// For distinct keys exactly one direction holds; a key never offers to itself.
pub fn should_offer(local: &SessionKey, remote: &SessionKey) -> bool {
    local > remote
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_carry_user_and_differ() {
        let a = SessionKey::generate("user1", "_");
        let b = SessionKey::generate("user1", "_");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("user1_"));
        assert_eq!(a.as_str().len(), "user1_".len() + RANDOM_SUFFIX_LEN);
        assert_eq!(a.user_id("_"), "user1");
    }

    #[test]
    fn user_id_splits_on_last_separator() {
        let key = SessionKey::new("user_with_underscores_abc123");
        assert_eq!(key.user_id("_"), "user_with_underscores");
        assert_eq!(SessionKey::new("plain").user_id("_"), "plain");
    }

    #[test]
    fn tie_break_is_symmetric() {
        let keys = [
            "user1_abc",
            "user2_xyz",
            "user10_a",
            "User1_abc",
            "user1_abd",
            "a",
            "ab",
        ]
        .map(SessionKey::new);
        for a in &keys {
            for b in &keys {
                let forward = should_offer(a, b);
                let backward = should_offer(b, a);
                if a == b {
                    assert!(!forward && !backward, "{a} must not offer to itself");
                } else {
                    assert!(forward ^ backward, "exactly one of {a}/{b} offers");
                }
            }
        }
    }

    #[test]
    fn scenario_keys_pick_user2_as_offerer() {
        let user1 = SessionKey::new("user1_abc");
        let user2 = SessionKey::new("user2_xyz");
        assert!(should_offer(&user2, &user1));
        assert!(!should_offer(&user1, &user2));
    }
}
