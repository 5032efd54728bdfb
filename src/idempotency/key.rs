use uuid::Uuid;

/// Square rejects idempotency keys longer than this
const MAX_CHARS: usize = 45;

/// Token attached to a customer creation, so that a retried request does not
/// create a second customer. Keys are never reused across submissions.
///
/// The only way to get one is `generate`, whose output (a hyphenated UUID v4,
/// 36 characters) always fits within Square's limit.
#[derive(Debug, Clone)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn generate() -> Self {
        let key = Uuid::new_v4().to_string();
        debug_assert!(key.len() <= MAX_CHARS);
        Self(key)
    }
}

impl AsRef<str> for IdempotencyKey {
    fn as_ref(&self) -> &str { &self.0 }
}
