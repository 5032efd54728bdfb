mod key;
pub use key::IdempotencyKey;
