//! Prompt-injection defense and field-level encryption.

mod field_crypto;
mod injection;

pub use field_crypto::{FieldEncryptor, StoredField, is_encrypted_column};
pub use injection::{DefenseMetadata, InjectionDefense, InjectionVerdict, TrustLevel};
