//! pillbox: a password-sealed single-value store with tamper detection
//! and version revert.
//!
//! One value at a time is sealed into a self-describing encrypted "pill"
//! ([`pill`]), stored next to its plaintext in an append-only version
//! history ([`store`] over [`persist`]). Because the pill travels with
//! its own salt and IV, a later [`ops::verify`] needs only the
//! passphrase: decrypt the pill, compare against the stored plaintext,
//! and if the two disagree the value was altered behind the owner's back.
//! [`ops::revert`] then steps the store back to the version before the
//! damage and discards the reverted-away future.

pub mod armor;
pub mod error;
pub mod ops;
pub mod passphrase;
pub mod persist;
pub mod pill;
pub mod store;
