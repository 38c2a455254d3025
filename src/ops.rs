//! Caller-facing operations
//!
//! These wire the envelope codec, the passphrase seam, and the version
//! store into the four things a caller does: submit a new value, fetch
//! the current one, verify it against its pill, and revert.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ErrorCategory, ErrorKind, PillboxError, Result};
use crate::passphrase::PassphraseReader;
use crate::pill::{self, SALT_LEN};
use crate::store::{Snapshot, VersionId, VersionStore};

/// Seal `plaintext` under a passphrase and append it as the new head.
///
/// A fresh random salt is drawn per submission; together with the codec's
/// per-call IV this makes every stored pill unique, even for repeated
/// submissions of the same text.
pub fn submit(
    store: &mut VersionStore,
    passphrase_reader: &mut dyn PassphraseReader,
    plaintext: &str,
) -> Result<VersionId> {
    let passphrase = passphrase_reader.read_passphrase()?;

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    let envelope = pill::encrypt(&passphrase, &salt, plaintext.as_bytes());
    store
        .insert(Snapshot::new(plaintext, envelope))
        .map_err(|e| e.with_context("failed to record the new version"))
}

/// The current snapshot, or the empty sentinel for a store that has never
/// seen a submission.
pub fn fetch(store: &VersionStore) -> Result<Snapshot> {
    store.current()
}

/// Check the current value against its pill.
///
/// Decrypts the stored envelope and compares the result with the
/// independently stored plaintext. Structural and padding failures
/// propagate from the codec ([`ErrorKind::MalformedEnvelope`],
/// [`ErrorKind::TamperDetected`]); well-padded output that differs from
/// the stored copy is [`ErrorKind::PlaintextMismatch`]. Every one of the
/// three means the stored data can no longer be trusted, and the
/// remediation is the same: revert.
pub fn verify(store: &VersionStore, passphrase_reader: &mut dyn PassphraseReader) -> Result<()> {
    let snapshot = store.current()?;
    if snapshot.is_empty() {
        return Err(PillboxError::new(
            ErrorCategory::User,
            "the store is empty; nothing to verify",
        ));
    }

    let passphrase = passphrase_reader.read_passphrase()?;
    let recovered = pill::decrypt(&passphrase, &snapshot.envelope)?;

    if recovered != snapshot.plaintext.as_bytes() {
        return Err(PillboxError::with_kind(
            ErrorCategory::User,
            ErrorKind::PlaintextMismatch,
            "recovered plaintext does not match the stored copy; the stored data was altered",
        ));
    }

    Ok(())
}

/// Revert to the previous version.
///
/// Returns `Some(snapshot)` with the newly applied head, or `None` when
/// no earlier version existed and the store reset itself to empty. Other
/// failures propagate as errors.
pub fn revert(store: &mut VersionStore) -> Result<Option<Snapshot>> {
    match store.previous_version() {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(err) if err.kind == Some(ErrorKind::NoPreviousVersion) => Ok(None),
        Err(err) => Err(err),
    }
}
