//! Notary sealing: a certificate binding a sequence range to one SHA-256
//! fingerprint, suitable for publishing outside the ledger.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use super::SequencerLedger;
use crate::error::SealError;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::record::ForensicRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attestation {
    /// Uppercase hex SHA-256 over the canonical JSON payload.
    pub fingerprint: String,
    pub notary_seal: String,
    pub range: String,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub record_count: u64,
    /// Chain hash of the last sealed entry.
    pub head_hash: String,
    pub sealed_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub attestation: Attestation,
    pub payload: Vec<ForensicRecord>,
}

pub fn fingerprint(payload: &[ForensicRecord]) -> String {
    let manifest = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode_upper(Sha256::digest(&manifest))
}

/// Seal `from..=to`. Every sequence id in the range must exist.
pub fn seal_range(
    ledger: &SequencerLedger,
    from: u64,
    to: u64,
    notary_seal: &str,
) -> Result<Certificate, SealError> {
    if from == 0 || from > to {
        return Err(SealError::EmptyRange { from, to });
    }
    let entries = ledger.entries_range(from, to);
    let expected = to - from + 1;
    if (entries.len() as u64) < expected {
        return Err(SealError::Missing(from + entries.len() as u64));
    }
    let head_hash = entries
        .last()
        .map(|e| e.entry_hash.clone())
        .unwrap_or_default();
    let payload: Vec<ForensicRecord> = entries.into_iter().map(|e| e.record).collect();

    Ok(Certificate {
        attestation: Attestation {
            fingerprint: fingerprint(&payload),
            notary_seal: notary_seal.to_string(),
            range: format!("{}-{}", from, to),
            first_sequence: from,
            last_sequence: to,
            record_count: expected,
            head_hash,
            sealed_at: crate::logging::ts_now(),
        },
        payload,
    })
}

/// Recompute the fingerprint and check the payload matches the stated range.
pub fn verify_certificate(cert: &Certificate) -> bool {
    let a = &cert.attestation;
    let contiguous = cert
        .payload
        .iter()
        .enumerate()
        .all(|(i, r)| r.sequence_id == a.first_sequence + i as u64);
    contiguous
        && cert.payload.len() as u64 == a.record_count
        && a.last_sequence + 1 == a.first_sequence + a.record_count
        && fingerprint(&cert.payload) == a.fingerprint
}

/// Last sequence id already sealed, or 0 when no cursor file exists yet.
pub fn read_cursor(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let raw = fs::read_to_string(path).with_context(|| format!("read cursor {}", path.display()))?;
    raw.trim()
        .parse()
        .with_context(|| format!("cursor {} is not a sequence id", path.display()))
}

pub fn write_cursor(path: &Path, sequence_id: u64) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, sequence_id.to_string())?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Writes `CERT_<utc>_<fingerprint[..8]>.json` into `dir`.
pub fn write_certificate(dir: &Path, cert: &Certificate) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
    let short: String = cert.attestation.fingerprint.chars().take(8).collect();
    let path = dir.join(format!("CERT_{}_{}.json", stamp, short));
    let body = serde_json::to_vec_pretty(cert)?;
    fs::write(&path, body).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

/// Seals everything after the cursor in batches of `batch`, advancing the
/// cursor after each certificate lands on disk. A crash between the two
/// re-seals at most one batch.
pub fn seal_pending(
    ledger: &SequencerLedger,
    cursor_path: &Path,
    snapshot_dir: &Path,
    batch: u64,
    notary_seal: &str,
) -> Result<Vec<PathBuf>> {
    let batch = batch.max(1);
    let head = ledger.get_record_count();
    let mut cursor = read_cursor(cursor_path)?;
    if cursor > head {
        bail!("cursor {} is ahead of ledger head {}", cursor, head);
    }

    let mut written = Vec::new();
    while cursor < head {
        let from = cursor + 1;
        let to = (cursor + batch).min(head);
        let cert = seal_range(ledger, from, to, notary_seal)?;
        let path = write_certificate(snapshot_dir, &cert)?;
        write_cursor(cursor_path, to)?;
        log(
            Level::Info,
            Domain::Notary,
            "sealed",
            obj(&[
                ("range", v_str(&cert.attestation.range)),
                ("fingerprint", v_str(&cert.attestation.fingerprint)),
                ("path", v_str(&path.display().to_string())),
            ]),
        );
        written.push(path);
        cursor = to;
    }

    log(
        Level::Info,
        Domain::Notary,
        "notary_pass",
        obj(&[
            ("certificates", json!(written.len())),
            ("cursor", json!(cursor)),
            ("coverage", v_num(if head == 0 { 1.0 } else { cursor as f64 / head as f64 })),
        ]),
    );
    Ok(written)
}
