use crate::destination::Destination;
use crate::error::RunError;
use crate::product::ProductRecord;
use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use tracing::{error, info, warn};

/// Payloads larger than this are never treated as an error envelope.
const MAX_ENVELOPE_BYTES: u64 = 1 << 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadOutcome {
    pub identifier: String,
    pub bytes_received: u64,
    pub verified: bool,
    pub extracted: bool,
    pub failure_reason: Option<String>,
    /// Transient failure; the product stays pending and is fetched again next cycle.
    pub retry: bool,
}

impl DownloadOutcome {
    fn new(identifier: &str, bytes_received: u64) -> Self {
        Self {
            identifier: identifier.to_string(),
            bytes_received,
            verified: false,
            extracted: false,
            failure_reason: None,
            retry: false,
        }
    }

    fn retry(mut self, reason: String) -> Self {
        self.failure_reason = Some(reason);
        self.retry = true;
        self
    }

    fn failed(mut self, reason: String) -> Self {
        self.failure_reason = Some(reason);
        self
    }

    pub fn is_complete(self: &Self) -> bool {
        self.verified && self.failure_reason.is_none()
    }
}

/// Checks finished transfers and moves them to their final place in the destination.
pub struct TransferVerifier {
    destination: Destination,
    extract: bool,
}

impl TransferVerifier {
    pub fn new(destination: Destination, extract: bool) -> Self {
        Self {
            destination,
            extract,
        }
    }

    /// Returns an error for a payload that is the download API's error document, which means the
    /// credentials were refused, and for filesystem failures in the destination. Both end the run.
    /// Everything else about the product is reported in the outcome.
    pub fn verify(
        self: &Self,
        record: &ProductRecord,
        temp: &Path,
        bytes_received: u64,
    ) -> Result<DownloadOutcome> {
        let outcome = DownloadOutcome::new(&record.identifier, bytes_received);
        let mismatch = match record.resource_size {
            _ if bytes_received == 0 => Some("received an empty payload".to_string()),
            Some(expected) if expected != bytes_received => Some(format!(
                "received {bytes_received} bytes, expected {expected}"
            )),
            Some(_) => None,
            None if !has_zip_signature(temp) => Some("payload is not a zip archive".to_string()),
            None => None,
        };

        if let Some(reason) = mismatch {
            if let Some(envelope) = read_envelope(temp) {
                let _ = fs::remove_file(temp);
                error!(identifier = %record.identifier, %envelope, "Download returned a text payload");
                return Err(RunError::Authentication(envelope.to_string()).into());
            }
            let _ = fs::remove_file(temp);
            warn!(identifier = %record.identifier, %reason, "Incomplete transfer, will retry");
            return Ok(outcome.retry(reason));
        }

        let archive = self.destination.archive_path(&record.identifier);
        fs::rename(temp, &archive)
            .with_context(|| format!("Renaming {} to {}", temp.display(), archive.display()))?;
        info!(identifier = %record.identifier, path = %archive.display(), "Product saved");
        let mut outcome = DownloadOutcome {
            verified: true,
            ..outcome
        };

        if !self.extract {
            return Ok(outcome);
        }
        match self.extract_archive(record, &archive) {
            Ok(()) => {
                fs::remove_file(&archive)
                    .with_context(|| format!("Removing {}", archive.display()))?;
                info!(identifier = %record.identifier, "Product extracted");
                outcome.extracted = true;
                Ok(outcome)
            }
            Err(e) => {
                let reason = format!("extraction failed: {e:#}");
                error!(identifier = %record.identifier, %reason, "Removing archive");
                let _ = fs::remove_file(&archive);
                self.destination.mark_failed(&record.identifier, &reason)?;
                Ok(outcome.failed(reason))
            }
        }
    }

    /// Unpacks into a scratch directory and moves only the product directory into place, so
    /// nothing else from the archive reaches the destination.
    fn extract_archive(self: &Self, record: &ProductRecord, archive: &Path) -> Result<()> {
        let scratch = self.destination.unpack_path();
        let result = self.unpack_into(record, archive, &scratch);
        if scratch.exists() {
            if let Err(e) = fs::remove_dir_all(&scratch) {
                warn!(path = %scratch.display(), "Could not remove unpack directory: {e}");
            }
        }
        result
    }

    fn unpack_into(self: &Self, record: &ProductRecord, archive: &Path, scratch: &Path) -> Result<()> {
        let file = File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file)?;
        fs::create_dir_all(scratch)?;
        zip.extract(scratch)?;

        let unpacked = scratch.join(record.extracted_dir_name());
        if !unpacked.is_dir() {
            return Err(anyhow!(
                "archive did not contain {}",
                record.extracted_dir_name()
            ));
        }
        let product_dir = self.destination.product_dir(record);
        fs::rename(&unpacked, &product_dir)
            .with_context(|| format!("Moving {} into place", product_dir.display()))?;
        Ok(())
    }
}

const ZIP_SIGNATURE: [u8; 4] = *b"PK\x03\x04";

fn has_zip_signature(path: &Path) -> bool {
    let mut magic = [0_u8; 4];
    File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .is_ok_and(|()| magic == ZIP_SIGNATURE)
}

/// A JSON object or array, the shape of the API's error documents.
pub fn json_document(data: &[u8]) -> Option<Value> {
    match serde_json::from_slice::<Value>(data).ok()? {
        value @ (Value::Object(_) | Value::Array(_)) => Some(value),
        _ => None,
    }
}

fn read_envelope(path: &Path) -> Option<Value> {
    let len = fs::metadata(path).ok()?.len();
    if len == 0 || len > MAX_ENVELOPE_BYTES {
        return None;
    }
    json_document(&fs::read(path).ok()?)
}
