use sha2::{Digest, Sha256};

use super::DocumentMeta;

/// Change-detection fingerprint over document metadata.
///
/// Hashes filename, size, mime type, and upload timestamp. This signals
/// that a document changed between approval levels; it is NOT an integrity
/// guarantee — the file bytes are never read. Callers needing tamper
/// evidence must hash content upstream and pass it through `document_id`.
pub fn metadata_fingerprint(meta: &DocumentMeta) -> String {
    let mut hasher = Sha256::new();
    hasher.update(meta.file_name.as_bytes());
    hasher.update(meta.size_bytes.to_le_bytes());
    hasher.update(meta.mime_type.as_bytes());
    hasher.update(meta.uploaded_at.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}
