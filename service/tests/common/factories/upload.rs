//! Multipart upload request factory.

use serde_json::json;
use vaultkeep_api::exchange::UploadMeta;
use vaultkeep_api::upload::sha256_hex;
use vk_crypto::SessionKey;

pub const MULTIPART_BOUNDARY: &str = "vaultkeep-test-boundary";

/// Encode a `meta` field and a `chunk` field as `multipart/form-data`.
pub fn multipart_body(meta_wire: &str, chunk: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"meta\"\r\n\r\n{meta_wire}\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(
        format!(
            "--{MULTIPART_BOUNDARY}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(chunk);
    body.extend_from_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
    body
}

/// Splits a file into chunks and seals the metadata for each.
pub struct UploadFactory {
    token: String,
    data: Vec<u8>,
    chunk_size: usize,
    file_name: String,
    declared_reason: String,
}

impl UploadFactory {
    pub fn new(token: &str, data: &[u8]) -> Self {
        Self {
            token: token.to_string(),
            data: data.to_vec(),
            chunk_size: data.len().max(1),
            file_name: "backup.sql".to_string(),
            declared_reason: "restore_db".to_string(),
        }
    }

    #[must_use]
    pub const fn chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    #[must_use]
    pub fn file_name(mut self, name: &str) -> Self {
        self.file_name = name.to_string();
        self
    }

    #[must_use]
    pub fn declared_reason(mut self, reason: &str) -> Self {
        self.declared_reason = reason.to_string();
        self
    }

    pub fn total_chunks(&self) -> u32 {
        u32::try_from(self.data.len().div_ceil(self.chunk_size)).expect("chunk count")
    }

    pub fn meta(&self, index: u32) -> UploadMeta {
        UploadMeta {
            token: self.token.clone(),
            declared_reason: self.declared_reason.clone(),
            chunk_index: index,
            total_chunks: self.total_chunks(),
            total_size: self.data.len() as u64,
            file_name: self.file_name.clone(),
            sha256: sha256_hex(self.chunk_bytes(index)),
        }
    }

    pub fn chunk_bytes(&self, index: u32) -> &[u8] {
        let start = index as usize * self.chunk_size;
        let end = (start + self.chunk_size).min(self.data.len());
        &self.data[start..end]
    }

    /// Multipart body for chunk `index`, metadata sealed under `key`.
    pub fn body(&self, key: &SessionKey, index: u32) -> Vec<u8> {
        let meta = vk_crypto::encode_wire(&json!(self.meta(index)), key).expect("seal meta");
        multipart_body(&meta, self.chunk_bytes(index))
    }

    /// Sealed metadata for chunk `index` carrying some other bytes.
    pub fn body_with_bytes(&self, key: &SessionKey, index: u32, bytes: &[u8]) -> Vec<u8> {
        let meta = vk_crypto::encode_wire(&json!(self.meta(index)), key).expect("seal meta");
        multipart_body(&meta, bytes)
    }
}
