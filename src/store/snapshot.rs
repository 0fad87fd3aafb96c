use crate::error::{PlatformError, Result};
use crate::store::memory::StoreState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Point-in-time copy of the whole store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub taken_at: DateTime<Utc>,
    pub state: StoreState,
}

impl Snapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize into an opaque blob, gzip-compressed when `compress` is set
    pub fn to_blob(&self, compress: bool) -> Result<Vec<u8>> {
        let json = self.to_json()?;
        if compress {
            compress_data(json.as_bytes())
        } else {
            Ok(json.into_bytes())
        }
    }

    /// Read a blob produced by [`Snapshot::to_blob`], compressed or not
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let data = decompress_data(blob)?;
        let json = String::from_utf8(data)
            .map_err(|e| PlatformError::Validation(format!("snapshot is not UTF-8: {}", e)))?;
        Self::from_json(&json)
    }

    /// SHA-256 of the JSON document, hex encoded
    pub fn checksum(&self) -> Result<String> {
        use sha2::{Digest, Sha256};

        let mut hasher = Sha256::new();
        hasher.update(format!("format:{}\n", self.format_version));
        hasher.update(format!("data:{}\n", serde_json::to_string(&self.state)?));
        Ok(hex::encode(hasher.finalize()))
    }
}

fn compress_data(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_data(data: &[u8]) -> Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    // gzip magic bytes (1f 8b)
    if data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Project;
    use crate::store::PlatformStore;

    fn populated_store() -> PlatformStore {
        let store = PlatformStore::new();
        store
            .insert_project(Project::new_with_id(
                "proj_a".into(),
                "shop".into(),
                "org_1".into(),
                "eu-central-1".into(),
                "15.1".into(),
            ))
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_compressed_blob_restores_into_fresh_store() {
        let snapshot = populated_store().snapshot();
        let blob = snapshot.to_blob(true).unwrap();
        assert_eq!(&blob[..2], &[0x1f, 0x8b]);

        let restored = Snapshot::from_blob(&blob).unwrap();
        assert_eq!(restored, snapshot);

        let fresh = PlatformStore::new();
        fresh.restore(restored).await.unwrap();
        assert_eq!(fresh.require_project("proj_a").unwrap().name, "shop");
    }

    #[test]
    fn test_plain_blob_is_accepted() {
        let snapshot = populated_store().snapshot();
        let blob = snapshot.to_blob(false).unwrap();
        assert_eq!(blob[0], b'{');
        assert_eq!(Snapshot::from_blob(&blob).unwrap(), snapshot);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let store = populated_store();
        let first = store.snapshot();
        let second = store.snapshot();
        // taken_at differs, content does not
        assert_eq!(first.checksum().unwrap(), second.checksum().unwrap());

        store
            .set_project_status("proj_a", crate::model::ProjectStatus::Inactive)
            .unwrap();
        assert_ne!(first.checksum().unwrap(), store.snapshot().checksum().unwrap());
    }

    #[test]
    fn test_garbage_blob_is_rejected() {
        let err = Snapshot::from_blob(b"not a snapshot").unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
    }

    #[tokio::test]
    async fn test_newer_format_is_rejected() {
        let store = populated_store();
        let mut snapshot = store.snapshot();
        snapshot.format_version = SNAPSHOT_FORMAT_VERSION + 1;
        assert!(store.restore(snapshot).await.is_err());
    }
}
