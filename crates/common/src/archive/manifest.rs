use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ArchiveError;
use crate::keys::{ArchiveKey, ArchiveSecret};

/// Manifests larger than this are rejected by replicas.
pub const MAX_MANIFEST_SIZE: usize = 16 * 1024 * 1024;

/// A single file within an archive version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// path relative to the archive root, always `/` separated
    pub path: String,
    pub size: u64,
    /// hex encoded BLAKE3 hash of the file contents
    pub hash: String,
}

/// One version of an archive's content.
///
/// Entries are kept sorted by path so two imports of the same tree
/// compare equal.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub version: u64,
    pub entries: Vec<Entry>,
}

impl Manifest {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    pub fn sign(&self, secret: &ArchiveSecret) -> Result<SignedManifest, ArchiveError> {
        let bytes = bincode::serialize(self)?;
        Ok(SignedManifest {
            archive_key: secret.archive_key(),
            manifest: self.clone(),
            signature: secret.sign(&bytes),
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SignedManifest {
    pub archive_key: ArchiveKey,
    pub manifest: Manifest,
    pub signature: Vec<u8>,
}

impl SignedManifest {
    /// Check the manifest was signed by the holder of `expected`.
    pub fn verify(&self, expected: &ArchiveKey) -> Result<(), ArchiveError> {
        if &self.archive_key != expected {
            return Err(invalid_data(format!(
                "manifest is for archive {}, expected {}",
                self.archive_key, expected
            )));
        }
        let bytes = bincode::serialize(&self.manifest)?;
        expected.verify(&bytes, &self.signature)?;
        Ok(())
    }

    pub(crate) async fn write_to<W>(&self, io: &mut W) -> Result<(), ArchiveError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let bytes = bincode::serialize(self)?;
        if bytes.len() > MAX_MANIFEST_SIZE {
            return Err(ArchiveError::ManifestTooLarge(bytes.len()));
        }
        io.write_u32(bytes.len() as u32).await?;
        io.write_all(&bytes).await?;
        Ok(())
    }

    async fn read_from<R>(io: &mut R) -> Result<Self, ArchiveError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let len = io.read_u32().await? as usize;
        if len > MAX_MANIFEST_SIZE {
            return Err(ArchiveError::ManifestTooLarge(len));
        }
        let mut bytes = vec![0u8; len];
        io.read_exact(&mut bytes).await?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

/// A verified copy of an archive received from a peer.
#[derive(Debug, Clone)]
pub struct Replica {
    pub manifest: Manifest,
    /// file contents, in manifest order
    pub files: Vec<(String, Vec<u8>)>,
}

impl Replica {
    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, data)| data.as_slice())
    }
}

/// Read a full archive off a replication stream.
///
/// The manifest signature is checked against `archive_key` and every file
/// against the size and hash its entry records.
pub async fn read_replica<R>(io: &mut R, archive_key: &ArchiveKey) -> Result<Replica, ArchiveError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let signed = SignedManifest::read_from(io).await?;
    signed.verify(archive_key)?;

    let mut files = Vec::with_capacity(signed.manifest.entries.len());
    for entry in &signed.manifest.entries {
        let len = io.read_u64().await?;
        if len != entry.size {
            return Err(invalid_data(format!(
                "{}: expected {} bytes, peer sent {}",
                entry.path, entry.size, len
            )));
        }
        let mut data = vec![0u8; len as usize];
        io.read_exact(&mut data).await?;
        if blake3::hash(&data).to_hex().as_str() != entry.hash {
            return Err(invalid_data(format!("{}: hash mismatch", entry.path)));
        }
        files.push((entry.path.clone(), data));
    }

    Ok(Replica {
        manifest: signed.manifest,
        files,
    })
}

fn invalid_data(msg: String) -> ArchiveError {
    ArchiveError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg))
}
