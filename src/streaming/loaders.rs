//! Data loaders
//!
//! Each loader fetches one payload on the I/O thread and inflates it on a
//! processing thread. Uncompressed payloads are handed on without a copy.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::{Error, Result};
use crate::streaming::packed::{PackedBytes, PackedFile};
use crate::streaming::payload;
use crate::streaming::request::DataLoader;

/// Raw bytes plus an optional inflated copy
struct Staged<B> {
    raw: Option<B>,
    inflated: Option<Vec<u8>>,
}

impl<B: AsRef<[u8]>> Staged<B> {
    fn empty() -> Self {
        Self { raw: None, inflated: None }
    }

    fn decompress(&mut self, name: &str) -> Result<&[u8]> {
        if self.inflated.is_none() {
            let raw = self
                .raw
                .as_ref()
                .ok_or_else(|| Error::InvalidData(format!("'{}' decompressed before load", name)))?;
            if let Some(inflated) = payload::decompress(raw.as_ref())? {
                self.inflated = Some(inflated);
                // The compressed bytes are no longer needed
                self.raw = None;
            }
        }

        match (&self.inflated, &self.raw) {
            (Some(inflated), _) => Ok(inflated.as_slice()),
            (None, Some(raw)) => Ok(raw.as_ref()),
            (None, None) => Err(Error::InvalidData(format!("'{}' has no data", name))),
        }
    }
}

/// Loads a named resource from a shared packed file
pub struct PackedDataLoader {
    store: Arc<Mutex<PackedFile>>,
    name: String,
    data: Staged<PackedBytes>,
}

impl PackedDataLoader {
    pub fn new(store: Arc<Mutex<PackedFile>>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            data: Staged::empty(),
        }
    }
}

impl DataLoader for PackedDataLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&mut self) -> Result<()> {
        let bytes = self.store.lock().file(&self.name)?;
        log::trace!("Loaded '{}' ({} bytes, mapped: {})", self.name, bytes.len(), bytes.is_mapped());
        self.data.raw = Some(bytes);
        Ok(())
    }

    fn decompress(&mut self) -> Result<&[u8]> {
        self.data.decompress(&self.name)
    }
}

/// Loads a loose payload file from disk
pub struct FileDataLoader {
    path: PathBuf,
    name: String,
    data: Staged<Vec<u8>>,
}

impl FileDataLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self {
            path,
            name,
            data: Staged::empty(),
        }
    }
}

impl DataLoader for FileDataLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&mut self) -> Result<()> {
        let bytes = std::fs::read(&self.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(self.name.clone()),
            _ => Error::Io(e),
        })?;
        self.data.raw = Some(bytes);
        Ok(())
    }

    fn decompress(&mut self) -> Result<&[u8]> {
        self.data.decompress(&self.name)
    }
}

/// Serves a payload that is already in memory, e.g. generated content
pub struct MemoryDataLoader {
    name: String,
    data: Staged<Vec<u8>>,
    pending: Option<Vec<u8>>,
}

impl MemoryDataLoader {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data: Staged::empty(),
            pending: Some(bytes),
        }
    }
}

impl DataLoader for MemoryDataLoader {
    fn name(&self) -> &str {
        &self.name
    }

    fn load(&mut self) -> Result<()> {
        if let Some(bytes) = self.pending.take() {
            self.data.raw = Some(bytes);
        }
        Ok(())
    }

    fn decompress(&mut self) -> Result<&[u8]> {
        self.data.decompress(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{IndexFormat, TextureDesc, TextureFormat};
    use crate::streaming::disk_io::PackedFileBuilder;
    use crate::streaming::packed::PackedFileOptions;
    use crate::streaming::payload::PayloadShape;
    use glam::Vec3;

    fn index_payload(compress: bool) -> (Vec<u8>, Vec<u8>) {
        let shape = PayloadShape::Index { format: IndexFormat::Uint16, count: 6 };
        let body: Vec<u8> = (0..12).collect();
        (payload::encode(shape, &body, compress), body)
    }

    #[test]
    fn test_memory_loader_compressed() {
        let (encoded, body) = index_payload(true);
        let mut loader = MemoryDataLoader::new("indices", encoded);
        loader.load().unwrap();
        let data = loader.decompress().unwrap();
        let (_, decoded) = payload::decode(data, payload::INDEX_MAGIC).unwrap();
        assert_eq!(decoded, &body[..]);
    }

    #[test]
    fn test_decompress_before_load_fails() {
        let (encoded, _) = index_payload(false);
        let mut loader = MemoryDataLoader::new("indices", encoded);
        assert!(loader.decompress().is_err());
    }

    #[test]
    fn test_file_loader_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut loader = FileDataLoader::new(dir.path().join("missing.bin"));
        let err = loader.load().unwrap_err();
        assert_eq!(err.code(), crate::core::ResultCode::NotFound);
    }

    #[test]
    fn test_file_loader_reads_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indices.bin");
        let (encoded, _) = index_payload(false);
        std::fs::write(&path, &encoded).unwrap();

        let mut loader = FileDataLoader::new(&path);
        loader.load().unwrap();
        assert_eq!(loader.decompress().unwrap(), &encoded[..]);
    }

    #[test]
    fn test_packed_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack.bin");
        let shape = PayloadShape::Texture(TextureDesc::new(4, 4, 1, TextureFormat::Rgba8Unorm));
        let body = vec![9u8; shape.body_len() as usize];

        let mut builder = PackedFileBuilder::new();
        let chunk = builder.add_chunk();
        builder
            .add_resource(chunk, "tile", payload::encode(shape, &body, true), Vec3::ZERO)
            .unwrap();
        builder.write(&path).unwrap();

        let store = Arc::new(Mutex::new(PackedFile::open(&path, PackedFileOptions::default()).unwrap()));
        let mut loader = PackedDataLoader::new(store.clone(), "tile");
        loader.load().unwrap();
        let (decoded_shape, decoded) = payload::decode(loader.decompress().unwrap(), payload::TEXTURE_MAGIC).unwrap();
        assert_eq!(decoded_shape, shape);
        assert_eq!(decoded, &body[..]);

        let mut missing = PackedDataLoader::new(store, "nope");
        assert!(matches!(missing.load(), Err(Error::NotFound(_))));
    }
}
