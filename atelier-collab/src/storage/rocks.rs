//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `documents`: full document snapshots (JSON, LZ4 compressed)
//! - `batches`: accepted forward patches (JSON, LZ4, keyed by doc key:version)
//! - `metadata`: per-document metadata (bincode)
//!
//! Keys are `<kind tag:1 byte><id:8 bytes big-endian>`, batches append the
//! version as another 8 big-endian bytes so a prefix scan yields them in order.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use atelier_core::patch::apply_all;
use atelier_core::{Document, DocumentKey, Patch, ResourceKind};

const CF_DOCUMENTS: &str = "documents";
const CF_BATCHES: &str = "batches";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_DOCUMENTS, CF_BATCHES, CF_METADATA];

const DOC_KEY_LEN: usize = 9;
const BATCH_KEY_LEN: usize = DOC_KEY_LEN + 8;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Fsync on every write (default: false)
    pub sync_writes: bool,
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("atelier_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

/// Metadata stored alongside each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    pub key: DocumentKey,
    /// Latest persisted version (snapshot or batch).
    pub version: u64,
    /// Version the stored snapshot was taken at.
    pub snapshot_version: u64,
    /// Batches stored after the snapshot.
    pub batch_count: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Tombstoned; restored as deleted on recovery.
    pub deleted: bool,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl DocumentMetadata {
    fn new(key: DocumentKey) -> Self {
        let now = now_secs();
        Self {
            key,
            version: 0,
            snapshot_version: 0,
            batch_count: 0,
            snapshot_size: 0,
            compressed_size: 0,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// A document as loaded from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub document: Document,
    pub deleted: bool,
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("{0} not found in storage")]
    NotFound(DocumentKey),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    /// A stored batch no longer applies to the stored snapshot.
    #[error("corrupt history for {key} at version {version}: {reason}")]
    Corrupt {
        key: DocumentKey,
        version: u64,
        reason: String,
    },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("opened document store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_DOCUMENTS | CF_METADATA => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_BATCHES => {
                // Many small appends, prefix-scanned by document key.
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(DOC_KEY_LEN));
            }
            _ => {}
        }

        opts
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full snapshot and drop the batches it supersedes.
    pub fn save_snapshot(&self, doc: &Document) -> Result<DocumentMetadata, StoreError> {
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let cf_batches = self.cf(CF_BATCHES)?;

        let json = serde_json::to_vec(doc).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = self
            .load_metadata(doc.key)
            .unwrap_or_else(|_| DocumentMetadata::new(doc.key));
        meta.version = meta.version.max(doc.version);
        meta.snapshot_version = doc.version;
        meta.snapshot_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        let key = doc_key(doc.key);
        batch.put_cf(&cf_docs, key, &compressed);

        let mut remaining = 0;
        for (version, batch_key) in self.batch_keys(doc.key)? {
            if version <= doc.version {
                batch.delete_cf(&cf_batches, batch_key);
            } else {
                remaining += 1;
            }
        }
        meta.batch_count = remaining;
        batch.put_cf(&cf_meta, key, meta.encode()?);

        self.db.write_opt(batch, &self.write_options())?;
        log::debug!(
            "snapshot {} v{} ({} -> {} bytes)",
            doc.key,
            doc.version,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    fn load_snapshot(&self, key: DocumentKey) -> Result<Document, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = self.db.get_cf(&cf, doc_key(key))?.ok_or(StoreError::NotFound(key))?;
        let json = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    // ─── Batches ──────────────────────────────────────────────────────

    /// Append the forward patches of an accepted batch.
    ///
    /// Returns the compressed size written.
    pub fn append_batch(&self, key: DocumentKey, version: u64, patches: &[Patch]) -> Result<u64, StoreError> {
        let cf_batches = self.cf(CF_BATCHES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json = serde_json::to_vec(patches).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = self.load_metadata(key)?;
        meta.version = version;
        meta.batch_count += 1;
        meta.updated_at = now_secs();

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_batches, batch_key(key, version), &compressed);
        batch.put_cf(&cf_meta, doc_key(key), meta.encode()?);
        self.db.write_opt(batch, &self.write_options())?;

        Ok(compressed.len() as u64)
    }

    /// Batches with a version greater than `after`, in version order.
    pub fn batches_since(&self, key: DocumentKey, after: u64) -> Result<Vec<(u64, Vec<Patch>)>, StoreError> {
        let cf = self.cf(CF_BATCHES)?;
        let prefix = doc_key(key);
        let start = batch_key(key, after.saturating_add(1));

        let mut batches = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (k, value) = item?;
            if k.len() != BATCH_KEY_LEN || k[..DOC_KEY_LEN] != prefix {
                break;
            }
            let version = u64::from_be_bytes(be_bytes(&k[DOC_KEY_LEN..])?);
            let json = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::Compression(e.to_string()))?;
            let patches =
                serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))?;
            batches.push((version, patches));
        }
        Ok(batches)
    }

    fn batch_keys(&self, key: DocumentKey) -> Result<Vec<(u64, Box<[u8]>)>, StoreError> {
        let cf = self.cf(CF_BATCHES)?;
        let prefix = doc_key(key);
        let start = batch_key(key, 0);

        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward)) {
            let (k, _) = item?;
            if k.len() != BATCH_KEY_LEN || k[..DOC_KEY_LEN] != prefix {
                break;
            }
            keys.push((u64::from_be_bytes(be_bytes(&k[DOC_KEY_LEN..])?), k));
        }
        Ok(keys)
    }

    // ─── Documents ────────────────────────────────────────────────────

    /// Load a document: its snapshot with every newer batch replayed.
    pub fn load_document(&self, key: DocumentKey) -> Result<StoredDocument, StoreError> {
        let meta = self.load_metadata(key)?;
        let mut document = self.load_snapshot(key)?;
        for (version, patches) in self.batches_since(key, document.version)? {
            apply_all(&mut document.value, &patches).map_err(|e| StoreError::Corrupt {
                key,
                version,
                reason: e.to_string(),
            })?;
            document.version = version;
        }
        Ok(StoredDocument {
            document,
            deleted: meta.deleted,
        })
    }

    /// Record a tombstone (or its removal).
    pub fn set_deleted(&self, key: DocumentKey, deleted: bool) -> Result<(), StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut meta = self.load_metadata(key)?;
        meta.deleted = deleted;
        meta.updated_at = now_secs();
        self.db.put_cf_opt(&cf, doc_key(key), meta.encode()?, &self.write_options())?;
        Ok(())
    }

    pub fn load_metadata(&self, key: DocumentKey) -> Result<DocumentMetadata, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, doc_key(key))? {
            Some(bytes) => DocumentMetadata::decode(&bytes),
            None => Err(StoreError::NotFound(key)),
        }
    }

    /// Keys of every stored document, in key order.
    pub fn list_documents(&self) -> Result<Vec<DocumentKey>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (k, _) = item?;
            keys.push(parse_doc_key(&k)?);
        }
        Ok(keys)
    }

    /// Load every stored document. Documents whose history fails to replay
    /// are logged and skipped.
    pub fn recover_all(&self) -> Result<Vec<StoredDocument>, StoreError> {
        let mut documents = Vec::new();
        for key in self.list_documents()? {
            match self.load_document(key) {
                Ok(doc) => documents.push(doc),
                Err(e) => log::error!("skipping {key} during recovery: {e}"),
            }
        }
        Ok(documents)
    }

    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }
}

fn kind_tag(kind: ResourceKind) -> u8 {
    ResourceKind::ALL.iter().position(|k| *k == kind).unwrap_or_default() as u8
}

fn doc_key(key: DocumentKey) -> [u8; DOC_KEY_LEN] {
    let mut out = [0u8; DOC_KEY_LEN];
    out[0] = kind_tag(key.kind);
    out[1..].copy_from_slice(&key.id.to_be_bytes());
    out
}

fn batch_key(key: DocumentKey, version: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(BATCH_KEY_LEN);
    out.extend_from_slice(&doc_key(key));
    out.extend_from_slice(&version.to_be_bytes());
    out
}

fn parse_doc_key(bytes: &[u8]) -> Result<DocumentKey, StoreError> {
    if bytes.len() != DOC_KEY_LEN {
        return Err(StoreError::Deserialization(format!("bad key length {}", bytes.len())));
    }
    let kind = ResourceKind::ALL
        .get(bytes[0] as usize)
        .copied()
        .ok_or_else(|| StoreError::Deserialization(format!("unknown kind tag {}", bytes[0])))?;
    Ok(DocumentKey::new(kind, u64::from_be_bytes(be_bytes(&bytes[1..])?)))
}

fn be_bytes(bytes: &[u8]) -> Result<[u8; 8], StoreError> {
    bytes
        .try_into()
        .map_err(|_| StoreError::Deserialization("expected 8 key bytes".into()))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_core::{path, Ownership, TenantId};
    use serde_json::json;

    fn open() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    fn map(id: u64) -> Document {
        Document::new(
            DocumentKey::new(ResourceKind::Map, id),
            Ownership::Tenant(TenantId(1)),
            json!({"name": "Harbor", "height": 1, "layers": []}),
        )
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let (_dir, store) = open();
        let doc = map(7);
        let meta = store.save_snapshot(&doc).unwrap();
        assert_eq!(meta.key, doc.key);
        assert!(meta.compressed_size > 0);

        let loaded = store.load_document(doc.key).unwrap();
        assert_eq!(loaded.document, doc);
        assert!(!loaded.deleted);
    }

    #[test]
    fn test_batches_replay_after_snapshot() {
        let (_dir, store) = open();
        let doc = map(1);
        store.save_snapshot(&doc).unwrap();
        store
            .append_batch(doc.key, 1, &[Patch::set(path!["height"], json!(2))])
            .unwrap();
        store
            .append_batch(doc.key, 2, &[Patch::insert(path!["layers", 0usize], json!("ground"))])
            .unwrap();

        let loaded = store.load_document(doc.key).unwrap().document;
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.value["height"], json!(2));
        assert_eq!(loaded.value["layers"], json!(["ground"]));
        assert_eq!(store.load_metadata(doc.key).unwrap().batch_count, 2);
    }

    #[test]
    fn test_snapshot_compacts_older_batches() {
        let (_dir, store) = open();
        let mut doc = map(1);
        store.save_snapshot(&doc).unwrap();
        for version in 1..=3 {
            store
                .append_batch(doc.key, version, &[Patch::set(path!["height"], json!(version))])
                .unwrap();
        }
        doc.version = 2;
        doc.value["height"] = json!(2);
        let meta = store.save_snapshot(&doc).unwrap();

        assert_eq!(meta.batch_count, 1);
        assert_eq!(meta.version, 3);
        let remaining = store.batches_since(doc.key, 0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, 3);
        assert_eq!(store.load_document(doc.key).unwrap().document.value["height"], json!(3));
    }

    #[test]
    fn test_batches_do_not_leak_between_documents() {
        let (_dir, store) = open();
        store.save_snapshot(&map(1)).unwrap();
        store.save_snapshot(&map(2)).unwrap();
        let key1 = DocumentKey::new(ResourceKind::Map, 1);
        let key2 = DocumentKey::new(ResourceKind::Map, 2);
        store.append_batch(key1, 1, &[Patch::set(path!["height"], json!(5))]).unwrap();

        assert_eq!(store.batches_since(key2, 0).unwrap(), vec![]);
        assert_eq!(store.load_document(key2).unwrap().document.value["height"], json!(1));
    }

    #[test]
    fn test_tombstone_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let doc = map(3);
        {
            let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot(&doc).unwrap();
            store.set_deleted(doc.key, true).unwrap();
        }
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let recovered = store.recover_all().unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(recovered[0].deleted);
        assert_eq!(store.list_documents().unwrap(), vec![doc.key]);
    }

    #[test]
    fn test_missing_document() {
        let (_dir, store) = open();
        let key = DocumentKey::new(ResourceKind::Item, 9);
        assert_eq!(store.load_document(key).unwrap_err(), StoreError::NotFound(key));
        assert_eq!(store.load_metadata(key).unwrap_err(), StoreError::NotFound(key));
        assert!(store.append_batch(key, 1, &[]).is_err());
    }

    #[test]
    fn test_corrupt_history_reported() {
        let (_dir, store) = open();
        let doc = map(4);
        store.save_snapshot(&doc).unwrap();
        store.append_batch(doc.key, 1, &[Patch::remove(path!["missing"])]).unwrap();
        assert!(matches!(
            store.load_document(doc.key),
            Err(StoreError::Corrupt { version: 1, .. })
        ));
        assert!(store.recover_all().unwrap().is_empty());
    }

    #[test]
    fn test_key_encoding_roundtrip() {
        for kind in ResourceKind::ALL {
            let key = DocumentKey::new(kind, 0x0102_0304_0506_0708);
            assert_eq!(parse_doc_key(&doc_key(key)).unwrap(), key);
        }
    }
}
