//! RocksDB-backed checkpoint store.
//!
//! Column families:
//! - `snapshots`: room text at the checkpoint revision (LZ4 compressed, keyed by room id)
//! - `metadata`: [`CheckpointMeta`] (bincode, keyed by room id)
//!
//! Both are written in one `WriteBatch`, so a crash never leaves a snapshot
//! paired with another revision's metadata.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::{Checkpoint, CheckpointStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every checkpoint (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dojo_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Checkpoint metadata stored next to the compressed text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub room_id: String,
    pub revision: u64,
    pub epoch: Uuid,
    pub clean: bool,
    /// Uncompressed text size in bytes
    pub text_size: u64,
    pub compressed_size: u64,
    /// Seconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl CheckpointMeta {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

/// Durable checkpoint store.
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open (or create) the store at the configured path.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Checkpoint store opened at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // Values are already LZ4 frames.
            CF_SNAPSHOTS => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    /// Metadata of a room's checkpoint without decompressing the text.
    pub fn metadata(&self, room_id: &str) -> Result<Option<CheckpointMeta>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => CheckpointMeta::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

impl CheckpointStore for RocksStore {
    fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let cf_snap = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = checkpoint.room_id.as_bytes();

        let compressed = lz4_flex::compress_prepend_size(checkpoint.text.as_bytes());
        let created_at = self
            .metadata(&checkpoint.room_id)?
            .map_or(checkpoint.saved_at, |m| m.created_at);
        let meta = CheckpointMeta {
            room_id: checkpoint.room_id.clone(),
            revision: checkpoint.revision,
            epoch: checkpoint.epoch,
            clean: checkpoint.clean,
            text_size: checkpoint.text.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at,
            updated_at: checkpoint.saved_at,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snap, key, &compressed);
        batch.put_cf(&cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Checkpoint {} r{} saved ({} -> {} bytes)",
            checkpoint.room_id,
            checkpoint.revision,
            meta.text_size,
            meta.compressed_size
        );
        Ok(())
    }

    fn load(&self, room_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        let Some(meta) = self.metadata(room_id)? else {
            return Ok(None);
        };
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = self.db.get_cf(&cf, room_id.as_bytes())?.ok_or_else(|| {
            StoreError::Inconsistent(format!("room {room_id} has metadata but no snapshot"))
        })?;
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let text = String::from_utf8(bytes)
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;

        Ok(Some(Checkpoint {
            room_id: meta.room_id,
            revision: meta.revision,
            text,
            epoch: meta.epoch,
            clean: meta.clean,
            saved_at: meta.updated_at,
        }))
    }

    fn remove(&self, room_id: &str) -> Result<bool, StoreError> {
        let existed = self.metadata(room_id)?.is_some();
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_SNAPSHOTS)?, room_id.as_bytes());
        batch.delete_cf(&self.cf(CF_METADATA)?, room_id.as_bytes());
        self.db.write(batch)?;
        Ok(existed)
    }

    fn rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let room = String::from_utf8(key.to_vec())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
            rooms.push(room);
        }
        Ok(rooms)
    }
}

impl std::fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.config.path)
            .finish()
    }
}
