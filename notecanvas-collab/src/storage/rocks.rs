//! RocksDB-backed persistence.
//!
//! Column families:
//! - `notes`: live note fields, keyed by `note_id`
//! - `comments`: keyed by `<note_id:16><comment_id:16>`
//! - `versions`: LZ4-compressed snapshots, keyed by
//!   `<note_id:16><version_number:8 big-endian>` so a prefix
//!   scan walks versions in order
//!
//! Values are bincode.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, ReadOptions, SingleThreaded, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    build_threads, Comment, CommentId, CommentThread, MonotonicClock, NewComment, NoteId,
    NoteSnapshot, NoteVersion, PersistenceStore, StoreError,
};

const CF_NOTES: &str = "notes";
const CF_COMMENTS: &str = "comments";
const CF_VERSIONS: &str = "versions";

const COLUMN_FAMILIES: &[&str] = &[CF_NOTES, CF_COMMENTS, CF_VERSIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("notecanvas_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    clock: MonotonicClock,
    /// Serializes read-modify-write sequences (version numbering, resolve).
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
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
        log::info!("Opened note store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            clock: MonotonicClock::default(),
            write_lock: Mutex::new(()),
        })
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
            CF_NOTES => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_COMMENTS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            CF_VERSIONS => {
                // Values are already LZ4 frames.
                opts.set_compression_type(DBCompressionType::None);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|_| StoreError::DatabaseError("store write lock poisoned".into()))
    }

    fn put<T: Serialize>(&self, cf: &str, key: &[u8], value: &T) -> Result<(), StoreError> {
        let cf = self.cf(cf)?;
        self.db.put_cf_opt(cf, key, encode(value)?, &self.write_opts())?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let cf = self.cf(cf)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw values under a 16-byte note prefix, in key order.
    fn scan_note(&self, cf: &str, note_id: NoteId) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf(cf)?;
        let prefix = note_id.as_bytes();
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if key.len() < 16 || &key[..16] != prefix {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }
        Ok(out)
    }

    fn last_version_number(&self, note_id: NoteId) -> Result<u64, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        let upper = version_key(note_id, u64::MAX);
        let mut read_opts = ReadOptions::default();
        read_opts.set_total_order_seek(true);
        let mut iter = self.db.iterator_cf_opt(
            cf,
            read_opts,
            IteratorMode::From(&upper, Direction::Reverse),
        );
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.len() == 24 && &key[..16] == note_id.as_bytes() {
                    Ok(version_from_key(&key))
                } else {
                    Ok(0)
                }
            }
            None => Ok(0),
        }
    }

    fn decode_version(bytes: &[u8]) -> Result<NoteVersion, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        decode(&raw)
    }
}

impl PersistenceStore for RocksStore {
    fn put_note(&self, note_id: NoteId, snapshot: &NoteSnapshot) -> Result<(), StoreError> {
        self.put(CF_NOTES, note_id.as_bytes(), snapshot)
    }

    fn note(&self, note_id: NoteId) -> Result<NoteSnapshot, StoreError> {
        self.get(CF_NOTES, note_id.as_bytes())?
            .ok_or_else(|| StoreError::NotFound(format!("note {note_id}")))
    }

    fn append_comment(&self, note_id: NoteId, comment: NewComment) -> Result<Comment, StoreError> {
        if let Some(parent) = comment.parent_id {
            if self
                .get::<Comment>(CF_COMMENTS, &comment_key(note_id, parent))?
                .is_none()
            {
                return Err(StoreError::InvalidParent(parent));
            }
        }
        let stored = Comment {
            id: Uuid::new_v4(),
            note_id,
            author: comment.author,
            content: comment.content,
            parent_id: comment.parent_id,
            mentions: comment.mentions,
            created_at: self.clock.now(),
            resolved: false,
        };
        self.put(CF_COMMENTS, &comment_key(note_id, stored.id), &stored)?;
        Ok(stored)
    }

    fn comments(&self, note_id: NoteId) -> Result<Vec<CommentThread>, StoreError> {
        let comments = self
            .scan_note(CF_COMMENTS, note_id)?
            .iter()
            .map(|(_, v)| decode::<Comment>(v))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(build_threads(comments))
    }

    fn resolve_comment(&self, note_id: NoteId, comment_id: CommentId) -> Result<Comment, StoreError> {
        let _guard = self.guard()?;
        let key = comment_key(note_id, comment_id);
        let mut comment: Comment = self
            .get(CF_COMMENTS, &key)?
            .ok_or_else(|| StoreError::NotFound(format!("comment {comment_id}")))?;
        comment.resolved = true;
        self.put(CF_COMMENTS, &key, &comment)?;
        Ok(comment)
    }

    fn append_version(&self, note_id: NoteId, snapshot: &NoteSnapshot) -> Result<NoteVersion, StoreError> {
        let _guard = self.guard()?;
        let version = NoteVersion {
            note_id,
            version_number: self.last_version_number(note_id)? + 1,
            snapshot: snapshot.clone(),
            created_at: self.clock.now(),
        };
        let compressed = lz4_flex::compress_prepend_size(&encode(&version)?);
        let cf = self.cf(CF_VERSIONS)?;
        self.db.put_cf_opt(
            cf,
            version_key(note_id, version.version_number),
            compressed,
            &self.write_opts(),
        )?;
        log::debug!("Stored version {} of note {note_id}", version.version_number);
        Ok(version)
    }

    fn versions(&self, note_id: NoteId) -> Result<Vec<NoteVersion>, StoreError> {
        let mut versions = self
            .scan_note(CF_VERSIONS, note_id)?
            .iter()
            .map(|(_, v)| Self::decode_version(v))
            .collect::<Result<Vec<_>, _>>()?;
        versions.reverse();
        Ok(versions)
    }

    fn version(&self, note_id: NoteId, version_number: u64) -> Result<NoteVersion, StoreError> {
        let cf = self.cf(CF_VERSIONS)?;
        match self.db.get_cf(cf, version_key(note_id, version_number))? {
            Some(bytes) => Self::decode_version(&bytes),
            None => Err(StoreError::NotFound(format!(
                "version {version_number} of note {note_id}"
            ))),
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
    Ok(value)
}

fn comment_key(note_id: NoteId, comment_id: CommentId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(note_id.as_bytes());
    key.extend_from_slice(comment_id.as_bytes());
    key
}

fn version_key(note_id: NoteId, version_number: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(24);
    key.extend_from_slice(note_id.as_bytes());
    key.extend_from_slice(&version_number.to_be_bytes());
    key
}

fn version_from_key(key: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&key[16..24]);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RocksStore {
        RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap()
    }

    fn snap(content: &str) -> NoteSnapshot {
        NoteSnapshot {
            title: "Note".into(),
            content: content.into(),
            tags: vec!["a".into(), "b".into()],
        }
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        assert!(store.path().exists());
    }

    #[test]
    fn test_note_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = Uuid::new_v4();
        assert!(matches!(store.note(id), Err(StoreError::NotFound(_))));
        store.put_note(id, &snap("body")).unwrap();
        assert_eq!(store.note(id).unwrap(), snap("body"));
    }

    #[test]
    fn test_comments_isolated_per_note() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let new = |content: &str, parent| NewComment {
            author: Uuid::from_u128(1),
            content: content.into(),
            parent_id: parent,
            mentions: Vec::new(),
        };

        let root = store.append_comment(a, new("root", None)).unwrap();
        store.append_comment(a, new("reply", Some(root.id))).unwrap();
        store.append_comment(b, new("other", None)).unwrap();

        let threads = store.comments(a).unwrap();
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].replies.len(), 1);
        assert_eq!(store.comments(b).unwrap().len(), 1);

        // A parent on another note is not a valid parent.
        assert!(matches!(
            store.append_comment(b, new("x", Some(root.id))),
            Err(StoreError::InvalidParent(_))
        ));
    }

    #[test]
    fn test_resolve_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let note = Uuid::new_v4();
        let c = store
            .append_comment(
                note,
                NewComment {
                    author: Uuid::from_u128(1),
                    content: "todo".into(),
                    parent_id: None,
                    mentions: vec![Uuid::from_u128(5)],
                },
            )
            .unwrap();
        store.resolve_comment(note, c.id).unwrap();
        let threads = store.comments(note).unwrap();
        assert!(threads[0].comment.resolved);
        assert_eq!(threads[0].comment.mentions, vec![Uuid::from_u128(5)]);
    }

    #[test]
    fn test_versions_numbered_per_note() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert_eq!(store.append_version(a, &snap("1")).unwrap().version_number, 1);
        assert_eq!(store.append_version(a, &snap("2")).unwrap().version_number, 2);
        assert_eq!(store.append_version(b, &snap("x")).unwrap().version_number, 1);

        let listed: Vec<u64> = store.versions(a).unwrap().iter().map(|v| v.version_number).collect();
        assert_eq!(listed, vec![2, 1]);
        assert_eq!(store.version(a, 1).unwrap().snapshot.content, "1");
    }

    #[test]
    fn test_restore_overwrites_live_note() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = Uuid::new_v4();
        store.append_version(id, &snap("old")).unwrap();
        store.put_note(id, &snap("new")).unwrap();

        store.restore_version(id, 1).unwrap();
        assert_eq!(store.note(id).unwrap().content, "old");
    }

    #[test]
    fn test_version_snapshot_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let id = Uuid::new_v4();
        let big = "lorem ipsum ".repeat(1000);
        store.append_version(id, &snap(&big)).unwrap();

        let cf = store.cf(CF_VERSIONS).unwrap();
        let raw = store.db.get_cf(cf, version_key(id, 1)).unwrap().unwrap();
        assert!(raw.len() < big.len() / 4, "stored {} bytes", raw.len());
        assert_eq!(store.version(id, 1).unwrap().snapshot.content, big);
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        {
            let store = open(&dir);
            store.put_note(id, &snap("durable")).unwrap();
            store.append_version(id, &snap("durable")).unwrap();
            store.sync().unwrap();
        }
        let store = open(&dir);
        assert_eq!(store.note(id).unwrap().content, "durable");
        assert_eq!(store.append_version(id, &snap("next")).unwrap().version_number, 2);
    }
}
