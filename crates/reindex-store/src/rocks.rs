//! RocksDB-backed key/value store.
//!
//! Every command runs under one write lock and every mutation lands as a
//! single `WriteBatch`, so a command is atomic with respect to readers and
//! to a crash. There is no pipeline transport.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::info;

use crate::column_families::{
    build_cf_descriptors, CF_HASHES, CF_KEYS, CF_LISTS, CF_SETS, CF_STRINGS,
};
use crate::error::StoreError;
use crate::kv::{count_reply, normalize_range, Command, KvStore, Reply};
use crate::memory::parse_int;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
    Str,
    List,
    Set,
    Hash,
}

impl KeyKind {
    fn as_str(self) -> &'static str {
        match self {
            KeyKind::Str => "string",
            KeyKind::List => "list",
            KeyKind::Set => "set",
            KeyKind::Hash => "hash",
        }
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes {
            b"string" => Some(KeyKind::Str),
            b"list" => Some(KeyKind::List),
            b"set" => Some(KeyKind::Set),
            b"hash" => Some(KeyKind::Hash),
            _ => None,
        }
    }
}

fn member_prefix(key: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(key.len() + 1);
    prefix.extend_from_slice(key.as_bytes());
    prefix.push(0);
    prefix
}

fn member_key(key: &str, member: &str) -> Vec<u8> {
    let mut bytes = member_prefix(key);
    bytes.extend_from_slice(member.as_bytes());
    bytes
}

fn check_key(key: &str) -> Result<(), StoreError> {
    if key.as_bytes().contains(&0) {
        return Err(StoreError::InvalidArgument(format!(
            "key {:?} contains a NUL byte",
            key
        )));
    }
    Ok(())
}

fn utf8(bytes: &[u8]) -> Result<String, StoreError> {
    String::from_utf8(bytes.to_vec()).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Durable key/value store on RocksDB.
pub struct RocksKvStore {
    db: DB,
    write_lock: Mutex<()>,
}

impl RocksKvStore {
    /// Open the store at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        info!("Opening key/value store at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let db = DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::ColumnFamilyNotFound(name.to_string()))
    }

    fn kind_of(&self, key: &str) -> Result<Option<KeyKind>, StoreError> {
        let keys_cf = self.cf(CF_KEYS)?;
        Ok(self
            .db
            .get_cf(keys_cf, key.as_bytes())?
            .and_then(|raw| KeyKind::from_bytes(&raw)))
    }

    /// Ok(true) if the key holds `kind`, Ok(false) if absent.
    fn expect_kind(&self, key: &str, kind: KeyKind) -> Result<bool, StoreError> {
        match self.kind_of(key)? {
            None => Ok(false),
            Some(found) if found == kind => Ok(true),
            Some(_) => Err(StoreError::WrongType(key.to_string())),
        }
    }

    /// Members (set) or fields (hash) of a compound key, in byte order.
    fn scan_members(&self, cf_name: &str, key: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let cf = self.cf(cf_name)?;
        let prefix = member_prefix(key);
        let mut members = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward))
        {
            let (raw_key, value) = item?;
            if !raw_key.starts_with(&prefix) {
                break;
            }
            members.push((utf8(&raw_key[prefix.len()..])?, value.to_vec()));
        }
        Ok(members)
    }

    fn read_list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        if !self.expect_kind(key, KeyKind::List)? {
            return Ok(Vec::new());
        }
        let lists_cf = self.cf(CF_LISTS)?;
        match self.db.get_cf(lists_cf, key.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    /// Queue removal of a key and all of its data.
    fn clear_key(&self, batch: &mut WriteBatch, key: &str, kind: KeyKind) -> Result<(), StoreError> {
        batch.delete_cf(self.cf(CF_KEYS)?, key.as_bytes());
        match kind {
            KeyKind::Str => batch.delete_cf(self.cf(CF_STRINGS)?, key.as_bytes()),
            KeyKind::List => batch.delete_cf(self.cf(CF_LISTS)?, key.as_bytes()),
            KeyKind::Set | KeyKind::Hash => {
                let cf_name = if kind == KeyKind::Set { CF_SETS } else { CF_HASHES };
                let cf = self.cf(cf_name)?;
                for (member, _) in self.scan_members(cf_name, key)? {
                    batch.delete_cf(cf, member_key(key, &member));
                }
            }
        }
        Ok(())
    }

    fn register(&self, batch: &mut WriteBatch, key: &str, kind: KeyKind) -> Result<(), StoreError> {
        batch.put_cf(self.cf(CF_KEYS)?, key.as_bytes(), kind.as_str().as_bytes());
        Ok(())
    }

    fn write_list(&self, key: &str, list: &[String]) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        if list.is_empty() {
            self.clear_key(&mut batch, key, KeyKind::List)?;
        } else {
            self.register(&mut batch, key, KeyKind::List)?;
            batch.put_cf(self.cf(CF_LISTS)?, key.as_bytes(), serde_json::to_vec(list)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn execute(&self, command: Command) -> Result<Reply, StoreError> {
        let _guard = self.lock()?;
        match command {
            Command::Ping => Ok(Reply::Ok),
            Command::Get { key } => {
                check_key(&key)?;
                if !self.expect_kind(&key, KeyKind::Str)? {
                    return Ok(Reply::Nil);
                }
                match self.db.get_cf(self.cf(CF_STRINGS)?, key.as_bytes())? {
                    Some(raw) => Ok(Reply::Str(utf8(&raw)?)),
                    None => Ok(Reply::Nil),
                }
            }
            Command::Set { key, value } => {
                check_key(&key)?;
                let mut batch = WriteBatch::default();
                if let Some(kind) = self.kind_of(&key)? {
                    if kind != KeyKind::Str {
                        self.clear_key(&mut batch, &key, kind)?;
                    }
                }
                self.register(&mut batch, &key, KeyKind::Str)?;
                batch.put_cf(self.cf(CF_STRINGS)?, key.as_bytes(), value.as_bytes());
                self.db.write(batch)?;
                Ok(Reply::Ok)
            }
            Command::IncrBy { key, delta } => {
                check_key(&key)?;
                let strings_cf = self.cf(CF_STRINGS)?;
                let current = if self.expect_kind(&key, KeyKind::Str)? {
                    match self.db.get_cf(strings_cf, key.as_bytes())? {
                        Some(raw) => parse_int(&key, &utf8(&raw)?)?,
                        None => 0,
                    }
                } else {
                    0
                };
                let next = current.checked_add(delta).ok_or_else(|| {
                    StoreError::InvalidArgument(format!("increment overflows key '{}'", key))
                })?;
                let mut batch = WriteBatch::default();
                self.register(&mut batch, &key, KeyKind::Str)?;
                batch.put_cf(strings_cf, key.as_bytes(), next.to_string().as_bytes());
                self.db.write(batch)?;
                Ok(Reply::Int(next))
            }
            Command::Exists { key } => {
                check_key(&key)?;
                Ok(Reply::Bool(self.kind_of(&key)?.is_some()))
            }
            Command::Delete { keys } => {
                let mut batch = WriteBatch::default();
                let mut removed = 0;
                for key in &keys {
                    check_key(key)?;
                    if let Some(kind) = self.kind_of(key)? {
                        self.clear_key(&mut batch, key, kind)?;
                        removed += 1;
                    }
                }
                self.db.write(batch)?;
                Ok(count_reply(removed))
            }
            Command::Keys { prefix } => {
                let keys_cf = self.cf(CF_KEYS)?;
                let mut keys = Vec::new();
                for item in self.db.iterator_cf(
                    keys_cf,
                    IteratorMode::From(prefix.as_bytes(), Direction::Forward),
                ) {
                    let (raw_key, _) = item?;
                    if !raw_key.starts_with(prefix.as_bytes()) {
                        break;
                    }
                    keys.push(utf8(&raw_key)?);
                }
                Ok(Reply::List(keys))
            }
            Command::LPush { key, values } => {
                check_key(&key)?;
                let mut list = self.read_list(&key)?;
                for value in values {
                    list.insert(0, value);
                }
                self.write_list(&key, &list)?;
                Ok(count_reply(list.len()))
            }
            Command::LPop { key } => {
                check_key(&key)?;
                let mut list = self.read_list(&key)?;
                if list.is_empty() {
                    return Ok(Reply::Nil);
                }
                let value = list.remove(0);
                self.write_list(&key, &list)?;
                Ok(Reply::Str(value))
            }
            Command::LLen { key } => {
                check_key(&key)?;
                Ok(count_reply(self.read_list(&key)?.len()))
            }
            Command::LRange { key, start, stop } => {
                check_key(&key)?;
                let list = self.read_list(&key)?;
                let values = match normalize_range(list.len(), start, stop) {
                    Some((from, to)) => list[from..=to].to_vec(),
                    None => Vec::new(),
                };
                Ok(Reply::List(values))
            }
            Command::LTrim { key, start, stop } => {
                check_key(&key)?;
                if !self.expect_kind(&key, KeyKind::List)? {
                    return Ok(Reply::Ok);
                }
                let list = self.read_list(&key)?;
                let kept = match normalize_range(list.len(), start, stop) {
                    Some((from, to)) => list[from..=to].to_vec(),
                    None => Vec::new(),
                };
                self.write_list(&key, &kept)?;
                Ok(Reply::Ok)
            }
            Command::SAdd { key, members } => {
                check_key(&key)?;
                self.expect_kind(&key, KeyKind::Set)?;
                let sets_cf = self.cf(CF_SETS)?;
                let mut batch = WriteBatch::default();
                let mut seen = HashSet::new();
                let mut added = 0;
                for member in &members {
                    let raw = member_key(&key, member);
                    if seen.insert(member.as_str()) && self.db.get_cf(sets_cf, &raw)?.is_none() {
                        batch.put_cf(sets_cf, &raw, b"");
                        added += 1;
                    }
                }
                if !members.is_empty() {
                    self.register(&mut batch, &key, KeyKind::Set)?;
                }
                self.db.write(batch)?;
                Ok(count_reply(added))
            }
            Command::SPop { key, count } => {
                check_key(&key)?;
                if !self.expect_kind(&key, KeyKind::Set)? {
                    return Ok(Reply::List(Vec::new()));
                }
                let sets_cf = self.cf(CF_SETS)?;
                let members = self.scan_members(CF_SETS, &key)?;
                let total = members.len();
                let mut batch = WriteBatch::default();
                let popped: Vec<String> = members
                    .into_iter()
                    .take(count)
                    .map(|(member, _)| member)
                    .collect();
                for member in &popped {
                    batch.delete_cf(sets_cf, member_key(&key, member));
                }
                if popped.len() == total {
                    batch.delete_cf(self.cf(CF_KEYS)?, key.as_bytes());
                }
                self.db.write(batch)?;
                Ok(Reply::List(popped))
            }
            Command::SCard { key } => {
                check_key(&key)?;
                if !self.expect_kind(&key, KeyKind::Set)? {
                    return Ok(count_reply(0));
                }
                Ok(count_reply(self.scan_members(CF_SETS, &key)?.len()))
            }
            Command::HSet { key, fields } => {
                check_key(&key)?;
                self.expect_kind(&key, KeyKind::Hash)?;
                let hashes_cf = self.cf(CF_HASHES)?;
                let mut batch = WriteBatch::default();
                let mut added = 0;
                for (field, value) in &fields {
                    let raw = member_key(&key, field);
                    if self.db.get_cf(hashes_cf, &raw)?.is_none() {
                        added += 1;
                    }
                    batch.put_cf(hashes_cf, &raw, value.as_bytes());
                }
                if !fields.is_empty() {
                    self.register(&mut batch, &key, KeyKind::Hash)?;
                }
                self.db.write(batch)?;
                Ok(count_reply(added))
            }
            Command::HGetAll { key } => {
                check_key(&key)?;
                if !self.expect_kind(&key, KeyKind::Hash)? {
                    return Ok(Reply::Map(BTreeMap::new()));
                }
                let mut fields = BTreeMap::new();
                for (field, value) in self.scan_members(CF_HASHES, &key)? {
                    fields.insert(field, utf8(&value)?);
                }
                Ok(Reply::Map(fields))
            }
        }
    }
}

#[async_trait]
impl KvStore for RocksKvStore {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    async fn call(&self, command: Command) -> Result<Reply, StoreError> {
        self.execute(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_families::ALL_CF_NAMES;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksKvStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = RocksKvStore::open(temp_dir.path()).unwrap();
        (store, temp_dir)
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_open_creates_column_families() {
        let (store, _temp) = create_test_store();
        for cf_name in ALL_CF_NAMES {
            assert!(
                store.db.cf_handle(cf_name).is_some(),
                "CF {} should exist",
                cf_name
            );
        }
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = RocksKvStore::open(temp_dir.path()).unwrap();
            store.incr_by("q:bm:bid", 3).await.unwrap();
            store.lpush("q", &strings(&["a", "b"])).await.unwrap();
            store.sadd("s", &strings(&["x"])).await.unwrap();
        }
        let store = RocksKvStore::open(temp_dir.path()).unwrap();
        assert_eq!(store.get("q:bm:bid").await.unwrap().as_deref(), Some("3"));
        assert_eq!(store.lrange("q", 0, -1).await.unwrap(), strings(&["b", "a"]));
        assert_eq!(store.scard("s").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_semantics_match_memory_store() {
        let (store, _temp) = create_test_store();
        store.lpush("l", &strings(&["1", "2", "3"])).await.unwrap();
        assert_eq!(store.llen("l").await.unwrap(), 3);
        assert_eq!(store.lpop("l").await.unwrap().as_deref(), Some("3"));
        store.ltrim("l", 0, 0).await.unwrap();
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), strings(&["2"]));
        assert_eq!(store.lpop("l").await.unwrap().as_deref(), Some("2"));
        assert!(!store.exists("l").await.unwrap());
    }

    #[tokio::test]
    async fn test_sets_and_hashes() {
        let (store, _temp) = create_test_store();
        assert_eq!(store.sadd("s", &strings(&["a", "b", "a"])).await.unwrap(), 2);
        assert_eq!(store.spop("s", 1).await.unwrap().len(), 1);
        assert_eq!(store.scard("s").await.unwrap(), 1);
        assert_eq!(store.spop("s", 5).await.unwrap().len(), 1);
        assert!(!store.exists("s").await.unwrap());

        let mut fields = BTreeMap::new();
        fields.insert("state".to_string(), "state_init".to_string());
        assert_eq!(store.hset("h", &fields).await.unwrap(), 1);
        assert_eq!(store.hgetall("h").await.unwrap(), fields);
    }

    #[tokio::test]
    async fn test_delete_and_keys() {
        let (store, _temp) = create_test_store();
        store.set("q:bm:ca", "1").await.unwrap();
        store.sadd("q:bm:batches", &strings(&["1"])).await.unwrap();
        store.set("z", "1").await.unwrap();
        let keys = store.keys("q:bm:").await.unwrap();
        assert_eq!(keys, strings(&["q:bm:batches", "q:bm:ca"]));
        assert_eq!(store.delete(&keys).await.unwrap(), 2);
        assert!(store.keys("q:").await.unwrap().is_empty());
        assert_eq!(store.scard("q:bm:batches").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_wrong_type_and_bad_key() {
        let (store, _temp) = create_test_store();
        store.set("k", "v").await.unwrap();
        assert!(matches!(
            store.sadd("k", &strings(&["a"])).await,
            Err(StoreError::WrongType(_))
        ));
        assert!(matches!(
            store.get("bad\0key").await,
            Err(StoreError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_pipeline_unsupported() {
        let (store, _temp) = create_test_store();
        let err = store.pipeline(vec![Command::Ping]).await.unwrap_err();
        assert!(matches!(err, StoreError::Unsupported(ref op) if op == "pipeline"));
    }
}
