//! In-process key/value store.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::kv::{count_reply, normalize_range, Command, KvStore, Reply};

#[derive(Debug, Clone)]
enum Entry {
    Str(String),
    List(VecDeque<String>),
    Set(HashSet<String>),
    Hash(BTreeMap<String, String>),
}

impl Entry {
    fn is_empty(&self) -> bool {
        match self {
            Entry::Str(_) => false,
            Entry::List(list) => list.is_empty(),
            Entry::Set(set) => set.is_empty(),
            Entry::Hash(hash) => hash.is_empty(),
        }
    }
}

/// The data behind a [`MemoryKvStore`].
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

macro_rules! typed_mut {
    ($self:ident, $key:expr, $variant:ident, $init:expr) => {{
        let entry = $self
            .entries
            .entry($key.clone())
            .or_insert_with(|| Entry::$variant($init));
        match entry {
            Entry::$variant(inner) => inner,
            _ => return Err(StoreError::WrongType($key.clone())),
        }
    }};
}

impl Keyspace {
    fn apply(&mut self, command: Command) -> Result<Reply, StoreError> {
        match command {
            Command::Ping => Ok(Reply::Ok),
            Command::Get { key } => match self.entries.get(&key) {
                None => Ok(Reply::Nil),
                Some(Entry::Str(value)) => Ok(Reply::Str(value.clone())),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::Set { key, value } => {
                self.entries.insert(key, Entry::Str(value));
                Ok(Reply::Ok)
            }
            Command::IncrBy { key, delta } => {
                let current = match self.entries.get(&key) {
                    None => 0,
                    Some(Entry::Str(value)) => parse_int(&key, value)?,
                    Some(_) => return Err(StoreError::WrongType(key)),
                };
                let next = current.checked_add(delta).ok_or_else(|| {
                    StoreError::InvalidArgument(format!("increment overflows key '{}'", key))
                })?;
                self.entries.insert(key, Entry::Str(next.to_string()));
                Ok(Reply::Int(next))
            }
            Command::Exists { key } => Ok(Reply::Bool(self.entries.contains_key(&key))),
            Command::Delete { keys } => {
                let removed = keys
                    .iter()
                    .filter(|key| self.entries.remove(*key).is_some())
                    .count();
                Ok(count_reply(removed))
            }
            Command::Keys { prefix } => {
                let mut keys: Vec<String> = self
                    .entries
                    .keys()
                    .filter(|key| key.starts_with(&prefix))
                    .cloned()
                    .collect();
                keys.sort();
                Ok(Reply::List(keys))
            }
            Command::LPush { key, values } => {
                let list = typed_mut!(self, key, List, VecDeque::new());
                for value in values {
                    list.push_front(value);
                }
                let len = list.len();
                self.drop_if_empty(&key);
                Ok(count_reply(len))
            }
            Command::LPop { key } => {
                let value = match self.entries.get_mut(&key) {
                    None => None,
                    Some(Entry::List(list)) => list.pop_front(),
                    Some(_) => return Err(StoreError::WrongType(key)),
                };
                self.drop_if_empty(&key);
                Ok(value.map(Reply::Str).unwrap_or(Reply::Nil))
            }
            Command::LLen { key } => match self.entries.get(&key) {
                None => Ok(count_reply(0)),
                Some(Entry::List(list)) => Ok(count_reply(list.len())),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::LRange { key, start, stop } => match self.entries.get(&key) {
                None => Ok(Reply::List(Vec::new())),
                Some(Entry::List(list)) => {
                    let values = match normalize_range(list.len(), start, stop) {
                        Some((from, to)) => list.range(from..=to).cloned().collect(),
                        None => Vec::new(),
                    };
                    Ok(Reply::List(values))
                }
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::LTrim { key, start, stop } => {
                match self.entries.get_mut(&key) {
                    None => {}
                    Some(Entry::List(list)) => match normalize_range(list.len(), start, stop) {
                        Some((from, to)) => {
                            list.truncate(to + 1);
                            list.drain(..from);
                        }
                        None => list.clear(),
                    },
                    Some(_) => return Err(StoreError::WrongType(key)),
                }
                self.drop_if_empty(&key);
                Ok(Reply::Ok)
            }
            Command::SAdd { key, members } => {
                let set = typed_mut!(self, key, Set, HashSet::new());
                let added = members.into_iter().filter(|m| set.insert(m.clone())).count();
                self.drop_if_empty(&key);
                Ok(count_reply(added))
            }
            Command::SPop { key, count } => {
                let popped: Vec<String> = match self.entries.get_mut(&key) {
                    None => Vec::new(),
                    Some(Entry::Set(set)) => {
                        let chosen: Vec<String> = set.iter().take(count).cloned().collect();
                        for member in &chosen {
                            set.remove(member);
                        }
                        chosen
                    }
                    Some(_) => return Err(StoreError::WrongType(key)),
                };
                self.drop_if_empty(&key);
                Ok(Reply::List(popped))
            }
            Command::SCard { key } => match self.entries.get(&key) {
                None => Ok(count_reply(0)),
                Some(Entry::Set(set)) => Ok(count_reply(set.len())),
                Some(_) => Err(StoreError::WrongType(key)),
            },
            Command::HSet { key, fields } => {
                let hash = typed_mut!(self, key, Hash, BTreeMap::new());
                let added = fields
                    .into_iter()
                    .filter(|(field, value)| hash.insert(field.clone(), value.clone()).is_none())
                    .count();
                self.drop_if_empty(&key);
                Ok(count_reply(added))
            }
            Command::HGetAll { key } => match self.entries.get(&key) {
                None => Ok(Reply::Map(BTreeMap::new())),
                Some(Entry::Hash(hash)) => Ok(Reply::Map(hash.clone())),
                Some(_) => Err(StoreError::WrongType(key)),
            },
        }
    }

    fn drop_if_empty(&mut self, key: &str) {
        if self.entries.get(key).is_some_and(Entry::is_empty) {
            self.entries.remove(key);
        }
    }
}

pub(crate) fn parse_int(key: &str, value: &str) -> Result<i64, StoreError> {
    value.parse().map_err(|_| {
        StoreError::InvalidArgument(format!("value at '{}' is not an integer", key))
    })
}

/// Key/value store held in process memory.
///
/// Supports pipelines; a pipeline runs under one lock acquisition so no
/// other caller observes it half-applied.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    keyspace: Mutex<Keyspace>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Keyspace>, StoreError> {
        self.keyspace
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn call(&self, command: Command) -> Result<Reply, StoreError> {
        self.lock()?.apply(command)
    }

    async fn pipeline(&self, commands: Vec<Command>) -> Result<Vec<Reply>, StoreError> {
        let mut keyspace = self.lock()?;
        Ok(commands
            .into_iter()
            .map(|command| Reply::from_result(keyspace.apply(command)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_strings_and_counters() {
        let store = MemoryKvStore::new();
        assert_eq!(store.get("a").await.unwrap(), None);
        store.set("a", "1").await.unwrap();
        assert_eq!(store.incr_by("a", 4).await.unwrap(), 5);
        assert_eq!(store.incr_by("missing", -2).await.unwrap(), -2);
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("5"));

        store.set("text", "abc").await.unwrap();
        let err = store.incr_by("text", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_lpush_is_head_insert() {
        let store = MemoryKvStore::new();
        assert_eq!(store.lpush("l", &strings(&["a", "b"])).await.unwrap(), 2);
        assert_eq!(store.lpush("l", &strings(&["c"])).await.unwrap(), 3);
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), strings(&["c", "b", "a"]));
        assert_eq!(store.lpop("l").await.unwrap().as_deref(), Some("c"));
        assert_eq!(store.llen("l").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_ltrim_and_empty_removal() {
        let store = MemoryKvStore::new();
        store.lpush("l", &strings(&["1", "2", "3", "4"])).await.unwrap();
        store.ltrim("l", 0, 1).await.unwrap();
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), strings(&["4", "3"]));

        store.ltrim("l", 5, 10).await.unwrap();
        assert!(!store.exists("l").await.unwrap());
        assert_eq!(store.lpop("l").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryKvStore::new();
        assert_eq!(store.sadd("s", &strings(&["a", "b", "a"])).await.unwrap(), 2);
        assert_eq!(store.sadd("s", &strings(&["b", "c"])).await.unwrap(), 1);
        assert_eq!(store.scard("s").await.unwrap(), 3);

        let mut popped = store.spop("s", 10).await.unwrap();
        popped.sort();
        assert_eq!(popped, strings(&["a", "b", "c"]));
        assert!(!store.exists("s").await.unwrap());
    }

    #[tokio::test]
    async fn test_hashes() {
        let store = MemoryKvStore::new();
        let mut fields = BTreeMap::new();
        fields.insert("x".to_string(), "1".to_string());
        fields.insert("y".to_string(), "2".to_string());
        assert_eq!(store.hset("h", &fields).await.unwrap(), 2);

        fields.insert("y".to_string(), "3".to_string());
        assert_eq!(store.hset("h", &fields).await.unwrap(), 0);
        let all = store.hgetall("h").await.unwrap();
        assert_eq!(all.get("y").map(String::as_str), Some("3"));
        assert!(store.hgetall("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryKvStore::new();
        store.set("k", "v").await.unwrap();
        assert!(matches!(
            store.lpush("k", &strings(&["a"])).await,
            Err(StoreError::WrongType(_))
        ));
        assert!(matches!(store.scard("k").await, Err(StoreError::WrongType(_))));
        // failed push must not have replaced the string
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_keys_and_delete() {
        let store = MemoryKvStore::new();
        store.set("q:bm:ca", "0").await.unwrap();
        store.set("q:bm:cs", "0").await.unwrap();
        store.set("other", "0").await.unwrap();
        let keys = store.keys("q:bm:").await.unwrap();
        assert_eq!(keys, strings(&["q:bm:ca", "q:bm:cs"]));
        assert_eq!(store.delete(&keys).await.unwrap(), 2);
        assert_eq!(store.delete(&keys).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pipeline_reports_errors_per_command() {
        let store = MemoryKvStore::new();
        store.set("str", "v").await.unwrap();
        let replies = store
            .pipeline(vec![
                Command::LPush {
                    key: "l".to_string(),
                    values: strings(&["a"]),
                },
                Command::LPush {
                    key: "str".to_string(),
                    values: strings(&["a"]),
                },
                Command::LLen { key: "l".to_string() },
            ])
            .await
            .unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0], Reply::Int(1));
        assert!(matches!(replies[1], Reply::Error { .. }));
        assert_eq!(replies[2], Reply::Int(1));
    }
}
