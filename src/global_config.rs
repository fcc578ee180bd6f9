// Copyright 2024 TiKV Project Authors. Licensed under Apache-2.0.

//! The global-config mediator: transactional put/get/watch over a small key
//! prefix of the external store. Values are opaque payload bytes; the legacy
//! string `value` field is still honored on writes for old clients.

use futures::stream::BoxStream;
use kvproto::pdpb::{EventType, GlobalConfigItem};

use crate::{PdFuture, Result, GLOBAL_CONFIG_PATH};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetaOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    Put {
        key: String,
        value: Vec<u8>,
    },
    /// Carries the previous value when the store still has it; a compacted
    /// previous value means a duplicated delete and is skipped.
    Delete {
        key: String,
        prev_value: Option<Vec<u8>>,
    },
}

#[derive(Clone, Debug, Default)]
pub struct WatchBatch {
    pub events: Vec<WatchEvent>,
    pub revision: i64,
}

/// The transactional key-value store backing the global-config key space
/// (an external collaborator; etcd in the original deployment).
pub trait MetaStore: Send + Sync {
    /// Applies all operations in one transaction.
    fn txn(&self, ops: Vec<MetaOp>) -> PdFuture<()>;
    fn get(&self, key: &str) -> PdFuture<Option<Vec<u8>>>;
    /// Lists the prefix along with the store revision of the snapshot.
    fn get_prefix(&self, prefix: &str) -> PdFuture<(Vec<KeyValue>, i64)>;
    /// Streams change batches from `revision` onward. A compaction newer
    /// than `revision` surfaces as `Error::DataCompacted` and ends the
    /// stream.
    fn watch(&self, prefix: &str, revision: i64) -> BoxStream<'static, Result<WatchBatch>>;
}

/// Resolves the config path of a request, defaulting to the well-known
/// prefix.
pub fn config_path(requested: &str) -> &str {
    if requested.is_empty() {
        GLOBAL_CONFIG_PATH
    } else {
        requested
    }
}

/// Joins a config path and a name without doubling separators.
pub fn join_path(path: &str, name: &str) -> String {
    format!("{}/{}", path.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Translates request items into store operations. Old clients ship the
/// string `value` field; newer ones the payload bytes.
pub fn changes_to_ops(path: &str, changes: &[GlobalConfigItem]) -> Vec<MetaOp> {
    changes
        .iter()
        .map(|item| {
            let key = join_path(path, item.get_name());
            match item.get_kind() {
                EventType::Put => {
                    let value = if !item.get_value().is_empty() {
                        item.get_value().as_bytes().to_vec()
                    } else {
                        item.get_payload().to_vec()
                    };
                    MetaOp::Put { key, value }
                }
                EventType::Delete => MetaOp::Delete { key },
            }
        })
        .collect()
}

/// Renders one loaded key-value as a wire item.
pub fn kv_to_item(kv: KeyValue) -> GlobalConfigItem {
    let mut item = GlobalConfigItem::default();
    item.set_kind(EventType::Put);
    item.set_name(kv.key);
    item.set_payload(kv.value);
    item
}

/// Renders a watch batch as wire items; duplicated deletes whose previous
/// value was compacted are dropped.
pub fn events_to_items(events: Vec<WatchEvent>) -> Vec<GlobalConfigItem> {
    let mut items = Vec::with_capacity(events.len());
    for event in events {
        match event {
            WatchEvent::Put { key, value } => {
                let mut item = GlobalConfigItem::default();
                item.set_kind(EventType::Put);
                item.set_name(key);
                item.set_payload(value);
                items.push(item);
            }
            WatchEvent::Delete { key, prev_value } => match prev_value {
                Some(value) => {
                    let mut item = GlobalConfigItem::default();
                    item.set_kind(EventType::Delete);
                    item.set_name(key);
                    item.set_payload(value);
                    items.push(item);
                }
                None => {
                    info!("previous key-value pair has been compacted"; "required-key" => key);
                }
            },
        }
    }
    items
}

/// Stores all changes under one transaction.
pub async fn store_global_config(
    store: &dyn MetaStore,
    path: &str,
    changes: &[GlobalConfigItem],
) -> Result<()> {
    store.txn(changes_to_ops(path, changes)).await
}

#[cfg(test)]
mod tests {
    use futures::executor::block_on;
    use futures::StreamExt;

    use crate::testing::MemStore;
    use crate::Error;

    use super::*;

    fn put_item(name: &str, payload: &[u8]) -> GlobalConfigItem {
        let mut item = GlobalConfigItem::default();
        item.set_kind(EventType::Put);
        item.set_name(name.to_owned());
        item.set_payload(payload.to_vec());
        item
    }

    fn delete_item(name: &str) -> GlobalConfigItem {
        let mut item = GlobalConfigItem::default();
        item.set_kind(EventType::Delete);
        item.set_name(name.to_owned());
        item
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/global/config/", "a"), "/global/config/a");
        assert_eq!(join_path("/global/config", "a"), "/global/config/a");
        assert_eq!(join_path("/custom", "/a/b"), "/custom/a/b");
        assert_eq!(config_path(""), GLOBAL_CONFIG_PATH);
        assert_eq!(config_path("/custom"), "/custom");
    }

    #[test]
    fn test_value_takes_precedence_over_payload() {
        let mut item = put_item("a", b"payload");
        item.set_value("value".to_owned());
        let ops = changes_to_ops("/global/config", &[item]);
        assert_eq!(
            ops,
            vec![MetaOp::Put {
                key: "/global/config/a".to_owned(),
                value: b"value".to_vec()
            }]
        );
    }

    #[test]
    fn test_store_and_load() {
        block_on(async {
            let store = MemStore::default();
            store_global_config(
                &store,
                GLOBAL_CONFIG_PATH,
                &[put_item("a", b"1"), put_item("b", b"2")],
            )
            .await
            .unwrap();
            store_global_config(&store, GLOBAL_CONFIG_PATH, &[delete_item("a")])
                .await
                .unwrap();

            let value = store.get(&join_path(GLOBAL_CONFIG_PATH, "b")).await.unwrap();
            assert_eq!(value, Some(b"2".to_vec()));
            assert_eq!(
                store.get(&join_path(GLOBAL_CONFIG_PATH, "a")).await.unwrap(),
                None
            );

            let (kvs, revision) = store.get_prefix(GLOBAL_CONFIG_PATH).await.unwrap();
            assert_eq!(kvs.len(), 1);
            assert!(revision > 0);
        });
    }

    #[test]
    fn test_watch_streams_changes() {
        block_on(async {
            let store = MemStore::default();
            let mut watch = store.watch(GLOBAL_CONFIG_PATH, 1);
            store_global_config(&store, GLOBAL_CONFIG_PATH, &[put_item("a", b"1")])
                .await
                .unwrap();
            let batch = watch.next().await.unwrap().unwrap();
            assert_eq!(batch.events.len(), 1);
            match &batch.events[0] {
                WatchEvent::Put { key, value } => {
                    assert_eq!(key, "/global/config/a");
                    assert_eq!(value, b"1");
                }
                other => panic!("unexpected {:?}", other),
            }

            store_global_config(&store, GLOBAL_CONFIG_PATH, &[delete_item("a")])
                .await
                .unwrap();
            let batch = watch.next().await.unwrap().unwrap();
            match &batch.events[0] {
                WatchEvent::Delete { prev_value, .. } => {
                    assert_eq!(prev_value.as_deref(), Some(&b"1"[..]))
                }
                other => panic!("unexpected {:?}", other),
            }
        });
    }

    #[test]
    fn test_failed_transaction_surfaces() {
        block_on(async {
            let store = MemStore::default();
            store.fail_next_txn();
            match store_global_config(&store, GLOBAL_CONFIG_PATH, &[put_item("a", b"1")]).await {
                Err(Error::TransactionFailed) => {}
                other => panic!("unexpected {:?}", other),
            }
            // Nothing was applied.
            assert_eq!(
                store.get(&join_path(GLOBAL_CONFIG_PATH, "a")).await.unwrap(),
                None
            );
        });
    }

    #[test]
    fn test_watch_reports_compaction() {
        block_on(async {
            let store = MemStore::default();
            store.compact(10);
            let mut watch = store.watch(GLOBAL_CONFIG_PATH, 1);
            match watch.next().await.unwrap() {
                Err(Error::DataCompacted { required, compact }) => {
                    assert_eq!(required, 1);
                    assert_eq!(compact, 10);
                }
                other => panic!("unexpected {:?}", other),
            }
            assert!(watch.next().await.is_none());
        });
    }

    #[test]
    fn test_dropped_compacted_delete() {
        let items = events_to_items(vec![
            WatchEvent::Put {
                key: "k".to_owned(),
                value: b"v".to_vec(),
            },
            WatchEvent::Delete {
                key: "gone".to_owned(),
                prev_value: None,
            },
        ]);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].get_name(), "k");
    }
}
