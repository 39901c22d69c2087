//! Node informer
//!
//! A reflector keeps every Node in memory for target selection and node name
//! lookups. Separately, [`NodeCache::eligibility_changed`] remembers which
//! nodes were last seen as eligible backends, so Node updates that do not
//! change the backend set (status heartbeats) do not trigger reconciles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::{
    api::Api,
    runtime::{
        reflector::{self, ObjectRef, Store},
        watcher, WatchStreamExt,
    },
    Client, ResourceExt,
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::instances::{node_is_eligible, NodeLookup};

pub struct NodeCache {
    store: Store<Node>,
    synced: AtomicBool,
    eligibility: Mutex<HashMap<String, bool>>,
}

impl NodeCache {
    fn new(store: Store<Node>) -> Self {
        Self {
            store,
            synced: AtomicBool::new(false),
            eligibility: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching Nodes in the background
    pub fn start(client: Client) -> Arc<Self> {
        let nodes: Api<Node> = Api::all(client);
        let (reader, writer) = reflector::store();
        let cache = Arc::new(Self::new(reader.clone()));

        tokio::spawn(async move {
            reflector::reflector(writer, watcher(nodes, watcher::Config::default()))
                .default_backoff()
                .touched_objects()
                .for_each(|event| async move {
                    if let Err(e) = event {
                        warn!("Node watch error: {:?}", e);
                    }
                })
                .await;
        });

        let synced = Arc::clone(&cache);
        tokio::spawn(async move {
            if reader.wait_until_ready().await.is_ok() {
                synced.synced.store(true, Ordering::Release);
                info!("Node informer synced");
            }
        });

        cache
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Every known Node; fails until the initial listing completed
    pub fn nodes(&self) -> Result<Vec<Node>> {
        if !self.is_synced() {
            return Err(Error::InformerNotSynced);
        }
        Ok(self.store.state().iter().map(|n| (**n).clone()).collect())
    }

    /// Record the node's eligibility, returning true if it differs from what
    /// was last recorded
    ///
    /// Deleting nodes are forgotten, as are nodes the informer no longer
    /// holds.
    pub fn eligibility_changed(&self, node: &Node) -> bool {
        let name = node.name_any();
        let mut seen = self.eligibility.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_synced() {
            seen.retain(|known, _| self.store.get(&ObjectRef::new(known)).is_some());
        }

        if node.metadata.deletion_timestamp.is_some() {
            let changed = seen.remove(&name) != Some(false);
            if changed {
                debug!(node = %name, "Node is being deleted");
            }
            return changed;
        }

        let eligible = node_is_eligible(node);
        let previous = seen.insert(name, eligible);
        let changed = previous != Some(eligible);
        if changed {
            debug!(node = %node.name_any(), eligible, "Node eligibility changed");
        }
        changed
    }
}

impl NodeLookup for NodeCache {
    fn get_node(&self, name: &str) -> Result<Option<Arc<Node>>> {
        if !self.is_synced() {
            return Err(Error::InformerNotSynced);
        }
        Ok(self.store.get(&ObjectRef::new(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::ObjectMeta;
    use kube::runtime::watcher::Event;

    fn node(name: &str, ready: bool) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.into()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".into(),
                    status: if ready { "True" } else { "False" }.into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn cache_with(nodes: &[Node]) -> NodeCache {
        let (reader, mut writer) = reflector::store();
        for n in nodes {
            writer.apply_watcher_event(&Event::Apply(n.clone()));
        }
        NodeCache::new(reader)
    }

    #[test]
    fn test_lookups_fail_until_synced() {
        let cache = cache_with(&[node("a", true)]);
        assert!(matches!(cache.nodes(), Err(Error::InformerNotSynced)));
        assert!(matches!(cache.get_node("a"), Err(Error::InformerNotSynced)));

        cache.synced.store(true, Ordering::Release);
        assert_eq!(cache.nodes().unwrap().len(), 1);
        assert!(cache.get_node("a").unwrap().is_some());
        assert!(cache.get_node("missing").unwrap().is_none());
    }

    #[test]
    fn test_eligibility_changed_ignores_heartbeats() {
        let cache = cache_with(&[]);
        assert!(cache.eligibility_changed(&node("a", true)));
        assert!(!cache.eligibility_changed(&node("a", true)));
        assert!(cache.eligibility_changed(&node("a", false)));
        assert!(cache.eligibility_changed(&node("a", true)));
    }

    #[test]
    fn test_deleting_node_is_forgotten() {
        let cache = cache_with(&[]);
        assert!(cache.eligibility_changed(&node("a", true)));

        let mut deleting = node("a", true);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(cache.eligibility_changed(&deleting));
        assert!(cache.eligibility.lock().unwrap().is_empty());

        // Losing a node that never served traffic changes nothing
        assert!(cache.eligibility_changed(&node("b", false)));
        let mut deleting = node("b", false);
        deleting.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(!cache.eligibility_changed(&deleting));
        assert!(cache.eligibility.lock().unwrap().is_empty());
    }

    #[test]
    fn test_nodes_gone_from_informer_are_pruned() {
        let cache = cache_with(&[node("a", true)]);
        cache.synced.store(true, Ordering::Release);

        // "b" was deleted without ever showing a deletion timestamp
        assert!(cache.eligibility_changed(&node("b", true)));
        assert!(cache.eligibility_changed(&node("a", true)));

        let seen = cache.eligibility.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen.get("a"), Some(&true));
    }
}
