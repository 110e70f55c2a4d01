//! The graph store contract consumed by the ingestion driver.
//!
//! Every operation is an idempotent upsert keyed by entity id (nodes) or by
//! `(source, target, property)` (edges), so re-submitting a batch after a
//! partial failure converges to the same graph.

use crate::error::SinkError;
use crate::models::{Entity, EntityKind, Relationship};
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait GraphSink: Send + Sync {
    /// Uniqueness constraints and lookup indexes; safe to call every run.
    async fn ensure_schema(&self) -> Result<(), SinkError>;

    /// Create-if-absent by id, else merge labels/descriptions per language.
    async fn upsert_entities(&self, entities: &[Entity]) -> Result<(), SinkError>;

    /// Create-if-absent edges, creating bare placeholder endpoints as needed.
    async fn upsert_relationships(&self, relationships: &[Relationship])
        -> Result<(), SinkError>;
}

#[async_trait]
impl<S: GraphSink + ?Sized> GraphSink for std::sync::Arc<S> {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        (**self).ensure_schema().await
    }

    async fn upsert_entities(&self, entities: &[Entity]) -> Result<(), SinkError> {
        (**self).upsert_entities(entities).await
    }

    async fn upsert_relationships(
        &self,
        relationships: &[Relationship],
    ) -> Result<(), SinkError> {
        (**self).upsert_relationships(relationships).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryNode {
    pub id: String,
    /// `None` while the node is only a placeholder
    pub kind: Option<EntityKind>,
    pub labels: BTreeMap<String, String>,
    pub descriptions: BTreeMap<String, String>,
    pub placeholder: bool,
    /// Logical clock value of the last write touching this node
    pub last_updated: u64,
}

impl MemoryNode {
    fn placeholder(id: &str, clock: u64) -> Self {
        Self {
            id: id.to_string(),
            kind: None,
            labels: BTreeMap::new(),
            descriptions: BTreeMap::new(),
            placeholder: true,
            last_updated: clock,
        }
    }
}

#[derive(Default)]
struct MemoryGraph {
    nodes: FxHashMap<String, MemoryNode>,
    edges: FxHashSet<Relationship>,
    clock: u64,
}

impl MemoryGraph {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn ensure_node(&mut self, id: &str) {
        if !self.nodes.contains_key(id) {
            let clock = self.tick();
            self.nodes
                .insert(id.to_string(), MemoryNode::placeholder(id, clock));
        }
    }
}

/// In-process graph with the same upsert semantics as the Neo4j sink.
///
/// Backs `--dry-run` and the test suite.
#[derive(Default)]
pub struct MemorySink {
    graph: Mutex<MemoryGraph>,
    schema_ready: AtomicBool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryGraph>, SinkError> {
        self.graph
            .lock()
            .map_err(|_| SinkError::Unavailable("memory graph lock poisoned".into()))
    }

    pub fn schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::Relaxed)
    }

    pub fn node(&self, id: &str) -> Option<MemoryNode> {
        self.lock().ok()?.nodes.get(id).cloned()
    }

    pub fn node_count(&self) -> usize {
        self.lock().map(|g| g.nodes.len()).unwrap_or(0)
    }

    pub fn placeholder_count(&self) -> usize {
        self.lock()
            .map(|g| g.nodes.values().filter(|n| n.placeholder).count())
            .unwrap_or(0)
    }

    pub fn edge_count(&self) -> usize {
        self.lock().map(|g| g.edges.len()).unwrap_or(0)
    }

    pub fn has_edge(&self, source: &str, target: &str, property: &str) -> bool {
        let key = Relationship {
            source_id: source.to_string(),
            target_id: target.to_string(),
            property_id: property.to_string(),
        };
        self.lock().map(|g| g.edges.contains(&key)).unwrap_or(false)
    }
}

#[async_trait]
impl GraphSink for MemorySink {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        self.schema_ready.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn upsert_entities(&self, entities: &[Entity]) -> Result<(), SinkError> {
        let mut graph = self.lock()?;
        for entity in entities {
            if entity.id.is_empty() {
                return Err(SinkError::Rejected("entity with empty id".into()));
            }
        }
        for entity in entities {
            let clock = graph.tick();
            let node = graph
                .nodes
                .entry(entity.id.clone())
                .or_insert_with(|| MemoryNode::placeholder(&entity.id, clock));
            node.kind = Some(entity.kind);
            node.labels.extend(entity.labels.clone());
            node.descriptions.extend(entity.descriptions.clone());
            node.placeholder = false;
            node.last_updated = clock;
        }
        Ok(())
    }

    async fn upsert_relationships(
        &self,
        relationships: &[Relationship],
    ) -> Result<(), SinkError> {
        let mut graph = self.lock()?;
        for rel in relationships {
            graph.ensure_node(&rel.source_id);
            graph.ensure_node(&rel.target_id);
            graph.edges.insert(rel.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str, labels: &[(&str, &str)]) -> Entity {
        Entity {
            id: id.to_string(),
            kind: EntityKind::Item,
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            descriptions: BTreeMap::new(),
            claims: Vec::new(),
        }
    }

    fn rel(source: &str, target: &str, property: &str) -> Relationship {
        Relationship {
            source_id: source.into(),
            target_id: target.into(),
            property_id: property.into(),
        }
    }

    #[tokio::test]
    async fn schema_setup_is_repeatable() {
        let sink = MemorySink::new();
        sink.ensure_schema().await.unwrap();
        sink.ensure_schema().await.unwrap();
        assert!(sink.schema_ready());
    }

    #[tokio::test]
    async fn entity_upsert_is_idempotent() {
        let sink = MemorySink::new();
        let batch = vec![entity("Q1", &[("en", "one")]), entity("Q2", &[])];
        sink.upsert_entities(&batch).await.unwrap();
        sink.upsert_entities(&batch).await.unwrap();

        assert_eq!(sink.node_count(), 2);
        assert_eq!(sink.node("Q1").unwrap().labels["en"], "one");
    }

    #[tokio::test]
    async fn merge_is_additive_per_language() {
        let sink = MemorySink::new();
        sink.upsert_entities(&[entity("Q1", &[("en", "one"), ("de", "eins")])])
            .await
            .unwrap();
        sink.upsert_entities(&[entity("Q1", &[("en", "One")])])
            .await
            .unwrap();
        sink.upsert_entities(&[entity("Q1", &[])]).await.unwrap();

        let node = sink.node("Q1").unwrap();
        assert_eq!(node.labels["en"], "One");
        assert_eq!(node.labels["de"], "eins");
    }

    #[tokio::test]
    async fn last_updated_refreshes() {
        let sink = MemorySink::new();
        sink.upsert_entities(&[entity("Q1", &[])]).await.unwrap();
        let first = sink.node("Q1").unwrap().last_updated;
        sink.upsert_entities(&[entity("Q1", &[])]).await.unwrap();
        assert!(sink.node("Q1").unwrap().last_updated > first);
    }

    #[tokio::test]
    async fn relationship_upsert_is_idempotent() {
        let sink = MemorySink::new();
        let rels = vec![rel("Q1", "Q2", "P31"), rel("Q1", "Q2", "P279")];
        sink.upsert_relationships(&rels).await.unwrap();
        sink.upsert_relationships(&rels).await.unwrap();
        assert_eq!(sink.edge_count(), 2);
        assert!(sink.has_edge("Q1", "Q2", "P31"));
    }

    #[tokio::test]
    async fn missing_target_becomes_placeholder_then_merges() {
        let sink = MemorySink::new();
        sink.upsert_entities(&[entity("Q1", &[("en", "one")])])
            .await
            .unwrap();
        sink.upsert_relationships(&[rel("Q1", "Q5", "P31")])
            .await
            .unwrap();

        let placeholder = sink.node("Q5").unwrap();
        assert!(placeholder.placeholder);
        assert!(placeholder.labels.is_empty());
        assert_eq!(placeholder.kind, None);

        sink.upsert_entities(&[entity("Q5", &[("en", "human")])])
            .await
            .unwrap();
        let merged = sink.node("Q5").unwrap();
        assert!(!merged.placeholder);
        assert_eq!(merged.labels["en"], "human");
        assert_eq!(sink.node_count(), 2);
        assert!(sink.has_edge("Q1", "Q5", "P31"));
    }

    #[tokio::test]
    async fn empty_id_rejected_without_partial_write() {
        let sink = MemorySink::new();
        let result = sink
            .upsert_entities(&[entity("Q1", &[]), entity("", &[])])
            .await;
        assert!(matches!(result, Err(SinkError::Rejected(_))));
        assert_eq!(sink.node_count(), 0);
    }
}
