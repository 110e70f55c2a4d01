use crate::config;
use crate::error::SinkError;
use crate::models::{Entity, Relationship};
use crate::sink::GraphSink;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use neo4rs::{query, BoltList, BoltMap, BoltString, BoltType, ConfigBuilder, Graph};
use tracing::{debug, info, warn};

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE CONSTRAINT entity_id_unique IF NOT EXISTS FOR (e:Entity) REQUIRE e.id IS UNIQUE",
    "CREATE CONSTRAINT property_id_unique IF NOT EXISTS FOR (p:Property) REQUIRE p.id IS UNIQUE",
    "CREATE INDEX entity_label IF NOT EXISTS FOR (e:Entity) ON (e.label)",
    "CREATE INDEX property_label IF NOT EXISTS FOR (p:Property) ON (p.label)",
];

/// Labels and descriptions land as `label_<lang>` / `description_<lang>` properties,
/// so `+=` adds and overwrites per language and never clears one.
const CYPHER_UPSERT_ENTITIES: &str = r#"UNWIND $rows AS row
MERGE (e:Entity {id: row.id})
SET e += row.props,
    e.type = row.kind,
    e.lastUpdated = datetime()
REMOVE e.placeholder
FOREACH (_ IN CASE WHEN row.kind = 'property' THEN [1] ELSE [] END | SET e:Property)"#;

/// Endpoints are MERGEd, so a target seen before its own record becomes a placeholder.
const CYPHER_UPSERT_RELATIONSHIPS: &str = r#"UNWIND $rows AS row
MERGE (s:Entity {id: row.source})
  ON CREATE SET s.placeholder = true
MERGE (t:Entity {id: row.target})
  ON CREATE SET t.placeholder = true
MERGE (s)-[r:HAS_PROPERTY {property: row.property}]->(t)
SET r.lastUpdated = datetime()"#;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    /// Server default database when `None`
    pub database: Option<String>,
    pub max_connections: usize,
}

impl SinkConfig {
    pub fn new(uri: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            user: user.into(),
            password: password.into(),
            database: None,
            max_connections: config::DEFAULT_MAX_CONNECTIONS,
        }
    }

    fn graph_config(&self) -> Result<neo4rs::Config> {
        if self.max_connections == 0 {
            bail!("max_connections must be at least 1");
        }
        let mut builder = ConfigBuilder::new()
            .uri(self.uri.as_str())
            .user(self.user.as_str())
            .password(self.password.as_str())
            .max_connections(self.max_connections);
        if let Some(db) = self.database.as_deref() {
            builder = builder.db(db);
        }
        builder
            .build()
            .with_context(|| format!("Invalid Neo4j configuration for {}", self.uri))
    }
}

pub struct Neo4jSink {
    graph: Graph,
}

impl Neo4jSink {
    pub async fn connect(config: &SinkConfig) -> Result<Self> {
        let graph = connect_with_retry(config).await?;
        Ok(Self { graph })
    }
}

#[async_trait]
impl GraphSink for Neo4jSink {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        for statement in SCHEMA_STATEMENTS {
            match self.graph.run(query(statement)).await {
                Ok(_) => debug!(statement, "Schema statement applied"),
                Err(e) => match classify(e) {
                    SinkError::Rejected(msg) if msg.contains("AlreadyExists") => {
                        warn!(statement, "Equivalent schema rule already exists: {msg}");
                    }
                    err => return Err(err),
                },
            }
        }
        Ok(())
    }

    async fn upsert_entities(&self, entities: &[Entity]) -> Result<(), SinkError> {
        if entities.is_empty() {
            return Ok(());
        }
        let rows = bolt_list(entities.iter().map(entity_row));
        self.graph
            .run(query(CYPHER_UPSERT_ENTITIES).param("rows", rows))
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn upsert_relationships(
        &self,
        relationships: &[Relationship],
    ) -> Result<(), SinkError> {
        if relationships.is_empty() {
            return Ok(());
        }
        let rows = bolt_list(relationships.iter().map(relationship_row));
        self.graph
            .run(query(CYPHER_UPSERT_RELATIONSHIPS).param("rows", rows))
            .await
            .map_err(classify)?;
        Ok(())
    }
}

/// Server-reported errors are data problems unless Neo4j marks them transient;
/// everything else (I/O, pool, protocol) is treated as connectivity.
fn classify(err: neo4rs::Error) -> SinkError {
    match &err {
        neo4rs::Error::Neo4j(e) if !e.code().starts_with("Neo.TransientError") => {
            SinkError::Rejected(format!("{}: {}", e.code(), err))
        }
        _ => SinkError::Unavailable(err.to_string()),
    }
}

fn bolt_list(rows: impl Iterator<Item = BoltType>) -> BoltType {
    let mut list = BoltList::new();
    for row in rows {
        list.push(row);
    }
    BoltType::List(list)
}

fn bolt_map(fields: impl IntoIterator<Item = (String, BoltType)>) -> BoltType {
    let mut map = BoltMap::new();
    for (key, value) in fields {
        map.put(BoltString::from(key.as_str()), value);
    }
    BoltType::Map(map)
}

fn entity_props(entity: &Entity) -> Vec<(String, BoltType)> {
    let mut props = Vec::with_capacity(entity.labels.len() + entity.descriptions.len() + 1);
    if let Some(label) = entity.display_label() {
        props.push(("label".to_string(), BoltType::from(label)));
    }
    for (lang, value) in &entity.labels {
        props.push((format!("label_{lang}"), BoltType::from(value.as_str())));
    }
    for (lang, value) in &entity.descriptions {
        props.push((format!("description_{lang}"), BoltType::from(value.as_str())));
    }
    props
}

fn entity_row(entity: &Entity) -> BoltType {
    bolt_map([
        ("id".to_string(), BoltType::from(entity.id.as_str())),
        ("kind".to_string(), BoltType::from(entity.kind.as_str())),
        ("props".to_string(), bolt_map(entity_props(entity))),
    ])
}

fn relationship_row(rel: &Relationship) -> BoltType {
    bolt_map([
        ("source".to_string(), BoltType::from(rel.source_id.as_str())),
        ("target".to_string(), BoltType::from(rel.target_id.as_str())),
        ("property".to_string(), BoltType::from(rel.property_id.as_str())),
    ])
}

async fn connect_with_retry(config: &SinkConfig) -> Result<Graph> {
    let max_retries = config::CONNECT_MAX_RETRIES;
    let delay = tokio::time::Duration::from_secs(config::CONNECT_RETRY_DELAY_SECS);

    for attempt in 1..=max_retries {
        match Graph::connect(config.graph_config()?) {
            Ok(graph) => match graph.run(query("RETURN 1;")).await {
                Ok(_) => {
                    info!(
                        uri = %config.uri,
                        database = config.database.as_deref().unwrap_or("default"),
                        max_connections = config.max_connections,
                        "Connected to Neo4j"
                    );
                    return Ok(graph);
                }
                Err(e) if attempt < max_retries => {
                    info!(attempt, "Connection test failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(e).context(format!(
                        "Cannot connect to Neo4j at {} after {max_retries} attempts",
                        config.uri
                    ));
                }
            },
            Err(e) if attempt < max_retries => {
                info!(attempt, "Cannot connect to Neo4j at {}, retrying: {e}", config.uri);
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(e).context(format!(
                    "Cannot connect to Neo4j at {} after {max_retries} attempts",
                    config.uri
                ));
            }
        }
    }

    bail!(
        "Cannot connect to Neo4j at {} after {max_retries} attempts",
        config.uri
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;
    use std::collections::BTreeMap;

    fn entity(id: &str, kind: EntityKind) -> Entity {
        let mut labels = BTreeMap::new();
        labels.insert("de".to_string(), "Mensch".to_string());
        labels.insert("en".to_string(), "human".to_string());
        let mut descriptions = BTreeMap::new();
        descriptions.insert("en".to_string(), "common name of Homo sapiens".to_string());
        Entity {
            id: id.to_string(),
            kind,
            labels,
            descriptions,
            claims: Vec::new(),
        }
    }

    #[test]
    fn entity_props_flatten_languages() {
        let props = entity_props(&entity("Q5", EntityKind::Item));
        let keys: Vec<_> = props.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec!["label", "label_de", "label_en", "description_en"]
        );
    }

    #[test]
    fn entity_props_empty_for_bare_entity() {
        let bare = Entity {
            id: "Q1".into(),
            kind: EntityKind::Item,
            labels: BTreeMap::new(),
            descriptions: BTreeMap::new(),
            claims: Vec::new(),
        };
        assert!(entity_props(&bare).is_empty());
    }

    #[test]
    fn entity_cypher_merges_without_replacing() {
        assert!(CYPHER_UPSERT_ENTITIES.contains("MERGE (e:Entity {id: row.id})"));
        assert!(CYPHER_UPSERT_ENTITIES.contains("SET e += row.props"));
        assert!(!CYPHER_UPSERT_ENTITIES.contains("SET e = "));
        assert!(CYPHER_UPSERT_ENTITIES.contains("lastUpdated"));
        assert!(CYPHER_UPSERT_ENTITIES.contains("SET e:Property"));
    }

    #[test]
    fn relationship_cypher_creates_placeholders() {
        assert!(CYPHER_UPSERT_RELATIONSHIPS.contains("MERGE (t:Entity {id: row.target})"));
        assert!(CYPHER_UPSERT_RELATIONSHIPS.contains("ON CREATE SET t.placeholder = true"));
        assert!(CYPHER_UPSERT_RELATIONSHIPS.contains("MERGE (s)-[r:HAS_PROPERTY"));
        assert!(!CYPHER_UPSERT_RELATIONSHIPS.contains("MATCH"));
    }

    #[test]
    fn sink_config_builds_with_database_and_pool() {
        let mut sink_config = SinkConfig::new("bolt://localhost:7687", "neo4j", "secret");
        assert_eq!(sink_config.max_connections, config::DEFAULT_MAX_CONNECTIONS);
        assert!(sink_config.graph_config().is_ok());

        sink_config.database = Some("wikidata".into());
        sink_config.max_connections = 4;
        assert!(sink_config.graph_config().is_ok());
    }

    #[test]
    fn sink_config_rejects_empty_pool() {
        let mut sink_config = SinkConfig::new("bolt://localhost:7687", "neo4j", "secret");
        sink_config.max_connections = 0;
        assert!(sink_config.graph_config().is_err());
    }

    #[test]
    fn schema_statements_are_idempotent_ddl() {
        assert_eq!(SCHEMA_STATEMENTS.len(), 4);
        for statement in SCHEMA_STATEMENTS {
            assert!(statement.contains("IF NOT EXISTS"), "{statement}");
        }
    }
}
