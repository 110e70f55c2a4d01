//! Ariadne: Wikidata entity dump ingestion into Neo4j
//!
//! This crate streams a Wikidata-style XML entity dump (plain, gzip or bzip2)
//! and loads it into a property graph:
//!
//! 1. **Streaming** -- Pull-parse the dump one `<entity>` element at a time,
//!    never holding more than the current record in memory
//! 2. **Extraction** -- Turn each record into an entity (id, kind, per-language
//!    labels and descriptions, claims) plus the relationships its
//!    entity-valued claims imply
//! 3. **Batching** -- Group entities and relationships into bounded batches
//! 4. **Flushing** -- Upsert each batch into the graph store with per-batch
//!    timeouts, bounded retries and exponential backoff
//!
//! # Guarantees
//!
//! - **Idempotent writes** -- Nodes are keyed by entity id and edges by
//!   `(source, target, property)`, so re-running over the same dump converges
//!   to the same graph
//! - **Additive merges** -- A later record for the same id adds or overwrites
//!   labels per language and never clears the others
//! - **Placeholders** -- A relationship target not yet seen is created as a
//!   bare node and filled in when its own record arrives
//! - **Per-batch atomicity** -- A batch is either fully confirmed or reported
//!   back whole with its index on failure
//! - **Resumable runs** -- Optional checkpoints let a restart skip records
//!   already committed
//!
//! # Key Modules
//!
//! - [`parser`] -- Streaming XML record reader with gzip/bzip2 decompression
//! - [`extract`] -- Record to entity and relationship extraction
//! - [`batch`] -- Batch accumulation
//! - [`sink`] -- The graph store trait and an in-memory implementation
//! - [`neo4j`] -- Neo4j implementation over Bolt
//! - [`ingest`] -- The ingestion driver state machine
//! - [`checkpoint`] -- Progress checkpointing for resumable runs
//! - [`stats`] -- Atomic counters for ingestion metrics
//! - [`models`] -- Core data types (Entity, Claim, Relationship)
//! - [`error`] -- Error taxonomy
//! - [`config`] -- Defaults and run configuration
//!
//! # Example Usage
//!
//! ```bash
//! # Load a compressed dump into a local Neo4j
//! ariadne load -i wikidata-entities.xml.bz2 --batch-size 1000
//!
//! # Parse and extract only, keeping the graph in memory
//! ariadne load -i wikidata-entities.xml.gz --dry-run --limit 10000
//!
//! # Create constraints and indexes without loading anything
//! ariadne schema
//! ```

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod models;
pub mod neo4j;
pub mod parser;
pub mod sink;
pub mod stats;
