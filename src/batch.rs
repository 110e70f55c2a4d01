use crate::models::{Entity, Relationship};
use serde::{Deserialize, Serialize};

/// A bounded group of entities and relationships flushed together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// 0-based flush ordinal, continued across resumed runs
    pub index: u64,
    /// Raw records consumed from the stream up to the end of this batch
    pub records_through: u64,
    /// Of those, records skipped as malformed
    pub skipped_through: u64,
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// Single-writer accumulator; the driver owns it.
pub struct BatchAccumulator {
    batch_size: usize,
    current: Batch,
    next_index: u64,
    records_through: u64,
    skipped_through: u64,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize) -> Self {
        Self::starting_at(batch_size, 0, 0, 0)
    }

    /// Continues record and batch numbering from a resumed position.
    pub fn starting_at(
        batch_size: usize,
        records_through: u64,
        skipped_through: u64,
        first_index: u64,
    ) -> Self {
        Self {
            batch_size: batch_size.max(1),
            current: Batch::default(),
            next_index: first_index,
            records_through,
            skipped_through,
        }
    }

    pub fn add_entity(&mut self, entity: Entity) {
        self.current.entities.push(entity);
    }

    pub fn add_relationships(&mut self, relationships: impl IntoIterator<Item = Relationship>) {
        self.current.relationships.extend(relationships);
    }

    /// Records that one more raw record (kept or skipped) has been consumed.
    pub fn mark_record(&mut self) {
        self.records_through += 1;
    }

    /// The last marked record was dropped as malformed.
    pub fn mark_skipped(&mut self) {
        self.skipped_through += 1;
    }

    pub fn should_flush(&self) -> bool {
        self.current.entities.len() >= self.batch_size
    }

    pub fn len(&self) -> usize {
        self.current.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Index the batch under construction will get when drained.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn drain(&mut self) -> Batch {
        let mut batch = std::mem::take(&mut self.current);
        batch.index = self.next_index;
        batch.records_through = self.records_through;
        batch.skipped_through = self.skipped_through;
        self.next_index += 1;
        self.current.entities.reserve(self.batch_size);
        batch
    }
}
