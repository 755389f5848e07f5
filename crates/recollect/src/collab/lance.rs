//! LanceDB-backed vector index
//!
//! One `memories` table holds every user's vectors. Each row carries the
//! owning user, the embedding and the memory descriptor serialized as JSON.
//! Writes are buffered in memory and appended as a single batch on flush.

use std::path::Path;
use std::sync::{Arc, Mutex};

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
};
use arrow_schema::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{DistanceType, Table};
use tracing::{debug, info};

use crate::collab::{MemoryRecord, SearchParams, VectorHit, VectorIndex};
use crate::error::{RecollectError, Result};

const MEMORIES_TABLE: &str = "memories";

struct PendingRow {
    user_id: String,
    id: String,
    vector: Vec<f32>,
    record: MemoryRecord,
}

pub struct LanceVectorIndex {
    // Kept so the table's connection outlives every query
    _connection: Connection,
    table: Table,
    dimension: i32,
    pending: Mutex<Vec<PendingRow>>,
}

fn index_err(context: &str, e: impl std::fmt::Display) -> RecollectError {
    RecollectError::Index(format!("{context}: {e}"))
}

fn quote(value: &str) -> String {
    value.replace('\'', "''")
}

impl LanceVectorIndex {
    /// Open (or create) the memories table under `path`
    pub async fn open(path: &Path, dimension: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| RecollectError::Index("Invalid path encoding".to_string()))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| index_err("Failed to connect to LanceDB", e))?;

        let dimension = dimension as i32;
        let names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| index_err("Failed to list tables", e))?;

        let table = if names.iter().any(|n| n == MEMORIES_TABLE) {
            debug!("Opening existing memories table");
            connection
                .open_table(MEMORIES_TABLE)
                .execute()
                .await
                .map_err(|e| index_err("Failed to open memories table", e))?
        } else {
            info!(dimension, "Creating memories table");
            let schema = Self::schema(dimension);
            let batch = Self::rows_to_batch(&[], schema.clone(), dimension)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            connection
                .create_table(MEMORIES_TABLE, Box::new(batches))
                .execute()
                .await
                .map_err(|e| index_err("Failed to create memories table", e))?
        };

        Ok(Self {
            _connection: connection,
            table,
            dimension,
            pending: Mutex::new(Vec::new()),
        })
    }

    fn schema(dimension: i32) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("user_id", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimension,
                ),
                false,
            ),
            Field::new("record", DataType::Utf8, false),
        ]))
    }

    fn rows_to_batch(rows: &[PendingRow], schema: Arc<Schema>, dimension: i32) -> Result<RecordBatch> {
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        let users: Vec<&str> = rows.iter().map(|r| r.user_id.as_str()).collect();
        let embeddings: Vec<Option<Vec<Option<f32>>>> = rows
            .iter()
            .map(|r| Some(r.vector.iter().map(|&v| Some(v)).collect()))
            .collect();
        let records = rows
            .iter()
            .map(|r| serde_json::to_string(&r.record))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let record_refs: Vec<&str> = records.iter().map(String::as_str).collect();

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(ids)),
                Arc::new(StringArray::from(users)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(embeddings, dimension)),
                Arc::new(StringArray::from(record_refs)),
            ],
        )
        .map_err(|e| index_err("Failed to create RecordBatch", e))
    }

    fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray> {
        batch
            .column_by_name(name)
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| RecollectError::Index(format!("Missing column '{name}'")))
    }

    fn decode_record(batch: &RecordBatch, row: usize) -> Result<MemoryRecord> {
        let records = Self::string_column(batch, "record")?;
        Ok(serde_json::from_str(records.value(row))?)
    }

    pub async fn count(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| index_err("Failed to count rows", e))
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn search_similar(
        &self,
        user_id: &str,
        vector: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<VectorHit>> {
        if vector.len() as i32 != self.dimension {
            return Err(RecollectError::Validation(format!(
                "Query vector has {} dimensions, index expects {}",
                vector.len(),
                self.dimension
            )));
        }

        let stream = self
            .table
            .query()
            .nearest_to(vector)
            .map_err(|e| index_err("Failed to create vector query", e))?
            .distance_type(DistanceType::Cosine)
            .only_if(format!("user_id = '{}'", quote(user_id)))
            .limit(params.k)
            .execute()
            .await
            .map_err(|e| index_err("Failed to execute search", e))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| index_err("Failed to collect search results", e))?;

        let mut hits = Vec::new();
        for batch in &batches {
            let ids = Self::string_column(batch, "id")?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|c| c.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| RecollectError::Index("Missing _distance column".to_string()))?;

            for row in 0..batch.num_rows() {
                let distance = distances.value(row);
                if params.threshold.is_some_and(|t| 1.0 - distance < t) {
                    continue;
                }
                hits.push(VectorHit {
                    id: ids.value(row).to_string(),
                    distance,
                    record: Self::decode_record(batch, row)?,
                });
            }
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        Ok(hits)
    }

    async fn add_vector_batched(
        &self,
        user_id: &str,
        id: &str,
        vector: Vec<f32>,
        record: MemoryRecord,
    ) -> Result<()> {
        if vector.len() as i32 != self.dimension {
            return Err(RecollectError::Index(format!(
                "Vector for {id} has {} dimensions, index expects {}",
                vector.len(),
                self.dimension
            )));
        }
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PendingRow {
                user_id: user_id.to_string(),
                id: id.to_string(),
                vector,
                record,
            });
        Ok(())
    }

    async fn force_flush(&self, reason: &str) -> Result<usize> {
        let rows: Vec<PendingRow> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pending)
        };
        if rows.is_empty() {
            return Ok(0);
        }

        let schema = Self::schema(self.dimension);
        let batch = Self::rows_to_batch(&rows, schema.clone(), self.dimension)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);

        self.table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| index_err("Failed to append vectors", e))?;

        debug!(flushed = rows.len(), reason, "Flushed vectors to LanceDB");
        Ok(rows.len())
    }

    async fn get(&self, user_id: &str, id: &str) -> Result<Option<MemoryRecord>> {
        let stream = self
            .table
            .query()
            .only_if(format!(
                "user_id = '{}' AND id = '{}'",
                quote(user_id),
                quote(id)
            ))
            .limit(1)
            .execute()
            .await
            .map_err(|e| index_err("Failed to query memory", e))?;

        let batches: Vec<RecordBatch> = stream
            .try_collect()
            .await
            .map_err(|e| index_err("Failed to collect query results", e))?;

        match batches.iter().find(|b| b.num_rows() > 0) {
            Some(batch) => Ok(Some(Self::decode_record(batch, 0)?)),
            None => Ok(None),
        }
    }
}
