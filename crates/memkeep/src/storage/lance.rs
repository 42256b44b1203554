use std::path::Path;
use std::sync::Arc;

use arrow_array::{
    Array, FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray,
    TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use lancedb::Table;
use lancedb::connection::Connection;
use lancedb::query::{ExecutableQuery, QueryBase};
use uuid::Uuid;

use crate::error::{MemkeepError, Result};
use crate::storage::vector::{VectorHit, VectorIndex, cosine_similarity, sort_hits};

const VECTORS_TABLE: &str = "memory_vectors";

/// Local dense index backed by LanceDB
pub struct LanceVectorIndex {
    _connection: Connection,
    table: Table,
    dimensions: i32,
}

impl LanceVectorIndex {
    /// Connect to (or create) the vector table under `path`.
    pub async fn open(path: &Path, dimensions: usize) -> Result<Self> {
        let uri = path
            .to_str()
            .ok_or_else(|| MemkeepError::Storage("Invalid path encoding".to_string()))?;
        let dimensions = i32::try_from(dimensions)
            .map_err(|_| MemkeepError::Config(format!("Unsupported dimensions: {dimensions}")))?;

        let connection = lancedb::connect(uri)
            .execute()
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to connect to LanceDB: {e}")))?;

        let names = connection
            .table_names()
            .execute()
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to list tables: {e}")))?;

        let table = if names.iter().any(|n| n == VECTORS_TABLE) {
            tracing::debug!("Opening existing vector table");
            connection
                .open_table(VECTORS_TABLE)
                .execute()
                .await
                .map_err(|e| MemkeepError::Storage(format!("Failed to open vector table: {e}")))?
        } else {
            tracing::info!("Creating vector table ({dimensions} dimensions)");
            let schema = Self::schema(dimensions);
            let batch = Self::to_batch(&[], schema.clone(), dimensions)?;
            let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
            connection
                .create_table(VECTORS_TABLE, Box::new(batches))
                .execute()
                .await
                .map_err(|e| {
                    MemkeepError::Storage(format!("Failed to create vector table: {e}"))
                })?
        };

        let stored = Self::stored_dimensions(&table).await?;
        if stored != dimensions {
            return Err(MemkeepError::Config(format!(
                "Vector table has {stored} dimensions but embedding.dimensions is {dimensions}"
            )));
        }

        Ok(Self {
            _connection: connection,
            table,
            dimensions,
        })
    }

    fn schema(dimensions: i32) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "embedding",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    dimensions,
                ),
                false,
            ),
            Field::new(
                "indexed_at",
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
                false,
            ),
        ]))
    }

    async fn stored_dimensions(table: &Table) -> Result<i32> {
        let schema = table
            .schema()
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to read table schema: {e}")))?;
        let field = schema
            .field_with_name("embedding")
            .map_err(|e| MemkeepError::Storage(format!("Missing embedding column: {e}")))?;
        match field.data_type() {
            DataType::FixedSizeList(_, size) => Ok(*size),
            other => Err(MemkeepError::Storage(format!(
                "Unexpected embedding column type: {other}"
            ))),
        }
    }

    fn to_batch(
        rows: &[(Uuid, &[f32])],
        schema: Arc<Schema>,
        dimensions: i32,
    ) -> Result<RecordBatch> {
        let ids: Vec<String> = rows.iter().map(|(id, _)| id.to_string()).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let embeddings: Vec<Option<Vec<Option<f32>>>> = rows
            .iter()
            .map(|(_, v)| Some(v.iter().copied().map(Some).collect()))
            .collect();
        let now = Utc::now().timestamp_micros();
        let indexed_at: Vec<i64> = rows.iter().map(|_| now).collect();

        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(id_refs)),
                Arc::new(FixedSizeListArray::from_iter_primitive::<
                    arrow_array::types::Float32Type,
                    _,
                    _,
                >(embeddings, dimensions)),
                Arc::new(TimestampMicrosecondArray::from(indexed_at).with_timezone("UTC")),
            ],
        )
        .map_err(|e| MemkeepError::Storage(format!("Failed to create RecordBatch: {e}")))
    }

    fn read_batch(batch: &RecordBatch, query: &[f32], out: &mut Vec<VectorHit>) -> Result<()> {
        let ids = batch
            .column_by_name("id")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>())
            .ok_or_else(|| MemkeepError::Storage("Failed to get id column".to_string()))?;
        let embeddings = batch
            .column_by_name("embedding")
            .and_then(|c| c.as_any().downcast_ref::<FixedSizeListArray>())
            .ok_or_else(|| MemkeepError::Storage("Failed to get embedding column".to_string()))?;

        for row in 0..batch.num_rows() {
            let id = Uuid::parse_str(ids.value(row))
                .map_err(|e| MemkeepError::Storage(format!("Invalid UUID: {e}")))?;
            let values = embeddings.value(row);
            let values = values
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| {
                    MemkeepError::Storage("Failed to read embedding values".to_string())
                })?;
            let vector: Vec<f32> = values.values().to_vec();
            out.push(VectorHit {
                id,
                similarity: cosine_similarity(query, &vector),
            });
        }
        Ok(())
    }

    fn check_dimensions(&self, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimensions as usize {
            return Err(MemkeepError::Embedding(format!(
                "Expected {} dimensions, got {}",
                self.dimensions,
                embedding.len()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for LanceVectorIndex {
    async fn upsert(&self, id: Uuid, embedding: &[f32]) -> Result<()> {
        self.check_dimensions(embedding)?;

        self.table
            .delete(&format!("id = '{id}'"))
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to replace vector: {e}")))?;

        let schema = Self::schema(self.dimensions);
        let batch = Self::to_batch(&[(id, embedding)], schema.clone(), self.dimensions)?;
        let batches = RecordBatchIterator::new(vec![Ok(batch)], schema);
        self.table
            .add(Box::new(batches))
            .execute()
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to insert vector: {e}")))?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.table
            .delete(&format!("id = '{id}'"))
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to delete vector: {e}")))?;
        Ok(())
    }

    async fn search(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        self.check_dimensions(embedding)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let stream = self
            .table
            .query()
            .nearest_to(embedding)
            .map_err(|e| MemkeepError::Storage(format!("Failed to create vector query: {e}")))?
            .limit(limit)
            .execute()
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to execute search: {e}")))?;

        let batches: Vec<RecordBatch> = stream.try_collect().await.map_err(|e| {
            MemkeepError::Storage(format!("Failed to collect search results: {e}"))
        })?;

        let mut hits = Vec::new();
        for batch in &batches {
            Self::read_batch(batch, embedding, &mut hits)?;
        }
        sort_hits(&mut hits);
        hits.truncate(limit);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize> {
        self.table
            .count_rows(None)
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to count rows: {e}")))
    }

    fn backend(&self) -> &'static str {
        "lancedb"
    }
}
