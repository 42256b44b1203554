//! Remote dense index backed by Qdrant (cloud mode)

use std::collections::HashMap;

use async_trait::async_trait;
use qdrant_client::Qdrant;
use qdrant_client::qdrant::{
    CreateCollectionBuilder, DeletePointsBuilder, Distance, PointStruct, SearchPointsBuilder,
    UpsertPointsBuilder, Value, VectorParamsBuilder, point_id::PointIdOptions,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::CloudConfig;
use crate::error::{MemkeepError, Result};
use crate::storage::vector::{VectorHit, VectorIndex, sort_hits};

pub struct QdrantVectorIndex {
    client: Qdrant,
    collection: String,
    dimensions: usize,
}

impl QdrantVectorIndex {
    /// Connect and make sure the collection exists
    pub async fn connect(config: &CloudConfig, dimensions: usize) -> Result<Self> {
        debug!("Connecting to Qdrant at {}", config.url);

        let mut builder = Qdrant::from_url(&config.url);
        if let Some(key) = config.api_key() {
            builder = builder.api_key(key);
        }
        let client = builder
            .build()
            .map_err(|e| MemkeepError::Storage(format!("Failed to create Qdrant client: {e}")))?;

        let index = Self {
            client,
            collection: config.collection.clone(),
            dimensions,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection)
            .await
            .map_err(|e| {
                MemkeepError::Storage(format!("Failed to check collection existence: {e}"))
            })?;

        if !exists {
            info!("Creating collection: {}", self.collection);
            self.client
                .create_collection(
                    CreateCollectionBuilder::new(&self.collection).vectors_config(
                        VectorParamsBuilder::new(self.dimensions as u64, Distance::Cosine),
                    ),
                )
                .await
                .map_err(|e| MemkeepError::Storage(format!("Failed to create collection: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn upsert(&self, id: Uuid, embedding: &[f32]) -> Result<()> {
        if embedding.len() != self.dimensions {
            return Err(MemkeepError::Embedding(format!(
                "Expected {} dimensions, got {}",
                self.dimensions,
                embedding.len()
            )));
        }
        let payload: HashMap<String, Value> =
            [("memory_id".to_string(), Value::from(id.to_string()))]
                .into_iter()
                .collect();
        let point = PointStruct::new(id.to_string(), embedding.to_vec(), payload);

        self.client
            .upsert_points(UpsertPointsBuilder::new(&self.collection, vec![point]))
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to upsert vector: {e}")))?;
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.client
            .delete_points(DeletePointsBuilder::new(&self.collection).points(vec![id.to_string()]))
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to delete vector: {e}")))?;
        Ok(())
    }

    async fn search(&self, embedding: &[f32], limit: usize) -> Result<Vec<VectorHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let response = self
            .client
            .search_points(SearchPointsBuilder::new(
                &self.collection,
                embedding.to_vec(),
                limit as u64,
            ))
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to search vectors: {e}")))?;

        let mut hits: Vec<VectorHit> = response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = match point.id?.point_id_options? {
                    PointIdOptions::Uuid(s) => Uuid::parse_str(&s).ok()?,
                    PointIdOptions::Num(_) => return None,
                };
                Some(VectorHit {
                    id,
                    similarity: point.score,
                })
            })
            .collect();
        sort_hits(&mut hits);
        Ok(hits)
    }

    async fn len(&self) -> Result<usize> {
        let info = self
            .client
            .collection_info(&self.collection)
            .await
            .map_err(|e| MemkeepError::Storage(format!("Failed to get collection info: {e}")))?;
        Ok(info
            .result
            .and_then(|r| r.points_count)
            .unwrap_or(0) as usize)
    }

    fn backend(&self) -> &'static str {
        "qdrant"
    }
}
