//! Knowledge service facade.
//!
//! One object owns the extraction orchestrator, the graph store, the
//! embedder and both backends, and exposes the engine's operations:
//! ingestion, search, episode listing and corpus stats. Ingestion either
//! fully succeeds or returns an error; the read paths degrade to empty
//! results with an `error` field so a broken store never takes search down
//! with it.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use serde::Serialize;

use crate::backend::{LocalBackend, RemoteBackend};
use crate::config::Config;
use crate::embeddings::{self, cosine_similarity, Embedder};
use crate::error::{GraphMemError, Result};
use crate::extract::Orchestrator;
use crate::graph::{
    Entity, EntityHit, Episode, EpisodeSource, GraphStats, GraphStore, Relation,
};

/// Recent episodes handed to the extraction prompts as context.
const PREVIOUS_EPISODE_WINDOW: usize = 3;

/// One episode ingestion request.
#[derive(Debug, Clone)]
pub struct AddEpisodeRequest {
    pub name: String,
    pub content: String,
    pub source_description: String,
    /// Tenant scope; the configured default group when absent.
    pub group_id: Option<String>,
    /// Content interpretation hint; `text` when absent.
    pub source: Option<EpisodeSource>,
    /// Prefer the remote backend, falling back to local when it fails.
    /// Without a configured remote credential the flag is ignored.
    pub use_remote: bool,
}

/// Successful ingestion summary.
#[derive(Debug, Clone, Serialize)]
pub struct AddEpisodeResult {
    pub episode_id: String,
    pub nodes_created: usize,
    pub edges_created: usize,
    pub node_ids: Vec<String>,
    pub edge_ids: Vec<String>,
}

/// Search outcome. `error` is set when the store could not be queried, in
/// which case `results` is empty rather than the call failing.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<EntityHit>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Episode listing outcome, with the same degradation contract as search.
#[derive(Debug, Clone, Serialize)]
pub struct EpisodeListing {
    pub episodes: Vec<Episode>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Facade over extraction, persistence and search.
pub struct KnowledgeService {
    store: GraphStore,
    orchestrator: Orchestrator,
    local: LocalBackend,
    remote: Option<RemoteBackend>,
    embedder: Box<dyn Embedder>,
    /// Query embeddings for semantic re-ranking; interactive use repeats
    /// queries far more often than corpus text changes.
    query_cache: Mutex<LruCache<String, Vec<f32>>>,
    default_group_id: String,
    default_limit: usize,
}

impl KnowledgeService {
    /// Wire the service up from configuration. A configured-but-broken
    /// remote backend (typically a missing API key) downgrades to local-only
    /// with a warning instead of failing construction.
    pub fn new(store: GraphStore, config: &Config) -> Self {
        let remote = if config.backend.provider == "openai" {
            match RemoteBackend::from_config(config) {
                Ok(backend) => Some(backend),
                Err(e) => {
                    log::warn!("Remote backend disabled: {}", e);
                    None
                }
            }
        } else {
            None
        };
        let embedder = embeddings::from_config(config);
        let capacity = NonZeroUsize::new(config.search.cache_capacity)
            .expect("Cache capacity must be at least 1");
        KnowledgeService {
            store,
            orchestrator: Orchestrator::new(),
            local: LocalBackend::new(),
            remote,
            embedder,
            query_cache: Mutex::new(LruCache::new(capacity)),
            default_group_id: config.default_group_id().to_string(),
            default_limit: config.search.default_limit,
        }
    }

    /// Ingest one episode: validate, extract entities and relations, persist
    /// the whole result atomically. Storage failures leave nothing behind,
    /// so the caller can retry the entire call.
    pub async fn add_episode(&self, request: AddEpisodeRequest) -> Result<AddEpisodeResult> {
        if request.name.trim().is_empty() {
            return Err(GraphMemError::InvalidInput(
                "episode name must not be empty".to_string(),
            ));
        }
        if request.content.trim().is_empty() {
            return Err(GraphMemError::InvalidInput(
                "episode content must not be empty".to_string(),
            ));
        }

        let group_id = request
            .group_id
            .filter(|g| !g.trim().is_empty())
            .unwrap_or_else(|| self.default_group_id.clone());
        let episode = Episode::new(
            request.name,
            request.content,
            request.source_description,
            group_id,
            request.source.unwrap_or_default(),
        );

        let previous = self
            .store
            .get_episodes(vec![episode.group_id.clone()], PREVIOUS_EPISODE_WINDOW)
            .await?;

        let (entities, relations) = self
            .extract(&episode, &previous, request.use_remote)
            .await?;

        self.store
            .save_episode(&episode, &entities, &relations)
            .await?;
        log::info!(
            "Episode {} persisted with {} entities and {} relations",
            episode.uuid,
            entities.len(),
            relations.len()
        );

        Ok(AddEpisodeResult {
            episode_id: episode.uuid,
            nodes_created: entities.len(),
            edges_created: relations.len(),
            node_ids: entities.iter().map(|e| e.uuid.clone()).collect(),
            edge_ids: relations.iter().map(|r| r.uuid.clone()).collect(),
        })
    }

    /// Run extraction on the requested backend. When the remote pass fails
    /// after its retries, the whole extraction re-runs on the local backend;
    /// there is no mid-loop switching.
    async fn extract(
        &self,
        episode: &Episode,
        previous: &[Episode],
        use_remote: bool,
    ) -> Result<(Vec<Entity>, Vec<Relation>)> {
        if use_remote {
            if let Some(remote) = &self.remote {
                match self
                    .orchestrator
                    .extract_episode(remote, episode, previous)
                    .await
                {
                    Ok(result) => return Ok(result),
                    Err(e) => {
                        log::warn!(
                            "Remote extraction failed for episode {}: {}. Falling back to local backend",
                            episode.uuid,
                            e
                        );
                    }
                }
            }
        }
        self.orchestrator
            .extract_episode(&self.local, episode, previous)
            .await
    }

    /// Lexical entity search, optionally re-ranked by embedding similarity.
    /// `group_ids` empty means all groups; `limit` falls back to the
    /// configured default.
    pub async fn search(
        &self,
        query: &str,
        group_ids: Vec<String>,
        limit: Option<usize>,
        semantic: bool,
    ) -> SearchResponse {
        let limit = limit.unwrap_or(self.default_limit);
        let mut hits = match self
            .store
            .search_entities(query.to_string(), group_ids, limit)
            .await
        {
            Ok(hits) => hits,
            Err(e) => {
                log::warn!("Search degraded to empty results: {}", e);
                return SearchResponse {
                    results: Vec::new(),
                    count: 0,
                    error: Some(e.to_string()),
                };
            }
        };

        if semantic && hits.len() > 1 {
            // Embedding trouble only costs the re-ranking; the lexical
            // ordering is still a valid answer.
            if let Err(e) = self.rerank(query, &mut hits).await {
                log::warn!("Semantic re-ranking skipped: {}", e);
            }
        }

        SearchResponse {
            count: hits.len(),
            results: hits,
            error: None,
        }
    }

    /// Most recent episodes, newest first.
    pub async fn get_episodes(
        &self,
        group_ids: Vec<String>,
        last_n: Option<usize>,
    ) -> EpisodeListing {
        let last_n = last_n.unwrap_or(self.default_limit);
        match self.store.get_episodes(group_ids, last_n).await {
            Ok(episodes) => EpisodeListing {
                count: episodes.len(),
                episodes,
                error: None,
            },
            Err(e) => {
                log::warn!("Episode listing degraded to empty results: {}", e);
                EpisodeListing {
                    episodes: Vec::new(),
                    count: 0,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Corpus counters.
    pub async fn stats(&self) -> Result<GraphStats> {
        self.store.stats().await
    }

    /// Reorder hits by cosine similarity between the query embedding and
    /// each hit's name+summary embedding. Membership and count never change,
    /// only the order.
    async fn rerank(&self, query: &str, hits: &mut Vec<EntityHit>) -> Result<()> {
        let query_vector = self.query_embedding(query).await?;
        let texts: Vec<String> = hits
            .iter()
            .map(|h| format!("{} {}", h.name, h.summary))
            .collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != hits.len() {
            return Err(GraphMemError::Embedding(format!(
                "embedder returned {} vectors for {} hits",
                vectors.len(),
                hits.len()
            )));
        }

        let mut scored: Vec<(f32, EntityHit)> = hits
            .drain(..)
            .zip(vectors)
            .map(|(hit, vector)| (cosine_similarity(&query_vector, &vector), hit))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        hits.extend(scored.into_iter().map(|(_, hit)| hit));
        Ok(())
    }

    /// Query embedding with a bounded LRU in front.
    async fn query_embedding(&self, query: &str) -> Result<Vec<f32>> {
        if let Some(vector) = self.query_cache.lock().unwrap().get(query) {
            log::debug!("Query embedding cache hit");
            return Ok(vector.clone());
        }
        let vector = self.embedder.embed(query).await?;
        self.query_cache
            .lock()
            .unwrap()
            .put(query.to_string(), vector.clone());
        Ok(vector)
    }
}
