//! SQLite persistence for the knowledge graph.
//!
//! One episode's writes (episode row, entity upserts, relation upserts,
//! mention links) happen in a single transaction: either the whole extraction
//! result lands or none of it does. Reads are plain queries; lexical search
//! matches case-insensitive substrings over entity names and summaries.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::db::Db;
use crate::error::Result;
use crate::graph::{Entity, Episode, EpisodeSource, Relation};

/// One lexical search hit, with the episodes that mention the entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityHit {
    pub uuid: String,
    pub name: String,
    pub summary: String,
    pub group_id: String,
    pub episode_uuids: Vec<String>,
}

/// Corpus counters surfaced by the CLI.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct GraphStats {
    pub episodes: usize,
    pub entities: usize,
    pub relations: usize,
    pub groups: usize,
}

/// Persistent graph operations over a [`Db`] handle.
pub struct GraphStore {
    db: Db,
}

impl GraphStore {
    pub fn new(db: Db) -> Self {
        GraphStore { db }
    }

    /// Create secondary lookup indexes. Index failures are logged and
    /// swallowed: a missing index slows queries down but never blocks
    /// ingestion, unlike the table schema itself.
    pub async fn ensure_indexes(&self) -> Result<()> {
        const INDEXES: &[(&str, &str)] = &[
            ("idx_entities_name", "CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name)"),
            ("idx_entities_group", "CREATE INDEX IF NOT EXISTS idx_entities_group ON entities(group_id)"),
            ("idx_episodes_group", "CREATE INDEX IF NOT EXISTS idx_episodes_group ON episodes(group_id)"),
            ("idx_episodes_created", "CREATE INDEX IF NOT EXISTS idx_episodes_created ON episodes(created_at)"),
            ("idx_relations_group", "CREATE INDEX IF NOT EXISTS idx_relations_group ON relations(group_id)"),
            ("idx_mentions_episode", "CREATE INDEX IF NOT EXISTS idx_mentions_episode ON entity_mentions(episode_uuid)"),
        ];
        self.db
            .with_connection(|conn| {
                for (name, sql) in INDEXES {
                    if let Err(e) = conn.execute(sql, []) {
                        log::warn!("Failed to create index {}: {}", name, e);
                    }
                }
                Ok(())
            })
            .await
    }

    /// Persist one extraction result atomically. Entities and relations
    /// upsert on uuid, so per-batch id collisions across episodes of one
    /// group overwrite rather than accumulate.
    pub async fn save_episode(
        &self,
        episode: &Episode,
        entities: &[Entity],
        relations: &[Relation],
    ) -> Result<()> {
        let episode = episode.clone();
        let entities = entities.to_vec();
        let relations = relations.to_vec();

        self.db
            .with_connection(move |conn| {
                let tx = conn.transaction()?;

                tx.execute(
                    "INSERT INTO episodes (uuid, name, group_id, source, source_description, \
                     content, created_at, valid_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        episode.uuid,
                        episode.name,
                        episode.group_id,
                        episode.source.as_str(),
                        episode.source_description,
                        episode.content,
                        episode.created_at.to_rfc3339(),
                        episode.valid_at.to_rfc3339(),
                    ],
                )?;

                for entity in &entities {
                    tx.execute(
                        "INSERT INTO entities (uuid, name, labels, summary, group_id, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                         ON CONFLICT(uuid) DO UPDATE SET \
                             name = excluded.name, \
                             labels = excluded.labels, \
                             summary = excluded.summary",
                        params![
                            entity.uuid,
                            entity.name,
                            labels_json(&entity.labels),
                            entity.summary,
                            entity.group_id,
                            entity.created_at.to_rfc3339(),
                        ],
                    )?;
                }

                for relation in &relations {
                    tx.execute(
                        "INSERT INTO relations (uuid, source_uuid, target_uuid, relation_type, \
                         summary, group_id, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                         ON CONFLICT(uuid) DO UPDATE SET \
                             source_uuid = excluded.source_uuid, \
                             target_uuid = excluded.target_uuid, \
                             relation_type = excluded.relation_type, \
                             summary = excluded.summary",
                        params![
                            relation.uuid,
                            relation.source_uuid,
                            relation.target_uuid,
                            relation.relation_type,
                            relation.summary,
                            relation.group_id,
                            relation.created_at.to_rfc3339(),
                        ],
                    )?;
                }

                for entity in &entities {
                    tx.execute(
                        "INSERT OR IGNORE INTO entity_mentions (entity_uuid, episode_uuid) \
                         VALUES (?1, ?2)",
                        params![entity.uuid, episode.uuid],
                    )?;
                }

                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Case-insensitive substring search over entity names and summaries.
    /// `group_ids` empty means no group filter. Hits carry the uuids of the
    /// episodes that mention them.
    pub async fn search_entities(
        &self,
        query: String,
        group_ids: Vec<String>,
        limit: usize,
    ) -> Result<Vec<EntityHit>> {
        self.db
            .with_connection(move |conn| {
                let pattern = format!("%{}%", query.to_lowercase());
                let mut sql = String::from(
                    "SELECT uuid, name, summary, group_id FROM entities \
                     WHERE (LOWER(name) LIKE ?1 OR LOWER(summary) LIKE ?1)",
                );
                let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(pattern)];
                if !group_ids.is_empty() {
                    let placeholders: Vec<String> = (0..group_ids.len())
                        .map(|i| format!("?{}", i + 2))
                        .collect();
                    sql.push_str(&format!(" AND group_id IN ({})", placeholders.join(",")));
                    for group_id in &group_ids {
                        args.push(Box::new(group_id.clone()));
                    }
                }
                args.push(Box::new(limit as i64));
                sql.push_str(&format!(" ORDER BY name LIMIT ?{}", args.len()));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
                    Ok(EntityHit {
                        uuid: row.get(0)?,
                        name: row.get(1)?,
                        summary: row.get(2)?,
                        group_id: row.get(3)?,
                        episode_uuids: Vec::new(),
                    })
                })?;

                let mut hits = Vec::new();
                for row in rows {
                    hits.push(row?);
                }

                let mut mentions = conn.prepare(
                    "SELECT episode_uuid FROM entity_mentions WHERE entity_uuid = ?1",
                )?;
                for hit in &mut hits {
                    let episode_rows =
                        mentions.query_map([&hit.uuid], |row| row.get::<_, String>(0))?;
                    for episode_uuid in episode_rows {
                        hit.episode_uuids.push(episode_uuid?);
                    }
                }

                Ok(hits)
            })
            .await
    }

    /// Most recent episodes, newest first. `group_ids` empty means all groups.
    pub async fn get_episodes(
        &self,
        group_ids: Vec<String>,
        last_n: usize,
    ) -> Result<Vec<Episode>> {
        self.db
            .with_connection(move |conn| {
                let mut sql = String::from(
                    "SELECT uuid, name, group_id, source, source_description, content, \
                     created_at, valid_at FROM episodes",
                );
                let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
                if !group_ids.is_empty() {
                    let placeholders: Vec<String> = (0..group_ids.len())
                        .map(|i| format!("?{}", i + 1))
                        .collect();
                    sql.push_str(&format!(" WHERE group_id IN ({})", placeholders.join(",")));
                    for group_id in &group_ids {
                        args.push(Box::new(group_id.clone()));
                    }
                }
                args.push(Box::new(last_n as i64));
                sql.push_str(&format!(" ORDER BY created_at DESC LIMIT ?{}", args.len()));

                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(args), |row| {
                    let source: String = row.get(3)?;
                    let created_at: String = row.get(6)?;
                    let valid_at: String = row.get(7)?;
                    Ok(Episode {
                        uuid: row.get(0)?,
                        name: row.get(1)?,
                        group_id: row.get(2)?,
                        source: EpisodeSource::parse(&source),
                        source_description: row.get(4)?,
                        content: row.get(5)?,
                        created_at: parse_timestamp(6, created_at)?,
                        valid_at: parse_timestamp(7, valid_at)?,
                    })
                })?;

                let mut episodes = Vec::new();
                for row in rows {
                    episodes.push(row?);
                }
                Ok(episodes)
            })
            .await
    }

    /// Corpus counters: episodes, entities, relations, distinct groups.
    pub async fn stats(&self) -> Result<GraphStats> {
        self.db
            .with_connection(|conn| {
                let episodes: i64 =
                    conn.query_row("SELECT COUNT(*) FROM episodes", [], |row| row.get(0))?;
                let entities: i64 =
                    conn.query_row("SELECT COUNT(*) FROM entities", [], |row| row.get(0))?;
                let relations: i64 =
                    conn.query_row("SELECT COUNT(*) FROM relations", [], |row| row.get(0))?;
                let groups: i64 = conn.query_row(
                    "SELECT COUNT(DISTINCT group_id) FROM episodes",
                    [],
                    |row| row.get(0),
                )?;
                Ok(GraphStats {
                    episodes: episodes as usize,
                    entities: entities as usize,
                    relations: relations as usize,
                    groups: groups as usize,
                })
            })
            .await
    }
}

/// Labels are stored as a JSON array in a TEXT column.
fn labels_json(labels: &[String]) -> String {
    serde_json::to_string(labels).unwrap_or_else(|_| "[\"Entity\"]".to_string())
}

/// RFC3339 text column back to a UTC timestamp, as a rusqlite row error so
/// it reports the offending column.
fn parse_timestamp(column: usize, raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}
