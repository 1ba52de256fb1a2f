pub mod config;
pub mod error;
pub mod db;
pub mod backend;
pub mod embeddings;
pub mod extract;
pub mod graph;
pub mod service;

pub use config::Config;
pub use error::{GraphMemError, Result};
pub use graph::{Entity, Episode, EpisodeSource, GraphStore, Relation};
pub use service::{AddEpisodeRequest, KnowledgeService};
