pub mod assist;
pub mod auth;
pub mod config;
pub mod consensus;
pub mod dedup;
pub mod error;
pub mod events;
pub mod manager;
pub mod models;
pub mod phase;
pub mod probe;
pub mod prompts;
pub mod repo;
pub mod runner;
pub mod server;
pub mod store;

pub use config::ServerConfig;
pub use error::{RepoErrorKind, ReviewError, Result};
pub use events::{EventBus, ReviewEvent};
pub use manager::SessionManager;
pub use models::{
    AgentConfig, AgentStatus, ClientKind, ConsensusType, Issue, Opinion, OpinionAction,
    ProgressStatus, Review, Session, Severity, Strictness,
};
pub use phase::SessionPhase;
pub use store::SessionStore;
