//! Error types for the outreach engine.

use uuid::Uuid;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Segment compilation and resolution errors.
#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("Segment {id} not found")]
    NotFound { id: Uuid },

    #[error("Invalid predicate on field {field}: {message}")]
    InvalidPredicate { field: String, message: String },

    #[error("Empty rule tree")]
    EmptyRuleTree,
}

/// Template rendering errors.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("Template {id} not found")]
    NotFound { id: Uuid },

    #[error("Rendering failed: {0}")]
    Failed(String),
}

/// Dispatch and provider errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No dispatcher registered for channel {channel}")]
    NoDispatcher { channel: String },

    #[error("Provider {provider} transport error: {reason}")]
    Transport { provider: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Job queue errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} has an unparseable payload: {reason}")]
    BadPayload { id: Uuid, reason: String },

    #[error("Job {id} failed: {reason}")]
    Failed { id: Uuid, reason: String },
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
