pub mod audit;
pub mod cache;
pub mod config;
pub mod domain;
pub mod embedding;
pub mod errors;
pub mod ports;
pub mod retention;
pub mod schedule;
pub mod supervisor;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use cache::{CacheError, CacheStats, GetOptions, RecordCache, Snapshot};
pub use domain::intent::{Classification, IntentCategory};
pub use domain::memory::{
    ConversationAnalysis, ConversationTurn, NewTask, PreferenceUpdate, Preferences, PrunedRows,
    SemanticEntry, SemanticMatch, TaskStatus, UserId, UserTask,
};
pub use domain::record::{Record, TableName};
pub use embedding::{HashingEmbedder, PooledEmbedder};
pub use errors::{ReplyError, ServiceError, TurnError};
pub use supervisor::{BlockingPool, Budgets, Deadline, IsolationError, Supervisor, TaskResult};
