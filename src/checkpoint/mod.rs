pub mod core;
pub mod schema;

pub use core::{CheckpointResult, CheckpointTrigger, Checkpointer};
pub use schema::{ColumnDef, ColumnType, EntitySchema};
