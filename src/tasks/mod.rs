//! 后台任务：模型、存储与管理器

pub mod manager;
pub mod store;
pub mod task;

pub use manager::TaskManager;
pub use store::{InMemoryTaskStore, SqliteTaskStore, TaskStore};
pub use task::{Task, TaskId, TaskStatus, TaskUpdate};
