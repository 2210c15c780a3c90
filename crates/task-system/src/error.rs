use thiserror::Error;

use super::task::TaskId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
	#[error("task canceled <id='{0}'>")]
	Canceled(TaskId),
	#[error("task panicked <id='{0}'>: {1}")]
	Panicked(TaskId, String),
	#[error("task system is shutting down")]
	Shutdown,
}
