//! Small building blocks shared by the task system and the remote synchronization crates:
//! monitored locks and deadline timers, keyed collection diffs and named field access over
//! structured records.

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

pub mod deadline;
pub mod diff;
pub mod error;
pub mod lock;
pub mod record;

pub use deadline::DeadlineTimer;
pub use diff::{Identifiable, IdentifiableMap, ListDiff};
pub use lock::{MonitoredMutex, MonitoredMutexGuard, ObservableRwLock};
pub use record::{DynamicRecord, FieldError, FieldType, FieldValue, Record};

