// src/stages/mod.rs

//! The stages of the standard chain, one module per concern.

mod alert;
mod annotate;
mod lock;
mod persist;
mod prefix;
mod quiet;
mod timeout;
mod validate;

pub use alert::AlertStage;
pub use annotate::Annotator;
pub use lock::{is_alive, LockGuard};
pub use persist::SinkWriter;
pub use prefix::{Prefixer, RunIdPrefixer};
pub use quiet::QuietFilter;
pub use timeout::TimeoutGuard;
pub use validate::{KeywordValidator, StderrValidator};
