//! Dynamic reconfiguration of the observability stack.
//!
//! Each [`Aspect`] reads one mounted configuration source and owns one side
//! effect (log filter, metrics listener, trace exporter, profiler, status
//! reporting). The [`ConfigPipeline`] applies snapshots to aspects
//! independently and keeps each aspect's last-known-good settings when an
//! update is rejected.

mod aspect;
pub mod aspects;
mod error;
mod listener;
mod pipeline;
mod snapshot;
mod watcher;

pub use aspect::{Aspect, AspectHandle, AspectUpdate, ConfigAspect, ConfigData};
pub use error::AspectError;
pub use pipeline::{ConfigPipeline, UpdateReport};
pub use snapshot::{load_mount, load_source, ConfigSnapshot};
pub use watcher::ConfigWatcher;
