//! Capabilities that touch the outside world: archives, scratch storage, status

pub mod data_source;
pub mod memory;
pub mod scratch;
pub mod status;

pub use data_source::{DataSource, LoadRequest};
pub use memory::InMemoryArchive;
pub use scratch::ScratchStore;
pub use status::{CancellationFlag, InMemoryStatus, QueryStatus, StatusReporter};
