pub mod hub;
pub mod resume;
pub mod wire;

pub use hub::{ChunkStream, ResumableBackend, StreamHub, StreamWriter};
pub use resume::{ResumeCoordinator, ResumeOutcome};
pub use wire::StreamPart;
