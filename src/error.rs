use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::handshake::HandshakeError;
use crate::resources::ResourceError;

/// Everything that can end a benchmark run.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("failed to pin worker thread to CPU {cpu}")]
    Affinity { cpu: usize },
    #[error("{failed} of {total} worker threads failed")]
    WorkersFailed { failed: usize, total: usize },
}
