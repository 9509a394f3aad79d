use thiserror::Error;

use kiln_archive::reader::ArchiveReadError;
use kiln_driver::DriverError;

use crate::engine::PipelineKind;

pub type Result<T> = std::result::Result<T, ReplayError>;

#[derive(Debug, Error)]
pub enum ReplayError {
    /// Archive index/enumeration failure. Individual entry read failures are
    /// logged and skipped instead.
    #[error("archive error: {0:?}")]
    Archive(#[from] ArchiveReadError),

    #[error("device initialization failed: {0}")]
    DeviceInit(DriverError),

    /// The derived-pipeline resolver cannot make progress: derivatives
    /// remain whose base pipelines were never seen.
    #[error("cannot resolve remaining derived {0} pipelines")]
    ResolverStall(PipelineKind),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("supervision failed: {0}")]
    Supervision(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
