use thiserror::Error;

/// Rejection codes surfaced by the store path.
///
/// Every rejection is terminal for the page being stored: the caller is
/// expected to fall back to the direct swap path. None of these variants
/// indicate corruption of cache state.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    #[error("no swap area registered for this type")]
    NoDevice,

    /// Entry record reservation failed. The built-in record store never
    /// fails, so this is only produced by embedders with fallible record
    /// allocation.
    #[error("entry record allocation failed")]
    OutOfMemory,

    #[error("page could not be compressed")]
    BadInput,

    #[error("compressed size exceeds the admission ratio")]
    CompressionTooPoor,

    #[error("pool allocation failed even after writeback")]
    AllocFail,

    #[error("no scratch frame available to stage the payload")]
    TempPageFail,
}

/// Load failures. An absent entry and an already-written-back entry are
/// indistinguishable to the caller.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    #[error("no entry at this offset")]
    NotFound,
}

/// Outcomes of a single writeback attempt that did not produce an I/O.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritebackError {
    #[error("swap cache page allocation failed")]
    OutOfMemory,

    #[error("page already present in the swap cache")]
    AlreadyPresent,
}

/// Initialization-time errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache is disabled by configuration")]
    Disabled,

    #[error("system memory information unavailable: {0}")]
    SystemInfo(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
