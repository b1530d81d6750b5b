use thiserror::Error;

/// Fieldless view of [`Error`], used when encoding responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidArgument,
    SubnetExhausted,
    InterfaceSetupFailed,
    NamespaceSetupFailed,
    PacketFilterFailed,
    AlreadyRunning,
    NotRunning,
    HelperUnavailable,
    PolicyDenied,
}

/// Errors surfaced by composite guest-network operations.
///
/// Every variant is raised only after the operation has unwound the side
/// effects it had already applied.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no subnet available for {0}")]
    SubnetExhausted(String),

    #[error("interface setup failed: {0}")]
    InterfaceSetupFailed(String),

    #[error("namespace setup failed: {0}")]
    NamespaceSetupFailed(String),

    #[error("packet filter update failed: {0}")]
    PacketFilterFailed(String),

    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("{0} is not running")]
    NotRunning(String),

    #[error("helper process {0} is unavailable")]
    HelperUnavailable(String),

    #[error("denied by policy: {0}")]
    PolicyDenied(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::SubnetExhausted(_) => ErrorKind::SubnetExhausted,
            Error::InterfaceSetupFailed(_) => ErrorKind::InterfaceSetupFailed,
            Error::NamespaceSetupFailed(_) => ErrorKind::NamespaceSetupFailed,
            Error::PacketFilterFailed(_) => ErrorKind::PacketFilterFailed,
            Error::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Error::NotRunning(_) => ErrorKind::NotRunning,
            Error::HelperUnavailable(_) => ErrorKind::HelperUnavailable,
            Error::PolicyDenied(_) => ErrorKind::PolicyDenied,
        }
    }

    /// Wraps a datapath failure, keeping the full context chain.
    pub fn interface(err: &anyhow::Error) -> Self {
        Error::InterfaceSetupFailed(format!("{err:#}"))
    }

    pub fn namespace(err: &anyhow::Error) -> Self {
        Error::NamespaceSetupFailed(format!("{err:#}"))
    }

    pub fn packet_filter(err: &anyhow::Error) -> Self {
        Error::PacketFilterFailed(format!("{err:#}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
