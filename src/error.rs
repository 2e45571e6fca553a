use std::io;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no free BPF device (all units busy or pool exhausted)")]
    NoDeviceAvailable,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("cannot open {path}: {source}")]
    DeviceOpen {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot bind to interface {interface}: {source}")]
    InterfaceBindFailed {
        interface: String,
        #[source]
        source: io::Error,
    },
    #[error("cannot set {option}: {source}")]
    ConfigurationFailed {
        option: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("unsupported datalink type {0} (only Ethernet is supported)")]
    UnsupportedLinkType(u32),
    #[error("kernel rejected filter program: {0}")]
    InstallationRejected(#[source] io::Error),
    #[error("malformed filter program: {0}")]
    InvalidProgram(String),
    #[error("cannot allocate capture buffer: {0}")]
    AllocationFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(#[source] io::Error),
    #[error("capture session already released")]
    SessionClosed,
    #[error("sysctl error: {0}")]
    Sysctl(#[source] io::Error),
    #[error("cannot write output: {0}")]
    Output(#[source] io::Error),
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl CaptureError {
    /// Name of the pipeline stage that produced this error.
    pub fn stage(&self) -> &'static str {
        match self {
            CaptureError::NoDeviceAvailable | CaptureError::DeviceOpen { .. } => "open_dev",
            CaptureError::PermissionDenied(_) => "permission",
            CaptureError::InterfaceBindFailed { .. } => "bind",
            CaptureError::ConfigurationFailed { .. } => "set_options",
            CaptureError::UnsupportedLinkType(_) => "check_dlt",
            CaptureError::InstallationRejected(_) | CaptureError::InvalidProgram(_) => {
                "set_filter"
            }
            CaptureError::AllocationFailed(_) => "alloc_buffer",
            CaptureError::ReadFailed(_) | CaptureError::SessionClosed => "read_packets",
            CaptureError::Sysctl(_) => "sysctl",
            CaptureError::Output(_) => "output",
            CaptureError::Unsupported(_) => "platform",
        }
    }
}

/// Returns true when `err` carries EACCES or EPERM.
pub(crate) fn is_permission(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EACCES) | Some(libc::EPERM))
        || err.kind() == io::ErrorKind::PermissionDenied
}
