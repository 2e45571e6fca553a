use std::io;

use crate::bpf::{DLT_EN10MB, link_type_name};
use crate::bpf::filter::FilterProgram;
use crate::bpf::packet::{BufferLayout, Frames};
use crate::error::{CaptureError, is_permission};

use super::{CaptureDevice, CaptureOptions, CaptureStats};

/// A configured device bound to one interface, plus the buffer its reads
/// land in.
///
/// Opening runs the whole startup sequence; a session that exists is ready
/// to read. Any failure during startup drops the device, which returns the
/// unit to the pool.
pub struct CaptureSession<D: CaptureDevice> {
    device: Option<D>,
    buffer: Vec<u8>,
    interface: String,
    layout: BufferLayout,
}

impl<D: CaptureDevice> CaptureSession<D> {
    /// Bind, configure, check the link type, install `filter` and size the
    /// read buffer, in that order.
    pub fn open(
        device: D,
        interface: &str,
        options: &CaptureOptions,
        filter: &FilterProgram,
    ) -> Result<Self, CaptureError> {
        Self::open_with_layout(device, interface, options, filter, BufferLayout::NATIVE)
    }

    /// Like [`open`](Self::open), decoding buffers with an explicit layout.
    pub fn open_with_layout(
        mut device: D,
        interface: &str,
        options: &CaptureOptions,
        filter: &FilterProgram,
        layout: BufferLayout,
    ) -> Result<Self, CaptureError> {
        let unit = device.unit();

        device.bind(interface).map_err(|source| {
            classify("BIOCSETIF", source, |source| CaptureError::InterfaceBindFailed {
                interface: interface.to_string(),
                source,
            })
        })?;
        log::info!("bpf{unit}: bound to {interface}");

        for option in options.device_options() {
            device.set_option(option).map_err(|source| {
                classify(option.name(), source, |source| {
                    CaptureError::ConfigurationFailed {
                        option: option.name(),
                        source,
                    }
                })
            })?;
        }

        let dlt = device.link_type().map_err(|source| {
            classify("BIOCGDLT", source, |source| CaptureError::ConfigurationFailed {
                option: "BIOCGDLT",
                source,
            })
        })?;
        log::info!("bpf{unit}: link type {} ({dlt})", link_type_name(dlt));
        if dlt != DLT_EN10MB {
            return Err(CaptureError::UnsupportedLinkType(dlt));
        }

        device.install_filter(&filter.encode()).map_err(|source| {
            classify("BIOCSETF", source, CaptureError::InstallationRejected)
        })?;
        log::debug!("bpf{unit}: installed {}-instruction filter", filter.len());

        let len = device.buffer_len().map_err(|source| {
            classify("BIOCGBLEN", source, |e| {
                CaptureError::AllocationFailed(format!("BIOCGBLEN: {e}"))
            })
        })?;
        if len == 0 {
            return Err(CaptureError::AllocationFailed(
                "device reported a zero-length buffer".to_string(),
            ));
        }
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|e| CaptureError::AllocationFailed(format!("{len} bytes: {e}")))?;
        buffer.resize(len, 0);

        log::info!("bpf{unit}: capturing on {interface}, buffer {len} bytes");
        Ok(Self {
            device: Some(device),
            buffer,
            interface: interface.to_string(),
            layout,
        })
    }

    /// Blocks for one read and returns the frames it delivered.
    ///
    /// A read that times out yields an empty iterator. Interrupted reads are
    /// retried. Any other failure releases the session; later calls return
    /// [`CaptureError::SessionClosed`].
    pub fn read_cycle(&mut self) -> Result<Frames<'_>, CaptureError> {
        let Some(device) = self.device.as_mut() else {
            return Err(CaptureError::SessionClosed);
        };

        let result = loop {
            match device.read(&mut self.buffer) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    log::warn!("read on {} interrupted, retrying", self.interface);
                    continue;
                }
                other => break other,
            }
        };

        let filled = match result {
            Ok(n) => n.min(self.buffer.len()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => {
                log::warn!("read on {} failed: {e}", self.interface);
                self.release();
                return Err(CaptureError::ReadFailed(e));
            }
        };

        if filled == 0 {
            log::trace!("read timeout on {}", self.interface);
            return Ok(Frames::empty(self.layout));
        }
        log::debug!("read {filled} bytes from {}", self.interface);
        Ok(Frames::new(&self.buffer[..filled], self.layout))
    }

    /// Kernel receive/drop counters.
    pub fn stats(&mut self) -> Result<CaptureStats, CaptureError> {
        let device = self.device.as_mut().ok_or(CaptureError::SessionClosed)?;
        device
            .stats()
            .map_err(|source| CaptureError::ConfigurationFailed {
                option: "BIOCGSTATS",
                source,
            })
    }

    /// Returns the device to the pool and frees the buffer. Safe to call
    /// more than once.
    pub fn release(&mut self) {
        if let Some(device) = self.device.take() {
            log::debug!("bpf{}: released", device.unit());
        }
        self.buffer = Vec::new();
    }

    pub fn is_open(&self) -> bool {
        self.device.is_some()
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Size of the read buffer; zero once released.
    pub fn buffer_len(&self) -> usize {
        self.buffer.len()
    }
}

/// Maps an ioctl failure to `PermissionDenied` when it is one, otherwise
/// to the step's own error.
fn classify(
    step: &str,
    source: io::Error,
    other: impl FnOnce(io::Error) -> CaptureError,
) -> CaptureError {
    if is_permission(&source) {
        CaptureError::PermissionDenied(format!("{step}: {source}"))
    } else {
        other(source)
    }
}
