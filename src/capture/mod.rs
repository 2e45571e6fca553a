// Platform-abstracted capture session.
//
// `CaptureDevice` is the seam between the session logic and the kernel:
//   - on macOS/FreeBSD it is implemented by `BpfDevice` (see bsd.rs)
//   - tests drive the session with scripted devices
//
// `CaptureSession` owns one device, its read buffer, and the decode step.

use std::io;
use std::time::Duration;

use crate::bpf::filter::bpf_insn;

pub mod session;

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod bsd;

pub use session::CaptureSession;

/// Capture-mode settings applied once when a session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Link-level source addresses of written frames are taken as-is (`BIOCSHDRCMPLT`).
    pub header_complete: bool,
    /// Also capture frames sent by this host (`BIOCSSEESENT`).
    pub see_sent: bool,
    /// Return from `read` as soon as a frame arrives instead of when the
    /// buffer fills (`BIOCIMMEDIATE`).
    pub immediate: bool,
    /// Upper bound on how long a `read` blocks (`BIOCSRTIMEOUT`).
    pub read_timeout: Duration,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            header_complete: true,
            see_sent: true,
            immediate: true,
            read_timeout: Duration::from_secs(3),
        }
    }
}

impl CaptureOptions {
    /// The settings in the order they are applied.
    pub fn device_options(&self) -> [DeviceOption; 4] {
        [
            DeviceOption::HeaderComplete(self.header_complete),
            DeviceOption::SeeSent(self.see_sent),
            DeviceOption::Immediate(self.immediate),
            DeviceOption::ReadTimeout(self.read_timeout),
        ]
    }
}

/// A single capture-mode setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOption {
    HeaderComplete(bool),
    SeeSent(bool),
    Immediate(bool),
    ReadTimeout(Duration),
}

impl DeviceOption {
    /// The ioctl that applies this option, for error messages.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceOption::HeaderComplete(_) => "BIOCSHDRCMPLT",
            DeviceOption::SeeSent(_) => "BIOCSSEESENT",
            DeviceOption::Immediate(_) => "BIOCIMMEDIATE",
            DeviceOption::ReadTimeout(_) => "BIOCSRTIMEOUT",
        }
    }
}

/// Kernel counters reported by a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    pub received: u32,
    pub dropped: u32,
}

/// Operations a capture session needs from an acquired device.
pub trait CaptureDevice {
    /// Unit number, for log lines.
    fn unit(&self) -> u32;

    fn bind(&mut self, interface: &str) -> io::Result<()>;

    fn set_option(&mut self, option: DeviceOption) -> io::Result<()>;

    fn link_type(&mut self) -> io::Result<u32>;

    fn install_filter(&mut self, program: &[bpf_insn]) -> io::Result<()>;

    /// Size of the buffer every `read` must supply.
    fn buffer_len(&mut self) -> io::Result<usize>;

    /// Blocking read. `Ok(0)` means the read timeout elapsed.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn stats(&mut self) -> io::Result<CaptureStats>;
}
