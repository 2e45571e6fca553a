pub mod filter;
pub mod packet;

use std::fs::OpenOptions;
use std::io;
use std::os::fd::OwnedFd;

use crate::error::{CaptureError, is_permission};

// ---------------------------------------------------------------------------
// Datalink types (<net/bpf.h>)
// ---------------------------------------------------------------------------

pub const DLT_NULL: u32 = 0;
pub const DLT_EN10MB: u32 = 1;
pub const DLT_RAW: u32 = 12;
pub const DLT_LOOP: u32 = 108;

/// Human-readable name for a datalink type, for log lines.
pub fn link_type_name(dlt: u32) -> &'static str {
    match dlt {
        DLT_NULL => "null",
        DLT_EN10MB => "ethernet",
        DLT_RAW => "raw-ip",
        DLT_LOOP => "loop",
        _ => "unknown",
    }
}

// ---------------------------------------------------------------------------
// Device acquisition
// ---------------------------------------------------------------------------

/// Units probed before giving up.
pub const UNIT_CEILING: u32 = 256;

/// Opens one numbered BPF unit.
pub trait UnitOpener {
    type Handle;

    fn open_unit(&mut self, unit: u32) -> io::Result<Self::Handle>;
}

/// Opens `/dev/bpfN` read/write.
#[derive(Debug, Default)]
pub struct DevNodeOpener;

impl UnitOpener for DevNodeOpener {
    type Handle = OwnedFd;

    fn open_unit(&mut self, unit: u32) -> io::Result<OwnedFd> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(unit_path(unit))?;
        Ok(OwnedFd::from(file))
    }
}

pub fn unit_path(unit: u32) -> String {
    format!("/dev/bpf{unit}")
}

/// Scans units `0..ceiling` and returns the first one that opens.
///
/// A busy unit moves the scan on. A missing node after busy units ends the
/// pool; a missing node before any busy unit means there is no BPF device
/// at all and is returned as the open error. Any other failure stops the
/// scan and is returned, since it will not go away on the next unit.
pub fn acquire_with<O: UnitOpener>(
    opener: &mut O,
    ceiling: u32,
) -> Result<(u32, O::Handle), CaptureError> {
    let mut busy_seen = false;
    for unit in 0..ceiling {
        let err = match opener.open_unit(unit) {
            Ok(handle) => {
                log::info!("acquired {}", unit_path(unit));
                return Ok((unit, handle));
            }
            Err(err) => err,
        };

        match err.raw_os_error() {
            Some(libc::EBUSY) => {
                log::debug!("{} busy", unit_path(unit));
                busy_seen = true;
                continue;
            }
            Some(libc::ENOENT) if busy_seen => {
                log::debug!("{} does not exist, pool ends at {unit}", unit_path(unit));
                break;
            }
            _ if is_permission(&err) => {
                return Err(CaptureError::PermissionDenied(format!(
                    "open {}: {err}",
                    unit_path(unit)
                )));
            }
            _ => {
                return Err(CaptureError::DeviceOpen {
                    path: unit_path(unit),
                    source: err,
                });
            }
        }
    }

    Err(CaptureError::NoDeviceAvailable)
}

// ---------------------------------------------------------------------------
// BPF device (BSD / macOS)
// ---------------------------------------------------------------------------

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub use self::device::{BpfDevice, BpfStats};

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod device {
    use std::io;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::time::Duration;

    use super::filter::bpf_insn;
    use super::{DevNodeOpener, UNIT_CEILING, acquire_with, unit_path};
    use crate::error::CaptureError;

    // BSD _IOC encoding: direction bits [31:29] | size [28:16] | group [15:8] | number [7:0]
    const fn ioc(dir: u32, group: u8, num: u8, size: usize) -> libc::c_ulong {
        (dir | (((size as u32) & 0x1FFF) << 16) | ((group as u32) << 8) | num as u32)
            as libc::c_ulong
    }

    const IOC_OUT: u32 = 0x40000000;
    const IOC_IN: u32 = 0x80000000;

    const IFNAMSIZ: usize = 16;
    const IFREQ_SIZE: usize = 32;
    const U_INT: usize = size_of::<libc::c_uint>();

    const BIOCGBLEN: libc::c_ulong = ioc(IOC_OUT, b'B', 102, U_INT);
    const BIOCSETF: libc::c_ulong = ioc(IOC_IN, b'B', 103, size_of::<bpf_program>());
    const BIOCGDLT: libc::c_ulong = ioc(IOC_OUT, b'B', 106, U_INT);
    const BIOCSETIF: libc::c_ulong = ioc(IOC_IN, b'B', 108, IFREQ_SIZE);
    const BIOCSRTIMEOUT: libc::c_ulong = ioc(IOC_IN, b'B', 109, size_of::<libc::timeval>());
    const BIOCGSTATS: libc::c_ulong = ioc(IOC_OUT, b'B', 111, size_of::<bpf_stat>());
    const BIOCIMMEDIATE: libc::c_ulong = ioc(IOC_IN, b'B', 112, U_INT);
    const BIOCSHDRCMPLT: libc::c_ulong = ioc(IOC_IN, b'B', 117, U_INT);
    const BIOCSSEESENT: libc::c_ulong = ioc(IOC_IN, b'B', 119, U_INT);

    // Known values from <net/bpf.h> on 64-bit macOS.
    #[cfg(all(target_os = "macos", target_pointer_width = "64"))]
    const _: () = {
        assert!(BIOCGBLEN == 0x4004_4266);
        assert!(BIOCSETF == 0x8010_4267);
        assert!(BIOCGDLT == 0x4004_426A);
        assert!(BIOCSETIF == 0x8020_426C);
        assert!(BIOCSRTIMEOUT == 0x8010_426D);
        assert!(BIOCGSTATS == 0x4008_426F);
        assert!(BIOCIMMEDIATE == 0x8004_4270);
        assert!(BIOCSHDRCMPLT == 0x8004_4275);
        assert!(BIOCSSEESENT == 0x8004_4277);
    };

    #[allow(non_camel_case_types)]
    #[repr(C)]
    struct bpf_program {
        bf_len: libc::c_uint,
        bf_insns: *const bpf_insn,
    }

    #[allow(non_camel_case_types)]
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Default)]
    struct bpf_stat {
        bs_recv: libc::c_uint,
        bs_drop: libc::c_uint,
    }

    /// Kernel packet counters for one device.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct BpfStats {
        pub received: u32,
        pub dropped: u32,
    }

    /// An open `/dev/bpfN` unit.
    ///
    /// Dropping the handle closes the descriptor, which detaches the unit from
    /// its interface and returns it to the pool.
    #[derive(Debug)]
    pub struct BpfDevice {
        fd: OwnedFd,
        unit: u32,
    }

    impl BpfDevice {
        /// Takes the first free unit.
        pub fn acquire() -> Result<Self, CaptureError> {
            let (unit, fd) = acquire_with(&mut DevNodeOpener, UNIT_CEILING)?;
            Ok(Self { fd, unit })
        }

        pub fn unit(&self) -> u32 {
            self.unit
        }

        pub fn path(&self) -> String {
            unit_path(self.unit)
        }

        /// `BIOCSETIF`: attach to the named interface.
        pub fn bind(&self, interface: &str) -> io::Result<()> {
            let name = interface.as_bytes();
            if name.is_empty() || name.len() >= IFNAMSIZ || name.contains(&0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("invalid interface name {interface:?}"),
                ));
            }
            // struct ifreq: name in the first IFNAMSIZ bytes, union after it
            let mut ifreq = [0u8; IFREQ_SIZE];
            ifreq[..name.len()].copy_from_slice(name);
            self.ioctl(BIOCSETIF, ifreq.as_mut_ptr())
        }

        pub fn set_header_complete(&self, on: bool) -> io::Result<()> {
            self.set_flag(BIOCSHDRCMPLT, on)
        }

        pub fn set_see_sent(&self, on: bool) -> io::Result<()> {
            self.set_flag(BIOCSSEESENT, on)
        }

        pub fn set_immediate(&self, on: bool) -> io::Result<()> {
            self.set_flag(BIOCIMMEDIATE, on)
        }

        pub fn set_read_timeout(&self, timeout: Duration) -> io::Result<()> {
            let mut tv = libc::timeval {
                tv_sec: timeout.as_secs() as libc::time_t,
                tv_usec: timeout.subsec_micros() as libc::suseconds_t,
            };
            self.ioctl(BIOCSRTIMEOUT, &mut tv)
        }

        /// `BIOCGDLT`: datalink type of the attached interface.
        pub fn link_type(&self) -> io::Result<u32> {
            let mut dlt: libc::c_uint = 0;
            self.ioctl(BIOCGDLT, &mut dlt)?;
            Ok(dlt)
        }

        /// `BIOCSETF`: install a filter program. The kernel copies it.
        pub fn set_filter(&self, insns: &[bpf_insn]) -> io::Result<()> {
            let mut prog = bpf_program {
                bf_len: insns.len() as libc::c_uint,
                bf_insns: insns.as_ptr(),
            };
            self.ioctl(BIOCSETF, &mut prog)
        }

        /// `BIOCGBLEN`: size reads must use.
        pub fn buffer_len(&self) -> io::Result<usize> {
            let mut blen: libc::c_uint = 0;
            self.ioctl(BIOCGBLEN, &mut blen)?;
            Ok(blen as usize)
        }

        /// Blocking read of one buffer's worth of records.
        pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(n as usize)
        }

        /// `BIOCGSTATS`: packets seen and dropped by the kernel.
        pub fn stats(&self) -> io::Result<BpfStats> {
            let mut stats = bpf_stat::default();
            self.ioctl(BIOCGSTATS, &mut stats)?;
            Ok(BpfStats {
                received: stats.bs_recv,
                dropped: stats.bs_drop,
            })
        }

        fn set_flag(&self, request: libc::c_ulong, on: bool) -> io::Result<()> {
            let mut val = libc::c_uint::from(on);
            self.ioctl(request, &mut val)
        }

        fn ioctl<T>(&self, request: libc::c_ulong, arg: *mut T) -> io::Result<()> {
            if unsafe { libc::ioctl(self.fd.as_raw_fd(), request, arg) } != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }
}
