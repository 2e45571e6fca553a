use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::capture::CaptureOptions;

#[derive(Parser, Debug)]
#[command(
    name = "bpfcap",
    version,
    about = "Print Ethernet frames of SSH traffic seen on a BPF device"
)]
pub struct Cli {
    /// Network interface to capture on (e.g. en0)
    pub interface: String,

    /// Read timeout in seconds [default: 3.0]
    #[arg(long, default_value_t = 3.0, value_parser = validate_timeout)]
    pub timeout: f64,

    /// TCP port to match in either direction
    #[arg(long, default_value_t = 22, value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,
}

impl Cli {
    /// Capture options: the defaults with the requested timeout.
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            read_timeout: Duration::from_secs_f64(self.timeout),
            ..CaptureOptions::default()
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "rtdump",
    version,
    about = "Print destination and gateway of every kernel route"
)]
pub struct RtdumpCli {
    /// Address family to dump
    #[arg(value_enum, default_value_t = Family::All)]
    pub family: Family,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Inet6,
    All,
}

impl Family {
    /// Value for the family slot of the `NET_RT_DUMP` mib; 0 selects all.
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    pub fn to_af(self) -> libc::c_int {
        match self {
            Family::Inet => libc::AF_INET,
            Family::Inet6 => libc::AF_INET6,
            Family::All => 0,
        }
    }
}

fn validate_timeout(s: &str) -> Result<f64, String> {
    let val: f64 = s
        .parse()
        .map_err(|_| format!("'{s}' is not a valid number"))?;
    if !(0.1..=60.0).contains(&val) {
        Err("timeout must be between 0.1 and 60.0 seconds".to_string())
    } else {
        Ok(val)
    }
}
