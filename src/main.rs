use clap::Parser;

use bpfcap::cli::Cli;
use bpfcap::error::CaptureError;

/// Exit codes: 0 clean shutdown, 1 permission, 2 device, 3 setup, 4 runtime.
fn exit_code(err: &CaptureError) -> i32 {
    match err {
        CaptureError::PermissionDenied(_) => 1,
        CaptureError::NoDeviceAvailable | CaptureError::DeviceOpen { .. } => 2,
        CaptureError::InterfaceBindFailed { .. }
        | CaptureError::ConfigurationFailed { .. }
        | CaptureError::UnsupportedLinkType(_)
        | CaptureError::InstallationRejected(_)
        | CaptureError::InvalidProgram(_) => 3,
        _ => 4,
    }
}

fn main() {
    env_logger::init();

    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("error: {}: {e}", e.stage());
            std::process::exit(exit_code(&e));
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
use bsd::run;

#[cfg(not(any(target_os = "macos", target_os = "freebsd")))]
fn run(_cli: &Cli) -> Result<(), CaptureError> {
    Err(CaptureError::Unsupported("BPF capture"))
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod bsd {
    use std::io::{self, Write};
    use std::sync::atomic::{AtomicBool, Ordering};

    use bpfcap::bpf::BpfDevice;
    use bpfcap::bpf::filter::tcp_port_filter;
    use bpfcap::capture::{CaptureDevice, CaptureSession};
    use bpfcap::cli::Cli;
    use bpfcap::error::CaptureError;
    use bpfcap::output;

    /// Global shutdown flag, set by signal handlers.
    static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

    extern "C" fn signal_handler(_sig: libc::c_int) {
        SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
    }

    fn install_signal_handlers() {
        unsafe {
            libc::signal(
                libc::SIGTERM,
                signal_handler as *const () as libc::sighandler_t,
            );
            libc::signal(
                libc::SIGINT,
                signal_handler as *const () as libc::sighandler_t,
            );
        }
    }

    pub fn run(cli: &Cli) -> Result<(), CaptureError> {
        install_signal_handlers();

        let filter = tcp_port_filter(cli.port)?;
        log::debug!("filter program:\n{filter}");

        let device = BpfDevice::acquire()?;
        let mut session =
            CaptureSession::open(device, &cli.interface, &cli.capture_options(), &filter)?;

        let result = capture_loop(&mut session);

        match session.stats() {
            Ok(st) => log::info!(
                "{} exit: kernel_recv={}, kernel_drop={}",
                session.interface(),
                st.received,
                st.dropped
            ),
            Err(e) => log::debug!("no kernel stats for {}: {e}", session.interface()),
        }
        session.release();
        result
    }

    /// Reads and prints until a signal arrives or a read fails.
    fn capture_loop<D: CaptureDevice>(session: &mut CaptureSession<D>) -> Result<(), CaptureError> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        let mut cycles: u64 = 0;
        let mut frames: u64 = 0;

        while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
            let records = session.read_cycle()?;
            cycles += 1;
            frames += output::write_records(&mut out, records).map_err(CaptureError::Output)? as u64;
            out.flush().map_err(CaptureError::Output)?;
        }

        log::info!(
            "{}: shutdown requested after {} reads, {} frames",
            session.interface(),
            cycles,
            frames
        );
        Ok(())
    }
}
