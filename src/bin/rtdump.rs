use clap::Parser;

use bpfcap::cli::RtdumpCli;
use bpfcap::error::CaptureError;

fn main() {
    env_logger::init();

    let cli = RtdumpCli::parse();

    if let Err(e) = run(&cli) {
        eprintln!("error: {}: {e}", e.stage());
        std::process::exit(match e {
            CaptureError::PermissionDenied(_) => 1,
            _ => 4,
        });
    }
}

#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn run(cli: &RtdumpCli) -> Result<(), CaptureError> {
    use std::io::{self, Write};

    use bpfcap::route::{self, RouteLayout, RouteMessages};

    let buf = route::dump(cli.family.to_af())?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut count = 0;
    for entry in RouteMessages::new(&buf, RouteLayout::NATIVE) {
        writeln!(out, "{entry}").map_err(CaptureError::Output)?;
        count += 1;
    }
    log::info!("{count} routes from {} bytes", buf.len());
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "freebsd")))]
fn run(_cli: &RtdumpCli) -> Result<(), CaptureError> {
    Err(CaptureError::Unsupported("routing table dump"))
}
