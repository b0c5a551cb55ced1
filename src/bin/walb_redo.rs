//! `walb-redo`: replay a serialized walblog stream (read from stdin) onto a
//! raw target device given as a positional argument.
//!
//! Grounded on `tool/wlog/wlredo.cpp`'s `Config` (argc/argv parsing, no
//! flags) and its direct-IO device open.

use std::fs::OpenOptions;
use std::io::{self, BufReader};

use tracing_subscriber::EnvFilter;

use walb_core::device::FileDevice;
use walb_core::redo::{RedoEngine, WalbLogHeader};

fn usage(program: &str) -> ! {
    eprintln!("usage: {program} <target-device-path>");
    eprintln!("reads a serialized walb log from stdin and applies it to the target device");
    std::process::exit(1);
}

#[cfg(unix)]
fn open_target(path: &str) -> io::Result<std::fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_DIRECT)
        .open(path)
}

#[cfg(not(unix))]
fn open_target(path: &str) -> io::Result<std::fs::File> {
    OpenOptions::new().read(true).write(true).open(path)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        usage(&args[0]);
    }
    let device_path = &args[1];

    let target_file = match open_target(device_path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("failed to open target device {device_path}: {e}");
            std::process::exit(1);
        }
    };
    let target = FileDevice::from_file(target_file);

    let stdin = io::stdin();
    let mut stream = BufReader::new(stdin.lock());

    let header = match WalbLogHeader::read_from(&mut stream) {
        Ok(h) => h,
        Err(e) => {
            eprintln!("failed to read walblog header: {e}");
            std::process::exit(1);
        }
    };
    tracing::info!(
        physical_block_size = header.physical_block_size,
        salt = header.log_checksum_salt,
        "replaying log stream"
    );

    let cfg = walb_core::WalbConfig::default();
    let engine = RedoEngine::new(&header, cfg.redo_merge_cap_bytes, cfg.redo_buffer_bytes);
    match engine.run(&mut stream, &target) {
        Ok(stats) => {
            tracing::info!(
                logpacks = stats.logpacks_applied,
                records = stats.records_applied,
                ios = stats.ios_submitted,
                "replay finished"
            );
        }
        Err(e) => {
            eprintln!("replay failed: {e}");
            std::process::exit(1);
        }
    }
}
