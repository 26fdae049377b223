use std::io::{self, BufReader, Write};

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::Receiver;
use log::info;

use vision_worker::config::{WorkerArgs, WorkerConfig};
use vision_worker::engine::default_engine;
use vision_worker::logging::setup_logging;
use vision_worker::worker::run_worker_until;

fn main() {
    let args = WorkerArgs::parse();

    match setup_logging(args.log_level, args.log_dir.as_deref()) {
        Ok(Some(path)) => info!("[WORKER] Logging to {}", path.display()),
        Ok(None) => {}
        Err(e) => eprintln!("[WORKER] Failed to set up logging: {e}"),
    }

    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("[WORKER] Fatal: {e:#}");
            eprintln!("[WORKER] Fatal: {e:#}");
            std::process::exit(2);
        }
    }
}

fn run(args: &WorkerArgs) -> anyhow::Result<i32> {
    // Before any thread is spawned, so every thread inherits the signal mask.
    let interrupts = interrupt_signals().context("failed to install the SIGINT handler")?;
    let output = protocol_stdout().context("failed to reserve stdout for the protocol")?;
    let engine = default_engine();
    let config = WorkerConfig::from(args);

    let exit = run_worker_until(BufReader::new(io::stdin()), output, engine, config, interrupts)
        .context("failed to start the worker")?;
    info!("[WORKER] Exiting ({exit:?})");
    Ok(exit.exit_code())
}

/// Take over the protocol stream.
///
/// Native libraries print to file descriptor 1 directly. The original stdout
/// is duplicated for the protocol and descriptor 1 is pointed at stderr, so
/// stray prints cannot corrupt the JSON Lines stream.
#[cfg(unix)]
fn protocol_stdout() -> io::Result<Box<dyn Write + Send>> {
    use std::fs::File;
    use std::os::fd::FromRawFd;

    io::stdout().flush()?;
    // SAFETY: plain descriptor syscalls; the duplicated fd is owned by the File below.
    let protocol_fd = unsafe { libc::dup(libc::STDOUT_FILENO) };
    if protocol_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::dup2(libc::STDERR_FILENO, libc::STDOUT_FILENO) } < 0 {
        let err = io::Error::last_os_error();
        log::warn!("[WORKER] Could not redirect native stdout to stderr: {err}");
    }
    // SAFETY: `protocol_fd` is a fresh descriptor nobody else owns.
    Ok(Box::new(unsafe { File::from_raw_fd(protocol_fd) }))
}

#[cfg(not(unix))]
fn protocol_stdout() -> io::Result<Box<dyn Write + Send>> {
    Ok(Box::new(io::stdout()))
}

/// Turn SIGINT into a message for the command loop, which drains the pool
/// like it does on `shutdown`. A second SIGINT exits immediately.
#[cfg(unix)]
fn interrupt_signals() -> io::Result<Receiver<()>> {
    use std::{mem, ptr, thread};

    // SAFETY: builds a local signal set and blocks it for the calling thread;
    // threads spawned afterwards inherit the mask.
    let set = unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGINT);
        set
    };
    let rc = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut()) };
    if rc != 0 {
        return Err(io::Error::from_raw_os_error(rc));
    }

    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name("vision_signals".to_string())
        .spawn(move || {
            let mut interrupted = false;
            loop {
                let mut signal = 0;
                // SAFETY: waits on the set blocked above.
                if unsafe { libc::sigwait(&set, &mut signal) } != 0 {
                    break;
                }
                if interrupted {
                    log::warn!("[WORKER] Interrupted again, exiting without draining");
                    std::process::exit(130);
                }
                interrupted = true;
                info!("[WORKER] Received SIGINT, draining");
                let _ = tx.try_send(());
            }
        })?;
    Ok(rx)
}

#[cfg(not(unix))]
fn interrupt_signals() -> io::Result<Receiver<()>> {
    Ok(crossbeam_channel::never())
}
