//! Per-session named pipes
//!
//! The managed agent writes `DONE:<id>` or `ASK:<id>` lines into
//! `<fifo_dir>/<id>.fifo`; the orchestrator writes `SHUTDOWN` to stop the
//! reader. Reads are blocking, so each session gets a dedicated OS thread
//! that forwards parsed lines into a tokio channel.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

pub const SHUTDOWN_SENTINEL: &str = "SHUTDOWN";

/// One line read from a session FIFO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FifoSignal {
    Done(String),
    Ask(String),
    Shutdown,
    Unknown(String),
}

impl FifoSignal {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if let Some(id) = line.strip_prefix("DONE:") {
            FifoSignal::Done(id.trim().to_string())
        } else if let Some(id) = line.strip_prefix("ASK:") {
            FifoSignal::Ask(id.trim().to_string())
        } else if line == SHUTDOWN_SENTINEL {
            FifoSignal::Shutdown
        } else {
            FifoSignal::Unknown(line.to_string())
        }
    }
}

// ============================================================================
// Paths and files
// ============================================================================

pub fn fifo_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.fifo", session_id))
}

pub fn prompt_path(dir: &Path, session_id: &str) -> PathBuf {
    dir.join(format!("{}.prompt", session_id))
}

/// Create the FIFO directory (0700) if missing.
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// `mkfifo` with mode 0600. An existing FIFO at the path is reused.
pub fn create_fifo(dir: &Path, session_id: &str) -> io::Result<PathBuf> {
    ensure_dir(dir)?;
    let path = fifo_path(dir, session_id);
    let c_path = CString::new(path.as_os_str().as_bytes())?;

    // SAFETY: c_path is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    Ok(path)
}

pub fn remove_fifo(dir: &Path, session_id: &str) -> io::Result<()> {
    remove_if_exists(&fifo_path(dir, session_id))
}

/// Write the initial prompt to `<id>.prompt` (0600) so the launch command
/// can `cat` it instead of typing it through the terminal.
pub fn write_prompt_file(dir: &Path, session_id: &str, prompt: &str) -> io::Result<PathBuf> {
    ensure_dir(dir)?;
    let path = prompt_path(dir, session_id);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&path)?;
    file.write_all(prompt.as_bytes())?;
    Ok(path)
}

pub fn remove_prompt_file(dir: &Path, session_id: &str) -> io::Result<()> {
    remove_if_exists(&prompt_path(dir, session_id))
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Wake a blocked reader with `SHUTDOWN`. The open is non-blocking, so with
/// no reader attached (ENXIO) or no FIFO at all this is a no-op.
pub fn write_sentinel(path: &Path) {
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path);

    match file {
        Ok(mut f) => {
            if let Err(e) = f.write_all(format!("{}\n", SHUTDOWN_SENTINEL).as_bytes()) {
                tracing::debug!(path = %path.display(), error = %e, "Sentinel write failed");
            }
        }
        Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {}
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Sentinel open failed");
        }
    }
}

// ============================================================================
// Reader thread
// ============================================================================

/// Start a detached thread reading `path` and return the receiving end.
///
/// The thread reopens the FIFO after every writer EOF. It exits after
/// forwarding `SHUTDOWN`, when the FIFO can no longer be opened, or when the
/// receiver is dropped.
pub fn spawn_reader(path: PathBuf, session_id: &str) -> io::Result<mpsc::UnboundedReceiver<FifoSignal>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let thread_name = format!("fifo-{}", session_id);

    std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || read_loop(&path, &tx))?;

    Ok(rx)
}

fn read_loop(path: &Path, tx: &mpsc::UnboundedSender<FifoSignal>) {
    loop {
        // Blocks until a writer opens the other end.
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "FIFO open failed, reader exiting");
                return;
            }
        };

        for line in BufReader::new(file).lines() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "FIFO read error");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let signal = FifoSignal::parse(&line);
            let stop = signal == FifoSignal::Shutdown;
            if tx.send(signal).is_err() || stop {
                return;
            }
        }
    }
}
