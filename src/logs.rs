//! Append-only per-server log files behind `/api/log` and `/api/logs/{server}`.
//!
//! Each logical server name maps to `<log_dir>/<name>.log`.  Lines are
//! prefixed with an RFC 3339 UTC timestamp.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};

use crate::{AppError, Result};

/// Name used when a log line carries no server name.
pub const DEFAULT_SERVER_NAME: &str = "proxy";

/// Most lines returned by [`LogStore::read`].
pub const MAX_READ_LINES: usize = 1000;

/// File-backed log sink.
pub struct LogStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LogStore {
    /// Create a store rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|err| {
            AppError::Config(format!(
                "failed to create log directory {}: {err}",
                dir.display()
            ))
        })?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Append `message` under `server_name` (or [`DEFAULT_SERVER_NAME`]).
    ///
    /// Multi-line messages become one timestamped line per input line.
    ///
    /// # Errors
    ///
    /// `AppError::BadRequest` for an unsafe server name, `AppError::Io` if the
    /// file cannot be written.
    pub fn append(&self, server_name: Option<&str>, message: &str) -> Result<()> {
        let path = self.path_for(server_name.unwrap_or(DEFAULT_SERVER_NAME))?;
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        let mut wrote = false;
        for line in message.lines() {
            writeln!(writer, "[{stamp}] {line}")?;
            wrote = true;
        }
        if !wrote {
            writeln!(writer, "[{stamp}] ")?;
        }
        writer.flush()?;
        Ok(())
    }

    /// The last [`MAX_READ_LINES`] lines logged under `server_name`.
    ///
    /// A name with no log yet yields an empty list.
    ///
    /// # Errors
    ///
    /// `AppError::BadRequest` for an unsafe server name, `AppError::Io` if the
    /// file exists but cannot be read.
    pub fn read(&self, server_name: &str) -> Result<Vec<String>> {
        let path = self.path_for(server_name)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let lines: Vec<&str> = raw.lines().collect();
        let skip = lines.len().saturating_sub(MAX_READ_LINES);
        Ok(lines[skip..].iter().map(|l| (*l).to_owned()).collect())
    }

    fn path_for(&self, server_name: &str) -> Result<PathBuf> {
        validate_name(server_name)?;
        Ok(self.dir.join(format!("{server_name}.log")))
    }
}

/// Accept only names that stay a single file inside the log directory.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(AppError::BadRequest("server name must be 1-128 characters".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(AppError::BadRequest(format!(
            "server name {name:?} contains unsupported characters"
        )));
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => Err(AppError::BadRequest(format!(
            "server name {name:?} is not a plain file name"
        ))),
    }
}
