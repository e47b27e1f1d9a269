use crate::constants::permissions::PRIVATE_FILE;
use crate::errors::PersonaError;
use crate::utils::fs_atomic::ensure_private_dir;
use crate::utils::paths::account_file_stem;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive advisory lock on one account alias. Held for the lifetime of the
/// value; the kernel releases it when the file descriptor closes.
#[derive(Debug)]
pub struct AccountLock {
    alias: String,
    path: PathBuf,
    _file: File,
}

impl AccountLock {
    pub fn try_acquire(dir: &Path, alias: &str) -> Result<Self, PersonaError> {
        ensure_private_dir(dir).map_err(|err| {
            PersonaError::internal(format!("Failed to create lock directory: {}", err))
        })?;
        let path = dir.join(format!("{}.lock", account_file_stem(alias)));
        let mut options = OpenOptions::new();
        options.create(true).read(true).write(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(PRIVATE_FILE);
        }
        let file = options.open(&path).map_err(|err| {
            PersonaError::internal(format!("Failed to open lock file: {}", err))
        })?;
        lock_exclusive_nonblocking(&file).map_err(|err| {
            if err.kind() == std::io::ErrorKind::WouldBlock {
                PersonaError::conflict(format!(
                    "Account '{}' is already being switched by another process",
                    alias
                ))
                .with_hint("Wait for the other switch to finish, then retry.")
            } else {
                PersonaError::internal(format!("Failed to lock account '{}': {}", alias, err))
            }
        })?;
        Ok(Self {
            alias: alias.to_string(),
            path,
            _file: file,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn lock_exclusive_nonblocking(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "lock is held",
        ));
    }
    Err(err)
}

#[cfg(not(unix))]
fn lock_exclusive_nonblocking(_file: &File) -> std::io::Result<()> {
    Ok(())
}
