use crate::errors::PersonaError;

/// Signals delivered to tracked agent processes.
pub trait ProcessSignaller: Send + Sync {
    /// Probes with the no-op signal. A process owned by someone else still
    /// counts as alive.
    fn is_alive(&self, pid: u32) -> bool;
    fn terminate(&self, pid: u32) -> Result<(), PersonaError>;
    fn kill(&self, pid: u32) -> Result<(), PersonaError>;
}

#[derive(Debug, Clone, Default)]
pub struct UnixSignaller;

impl UnixSignaller {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> std::io::Result<()> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {}", pid),
        ));
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, signal) };
    if result == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(unix)]
impl ProcessSignaller for UnixSignaller {
    fn is_alive(&self, pid: u32) -> bool {
        match send_signal(pid, 0) {
            Ok(()) => true,
            Err(err) => err.raw_os_error() == Some(libc::EPERM),
        }
    }

    fn terminate(&self, pid: u32) -> Result<(), PersonaError> {
        match send_signal(pid, libc::SIGTERM) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(()),
            Err(err) => Err(PersonaError::execution(format!(
                "SIGTERM to pid {} failed: {}",
                pid, err
            ))),
        }
    }

    fn kill(&self, pid: u32) -> Result<(), PersonaError> {
        match send_signal(pid, libc::SIGKILL) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(()),
            Err(err) => Err(PersonaError::execution(format!(
                "SIGKILL to pid {} failed: {}",
                pid, err
            ))),
        }
    }
}

#[cfg(not(unix))]
impl ProcessSignaller for UnixSignaller {
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn terminate(&self, _pid: u32) -> Result<(), PersonaError> {
        Err(PersonaError::execution(
            "process signals are only supported on Unix-like systems",
        ))
    }

    fn kill(&self, pid: u32) -> Result<(), PersonaError> {
        self.terminate(pid)
    }
}
