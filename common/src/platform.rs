//! Pipe creation strategies.
//!
//! A [`PipePlatform`] decides which access policy a new pipe gets. The host
//! picks one at startup with [`select_platform`]; everything downstream only
//! sees the trait.

use crate::{
    config::{PipeName, PipeSecurityMode},
    error::{IpcError, Result},
    platform_socket::PipeListener,
    security::{OwnerId, PipeSecurityDescriptor},
};

/// Creates server pipes with a platform-appropriate access policy
pub trait PipePlatform: Send + Sync {
    /// Binds a new pipe under `name`
    fn create_pipe(&self, name: &PipeName) -> Result<PipeListener>;

    /// Descriptor applied to created pipes, `None` for the OS default
    fn security_descriptor(&self) -> Option<&PipeSecurityDescriptor> {
        None
    }
}

/// Lets the OS apply its default access policy
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPipePlatform;

impl PipePlatform for DefaultPipePlatform {
    fn create_pipe(&self, name: &PipeName) -> Result<PipeListener> {
        PipeListener::bind(name, None)
    }
}

/// Grants access broadly enough for a peer whose user or sandbox is unknown
/// in advance.
#[derive(Debug, Clone)]
pub struct SandboxedPipePlatform {
    descriptor: PipeSecurityDescriptor,
}

impl SandboxedPipePlatform {
    /// Builds the descriptor for the current process identity.
    ///
    /// Fails with `PlatformUnsupported` where no pipe security model exists.
    pub fn new() -> Result<Self> {
        let owner = owning_identity()?;
        if let Some(owner) = &owner {
            tracing::info!("Pipe owner differs from current user: {:?}", owner);
        }
        Ok(Self {
            descriptor: PipeSecurityDescriptor::sandboxed(owner),
        })
    }

    /// Uses a caller-built descriptor instead of the sandbox defaults
    pub fn with_descriptor(descriptor: PipeSecurityDescriptor) -> Self {
        Self { descriptor }
    }
}

impl PipePlatform for SandboxedPipePlatform {
    fn create_pipe(&self, name: &PipeName) -> Result<PipeListener> {
        PipeListener::bind(name, Some(&self.descriptor))
    }

    fn security_descriptor(&self) -> Option<&PipeSecurityDescriptor> {
        Some(&self.descriptor)
    }
}

/// Picks the pipe strategy for this process at startup
pub fn select_platform(mode: PipeSecurityMode) -> Result<Box<dyn PipePlatform>> {
    tracing::debug!("Selecting pipe platform for {:?} security", mode);
    match mode {
        PipeSecurityMode::Default => Ok(Box::new(DefaultPipePlatform)),
        PipeSecurityMode::Sandboxed => Ok(Box::new(SandboxedPipePlatform::new()?)),
    }
}

/// The account that should own pipes when it differs from the current user.
///
/// On Unix that is the invoking user of a `sudo` session; on Windows it is the
/// token owner SID.
#[cfg(unix)]
fn owning_identity() -> Result<Option<OwnerId>> {
    if !nix::unistd::geteuid().is_root() {
        return Ok(None);
    }
    let Ok(sudo_user) = std::env::var("SUDO_USER") else {
        tracing::debug!("Running as root but SUDO_USER not set, keeping root ownership");
        return Ok(None);
    };

    match get_user_ids(&sudo_user) {
        Ok((uid, gid)) if uid != nix::unistd::getuid().as_raw() => {
            Ok(Some(OwnerId::Unix { uid, gid }))
        }
        Ok(_) => Ok(None),
        Err(e) => {
            tracing::warn!("Failed to get user IDs for {}: {}", sudo_user, e);
            Ok(None)
        }
    }
}

#[cfg(windows)]
fn owning_identity() -> Result<Option<OwnerId>> {
    let (user, owner) = crate::platform_socket::windows_security::token_sids()?;
    Ok((user != owner).then_some(OwnerId::Sid(owner)))
}

#[cfg(not(any(unix, windows)))]
fn owning_identity() -> Result<Option<OwnerId>> {
    Err(IpcError::PlatformUnsupported {
        platform: std::env::consts::OS.to_string(),
    })
}

/// Helper function to get user ID and group ID from username
#[cfg(unix)]
fn get_user_ids(username: &str) -> Result<(u32, u32)> {
    use std::ffi::CString;

    let username_cstring = CString::new(username).map_err(|_| IpcError::InvalidName {
        name:   username.to_string(),
        reason: "user name contains a NUL byte",
    })?;

    // SAFETY: getpwnam is safe when called with a valid C string pointer.
    // The returned pointer is either null (handled) or points to a valid passwd
    // struct. We check for null before dereferencing and only access standard
    // fields.
    unsafe {
        let passwd = libc::getpwnam(username_cstring.as_ptr());
        if passwd.is_null() {
            return Err(IpcError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("User '{username}' not found"),
            )));
        }

        Ok(((*passwd).pw_uid, (*passwd).pw_gid))
    }
}
