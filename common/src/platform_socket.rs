#[cfg(windows)]
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
#[cfg(unix)]
use std::{
    net::Shutdown,
    os::unix::net::{UnixListener, UnixStream},
    path::PathBuf,
};
#[cfg(windows)]
use std::sync::Arc;
use std::{
    io::{self, Read, Write},
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

// cfg for unix except macos
#[cfg(all(unix, not(target_os = "macos")))]
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
#[cfg(windows)]
use windows_sys::Win32::{
    Foundation::*, Security::*, Storage::FileSystem::*, System::Pipes::*,
    System::Threading::*,
};

use crate::{
    config::{PipeName, ACCEPT_POLL_INTERVAL},
    error::{IpcError, Result},
    security::PipeSecurityDescriptor,
};

/// One end of a connected pipe.
///
/// The OS handle is released when the value is dropped; `Connection` owns the
/// only instance so that happens on one path.
pub enum PipeStream {
    #[cfg(unix)]
    /// Unix domain socket
    Unix(UnixStream),
    #[cfg(windows)]
    /// Windows named pipe handle; `broken` is raised by the paired
    /// [`PipeBreaker`] and fails every later read
    NamedPipe {
        handle: OwnedHandle,
        broken: Arc<AtomicBool>,
    },
}

/// Server side of a named pipe, bound to its name until dropped.
pub struct PipeListener {
    #[cfg(unix)]
    listener: UnixListener,
    #[cfg(unix)]
    path:     PathBuf,
    #[cfg(unix)]
    inode:    (u64, u64),

    #[cfg(windows)]
    path:     Vec<u16>,
    #[cfg(windows)]
    security: Option<windows_security::SecurityAttributes>,
    /// Next instance clients will connect to; always present so the name stays
    /// claimed
    #[cfg(windows)]
    pending:  OwnedHandle,

    name: PipeName,
}

/// Unblocks a read in progress on a [`PipeStream`] from another thread
pub struct PipeBreaker {
    #[cfg(unix)]
    stream: UnixStream,
    #[cfg(windows)]
    thread: OwnedHandle,
    #[cfg(windows)]
    broken: Arc<AtomicBool>,
}

/// Process credentials of the connected peer
#[derive(Debug)]
pub struct ClientCredentials {
    /// Process ID of the client
    pub pid: u32,
    /// User ID of the client, when the platform reports one
    pub uid: Option<u32>,
}

impl PipeStream {
    /// Set read timeout for the pipe
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(stream) => stream.set_read_timeout(timeout),
            #[cfg(windows)]
            PipeStream::NamedPipe { .. } => {
                // Synchronous pipe handles have no per-read timeout; blocked
                // reads are cancelled through PipeBreaker instead
                let _ = timeout;
                Ok(())
            }
        }
    }

    /// Set write timeout for the pipe
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(stream) => stream.set_write_timeout(timeout),
            #[cfg(windows)]
            PipeStream::NamedPipe { .. } => {
                let _ = timeout;
                Ok(())
            }
        }
    }

    /// Creates a breaker for reads issued on the current thread.
    ///
    /// On Unix the breaker shuts the socket down; on Windows it cancels
    /// synchronous I/O on the calling thread, so it must be created on the
    /// thread that will do the reading.
    pub fn breaker(&self) -> io::Result<PipeBreaker> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(stream) => Ok(PipeBreaker {
                stream: stream.try_clone()?,
            }),
            #[cfg(windows)]
            PipeStream::NamedPipe { broken, .. } => {
                let mut thread: HANDLE = std::ptr::null_mut();
                // SAFETY: pseudo handles from GetCurrentProcess/GetCurrentThread
                // are always valid; DuplicateHandle writes a real handle into
                // `thread` which we take ownership of on success.
                let ok = unsafe {
                    DuplicateHandle(
                        GetCurrentProcess(),
                        GetCurrentThread(),
                        GetCurrentProcess(),
                        &mut thread,
                        0,
                        0,
                        DUPLICATE_SAME_ACCESS,
                    )
                };
                if ok == 0 {
                    return Err(io::Error::last_os_error());
                }
                // SAFETY: `thread` is a freshly duplicated handle owned by us
                Ok(PipeBreaker {
                    thread: unsafe { OwnedHandle::from_raw_handle(thread) },
                    broken: Arc::clone(broken),
                })
            }
        }
    }

    /// Extract the peer's process credentials
    pub fn peer_credentials(&self) -> Result<ClientCredentials> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(stream) => {
                #[cfg(not(target_os = "macos"))]
                {
                    let creds = getsockopt(stream, PeerCredentials)
                        .map_err(|e| IpcError::Io(io::Error::from(e)))?;
                    Ok(ClientCredentials {
                        pid: creds.pid() as u32,
                        uid: Some(creds.uid()),
                    })
                }

                #[cfg(target_os = "macos")]
                {
                    use std::os::unix::io::AsRawFd;

                    let mut uid: libc::uid_t = 0;
                    let mut gid: libc::gid_t = 0;
                    // SAFETY: valid fd from a live stream and stack out-params
                    let result =
                        unsafe { libc::getpeereid(stream.as_raw_fd(), &mut uid, &mut gid) };
                    if result != 0 {
                        return Err(IpcError::Io(io::Error::last_os_error()));
                    }

                    let mut pid: libc::pid_t = 0;
                    let mut pid_len = std::mem::size_of::<libc::pid_t>() as libc::socklen_t;
                    // SAFETY: LOCAL_PEERPID writes a pid_t into a correctly sized
                    // buffer
                    let result = unsafe {
                        libc::getsockopt(
                            stream.as_raw_fd(),
                            libc::SOL_LOCAL,
                            libc::LOCAL_PEERPID,
                            &mut pid as *mut _ as *mut libc::c_void,
                            &mut pid_len,
                        )
                    };
                    if result != 0 {
                        return Err(IpcError::Io(io::Error::last_os_error()));
                    }

                    Ok(ClientCredentials {
                        pid: pid as u32,
                        uid: Some(uid),
                    })
                }
            }
            #[cfg(windows)]
            PipeStream::NamedPipe { handle, .. } => {
                let mut client_pid = 0u32;
                // SAFETY: handle is a live server pipe handle
                let result =
                    unsafe { GetNamedPipeClientProcessId(handle.as_raw_handle(), &mut client_pid) };
                if result == 0 {
                    return Err(IpcError::Io(io::Error::last_os_error()));
                }
                Ok(ClientCredentials {
                    pid: client_pid,
                    uid: None,
                })
            }
        }
    }
}

impl Read for PipeStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(stream) => stream.read(buf),
            #[cfg(windows)]
            PipeStream::NamedPipe { handle, broken } => {
                if broken.load(Ordering::SeqCst) {
                    return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "pipe was broken"));
                }
                let mut bytes_read = 0u32;
                // SAFETY: live handle, valid buffer and length, synchronous call
                let result = unsafe {
                    ReadFile(
                        handle.as_raw_handle(),
                        buf.as_mut_ptr(),
                        buf.len().min(u32::MAX as usize) as u32,
                        &mut bytes_read,
                        std::ptr::null_mut(),
                    )
                };

                if result != 0 {
                    return Ok(bytes_read as usize);
                }
                let error = io::Error::last_os_error();
                if error.raw_os_error() == Some(ERROR_BROKEN_PIPE as i32) {
                    // Peer closed its end; report EOF like a socket would
                    Ok(0)
                } else {
                    Err(error)
                }
            }
        }
    }
}

impl Write for PipeStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(stream) => stream.write(buf),
            #[cfg(windows)]
            PipeStream::NamedPipe { handle, .. } => {
                let mut bytes_written = 0u32;
                // SAFETY: live handle, valid buffer and length, synchronous call
                let result = unsafe {
                    WriteFile(
                        handle.as_raw_handle(),
                        buf.as_ptr(),
                        buf.len().min(u32::MAX as usize) as u32,
                        &mut bytes_written,
                        std::ptr::null_mut(),
                    )
                };

                if result == 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(bytes_written as usize)
                }
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            PipeStream::Unix(stream) => stream.flush(),
            #[cfg(windows)]
            PipeStream::NamedPipe { handle, .. } => {
                // SAFETY: live handle
                let result = unsafe { FlushFileBuffers(handle.as_raw_handle()) };
                if result == 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }
        }
    }
}

impl PipeBreaker {
    /// Forces a blocked read on the paired stream to return
    pub fn break_pipe(&self) {
        #[cfg(unix)]
        {
            if let Err(e) = self.stream.shutdown(Shutdown::Both) {
                if e.kind() != io::ErrorKind::NotConnected {
                    tracing::debug!("Pipe shutdown failed: {}", e);
                }
            }
        }

        #[cfg(windows)]
        {
            // Reads issued after this point fail before reaching ReadFile
            self.broken.store(true, Ordering::SeqCst);
            // SAFETY: thread is a duplicated, live thread handle. Failure only
            // means there was no I/O in flight.
            unsafe {
                windows_sys::Win32::System::IO::CancelSynchronousIo(self.thread.as_raw_handle());
            }
        }
    }
}

impl PipeListener {
    /// Binds a named pipe, applying `security` when given.
    ///
    /// Fails with `BindConflict` if a live server already owns the name.
    pub fn bind(name: &PipeName, security: Option<&PipeSecurityDescriptor>) -> Result<Self> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};

            let path = name.socket_path();
            tracing::debug!("Binding pipe '{}' -> {}", name, path.display());

            if let Ok(existing) = std::fs::symlink_metadata(&path) {
                if !existing.file_type().is_socket() {
                    tracing::warn!("{} exists and is not a socket", path.display());
                    return Err(IpcError::Io(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists and is not a socket", path.display()),
                    )));
                }
                // A live server answers, a stale socket from a crashed process
                // refuses. The live server sees this as a connection that
                // closes without sending a frame.
                match UnixStream::connect(&path) {
                    Ok(_) => {
                        tracing::warn!("Pipe '{}' is owned by a live server", name);
                        return Err(IpcError::BindConflict {
                            name: name.to_string(),
                        });
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Removing stale socket file {} ({})",
                            path.display(),
                            e
                        );
                        std::fs::remove_file(&path)?;
                    }
                }
            }

            let listener = UnixListener::bind(&path).map_err(|e| match e.kind() {
                io::ErrorKind::AddrInUse => IpcError::BindConflict {
                    name: name.to_string(),
                },
                _ => IpcError::Io(e),
            })?;
            listener.set_nonblocking(true)?;

            if let Some(security) = security {
                let mode = security.unix_mode();
                std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))?;
                tracing::debug!("Socket permissions set to {:o}", mode);

                if let Some(crate::security::OwnerId::Unix { uid, gid }) = security.owner() {
                    nix::unistd::chown(
                        path.as_path(),
                        Some(nix::unistd::Uid::from_raw(*uid)),
                        Some(nix::unistd::Gid::from_raw(*gid)),
                    )
                    .map_err(|e| IpcError::Io(io::Error::from(e)))?;
                    tracing::info!("Socket ownership changed to {}:{}", uid, gid);
                }
            }

            let metadata = std::fs::metadata(&path)?;
            tracing::info!("Pipe '{}' bound at {}", name, path.display());

            Ok(Self {
                listener,
                path,
                inode: (metadata.dev(), metadata.ino()),
                name: name.clone(),
            })
        }

        #[cfg(windows)]
        {
            let path = windows_security::to_wide(&name.pipe_path());
            let security = match security {
                Some(descriptor) => {
                    let sddl = descriptor.to_sddl(&windows_security::current_user_sid()?)?;
                    tracing::debug!("Pipe '{}' security: {}", name, sddl);
                    Some(windows_security::SecurityAttributes::from_sddl(&sddl)?)
                }
                None => None,
            };

            let pending = create_instance(&path, security.as_ref(), true).map_err(|e| {
                if e.raw_os_error() == Some(ERROR_ACCESS_DENIED as i32) {
                    IpcError::BindConflict {
                        name: name.to_string(),
                    }
                } else {
                    IpcError::Io(e)
                }
            })?;
            tracing::info!("Pipe '{}' bound at {}", name, name.pipe_path());

            Ok(Self {
                path,
                security,
                pending,
                name: name.clone(),
            })
        }
    }

    pub fn name(&self) -> &PipeName {
        &self.name
    }

    /// Waits for the next client.
    ///
    /// Returns `Ok(None)` once `shutdown` is set.
    pub fn accept(&mut self, shutdown: &AtomicBool) -> Result<Option<PipeStream>> {
        #[cfg(unix)]
        {
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    return Ok(None);
                }
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        stream.set_nonblocking(false)?;
                        return Ok(Some(PipeStream::Unix(stream)));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        std::thread::sleep(ACCEPT_POLL_INTERVAL);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(IpcError::Io(e)),
                }
            }
        }

        #[cfg(windows)]
        {
            let _ = ACCEPT_POLL_INTERVAL;
            loop {
                // SAFETY: pending is a live pipe instance; null overlapped makes
                // the call synchronous
                let connected =
                    unsafe { ConnectNamedPipe(self.pending.as_raw_handle(), std::ptr::null_mut()) };
                if connected != 0 {
                    break;
                }
                let error = io::Error::last_os_error();
                match error.raw_os_error() {
                    Some(code) if code == ERROR_PIPE_CONNECTED as i32 => break,
                    Some(code) if code == ERROR_NO_DATA as i32 => {
                        // Client came and went before we saw it; recycle the
                        // instance
                        // SAFETY: pending is a live pipe instance
                        unsafe { DisconnectNamedPipe(self.pending.as_raw_handle()) };
                    }
                    _ => {
                        if shutdown.load(Ordering::SeqCst) {
                            return Ok(None);
                        }
                        return Err(IpcError::Io(error));
                    }
                }
                if shutdown.load(Ordering::SeqCst) {
                    return Ok(None);
                }
            }

            let next = create_instance(&self.path, self.security.as_ref(), false)?;
            let stream = PipeStream::NamedPipe {
                handle: std::mem::replace(&mut self.pending, next),
                broken: Arc::new(AtomicBool::new(false)),
            };
            if shutdown.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(stream))
        }
    }
}

#[cfg(unix)]
impl Drop for PipeListener {
    fn drop(&mut self) {
        use std::os::unix::fs::MetadataExt;

        // Only remove the socket file if it is still the one we bound
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if (metadata.dev(), metadata.ino()) == self.inode {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    tracing::warn!("Failed to remove socket file {}: {}", self.path.display(), e);
                }
            }
        }
        tracing::debug!("Pipe '{}' released", self.name);
    }
}

/// Nudges a listener blocked in accept so it notices its shutdown flag
pub fn wake_listener(name: &PipeName) {
    #[cfg(unix)]
    {
        // Unix accept polls the flag on its own
        let _ = name;
    }

    #[cfg(windows)]
    {
        if let Err(e) = connect_pipe(name) {
            tracing::debug!("Wake connect to '{}' failed: {}", name, e);
        }
    }
}

/// Opens the client end of a named pipe without waiting.
///
/// Errors for which [`is_pipe_absent`] is true mean no server is listening yet.
pub fn connect_pipe(name: &PipeName) -> io::Result<PipeStream> {
    #[cfg(unix)]
    {
        let stream = UnixStream::connect(name.socket_path())?;
        stream.set_nonblocking(false)?;
        Ok(PipeStream::Unix(stream))
    }

    #[cfg(windows)]
    {
        let path = windows_security::to_wide(&name.pipe_path());
        // SAFETY: path is a NUL terminated wide string; null security
        // attributes and template handle are valid for pipes
        let handle = unsafe {
            CreateFileW(
                path.as_ptr(),
                GENERIC_READ | GENERIC_WRITE,
                0,
                std::ptr::null(),
                OPEN_EXISTING,
                0,
                std::ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: handle was just opened and is owned by us
        Ok(PipeStream::NamedPipe {
            handle: unsafe { OwnedHandle::from_raw_handle(handle) },
            broken: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Whether a connect error means "no server bound to this name right now"
pub fn is_pipe_absent(err: &io::Error) -> bool {
    #[cfg(windows)]
    if matches!(
        err.raw_os_error(),
        Some(code) if code == ERROR_FILE_NOT_FOUND as i32 || code == ERROR_PIPE_BUSY as i32
    ) {
        return true;
    }

    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

#[cfg(windows)]
fn create_instance(
    path: &[u16],
    security: Option<&windows_security::SecurityAttributes>,
    first: bool,
) -> io::Result<OwnedHandle> {
    let mut open_mode = PIPE_ACCESS_DUPLEX;
    if first {
        open_mode |= FILE_FLAG_FIRST_PIPE_INSTANCE;
    }
    let attributes = security.map(|s| s.as_attributes());
    let attributes_ptr = attributes
        .as_ref()
        .map_or(std::ptr::null(), |a| a as *const SECURITY_ATTRIBUTES);

    // SAFETY: path is NUL terminated; attributes (if any) outlive the call
    let handle = unsafe {
        CreateNamedPipeW(
            path.as_ptr(),
            open_mode,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT | PIPE_REJECT_REMOTE_CLIENTS,
            PIPE_UNLIMITED_INSTANCES,
            4096,
            4096,
            0,
            attributes_ptr,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: handle was just created and is owned by us
    Ok(unsafe { OwnedHandle::from_raw_handle(handle) })
}

#[cfg(windows)]
pub(crate) mod windows_security {
    use std::{ffi::OsStr, io, os::windows::ffi::OsStrExt, ptr};

    use windows_sys::Win32::{
        Foundation::{CloseHandle, LocalFree, HANDLE},
        Security::{
            Authorization::{
                ConvertSidToStringSidW, ConvertStringSecurityDescriptorToSecurityDescriptorW,
                SDDL_REVISION_1,
            },
            GetTokenInformation, TokenOwner, TokenUser, PSECURITY_DESCRIPTOR,
            SECURITY_ATTRIBUTES, TOKEN_OWNER, TOKEN_QUERY, TOKEN_USER,
        },
        System::Threading::{GetCurrentProcess, OpenProcessToken},
    };

    use crate::error::{IpcError, Result};

    pub(crate) fn to_wide(s: &str) -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(Some(0)).collect()
    }

    /// Security descriptor allocated by the SDDL converter
    pub(crate) struct SecurityAttributes {
        descriptor: PSECURITY_DESCRIPTOR,
    }

    // SAFETY: the descriptor is an immutable heap block only read by
    // CreateNamedPipeW; it is freed once in Drop.
    unsafe impl Send for SecurityAttributes {}

    impl SecurityAttributes {
        pub(crate) fn from_sddl(sddl: &str) -> Result<Self> {
            let wide = to_wide(sddl);
            let mut descriptor: PSECURITY_DESCRIPTOR = ptr::null_mut();
            // SAFETY: wide is NUL terminated; descriptor receives a LocalAlloc'd
            // block on success
            let ok = unsafe {
                ConvertStringSecurityDescriptorToSecurityDescriptorW(
                    wide.as_ptr(),
                    SDDL_REVISION_1,
                    &mut descriptor,
                    ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(IpcError::Io(io::Error::last_os_error()));
            }
            Ok(Self { descriptor })
        }

        pub(crate) fn as_attributes(&self) -> SECURITY_ATTRIBUTES {
            SECURITY_ATTRIBUTES {
                nLength:              std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: self.descriptor,
                bInheritHandle:       0,
            }
        }
    }

    impl Drop for SecurityAttributes {
        fn drop(&mut self) {
            // SAFETY: descriptor came from LocalAlloc inside the converter
            unsafe {
                LocalFree(self.descriptor as _);
            }
        }
    }

    /// SID strings of the process token's user and owner
    pub(crate) fn token_sids() -> Result<(String, String)> {
        // SAFETY: every handle opened here is closed before returning and all
        // buffers are sized from the first GetTokenInformation call
        unsafe {
            let mut token: HANDLE = ptr::null_mut();
            if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) == 0 {
                return Err(IpcError::Io(io::Error::last_os_error()));
            }

            let user = query_token(token, TokenUser).map(|buffer| {
                let info = &*(buffer.as_ptr() as *const TOKEN_USER);
                sid_to_string(info.User.Sid)
            });
            let owner = query_token(token, TokenOwner).map(|buffer| {
                let info = &*(buffer.as_ptr() as *const TOKEN_OWNER);
                sid_to_string(info.Owner)
            });
            CloseHandle(token);

            Ok((user??, owner??))
        }
    }

    pub(crate) fn current_user_sid() -> Result<String> {
        token_sids().map(|(user, _)| user)
    }

    unsafe fn query_token(token: HANDLE, class: i32) -> Result<Vec<u64>> {
        let mut length = 0u32;
        GetTokenInformation(token, class, ptr::null_mut(), 0, &mut length);
        if length == 0 {
            return Err(IpcError::Io(io::Error::last_os_error()));
        }
        // u64 storage keeps the SID structures aligned
        let mut buffer = vec![0u64; (length as usize).div_ceil(8)];
        let out = buffer.as_mut_ptr() as *mut _;
        if GetTokenInformation(token, class, out, length, &mut length) == 0 {
            return Err(IpcError::Io(io::Error::last_os_error()));
        }
        Ok(buffer)
    }

    unsafe fn sid_to_string(sid: *mut core::ffi::c_void) -> Result<String> {
        let mut raw: *mut u16 = ptr::null_mut();
        if ConvertSidToStringSidW(sid, &mut raw) == 0 {
            return Err(IpcError::Io(io::Error::last_os_error()));
        }
        let mut len = 0;
        while *raw.add(len) != 0 {
            len += 1;
        }
        let value = String::from_utf16_lossy(std::slice::from_raw_parts(raw, len));
        LocalFree(raw as _);
        Ok(value)
    }
}
