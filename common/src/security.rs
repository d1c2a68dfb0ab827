//! Access-control rules attached to a pipe when it is created.
//!
//! A [`PipeSecurityDescriptor`] is an ordered, immutable list of
//! `(identity, rights, allow/deny)` rules. Each platform renders it into its
//! native form: SDDL on Windows, socket file mode and ownership on Unix.

use crate::error::{IpcError, Result};

/// Well-known SID of the ALL APPLICATION PACKAGES group
pub const APP_CONTAINER_SID: &str = "S-1-15-2-1";

/// Who a rule applies to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeIdentity {
    /// The user the current process runs as
    CurrentUser,
    /// An explicit owning account that differs from the current user
    Owner(OwnerId),
    /// Every authenticated account
    AuthenticatedUsers,
    /// Everyone / world
    World,
    /// Processes running inside an app sandbox container
    AppContainer,
}

/// Platform identifier of an owning account
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OwnerId {
    /// Unix user and group id
    Unix { uid: u32, gid: u32 },
    /// Windows SID string
    Sid(String),
}

/// Access rights granted or denied by a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeAccess {
    Read,
    Write,
    ReadWrite,
}

impl PipeAccess {
    fn covers_read(self) -> bool {
        matches!(self, PipeAccess::Read | PipeAccess::ReadWrite)
    }

    fn covers_write(self) -> bool {
        matches!(self, PipeAccess::Write | PipeAccess::ReadWrite)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessControl {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeAccessRule {
    pub identity: PipeIdentity,
    pub access:   PipeAccess,
    pub control:  AccessControl,
}

impl PipeAccessRule {
    pub fn allow(identity: PipeIdentity, access: PipeAccess) -> Self {
        Self {
            identity,
            access,
            control: AccessControl::Allow,
        }
    }

    pub fn deny(identity: PipeIdentity, access: PipeAccess) -> Self {
        Self {
            identity,
            access,
            control: AccessControl::Deny,
        }
    }
}

/// Immutable set of access rules for one pipe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeSecurityDescriptor {
    rules: Vec<PipeAccessRule>,
}

impl PipeSecurityDescriptor {
    pub fn new(rules: Vec<PipeAccessRule>) -> Self {
        Self { rules }
    }

    /// Builds the descriptor used for pipes that must be reachable from a
    /// peer of unknown privilege: another user, or an app sandbox.
    ///
    /// Read/write is granted to the current user, the owning account when it
    /// differs, authenticated users, world, and the app container group.
    pub fn sandboxed(owner: Option<OwnerId>) -> Self {
        let access = PipeAccess::ReadWrite;
        let mut rules = vec![PipeAccessRule::allow(PipeIdentity::CurrentUser, access)];
        if let Some(owner) = owner {
            rules.push(PipeAccessRule::allow(PipeIdentity::Owner(owner), access));
        }
        rules.push(PipeAccessRule::allow(PipeIdentity::AuthenticatedUsers, access));
        rules.push(PipeAccessRule::allow(PipeIdentity::World, access));
        rules.push(PipeAccessRule::allow(PipeIdentity::AppContainer, access));
        Self { rules }
    }

    pub fn rules(&self) -> &[PipeAccessRule] {
        &self.rules
    }

    pub fn owner(&self) -> Option<&OwnerId> {
        self.rules.iter().find_map(|rule| match &rule.identity {
            PipeIdentity::Owner(owner) if rule.control == AccessControl::Allow => Some(owner),
            _ => None,
        })
    }

    /// Unix permission bits for the socket file.
    ///
    /// Owner bits come from `CurrentUser`/`Owner` rules, group bits from
    /// `AuthenticatedUsers`, other bits from `World`. Deny rules clear bits
    /// granted by earlier rules. `AppContainer` has no Unix counterpart.
    pub fn unix_mode(&self) -> u32 {
        let mut mode = 0u32;
        for rule in &self.rules {
            let shift = match rule.identity {
                PipeIdentity::CurrentUser | PipeIdentity::Owner(_) => 6,
                PipeIdentity::AuthenticatedUsers => 3,
                PipeIdentity::World => 0,
                PipeIdentity::AppContainer => {
                    tracing::debug!("Skipping app container rule, no Unix equivalent");
                    continue;
                }
            };
            let mut bits = 0u32;
            if rule.access.covers_read() {
                bits |= 0o4;
            }
            if rule.access.covers_write() {
                bits |= 0o2;
            }
            match rule.control {
                AccessControl::Allow => mode |= bits << shift,
                AccessControl::Deny => mode &= !(bits << shift),
            }
        }
        mode
    }

    /// Renders the rules as an SDDL DACL, deny entries first.
    ///
    /// `current_user_sid` is substituted for `CurrentUser` rules. Fails if an
    /// `Owner` rule carries a Unix id.
    pub fn to_sddl(&self, current_user_sid: &str) -> Result<String> {
        let mut denies = String::new();
        let mut allows = String::new();
        for rule in &self.rules {
            let trustee = match &rule.identity {
                PipeIdentity::CurrentUser => current_user_sid,
                PipeIdentity::Owner(OwnerId::Sid(sid)) => sid.as_str(),
                PipeIdentity::Owner(OwnerId::Unix { .. }) => {
                    return Err(IpcError::PlatformUnsupported {
                        platform: "unix owner id in a Windows descriptor".to_string(),
                    })
                }
                PipeIdentity::AuthenticatedUsers => "AU",
                PipeIdentity::World => "WD",
                PipeIdentity::AppContainer => APP_CONTAINER_SID,
            };
            let rights = match rule.access {
                PipeAccess::Read => "GR",
                PipeAccess::Write => "GW",
                PipeAccess::ReadWrite => "GRGW",
            };
            match rule.control {
                AccessControl::Allow => allows.push_str(&format!("(A;;{rights};;;{trustee})")),
                AccessControl::Deny => denies.push_str(&format!("(D;;{rights};;;{trustee})")),
            }
        }
        Ok(format!("D:{denies}{allows}"))
    }
}
