//! Crate-wide error taxonomy.
//!
//! Every terminal error carries a [`ErrorKind`] (used by `main` to pick the
//! process exit code), a one-line human message, the concrete offending
//! value, and an optional suggested next step.

use std::fmt;

/// Kind of failure, matching the exit code table in the CLI contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConfigInvalid,
    UnknownOs,
    ToolMissing,
    NetworkInactive,
    PoolInactive,
    PermissionDenied,
    ImageFetch,
    DiskCreate,
    DomainCreate,
    SpecConflict,
    LeaseTimeout,
    HttpTimeout,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Process exit code for this kind, per the CLI contract.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::ConfigInvalid | Self::UnknownOs => 2,
            Self::ToolMissing | Self::NetworkInactive | Self::PoolInactive | Self::PermissionDenied => 3,
            Self::DomainCreate | Self::SpecConflict => 4,
            Self::LeaseTimeout | Self::HttpTimeout => 5,
            Self::Cancelled => 6,
            Self::Internal | Self::ImageFetch | Self::DiskCreate => 1,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConfigInvalid => "ConfigInvalid",
            Self::UnknownOs => "UnknownOS",
            Self::ToolMissing => "ToolMissing",
            Self::NetworkInactive => "NetworkInactive",
            Self::PoolInactive => "PoolInactive",
            Self::PermissionDenied => "PermissionDenied",
            Self::ImageFetch => "ImageFetch",
            Self::DiskCreate => "DiskCreate",
            Self::DomainCreate => "DomainCreate",
            Self::SpecConflict => "SpecConflict",
            Self::LeaseTimeout => "LeaseTimeout",
            Self::HttpTimeout => "HTTPTimeout",
            Self::Cancelled => "Cancelled",
            Self::Internal => "Internal",
        };
        f.write_str(s)
    }
}

/// A terminal, user-facing error.
#[derive(Debug)]
pub struct DockvmError {
    kind: ErrorKind,
    message: String,
    offending: Option<String>,
    hint: Option<String>,
}

impl DockvmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            offending: None,
            hint: None,
        }
    }

    #[must_use]
    pub fn with_offending(mut self, offending: impl Into<String>) -> Self {
        self.offending = Some(offending.into());
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for DockvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(offending) = &self.offending {
            write!(f, " ({offending})")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " — {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DockvmError {}

/// Convenience constructors for the common kinds.
impl DockvmError {
    pub fn config_invalid(message: impl Into<String>, offending: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConfigInvalid, message)
            .with_offending(offending)
            .with_hint("check the project file and CLI flags")
    }

    pub fn unknown_os(key: impl Into<String>) -> Self {
        let key = key.into();
        Self::new(ErrorKind::UnknownOs, format!("UnknownOS: {key}"))
            .with_offending(key)
            .with_hint("run `dockvm check` or add the OS to config.yaml")
    }

    pub fn tool_missing(tool: impl Into<String>) -> Self {
        let tool = tool.into();
        Self::new(ErrorKind::ToolMissing, "required tool not found on PATH")
            .with_offending(tool)
            .with_hint("run `dockvm heal --apply` or install the tool manually")
    }

    pub fn permission_denied(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, "base directory not readable by the hypervisor service account")
            .with_offending(path)
            .with_hint("run `dockvm heal --apply` to set ACLs/SELinux contexts")
    }

    pub fn spec_conflict(name: impl Into<String>, detail: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorKind::SpecConflict, detail)
            .with_offending(name)
            .with_hint("tear the VM down with `dockvm down` before changing its spec")
    }

    pub fn domain_create(name: impl Into<String>, detail: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorKind::DomainCreate, detail)
            .with_offending(name)
            .with_hint("run `dockvm check` to verify libvirt connectivity")
    }

    pub fn lease_timeout(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorKind::LeaseTimeout, "timed out waiting for a DHCP lease")
            .with_offending(name)
            .with_hint("the domain is still running; retry `dockvm ip` or inspect the network")
    }

    pub fn http_timeout(url: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(ErrorKind::HttpTimeout, "timed out waiting for an HTTP 2xx/3xx response")
            .with_offending(url)
            .with_hint("the domain is still running; inspect the in-VM reverse proxy")
    }

    pub fn cancelled(what: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled").with_offending(what.into())
    }

    pub fn image_fetch(url: impl Into<String>, detail: impl Into<String>) -> Self {
        let url = url.into();
        Self::new(ErrorKind::ImageFetch, detail)
            .with_offending(url)
            .with_hint("check network connectivity or proxy environment variables")
    }

    pub fn disk_create(path: impl Into<String>, detail: impl Into<String>) -> Self {
        let path = path.into();
        Self::new(ErrorKind::DiskCreate, detail).with_offending(path)
    }

    pub fn network_inactive(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorKind::NetworkInactive, "libvirt network is not active")
            .with_offending(name)
            .with_hint("run `dockvm heal --apply`")
    }

    pub fn pool_inactive(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(ErrorKind::PoolInactive, "libvirt storage pool is not active")
            .with_offending(name)
            .with_hint("run `dockvm heal --apply`")
    }
}
