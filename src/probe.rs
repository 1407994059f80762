//! System Probe (C10): detects OS family, tool presence, and hypervisor
//! reachability. Never mutates the host.

use crate::hypervisor::subprocess::Runner;

/// Host package-manager family, used to tailor `doctor`'s install hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsFamily {
    Apt,
    Dnf,
    Pacman,
    Unknown,
}

impl OsFamily {
    pub fn detect() -> Self {
        if which::which("apt-get").is_ok() {
            Self::Apt
        } else if which::which("dnf").is_ok() {
            Self::Dnf
        } else if which::which("pacman").is_ok() {
            Self::Pacman
        } else {
            Self::Unknown
        }
    }
}

/// Required external tools and whether each is on `PATH`.
pub const REQUIRED_TOOLS: &[&str] = &[
    "virsh",
    "qemu-img",
    "qemu-system-x86_64",
    "genisoimage",
    "docker",
];

#[derive(Debug, Clone)]
pub struct ToolStatus {
    pub name: String,
    pub present: bool,
}

/// Whether each [`REQUIRED_TOOLS`] entry is resolvable on `PATH`. The
/// seed ISO tool is satisfied by any one of `genisoimage`/`mkisofs`/
/// `xorriso`, so it is reported separately.
pub fn tool_statuses() -> Vec<ToolStatus> {
    let mut statuses: Vec<ToolStatus> = REQUIRED_TOOLS
        .iter()
        .filter(|&&name| name != "genisoimage")
        .map(|&name| ToolStatus {
            name: name.to_string(),
            present: which::which(name).is_ok(),
        })
        .collect();

    let iso_tool_present = ["genisoimage", "mkisofs", "xorriso"]
        .iter()
        .any(|t| which::which(t).is_ok());
    statuses.push(ToolStatus {
        name: "genisoimage|mkisofs|xorriso".to_string(),
        present: iso_tool_present,
    });
    statuses
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reachability {
    pub session: bool,
    pub system: bool,
}

/// Probes whether `virsh` can reach the hypervisor over each connection
/// context. Failure to run `virsh` at all (e.g. not installed) reports
/// both contexts unreachable rather than erroring.
pub fn hypervisor_reachability(runner: &dyn Runner) -> Reachability {
    let probe = |uri: &str| {
        runner
            .run("virsh", &["-c", uri, "list", "--all", "--name"])
            .map(|out| out.ok())
            .unwrap_or(false)
    };
    Reachability {
        session: probe("qemu:///session"),
        system: probe("qemu:///system"),
    }
}
