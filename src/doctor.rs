//! Doctor / Self-Heal (C9): diagnoses host readiness and, optionally,
//! repairs it. Each check is independent and idempotent; repairs never
//! run elevated unless explicitly requested.

use std::path::Path;

use log::info;

use crate::config::GlobalConfig;
use crate::environment::Environment;
use crate::error::DockvmError;
use crate::hypervisor::subprocess::Runner;
use crate::probe;
use crate::seed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct Finding {
    pub id: String,
    pub severity: Severity,
    pub message: String,
    pub fixable: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DoctorReport {
    pub findings: Vec<Finding>,
}

impl DoctorReport {
    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }
}

/// Runs every diagnostic without mutating the host.
pub fn check(runner: &dyn Runner, env: &Environment) -> DoctorReport {
    let mut findings = Vec::new();

    for status in probe::tool_statuses() {
        findings.push(if status.present {
            Finding {
                id: format!("tool:{}", status.name),
                severity: Severity::Info,
                message: format!("{} present", status.name),
                fixable: false,
            }
        } else {
            Finding {
                id: format!("tool:{}", status.name),
                severity: Severity::Error,
                message: format!("{} not found on PATH", status.name),
                fixable: false,
            }
        });
    }

    findings.push(check_network(runner));
    findings.push(check_pool(runner));
    findings.push(check_base_dir_permissions(env));
    findings.push(check_catalog_normalized(env));
    findings.push(check_templates());

    DoctorReport { findings }
}

fn check_network(runner: &dyn Runner) -> Finding {
    let defined = runner
        .run("virsh", &["net-info", "default"])
        .map(|out| out.ok())
        .unwrap_or(false);
    let active = defined
        && runner
            .run("virsh", &["net-info", "default"])
            .map(|out| out.stdout.contains("Active:         yes"))
            .unwrap_or(false);

    if active {
        Finding {
            id: "network:default".to_string(),
            severity: Severity::Info,
            message: "default network is defined and active".to_string(),
            fixable: false,
        }
    } else {
        Finding {
            id: "network:default".to_string(),
            severity: Severity::Warn,
            message: "default network is not active".to_string(),
            fixable: true,
        }
    }
}

fn check_pool(runner: &dyn Runner) -> Finding {
    let active = runner
        .run("virsh", &["pool-info", "default"])
        .map(|out| out.stdout.contains("State:          running"))
        .unwrap_or(false);

    if active {
        Finding {
            id: "pool:default".to_string(),
            severity: Severity::Info,
            message: "default storage pool is defined and active".to_string(),
            fixable: false,
        }
    } else {
        Finding {
            id: "pool:default".to_string(),
            severity: Severity::Warn,
            message: "default storage pool is not active".to_string(),
            fixable: true,
        }
    }
}

fn check_base_dir_permissions(env: &Environment) -> Finding {
    let traversable = Path::new(env.base())
        .metadata()
        .map(|m| {
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                m.permissions().mode() & 0o005 != 0
            }
            #[cfg(not(unix))]
            {
                let _ = m;
                true
            }
        })
        .unwrap_or(false);

    if traversable {
        Finding {
            id: "permissions:base_dir".to_string(),
            severity: Severity::Info,
            message: "base directory is traversable by other accounts".to_string(),
            fixable: false,
        }
    } else {
        Finding {
            id: "permissions:base_dir".to_string(),
            severity: Severity::Warn,
            message: "base directory is not readable by the hypervisor service account".to_string(),
            fixable: true,
        }
    }
}

fn check_catalog_normalized(env: &Environment) -> Finding {
    match GlobalConfig::load(env) {
        Ok(_) => Finding {
            id: "catalog:normalized".to_string(),
            severity: Severity::Info,
            message: "image catalog is normalized and default_os resolves".to_string(),
            fixable: false,
        },
        Err(e) => Finding {
            id: "catalog:normalized".to_string(),
            severity: Severity::Error,
            message: e.to_string(),
            fixable: true,
        },
    }
}

fn check_templates() -> Finding {
    let spec = synthetic_spec();
    let ok = !seed::render_user_data(&spec).is_empty()
        && !seed::render_meta_data(&spec).is_empty()
        && !seed::render_network_config(&spec).is_empty();
    Finding {
        id: "templates:cloud-init".to_string(),
        severity: if ok { Severity::Info } else { Severity::Error },
        message: if ok {
            "cloud-init templates render".to_string()
        } else {
            "cloud-init templates failed to render".to_string()
        },
        fixable: false,
    }
}

fn synthetic_spec() -> crate::config::VMSpec {
    let global = GlobalConfig::default_catalog();
    let mut values = std::collections::HashMap::new();
    values.insert("name".to_string(), "doctor-probe".to_string());
    values.insert("domain".to_string(), "doctor-probe.local".to_string());
    values.insert("image".to_string(), "hello-world".to_string());
    values.insert("port".to_string(), "80".to_string());
    crate::config::VMSpec::resolve(&global, &values, &std::collections::HashMap::new())
        .expect("synthetic doctor spec must always resolve")
}

/// Runs checks and, if `apply`, repairs every fixable finding, then
/// re-runs checks so the returned report reflects the post-repair state.
pub fn heal(runner: &dyn Runner, env: &Environment, apply: bool) -> Result<DoctorReport, DockvmError> {
    let report = check(runner, env);
    if !apply {
        return Ok(report);
    }

    for finding in &report.findings {
        if !finding.fixable {
            continue;
        }
        match finding.id.as_str() {
            "network:default" => repair_network(runner)?,
            "pool:default" => repair_pool(runner)?,
            "permissions:base_dir" => repair_base_dir_permissions(env)?,
            "catalog:normalized" => {
                let config = GlobalConfig::load(env)?;
                config.save(env).map_err(|e| {
                    DockvmError::config_invalid(e.to_string(), env.global_config_path().to_string_lossy().into_owned())
                })?;
            }
            _ => {}
        }
    }

    Ok(check(runner, env))
}

fn repair_network(runner: &dyn Runner) -> Result<(), DockvmError> {
    info!("repairing default network");
    let _ = runner.run("virsh", &["net-start", "default"]);
    let out = runner
        .run("virsh", &["net-autostart", "default"])
        .map_err(|e| DockvmError::network_inactive(e.to_string()))?;
    if !out.ok() {
        return Err(DockvmError::network_inactive("default"));
    }
    Ok(())
}

fn repair_pool(runner: &dyn Runner) -> Result<(), DockvmError> {
    info!("repairing default storage pool");
    let _ = runner.run(
        "virsh",
        &["pool-define-as", "default", "dir", "--target", "/var/lib/libvirt/images"],
    );
    let _ = runner.run("virsh", &["pool-build", "default"]);
    let _ = runner.run("virsh", &["pool-start", "default"]);
    let out = runner
        .run("virsh", &["pool-autostart", "default"])
        .map_err(|e| DockvmError::pool_inactive(e.to_string()))?;
    if !out.ok() {
        return Err(DockvmError::pool_inactive("default"));
    }
    Ok(())
}

/// Sets POSIX ACLs (and, when SELinux is enforcing, a permissive label)
/// so the hypervisor service account can traverse the base directory.
/// Requires elevation; invoked through an explicit `sudo` wrapper rather
/// than silently escalating.
fn repair_base_dir_permissions(env: &Environment) -> Result<(), DockvmError> {
    info!("repairing base directory permissions for {}", env.base().display());
    let path = env.base().to_string_lossy().into_owned();
    let acl_rule = "u:qemu:rx".to_string();
    escalated(&["setfacl", "-R", "-m", &acl_rule, &path])
        .map_err(|e| DockvmError::permission_denied(format!("{path}: {e}")))?;

    if Path::new("/sys/fs/selinux/enforce").exists() {
        let _ = escalated(&["chcon", "-R", "-t", "virt_image_t", &path]);
        let _ = escalated(&["restorecon", "-R", &path]);
    }
    Ok(())
}

fn escalated(argv: &[&str]) -> anyhow::Result<()> {
    let mut full = vec!["sudo"];
    full.extend_from_slice(argv);
    let status = std::process::Command::new(full[0]).args(&full[1..]).status()?;
    anyhow::ensure!(status.success(), "command failed: {}", full.join(" "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::subprocess::fakes::RecordingRunner;
    use crate::hypervisor::subprocess::CommandOutput;
    use tempdir::TempDir;

    #[test]
    fn check_reports_inactive_network_as_fixable() {
        let runner = RecordingRunner::new(vec![CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: "network not found".to_string(),
        }]);
        let finding = check_network(&runner);
        assert_eq!(finding.severity, Severity::Warn);
        assert!(finding.fixable);
    }

    #[test]
    fn templates_check_passes_on_a_synthetic_spec() {
        let finding = check_templates();
        assert_eq!(finding.severity, Severity::Info);
    }

    #[test]
    fn heal_without_apply_does_not_call_repair_commands() -> anyhow::Result<()> {
        let tmp = TempDir::new("dockvm-doctor")?;
        let env = Environment::open_at(tmp.path().join("base"))?;
        let runner = RecordingRunner::new(vec![]);
        let report = heal(&runner, &env, false)?;
        assert!(!report.findings.is_empty());
        Ok(())
    }
}
