//! VM Lifecycle Engine (C7): orchestrates C1-C6 for one named VM.

use std::fs;
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::{GlobalConfig, VMSpec};
use crate::disk;
use crate::environment::Environment;
use crate::error::DockvmError;
use crate::hypervisor::subprocess::Runner;
use crate::hypervisor::{Context, Hypervisor};
use crate::image_cache;
use crate::ready;
use crate::seed;

/// Where a VMInstance sits in the state machine
/// `Absent -> Prepared -> Defined -> Running -> Ready -> Torn-down`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Absent,
    Prepared,
    Defined,
    Running,
    Ready,
    TornDown,
}

/// Outcome of a successful `up` invocation. `up` only returns `Ok` once
/// the domain is `Ready` (leased and answering HTTP); an HTTP or lease
/// timeout is reported as `Err`, not as an `Ok` with a degraded state.
#[derive(Debug, Clone)]
pub struct UpOutcome {
    pub state: VmState,
    pub ip: String,
}

/// The subset of a spec persisted to `work_dir/spec.json`, used by `up`
/// to detect a spec conflict on a domain that is already running.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
struct SpecFingerprint {
    image: String,
    port: u16,
}

impl From<&VMSpec> for SpecFingerprint {
    fn from(spec: &VMSpec) -> Self {
        Self {
            image: spec.image.clone(),
            port: spec.port,
        }
    }
}

/// Brings a VM up: resolves the spec, ensures the base image, seed, and
/// overlay disk exist, defines and starts the domain, and waits for
/// readiness. Idempotent on a domain already running with a matching
/// spec fingerprint.
pub async fn up(
    env: &Environment,
    runner: &dyn Runner,
    hv_context: Context,
    global: &GlobalConfig,
    spec: &VMSpec,
    token: &CancellationToken,
) -> Result<UpOutcome, DockvmError> {
    let work_dir = env.vm_dir(&spec.name);
    let hv = Hypervisor::new(runner, hv_context);

    let already_defined = hv.list()?.iter().any(|n| n == &spec.name);
    if already_defined {
        check_spec_conflict(&work_dir, spec)?;
        info!("domain '{}' already running; re-checking readiness only", spec.name);
    } else {
        prepare(env, runner, global, spec, &work_dir)?;

        if let Err(e) = define_and_start(runner, hv_context, spec, &work_dir) {
            // Rollback: a post-definition failure must not leave a
            // half-defined domain or a dirty work_dir behind.
            let _ = hv.destroy(&spec.name);
            let _ = fs::remove_dir_all(&work_dir);
            return Err(e);
        }
    }

    let ready_result = ready::wait_ready(runner, hv_context, token, &spec.name, &spec.domain, spec.port).await;
    match ready_result {
        Ok(ip) => Ok(UpOutcome {
            state: VmState::Ready,
            ip,
        }),
        Err(e) if e.kind() == crate::error::ErrorKind::Cancelled => {
            // Cancellation during `up` gets the same rollback as a
            // post-definition failure.
            let _ = hv.destroy(&spec.name);
            let _ = fs::remove_dir_all(&work_dir);
            Err(e)
        }
        // Lease/HTTP timeouts leave the domain Running, not rolled back,
        // but `up` still fails: the caller must see a nonzero exit code.
        Err(e) => Err(e),
    }
}

fn prepare(
    env: &Environment,
    runner: &dyn Runner,
    global: &GlobalConfig,
    spec: &VMSpec,
    work_dir: &std::path::Path,
) -> Result<(), DockvmError> {
    fs::create_dir_all(work_dir)
        .map_err(|e| DockvmError::disk_create(work_dir.to_string_lossy().into_owned(), e.to_string()))?;

    let image = global.lookup(&spec.os)?;
    let base_image = image_cache::ensure(env, &image)
        .map_err(|e| DockvmError::image_fetch(image.url.clone(), e.to_string()))?;

    seed::build_seed(runner, work_dir, spec)?;
    disk::build_overlay(runner, work_dir, &base_image, spec.disk)?;

    let fingerprint = SpecFingerprint::from(spec);
    let fingerprint_path = work_dir.join("spec.json");
    let serialized = serde_json::to_string(&fingerprint).unwrap_or_default();
    fs::write(&fingerprint_path, serialized)
        .map_err(|e| DockvmError::disk_create(fingerprint_path.to_string_lossy().into_owned(), e.to_string()))?;

    Ok(())
}

fn define_and_start(
    runner: &dyn Runner,
    hv_context: Context,
    spec: &VMSpec,
    work_dir: &std::path::Path,
) -> Result<(), DockvmError> {
    let hv = Hypervisor::new(runner, hv_context);
    let disk_path = work_dir.join("disk.qcow2");
    let seed_path = work_dir.join("seed.iso");
    hv.define_and_start(spec, &disk_path, &seed_path)
}

fn check_spec_conflict(work_dir: &std::path::Path, spec: &VMSpec) -> Result<(), DockvmError> {
    let fingerprint_path = work_dir.join("spec.json");
    let Ok(content) = fs::read_to_string(&fingerprint_path) else {
        // No recorded fingerprint (e.g. domain defined out-of-band):
        // nothing to compare against, so proceed.
        return Ok(());
    };
    let Ok(recorded) = serde_json::from_str::<SpecFingerprint>(&content) else {
        return Ok(());
    };
    let current = SpecFingerprint::from(spec);
    if recorded != current {
        return Err(DockvmError::spec_conflict(
            spec.name.clone(),
            format!(
                "running domain has image='{}' port={} but the resolved spec has image='{}' port={}",
                recorded.image, recorded.port, current.image, current.port
            ),
        ));
    }
    Ok(())
}

/// Tears a VM down: destroys the domain (idempotent) and deletes its
/// work_dir. Safe to call repeatedly.
pub fn down(env: &Environment, runner: &dyn Runner, hv_context: Context, name: &str) -> Result<(), DockvmError> {
    let hv = Hypervisor::new(runner, hv_context);
    hv.destroy(name)?;
    let work_dir = env.vm_dir(name);
    if work_dir.is_dir() {
        fs::remove_dir_all(&work_dir)
            .map_err(|e| DockvmError::disk_create(work_dir.to_string_lossy().into_owned(), e.to_string()))?;
    }
    Ok(())
}

/// Returns the current leased IPv4 address, polling up to `timeout`.
pub fn ip(runner: &dyn Runner, hv_context: Context, name: &str, timeout: Duration) -> Result<String, DockvmError> {
    Hypervisor::new(runner, hv_context).lease(name, timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::subprocess::fakes::RecordingRunner;
    use crate::hypervisor::subprocess::CommandOutput;
    use std::collections::HashMap;
    use tempdir::TempDir;

    fn spec() -> VMSpec {
        let global = GlobalConfig::default_catalog();
        let mut project = HashMap::new();
        project.insert("name".to_string(), "demo".to_string());
        project.insert("domain".to_string(), "demo.local".to_string());
        project.insert("image".to_string(), "nginx:latest".to_string());
        project.insert("port".to_string(), "80".to_string());
        VMSpec::resolve(&global, &project, &HashMap::new()).unwrap()
    }

    #[test]
    fn down_on_absent_domain_is_idempotent() -> anyhow::Result<()> {
        let tmp = TempDir::new("dockvm-lifecycle")?;
        let env = Environment::open_at(tmp.path().join("base"))?;
        let runner = RecordingRunner::new(vec![CommandOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        }]);
        down(&env, &runner, Context::Session, "ghost")?;
        down(&env, &runner, Context::Session, "ghost")?;
        Ok(())
    }

    #[test]
    fn spec_conflict_detected_when_recorded_fingerprint_differs() -> anyhow::Result<()> {
        let tmp = TempDir::new("dockvm-lifecycle")?;
        let work_dir = tmp.path().join("demo");
        fs::create_dir_all(&work_dir)?;
        fs::write(
            work_dir.join("spec.json"),
            serde_json::to_string(&SpecFingerprint {
                image: "other:latest".to_string(),
                port: 81,
            })?,
        )?;
        let result = check_spec_conflict(&work_dir, &spec());
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::SpecConflict);
        Ok(())
    }

    #[test]
    fn matching_fingerprint_is_not_a_conflict() -> anyhow::Result<()> {
        let tmp = TempDir::new("dockvm-lifecycle")?;
        let work_dir = tmp.path().join("demo");
        fs::create_dir_all(&work_dir)?;
        fs::write(
            work_dir.join("spec.json"),
            serde_json::to_string(&SpecFingerprint::from(&spec()))?,
        )?;
        assert!(check_spec_conflict(&work_dir, &spec()).is_ok());
        Ok(())
    }
}
