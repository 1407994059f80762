//! Hypervisor Driver (C6): wraps `virsh` to define, start, destroy, and
//! query domains.

pub mod subprocess;

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::debug;
use rand::Rng;

use crate::config::{NetSpec, VMSpec};
use crate::error::DockvmError;
use subprocess::{CommandOutput, Runner};

/// The two libvirt connection contexts. `Session` is unprivileged and
/// per-user; `System` is privileged and shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Session,
    System,
}

impl Context {
    fn uri(self) -> &'static str {
        match self {
            Self::Session => "qemu:///session",
            Self::System => "qemu:///system",
        }
    }
}

pub struct Hypervisor<'a> {
    runner: &'a dyn Runner,
    context: Context,
}

impl<'a> Hypervisor<'a> {
    /// Selects a connection context: `System` when `LIBVIRT_DEFAULT_URI`
    /// names it or when reachability probing (left to the caller, since
    /// it requires an actual `virsh` round-trip) prefers it; `Session`
    /// otherwise. The doctor/probe components decide which to pass.
    pub fn new(runner: &'a dyn Runner, context: Context) -> Self {
        Self { runner, context }
    }

    fn virsh(&self, args: &[&str]) -> anyhow::Result<CommandOutput> {
        let mut full = vec!["-c", self.context.uri()];
        full.extend_from_slice(args);
        debug!("virsh {}", full.join(" "));
        self.runner.run("virsh", &full)
    }

    /// Defines and starts a domain for `spec`. Fails with `DomainCreate`
    /// if the domain already exists in any state.
    pub fn define_and_start(
        &self,
        spec: &VMSpec,
        disk: &Path,
        seed: &Path,
    ) -> Result<(), DockvmError> {
        let existing = self.list()?;
        if existing.iter().any(|n| n == &spec.name) {
            return Err(DockvmError::domain_create(
                spec.name.clone(),
                "domain already exists",
            ));
        }

        let xml = render_domain_xml(spec, disk, seed);
        let xml_path = std::env::temp_dir().join(format!("{}.xml", spec.name));
        std::fs::write(&xml_path, &xml).map_err(|e| {
            DockvmError::domain_create(spec.name.clone(), format!("failed to write domain XML: {e}"))
        })?;

        let out = self
            .virsh(&["define", xml_path.to_str().unwrap_or_default()])
            .map_err(|e| DockvmError::domain_create(spec.name.clone(), e.to_string()))?;
        let _ = std::fs::remove_file(&xml_path);
        if !out.ok() {
            return Err(DockvmError::domain_create(spec.name.clone(), out.stderr));
        }

        let out = self
            .virsh(&["start", &spec.name])
            .map_err(|e| DockvmError::domain_create(spec.name.clone(), e.to_string()))?;
        if !out.ok() {
            return Err(DockvmError::domain_create(spec.name.clone(), out.stderr));
        }
        Ok(())
    }

    /// Powers off (if running) and undefines. Idempotent: an absent
    /// domain is success.
    pub fn destroy(&self, name: &str) -> Result<(), DockvmError> {
        if !self.list()?.iter().any(|n| n == name) {
            return Ok(());
        }
        // `destroy` (power off) may legitimately fail if already shut off.
        let _ = self.virsh(&["destroy", name]);

        let out = self
            .virsh(&["undefine", name])
            .map_err(|e| DockvmError::domain_create(name.to_string(), e.to_string()))?;
        if !out.ok() && !out.stderr.contains("failed to get domain") {
            return Err(DockvmError::domain_create(name.to_string(), out.stderr));
        }
        Ok(())
    }

    /// Names of all defined domains (any state).
    pub fn list(&self) -> Result<Vec<String>, DockvmError> {
        let out = self
            .virsh(&["list", "--all", "--name"])
            .map_err(|e| DockvmError::domain_create("list", e.to_string()))?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Polls the default network's DHCP leases for `name`'s interface
    /// until an IPv4 address appears or `timeout` elapses.
    pub fn lease(&self, name: &str, timeout: Duration) -> Result<String, DockvmError> {
        let deadline = Instant::now() + timeout;
        loop {
            let out = self
                .virsh(&["domifaddr", name, "--source", "lease"])
                .map_err(|e| DockvmError::domain_create(name.to_string(), e.to_string()))?;
            if let Some(ip) = parse_lease_address(&out.stdout) {
                return Ok(ip);
            }
            if Instant::now() >= deadline {
                return Err(DockvmError::lease_timeout(name.to_string()));
            }
            let jitter = rand::thread_rng().gen_range(900..1100);
            thread::sleep(Duration::from_millis(jitter));
        }
    }
}

fn parse_lease_address(domifaddr_output: &str) -> Option<String> {
    domifaddr_output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.get(2) != Some(&"ipv4") {
            return None;
        }
        let addr = fields.get(3)?.split('/').next()?;
        addr.parse::<std::net::Ipv4Addr>().ok()?;
        Some(addr.to_string())
    })
}

fn render_domain_xml(spec: &VMSpec, disk: &Path, seed: &Path) -> String {
    let network_xml = match &spec.net {
        NetSpec::Default => "<interface type='network'><source network='default'/><model type='virtio'/></interface>".to_string(),
        NetSpec::Bridge(ifname) => format!(
            "<interface type='bridge'><source bridge='{ifname}'/><model type='virtio'/></interface>"
        ),
    };

    format!(
        r#"<domain type='kvm'>
  <name>{name}</name>
  <memory unit='MiB'>{mem}</memory>
  <vcpu>{cpus}</vcpu>
  <os>
    <type arch='x86_64' machine='q35'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features><acpi/><apic/></features>
  <cpu mode='host-model'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2'/>
      <source file='{disk}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{seed}'/>
      <target dev='sda' bus='sata'/>
      <readonly/>
    </disk>
    {network}
    <console type='pty'/>
  </devices>
  <metadata><dockvm:variant xmlns:dockvm='https://dockvm.dev/xml'>{variant}</dockvm:variant></metadata>
</domain>
"#,
        name = spec.name,
        mem = spec.mem,
        cpus = spec.cpus,
        disk = disk.display(),
        seed = seed.display(),
        network = network_xml,
        variant = spec.os,
    )
}

#[cfg(test)]
mod tests {
    use super::subprocess::fakes::RecordingRunner;
    use super::*;
    use std::path::PathBuf;

    fn spec() -> VMSpec {
        let global = crate::config::GlobalConfig::default_catalog();
        let mut project = std::collections::HashMap::new();
        project.insert("name".to_string(), "demo".to_string());
        project.insert("domain".to_string(), "demo.local".to_string());
        project.insert("image".to_string(), "nginx:latest".to_string());
        project.insert("port".to_string(), "80".to_string());
        VMSpec::resolve(&global, &project, &std::collections::HashMap::new()).unwrap()
    }

    #[test]
    fn define_and_start_fails_if_domain_already_exists() {
        let runner = RecordingRunner::new(vec![CommandOutput {
            status: 0,
            stdout: "demo\n".to_string(),
            stderr: String::new(),
        }]);
        let hv = Hypervisor::new(&runner, Context::Session);
        let result = hv.define_and_start(&spec(), &PathBuf::from("disk.qcow2"), &PathBuf::from("seed.iso"));
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::DomainCreate);
    }

    #[test]
    fn destroy_on_absent_domain_is_a_no_op() {
        let runner = RecordingRunner::new(vec![CommandOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        }]);
        let hv = Hypervisor::new(&runner, Context::Session);
        assert!(hv.destroy("ghost").is_ok());
        assert_eq!(runner.calls().len(), 1);
    }

    #[test]
    fn list_parses_newline_separated_names() {
        let runner = RecordingRunner::new(vec![CommandOutput {
            status: 0,
            stdout: "demo\nother\n".to_string(),
            stderr: String::new(),
        }]);
        let hv = Hypervisor::new(&runner, Context::Session);
        assert_eq!(hv.list().unwrap(), vec!["demo".to_string(), "other".to_string()]);
    }

    #[test]
    fn lease_parses_domifaddr_table() {
        let domifaddr = "Name       MAC address          Protocol     Address\n\
                          -------------------------------------------------------------------------------\n\
                          vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.42/24\n";
        let runner = RecordingRunner::new(vec![
            CommandOutput {
                status: 0,
                stdout: String::new(),
                stderr: String::new(),
            },
            CommandOutput {
                status: 0,
                stdout: domifaddr.to_string(),
                stderr: String::new(),
            },
        ]);
        let hv = Hypervisor::new(&runner, Context::Session);
        let ip = hv.lease("demo", Duration::from_secs(5)).unwrap();
        assert_eq!(ip, "192.168.122.42");
    }

    #[test]
    fn lease_times_out_when_never_leased() {
        let runner = RecordingRunner::new(vec![]);
        let hv = Hypervisor::new(&runner, Context::Session);
        let result = hv.lease("demo", Duration::from_millis(20));
        assert_eq!(result.unwrap_err().kind(), crate::error::ErrorKind::LeaseTimeout);
    }

    #[test]
    fn parse_lease_address_skips_header_and_ipv6() {
        let domifaddr = "Name       MAC address          Protocol     Address\n\
                          -------------------------------------------------------------------------------\n\
                          vnet0      52:54:00:aa:bb:cc    ipv6         fe80::1/64\n\
                          vnet0      52:54:00:aa:bb:cc    ipv4         192.168.122.42/24\n";
        assert_eq!(parse_lease_address(domifaddr), Some("192.168.122.42".to_string()));
    }

    #[test]
    fn parse_lease_address_returns_none_without_a_lease() {
        let domifaddr = "Name       MAC address          Protocol     Address\n\
                          -------------------------------------------------------------------------------\n";
        assert_eq!(parse_lease_address(domifaddr), None);
    }

    #[test]
    fn bridge_net_spec_renders_bridge_interface() {
        let mut s = spec();
        s.net = NetSpec::Bridge("br0".to_string());
        let xml = render_domain_xml(&s, &PathBuf::from("d.qcow2"), &PathBuf::from("s.iso"));
        assert!(xml.contains("bridge='br0'"));
    }
}
