//! Command-line surface: `dockvm up|down|ip|stack|check|heal|generate-image|completion`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(name = "dockvm", version = crate::version::get_long_version(), about = "Provision short-lived local VMs that run a container behind an in-VM reverse proxy")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Resolve the spec, ensure the domain is defined and started, and wait for readiness.
    Up(UpArgs),
    /// Tear a VM down: destroy the domain and remove its work directory. Idempotent.
    Down {
        name: String,
    },
    /// Print the VM's current leased IPv4 address.
    Ip {
        name: String,
        #[arg(long, default_value_t = 120)]
        timeout_secs: u64,
    },
    /// Deploy or destroy a declared set of named VMs.
    Stack {
        #[command(subcommand)]
        action: StackAction,
    },
    /// Diagnose host readiness; exits nonzero if a required tool is missing.
    Check,
    /// Run diagnostics and, with --apply, repair what it can.
    Heal {
        #[arg(long)]
        apply: bool,
    },
    /// Render an installer disk image bundling the core tool.
    GenerateImage {
        #[arg(long, default_value = "dockvm-installer.tar.gz")]
        output: PathBuf,
    },
    /// Emit a shell completion script.
    Completion {
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
pub enum StackAction {
    Deploy { file: PathBuf },
    Destroy { file: PathBuf },
}

#[derive(Debug, Clone, clap::Args)]
pub struct UpArgs {
    #[arg(long)]
    pub name: Option<String>,
    #[arg(long)]
    pub domain: Option<String>,
    #[arg(long)]
    pub image: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    #[arg(long)]
    pub os: Option<String>,
    #[arg(long)]
    pub mem: Option<u32>,
    #[arg(long)]
    pub cpus: Option<u32>,
    #[arg(long)]
    pub disk: Option<u32>,
    #[arg(long)]
    pub net: Option<String>,
}

impl UpArgs {
    /// Collapses the set fields into the CLI-override tier of config
    /// precedence; unset fields are simply absent from the map so the
    /// project file and global defaults still apply beneath them.
    pub fn overrides(&self) -> std::collections::HashMap<String, String> {
        let mut map = std::collections::HashMap::new();
        macro_rules! put {
            ($field:ident) => {
                if let Some(value) = &self.$field {
                    map.insert(stringify!($field).to_string(), value.to_string());
                }
            };
        }
        put!(name);
        put!(domain);
        put!(image);
        put!(port);
        put!(os);
        put!(mem);
        put!(cpus);
        put!(disk);
        put!(net);
        map
    }
}
