use std::io;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use clap_complete::generate as generate_completion_script;
use tokio_util::sync::CancellationToken;

mod cancel;
mod cli;
mod config;
mod disk;
mod doctor;
mod environment;
mod error;
mod generate_image;
mod hypervisor;
mod image_cache;
mod lifecycle;
mod probe;
mod ready;
mod seed;
mod stack;
mod version;

use cli::{Cli, Commands, StackAction};
use config::{GlobalConfig, ProjectConfig, VMSpec};
use environment::Environment;
use error::ErrorKind;
use hypervisor::subprocess::RealRunner;
use hypervisor::Context as HvContext;

#[tokio::main]
async fn main() {
    env_logger::init();

    let argv: Vec<String> = std::env::args().collect();
    let exit_code = run(&argv).await;

    if let Ok(env) = Environment::open() {
        env.log_invocation(&argv, exit_code);
    }
    std::process::exit(exit_code);
}

async fn run(argv: &[String]) -> i32 {
    let cli = match Cli::try_parse_from(argv) {
        Ok(cli) => cli,
        Err(e) => {
            e.print().ok();
            return if e.use_stderr() { 2 } else { 0 };
        }
    };

    match dispatch(cli.command).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{e}");
            e.kind().exit_code()
        }
    }
}

async fn dispatch(command: Commands) -> Result<(), error::DockvmError> {
    let env = Environment::open().map_err(|e| error::DockvmError::new(ErrorKind::Internal, e.to_string()))?;
    let runner = RealRunner;
    let hv_context = HvContext::Session;

    match command {
        Commands::Up(args) => {
            let global = GlobalConfig::load(&env).map_err(|e| error::DockvmError::new(ErrorKind::Internal, e.to_string()))?;
            let cwd = std::env::current_dir().map_err(|e| error::DockvmError::new(ErrorKind::Internal, e.to_string()))?;
            let project = ProjectConfig::discover_from(&cwd).map_err(|e| error::DockvmError::new(ErrorKind::Internal, e.to_string()))?;
            let spec = VMSpec::resolve(&global, &project.values, &args.overrides())?;

            let token = cancel_on_ctrl_c();
            let outcome = lifecycle::up(&env, &runner, hv_context, &global, &spec, &token).await?;
            println!("{}: state={:?} ip={}", spec.name, outcome.state, outcome.ip);
            Ok(())
        }
        Commands::Down { name } => {
            lifecycle::down(&env, &runner, hv_context, &name)?;
            println!("{name}: torn down");
            Ok(())
        }
        Commands::Ip { name, timeout_secs } => {
            let ip = lifecycle::ip(&runner, hv_context, &name, std::time::Duration::from_secs(timeout_secs))?;
            println!("{ip}");
            Ok(())
        }
        Commands::Stack { action } => match action {
            StackAction::Deploy { file } => {
                let decl = stack::StackDecl::load(&file)
                    .map_err(|e| error::DockvmError::new(ErrorKind::ConfigInvalid, e.to_string()))?;
                let global = GlobalConfig::load(&env).map_err(|e| error::DockvmError::new(ErrorKind::Internal, e.to_string()))?;
                let token = cancel_on_ctrl_c();
                let statuses = stack::deploy(&env, Arc::new(runner), hv_context, &global, &decl, &token).await?;
                print_stack_statuses(&statuses);
                if statuses.values().any(|s| matches!(s, stack::NodeStatus::Failed(_))) {
                    return Err(error::DockvmError::new(ErrorKind::DomainCreate, "one or more stack nodes failed"));
                }
                Ok(())
            }
            StackAction::Destroy { file } => {
                let decl = stack::StackDecl::load(&file)
                    .map_err(|e| error::DockvmError::new(ErrorKind::ConfigInvalid, e.to_string()))?;
                let statuses = stack::destroy(&env, &runner, hv_context, &decl)?;
                print_stack_statuses(&statuses);
                Ok(())
            }
        },
        Commands::Check => {
            let report = doctor::check(&runner, &env);
            print_doctor_report(&report);
            if report.has_errors() {
                return Err(error::DockvmError::new(ErrorKind::ToolMissing, "one or more required checks failed"));
            }
            Ok(())
        }
        Commands::Heal { apply } => {
            let report = doctor::heal(&runner, &env, apply)?;
            print_doctor_report(&report);
            Ok(())
        }
        Commands::GenerateImage { output } => {
            generate_image::generate(&output)?;
            println!("wrote {}", output.display());
            Ok(())
        }
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate_completion_script(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
    }
}

/// Builds a cancellation token wired to Ctrl-C, so any blocking operation
/// racing on it unwinds through the same rollback path as a timeout.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let ctrl_c_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_token.cancel();
        }
    });
    token
}

fn print_doctor_report(report: &doctor::DoctorReport) {
    for finding in &report.findings {
        println!("[{:?}] {}: {}", finding.severity, finding.id, finding.message);
    }
}

fn print_stack_statuses(statuses: &std::collections::HashMap<String, stack::NodeStatus>) {
    let mut names: Vec<&String> = statuses.keys().collect();
    names.sort();
    for name in names {
        println!("{name}: {:?}", statuses[name]);
    }
}
