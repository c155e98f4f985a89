use crate::wd::build_info;
use crate::wd::config::ConfigStore;
use crate::wd::crypto::SecretVault;
use crate::wd::email::EmailLogSink;
use crate::wd::install;
use crate::wd::logger::Logger;
use crate::wd::protect;
use crate::wd::service::{self, ServiceAdapter, ServiceHandler};
use crate::wd::supervisor::Supervisor;
use anyhow::Context as _;
use clap::Parser;
use std::sync::Arc;

// Compiled-in fallback for the secret vault; an obfuscation step, not a
// security boundary. Operators should configure cryptoTools.passwordFile.
const VAULT_FALLBACK_PASSWORD: &str = "SvcWatchDog.d41d8cd98f00b204";

#[derive(Debug, Parser)]
#[command(name = "svcwatchdog", version, about = "single-service process watchdog")]
pub struct Args {
    /// Install as an OS service (requires admin rights)
    #[arg(short = 'i', long = "install", conflicts_with_all = ["uninstall", "state"])]
    pub install: bool,

    /// Uninstall the OS service
    #[arg(short = 'u', long = "uninstall", conflicts_with = "state")]
    pub uninstall: bool,

    /// Print the installation state
    #[arg(short = 'v')]
    pub state: bool,
}

pub fn run() -> anyhow::Result<i32> {
    let args = Args::parse();

    // the configuration file shares the executable's directory and stem
    let exe_file = std::env::current_exe().context("cannot determine the executable path")?;
    let exe_dir = exe_file
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    let service_name = exe_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "svcwatchdog".to_string());
    let cfg_path = exe_dir.join(format!("{service_name}.json"));

    let cfg = Arc::new(ConfigStore::load(&cfg_path).with_context(|| {
        format!("unable to use configuration file {}", cfg_path.display())
    })?);

    // the supervisor is created before the logger starts, so its initial
    // chdir makes relative log paths resolve from a known point
    let logger = Logger::configure(&cfg, "log");
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&cfg), logger.clone())?);
    logger.start();
    logger.info("cli.run", build_info::banner());

    let vault = SecretVault::configure(&cfg, "cryptoTools", VAULT_FALLBACK_PASSWORD, &logger);

    let result = dispatch(&args, &cfg, &vault, &logger, &supervisor, &service_name);

    // the logger goes down last, so late shutdown records are captured
    logger.shutdown();
    result
}

fn dispatch(
    args: &Args,
    cfg: &Arc<ConfigStore>,
    vault: &SecretVault,
    logger: &Logger,
    supervisor: &Arc<Supervisor>,
    service_name: &str,
) -> anyhow::Result<i32> {
    // a tampered protected configuration must never reach the child
    if cfg.root().get("protectedSections").is_some() {
        if let Err(e) = protect::verify_json_protection(cfg.root(), vault.password()) {
            logger.fatal("cli.dispatch", format!("configuration integrity check failed: {e}"));
            anyhow::bail!("configuration integrity check failed: {e}");
        }
        logger.info("cli.dispatch", "configuration integrity check passed");
    }

    if args.state {
        println!("{}", build_info::banner());
        println!(
            "The {service_name} service is {} installed",
            if install::is_installed(service_name) { "currently" } else { "not" }
        );
        return Ok(0);
    }

    if args.install {
        if install::is_installed(service_name) {
            eprintln!("The {service_name} service is already installed.");
            return Ok(0);
        }
        return match install::install(cfg, logger, service_name, supervisor.exe_file(), supervisor.exe_dir()) {
            Ok(()) => {
                println!("{service_name} service installed.");
                Ok(0)
            }
            Err(e) => {
                eprintln!("The {service_name} service failed to install: {e:#}");
                Ok(1)
            }
        };
    }

    if args.uninstall {
        if !install::is_installed(service_name) {
            eprintln!("The {service_name} service is not installed.");
            return Ok(0);
        }
        return match install::uninstall(logger, service_name) {
            Ok(()) => {
                println!("{service_name} service uninstalled.");
                Ok(0)
            }
            Err(e) => {
                eprintln!("Could not uninstall service {service_name}: {e:#}");
                Ok(1)
            }
        };
    }

    EmailLogSink::configure_all(cfg, vault, logger, "log.email");
    supervisor.configure();

    if service::under_service_manager() {
        let adapter = ServiceAdapter::new(
            service_name,
            Arc::clone(supervisor) as Arc<dyn ServiceHandler>,
            logger.clone(),
        );
        supervisor.activate();
        return adapter.service_main();
    }

    // started interactively: validate the configuration and report
    logger.info("cli.dispatch", "not running under a service manager; validating configuration");
    println!("{}", build_info::banner());
    println!(
        "Configuration for service '{}' loaded OK; the service is {} installed.",
        supervisor.service_name(),
        if install::is_installed(service_name) { "currently" } else { "not" }
    );
    Ok(0)
}
