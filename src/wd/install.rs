use crate::wd::config::ConfigStore;
use crate::wd::logger::Logger;
use anyhow::Context as _;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

const UNIT_DIR: &str = "/etc/systemd/system";

pub fn unit_path(service_name: &str) -> PathBuf {
    Path::new(UNIT_DIR).join(format!("{service_name}.service"))
}

/// Tests whether the service is currently registered with the service manager.
pub fn is_installed(service_name: &str) -> bool {
    unit_path(service_name).is_file()
}

fn unit_file_contents(service_name: &str, exe_file: &Path, exe_dir: &Path) -> String {
    // Type=notify, so the adapter's status reports reach the manager
    format!(
        "[Unit]\n\
         Description={service_name} (svcwatchdog)\n\
         After=network.target\n\
         \n\
         [Service]\n\
         Type=notify\n\
         NotifyAccess=main\n\
         ExecStart={exe}\n\
         WorkingDirectory={dir}\n\
         \n\
         [Install]\n\
         WantedBy=multi-user.target\n",
        exe = exe_file.display(),
        dir = exe_dir.display(),
    )
}

/// Registers the service: writes the unit file and, when `autoStart` is
/// configured, enables it for boot-time start. Requires admin rights.
pub fn install(
    cfg: &ConfigStore,
    logger: &Logger,
    service_name: &str,
    exe_file: &Path,
    exe_dir: &Path,
) -> anyhow::Result<()> {
    let auto_start = cfg.get_bool("svcWatchDog", "autoStart", false);
    logger.info("install.install", format!("autoStart={auto_start}"));

    let path = unit_path(service_name);
    fs::write(&path, unit_file_contents(service_name, exe_file, exe_dir))
        .with_context(|| format!("failed to create service {service_name} ({})", path.display()))?;

    run_systemctl(logger, &["daemon-reload"]);
    if auto_start {
        run_systemctl(logger, &["enable", service_name]);
    }

    logger.info("install.install", format!("service {service_name} installed"));
    Ok(())
}

/// Removes the service registration.
pub fn uninstall(logger: &Logger, service_name: &str) -> anyhow::Result<()> {
    run_systemctl(logger, &["disable", service_name]);
    let path = unit_path(service_name);
    fs::remove_file(&path)
        .with_context(|| format!("failed to remove service {service_name} ({})", path.display()))?;
    run_systemctl(logger, &["daemon-reload"]);
    logger.info("install.uninstall", format!("service {service_name} removed"));
    Ok(())
}

fn run_systemctl(logger: &Logger, args: &[&str]) {
    match Command::new("systemctl").args(args).status() {
        Ok(status) if status.success() => {}
        Ok(status) => {
            logger.warning("install.run_systemctl", format!("systemctl {} exited with {status}", args.join(" ")));
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            logger.warning(
                "install.run_systemctl",
                "systemctl not found; the unit file was written but not reloaded",
            );
        }
        Err(e) => {
            logger.warning("install.run_systemctl", format!("systemctl {} failed: {e}", args.join(" ")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_file_names_the_binary_and_workdir() {
        let unit = unit_file_contents(
            "mysvc",
            Path::new("/opt/mysvc/mysvc"),
            Path::new("/opt/mysvc"),
        );
        assert!(unit.contains("Description=mysvc (svcwatchdog)"));
        assert!(unit.contains("Type=notify"));
        assert!(unit.contains("ExecStart=/opt/mysvc/mysvc\n"));
        assert!(unit.contains("WorkingDirectory=/opt/mysvc\n"));
    }

    #[test]
    fn unit_path_uses_the_service_name() {
        assert_eq!(
            unit_path("mysvc"),
            Path::new("/etc/systemd/system/mysvc.service")
        );
    }
}
