//! Diagnostics command - platform and data-root health report

use anyhow::Result;

use servin_daemon::config::Configuration;
use servin_daemon::platform::Platform;
use servin_daemon::vm::select_provider_kind;

/// Print a diagnostic report
pub async fn run(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path)?;
    let platform = Platform::probe();

    println!("servin-daemon {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Host");
    println!("  os:              {}", platform.os);
    println!("  arch:            {}", platform.arch);
    println!("  version:         {}", platform.os_version);
    println!("  cpus:            {}", platform.cpus);
    println!("  memory:          {} MB", platform.total_memory / (1 << 20));
    println!("  virtualization:  {}", platform.virtualization);
    println!("  privilege:       {:?}", platform.privilege);
    println!("  native path:     {}", platform.supports_native());
    println!();

    println!("Execution path");
    match select_provider_kind(&platform, &config.vm) {
        Ok(Some(kind)) => println!("  provider:        {}", kind),
        Ok(None) => println!("  provider:        none (native only)"),
        Err(e) => println!("  provider:        error: {}", e),
    }
    println!();

    println!("State");
    for (label, path) in [
        ("data root", config.system.data_root.clone()),
        ("images", config.system.images_dir()),
        ("containers", config.system.containers_dir()),
        ("sandboxes", config.system.sandboxes_dir()),
        ("volumes", config.system.volumes_dir()),
        ("state root", config.system.state_root.clone()),
    ] {
        let status = if path.exists() { "ok" } else { "missing" };
        println!("  {:<12} {} ({})", label, path.display(), status);
    }

    let marker = config.system.vm_running_marker();
    println!(
        "  vm marker:   {} ({})",
        marker.display(),
        if marker.exists() {
            "vm should be running"
        } else {
            "absent"
        }
    );

    Ok(())
}
