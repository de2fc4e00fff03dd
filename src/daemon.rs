use std::path::Path;

#[cfg(unix)]
pub fn daemonize(pid_file: &Path) -> anyhow::Result<()> {
    use daemonize::Daemonize;

    log::info!("Starting daemon mode...");

    // Keep the working directory so relative paths from the config still resolve.
    let daemonize = Daemonize::new()
        .pid_file(pid_file)
        .chown_pid_file(true)
        .working_directory(std::env::current_dir()?)
        .umask(0o027);

    match daemonize.start() {
        Ok(_) => {
            log::info!("Daemon started, PID {}", std::process::id());
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("Failed to start daemon mode: {}", e)),
    }
}

#[cfg(not(unix))]
pub fn daemonize(_pid_file: &Path) -> anyhow::Result<()> {
    log::warn!("Daemon mode not supported on this platform, staying in foreground");
    Ok(())
}
