//! Background lifecycle of the mirror daemon.
//!
//! The pid, lock and log files live in a `daemon/` directory beside the
//! mirror file, so each mirror gets its own instance.  Liveness is judged by
//! asking the daemon for its status first and only falling back to the
//! recorded pid when the socket does not answer.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::{info, warn};

use markmirror_config::AppConfig;
use markmirror_runtime::{DaemonClient, DaemonStatus, run_daemon};
use markmirror_store::SCHEMA_VERSION;

const STARTUP_POLLS: usize = 50;
const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DaemonFiles {
    pub(crate) dir: PathBuf,
    pub(crate) pid: PathBuf,
    pub(crate) lock: PathBuf,
    pub(crate) log: PathBuf,
}

impl DaemonFiles {
    pub(crate) fn for_store(store_path: &Path) -> Self {
        let dir = store_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .join("daemon");
        Self {
            pid: dir.join("markmirror.pid"),
            lock: dir.join("markmirror.lock"),
            log: dir.join("markmirror.log"),
            dir,
        }
    }

    fn recorded_pid(&self) -> Option<u32> {
        fs::read_to_string(&self.pid).ok()?.trim().parse().ok()
    }

    fn forget(&self) {
        let _ = fs::remove_file(&self.pid);
        let _ = fs::remove_file(&self.lock);
    }
}

/// Who, if anyone, is serving a mirror right now.
#[derive(Debug)]
pub(crate) enum Presence {
    Serving(Box<DaemonStatus>),
    /// The recorded process is alive but its socket does not answer: it is
    /// still opening the mirror, or it is wedged.
    Unresponsive(u32),
    Stopped,
}

pub(crate) async fn presence(config: &AppConfig, files: &DaemonFiles) -> Presence {
    let client = DaemonClient::new(&config.daemon.socket_path);
    if let Ok(status) = client.get_status().await {
        return Presence::Serving(Box::new(status));
    }
    match files.recorded_pid() {
        Some(pid) if process_alive(pid) => Presence::Unresponsive(pid),
        _ => Presence::Stopped,
    }
}

pub(crate) fn status_lines(status: &DaemonStatus) -> Vec<String> {
    let sync = &status.sync;
    let mut lines = vec![
        format!("- pid: {}", status.pid),
        format!("- store: {}", status.store_path),
        format!(
            "- schema: {}",
            status
                .schema_version
                .map_or_else(|| "(no cursor yet)".to_string(), |v| v.to_string())
        ),
        format!(
            "- sync: {:?}, {:?} {}% ({})",
            sync.state, sync.phase, sync.percentage, sync.message
        ),
        format!(
            "- nodes: {}",
            status
                .node_count
                .map_or_else(|| "(mirror not open)".to_string(), |n| n.to_string())
        ),
        format!("- cursor: {}", sync.cursor_sequence),
    ];
    if let Some(err) = &sync.last_error {
        lines.push(format!("- last error: {err}"));
    }
    lines
}

/// Spawn `markmirror daemon run` in the background and wait until it
/// answers a status request.
pub(crate) async fn daemon_start(config_path: &Path, config: &AppConfig, force: bool) -> Result<()> {
    let files = DaemonFiles::for_store(Path::new(&config.store.path));
    match presence(config, &files).await {
        Presence::Stopped => {}
        Presence::Serving(status) if !force => bail!(
            "mirror {} is already served by pid {}; use `markmirror daemon restart`",
            status.store_path,
            status.pid
        ),
        Presence::Unresponsive(pid) if !force => bail!(
            "pid {pid} holds mirror {} but does not answer; use `markmirror daemon start --force`",
            config.store.path
        ),
        Presence::Serving(status) => terminate(status.pid).await?,
        Presence::Unresponsive(pid) => terminate(pid).await?,
    }
    files.forget();
    let socket = Path::new(&config.daemon.socket_path);
    if socket.exists() {
        let _ = fs::remove_file(socket);
    }

    fs::create_dir_all(&files.dir)
        .with_context(|| format!("creating {}", files.dir.display()))?;
    let log = OpenOptions::new().create(true).append(true).open(&files.log)?;
    let mut child = Command::new(std::env::current_exe()?)
        .arg("--config")
        .arg(config_path)
        .args(["daemon", "run"])
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log))
        .spawn()
        .context("spawning the mirror daemon")?;

    let client = DaemonClient::new(&config.daemon.socket_path);
    for _ in 0..STARTUP_POLLS {
        if let Ok(status) = client.get_status().await {
            println!("mirror daemon started");
            for line in status_lines(&status) {
                println!("{line}");
            }
            println!("- socket: {}", config.daemon.socket_path);
            println!("- log: {}", files.log.display());
            return Ok(());
        }
        if let Some(exit) = child.try_wait()? {
            bail!(
                "mirror daemon exited during startup ({exit}); see {}",
                files.log.display()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    bail!(
        "mirror daemon did not answer on {}; see {}",
        config.daemon.socket_path,
        files.log.display()
    )
}

pub(crate) async fn daemon_stop(config: &AppConfig) -> Result<()> {
    let files = DaemonFiles::for_store(Path::new(&config.store.path));
    match presence(config, &files).await {
        Presence::Stopped => println!("mirror daemon is not running"),
        Presence::Serving(status) => {
            DaemonClient::new(&config.daemon.socket_path)
                .graceful_shutdown()
                .await?;
            println!(
                "shutdown requested at cursor {} ({} nodes)",
                status.sync.cursor_sequence,
                status.node_count.unwrap_or(0)
            );
            if !wait_for_exit(status.pid, STOP_GRACE).await {
                warn!(pid = status.pid, "daemon ignored shutdown; terminating");
                terminate(status.pid).await?;
            }
            println!("mirror daemon stopped (pid {})", status.pid);
        }
        Presence::Unresponsive(pid) => {
            terminate(pid).await?;
            println!("unresponsive mirror daemon terminated (pid {pid})");
        }
    }
    files.forget();
    Ok(())
}

pub(crate) async fn daemon_status(config: &AppConfig) -> Result<()> {
    let files = DaemonFiles::for_store(Path::new(&config.store.path));
    match presence(config, &files).await {
        Presence::Serving(status) => {
            println!("mirror daemon: serving");
            for line in status_lines(&status) {
                println!("{line}");
            }
        }
        Presence::Unresponsive(pid) => {
            println!("mirror daemon: not answering");
            println!("- pid: {pid}");
            println!("- store: {}", config.store.path);
        }
        Presence::Stopped => {
            println!("mirror daemon: stopped");
            println!("- store: {}", config.store.path);
        }
    }
    println!("- socket: {}", config.daemon.socket_path);
    println!("- log: {}", files.log.display());
    Ok(())
}

pub(crate) fn socket_accepts(path: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(path).is_ok()
}

fn process_alive(pid: u32) -> bool {
    Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while process_alive(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    true
}

/// SIGTERM, then SIGKILL if the process outlives the grace period.
async fn terminate(pid: u32) -> Result<()> {
    if pid == std::process::id() {
        bail!("refusing to signal the current process ({pid})");
    }
    for signal in ["-TERM", "-KILL"] {
        let status = Command::new("kill").args([signal, &pid.to_string()]).status()?;
        if !status.success() && process_alive(pid) {
            bail!("could not signal mirror daemon pid {pid}");
        }
        if wait_for_exit(pid, STOP_GRACE).await {
            return Ok(());
        }
    }
    bail!("mirror daemon pid {pid} survived SIGKILL")
}

/// Foreground daemon: holds the per-mirror lock and runs until a client
/// sends `Shutdown` or the process gets SIGTERM or SIGINT.
pub(crate) async fn run_daemon_process(config: AppConfig) -> Result<()> {
    let files = DaemonFiles::for_store(Path::new(&config.store.path));
    fs::create_dir_all(&files.dir)?;
    let lock = File::create(&files.lock)?;
    lock.try_lock_exclusive().map_err(|_| {
        anyhow::anyhow!(
            "another daemon already serves mirror {}",
            config.store.path
        )
    })?;
    fs::write(&files.pid, std::process::id().to_string())?;
    info!(
        pid = std::process::id(),
        store = %config.store.path,
        schema = SCHEMA_VERSION,
        tree = %config.provider.tree_path,
        "mirror daemon process started"
    );

    let socket_path = config.daemon.socket_path.clone();
    let daemon = run_daemon(config);
    tokio::pin!(daemon);

    let signalled = async {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
        tokio::select! {
            _ = sigterm.recv() => {},
            _ = sigint.recv() => {},
        }
        Ok::<(), anyhow::Error>(())
    };

    let result = tokio::select! {
        result = &mut daemon => result,
        signal = signalled => {
            signal?;
            info!("termination signal received; shutting the mirror daemon down");
            let _ = DaemonClient::new(&socket_path).graceful_shutdown().await;
            // The coordinator finishes its current transaction first.
            daemon.await
        }
    };
    files.forget();
    drop(lock);
    result
}
