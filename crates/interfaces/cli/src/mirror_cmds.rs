use std::fs;
use std::io;
use std::io::IsTerminal;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;

use markmirror_config::AppConfig;
use markmirror_runtime::{DaemonClient, DaemonStatus, ServerEvent};
use markmirror_store::{BookmarkNode, MirrorStore};
use markmirror_sync::{RawEvent, StatusMessage};

use crate::daemon::socket_accepts;

// ── daemon queries ───────────────────────────────────────────────────────────

pub(crate) fn print_status(status: &DaemonStatus) {
    let sync = &status.sync;
    println!("── markmirror ───────────────────────────────────────");
    println!("  provider     : {}", status.provider);
    println!("  store        : {}", status.store_path);
    println!("  uptime       : {}s", status.uptime_secs);
    match status.node_count {
        Some(n) => println!("  nodes        : {n}"),
        None => println!("  nodes        : (mirror not open)"),
    }
    println!();
    println!("── sync ─────────────────────────────────────────────");
    println!("  state        : {:?}", sync.state);
    println!("  phase        : {:?} {}%", sync.phase, sync.percentage);
    println!("  message      : {}", sync.message);
    println!("  db ready     : {}", sync.db_ready);
    println!("  cursor       : {}", sync.cursor_sequence);
    println!(
        "  last full    : {}",
        sync.last_full_sync_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "(never)".to_string())
    );
    println!("  full syncs   : {}", sync.full_syncs);
    println!(
        "  batches      : {} ({} mutations)",
        sync.batches_applied, sync.mutations_applied
    );
    println!("  anomalies    : {}", sync.anomalies);
    if let Some(err) = &sync.last_error {
        println!("  last error   : {err}");
    }
}

pub(crate) fn node_line(node: &BookmarkNode) -> String {
    match &node.url {
        Some(url) => format!("{:>8}  {}  <{url}>", node.id, node.title),
        None => format!("{:>8}  {}/", node.id, node.title),
    }
}

pub(crate) fn print_nodes(nodes: &[BookmarkNode], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(nodes)?);
        return Ok(());
    }
    if nodes.is_empty() {
        println!("(no nodes)");
        return Ok(());
    }
    for node in nodes {
        println!("{}", node_line(node));
    }
    Ok(())
}

pub(crate) fn print_node_detail(node: &BookmarkNode) {
    println!("  id        : {}", node.id);
    println!("  kind      : {}", node.kind.as_str());
    println!("  title     : {}", node.title);
    if let Some(url) = &node.url {
        println!("  url       : {url}");
    }
    println!("  parent    : {}", node.parent_id.as_deref().unwrap_or("(root)"));
    println!("  index     : {}", node.index);
    if let Some(added) = node.date_added {
        println!("  added     : {}", added.to_rfc3339());
    }
    if let Some(modified) = node.date_modified {
        println!("  modified  : {}", modified.to_rfc3339());
    }
}

/// Parse a JSONL file of provider events.  Blank lines and `#` comments are
/// skipped.
pub(crate) fn read_events(path: &Path) -> Result<Vec<RawEvent>> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading events from {}", path.display()))?;
    let mut events = Vec::new();
    for (lineno, line) in raw.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event: RawEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("{}:{}: invalid event", path.display(), lineno + 1))?;
        events.push(event);
    }
    Ok(events)
}

pub(crate) fn status_line(message: &StatusMessage) -> String {
    match message {
        StatusMessage::SyncProgress {
            percentage,
            message,
            phase,
        } => format!("[{phase:?}] {percentage:>3}% {message}"),
        StatusMessage::DbReady => "mirror ready".to_string(),
    }
}

pub(crate) async fn run_watch(client: &DaemonClient, json: bool) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = client.clone();
    let subscription = tokio::spawn(async move { watcher.subscribe(tx).await });

    while let Some(event) = rx.recv().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
            continue;
        }
        match event {
            ServerEvent::Status(status) => println!(
                "[{:?}] {:>3}% {} (cursor {})",
                status.sync.phase, status.sync.percentage, status.sync.message,
                status.sync.cursor_sequence
            ),
            ServerEvent::Progress(message) => println!("{}", status_line(&message)),
            other => println!("{other:?}"),
        }
    }

    subscription.await??;
    println!("daemon closed the subscription");
    Ok(())
}

// ── offline store commands ───────────────────────────────────────────────────

fn open_offline(config: &AppConfig) -> Result<MirrorStore> {
    let path = Path::new(&config.store.path);
    if !path.exists() {
        bail!("no mirror at {}; start the daemon to build one", path.display());
    }
    MirrorStore::open(path).with_context(|| {
        format!(
            "opening mirror at {} (stop the daemon first: `markmirror stop`)",
            path.display()
        )
    })
}

pub(crate) fn run_verify(config: &AppConfig) -> Result<()> {
    let store = open_offline(config)?;
    let violations = store.verify()?;
    if violations.is_empty() {
        println!("mirror ok: {} nodes, no violations", store.node_count()?);
        return Ok(());
    }
    println!("── {} violations ─────────────────────────────────────", violations.len());
    for violation in &violations {
        println!("  {violation}");
    }
    bail!("mirror failed verification; run `markmirror rebuild` or `markmirror reset`")
}

pub(crate) fn run_stats(config: &AppConfig, json: bool) -> Result<()> {
    let store = open_offline(config)?;
    let stats = store.stats()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("── mirror stats ─────────────────────────────────────");
    println!("  path      : {}", store.path().display());
    println!("  nodes     : {}", stats.nodes);
    println!("  folders   : {}", stats.folders);
    println!("  bookmarks : {}", stats.bookmarks);
    match &stats.cursor {
        Some(cursor) => {
            println!("  cursor    : {} ({:?})", cursor.sequence, cursor.status);
            println!("  schema    : {}", cursor.schema_version);
            println!(
                "  last full : {}",
                cursor
                    .last_full_sync_at
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "(never)".to_string())
            );
        }
        None => println!("  cursor    : (none)"),
    }
    if stats.bootstrap_in_progress {
        println!("  bootstrap : interrupted; the next daemon start resumes it");
    }
    Ok(())
}

pub(crate) fn run_reset(config: &AppConfig, yes: bool) -> Result<()> {
    let path = Path::new(&config.store.path);
    if socket_accepts(Path::new(&config.daemon.socket_path)) {
        bail!("daemon is running; stop it first (`markmirror stop`)");
    }
    if !path.exists() {
        println!("no mirror at {}; nothing to reset", path.display());
        return Ok(());
    }

    println!("⚠️  destructive operation: mirror reset");
    println!("- store: {}", path.display());

    if !yes {
        if !io::stdin().is_terminal() {
            bail!("refusing destructive reset in non-interactive mode without --yes");
        }
        print!("This deletes the local mirror. Type 'RESET' to continue: ");
        io::stdout().flush()?;

        let mut confirmation = String::new();
        io::stdin().read_line(&mut confirmation)?;
        if confirmation.trim() != "RESET" {
            println!("reset cancelled");
            return Ok(());
        }
    }

    MirrorStore::reset(path)?;
    println!("mirror reset; the next daemon start runs a full sync");
    Ok(())
}
