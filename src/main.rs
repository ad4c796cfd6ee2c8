//! Command line interface for operating the relay. Supports initialization,
//! importing and exporting events, index rebuilds, signature verification,
//! and serving the relay over HTTP/WebSocket.

mod auth;
mod config;
mod connection;
mod envelope;
mod error;
mod event;
mod filter;
mod handler;
mod index;
mod listener;
mod migrate;
mod query;
mod relay;
mod server;
mod storage;
mod ws;

use std::{
    fs,
    io::{self, BufWriter, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use config::Settings;
use event::Event;
use relay::{Published, Relay};
use storage::Store;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "keel",
    author,
    version,
    about = "Nostr relay backed by an embedded event store"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long)]
    verbose: bool,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the store at `STORE_ROOT`.
    Init,
    /// Import events from JSON files, one event per line or one per file.
    Import {
        #[arg(required = true)]
        files: Vec<String>,
    },
    /// Write every stored event as JSON lines.
    Export {
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Rebuild every secondary index from the raw events.
    Reindex,
    /// Serve the relay until interrupted.
    Serve,
    /// Verify signatures of up to `sample` stored events.
    Verify {
        #[arg(long, default_value_t = 1000)]
        sample: usize,
    },
}

/// Outcome counts of an import run.
#[derive(Debug, Default, PartialEq, Eq)]
struct ImportReport {
    stored: usize,
    duplicates: usize,
    skipped: usize,
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    let store = Store::open(&cfg.store_root, cfg.max_limit)
        .with_context(|| format!("opening store at {}", cfg.store_root.display()))?;
    match cli.command {
        Commands::Init => {
            info!(root = %cfg.store_root.display(), "store ready");
        }
        Commands::Import { files } => {
            let verify = cfg.verify_sig;
            let relay = Relay::new(store.clone(), cfg);
            let report = import(&relay, &files, verify).await?;
            info!(
                stored = report.stored,
                duplicates = report.duplicates,
                skipped = report.skipped,
                "import finished"
            );
        }
        Commands::Export { out } => {
            let n = match out {
                Some(path) => {
                    let file = fs::File::create(&path)
                        .with_context(|| format!("creating {}", path.display()))?;
                    let mut w = BufWriter::new(file);
                    let n = store.export(&mut w)?;
                    w.flush()?;
                    n
                }
                None => store.export(io::stdout().lock())?,
            };
            info!(events = n, "export finished");
        }
        Commands::Reindex => {
            let n = store.reindex()?;
            info!(events = n, "reindex finished");
        }
        Commands::Serve => {
            let addr: SocketAddr = cfg
                .bind
                .parse()
                .with_context(|| format!("BIND={:?} is not a socket address", cfg.bind))?;
            let relay = Relay::new(store.clone(), cfg);
            server::serve(addr, relay, shutdown_signal()).await?;
        }
        Commands::Verify { sample } => {
            let n = store.verify_sample(sample)?;
            info!(checked = n, "signatures verified");
        }
    }
    store.close();
    Ok(())
}

/// Publish every event found in `files` through the relay's replacement rules.
async fn import(relay: &Relay, files: &[String], verify: bool) -> anyhow::Result<ImportReport> {
    let mut report = ImportReport::default();
    for path in files {
        let data = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        let events = match serde_json::from_str::<Event>(&data) {
            Ok(ev) => vec![ev],
            Err(_) => data
                .lines()
                .enumerate()
                .filter(|(_, line)| !line.trim().is_empty())
                .map(|(n, line)| {
                    serde_json::from_str::<Event>(line)
                        .with_context(|| format!("{path}:{}: not an event", n + 1))
                })
                .collect::<anyhow::Result<Vec<_>>>()?,
        };
        for ev in events {
            if verify {
                ev.verify()
                    .with_context(|| format!("{path}: event {}", ev.id))?;
            }
            match relay.publish(&ev).await {
                Ok(Published::Duplicate) => report.duplicates += 1,
                Ok(Published::Superseded) => report.skipped += 1,
                Ok(_) => report.stored += 1,
                Err(reject) => bail!("{path}: event {}: {reject}", ev.id),
            }
        }
    }
    Ok(report)
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("keel-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT={}\n", store_root.to_string_lossy()));
    content.push_str("BIND=127.0.0.1:7777\n");
    content.push_str("SERVICE_URL=\n");
    content.push_str("VERIFY_SIG=1\n");
    content.push_str("AUTH_REQUIRED=0\n");
    content.push_str("OWNERS=\n");
    content.push_str("RELAY_NAME=keel\n");
    content.push_str("RELAY_DESCRIPTION=\n");
    fs::write(env_path, content)?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    run(cli).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ENV_KEYS, ENV_MUTEX},
        event::fixtures::signed,
        filter::Filter,
    };
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::{net::TcpListener, task};

    fn clear_env() {
        for v in ENV_KEYS {
            std::env::remove_var(v);
        }
    }

    fn write_env(dir: &TempDir, extra: &str) -> String {
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nBIND=127.0.0.1:0\n{}",
            dir.path().join("data").to_str().unwrap(),
            extra
        );
        fs::write(&env_path, content).unwrap();
        env_path.to_str().unwrap().into()
    }

    fn cli(env: &str, command: Commands) -> Cli {
        Cli {
            env: env.into(),
            verbose: false,
            command,
        }
    }

    #[tokio::test]
    async fn run_init_import_export_reindex_verify() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "");

        run(cli(&env_file, Commands::Init)).await.unwrap();

        let a = signed(1, 1, 10, &[], "a");
        let b = signed(2, 1, 20, &[], "b");
        let single = dir.path().join("one.json");
        fs::write(&single, serde_json::to_string_pretty(&a).unwrap()).unwrap();
        let lines = dir.path().join("many.jsonl");
        fs::write(
            &lines,
            format!(
                "{}\n\n{}\n",
                serde_json::to_string(&a).unwrap(),
                serde_json::to_string(&b).unwrap()
            ),
        )
        .unwrap();
        let files = vec![
            single.to_str().unwrap().to_string(),
            lines.to_str().unwrap().to_string(),
        ];
        run(cli(&env_file, Commands::Import { files })).await.unwrap();

        let out = dir.path().join("export.jsonl");
        run(cli(&env_file, Commands::Export { out: Some(out.clone()) }))
            .await
            .unwrap();
        let exported = fs::read_to_string(&out).unwrap();
        assert_eq!(exported.lines().count(), 2);

        run(cli(&env_file, Commands::Reindex)).await.unwrap();
        run(cli(&env_file, Commands::Verify { sample: 10 })).await.unwrap();
    }

    #[tokio::test]
    async fn import_refuses_bad_signatures() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_file = write_env(&dir, "VERIFY_SIG=1\n");
        let mut ev = signed(1, 1, 10, &[], "a");
        ev.content = "forged".into();
        let path = dir.path().join("bad.json");
        fs::write(&path, serde_json::to_string(&ev).unwrap()).unwrap();
        let files = vec![path.to_str().unwrap().to_string()];
        assert!(run(cli(&env_file, Commands::Import { files })).await.is_err());
    }

    #[tokio::test]
    async fn import_applies_replacement() {
        let dir = TempDir::new().unwrap();
        let cfg = Settings::with_root(dir.path());
        let store = Store::open(dir.path(), cfg.max_limit).unwrap();
        let relay = Relay::new(store.clone(), cfg);
        let old = signed(1, 0, 10, &[], "old");
        let new = signed(1, 0, 20, &[], "new");
        let path = dir.path().join("profiles.jsonl");
        fs::write(
            &path,
            format!(
                "{}\n{}\n{}\n",
                serde_json::to_string(&new).unwrap(),
                serde_json::to_string(&old).unwrap(),
                serde_json::to_string(&new).unwrap()
            ),
        )
        .unwrap();
        let report = import(&relay, &[path.to_str().unwrap().to_string()], true)
            .await
            .unwrap();
        assert_eq!(
            report,
            ImportReport {
                stored: 1,
                duplicates: 1,
                skipped: 1
            }
        );
        let all = store.query_all(&Filter::default()).await.unwrap();
        assert_eq!(all, vec![new]);
    }

    #[tokio::test]
    async fn init_creates_default_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        run(cli(&env_path.to_string_lossy(), Commands::Init))
            .await
            .unwrap();

        let data = fs::read_to_string(&env_path).unwrap();
        let expected_root = dir.path().join("keel-data");
        assert!(data.contains(&format!("STORE_ROOT={}", expected_root.to_string_lossy())));
        assert!(data.contains("BIND=127.0.0.1:7777"));
        assert!(expected_root.join("events.redb").exists());
    }

    #[tokio::test]
    async fn run_serve_starts_http() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let env_path = dir.path().join(".env");
        let content = format!(
            "STORE_ROOT={}\nBIND=127.0.0.1:{}\n",
            dir.path().to_str().unwrap(),
            port
        );
        fs::write(&env_path, content).unwrap();
        let env_str = env_path.to_str().unwrap().to_string();

        let handle = task::spawn(run(cli(&env_str, Commands::Serve)));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let url = format!("http://127.0.0.1:{}/healthz", port);
        let resp = reqwest::get(url).await.unwrap();
        assert!(resp.status().is_success());
        handle.abort();
    }
}
