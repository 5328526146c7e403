use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use serde_json::json;
use tokio::sync::oneshot;

use shiftwork::config::SupervisorConfig;
use shiftwork::context::ContextSegment;
use shiftwork::handlers::HandlerRegistry;
use shiftwork::store::{Database, LibSqlBackend};
use shiftwork::supervisor::Supervisor;
use shiftwork::worker::{Task, TaskStatus};

/// Scan files through the shiftwork worker pool.
#[derive(Parser)]
#[command(name = "shiftwork", version, about)]
struct Cli {
    /// Count lines containing this text
    #[arg(long)]
    pattern: Option<String>,

    /// Files to scan
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// libSQL database file
    #[arg(long, env = "SHIFTWORK_DB_PATH", default_value = "./data/shiftwork.db")]
    db: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let files: Vec<String> = cli.files.iter().map(|f| f.display().to_string()).collect();
    let pattern = cli.pattern;

    let config = SupervisorConfig::from_env().context("invalid SHIFTWORK_* configuration")?;

    eprintln!("shiftwork v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Workers: {}", config.max_workers);
    eprintln!("   Files: {}\n", files.len());

    // ── Database ─────────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&cli.db)
            .await
            .with_context(|| format!("failed to open database at {}", cli.db.display()))?,
    );

    // ── Supervisor ───────────────────────────────────────────────────────
    let registry = Arc::new(HandlerRegistry::with_builtins());
    let supervisor = Arc::new(Supervisor::new(config, db, registry)?);

    let recovered = supervisor.recover().await?;
    if recovered > 0 {
        eprintln!("   Resuming {recovered} task(s) from a previous run\n");
    }

    let context_id = supervisor.contexts().create().await;
    supervisor
        .contexts()
        .append_head(
            context_id,
            ContextSegment::new(format!("File scan of {} file(s)", files.len())),
        )
        .await?;

    let mut submitted = Vec::with_capacity(files.len());
    for file in &files {
        let payload = json!({
            "kind": "scan_file",
            "path": file,
            "pattern": pattern,
        });
        let id = supervisor
            .enqueue(Task::new(payload).with_context(context_id))
            .await?;
        submitted.push((file.clone(), id));
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let runner = tokio::spawn(Arc::clone(&supervisor).run(async move {
        tokio::select! {
            _ = shutdown_rx => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted; shutting down");
            }
        }
    }));

    let mut failed = 0;
    for (file, id) in &submitted {
        match supervisor.wait_for_result(*id).await {
            Ok(outcome) if outcome.status == TaskStatus::Completed => {
                let summary = outcome
                    .output
                    .and_then(|o| o.summary)
                    .unwrap_or_else(|| file.clone());
                println!("ok    {summary}");
            }
            Ok(outcome) => {
                failed += 1;
                println!(
                    "fail  {file}: {} (after {} retries)",
                    outcome.error.unwrap_or_default(),
                    outcome.retries
                );
            }
            Err(e) => {
                failed += 1;
                println!("fail  {file}: {e}");
            }
        }
    }

    let _ = shutdown_tx.send(());
    runner.await.context("supervisor task panicked")??;

    let usage = supervisor.contexts().usage(context_id).await?;
    eprintln!("\n   Context: {} tokens across tiers", usage.total());

    if failed > 0 {
        anyhow::bail!("{failed} of {} file(s) failed", submitted.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_files_and_pattern() {
        let cli = Cli::try_parse_from(["shiftwork", "--pattern", "ERROR", "a.log", "b.log"]).unwrap();
        assert_eq!(cli.pattern.as_deref(), Some("ERROR"));
        assert_eq!(cli.files, vec![PathBuf::from("a.log"), PathBuf::from("b.log")]);
    }

    #[test]
    fn test_cli_requires_files() {
        assert!(Cli::try_parse_from(["shiftwork"]).is_err());
        assert!(Cli::try_parse_from(["shiftwork", "--pattern", "x"]).is_err());
    }

    #[test]
    fn test_cli_db_path() {
        let cli = Cli::try_parse_from(["shiftwork", "--db", "/tmp/s.db", "a.log"]).unwrap();
        assert_eq!(cli.db, PathBuf::from("/tmp/s.db"));
    }
}
