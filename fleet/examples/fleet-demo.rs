use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use fleet::{CompileTask, FleetConfig, FleetPool, LanguageCatalog, SourceCode};
use sandbox_lxd::{LxdClient, LxdConfig};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

/// Run source files through a warm LXD fleet and print the results as JSON.
#[derive(Parser)]
#[command(name = "fleet-demo")]
struct Cli {
    /// Fleet config (YAML). Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Language catalog (JSON with a `languages` array)
    #[arg(long)]
    languages: PathBuf,
    /// Language name from the catalog
    #[arg(long)]
    language: String,
    /// Override the number of standby instances
    #[arg(long)]
    standby: Option<usize>,
    /// Run all files concurrently instead of one after another
    #[arg(long)]
    parallel: bool,
    /// Source files to execute
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => fleet::config::load(path).await?,
        None => FleetConfig::default(),
    };
    if let Some(standby) = cli.standby {
        config.standby_target = standby;
    }

    let catalog = LanguageCatalog::load(&cli.languages).await?;
    let language = catalog
        .find(&cli.language)
        .cloned()
        .map(Arc::new)
        .ok_or_else(|| format!("unknown language: {}", cli.language))?;

    let mut tasks = Vec::with_capacity(cli.files.len());
    for path in &cli.files {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("read {}: {e}", path.display()))?;
        let kind = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        tasks.push(CompileTask::new(
            SourceCode::new(content),
            Arc::clone(&language),
            kind,
        ));
    }

    let client = LxdClient::new(LxdConfig::new(&config.socket_path));
    let pool = Arc::new(FleetPool::initialize(Arc::new(client), config).await?);
    let strays = pool.untracked_instances().await?;
    if !strays.is_empty() {
        tracing::warn!(?strays, "instances from an earlier run are still on the daemon");
    }

    let outcomes = if cli.parallel {
        let mut join_set = tokio::task::JoinSet::new();
        for task in tasks {
            let pool = Arc::clone(&pool);
            join_set.spawn(async move { pool.delegate(task).await });
        }
        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            outcomes.push(joined?);
        }
        outcomes
    } else {
        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(pool.delegate(task).await);
        }
        outcomes
    };

    let mut all_ok = true;
    for outcome in outcomes {
        match outcome {
            Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
            Err(e) => {
                all_ok = false;
                eprintln!("task failed: {e}");
            }
        }
    }

    pool.shutdown().await?;
    Ok(all_ok)
}
