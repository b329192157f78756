use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use runlines::history::{PracticeRecorder, SqlitePracticeLog};
use runlines::script::{DirectoryScriptSource, MemoryScriptSource, ScriptSource};
use runlines::{Config, Engine, EngineSettings, server, speech};

#[derive(Parser, Debug)]
#[command(name = "runlines")]
#[command(about = "Live line-rehearsal server")]
struct Args {
    /// Path to config.toml
    #[arg(short, long, env = "RUNLINES_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long, env = "RUNLINES_BIND")]
    bind: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let renderer = speech::from_config(&config.speech)?;
    info!(renderer = renderer.name(), "Speech renderer ready");

    let scripts: Arc<dyn ScriptSource> = match config.scripts.dir_path() {
        Some(dir) => {
            info!(dir = %dir.display(), "Loading scripts from directory");
            Arc::new(DirectoryScriptSource::new(dir))
        }
        None => {
            warn!("No scripts.dir configured, every start request will fail");
            Arc::new(MemoryScriptSource::new())
        }
    };

    let db_path = config.history.resolved_path();
    if db_path != ":memory:" {
        if let Some(parent) = PathBuf::from(&db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
    }
    let recorder: Arc<dyn PracticeRecorder> = Arc::new(SqlitePracticeLog::open(&db_path)?);

    let engine = Arc::new(Engine::new(
        scripts,
        renderer,
        recorder,
        EngineSettings::from_config(&config.rehearsal),
    ));

    let cancel = CancellationToken::new();
    let reaper = engine.spawn_reaper(config.rehearsal.sweep_interval(), cancel.clone());

    let listener = TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
        }
        shutdown.cancel();
    });

    server::serve(listener, engine, cancel).await?;
    let _ = reaper.await;
    Ok(())
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("runlines=info,tower_http=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
