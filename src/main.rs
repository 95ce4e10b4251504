mod action;
mod config;
mod dialect;
mod error;
mod event;
mod fingerprint;
mod frame;
mod listener;
mod policy;
mod session;
mod store;
mod stream;
mod tls;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};

use config::Config;
use listener::PolicyEngineFactory;
use store::{Bucket, FingerprintStore};

#[derive(Parser, Debug)]
#[command(name = "dbwarden", about = "Transparent database wire protocol firewall")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy: dialect-aware inspection between clients and the
    /// configured backend, enforcing the learned allow-list in protection
    /// mode.
    Serve {
        #[arg(long)]
        config: PathBuf,
    },
    /// Iterate and print the fingerprints stored in one bucket.
    Show {
        bucket: ShowBucket,
        #[arg(long)]
        db: PathBuf,
    },
    /// Delete a store file outright.
    Purge {
        #[arg(long)]
        db: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ShowBucket {
    Queries,
    Abnormal,
}

impl From<ShowBucket> for Bucket {
    fn from(b: ShowBucket) -> Self {
        match b {
            ShowBucket::Queries => Bucket::Queries,
            ShowBucket::Abnormal => Bucket::Abnormal,
        }
    }
}

/// Exit codes per `SPEC_FULL.md` §6/§7.
const EXIT_CONFIG_ERROR: i32 = 1;
const EXIT_BIND_FAILURE: i32 = 2;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Serve { config } => run_serve(config).await,
        Command::Show { bucket, db } => run_show(bucket.into(), db),
        Command::Purge { db } => run_purge(db),
    };

    std::process::exit(code);
}

fn init_logging(log_path: &str, log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match log_path {
        "stdout" => builder.init(),
        "stderr" => builder.with_writer(std::io::stderr).init(),
        path => {
            // Falls back to stdout if the file can't be opened; logging setup
            // itself must never be a startup-fatal error.
            match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => builder.with_writer(std::sync::Mutex::new(file)).init(),
                Err(e) => {
                    builder.init();
                    error!(path, error = %e, "failed to open log file, logging to stdout instead");
                }
            }
        }
    }
}

async fn run_serve(config_path: PathBuf) -> i32 {
    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };

    init_logging(&config.log_path, &config.log_level);
    info!(db_type = %config.db_type, learning = config.learning, "dbwarden starting");

    let tls_acceptor = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => match tls::load_acceptor(cert, key) {
            Ok(acceptor) => Some(acceptor),
            Err(e) => {
                error!(error = %e, "failed to load TLS certificate");
                return EXIT_CONFIG_ERROR;
            }
        },
        _ => None,
    };

    let store = match FingerprintStore::open(&config.store_path()) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "failed to open fingerprint store");
            return EXIT_CONFIG_ERROR;
        }
    };

    let training_tx = policy::spawn_training_writer(store.clone());

    let action: Option<Arc<dyn action::Action>> = if config.learning {
        None
    } else {
        match action::from_config_name(&config.action, config.action_email.clone()) {
            Ok(a) => Some(Arc::from(a)),
            Err(e) => {
                error!(error = %e, "invalid action configuration");
                return EXIT_CONFIG_ERROR;
            }
        }
    };

    let mode = if config.learning { policy::Mode::Learning } else { policy::Mode::Protecting };
    let policy_factory = Arc::new(PolicyEngineFactory { mode, store: store.clone(), training_tx, action });

    let config = Arc::new(config);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    match listener::serve(config, policy_factory, tls_acceptor, shutdown).await {
        Ok(()) => {
            info!("shutdown complete");
            0
        }
        Err(e) => {
            error!(error = %e, "failed to bind listener");
            EXIT_BIND_FAILURE
        }
    }
}

fn run_show(bucket: Bucket, db: PathBuf) -> i32 {
    let store = match FingerprintStore::open(&db) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("failed to open store: {e}");
            return EXIT_CONFIG_ERROR;
        }
    };

    for entry in store.iter(bucket) {
        match entry {
            Ok((fp, record)) => {
                println!(
                    "{} db={} user={} client_ip={} epoch={} query={:?}",
                    hex::encode(fp),
                    record.database,
                    record.username,
                    record.client_ip,
                    record.epoch_seconds,
                    record.query
                );
            }
            Err(e) => {
                eprintln!("error reading entry: {e}");
                return EXIT_CONFIG_ERROR;
            }
        }
    }
    0
}

fn run_purge(db: PathBuf) -> i32 {
    if let Err(e) = std::fs::remove_dir_all(&db) {
        eprintln!("failed to purge store {}: {e}", db.display());
        return EXIT_CONFIG_ERROR;
    }
    println!("purged {}", db.display());
    0
}
