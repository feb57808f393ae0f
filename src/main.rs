use clap::Parser;
use pg_relay::{pipeline, Config, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-relay")]
#[command(about = "Streams the PostgreSQL WAL to Kafka, OpenSearch or webhook subscribers", long_about = None)]
#[command(version)]
struct Args {
    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("starting pg-relay v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            eprintln!("\nRequired environment variables:");
            eprintln!("  PG_DATABASE      - PostgreSQL database name");
            eprintln!("  PG_USERNAME      - PostgreSQL username");
            eprintln!("  PG_PASSWORD      - PostgreSQL password");
            eprintln!("  KAFKA_BROKERS    - Comma-separated list of Kafka brokers");
            eprintln!("                     (required for kafka listener/processor)");
            std::process::exit(1);
        }
    };

    let token = CancellationToken::new();
    let shutdown_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_token.cancel();
        }
    });

    match pipeline::run(config, token).await {
        Ok(()) => {
            info!("pg-relay stopped");
            Ok(())
        }
        Err(e) => {
            error!("pipeline failed: {e}");
            Err(e)
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_relay=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pg_relay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
