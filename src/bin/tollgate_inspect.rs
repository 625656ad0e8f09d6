//! Read-only inspector for a live deployment: points at the shared Redis
//! store and prints what the schedulers and pipelines currently see.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tollgate::RedisStore;
use tollgate::stats::Stats;
use tollgate::store::SharedStore;

#[derive(Parser)]
#[command(name = "tollgate-inspect")]
#[command(about = "Read-only view of tollgate's shared scheduling state")]
#[command(version)]
struct Cli {
    /// Redis connection URL. Falls back to $TOLLGATE_REDIS_URL, then localhost.
    #[arg(long)]
    redis_url: Option<String>,

    /// Key prefix the gateway was configured with.
    #[arg(long, default_value = "llm")]
    prefix: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rolling latency/token statistics for one model key (provider/name).
    Stats {
        model: String,
        /// Samples kept per rolling list.
        #[arg(long, default_value_t = 200)]
        window: usize,
    },
    /// Pacer fronts and the trailing day-window count for one model key.
    Pacers { model: String },
    /// Active users and their queue depths for one model key.
    Queues { model: String },
    /// Current in-flight count for one model key.
    Inflight { model: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing()?;

    let url = cli
        .redis_url
        .or_else(|| std::env::var("TOLLGATE_REDIS_URL").ok())
        .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());
    let store = RedisStore::new(&url)?.with_prefix(cli.prefix);
    store.ping().await?;
    let store: Arc<dyn SharedStore> = Arc::new(store);

    match cli.command {
        Command::Stats { model, window } => {
            let stats = Stats::new(Arc::clone(&store), window);
            let aggregates = stats.model(&model).await?;
            println!("samples:        {}", aggregates.samples);
            match aggregates.mean_tokens {
                Some(mean) => println!("mean tokens:    {mean:.1}"),
                None => println!("mean tokens:    -"),
            }
            match aggregates.p95_latency_ms {
                Some(p95) => println!("p95 latency:    {p95} ms"),
                None => println!("p95 latency:    -"),
            }
        }
        Command::Pacers { model } => {
            let snapshot = store.pacer_snapshot(&model).await?;
            let now_ms = store.now_ms().await?;
            println!("now:            {now_ms}");
            println!(
                "next rpm start: {} ({})",
                snapshot.next_rpm_ms,
                lead(now_ms, snapshot.next_rpm_ms)
            );
            println!(
                "next tpm start: {} ({})",
                snapshot.next_tpm_ms,
                lead(now_ms, snapshot.next_tpm_ms)
            );
            println!("day window:     {} reservations", snapshot.day_count);
        }
        Command::Queues { model } => {
            let users = store.active_users(&model).await?;
            if users.is_empty() {
                println!("no active users");
            }
            for user in users {
                let depth = store.queue_depth(&model, &user).await?;
                println!("{user}: {depth} queued");
            }
        }
        Command::Inflight { model } => {
            let running = store.running_count(&model).await?;
            println!("in flight:      {running}");
        }
    }
    Ok(())
}

fn lead(now_ms: u64, at_ms: u64) -> String {
    if at_ms <= now_ms {
        "ready".to_string()
    } else {
        format!("+{} ms", at_ms - now_ms)
    }
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()?;
    Ok(())
}
