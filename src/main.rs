use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;

use mirrorpoint_agent::{agent, supervisor, worker};

#[derive(Parser)]
#[command(name = "mirrorpoint-agent", version, about = "Mirrorpoint on-premise sync agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the agent: a supervisor that owns and watches the worker process.
    Run,
    /// The worker process. Spawned by the supervisor; stdout is reserved for
    /// liveness pings.
    #[command(hide = true)]
    Worker,
    /// One large-table export run. Spawned by the sync engine with a JSON
    /// job spec on stdin.
    #[command(hide = true)]
    BigTable,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Cmd::Run) {
        Cmd::Run => {
            init_tracing(false);
            supervisor::run().await
        }
        Cmd::Worker => {
            init_tracing(true);
            agent::run_worker().await?;
            Ok(())
        }
        Cmd::BigTable => {
            init_tracing(true);
            let mut raw = String::new();
            tokio::io::stdin().read_to_string(&mut raw).await?;
            let job: worker::BigTableJob = serde_json::from_str(&raw)?;
            worker::run_big_table(job).await?;
            Ok(())
        }
    }
}

/// Worker processes log to stderr so stdout stays a clean liveness pipe.
fn init_tracing(to_stderr: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if to_stderr {
        builder.with_writer(std::io::stderr).init();
    } else {
        builder.init();
    }
}
