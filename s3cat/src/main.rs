use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use s3cat::download::{self, Manager, Url};
use s3cat::Stats;

#[derive(Parser, Debug)]
#[command(name = "s3cat")]
#[command(about = "Stream a remote object to the standard output, fetching it in parallel byte ranges")]
struct Args {
    /// Object location, either `s3://bucket/key` or `http(s)://...`
    url: String,

    /// Size of each ranged request, in bytes
    #[arg(long, env = "S3CAT_PART_SIZE", default_value_t = download::DEFAULT_PART_SIZE)]
    part_size: u64,

    /// Number of ranged requests in flight
    #[arg(long, env = "S3CAT_CONCURRENCY", default_value_t = download::DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Number of parts that may be requested ahead of the output, twice the concurrency by default
    #[arg(long, env = "S3CAT_LOOKAHEAD")]
    lookahead: Option<usize>,

    /// S3-compatible endpoint to resolve `s3://` locations against, using path-style URLs
    #[arg(long, env = "S3CAT_ENDPOINT")]
    endpoint: Option<Url>,

    /// Log level
    #[arg(long, env = "S3CAT_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // standard output only carries object bytes
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .with_writer(io::stderr)
        .without_time()
        .init();

    match run(args).await {
        Ok(stats) => {
            tracing::info!(
                "Streamed {} bytes, holding up to {} bytes out of order",
                stats.flushed,
                stats.peak_pending_bytes
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<Stats, download::Error> {
    let url = download::resolve_url(&args.url, args.endpoint.as_ref())?;

    let mut manager = Manager::new().with_part_size(args.part_size).with_concurrency(args.concurrency);

    if let Some(lookahead) = args.lookahead {
        manager = manager.with_lookahead(lookahead);
    }

    tracing::info!("Streaming `{url}` to stdout");

    manager.cat(&url, io::BufWriter::new(io::stdout())).await
}
