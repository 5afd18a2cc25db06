mod app;
mod core;
mod utils;
mod workers;

use crate::utils::log_file::FileLogLayer;
use crate::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workers::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();

    // Resolve the data directory before anything touches storage or logs
    let data_root = crate::utils::data_dir::init(args.conf.as_deref())?;

    let filter = match args.verbose {
        0 => "warn,lockstep=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter_layer = EnvFilter::new(filter);
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // File logging layer - saves full logs under the data directory
    let log_path = crate::utils::data_dir::logs_dir(data_root).join("lockstep.log");
    let file_layer = FileLogLayer::new(&log_path)?;

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    app::run(args, data_root, sos).await
}
