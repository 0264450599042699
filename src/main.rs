use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use invokerd::{
    InvokerConfig, Service,
    feed::ChannelMessageSource,
    metrics,
    store::{MemoryActionStore, MemoryActivationSink, MemoryLogForwarder},
    tracing::setup_tracing,
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "config file", help = "Path to config file")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let cli = Cli::parse();

    let config = match InvokerConfig::from_path(cli.config.to_string_lossy().as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal configuration: {}", e);
            return 2;
        }
    };

    if let Err(e) = setup_tracing(&config) {
        eprintln!("fatal configuration: {}", e);
        return 2;
    }

    if let Err(e) = metrics::init_provider(&config.telemetry, &config.invoker_id) {
        eprintln!("fatal configuration: {}", e);
        return 2;
    }

    // The broker, metadata store, and sinks are deployment concerns; this
    // binary wires the in-process implementations.
    let (_work_tx, source) = ChannelMessageSource::new();
    let actions = Arc::new(MemoryActionStore::new());
    let results = Arc::new(MemoryActivationSink::new());
    let logs = Arc::new(MemoryLogForwarder::new());

    let service = match Service::new(config, source, actions, results, logs) {
        Ok(service) => service,
        Err(e) => {
            eprintln!("{}", e);
            return e.exit_code();
        }
    };

    match service.run().await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("{}", e);
            e.exit_code()
        }
    }
}
