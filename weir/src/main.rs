use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use weir_services::{http::handler::HandlerSet, server::HttpServiceBuilder};

use crate::config::Config;

mod config;
mod handlers;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path of the config file
    #[clap(short, long, value_parser)]
    config: Option<String>,

    /// Override the bind host
    #[clap(long)]
    host: Option<String>,

    /// Override the bind port
    #[clap(long)]
    port: Option<u16>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let mut builder = HttpServiceBuilder::new()
        .set_host(args.host.unwrap_or(config.server.host))
        .set_port(args.port.unwrap_or(config.server.port))
        .set_worker_thread_pool_size(config.runtime.worker_threads)
        .add_http_handlers([Arc::new(handlers::DemoEndpoints::new()) as Arc<dyn HandlerSet>]);
    if let Some(exec) = config.runtime.exec_threads {
        builder = builder.set_exec_thread_pool_size(exec);
    }
    if let Some(limit) = config.server.chunk_limit {
        builder = builder.set_http_chunk_limit(limit);
    }
    if let Some(secs) = config.server.keepalive_secs {
        builder = builder.set_keepalive_timeout(Some(Duration::from_secs(secs)));
    }

    let mut service = builder.build()?;
    service.start()?;
    info!(
        "serving {} routes on {}",
        service.route_count(),
        service.bind_addr()
    );
    service.join();
    Ok(())
}
