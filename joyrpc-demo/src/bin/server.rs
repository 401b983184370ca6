use clap::Parser;
use joyrpc::{
    Exporter, ExporterConfig, HealthProbe, MemoryRegistry, PluginRegistry, Shutdown,
    ShutdownConfig, Url,
};
use joyrpc_demo::{INTERFACE, demo_service};
use std::{sync::Arc, time::Duration};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:22000")]
    pub addr: std::net::SocketAddr,

    /// Service alias.
    #[arg(long, default_value = "demo")]
    pub alias: String,
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let registry = Arc::new(MemoryRegistry::new());
    let shutdown = Arc::new(Shutdown::new(ShutdownConfig::default()));
    let plugins = PluginRegistry::with_builtins();

    let url = Url::parse(&format!(
        "joyrpc://{}/{INTERFACE}?alias={}",
        args.addr, args.alias
    ))
    .unwrap();
    let exporter = Exporter::new(
        url,
        ExporterConfig::default(),
        vec![demo_service()],
        registry,
        shutdown.clone(),
        &plugins,
    )
    .unwrap();

    let addr = exporter.open().await.unwrap();
    tracing::info!("serving {INTERFACE} on {addr}...");

    let probe = HealthProbe::create(Duration::from_secs(5));
    probe.register(exporter.doctor());

    tokio::signal::ctrl_c().await.unwrap();
    tracing::info!("health at exit: {:?}", probe.state());
    shutdown.shutdown().await;
    probe.stop();
}
