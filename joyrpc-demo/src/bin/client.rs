use clap::Parser;
use joyrpc::{
    ChannelManager, ManagerConfig, MemoryRegistry, PluginRegistry, Refer, ReferConfig, Registry,
    Shutdown, ShutdownConfig, Url,
};
use joyrpc_demo::{GreetReply, GreetRequest, INTERFACE};
use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Provider address.
    #[arg(default_value = "127.0.0.1:22000")]
    pub addr: std::net::SocketAddr,

    /// Service alias.
    #[arg(long, default_value = "demo")]
    pub alias: String,

    /// Request value.
    #[arg(short, long, default_value = "alice")]
    pub value: String,

    /// Payload serialization.
    #[arg(long, default_value = "msgpack")]
    pub serialization: String,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of concurrent callers.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

#[derive(Default)]
struct Stats {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn build_refer(args: &Args) -> Arc<Refer> {
    let registry = Arc::new(MemoryRegistry::new());
    let shutdown = Arc::new(Shutdown::new(ShutdownConfig::default()));
    let plugins = PluginRegistry::with_builtins();
    let manager = ChannelManager::create(ManagerConfig::default());

    // static discovery: advertise the provider address locally.
    let provider = Url::parse(&format!(
        "joyrpc://{}/{INTERFACE}?alias={}",
        args.addr, args.alias
    ))
    .unwrap();
    registry.register(&provider).await.unwrap();

    let consumer = Url::parse(&format!(
        "joyrpc://0.0.0.0:0/{INTERFACE}?alias={}",
        args.alias
    ))
    .unwrap();
    let refer = Refer::new(
        &consumer,
        ReferConfig {
            timeout: Duration::from_secs(5),
            serialization: args.serialization.clone(),
            ..ReferConfig::default()
        },
        registry,
        manager,
        shutdown,
        &plugins,
    )
    .unwrap();
    refer.open().await.unwrap();
    refer
}

async fn stress_test(args: Args) {
    let stats = Arc::new(Stats::default());
    let refer = build_refer(&args).await;
    let start_time = tokio::time::Instant::now();

    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let value = args.value.clone();
        let stats = stats.clone();
        let refer = refer.clone();
        let secs = args.secs;
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < secs {
                for _ in 0..256 {
                    let result = refer.invoke::<String, String>("echo", &value).await;
                    stats.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        stats.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }));
    }

    tokio::select! {
        () = async {
            for task in tasks {
                task.await.unwrap();
            }
        } => {}
        () = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = stats.total.swap(0, Ordering::AcqRel);
                let fails = stats.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {}
    }
}

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    if args.stress {
        stress_test(args).await;
    } else {
        let refer = build_refer(&args).await;

        let rsp = refer.invoke::<String, String>("echo", &args.value).await;
        tracing::info!("echo rsp: {rsp:?}");

        let rsp = refer
            .invoke::<GreetRequest, GreetReply>(
                "greet",
                &GreetRequest {
                    name: args.value.clone(),
                },
            )
            .await;
        tracing::info!("greet rsp: {rsp:?}");

        refer.close().await;
    }
}
