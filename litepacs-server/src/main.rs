//! LitePACS服务器主程序

use clap::Parser;
use litepacs_core::config::ServerConfig;
use litepacs_engine::ServerContext;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// LitePACS服务器命令行参数
#[derive(Parser, Debug)]
#[command(name = "litepacs-server")]
#[command(about = "LitePACS 轻量级医学影像存储服务器")]
struct Args {
    /// 配置文件路径
    #[arg(short, long)]
    config: Option<String>,

    /// HTTP监听端口
    #[arg(short, long)]
    port: Option<u16>,

    /// 索引数据库路径
    #[arg(short, long)]
    database: Option<String>,

    /// 附件存储目录
    #[arg(short, long)]
    storage: Option<String>,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.http.port = port;
    }
    if let Some(database) = args.database {
        config.store.database_path = database;
    }
    if let Some(storage) = args.storage {
        config.store.storage_path = storage;
    }

    // 初始化日志
    let filter = config
        .log_filter
        .clone()
        .unwrap_or_else(|| args.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    info!("Starting LitePACS server");
    info!("  database: {}", config.store.database_path);
    info!("  storage:  {}", config.store.storage_path);
    info!("  http:     {}:{}", config.http.host, config.http.port);

    let context = ServerContext::new(config.store.clone()).await?;

    // 启动时回收入库失败窗口留下的孤儿附件
    let removed = context.reclaim_orphans().await?;
    if removed > 0 {
        info!("Startup sweep removed {} orphan attachments", removed);
    }

    tokio::select! {
        result = litepacs_web::serve(context.clone(), &config.http) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    context.shutdown().await?;
    info!("LitePACS server stopped");
    Ok(())
}
