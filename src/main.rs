use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use culvert::Hub;

#[derive(Parser)]
#[clap(name = "culvert")]
#[clap(about = "A rendezvous tunnel broker for NAT traversal", long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// ハブモード: 公開ランデブーポイントとして両端を仲介
    Hub {
        /// バインドアドレス (例: 0.0.0.0:8080)
        #[clap(default_value = "0.0.0.0:8080")]
        bind_addr: String,
    },

    /// 公開モード: ローカルサービスをトンネル経由で公開
    Expose {
        /// トンネルID（両端で共有する合言葉）
        tunnel_id: String,

        /// ハブのURL (例: ws://hub.example.com:8080)
        #[clap(long)]
        hub: String,

        /// 公開するローカルサービスのアドレス
        #[clap(long, default_value = "127.0.0.1:8080")]
        local: String,

        /// ハブに提示するベアラートークン
        #[clap(long, default_value = "")]
        token: String,
    },

    /// 接続モード: ローカルポートをリモートのトンネルへ転送
    Connect {
        /// トンネルID（両端で共有する合言葉）
        tunnel_id: String,

        /// ハブのURL (例: ws://hub.example.com:8080)
        #[clap(long)]
        hub: String,

        /// 待ち受けるローカルアドレス
        #[clap(long, default_value = "127.0.0.1:9090")]
        listen: String,

        /// ハブに提示するベアラートークン
        #[clap(long, default_value = "")]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // ロギング設定
    let is_atty = atty::is(atty::Stream::Stdout);
    let level = "info";
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_ansi(is_atty)
        .init();

    let cli = Cli::parse();

    // Ctrl+Cハンドラー
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            panic!("Failed to listen for ctrl-c signal: {:?}", e);
        }
        let _ = shutdown_tx.send(());
    });

    match cli.command {
        Commands::Hub { bind_addr } => {
            let hub = Hub::bind(&bind_addr).await?;
            hub.serve(shutdown_rx).await?;
        }
        Commands::Expose {
            tunnel_id,
            hub,
            local,
            token,
        } => {
            let tunnel = culvert::expose(hub, token, tunnel_id, local).await?;
            println!("Exposing local service through tunnel {}", tunnel.tunnel_id());
            println!("Press Ctrl+C to stop...");

            // シャットダウン待機
            let mut rx = shutdown_rx;
            let _ = rx.recv().await;

            println!("Shutting down...");
            tunnel.shutdown().await?;
        }
        Commands::Connect {
            tunnel_id,
            hub,
            listen,
            token,
        } => {
            let tunnel = culvert::connect(hub, token, tunnel_id, listen).await?;
            println!("Forwarding local connections through tunnel {}", tunnel.tunnel_id());
            println!("Press Ctrl+C to stop...");

            // シャットダウン待機
            let mut rx = shutdown_rx;
            let _ = rx.recv().await;

            println!("Shutting down...");
            tunnel.shutdown().await?;
        }
    }

    Ok(())
}
