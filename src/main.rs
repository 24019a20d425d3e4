use std::{
    io::Write,
    path::PathBuf,
    time::Duration,
};

use ai_chat_proxy::{
    chat::ChatKind,
    client::{ChatClient, ClientConfig, Transcript},
    config::LoggingConfig,
    load_config, start_server,
};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// AI chat streaming proxy with multi-provider failover
#[derive(Parser, Debug)]
#[command(name = "ai-chat-proxy", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP proxy
    Serve {
        /// Configuration file (defaults to ./config.toml when present)
        #[arg(short, long, env = "AI_CHAT_CONFIG")]
        config: Option<PathBuf>,
        /// Override the listen host
        #[arg(long)]
        host: Option<String>,
        /// Override the listen port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Send one message to a running proxy and print the streamed answer
    Ask {
        message: String,
        #[arg(long, default_value = "http://127.0.0.1:8080/ai-chat")]
        endpoint: String,
        /// Bearer token forwarded to the proxy
        #[arg(long, env = "AI_CHAT_TOKEN")]
        token: Option<String>,
        /// Conversation flavour: chat, insights or verify
        #[arg(long, default_value = "chat")]
        kind: String,
        /// Overall request timeout in seconds
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },
}

/// 主函数 - AI聊天代理的入口点
///
/// `serve` 负责加载配置、初始化日志系统并启动HTTP服务器；
/// `ask` 作为终端客户端向运行中的代理发送一条消息
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { config, host, port } => serve(config, host, port).await,
        Command::Ask {
            message,
            endpoint,
            token,
            kind,
            timeout,
        } => ask(message, endpoint, token, &kind, timeout).await,
    }
}

async fn serve(path: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = load_config(path.as_deref())?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate().context("Invalid command line overrides")?;

    init_tracing(&config.logging)?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        environment = ?config.environment,
        "Configuration loaded successfully"
    );

    start_server(config).await?;
    Ok(())
}

async fn ask(
    message: String,
    endpoint: String,
    token: Option<String>,
    kind: &str,
    timeout: u64,
) -> Result<()> {
    init_tracing(&LoggingConfig {
        level: "warn".to_string(),
        format: "compact".to_string(),
    })?;

    let mut config = ClientConfig::new(endpoint)
        .with_kind(ChatKind::from_name(kind))
        .with_timeout(Duration::from_secs(timeout));
    if let Some(token) = token {
        config = config.with_bearer_token(token);
    }

    let client = ChatClient::new(config)?;
    let mut transcript = Transcript::new();
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let outcome = client
        .send(&mut transcript, &message, &cancel, |delta| {
            let _ = write!(stdout, "{}", delta);
            let _ = stdout.flush();
        })
        .await;
    println!();

    if let Err(e) = outcome {
        eprintln!("{}", e.user_message());
        return Err(e).context("Chat request failed");
    }
    Ok(())
}

/// 初始化结构化日志系统
///
/// `RUST_LOG` 优先；未设置时使用配置中的日志级别。
/// 日志写入 stderr，避免与 `ask` 的流式输出混在一起
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "ai_chat_proxy={level},tower_http={level}",
            level = logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);

    let result = match logging.format.as_str() {
        "json" => registry.with(layer.json()).try_init(),
        "pretty" => registry.with(layer.pretty()).try_init(),
        _ => registry.with(layer.compact()).try_init(),
    };
    result.context("Failed to initialize tracing")?;

    tracing::debug!("Structured logging system initialized");
    Ok(())
}
