//! linkstar - 自托管 NAT 穿透守护进程
//!
//! 主入口程序

use anyhow::Result;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

use linkstar::api::{self, AppState};
use linkstar::config::{self, SharedConfig};
use linkstar::manager::ServiceManager;
use linkstar::stun::{netinfo, selector, topology};
use linkstar::upnp::UpnpClient;

/// linkstar - 命令行参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 管理 API 监听地址
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// 日志级别 (0=warn, 1=info, 2=debug, 3=trace)
    #[arg(short, long)]
    verbose: Option<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose.unwrap_or(1));

    info!("LinkStar Run");

    // 读取配置 (不存在则创建)；启动期的配置错误直接退出
    let mut stun_config = config::read_stun_config()?;
    stun_config.stun_server_list = config::init_stun_servers();

    // 本机出口 IP
    match netinfo::get_local_ip() {
        Ok(ip) => stun_config.local_ip = ip.to_string(),
        Err(e) => warn!("获取本机IP失败: {}", e),
    }

    // 选出最快的 STUN 服务器
    match selector::get_fast_stun_server(&stun_config.stun_server_list).await {
        Some(server) => stun_config.best_stun = server,
        None => warn!("所有 STUN 服务器均不可达，隧道启动将进入重试"),
    }

    // 真实公网 IP
    if !stun_config.best_stun.is_empty() {
        match netinfo::get_public_ip(&stun_config.best_stun).await {
            Ok(ip) => stun_config.public_ip = ip.to_string(),
            Err(e) => warn!("获取真实公网IP失败: {}", e),
        }
    }

    // NAT 链路层级
    stun_config.nat_router_list = topology::get_nat_router_list().await;

    let local_ip: IpAddr = stun_config
        .local_ip
        .parse()
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED));

    let config = SharedConfig::new(stun_config);
    config.flush().await?;

    // UPnP 网关只在启动时发现一次，全程共享；保活循环随进程退出停止
    let upnp = Arc::new(UpnpClient::discover(local_ip).await);
    let shutdown = CancellationToken::new();
    tokio::spawn(upnp.clone().run_keepalive(shutdown.clone()));

    // 启动全部已启用服务
    let manager = ServiceManager::new(config.clone(), upnp.clone());
    manager.start_all_services().await;

    // 管理 API
    let state = AppState {
        config: config.clone(),
        manager: manager.clone(),
    };
    let listen = args.listen;
    tokio::spawn(async move {
        if let Err(e) = api::serve(state, listen).await {
            error!("管理 API 退出: {}", e);
        }
    });

    // 等待退出信号，最后一次落盘
    wait_for_shutdown().await;
    shutdown.cancel();
    if let Err(e) = config.flush().await {
        error!("退出前保存配置失败: {}", e);
    }
    info!("配置已保存，程序退出");
    Ok(())
}

/// 初始化日志
fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_max_level(level)
        .init();
}

/// 阻塞到 SIGINT / SIGTERM
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("收到退出信号: SIGINT，正在保存配置..."),
                    _ = sigterm.recv() => info!("收到退出信号: SIGTERM，正在保存配置..."),
                }
            }
            Err(e) => {
                error!("无法监听 SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("收到退出信号，正在保存配置...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听 Ctrl+C 信号: {}", e);
            std::future::pending::<()>().await;
        }
        info!("收到退出信号，正在保存配置...");
    }
}
