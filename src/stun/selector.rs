//! 最快 STUN 服务器选择
//!
//! 对候选列表逐个并发测速：TCP 拨号 + 一次 Binding 往返，
//! 取延迟最低的可达服务器

use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info};

use super::probe::build_binding_request;
use super::{DIAL_TIMEOUT, READ_TIMEOUT};

/// 获取当前网络最快的 STUN 服务器
///
/// 所有候选都不可达时返回 `None`，守护进程继续运行，
/// 依赖 STUN 的隧道会在启动时失败并进入重试
pub async fn get_fast_stun_server(servers: &[String]) -> Option<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Duration)>();

    let mut probes = 0;
    for server in servers {
        let server = server.clone();
        let tx = tx.clone();
        probes += 1;

        tokio::spawn(async move {
            match probe_latency(&server).await {
                Ok(delay) => {
                    debug!("{} - {}ms", server, delay.as_millis());
                    let _ = tx.send((server, delay));
                }
                Err(e) => {
                    debug!("{} - 测速失败: {}", server, e);
                }
            }
        });
    }
    drop(tx);

    if probes == 0 {
        return None;
    }

    // 等所有探测结束 (失败的直接丢弃)，找最快的服务器
    let mut best: Option<(String, Duration)> = None;
    while let Some((server, delay)) = rx.recv().await {
        match &best {
            Some((_, best_delay)) if *best_delay <= delay => {}
            _ => best = Some((server, delay)),
        }
    }

    match best {
        Some((server, delay)) => {
            info!("最快 STUN 服务器: {} ({}ms)", server, delay.as_millis());
            Some(server)
        }
        None => None,
    }
}

/// 对单个服务器做一次拨号 + Binding 往返测速
async fn probe_latency(server: &str) -> anyhow::Result<Duration> {
    let start = Instant::now();

    let mut conn = timeout(DIAL_TIMEOUT, TcpStream::connect(server))
        .await
        .map_err(|_| anyhow::anyhow!("建立 TCP 连接超时"))??;

    let request = build_binding_request()?;
    conn.write_all(&request).await?;

    let mut buf = [0u8; 1024];
    let n = timeout(READ_TIMEOUT, conn.read(&mut buf))
        .await
        .map_err(|_| anyhow::anyhow!("读取响应超时"))??;
    if n == 0 {
        anyhow::bail!("连接被对端关闭");
    }

    Ok(start.elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// 起一个本地假 STUN 服务器：收到请求后原样回一条 Binding 消息
    async fn spawn_stub_server(delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = conn.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    // 响应内容不重要，测速只看往返时间
                    let reply = build_binding_request().unwrap();
                    let _ = conn.write_all(&reply).await;
                });
            }
        });

        addr.to_string()
    }

    #[tokio::test]
    async fn test_picks_fastest_server() {
        let fast = spawn_stub_server(Duration::from_millis(10)).await;
        let slow = spawn_stub_server(Duration::from_millis(400)).await;

        let servers = vec![slow.clone(), fast.clone()];
        let best = get_fast_stun_server(&servers).await;
        assert_eq!(best, Some(fast));
    }

    #[tokio::test]
    async fn test_all_unreachable_returns_none() {
        // 保留地址段，拨号必然超时/拒绝
        let servers = vec!["192.0.2.1:3478".to_string(), "192.0.2.2:3478".to_string()];
        let best = get_fast_stun_server(&servers).await;
        assert_eq!(best, None);
    }

    #[tokio::test]
    async fn test_empty_candidate_list() {
        assert_eq!(get_fast_stun_server(&[]).await, None);
    }
}
