//! 端到端健康检查
//!
//! 按服务协议选择检查方式：
//! ssh 读横幅，http/https 发 GET，其余做 TCP 连通性检查。
//! 检查对象是公网侧地址，验证的是整条穿透链路

use std::net::IpAddr;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// 单次检查的超时时间 (拨号 / 读取 / GET 共用)
const CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// 根据协议做一次端到端健康检查
pub async fn check_service(protocol: &str, public_url: &str, public_ip: IpAddr, public_port: u16) -> bool {
    match protocol.to_lowercase().as_str() {
        "ssh" => ssh_connect_check(public_ip, public_port).await,
        "http" | "https" => http_check_ok(public_url).await,
        // tcp/udp 等其他协议使用 TCP 连通性检查
        _ => tcp_connect_check(public_ip, public_port).await,
    }
}

/// 通过读取 SSH 横幅验证 SSH 服务可达性
async fn ssh_connect_check(host: IpAddr, port: u16) -> bool {
    let addr = format!("{}:{}", host, port);
    let mut conn = match timeout(CHECK_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(conn)) => conn,
        _ => {
            debug!("SSH 连接检查失败 {}", addr);
            return false;
        }
    };

    // 读取 SSH 横幅，例如 "SSH-2.0-OpenSSH_8.9"
    let mut buf = [0u8; 64];
    let n = match timeout(CHECK_TIMEOUT, conn.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => n,
        _ => {
            debug!("SSH 横幅读取失败 {}", addr);
            return false;
        }
    };

    let banner = String::from_utf8_lossy(&buf[..n]);
    if banner.starts_with("SSH-") {
        debug!("SSH 检查 OK {}, 横幅: {}", addr, banner.trim());
        true
    } else {
        debug!("SSH 检查 NOT OK {}, 收到: {}", addr, banner.trim());
        false
    }
}

/// HTTP 端到端检查
///
/// 跳过证书验证、不跟随重定向；只要拿到任何状态码就算穿透成功
/// (即使 404 也说明 L4 已经通了)
async fn http_check_ok(url: &str) -> bool {
    let client = match reqwest::Client::builder()
        .timeout(CHECK_TIMEOUT)
        .danger_accept_invalid_certs(true)
        .redirect(reqwest::redirect::Policy::none())
        .build()
    {
        Ok(client) => client,
        Err(_) => return false,
    };

    match client.get(url).send().await {
        Ok(resp) => {
            debug!("HTTP 端到端检查 OK {} ({})", url, resp.status());
            true
        }
        Err(_) => {
            debug!("HTTP 端到端检查 NOT OK {}", url);
            false
        }
    }
}

/// 通用 TCP 连通性检查
async fn tcp_connect_check(host: IpAddr, port: u16) -> bool {
    let addr = format!("{}:{}", host, port);
    match timeout(CHECK_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(_conn)) => {
            debug!("TCP 连接检查 OK {}", addr);
            true
        }
        _ => {
            debug!("TCP 连接检查失败 {}", addr);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    /// 起一个 accept 后立刻写入固定横幅的监听器
    async fn spawn_banner_server(banner: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                let _ = conn.write_all(banner).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_ssh_banner_accepted() {
        let port = spawn_banner_server(b"SSH-2.0-OpenSSH_8.9\r\n").await;
        assert!(check_service("ssh", "", LOCALHOST, port).await);
    }

    #[tokio::test]
    async fn test_non_ssh_banner_rejected() {
        let port = spawn_banner_server(b"220 smtp ready\r\n").await;
        assert!(!check_service("SSH", "", LOCALHOST, port).await);
    }

    #[tokio::test]
    async fn test_tcp_connect_check() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        assert!(check_service("tcp", "", LOCALHOST, port).await);
        // 协议未知时同样退回 TCP 检查
        assert!(check_service("", "", LOCALHOST, port).await);
    }

    #[tokio::test]
    async fn test_tcp_connect_check_refused() {
        // 绑定后立刻释放拿一个大概率空闲的端口
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!check_service("tcp", "", LOCALHOST, port).await);
    }

    #[tokio::test]
    async fn test_http_404_counts_as_success() {
        let port =
            spawn_banner_server(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n").await;
        let url = format!("http://127.0.0.1:{}", port);
        assert!(check_service("http", &url, LOCALHOST, port).await);
    }

    #[tokio::test]
    async fn test_http_unreachable_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let url = format!("http://127.0.0.1:{}", port);
        assert!(!check_service("http", &url, LOCALHOST, port).await);
    }
}
