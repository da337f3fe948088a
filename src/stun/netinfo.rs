//! 本机 / 公网网络信息
//!
//! 本机内网 IP 通过一次不发包的 UDP connect 推断；
//! 真实公网 IP 通过 best STUN 服务器的 Binding 响应获得

use anyhow::{Context, Result};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::probe::probe_tcp;
use super::READ_TIMEOUT;

/// 获取本机内网 IP
///
/// connect 一个公网地址但不真正发包，从路由选择结果读出本端地址
pub fn get_local_ip() -> Result<IpAddr> {
    let socket = UdpSocket::bind("0.0.0.0:0").context("绑定 UDP socket 失败")?;
    socket
        .connect("8.8.8.8:80")
        .context("选择出口路由失败")?;
    let addr = socket.local_addr().context("读取本端地址失败")?;
    Ok(addr.ip())
}

/// 通过 STUN 服务器获取真实公网 IP
pub async fn get_public_ip(best_stun: &str) -> Result<IpAddr> {
    let mut conn = timeout(READ_TIMEOUT, TcpStream::connect(best_stun))
        .await
        .map_err(|_| anyhow::anyhow!("连接 STUN 服务器超时: {}", best_stun))?
        .with_context(|| format!("连接 STUN 服务器失败: {}", best_stun))?;

    let (ip, _port) = probe_tcp(&mut conn).await.context("STUN 握手失败")?;
    Ok(ip)
}

/// 解析 "host:port" 形式的 STUN 服务器地址，优先 IPv4
pub async fn resolve_server(server: &str) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("解析 STUN 服务器地址失败: {}", server))?
        .collect();

    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| anyhow::anyhow!("地址无解析结果: {}", server))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_literal_addr() {
        let addr = resolve_server("203.0.113.7:3478").await.unwrap();
        assert_eq!(addr, "203.0.113.7:3478".parse().unwrap());
    }

    #[tokio::test]
    async fn test_resolve_prefers_ipv4() {
        let addr = resolve_server("localhost:3478").await.unwrap();
        assert!(addr.is_ipv4() || addr.is_ipv6());
        assert_eq!(addr.port(), 3478);
    }

    #[test]
    fn test_local_ip_is_not_unspecified() {
        if let Ok(ip) = get_local_ip() {
            assert!(!ip.is_unspecified());
        }
    }
}
