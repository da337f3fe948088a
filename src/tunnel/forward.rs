//! 双向数据转发
//!
//! 把一条已接受的外部连接接到内网目标上，
//! 任意一个方向结束即关闭两端

use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error};

/// 连接内网目标的超时时间
const TARGET_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// 双向复制
///
/// 拨号失败时关闭外部连接并记录目标错误
/// (这是内网 IP 配错时最常见的症状)
pub async fn forward(mut src: TcpStream, target_addr: String) {
    let mut dst = match timeout(TARGET_DIAL_TIMEOUT, TcpStream::connect(&target_addr)).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            error!("连接内网目标失败 [{}]: {}", target_addr, e);
            return;
        }
        Err(_) => {
            error!("连接内网目标超时 [{}]", target_addr);
            return;
        }
    };

    let (mut src_read, mut src_write) = src.split();
    let (mut dst_read, mut dst_write) = dst.split();

    // 任一方向终止就退出，两条连接随之关闭
    tokio::select! {
        result = tokio::io::copy(&mut src_read, &mut dst_write) => {
            if let Ok(n) = result {
                debug!("外部 -> 内网 转发结束 ({} 字节)", n);
            }
        }
        result = tokio::io::copy(&mut dst_read, &mut src_write) => {
            if let Ok(n) = result {
                debug!("内网 -> 外部 转发结束 ({} 字节)", n);
            }
        }
    }
}
