//! NAT 链路层级扫描
//!
//! 调用系统 tracert/traceroute 逐跳扫描出口链路，
//! 给每个非公网跳分配递增的 NAT 层级；
//! 遇到公网出口或 CGN 出口立即终止并杀掉外部进程

use anyhow::Result;
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::NatRouterInfo;

/// 扫描目标：一个固定可达的公网地址
pub const PROBE_TARGET: &str = "114.114.114.114";

/// IP 归类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpClass {
    /// RFC1918 私网
    Private,
    /// 运营商级 NAT (100.64.0.0/10)
    Cgn,
    /// 其余可路由地址
    Public,
}

/// 对 IPv4 地址做 private / cgn / public 三分类
///
/// 三类互斥且覆盖全部地址
pub fn classify_ip(ip: Ipv4Addr) -> IpClass {
    let octets = ip.octets();
    if octets[0] == 100 && (octets[1] & 0xC0) == 64 {
        IpClass::Cgn
    } else if ip.is_private() {
        IpClass::Private
    } else {
        IpClass::Public
    }
}

/// 逐行消费 traceroute 输出的扫描状态机
struct ChainScanner {
    target: String,
    chain: Vec<NatRouterInfo>,
    level: u32,
}

impl ChainScanner {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            chain: Vec::new(),
            level: 0,
        }
    }

    /// 消费一行输出；返回 false 表示扫描应当终止
    fn feed(&mut self, line: &str) -> bool {
        let Some(ip) = first_ipv4(line) else {
            return true;
        };
        // 跳过目标本身
        if ip.to_string() == self.target {
            return true;
        }

        match classify_ip(ip) {
            IpClass::Public => {
                info!("探测到公网出口: {}，终止扫描", ip);
                false
            }
            IpClass::Cgn => {
                self.level += 1;
                self.chain.push(NatRouterInfo {
                    nat_level: self.level,
                    lan_ip: ip.to_string(),
                });
                info!("探测到 CGN 出口: {}，终止扫描", ip);
                false
            }
            IpClass::Private => {
                self.level += 1;
                self.chain.push(NatRouterInfo {
                    nat_level: self.level,
                    lan_ip: ip.to_string(),
                });
                true
            }
        }
    }
}

/// 实时扫描网络层级，返回 NAT 路由链
pub async fn get_nat_router_list() -> Vec<NatRouterInfo> {
    let start = Instant::now();
    info!("实时扫描网络层级");

    let chain = match scan_nat_chain(PROBE_TARGET).await {
        Ok(chain) => chain,
        Err(e) => {
            // traceroute 不可用不阻塞启动
            warn!("NAT 链路扫描失败: {}", e);
            Vec::new()
        }
    };

    info!("扫描耗时 {:.1}s", start.elapsed().as_secs_f64());
    chain
}

/// 扫描 NAT 链路
async fn scan_nat_chain(target: &str) -> Result<Vec<NatRouterInfo>> {
    let mut child = build_traceroute_cmd(target)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow::anyhow!("启动 traceroute 失败: {}", e))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("获取 traceroute 输出管道失败"))?;
    let mut lines = BufReader::new(stdout).lines();

    let mut scanner = ChainScanner::new(target);
    while let Some(line) = lines.next_line().await? {
        if !scanner.feed(&line) {
            break;
        }
    }

    // 提前退出时不等满跳数预算，直接杀掉外部进程
    let _ = child.kill().await;
    let _ = child.wait().await;

    Ok(scanner.chain)
}

/// 构建 traceroute 命令
fn build_traceroute_cmd(target: &str) -> Command {
    if cfg!(target_os = "windows") {
        // -d 不解析主机名, -h 10 最大跳数, -w 300 超时300ms
        let mut cmd = Command::new("tracert");
        cmd.args(["-d", "-h", "10", "-w", "300", target]);
        cmd
    } else {
        // -n 不解析主机名, -m 10 最大跳数, -w 1 超时1秒, -q 1 每跳只测一次
        let mut cmd = Command::new("traceroute");
        cmd.args(["-n", "-m", "10", "-w", "1", "-q", "1", target]);
        cmd
    }
}

/// 提取一行输出中的第一个 IPv4 地址
fn first_ipv4(line: &str) -> Option<Ipv4Addr> {
    line.split_whitespace()
        .filter_map(|token| token.trim_matches(|c| c == '(' || c == ')').parse().ok())
        .next()
}
