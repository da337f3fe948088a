//! STUN 内网穿透模块
//!
//! 提供 STUN Binding 探测、最快服务器选择、
//! 本机/公网 IP 获取和 NAT 链路层级扫描

use std::time::Duration;

pub mod netinfo;
pub mod probe;
pub mod selector;
pub mod topology;

pub use probe::{probe_tcp, probe_udp, StunError};

/// 建立 TCP 连接的超时时间
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// 读取 STUN 响应的超时时间
pub const READ_TIMEOUT: Duration = Duration::from_secs(3);
