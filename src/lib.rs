//! linkstar - 自托管 NAT 穿透守护进程库
//!
//! 通过 STUN 打洞 + UPnP 端口映射把内网服务暴露到公网，
//! 并持续保活 NAT 映射、检测端口漂移

pub mod api;
pub mod config;
pub mod manager;
pub mod stun;
pub mod tunnel;
pub mod upnp;
