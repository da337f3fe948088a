//! STUN 隧道引擎
//!
//! 每个服务一条隧道，单次尝试的流程：
//! 端口复用拨号 STUN -> 握手取得公网映射 -> 在同一本地端口上监听 ->
//! 异步 UPnP 映射 -> 健康循环 + 接入循环并行跑，
//! 任何退出路径都关闭 socket、关闭监听器并派发 UPnP 删除。
//!
//! 端口复用是整个方案的根基：STUN 连接在外层 NAT 上打出的
//! publicPort -> localPort 映射，由绑在同一 localPort 上的监听器承接

pub mod forward;
pub mod health;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Service;
use crate::stun::netinfo::resolve_server;
use crate::stun::probe::{build_binding_request, decode_mapped_address, probe_tcp, probe_udp};
use crate::stun::{StunError, DIAL_TIMEOUT, READ_TIMEOUT};
use crate::upnp::{mapping_protocol, UpnpClient};

/// 等待 NAT 映射稳定后再做首次检查
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// 健康检查间隔
const HEALTH_TICK: Duration = Duration::from_secs(28);

/// 连续失败阈值
const FAILURE_THRESHOLD: u32 = 3;

/// UDP 转发会话的空闲回收时间
const UDP_SESSION_IDLE: Duration = Duration::from_secs(60);

/// 隧道单次尝试的失败原因
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("stun dial failed [{server}]: {reason}")]
    Dial { server: String, reason: String },

    #[error("stun handshake failed: {0}")]
    Handshake(#[from] StunError),

    #[error("listen on reused port failed: {0}")]
    Listen(io::Error),

    #[error("first keepalive failed")]
    FirstKeepaliveFailed,

    #[error("public port drift {expected} -> {observed}")]
    PortDrift { expected: u16, observed: u16 },

    #[error("stun reconnect failed: {0}")]
    StunReconnectFailed(String),

    #[error("listener closed: {0}")]
    ListenerClosed(io::Error),

    #[error("cancelled")]
    Cancelled,
}

/// 一次隧道尝试所需的环境
pub struct TunnelContext {
    /// 设备名 (仅用于日志)
    pub device_name: String,
    /// 内网目标设备 IP
    pub target_ip: String,
    /// 本机出口 IP (socket 绑定地址)
    pub local_ip: IpAddr,
    /// 最快的 STUN 服务器 "host:port"
    pub best_stun: String,
    /// 共享 UPnP 客户端
    pub upnp: Arc<UpnpClient>,
    /// 本隧道的取消信号
    pub cancel: CancellationToken,
}

/// 跑一次隧道尝试
///
/// 正常运行时不返回；只在尝试失败或被取消时带错误退出。
/// `startup_success` 在首次健康检查通过后置位，
/// 供监督器实现重试计数清零
pub async fn run_stun_tunnel(
    ctx: &TunnelContext,
    service: &Service,
    startup_success: &AtomicBool,
) -> Result<(), TunnelError> {
    // ssh/http/https 都是应用层协议，底层走 tcp
    let protocol = service.protocol.to_lowercase();
    if protocol == "udp" {
        udp_tunnel(ctx, service, startup_success).await
    } else {
        tcp_tunnel(ctx, service, startup_success).await
    }
}

/// 退出时兜底派发 UPnP 删除的守卫
///
/// 无论正常退出、取消还是 panic 展开都会触发
struct MappingGuard {
    upnp: Arc<UpnpClient>,
    external: u16,
    protocol: igd_next::PortMappingProtocol,
}

impl Drop for MappingGuard {
    fn drop(&mut self) {
        let upnp = self.upnp.clone();
        let external = self.external;
        let protocol = self.protocol;
        tokio::spawn(async move {
            upnp.delete_mapping(external, protocol).await;
        });
    }
}

/// 构造带 SO_REUSEADDR / SO_REUSEPORT 的 TCP socket 并绑定
fn reuse_tcp_socket(local: SocketAddr) -> io::Result<TcpSocket> {
    let socket = if local.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(local)?;
    Ok(socket)
}

/// 构造带端口复用的 UDP socket 并绑定
fn reuse_udp_socket(local: SocketAddr) -> io::Result<UdpSocket> {
    let domain = socket2::Domain::for_address(local);
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "freebsd"
    ))]
    socket.set_reuse_port(true)?;
    socket.bind(&local.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

/// 在指定本地地址上重用端口拨号 STUN 服务器
async fn dial_stun(local: SocketAddr, server_addr: SocketAddr) -> io::Result<TcpStream> {
    let socket = reuse_tcp_socket(local)?;
    timeout(DIAL_TIMEOUT, socket.connect(server_addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timeout"))?
}

/// 解析 best STUN 地址；未配置或解析失败都算拨号失败
async fn resolve_best_stun(best_stun: &str) -> Result<SocketAddr, TunnelError> {
    if best_stun.is_empty() {
        return Err(TunnelError::Dial {
            server: String::from("(unset)"),
            reason: String::from("no reachable stun server selected"),
        });
    }
    resolve_server(best_stun).await.map_err(|e| TunnelError::Dial {
        server: best_stun.to_string(),
        reason: e.to_string(),
    })
}

/// 按 tls 标志拼出对外公布的访问地址
fn public_url(tls: bool, public_ip: IpAddr, public_port: u16) -> String {
    if tls {
        format!("https://{}:{}", public_ip, public_port)
    } else {
        format!("http://{}:{}", public_ip, public_port)
    }
}

/// 异步派发 UPnP 映射 (尽力而为，失败不影响隧道)
///
/// UPnP 处理的是双层 NAT 里靠内的家用路由器一层，
/// 靠外的运营商层已经由 STUN 打通
fn spawn_upnp_mapping(ctx: &TunnelContext, service: &Service, local_port: u16) {
    let upnp = ctx.upnp.clone();
    let protocol = mapping_protocol(&service.protocol);
    let description = format!("LinkStar-{}", service.name);
    let name = service.name.clone();

    tokio::spawn(async move {
        match upnp
            .add_mapping(local_port, local_port, protocol, &description)
            .await
        {
            Ok(()) => info!(
                "[{}] UPnP 映射成功: 路由器 WAN:{} -> 本机:{}",
                name, local_port, local_port
            ),
            Err(e) => warn!("[{}] UPnP 映射失败 (非致命): {}", name, e),
        }
    });
}

// ============================================================================
// TCP 隧道
// ============================================================================

async fn tcp_tunnel(
    ctx: &TunnelContext,
    service: &Service,
    startup_success: &AtomicBool,
) -> Result<(), TunnelError> {
    let server_addr = resolve_best_stun(&ctx.best_stun).await?;

    // 1. STUN 拨号 (SO_REUSEPORT，本地端口由系统分配)
    let mut stun_conn = dial_stun(SocketAddr::new(ctx.local_ip, 0), server_addr)
        .await
        .map_err(|e| TunnelError::Dial {
            server: ctx.best_stun.clone(),
            reason: e.to_string(),
        })?;
    let local_port = stun_conn
        .local_addr()
        .map_err(|e| TunnelError::Dial {
            server: ctx.best_stun.clone(),
            reason: e.to_string(),
        })?
        .port();

    // 2. STUN 握手，拿到外层 NAT 分配的公网映射
    let (public_ip, public_port) = probe_tcp(&mut stun_conn).await?;

    // 3. 在同一个本地端口上监听，承接公网映射进来的流量
    let listener = reuse_tcp_socket(SocketAddr::new(ctx.local_ip, local_port))
        .and_then(|socket| socket.listen(1024))
        .map_err(TunnelError::Listen)?;

    // 4. UPnP 映射异步做，不阻塞隧道；退出守卫负责删除
    let _mapping_guard = MappingGuard {
        upnp: ctx.upnp.clone(),
        external: local_port,
        protocol: mapping_protocol(&service.protocol),
    };
    if service.use_upnp {
        spawn_upnp_mapping(ctx, service, local_port);
    }

    let url = public_url(service.tls, public_ip, public_port);
    info!(
        "[{} - {}] 本地端口 {} 公网映射 {}:{}",
        ctx.device_name, service.name, local_port, public_ip, public_port
    );
    info!("   访问地址: {}", url);

    let target_addr = format!("{}:{}", ctx.target_ip, service.internal_port);

    // 5+6. 健康循环和接入循环并行；谁先退出谁决定本次尝试的结局
    let result = tokio::select! {
        r = tcp_health_loop(
            stun_conn,
            ctx,
            server_addr,
            &service.protocol,
            &url,
            public_ip,
            public_port,
            local_port,
            startup_success,
        ) => r,
        r = accept_loop(&listener, &service.name, &target_addr) => r,
        _ = ctx.cancel.cancelled() => Err(TunnelError::Cancelled),
    };

    // 7. 清理：STUN socket 和监听器在此处释放，UPnP 删除由守卫派发
    info!("[{}] 正在清理资源...", service.name);
    result
}

/// TCP 健康循环
///
/// 每 28 秒做一次端到端检查；失败时退回 STUN 探测判断映射状态，
/// 必要时在原端口上原地重连
#[allow(clippy::too_many_arguments)]
async fn tcp_health_loop(
    mut conn: TcpStream,
    ctx: &TunnelContext,
    server_addr: SocketAddr,
    protocol: &str,
    url: &str,
    public_ip: IpAddr,
    expected_port: u16,
    local_port: u16,
    startup_success: &AtomicBool,
) -> Result<(), TunnelError> {
    // 首次保活：等 NAT 映射稳定后再检查
    sleep(SETTLE_DELAY).await;
    if !health::check_service(protocol, url, public_ip, expected_port).await {
        return Err(TunnelError::FirstKeepaliveFailed);
    }
    startup_success.store(true, Ordering::SeqCst);

    info!("启动 TCP 健康检查 间隔 28s");
    let mut consecutive_failures: u32 = 0;

    loop {
        sleep(HEALTH_TICK).await;

        // 策略1: 端到端服务检测
        if health::check_service(protocol, url, public_ip, expected_port).await {
            consecutive_failures = 0;
            continue;
        }
        consecutive_failures += 1;

        // 策略2: STUN 检测 NAT 映射
        match probe_tcp(&mut conn).await {
            Ok((_, port)) if port == expected_port => {
                // STUN 正常但服务持续失败，多半是上游服务的问题
                if consecutive_failures >= FAILURE_THRESHOLD {
                    warn!(
                        "STUN 端口正常但服务检查持续失败 (已失败 {} 次)，可能需要检查上游服务",
                        consecutive_failures
                    );
                }
            }
            Ok((_, port)) => {
                return Err(TunnelError::PortDrift {
                    expected: expected_port,
                    observed: port,
                });
            }
            Err(e) => {
                info!("STUN 连接断开 ({})，尝试原端口重连...", e);
                drop(conn);

                // 原地重连：绑回同一个 localPort，保住 NAT 映射
                let mut new_conn =
                    dial_stun(SocketAddr::new(ctx.local_ip, local_port), server_addr)
                        .await
                        .map_err(|e| TunnelError::StunReconnectFailed(e.to_string()))?;

                match probe_tcp(&mut new_conn).await {
                    Ok((_, new_port)) if new_port == expected_port => {
                        info!("STUN 重连成功，端口保持 {}", new_port);
                        conn = new_conn;
                    }
                    Ok((_, new_port)) => {
                        return Err(TunnelError::PortDrift {
                            expected: expected_port,
                            observed: new_port,
                        });
                    }
                    Err(e) => {
                        return Err(TunnelError::StunReconnectFailed(format!(
                            "handshake after redial failed: {}",
                            e
                        )));
                    }
                }
            }
        }
    }
}

/// 接入循环：每个外部连接交给一个转发任务
async fn accept_loop(
    listener: &TcpListener,
    service_name: &str,
    target_addr: &str,
) -> Result<(), TunnelError> {
    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                info!("[{}] 收到外部连接: {}", service_name, peer);
                tokio::spawn(forward::forward(conn, target_addr.to_string()));
            }
            Err(e) => return Err(TunnelError::ListenerClosed(e)),
        }
    }
}

// ============================================================================
// UDP 隧道
// ============================================================================

/// UDP 隧道
///
/// 留在手里的 STUN socket 同时就是数据通道：
/// 来自 STUN 服务器的包喂给保活逻辑，其余对端的包进转发会话
async fn udp_tunnel(
    ctx: &TunnelContext,
    service: &Service,
    startup_success: &AtomicBool,
) -> Result<(), TunnelError> {
    let server_addr = resolve_best_stun(&ctx.best_stun).await?;

    let socket = reuse_udp_socket(SocketAddr::new(ctx.local_ip, 0)).map_err(|e| {
        TunnelError::Dial {
            server: ctx.best_stun.clone(),
            reason: e.to_string(),
        }
    })?;
    let local_port = socket
        .local_addr()
        .map_err(|e| TunnelError::Dial {
            server: ctx.best_stun.clone(),
            reason: e.to_string(),
        })?
        .port();
    let socket = Arc::new(socket);

    let (public_ip, public_port) = probe_udp(&socket, server_addr).await?;

    let _mapping_guard = MappingGuard {
        upnp: ctx.upnp.clone(),
        external: local_port,
        protocol: mapping_protocol(&service.protocol),
    };
    if service.use_upnp {
        spawn_upnp_mapping(ctx, service, local_port);
    }

    info!(
        "[{} - {}] 本地端口 {} 公网 UDP 端点 {}:{}",
        ctx.device_name, service.name, local_port, public_ip, public_port
    );

    // UDP 没有端到端检查，首次 Binding 成功即视为启动成功
    startup_success.store(true, Ordering::SeqCst);

    let target_addr = format!("{}:{}", ctx.target_ip, service.internal_port);

    let result = udp_main_loop(
        ctx,
        socket,
        server_addr,
        public_port,
        local_port,
        &target_addr,
    )
    .await;

    info!("[{}] 正在清理资源...", service.name);
    result
}

/// UDP 主循环：保活探测与数据报转发共用一个 socket
async fn udp_main_loop(
    ctx: &TunnelContext,
    mut socket: Arc<UdpSocket>,
    server_addr: SocketAddr,
    expected_port: u16,
    local_port: u16,
    target_addr: &str,
) -> Result<(), TunnelError> {
    info!("启动 UDP 健康检查 间隔 28s");

    let mut sessions: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();
    let mut consecutive_failures: u32 = 0;
    let mut next_tick = Instant::now() + HEALTH_TICK;
    // 已发出 Binding 请求、尚未等到响应时的截止时刻
    let mut probe_deadline: Option<Instant> = None;
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let wakeup = match probe_deadline {
            Some(deadline) if deadline < next_tick => deadline,
            _ => next_tick,
        };

        tokio::select! {
            _ = ctx.cancel.cancelled() => return Err(TunnelError::Cancelled),

            _ = tokio::time::sleep_until(wakeup) => {
                let now = Instant::now();

                // 等待中的探测超时了
                if matches!(probe_deadline, Some(d) if now >= d) {
                    probe_deadline = None;
                    consecutive_failures += 1;
                    warn!(
                        "UDP STUN 检查失败 ({}/{})",
                        consecutive_failures, FAILURE_THRESHOLD
                    );

                    if consecutive_failures >= FAILURE_THRESHOLD {
                        info!("UDP 连接异常，原端口重建 socket...");
                        let rebuilt = reuse_udp_socket(SocketAddr::new(ctx.local_ip, local_port))
                            .map_err(|e| TunnelError::StunReconnectFailed(e.to_string()))?;
                        let rebuilt = Arc::new(rebuilt);

                        // 重建后必须验证公网端口没变，变了只能重新打洞
                        let (_, new_port) = probe_udp(&rebuilt, server_addr)
                            .await
                            .map_err(|e| TunnelError::StunReconnectFailed(e.to_string()))?;
                        if new_port != expected_port {
                            return Err(TunnelError::PortDrift {
                                expected: expected_port,
                                observed: new_port,
                            });
                        }

                        info!("UDP 重建成功，端口保持 {}", new_port);
                        // 旧 socket 绑的是同一端口，存量会话的回程不受影响
                        socket = rebuilt;
                        consecutive_failures = 0;
                    }
                }

                // 到点发下一轮 Binding 请求，响应在 recv 分支处理
                if now >= next_tick {
                    next_tick = now + HEALTH_TICK;
                    let request = build_binding_request()?;
                    match socket.send_to(&request, server_addr).await {
                        Ok(_) => probe_deadline = Some(Instant::now() + READ_TIMEOUT),
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(
                                "UDP 心跳发送失败 ({}/{}): {}",
                                consecutive_failures, FAILURE_THRESHOLD, e
                            );
                        }
                    }
                }
            }

            result = socket.recv_from(&mut buf) => {
                let (n, from) = result.map_err(TunnelError::ListenerClosed)?;

                if from == server_addr {
                    // STUN 服务器的响应：只在等待窗口内才算数
                    if probe_deadline.take().is_some() {
                        match decode_mapped_address(&buf[..n]) {
                            Ok((_, port)) if port == expected_port => {
                                consecutive_failures = 0;
                            }
                            Ok((_, port)) => {
                                return Err(TunnelError::PortDrift {
                                    expected: expected_port,
                                    observed: port,
                                });
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                warn!(
                                    "UDP STUN 响应异常 ({}/{}): {}",
                                    consecutive_failures, FAILURE_THRESHOLD, e
                                );
                            }
                        }
                    }
                    continue;
                }

                // 外部对端的数据报，进转发会话
                dispatch_datagram(
                    &mut sessions,
                    &socket,
                    from,
                    &buf[..n],
                    target_addr,
                );
            }
        }
    }
}

/// 把一个数据报投递到对应会话，必要时新建会话
fn dispatch_datagram(
    sessions: &mut HashMap<SocketAddr, mpsc::Sender<Vec<u8>>>,
    socket: &Arc<UdpSocket>,
    peer: SocketAddr,
    payload: &[u8],
    target_addr: &str,
) {
    if let Some(tx) = sessions.get(&peer) {
        if tx.try_send(payload.to_vec()).is_ok() {
            return;
        }
        // 会话已结束或积压，重建
        if !tx.is_closed() {
            debug!("UDP 会话积压，丢弃来自 {} 的数据报", peer);
            return;
        }
        sessions.remove(&peer);
    }

    debug!("收到外部 UDP 对端: {}", peer);
    let tx = spawn_udp_session(socket.clone(), peer, target_addr.to_string());
    let _ = tx.try_send(payload.to_vec());
    sessions.insert(peer, tx);
}

/// 为一个外部对端建立到内网目标的 UDP 会话
///
/// 上行走会话自己的 socket，下行通过主 socket 发回对端；
/// 空闲超时后会话自行结束
fn spawn_udp_session(
    main_socket: Arc<UdpSocket>,
    peer: SocketAddr,
    target_addr: String,
) -> mpsc::Sender<Vec<u8>> {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    tokio::spawn(async move {
        let upstream = match UdpSocket::bind("0.0.0.0:0").await {
            Ok(socket) => socket,
            Err(e) => {
                error!("创建 UDP 上行 socket 失败: {}", e);
                return;
            }
        };
        if let Err(e) = upstream.connect(&target_addr).await {
            error!("连接内网目标失败 [{}]: {}", target_addr, e);
            return;
        }

        let mut buf = vec![0u8; 64 * 1024];
        let idle = sleep(UDP_SESSION_IDLE);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(data) => {
                        if upstream.send(&data).await.is_err() {
                            break;
                        }
                        idle.as_mut().reset(Instant::now() + UDP_SESSION_IDLE);
                    }
                    None => break,
                },
                result = upstream.recv(&mut buf) => match result {
                    Ok(n) => {
                        if main_socket.send_to(&buf[..n], peer).await.is_err() {
                            break;
                        }
                        idle.as_mut().reset(Instant::now() + UDP_SESSION_IDLE);
                    }
                    Err(_) => break,
                },
                _ = &mut idle => break,
            }
        }
        debug!("UDP 会话结束: {}", peer);
    });

    tx
}
