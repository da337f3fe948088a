//! UPnP IGD 端口映射模块
//!
//! 启动时发现一次网关并全程共享；
//! 添加映射前先删除同号旧映射避免 ConflictInMappingEntry (718)，
//! 添加成功后回读端口映射表校验；
//! 所有 UPnP 操作对隧道都是非致命的

use anyhow::{anyhow, Result};
use igd_next::aio::tokio::{search_gateway, Tokio};
use igd_next::aio::Gateway;
use igd_next::{PortMappingProtocol, SearchOptions};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 网关发现超时
const SEARCH_TIMEOUT: Duration = Duration::from_secs(5);

/// 单次 UPnP RPC 的等待上限
const UPNP_OP_TIMEOUT: Duration = Duration::from_secs(10);

/// 映射保活刷新周期
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(300);

/// 回读映射表时扫描的最大条目数
const MAPPING_TABLE_SCAN_LIMIT: u32 = 64;

type IgdGateway = Gateway<Tokio>;

/// 一条由本进程维护的端口映射
#[derive(Debug, Clone)]
struct MappingSpec {
    external: u16,
    internal: u16,
    protocol: PortMappingProtocol,
    description: String,
}

/// 本进程持有的映射表 (保活循环的刷新依据)
#[derive(Default)]
struct MappingTable {
    entries: Vec<MappingSpec>,
}

impl MappingTable {
    /// 登记一条映射；同 (外部端口, 协议) 的旧条目被替换
    fn upsert(&mut self, spec: MappingSpec) {
        self.entries.retain(|m| {
            !(m.external == spec.external && protocol_label(m.protocol) == protocol_label(spec.protocol))
        });
        self.entries.push(spec);
    }

    /// 注销一条映射；不存在时无副作用
    fn remove(&mut self, external: u16, protocol: PortMappingProtocol) {
        self.entries
            .retain(|m| !(m.external == external && protocol_label(m.protocol) == protocol_label(protocol)));
    }

    fn snapshot(&self) -> Vec<MappingSpec> {
        self.entries.clone()
    }
}

/// "TCP" / "UDP"
fn protocol_label(protocol: PortMappingProtocol) -> &'static str {
    match protocol {
        PortMappingProtocol::TCP => "TCP",
        PortMappingProtocol::UDP => "UDP",
    }
}

/// 把服务协议字符串换算成映射协议 (ssh/http/https 底层都是 tcp)
pub fn mapping_protocol(service_protocol: &str) -> PortMappingProtocol {
    match service_protocol.to_lowercase().as_str() {
        "udp" => PortMappingProtocol::UDP,
        _ => PortMappingProtocol::TCP,
    }
}

/// UPnP 客户端
///
/// 网关在启动时发现一次，此后只读共享；
/// 操作在网关列表上逐个尝试直到成功
pub struct UpnpClient {
    gateways: Vec<IgdGateway>,
    local_ip: IpAddr,
    mappings: Mutex<MappingTable>,
}

impl UpnpClient {
    /// 发现局域网内的 IGD 网关
    ///
    /// 未发现网关不是错误：隧道会带着 upnp 失败状态继续跑，
    /// 单层 NAT 上仅靠 STUN 打出的映射也常常可用
    pub async fn discover(local_ip: IpAddr) -> Self {
        let options = SearchOptions {
            timeout: Some(SEARCH_TIMEOUT),
            ..Default::default()
        };

        let gateways = match timeout(UPNP_OP_TIMEOUT, search_gateway(options)).await {
            Ok(Ok(gateway)) => {
                info!("发现 UPnP 网关: {}", gateway.addr);
                vec![gateway]
            }
            Ok(Err(e)) => {
                warn!("未发现可用的 UPnP 网关设备: {}", e);
                Vec::new()
            }
            Err(_) => {
                warn!("UPnP 网关发现超时");
                Vec::new()
            }
        };

        Self {
            gateways,
            local_ip,
            mappings: Mutex::new(MappingTable::default()),
        }
    }

    pub fn has_gateway(&self) -> bool {
        !self.gateways.is_empty()
    }

    /// 构造一个没有网关的客户端，供单元测试使用
    #[cfg(test)]
    pub(crate) fn empty(local_ip: IpAddr) -> Self {
        Self {
            gateways: Vec::new(),
            local_ip,
            mappings: Mutex::new(MappingTable::default()),
        }
    }

    /// 添加端口映射
    ///
    /// 外部端口 -> 本机 internal 端口；成功后回读映射表校验
    pub async fn add_mapping(
        &self,
        external: u16,
        internal: u16,
        protocol: PortMappingProtocol,
        description: &str,
    ) -> Result<()> {
        if self.gateways.is_empty() {
            return Err(anyhow!("未发现可用的 UPnP 网关设备"));
        }

        info!(
            "尝试添加端口映射: 外部端口 {} -> 内部端口 {} ({})",
            external,
            internal,
            protocol_label(protocol)
        );

        let mut last_err = anyhow!("所有网关均尝试失败");
        for gateway in &self.gateways {
            // 先清掉可能残留的同号映射，避免 718 冲突
            let _ = timeout(UPNP_OP_TIMEOUT, gateway.remove_port(protocol, external)).await;

            let local_addr = std::net::SocketAddr::new(self.local_ip, internal);
            match timeout(
                UPNP_OP_TIMEOUT,
                gateway.add_port(protocol, external, local_addr, 0, description),
            )
            .await
            {
                Ok(Ok(())) => {
                    self.verify_mapping(gateway, external, internal, protocol).await;
                    self.mappings.lock().unwrap().upsert(MappingSpec {
                        external,
                        internal,
                        protocol,
                        description: description.to_string(),
                    });
                    info!("端口映射添加成功: WAN:{} -> 本机:{}", external, internal);
                    return Ok(());
                }
                Ok(Err(e)) => {
                    debug!("网关添加映射失败: {}，尝试下一个", e);
                    last_err = anyhow!("添加映射失败: {}", e);
                }
                Err(_) => {
                    debug!("网关添加映射超时，尝试下一个");
                    last_err = anyhow!("添加映射超时");
                }
            }
        }

        Err(last_err)
    }

    /// 回读网关的映射表，确认条目指向本机预期端口
    async fn verify_mapping(
        &self,
        gateway: &IgdGateway,
        external: u16,
        internal: u16,
        protocol: PortMappingProtocol,
    ) {
        for index in 0..MAPPING_TABLE_SCAN_LIMIT {
            let entry = match timeout(
                UPNP_OP_TIMEOUT,
                gateway.get_generic_port_mapping_entry(index),
            )
            .await
            {
                Ok(Ok(entry)) => entry,
                // 表尾或网关不支持回读：校验降级为跳过
                _ => break,
            };

            if entry.external_port != external
                || protocol_label(entry.protocol) != protocol_label(protocol)
            {
                continue;
            }

            let expected_client = self.local_ip.to_string();
            if entry.internal_client != expected_client || entry.internal_port != internal {
                warn!(
                    "映射校验不一致: WAN:{} 指向 {}:{} (预期 {}:{})",
                    external, entry.internal_client, entry.internal_port, expected_client, internal
                );
            } else {
                debug!("映射校验通过: WAN:{} -> {}:{}", external, expected_client, internal);
            }
            return;
        }
    }

    /// 删除端口映射 (在所有网关上尽力而为)
    pub async fn delete_mapping(&self, external: u16, protocol: PortMappingProtocol) {
        self.mappings.lock().unwrap().remove(external, protocol);

        for gateway in &self.gateways {
            match timeout(UPNP_OP_TIMEOUT, gateway.remove_port(protocol, external)).await {
                Ok(Ok(())) => {
                    info!("{} 端口映射删除成功", external);
                    return;
                }
                Ok(Err(e)) => debug!("删除端口映射失败: {}", e),
                Err(_) => debug!("删除端口映射超时"),
            }
        }
    }

    /// 映射保活循环：每 5 分钟把登记过的映射重新 AddPortMapping 一遍
    ///
    /// 幂等刷新，用于抵抗路由器映射表老化
    pub async fn run_keepalive(self: Arc<Self>, cancel: CancellationToken) {
        if self.gateways.is_empty() {
            return;
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
            }

            let specs = self.mappings.lock().unwrap().snapshot();
            if specs.is_empty() {
                continue;
            }

            debug!("UPnP 保活刷新 {} 条映射", specs.len());
            for spec in specs {
                let mut refreshed = false;
                for gateway in &self.gateways {
                    let local_addr = std::net::SocketAddr::new(self.local_ip, spec.internal);
                    match timeout(
                        UPNP_OP_TIMEOUT,
                        gateway.add_port(
                            spec.protocol,
                            spec.external,
                            local_addr,
                            0,
                            &spec.description,
                        ),
                    )
                    .await
                    {
                        Ok(Ok(())) => {
                            refreshed = true;
                            break;
                        }
                        _ => continue,
                    }
                }
                if !refreshed {
                    warn!("UPnP 保活刷新失败: WAN:{}", spec.external);
                }
            }
        }
    }
}
