//! STUN 配置管理模块
//!
//! 负责 stunConfig.json / stunServers.json 的读写，
//! 以及进程内共享配置的快照读取与串行写入

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// stun 主配置文件路径
pub const STUN_CONFIG_PATH: &str = "config/stunConfig.json";

/// stun 服务器列表文件路径
pub const STUN_SERVERS_PATH: &str = "config/stunServers.json";

/// 内置的公共 STUN 服务器列表 (首次启动时写入 stunServers.json)
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun.radiojar.com:3478",
    "stun.ringostat.com:3478",
    "stun.irishvoip.com:3478",
    "stun.voipgate.com:3478",
    "stun.tula.nu:3478",
    "stun.yesdates.com:3478",
    "stun.telnyx.com:3478",
    "stun.vavadating.com:3478",
    "stun.bau-ha.us:3478",
    "stun.bridesbay.com:3478",
    "stun.3wayint.com:3478",
    "stun.finsterwalder.com:3478",
    "stun.romaaeterna.nl:3478",
    "stun.fitauto.ru:3478",
    "stun.antisip.com:3478",
    "stun.heeds.eu:3478",
    "stun.hot-chilli.net:3478",
    "stun.eurosys.be:3478",
    "stun.vincross.com:3478",
    "stun.cibercloud.com.br:3478",
    "stun.siptrunk.com:3478",
];

/// stun 全局配置 (对应 config/stunConfig.json)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StunConfig {
    /// 本机内网IP
    #[serde(rename = "localIP", default)]
    pub local_ip: String,
    /// 真实公网IP
    #[serde(rename = "publicIP", default)]
    pub public_ip: String,
    /// NAT 路由信息 (由 traceroute 探测得到)
    #[serde(default)]
    pub nat_router_list: Vec<NatRouterInfo>,
    /// 最快的 STUN 服务器
    #[serde(default)]
    pub best_stun: String,
    /// 配置创建时间 (unix 秒)
    #[serde(default)]
    pub created_at: u64,
    /// 最后更新时间 (unix 秒)
    #[serde(default)]
    pub updated_at: u64,

    /// stun 设备列表
    #[serde(default)]
    pub devices: Vec<Device>,
    /// stun 服务器列表
    #[serde(default)]
    pub stun_server_list: Vec<String>,
}

/// 一台内网设备及其上的服务
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    /// 设备ID
    pub id: u32,
    /// 设备名称, 如 "本机" / "群晖NAS" / "树莓派"
    pub name: String,
    /// 设备内网 IP
    pub ip: String,
    /// 该设备上的服务
    #[serde(default)]
    pub services: Vec<Service>,

    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

/// 单个服务配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// 服务唯一标识符
    pub id: u32,
    /// 服务名称, 如 "SSH" / "Web管理" / "照片库"
    pub name: String,
    /// 内网端口, 如 22
    pub internal_port: u16,
    /// 外网映射端口 (默认与 UPnP 映射端口一样)
    #[serde(default)]
    pub external_port: u16,
    /// 传输协议 "tcp"/"udp"/"ssh"/"http"/"https"，大小写不敏感
    pub protocol: String,
    /// 证书 (仅用于拼接公网 URL)
    #[serde(default)]
    pub tls: bool,

    /// 是否启用 UPnP 自动端口映射
    #[serde(default)]
    pub use_upnp: bool,
    /// UPnP 实际映射成功的端口号
    #[serde(default)]
    pub upnp_mapped_port: u16,

    /// 服务是否启用
    #[serde(default)]
    pub enabled: bool,
    /// 服务描述信息 (可选)
    #[serde(default)]
    pub description: String,

    /// 最后一次操作的错误信息
    #[serde(default)]
    pub last_error: String,
    /// 最后更新时间
    #[serde(default)]
    pub updated_at: u64,
}

/// 每个 NAT 路由信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NatRouterInfo {
    /// NAT 层级 (从 1 开始)
    #[serde(rename = "natLevel")]
    pub nat_level: u32,
    /// LAN 口 IP 地址
    #[serde(rename = "lanIP")]
    pub lan_ip: String,
}

/// 合法的服务协议取值
const KNOWN_PROTOCOLS: &[&str] = &["tcp", "udp", "ssh", "http", "https"];

impl Service {
    /// 校验服务配置是否合法 (端口范围 / 协议取值)
    pub fn validate(&self) -> Result<()> {
        if self.internal_port == 0 {
            anyhow::bail!("内网端口必须在 1-65535 范围内");
        }
        let proto = self.protocol.to_lowercase();
        if !KNOWN_PROTOCOLS.contains(&proto.as_str()) {
            anyhow::bail!("不支持的协议: {}", self.protocol);
        }
        Ok(())
    }
}

/// 当前 unix 时间戳 (秒)
pub fn now_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// 读取 json 配置文件
pub fn read_json_file<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let data = fs::read_to_string(path.as_ref())
        .with_context(|| format!("读取文件失败: {:?}", path.as_ref()))?;
    let value = serde_json::from_str(&data)
        .with_context(|| format!("解析 JSON 失败: {:?}", path.as_ref()))?;
    Ok(value)
}

/// 写入 json 配置文件 (带缩进，目录 0755 / 文件 0644)
pub fn write_json_file<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    if let Some(dir) = path.as_ref().parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir).with_context(|| format!("创建目录失败: {:?}", dir))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(dir, fs::Permissions::from_mode(0o755))
                    .with_context(|| format!("设置目录权限失败: {:?}", dir))?;
            }
        }
    }

    let data = serde_json::to_string_pretty(value)?;
    fs::write(path.as_ref(), data).with_context(|| format!("写入文件失败: {:?}", path.as_ref()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path.as_ref(), fs::Permissions::from_mode(0o644))
            .with_context(|| format!("设置文件权限失败: {:?}", path.as_ref()))?;
    }
    Ok(())
}

/// 文件不存在或为空
fn file_missing_or_empty<P: AsRef<Path>>(path: P) -> bool {
    match fs::metadata(path.as_ref()) {
        Ok(meta) => meta.len() == 0,
        Err(_) => true,
    }
}

/// 读取 stunConfig.json，不存在或为空时创建空配置
pub fn read_stun_config() -> Result<StunConfig> {
    if file_missing_or_empty(STUN_CONFIG_PATH) {
        return create_stun_config();
    }

    let config: StunConfig = read_json_file(STUN_CONFIG_PATH)?;
    Ok(config)
}

/// 首次创建空配置文件
fn create_stun_config() -> Result<StunConfig> {
    let mut config = StunConfig::default();
    config.created_at = now_timestamp();
    config.updated_at = now_timestamp();

    write_json_file(STUN_CONFIG_PATH, &config)?;
    info!("已创建空配置文件: {}", STUN_CONFIG_PATH);
    Ok(config)
}

/// 读取 stunServers.json，不存在或为空时写入内置默认列表
pub fn init_stun_servers() -> Vec<String> {
    if file_missing_or_empty(STUN_SERVERS_PATH) {
        let servers: Vec<String> = DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect();
        if let Err(e) = write_json_file(STUN_SERVERS_PATH, &servers) {
            warn!("StunServers 写入失败: {}", e);
        }
        return servers;
    }

    match read_json_file::<Vec<String>, _>(STUN_SERVERS_PATH) {
        Ok(servers) => servers,
        Err(e) => {
            warn!("stunServers 读取失败: {}", e);
            Vec::new()
        }
    }
}

/// 进程级共享配置
///
/// 读取方拿快照，写入方通过 `update` 串行修改；
/// 管理 API 的每次变更之后都应调用 `flush` 落盘
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<StunConfig>>,
}

impl SharedConfig {
    pub fn new(config: StunConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// 获取配置快照
    pub async fn snapshot(&self) -> StunConfig {
        self.inner.read().await.clone()
    }

    /// 串行修改配置，返回闭包结果
    pub async fn update<R>(&self, f: impl FnOnce(&mut StunConfig) -> R) -> R {
        let mut guard = self.inner.write().await;
        let result = f(&mut guard);
        guard.updated_at = now_timestamp();
        result
    }

    /// 把当前配置写入 stunConfig.json
    pub async fn flush(&self) -> Result<()> {
        let guard = self.inner.read().await;
        write_json_file(STUN_CONFIG_PATH, &*guard)?;
        info!("STUN 配置文件已更新");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> StunConfig {
        StunConfig {
            local_ip: "192.168.1.50".into(),
            public_ip: "203.0.113.7".into(),
            nat_router_list: vec![NatRouterInfo {
                nat_level: 1,
                lan_ip: "192.168.1.1".into(),
            }],
            best_stun: "stun.telnyx.com:3478".into(),
            created_at: 1700000000,
            updated_at: 1700000001,
            devices: vec![Device {
                id: 1,
                name: "群晖NAS".into(),
                ip: "192.168.1.50".into(),
                services: vec![Service {
                    id: 1,
                    name: "Web管理".into(),
                    internal_port: 8080,
                    protocol: "http".into(),
                    use_upnp: true,
                    enabled: true,
                    ..Default::default()
                }],
                created_at: 1700000000,
                updated_at: 1700000000,
            }],
            stun_server_list: vec!["stun.telnyx.com:3478".into()],
        }
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample_config()).unwrap();
        assert!(json.get("localIP").is_some());
        assert!(json.get("publicIP").is_some());
        assert!(json.get("bestStun").is_some());
        assert!(json.get("natRouterList").is_some());
        assert!(json["natRouterList"][0].get("natLevel").is_some());
        assert!(json["natRouterList"][0].get("lanIP").is_some());
        let service = &json["devices"][0]["services"][0];
        assert!(service.get("internalPort").is_some());
        assert!(service.get("useUpnp").is_some());
    }

    #[test]
    fn test_roundtrip_stable() {
        let config = sample_config();
        let first = serde_json::to_string_pretty(&config).unwrap();
        let parsed: StunConfig = serde_json::from_str(&first).unwrap();
        let second = serde_json::to_string_pretty(&parsed).unwrap();
        // 写 -> 读 -> 写 应当字节级一致 (updatedAt 未被触碰)
        assert_eq!(first, second);
    }

    #[test]
    fn test_validate_service() {
        let mut svc = Service {
            internal_port: 22,
            protocol: "SSH".into(),
            ..Default::default()
        };
        assert!(svc.validate().is_ok());

        svc.internal_port = 0;
        assert!(svc.validate().is_err());

        svc.internal_port = 22;
        svc.protocol = "sctp".into();
        assert!(svc.validate().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_write_json_file_sets_modes() {
        use std::os::unix::fs::PermissionsExt;

        let dir = std::env::temp_dir().join("linkstar-config-mode-test");
        let path = dir.join("cfg.json");
        write_json_file(&path, &sample_config()).unwrap();

        let file_mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o644);
        let dir_mode = std::fs::metadata(&dir).unwrap().permissions().mode();
        assert_eq!(dir_mode & 0o777, 0o755);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_shared_config_update_bumps_timestamp() {
        let shared = SharedConfig::new(sample_config());
        let before = shared.snapshot().await.updated_at;
        shared
            .update(|c| {
                c.public_ip = "198.51.100.9".into();
            })
            .await;
        let after = shared.snapshot().await;
        assert_eq!(after.public_ip, "198.51.100.9");
        assert!(after.updated_at >= before);
    }
}
