//! 服务监督器
//!
//! 维护 "deviceID-serviceID" -> 隧道的运行注册表，
//! 同一个 key 最多只有一个在跑的实例；
//! 单次隧道尝试失败后按退避规则重试，
//! 只要启动成功过一次就清零重试计数，
//! 连续失败到上限则自动关闭该服务

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{now_timestamp, Device, Service, SharedConfig};
use crate::tunnel::{run_stun_tunnel, TunnelContext};
use crate::upnp::UpnpClient;

/// 最大连续重试次数，超过后服务被自动关闭
const MAX_ATTEMPTS: u32 = 5;

/// 两次尝试之间的等待
const RESTART_DELAY: Duration = Duration::from_secs(1);

/// 等待旧实例退出的上限
const STOP_WAIT_TIMEOUT: Duration = Duration::from_secs(30);

/// 注册表里一个正在运行的服务
struct TunnelEntry {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// 服务注册表的 key
fn service_key(device_id: u32, service_id: u32) -> String {
    format!("{}-{}", device_id, service_id)
}

/// 服务监督器
pub struct ServiceManager {
    config: SharedConfig,
    upnp: Arc<UpnpClient>,
    registry: Mutex<HashMap<String, TunnelEntry>>,
    /// 串行化 start/stop：start 在"取消旧实例"与"插入新条目"之间有等待，
    /// 不能让并发的生命周期操作插进来
    lifecycle: tokio::sync::Mutex<()>,
}

impl ServiceManager {
    pub fn new(config: SharedConfig, upnp: Arc<UpnpClient>) -> Arc<Self> {
        Arc::new(Self {
            config,
            upnp,
            registry: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    /// 启动单个服务 (已在运行则先停止旧实例)
    ///
    /// 先取消旧实例并等它真正退出，再插入新的注册表条目，
    /// 保证同一个 key 任何时刻至多一个实例
    pub async fn start_service(self: &Arc<Self>, device: &Device, service: &Service) {
        let _guard = self.lifecycle.lock().await;
        let key = service_key(device.id, service.id);

        let old = self.registry.lock().unwrap().remove(&key);
        if let Some(entry) = old {
            entry.cancel.cancel();
            if timeout(STOP_WAIT_TIMEOUT, entry.handle).await.is_err() {
                warn!("[{} - {}] 旧实例退出超时", device.name, service.name);
            }
            info!("[{} - {}] 停止旧实例", device.name, service.name);
        }

        if !service.enabled {
            info!("[{} - {}] 服务未启用，跳过", device.name, service.name);
            return;
        }

        let cancel = CancellationToken::new();
        let manager = self.clone();
        let device = device.clone();
        let service = service.clone();
        let cancel_for_task = cancel.clone();
        let handle = tokio::spawn(async move {
            manager.attempt_loop(device, service, cancel_for_task).await;
        });

        self.registry
            .lock()
            .unwrap()
            .insert(key, TunnelEntry { cancel, handle });
    }

    /// 停止指定服务；幂等，发出取消信号后立即返回 (不等隧道退出)
    pub async fn stop_service(&self, device_id: u32, service_id: u32) {
        let _guard = self.lifecycle.lock().await;
        let key = service_key(device_id, service_id);
        if let Some(entry) = self.registry.lock().unwrap().remove(&key) {
            entry.cancel.cancel();
            info!("服务 {} 已停止", key);
        }
    }

    /// 启动全部已启用的服务 (程序初始化时调用)
    pub async fn start_all_services(self: &Arc<Self>) {
        let snapshot = self.config.snapshot().await;
        for device in &snapshot.devices {
            for service in &device.services {
                if service.enabled {
                    self.start_service(device, service).await;
                }
            }
        }
    }

    /// 重启某台设备下的全部服务 (设备 IP 变化时调用)
    pub async fn restart_device_services(self: &Arc<Self>, device_id: u32) {
        let snapshot = self.config.snapshot().await;
        let Some(device) = snapshot.devices.iter().find(|d| d.id == device_id) else {
            return;
        };
        for service in &device.services {
            self.start_service(device, service).await;
        }
    }

    /// 停止某台设备下的全部服务 (设备删除时调用)
    pub async fn stop_device_services(&self, device_id: u32) {
        let snapshot = self.config.snapshot().await;
        let Some(device) = snapshot.devices.iter().find(|d| d.id == device_id) else {
            return;
        };
        for service in &device.services {
            self.stop_service(device_id, service.id).await;
        }
    }

    /// 某个服务当前是否在注册表里
    pub fn is_running(&self, device_id: u32, service_id: u32) -> bool {
        self.registry
            .lock()
            .unwrap()
            .contains_key(&service_key(device_id, service_id))
    }

    /// 单个服务的尝试循环
    async fn attempt_loop(
        self: Arc<Self>,
        device: Device,
        service: Service,
        cancel: CancellationToken,
    ) {
        let key = service_key(device.id, service.id);
        let mut attempt: u32 = 0;
        let startup_success = AtomicBool::new(false);

        loop {
            if cancel.is_cancelled() {
                info!("[{} - {}] 服务已停止", device.name, service.name);
                return;
            }

            attempt += 1;
            info!(
                "[{} - {}] 启动服务 (第 {} 次)",
                device.name, service.name, attempt
            );

            // 每次尝试都取最新快照：best STUN / 本机 IP 可能已被刷新
            let snapshot = self.config.snapshot().await;
            let local_ip: IpAddr = snapshot
                .local_ip
                .parse()
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

            let ctx = TunnelContext {
                device_name: device.name.clone(),
                target_ip: device.ip.clone(),
                local_ip,
                best_stun: snapshot.best_stun.clone(),
                upnp: self.upnp.clone(),
                cancel: cancel.clone(),
            };

            startup_success.store(false, Ordering::SeqCst);
            let result = run_stun_tunnel(&ctx, &service, &startup_success).await;

            // 取消导致的退出不算失败
            if cancel.is_cancelled() {
                info!("[{} - {}] 服务已被取消退出", device.name, service.name);
                return;
            }

            let Err(err) = result else { continue };
            error!(
                "[{} - {}] STUN 穿透失败 (第 {}/{} 次): {}",
                device.name, service.name, attempt, MAX_ATTEMPTS, err
            );

            // 进入过健康检查的尝试把计数清零：
            // 长时间健康运行后的一次漂移不应烧掉重试预算
            if startup_success.load(Ordering::SeqCst) {
                attempt = 0;
            }

            if attempt >= MAX_ATTEMPTS {
                error!(
                    "[{} - {}] 达到最大重试次数，关闭服务",
                    device.name, service.name
                );
                self.disable_service(device.id, service.id, &err.to_string())
                    .await;
                self.registry.lock().unwrap().remove(&key);
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("[{} - {}] 服务已停止", device.name, service.name);
                    return;
                }
                _ = tokio::time::sleep(RESTART_DELAY) => {}
            }
        }
    }

    /// 重试耗尽后把服务标记为未启用并落盘
    async fn disable_service(&self, device_id: u32, service_id: u32, last_error: &str) {
        self.config
            .update(|c| {
                let Some(device) = c.devices.iter_mut().find(|d| d.id == device_id) else {
                    return;
                };
                let Some(svc) = device.services.iter_mut().find(|s| s.id == service_id) else {
                    return;
                };
                svc.enabled = false;
                svc.last_error = last_error.to_string();
                svc.updated_at = now_timestamp();
            })
            .await;

        if let Err(e) = self.config.flush().await {
            error!("保存配置失败: {}", e);
        }
    }
}
