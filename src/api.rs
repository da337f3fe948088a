//! STUN 管理 API
//!
//! 设备/服务的增删改查，变更即落盘；
//! 涉及隧道生命周期的变更 (启用开关、传输字段、设备 IP)
//! 通过监督器执行重启或停止

use axum::extract::State;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::{now_timestamp, Device, Service, SharedConfig};
use crate::manager::ServiceManager;

/// API 共享状态
#[derive(Clone)]
pub struct AppState {
    pub config: SharedConfig,
    pub manager: Arc<ServiceManager>,
}

/// 统一响应包
#[derive(Debug, Serialize)]
struct ApiResponse {
    code: i32,
    msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn ok_with_data<T: Serialize>(data: T) -> Json<ApiResponse> {
    Json(ApiResponse {
        code: 0,
        msg: "成功".into(),
        data: serde_json::to_value(data).ok(),
    })
}

fn ok_with_msg(msg: &str) -> Json<ApiResponse> {
    Json(ApiResponse {
        code: 0,
        msg: msg.into(),
        data: None,
    })
}

fn fail_with_msg(msg: &str) -> Json<ApiResponse> {
    Json(ApiResponse {
        code: 7,
        msg: msg.into(),
        data: None,
    })
}

/// 构建管理 API 路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/stun/config", get(get_stun_config))
        .route("/api/stun/device/add", post(stun_device_add))
        .route("/api/stun/device/update", put(stun_device_update))
        .route("/api/stun/device/delete", delete(stun_device_delete))
        .route("/api/stun/service/add", post(stun_service_add))
        .route("/api/stun/service/update", put(stun_service_update))
        .route("/api/stun/service/delete", delete(stun_service_delete))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// 启动管理 API 服务
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("管理 API 监听于 http://{}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// 输出当前 stun 配置文件
async fn get_stun_config(State(state): State<AppState>) -> Json<ApiResponse> {
    let snapshot = state.config.snapshot().await;
    ok_with_data(snapshot)
}

// ============================================================================
// 设备管理
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceAddRequest {
    /// 设备名称，如 "群晖NAS" / "树莓派"
    name: String,
    /// 设备内网 IP
    ip: String,
}

async fn stun_device_add(
    State(state): State<AppState>,
    Json(req): Json<DeviceAddRequest>,
) -> Json<ApiResponse> {
    if req.name.is_empty() || req.ip.is_empty() {
        return fail_with_msg("设备名称和IP不能为空");
    }

    let new_device = state
        .config
        .update(|c| {
            // 生成新设备ID (取当前最大ID+1)
            let max_id = c.devices.iter().map(|d| d.id).max().unwrap_or(0);
            let device = Device {
                id: max_id + 1,
                name: req.name.clone(),
                ip: req.ip.clone(),
                services: Vec::new(),
                created_at: now_timestamp(),
                updated_at: now_timestamp(),
            };
            c.devices.push(device.clone());
            device
        })
        .await;

    if state.config.flush().await.is_err() {
        return fail_with_msg("保存配置失败");
    }

    ok_with_data(new_device)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceUpdateRequest {
    device_id: u32,
    name: String,
    ip: String,
}

async fn stun_device_update(
    State(state): State<AppState>,
    Json(req): Json<DeviceUpdateRequest>,
) -> Json<ApiResponse> {
    if req.name.is_empty() || req.ip.is_empty() {
        return fail_with_msg("设备名称和IP不能为空");
    }

    let updated = state
        .config
        .update(|c| {
            let device = c.devices.iter_mut().find(|d| d.id == req.device_id)?;
            let old_ip = device.ip.clone();
            device.name = req.name.clone();
            device.ip = req.ip.clone();
            device.updated_at = now_timestamp();
            Some((old_ip, device.clone()))
        })
        .await;

    let Some((old_ip, device)) = updated else {
        return fail_with_msg("设备不存在");
    };

    if state.config.flush().await.is_err() {
        return fail_with_msg("保存配置失败");
    }

    // 若 IP 发生变化，重启该设备下所有已启用服务
    if old_ip != req.ip {
        state.manager.restart_device_services(req.device_id).await;
    }

    ok_with_data(device)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceDeleteRequest {
    device_id: u32,
}

async fn stun_device_delete(
    State(state): State<AppState>,
    Json(req): Json<DeviceDeleteRequest>,
) -> Json<ApiResponse> {
    // 先停掉该设备下所有服务的穿透
    state.manager.stop_device_services(req.device_id).await;

    let removed = state
        .config
        .update(|c| {
            let before = c.devices.len();
            c.devices.retain(|d| d.id != req.device_id);
            c.devices.len() != before
        })
        .await;

    if !removed {
        return fail_with_msg("设备不存在");
    }

    if state.config.flush().await.is_err() {
        return fail_with_msg("保存配置失败");
    }

    ok_with_msg("删除成功")
}

// ============================================================================
// 服务管理
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceAddRequest {
    device_id: u32,
    name: String,
    internal_port: u16,
    protocol: String,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    use_upnp: bool,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    description: String,
}

async fn stun_service_add(
    State(state): State<AppState>,
    Json(req): Json<ServiceAddRequest>,
) -> Json<ApiResponse> {
    let new_service = Service {
        id: 0,
        name: req.name.clone(),
        internal_port: req.internal_port,
        protocol: req.protocol.clone(),
        tls: req.tls,
        use_upnp: req.use_upnp,
        enabled: req.enabled,
        description: req.description.clone(),
        updated_at: now_timestamp(),
        ..Default::default()
    };
    if let Err(e) = new_service.validate() {
        return fail_with_msg(&e.to_string());
    }

    let added = state
        .config
        .update(|c| {
            let device = c.devices.iter_mut().find(|d| d.id == req.device_id)?;
            // 生成新服务ID (取当前最大ID+1)
            let max_id = device.services.iter().map(|s| s.id).max().unwrap_or(0);
            let mut service = new_service.clone();
            service.id = max_id + 1;
            device.services.push(service.clone());
            Some((device.clone(), service))
        })
        .await;

    let Some((device, service)) = added else {
        return fail_with_msg("设备不存在");
    };

    if state.config.flush().await.is_err() {
        return fail_with_msg("保存配置失败");
    }

    if service.enabled {
        state.manager.start_service(&device, &service).await;
    }

    ok_with_data(service)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceUpdateRequest {
    device_id: u32,
    service_id: u32,
    name: String,
    internal_port: u16,
    protocol: String,
    #[serde(default)]
    tls: bool,
    #[serde(default)]
    use_upnp: bool,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    description: String,
}

async fn stun_service_update(
    State(state): State<AppState>,
    Json(req): Json<ServiceUpdateRequest>,
) -> Json<ApiResponse> {
    // 先校验再落改动，非法输入不触碰核心状态
    let candidate = Service {
        internal_port: req.internal_port,
        protocol: req.protocol.clone(),
        ..Default::default()
    };
    if let Err(e) = candidate.validate() {
        return fail_with_msg(&e.to_string());
    }

    let updated = state
        .config
        .update(|c| {
            let device = c.devices.iter_mut().find(|d| d.id == req.device_id)?;
            let service = device.services.iter_mut().find(|s| s.id == req.service_id)?;

            let old = service.clone();
            service.name = req.name.clone();
            service.internal_port = req.internal_port;
            service.protocol = req.protocol.clone();
            service.tls = req.tls;
            service.use_upnp = req.use_upnp;
            service.enabled = req.enabled;
            service.description = req.description.clone();
            service.updated_at = now_timestamp();
            let service = service.clone();

            Some((old, device.clone(), service))
        })
        .await;

    let Some((old, device, service)) = updated else {
        return fail_with_msg("设备或服务不存在");
    };

    if state.config.flush().await.is_err() {
        return fail_with_msg("保存配置失败");
    }

    // 生命周期规则：
    //   关闭 -> 停止隧道
    //   新启用或传输字段变化 -> 重启隧道
    //   其余 (名称/描述/TLS) 不打扰在跑的隧道
    let transport_changed = old.internal_port != service.internal_port
        || old.protocol.to_lowercase() != service.protocol.to_lowercase();
    if !service.enabled {
        if old.enabled {
            state.manager.stop_service(req.device_id, req.service_id).await;
        }
    } else if !old.enabled || transport_changed {
        state.manager.start_service(&device, &service).await;
    }

    ok_with_data(service)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceDeleteRequest {
    device_id: u32,
    service_id: u32,
}

async fn stun_service_delete(
    State(state): State<AppState>,
    Json(req): Json<ServiceDeleteRequest>,
) -> Json<ApiResponse> {
    // 删除前先停止隧道
    state.manager.stop_service(req.device_id, req.service_id).await;

    let removed = state
        .config
        .update(|c| {
            let device = c.devices.iter_mut().find(|d| d.id == req.device_id)?;
            let before = device.services.len();
            device.services.retain(|s| s.id != req.service_id);
            Some(device.services.len() != before)
        })
        .await;

    match removed {
        Some(true) => {}
        Some(false) => return fail_with_msg("服务不存在"),
        None => return fail_with_msg("设备不存在"),
    }

    if state.config.flush().await.is_err() {
        return fail_with_msg("保存配置失败");
    }

    ok_with_msg("删除成功")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StunConfig;
    use crate::upnp::UpnpClient;

    fn test_state() -> AppState {
        let config = SharedConfig::new(StunConfig {
            local_ip: "127.0.0.1".into(),
            ..Default::default()
        });
        let manager = ServiceManager::new(
            config.clone(),
            Arc::new(UpnpClient::empty("127.0.0.1".parse().unwrap())),
        );
        AppState { config, manager }
    }

    fn device_req(name: &str, ip: &str) -> DeviceAddRequest {
        DeviceAddRequest {
            name: name.into(),
            ip: ip.into(),
        }
    }

    #[tokio::test]
    async fn test_device_ids_strictly_increase() {
        let state = test_state();

        let mut last_id = 0u64;
        for name in ["本机", "NAS", "树莓派"] {
            let resp = stun_device_add(State(state.clone()), Json(device_req(name, "192.168.1.2")))
                .await;
            assert_eq!(resp.0.code, 0);
            let id = resp.0.data.as_ref().unwrap()["id"].as_u64().unwrap();
            assert!(id > last_id, "新ID必须严格大于现有所有ID");
            last_id = id;
        }
    }

    #[tokio::test]
    async fn test_device_id_after_delete_still_max_plus_one() {
        let state = test_state();

        for name in ["a", "b", "c"] {
            stun_device_add(State(state.clone()), Json(device_req(name, "192.168.1.2"))).await;
        }
        // 删掉中间的设备，新ID仍然是 max+1
        stun_device_delete(
            State(state.clone()),
            Json(DeviceDeleteRequest { device_id: 2 }),
        )
        .await;

        let resp =
            stun_device_add(State(state.clone()), Json(device_req("d", "192.168.1.9"))).await;
        let id = resp.0.data.as_ref().unwrap()["id"].as_u64().unwrap();
        assert_eq!(id, 4);
    }

    #[tokio::test]
    async fn test_empty_device_fields_rejected() {
        let state = test_state();
        let resp = stun_device_add(State(state.clone()), Json(device_req("", ""))).await;
        assert_ne!(resp.0.code, 0);
        // 核心状态未被改动
        assert!(state.config.snapshot().await.devices.is_empty());
    }

    #[tokio::test]
    async fn test_service_add_to_unknown_device_fails() {
        let state = test_state();
        let resp = stun_service_add(
            State(state.clone()),
            Json(ServiceAddRequest {
                device_id: 42,
                name: "SSH".into(),
                internal_port: 22,
                protocol: "ssh".into(),
                tls: false,
                use_upnp: true,
                enabled: false,
                description: String::new(),
            }),
        )
        .await;
        assert_ne!(resp.0.code, 0);
    }

    #[tokio::test]
    async fn test_service_validation_rejects_bad_input() {
        let state = test_state();
        stun_device_add(State(state.clone()), Json(device_req("本机", "192.168.1.2"))).await;

        let resp = stun_service_add(
            State(state.clone()),
            Json(ServiceAddRequest {
                device_id: 1,
                name: "坏端口".into(),
                internal_port: 0,
                protocol: "tcp".into(),
                tls: false,
                use_upnp: false,
                enabled: false,
                description: String::new(),
            }),
        )
        .await;
        assert_ne!(resp.0.code, 0);

        let snapshot = state.config.snapshot().await;
        assert!(snapshot.devices[0].services.is_empty());
    }

    #[tokio::test]
    async fn test_service_ids_increase_within_device() {
        let state = test_state();
        stun_device_add(State(state.clone()), Json(device_req("本机", "192.168.1.2"))).await;

        let mut last_id = 0u64;
        for name in ["SSH", "Web管理"] {
            let resp = stun_service_add(
                State(state.clone()),
                Json(ServiceAddRequest {
                    device_id: 1,
                    name: name.into(),
                    internal_port: 22,
                    protocol: "tcp".into(),
                    tls: false,
                    use_upnp: false,
                    enabled: false,
                    description: String::new(),
                }),
            )
            .await;
            assert_eq!(resp.0.code, 0);
            let id = resp.0.data.as_ref().unwrap()["id"].as_u64().unwrap();
            assert!(id > last_id);
            last_id = id;
        }
    }

    #[tokio::test]
    async fn test_service_delete_removes_entry() {
        let state = test_state();
        stun_device_add(State(state.clone()), Json(device_req("本机", "192.168.1.2"))).await;
        stun_service_add(
            State(state.clone()),
            Json(ServiceAddRequest {
                device_id: 1,
                name: "SSH".into(),
                internal_port: 22,
                protocol: "tcp".into(),
                tls: false,
                use_upnp: false,
                enabled: false,
                description: String::new(),
            }),
        )
        .await;

        let resp = stun_service_delete(
            State(state.clone()),
            Json(ServiceDeleteRequest {
                device_id: 1,
                service_id: 1,
            }),
        )
        .await;
        assert_eq!(resp.0.code, 0);
        assert!(state.config.snapshot().await.devices[0].services.is_empty());

        // 幂等：再次删除报服务不存在，核心状态不变
        let resp = stun_service_delete(
            State(state.clone()),
            Json(ServiceDeleteRequest {
                device_id: 1,
                service_id: 1,
            }),
        )
        .await;
        assert_ne!(resp.0.code, 0);
    }
}
