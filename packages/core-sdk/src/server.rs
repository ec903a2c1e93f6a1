use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;

use crate::error::ProviderError;
use crate::form::{self, SettingsForm};
use crate::llm::{self, HealthReport, RequestRouter};
use crate::models::{Message, ProviderProfile};
use crate::telemetry;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/** \brief 一次注册得到的令牌；`serial` 区分复用同一 ID 的不同流。 */
#[derive(Debug, Clone)]
struct StreamTicket {
    serial: u64,
    token: CancellationToken,
}

/** \brief 管理流式任务的取消令牌。 */
#[derive(Default, Clone)]
pub struct StreamRegistry {
    inner: Arc<Mutex<HashMap<String, StreamTicket>>>,
    next_serial: Arc<AtomicU64>,
}

impl StreamRegistry {
    fn register(&self, stream_id: &str) -> StreamTicket {
        let ticket = StreamTicket {
            serial: self.next_serial.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        if let Ok(mut guard) = self.inner.lock() {
            // 同 ID 的旧流直接取消
            if let Some(old) = guard.insert(stream_id.to_string(), ticket.clone()) {
                old.token.cancel();
            }
        }
        ticket
    }

    fn cancel(&self, stream_id: &str) -> bool {
        let removed = self
            .inner
            .lock()
            .ok()
            .and_then(|mut guard| guard.remove(stream_id));
        match removed {
            Some(ticket) => {
                ticket.token.cancel();
                true
            }
            None => false,
        }
    }

    /**
     * \brief 流结束时注销；ID 已被新流占用时保持不动。
     */
    fn remove(&self, stream_id: &str, ticket: &StreamTicket) {
        if let Ok(mut guard) = self.inner.lock() {
            if guard
                .get(stream_id)
                .is_some_and(|current| current.serial == ticket.serial)
            {
                guard.remove(stream_id);
            }
        }
    }

    pub fn active(&self) -> usize {
        self.inner.lock().map(|g| g.len()).unwrap_or(0)
    }
}

/**
 * \brief 服务共享状态。
 */
#[derive(Clone)]
pub struct AppState {
    pub router: RequestRouter,
    pub streams: StreamRegistry,
}

impl AppState {
    pub fn new(router: RequestRouter) -> Self {
        Self {
            router,
            streams: StreamRegistry::default(),
        }
    }
}

type ApiError = (StatusCode, String);

#[derive(Serialize, Debug)]
struct ProfileView {
    name: String,
    base_url: String,
    model_id: String,
    has_api_key: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    api_key_ref: Option<String>,
}

impl From<ProviderProfile> for ProfileView {
    fn from(p: ProviderProfile) -> Self {
        Self {
            name: p.name,
            base_url: p.base_url,
            model_id: p.model_id,
            has_api_key: p.api_key_ref.is_some(),
            api_key_ref: p.api_key_ref.map(|r| r.to_string()),
        }
    }
}

#[derive(Serialize, Debug)]
struct ProviderState {
    configured: bool,
    profile: Option<ProfileView>,
    config_path: PathBuf,
    telemetry_enabled: bool,
}

#[derive(Deserialize, Debug)]
struct ChatQuery {
    /** \brief 用户输入 */
    prompt: String,
    /** \brief 可选的系统提示 */
    #[serde(default)]
    system: Option<String>,
    /** \brief 客户端生成的流 ID，用于取消 */
    #[serde(default)]
    stream_id: Option<String>,
    /** \brief 是否流式，默认 true */
    #[serde(default)]
    stream: Option<bool>,
}

#[derive(Deserialize, Debug)]
struct CancelRequest {
    stream_id: String,
}

/**
 * \brief 组装路由：设置 API、聊天 SSE 与静态前端。
 */
pub fn app(state: AppState, ui_dir: PathBuf) -> Router {
    let static_service = ServeDir::new(ui_dir).append_index_html_on_directories(true);

    Router::new()
        .route("/api/config", get(get_config))
        .route("/api/connect", post(connect).delete(disconnect))
        .route("/api/models", get(list_models))
        .route("/api/health", get(health_check))
        .route("/api/health/preview", post(health_check_preview))
        .route("/api/chat/sse", get(chat_sse))
        .route("/api/chat/cancel", post(cancel_chat))
        .fallback_service(static_service)
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(addr: &str, state: AppState, ui_dir: PathBuf) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("server listening on http://{}", listener.local_addr()?);
    serve(listener, state, ui_dir).await
}

/**
 * \brief 在已绑定的监听器上提供服务。
 */
pub async fn serve(listener: TcpListener, state: AppState, ui_dir: PathBuf) -> Result<()> {
    axum::serve(listener, app(state, ui_dir)).await?;
    Ok(())
}

fn api_err(e: ProviderError) -> ApiError {
    let status = match &e {
        ProviderError::InvalidForm(_) | ProviderError::InvalidBaseUrl { .. } => {
            StatusCode::BAD_REQUEST
        }
        ProviderError::NotConfigured => StatusCode::NOT_FOUND,
        ProviderError::AuthenticationFailed { .. } => StatusCode::UNAUTHORIZED,
        ProviderError::CredentialStoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        e if e.is_upstream() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = match e.hint() {
        Some(hint) => format!("{} ({})", e, hint),
        None => e.to_string(),
    };
    (status, body)
}

fn provider_state(state: &AppState) -> Result<ProviderState, ApiError> {
    let profile = state.router.generator().load().map_err(api_err)?;
    Ok(ProviderState {
        configured: profile.is_some(),
        profile: profile.map(ProfileView::from),
        config_path: state.router.generator().path().to_path_buf(),
        telemetry_enabled: telemetry::is_enabled(),
    })
}

/**
 * \brief 获取当前 Provider 配置（不含密钥）。
 */
async fn get_config(State(state): State<AppState>) -> Result<Json<ProviderState>, ApiError> {
    Ok(Json(provider_state(&state)?))
}

/**
 * \brief 提交设置表单（Connect）。
 */
async fn connect(
    State(state): State<AppState>,
    Json(payload): Json<SettingsForm>,
) -> Result<Json<ProviderState>, ApiError> {
    let outcome = form::connect(&payload, state.router.store(), state.router.generator())
        .map_err(api_err)?;
    telemetry::log_event(
        "server.provider",
        &format!(
            "connect name={} base={} model={}",
            outcome.profile.name, outcome.profile.base_url, outcome.profile.model_id
        ),
    );
    Ok(Json(provider_state(&state)?))
}

/**
 * \brief 断开当前 Provider。
 */
async fn disconnect(State(state): State<AppState>) -> Result<Json<ProviderState>, ApiError> {
    let removed = form::disconnect(state.router.store(), state.router.generator())
        .map_err(api_err)?;
    if let Some(profile) = removed {
        telemetry::log_event("server.provider", &format!("disconnect name={}", profile.name));
    }
    Ok(Json(provider_state(&state)?))
}

async fn list_models(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let models = state.router.list_models().await.map_err(api_err)?;
    Ok(Json(serde_json::json!({ "models": models })))
}

/**
 * \brief 健康检查：尝试列出模型并返回状态。
 */
async fn health_check(State(state): State<AppState>) -> Result<Json<HealthReport>, ApiError> {
    Ok(Json(state.router.health().await.map_err(api_err)?))
}

/**
 * \brief 健康检查预检：使用未保存的表单进行验证。
 */
async fn health_check_preview(
    State(state): State<AppState>,
    Json(payload): Json<SettingsForm>,
) -> Result<Json<HealthReport>, ApiError> {
    let report = llm::health_preview(state.router.client(), &payload)
        .await
        .map_err(api_err)?;
    Ok(Json(report))
}

async fn cancel_chat(
    State(state): State<AppState>,
    Json(payload): Json<CancelRequest>,
) -> Json<serde_json::Value> {
    let cancelled = state.streams.cancel(&payload.stream_id);
    Json(serde_json::json!({ "cancelled": cancelled }))
}

/**
 * \brief 增量事件：内容以 JSON 包装，裸 `\r` 等换行字符不会破坏 SSE 分帧。
 */
fn content_event(content: &str) -> Event {
    Event::default().data(serde_json::json!({ "content": content }).to_string())
}

/**
 * \brief 聊天 SSE：`meta` 事件 → 若干 `{"content": ..}` 增量 → `done` 或 `error`。
 */
async fn chat_sse(
    State(state): State<AppState>,
    Query(q): Query<ChatQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    // 请求开始时固定配置快照，之后的重新配置不影响本次请求
    let provider = state.router.resolve_active().map_err(api_err)?;
    let mut messages = Vec::new();
    if let Some(system) = q.system.filter(|s| !s.trim().is_empty()) {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(q.prompt));

    let stream_id = q
        .stream_id
        .unwrap_or_else(|| format!("stream-{}", NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)));
    let ticket = state.streams.register(&stream_id);
    let token = ticket.token.clone();
    let stream_flag = q.stream.unwrap_or(true);

    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    let _ = tx.send(Ok(Event::default().event("meta").data(
        serde_json::json!({
            "stream_id": stream_id,
            "provider": provider.name,
            "model": provider.model_id,
        })
        .to_string(),
    )));

    let client = state.router.client().clone();
    let registry = state.streams.clone();
    tokio::spawn(async move {
        telemetry::log_event(
            "server.chat",
            &format!(
                "provider={} model={} stream_id={} stream={}",
                provider.name, provider.model_id, stream_id, stream_flag
            ),
        );

        if stream_flag {
            let opened = tokio::select! {
                _ = token.cancelled() => None,
                s = llm::stream_chat(&client, &provider, &messages) => Some(s),
            };
            match opened {
                None => {
                    let _ = tx.send(Ok(Event::default().event("cancelled").data(stream_id.clone())));
                }
                Some(Err(e)) => {
                    telemetry::log_error("server.chat", &format!("stream failed: {}", e));
                    let _ = tx.send(Ok(Event::default().event("error").data(e.to_string())));
                }
                Some(Ok(mut s)) => loop {
                    let next = tokio::select! {
                        _ = token.cancelled() => {
                            let _ = tx.send(Ok(Event::default().event("cancelled").data(stream_id.clone())));
                            break;
                        }
                        next = s.next() => next,
                    };
                    match next {
                        Some(Ok(delta)) => {
                            if tx.send(Ok(content_event(&delta))).is_err() {
                                // 客户端已断开
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            telemetry::log_error("server.chat", &format!("stream error: {}", e));
                            let _ = tx.send(Ok(Event::default().event("error").data(e.to_string())));
                            break;
                        }
                        None => {
                            let _ = tx.send(Ok(Event::default().event("done").data("")));
                            break;
                        }
                    }
                },
            }
        } else {
            let result = tokio::select! {
                _ = token.cancelled() => None,
                r = llm::chat_once(&client, &provider, &messages) => Some(r),
            };
            match result {
                None => {
                    let _ = tx.send(Ok(Event::default().event("cancelled").data(stream_id.clone())));
                }
                Some(Ok(reply)) => {
                    let _ = tx.send(Ok(content_event(&reply.content)));
                    let _ = tx.send(Ok(Event::default().event("done").data("")));
                }
                Some(Err(e)) => {
                    telemetry::log_error("server.chat", &format!("chat_once failed: {}", e));
                    let _ = tx.send(Ok(Event::default().event("error").data(e.to_string())));
                }
            }
        }
        registry.remove(&stream_id, &ticket);
    });

    let stream = UnboundedReceiverStream::new(rx);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_registry_cancel_and_replace() {
        let registry = StreamRegistry::default();
        let first = registry.register("s1");
        let second = registry.register("s1");
        assert!(first.token.is_cancelled());
        assert!(!second.token.is_cancelled());
        assert_eq!(registry.active(), 1);

        assert!(registry.cancel("s1"));
        assert!(second.token.is_cancelled());
        assert!(!registry.cancel("s1"));

        let third = registry.register("s2");
        registry.remove("s2", &third);
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_finished_stream_does_not_unregister_reused_id() {
        let registry = StreamRegistry::default();
        let first = registry.register("s");
        let second = registry.register("s");

        // 第一个流结束时，同 ID 的新流仍可取消
        registry.remove("s", &first);
        assert_eq!(registry.active(), 1);
        assert!(registry.cancel("s"));
        assert!(second.token.is_cancelled());

        registry.remove("s", &second);
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_api_err_status_mapping() {
        let (status, body) = api_err(ProviderError::InvalidBaseUrl {
            url: "x".into(),
            reason: "missing scheme".into(),
        });
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("http://localhost:8000/v1"));

        let (status, _) = api_err(ProviderError::AuthenticationFailed {
            status: 403,
            message: "nope".into(),
        });
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = api_err(ProviderError::ModelInvocationFailed {
            status: 404,
            message: "unknown model".into(),
        });
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(api_err(ProviderError::NotConfigured).0, StatusCode::NOT_FOUND);
    }
}
