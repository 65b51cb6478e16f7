//! HTTP处理器

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use litepacs_core::dicom::{DicomMap, ParsedDicomInstance};
use litepacs_core::{ContentType, ResourceLevel, StoreError, StoreStatus};
use litepacs_engine::{FindQuery, ServerContext};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

/// 错误到HTTP状态码的稳定映射
pub struct ApiError(StoreError);

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            StoreError::UnknownResource(_) => StatusCode::NOT_FOUND,
            StoreError::MissingRequiredTag(_) | StoreError::BadFileFormat(_) => {
                StatusCode::BAD_REQUEST
            }
            StoreError::FullStorage | StoreError::DiskFull => StatusCode::INSUFFICIENT_STORAGE,
            StoreError::DatabaseBusy => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// API根路径处理器
pub async fn api_root() -> impl IntoResponse {
    Json(json!({
        "service": "LitePACS REST API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "endpoints": {
            "health": "/health",
            "statistics": "/statistics",
            "instances": "/instances",
            "changes": "/changes"
        }
    }))
}

/// 健康检查处理器
pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// 存储统计处理器
pub async fn statistics(State(context): State<Arc<ServerContext>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(context.statistics().await?))
}

/// 入库信封：标签摘要加base64编码的原始负载
#[derive(Debug, Deserialize)]
pub struct StoreEnvelope {
    pub tags: serde_json::Value,
    #[serde(default)]
    pub content: String,
}

/// 实例入库处理器
pub async fn store_instance(
    State(context): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(envelope): Json<StoreEnvelope>,
) -> ApiResult<impl IntoResponse> {
    let tags = DicomMap::from_json(&envelope.tags)?;
    let data = BASE64
        .decode(envelope.content.as_bytes())
        .map_err(|e| StoreError::BadFileFormat(format!("负载base64解码失败: {}", e)))?;

    let remote_aet = headers
        .get("x-remote-aet")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("HTTP");

    let (status, public_id) = context
        .store(ParsedDicomInstance::new(tags, data), remote_aet)
        .await?;
    info!("Store over REST finished with status {:?}", status);

    let http_status = match status {
        StoreStatus::Success | StoreStatus::AlreadyStored => StatusCode::OK,
        StoreStatus::FilteredOut => StatusCode::FORBIDDEN,
        StoreStatus::MissingRequiredTag => StatusCode::BAD_REQUEST,
        StoreStatus::FullStorage => StatusCode::INSUFFICIENT_STORAGE,
        StoreStatus::Failure => StatusCode::INTERNAL_SERVER_ERROR,
    };

    Ok((
        http_status,
        Json(json!({ "status": status, "id": public_id })),
    ))
}

async fn list_level(
    context: Arc<ServerContext>,
    level: ResourceLevel,
) -> ApiResult<Json<Vec<String>>> {
    Ok(Json(context.list(level).await?))
}

/// 患者列表处理器
pub async fn list_patients(
    State(context): State<Arc<ServerContext>>,
) -> ApiResult<impl IntoResponse> {
    list_level(context, ResourceLevel::Patient).await
}

/// 检查列表处理器
pub async fn list_studies(
    State(context): State<Arc<ServerContext>>,
) -> ApiResult<impl IntoResponse> {
    list_level(context, ResourceLevel::Study).await
}

/// 系列列表处理器
pub async fn list_series(
    State(context): State<Arc<ServerContext>>,
) -> ApiResult<impl IntoResponse> {
    list_level(context, ResourceLevel::Series).await
}

/// 实例列表处理器
pub async fn list_instances(
    State(context): State<Arc<ServerContext>>,
) -> ApiResult<impl IntoResponse> {
    list_level(context, ResourceLevel::Instance).await
}

async fn get_resource(
    context: Arc<ServerContext>,
    public_id: &str,
    level: ResourceLevel,
) -> ApiResult<Response> {
    let snapshot = context.get_resource(public_id, level).await?;
    Ok(Json(snapshot).into_response())
}

async fn delete_resource(
    context: Arc<ServerContext>,
    public_id: &str,
    level: ResourceLevel,
) -> ApiResult<Response> {
    let report = context.delete(public_id, level).await?;
    Ok(Json(report).into_response())
}

/// 患者详情处理器
pub async fn get_patient(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    get_resource(context, &id, ResourceLevel::Patient).await
}

/// 检查详情处理器
pub async fn get_study(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    get_resource(context, &id, ResourceLevel::Study).await
}

/// 系列详情处理器
pub async fn get_series(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    get_resource(context, &id, ResourceLevel::Series).await
}

/// 实例详情处理器
pub async fn get_instance(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    get_resource(context, &id, ResourceLevel::Instance).await
}

/// 患者删除处理器
pub async fn delete_patient(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    delete_resource(context, &id, ResourceLevel::Patient).await
}

/// 检查删除处理器
pub async fn delete_study(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    delete_resource(context, &id, ResourceLevel::Study).await
}

/// 系列删除处理器
pub async fn delete_series(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    delete_resource(context, &id, ResourceLevel::Series).await
}

/// 实例删除处理器
pub async fn delete_instance(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    delete_resource(context, &id, ResourceLevel::Instance).await
}

/// 患者保护状态查询处理器
pub async fn get_protected(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(json!({ "protected": context.is_protected(&id).await? })))
}

/// 患者保护状态设置处理器
pub async fn set_protected(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
    Json(protected): Json<bool>,
) -> ApiResult<impl IntoResponse> {
    context.set_protected(&id, protected).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 实例原始DICOM文件下载处理器
pub async fn get_instance_file(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let bytes = context.read_attachment(&id, ContentType::Dicom).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/dicom")],
        bytes,
    )
        .into_response())
}

/// 实例标签摘要处理器
pub async fn get_instance_tags(
    State(context): State<Arc<ServerContext>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let bytes = context
        .read_attachment(&id, ContentType::DicomAsJson)
        .await?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).map_err(StoreError::from)?;
    Ok(Json(value).into_response())
}

/// 日志分页参数
#[derive(Debug, Deserialize)]
pub struct LogParams {
    #[serde(default)]
    pub since: i64,
    #[serde(default = "default_log_limit")]
    pub limit: u32,
}

fn default_log_limit() -> u32 {
    100
}

/// 变更日志处理器
pub async fn get_changes(
    State(context): State<Arc<ServerContext>>,
    Query(params): Query<LogParams>,
) -> ApiResult<impl IntoResponse> {
    let (changes, done) = context.changes_since(params.since, params.limit).await?;
    Ok(Json(json!({ "changes": changes, "done": done })))
}

/// 转发日志处理器
pub async fn get_exports(
    State(context): State<Arc<ServerContext>>,
    Query(params): Query<LogParams>,
) -> ApiResult<impl IntoResponse> {
    let (exports, done) = context.exported_since(params.since, params.limit).await?;
    Ok(Json(json!({ "exports": exports, "done": done })))
}

/// 结构化查询处理器
pub async fn find(
    State(context): State<Arc<ServerContext>>,
    Json(query): Json<FindQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(context.find(&query).await?))
}

/// 孤儿附件清扫处理器
pub async fn reclaim(State(context): State<Arc<ServerContext>>) -> ApiResult<impl IntoResponse> {
    let removed = context.reclaim_orphans().await?;
    Ok(Json(json!({ "removed": removed })))
}
