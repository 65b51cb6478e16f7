//! REST服务启动

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use litepacs_core::config::HttpConfig;
use litepacs_core::{Result, StoreError};
use litepacs_engine::ServerContext;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers;

/// 构建完整的REST路由
pub fn build_router(context: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/", get(handlers::api_root))
        .route("/health", get(handlers::health))
        .route("/statistics", get(handlers::statistics))
        .route(
            "/instances",
            get(handlers::list_instances).post(handlers::store_instance),
        )
        .route("/patients", get(handlers::list_patients))
        .route("/studies", get(handlers::list_studies))
        .route("/series", get(handlers::list_series))
        .route(
            "/patients/:id",
            get(handlers::get_patient).delete(handlers::delete_patient),
        )
        .route(
            "/studies/:id",
            get(handlers::get_study).delete(handlers::delete_study),
        )
        .route(
            "/series/:id",
            get(handlers::get_series).delete(handlers::delete_series),
        )
        .route(
            "/instances/:id",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route(
            "/patients/:id/protected",
            get(handlers::get_protected).put(handlers::set_protected),
        )
        .route("/instances/:id/file", get(handlers::get_instance_file))
        .route("/instances/:id/tags", get(handlers::get_instance_tags))
        .route("/changes", get(handlers::get_changes))
        .route("/exports", get(handlers::get_exports))
        .route("/tools/find", post(handlers::find))
        .route("/tools/reclaim", post(handlers::reclaim))
        .layer(TraceLayer::new_for_http())
        .with_state(context)
}

/// 启动REST服务并一直运行
pub async fn serve(context: Arc<ServerContext>, config: &HttpConfig) -> Result<()> {
    let address = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("REST API listening on {}", address);

    axum::serve(listener, build_router(context))
        .await
        .map_err(|e| StoreError::Internal(format!("HTTP服务异常退出: {}", e)))?;
    Ok(())
}
