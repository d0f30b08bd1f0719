//! 数据载荷服务
//!
//! 每个请求：
//! - 按配置（direct / proxied）建立一条数据库连接
//! - 执行 `select tst, value from app.payload`
//! - 以纯文本逐行返回结果，结束后关闭连接

mod cloudsql;
mod connector;
mod handlers;
mod routes;
mod service;
mod state;

use anyhow::Context;
use axum::{middleware, Router};
use common::config::{load_dotenv, AppConfig};
use common::middleware::request_id::request_id_middleware;
use state::AppState;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

const SERVICE_NAME: &str = "payload-service";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 先加载 .env（若存在）
    load_dotenv();

    // 加载配置（启动时一次性校验）
    let config = AppConfig::load().context("加载配置失败")?;

    // 初始化日志追踪
    init_tracing(config.json_logs);

    // 创建应用状态
    let state = AppState::new(config.clone()).context("初始化应用状态失败")?;

    // 创建路由
    let app = create_router(state);

    // 启动服务
    let addr = config.bind_addr();
    info!(
        service = SERVICE_NAME,
        address = %addr,
        mode = config.connectivity.mode(),
        "启动服务"
    );

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("绑定地址失败: {}", addr))?;

    // 收到 Ctrl-C 后直接关闭监听并退出
    tokio::select! {
        result = axum::serve(listener, app) => result.context("服务运行失败")?,
        _ = tokio::signal::ctrl_c() => info!(service = SERVICE_NAME, "收到中断信号，关闭服务"),
    }

    Ok(())
}

fn init_tracing(json_logs: bool) {
    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

fn create_router(state: AppState) -> Router {
    routes::router()
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
