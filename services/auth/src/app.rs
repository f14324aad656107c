//! Auth 应用装配：配置、路由、CORS、会话清理与监听。

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    http::{
        Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    routing::{get, post},
};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::{
    auth::{
        engine::AuthEngine,
        handlers::{
            change_password_handler, login_handler, logout_handler, me_handler, refresh_handler,
            set_status_handler, signup_handler, validate_handler,
        },
    },
    config::Config,
    state::AppState,
};

/// Auth 入口：装配状态并启动 HTTP 路由。
pub(crate) async fn run() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let state = AppState::build(&config).await?;
    let sweeper = spawn_session_sweeper(state.engine.clone(), config.sweep_interval);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    info!("auth-service listening on {}", config.addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    sweeper.abort();
    info!("auth-service stopped");
    Ok(())
}

/// 路由表。
pub(crate) fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);

    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/signup", post(signup_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/validate", get(validate_handler))
        .route("/users/me", get(me_handler))
        .route("/users/me/password", post(change_password_handler))
        .route("/admin/users/{id}/status", post(set_status_handler))
        .layer(cors)
        .with_state(state)
}

/// 健康检查接口。
async fn healthz() -> &'static str {
    "ok"
}

/// 定期清理过期会话索引。
fn spawn_session_sweeper(engine: Arc<AuthEngine>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // 首个 tick 立即返回，跳过启动时的清理。
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match engine.sweep_sessions().await {
                Ok(0) => {}
                Ok(removed) => debug!("session sweep removed {removed} entries"),
                Err(err) => warn!("session sweep failed: {err}"),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("listen for shutdown signal failed: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::{Value, json};

    use super::router;
    use crate::state::AppState;

    /// 在随机端口启动路由，返回基地址。
    async fn serve(state: AppState) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let base = serve(AppState::for_tests()).await;
        let response = reqwest::get(format!("{base}/healthz")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn signup_login_refresh_flow() {
        let base = serve(AppState::for_tests()).await;
        let client = reqwest::Client::new();

        let signup = client
            .post(format!("{base}/auth/signup"))
            .json(&json!({"email": "bob@example.com", "password": "hunter2-hunter2", "nickname": "Bob"}))
            .send()
            .await
            .unwrap();
        assert_eq!(signup.status(), StatusCode::OK);

        let duplicate = client
            .post(format!("{base}/auth/signup"))
            .json(&json!({"email": "BOB@example.com", "password": "hunter2-hunter2", "nickname": "Bob"}))
            .send()
            .await
            .unwrap();
        assert_eq!(duplicate.status(), StatusCode::CONFLICT);

        let login = client
            .post(format!("{base}/auth/login"))
            .json(&json!({"username": "bob@example.com", "password": "hunter2-hunter2"}))
            .send()
            .await
            .unwrap();
        assert_eq!(login.status(), StatusCode::OK);
        let body: Value = login.json().await.unwrap();
        assert_eq!(body["ok"], true);
        let refresh_token = body["data"]["refreshToken"].as_str().unwrap().to_string();

        let refreshed = client
            .post(format!("{base}/auth/refresh"))
            .json(&json!({"refreshToken": refresh_token}))
            .send()
            .await
            .unwrap();
        assert_eq!(refreshed.status(), StatusCode::OK);

        let replayed = client
            .post(format!("{base}/auth/refresh"))
            .json(&json!({"refreshToken": refresh_token}))
            .send()
            .await
            .unwrap();
        assert_eq!(replayed.status(), StatusCode::UNAUTHORIZED);
        let body: Value = replayed.json().await.unwrap();
        assert_eq!(body["code"], "UNAUTHENTICATED");
    }

    #[tokio::test]
    async fn admin_route_requires_admin_role() {
        let state = AppState::for_tests();
        state
            .engine
            .signup("carol@example.com", "hunter2-hunter2", "Carol")
            .await
            .unwrap();
        let issued = state
            .engine
            .login("carol@example.com", "hunter2-hunter2")
            .await
            .unwrap();
        let base = serve(state).await;

        let response = reqwest::Client::new()
            .post(format!(
                "{base}/admin/users/{}/status",
                issued.access_claims.sub
            ))
            .bearer_auth(&issued.access_token)
            .json(&json!({"status": "LOCKED"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }
}
