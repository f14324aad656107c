//! 鉴权 HTTP 路由处理函数。

use auth_shared_protocol::{
    ChangePasswordRequest, LoginRequest, LogoutRequest, RefreshRequest, RevokedSessionsPayload,
    SetStatusRequest, SignupRequest, UserPayload,
};
use axum::{
    Json,
    extract::{Path, State},
    http::{
        HeaderMap, HeaderName, StatusCode,
        header::{AUTHORIZATION, CACHE_CONTROL, COOKIE, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::{
    api::{
        error::ApiError,
        response::{ApiEnvelope, ok_response},
        types::{
            ACCESS_COOKIE, USER_ID_HEADER, access_cookie, cleared_cookie, token_pair_payload,
            user_payload, validate_payload,
        },
    },
    auth::{
        credentials::{AccountStatus, Role},
        engine::IssuedTokens,
        error::AuthError,
        token::Claims,
    },
    state::AppState,
};

/// 注册接口。
pub(crate) async fn signup_handler(
    State(state): State<AppState>,
    Json(req): Json<SignupRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<UserPayload>>), ApiError> {
    let identity = state
        .engine
        .signup(&req.email, &req.password, &req.nickname)
        .await?;
    Ok(ok_response(
        StatusCode::OK,
        "注册成功",
        "请使用邮箱登录",
        Some(user_payload(&identity)),
    ))
}

/// 登录接口：返回令牌对并写入 access token cookie。
pub(crate) async fn login_handler(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Response, ApiError> {
    let issued = state.engine.login(&req.username, &req.password).await?;
    Ok(token_pair_response(&state, &issued, "登录成功"))
}

/// 刷新接口。
pub(crate) async fn refresh_handler(
    State(state): State<AppState>,
    Json(req): Json<RefreshRequest>,
) -> Result<Response, ApiError> {
    let issued = state.engine.refresh(&req.refresh_token).await?;
    Ok(token_pair_response(&state, &issued, "凭证刷新成功"))
}

/// 登出接口：吊销令牌及其配对令牌，并清除 cookie。
pub(crate) async fn logout_handler(
    State(state): State<AppState>,
    Json(req): Json<LogoutRequest>,
) -> Result<Response, ApiError> {
    state.engine.logout_token(&req.token).await?;
    Ok((
        StatusCode::NO_CONTENT,
        [(SET_COOKIE, cleared_cookie(state.cookie_secure))],
    )
        .into_response())
}

/// 令牌校验接口，供网关/下游服务调用。
pub(crate) async fn validate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let payload = validate_payload(&claims)?;
    let user_id = payload.user_id.to_string();
    let (status, body) = ok_response(StatusCode::OK, "令牌有效", "", Some(payload));
    Ok((
        status,
        [(HeaderName::from_static(USER_ID_HEADER), user_id)],
        body,
    )
        .into_response())
}

/// 当前用户资料。
pub(crate) async fn me_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let identity = state
        .engine
        .profile(claims.identity_id().map_err(AuthError::from)?)
        .await?;
    let (status, body) = ok_response(
        StatusCode::OK,
        "获取成功",
        "",
        Some(user_payload(&identity)),
    );
    Ok((status, [(CACHE_CONTROL, "no-store")], body).into_response())
}

/// 修改口令：成功后该账号所有会话失效。
pub(crate) async fn change_password_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChangePasswordRequest>,
) -> Result<Response, ApiError> {
    let claims = authenticate(&state, &headers).await?;
    let revoked_sessions = state
        .engine
        .change_password(
            claims.identity_id().map_err(AuthError::from)?,
            &req.current_password,
            &req.new_password,
        )
        .await?;
    let (status, body) = ok_response(
        StatusCode::OK,
        "密码已修改",
        "请使用新密码重新登录",
        Some(RevokedSessionsPayload { revoked_sessions }),
    );
    Ok((
        status,
        [(SET_COOKIE, cleared_cookie(state.cookie_secure))],
        body,
    )
        .into_response())
}

/// 管理员修改账号状态。
pub(crate) async fn set_status_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identity_id): Path<Uuid>,
    Json(req): Json<SetStatusRequest>,
) -> Result<(StatusCode, Json<ApiEnvelope<RevokedSessionsPayload>>), ApiError> {
    let claims = authenticate(&state, &headers).await?;
    if claims.role.as_deref() != Some(Role::Admin.as_str()) {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "FORBIDDEN",
            "无权执行该操作",
            "请使用管理员账号",
        ));
    }
    let Some(status) = AccountStatus::parse(&req.status) else {
        return Err(AuthError::InvalidRequest("status 仅支持 ACTIVE / LOCKED / DISABLED").into());
    };
    let revoked_sessions = state.engine.set_status(identity_id, status).await?;
    Ok(ok_response(
        StatusCode::OK,
        "账号状态已更新",
        "",
        Some(RevokedSessionsPayload { revoked_sessions }),
    ))
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Claims, ApiError> {
    let Some(token) = request_token(headers) else {
        return Err(AuthError::Malformed("missing bearer token".to_string()).into());
    };
    Ok(state.engine.validate(&token).await?)
}

fn token_pair_response(state: &AppState, issued: &IssuedTokens, message: &str) -> Response {
    let payload = token_pair_payload(issued);
    let cookie = access_cookie(
        &issued.access_token,
        payload.expires_in,
        state.cookie_secure,
    );
    let (status, body) = ok_response(
        StatusCode::OK,
        message,
        "access token 过期后请使用 refresh token 刷新",
        Some(payload),
    );
    (
        status,
        [
            (SET_COOKIE, cookie),
            (CACHE_CONTROL, "no-store".to_string()),
        ],
        body,
    )
        .into_response()
}

/// 取请求令牌：优先 `Authorization: Bearer`，其次 `token` cookie。
fn request_token(headers: &HeaderMap) -> Option<String> {
    if let Some(raw) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok())
        && let Some((scheme, token)) = raw.trim().split_once(' ')
        && scheme.eq_ignore_ascii_case("bearer")
        && !token.trim().is_empty()
    {
        return Some(token.trim().to_string());
    }

    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == ACCESS_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
