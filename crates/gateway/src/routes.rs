//! HTTP surface, one route group per instance under `/api/{instance_id}`.

use std::time::Duration;

use {
    axum::{
        Json, Router,
        extract::{DefaultBodyLimit, Path, State, rejection::JsonRejection},
        routing::{get, post},
    },
    serde::Deserialize,
    serde_json::{Value, json},
    tower_http::{
        cors::{Any, CorsLayer},
        trace::TraceLayer,
    },
    tracing::info,
    wagate_whatsapp::{Jid, SessionStatus},
};

use crate::{
    error::{ApiError, ApiResult},
    media::DataUrl,
    qr,
    state::AppState,
};

/// Base64 media bodies are large; the axum default is 2 MiB.
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/chat/messages", post(chat_messages))
        .route("/chat/send/text", post(send_text))
        .route("/chat/send/image", post(send_image))
        .route("/chat/send/audio", post(send_audio))
        .route("/check/phones", post(check_phones))
        .route("/contact/info", post(contact_info))
        .route("/logout", post(logout))
        .route("/profile", get(profile))
        .route("/qrcode", get(qrcode))
        .route("/status", get(status));

    Router::new()
        .route("/health", get(health))
        .nest("/api/{instance_id}", api)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    Ok(payload?.0)
}

// ── Request bodies ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct PhoneBody {
    #[serde(alias = "Phone")]
    phone: String,
}

#[derive(Deserialize)]
struct TextBody {
    #[serde(alias = "Phone")]
    phone: String,
    #[serde(alias = "Text")]
    text: String,
}

#[derive(Deserialize)]
struct MediaBody {
    #[serde(alias = "Phone")]
    phone: String,
    #[serde(alias = "Base64")]
    base64: String,
    #[serde(default, alias = "Caption")]
    caption: Option<String>,
}

#[derive(Deserialize)]
struct PhonesBody {
    #[serde(alias = "Phones")]
    phones: Vec<String>,
}

// ── Handlers ────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instances": state.registry.len().await,
    }))
}

async fn chat_messages(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    payload: Result<Json<PhoneBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = body(payload)?;
    let chat = Jid::from_phone(&req.phone)?;
    state.registry.get_authenticated(&instance_id).await?;
    let messages = state
        .registry
        .deps()
        .messages
        .list_chat(&instance_id, &chat.user)
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

async fn send_text(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    payload: Result<Json<TextBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = body(payload)?;
    let to = Jid::from_phone(&req.phone)?;
    let message = state
        .outbound
        .send_text(&instance_id, &to, &req.text)
        .await?;
    Ok(Json(json!({ "message": message })))
}

async fn send_image(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    payload: Result<Json<MediaBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = body(payload)?;
    let to = Jid::from_phone(&req.phone)?;
    let media = DataUrl::parse(&req.base64)?;
    if !media.mime_type.starts_with("image/") {
        return Err(ApiError::BadRequest(format!(
            "expected an image, got {}",
            media.mime_type
        )));
    }
    let message = state
        .outbound
        .send_image(
            &instance_id,
            &to,
            &media.data,
            &media.mime_type,
            req.caption.as_deref(),
        )
        .await?;
    Ok(Json(json!({ "message": message })))
}

async fn send_audio(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    payload: Result<Json<MediaBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = body(payload)?;
    let to = Jid::from_phone(&req.phone)?;
    let media = DataUrl::parse(&req.base64)?;
    if !media.mime_type.starts_with("audio/") {
        return Err(ApiError::BadRequest(format!(
            "expected audio, got {}",
            media.mime_type
        )));
    }
    let message = state
        .outbound
        .send_audio(&instance_id, &to, &media.data, &media.mime_type)
        .await?;
    Ok(Json(json!({ "message": message })))
}

async fn check_phones(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    payload: Result<Json<PhonesBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = body(payload)?;
    if req.phones.is_empty() {
        return Err(ApiError::BadRequest("phones must not be empty".into()));
    }
    let session = state.registry.get_authenticated(&instance_id).await?;
    let phones = session.check_phones(&req.phones).await?;
    Ok(Json(json!({ "phones": phones })))
}

async fn contact_info(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
    payload: Result<Json<PhoneBody>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let req = body(payload)?;
    let jid = Jid::from_phone(&req.phone)?;
    let session = state.registry.get_authenticated(&instance_id).await?;
    let info = session.contact_info(&jid).await?;
    Ok(Json(json!({ "info": info })))
}

async fn logout(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.registry.remove(&instance_id).await?;
    info!(instance_id, "instance logged out via api");
    Ok(Json(json!({ "status": SessionStatus::LoggedOut })))
}

async fn profile(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.registry.get_authenticated(&instance_id).await?;
    let own = session
        .own_id()
        .await
        .ok_or_else(|| wagate_whatsapp::Error::NotAuthenticated(instance_id.clone()))?;
    let info = session.contact_info(&own).await?;
    Ok(Json(json!({
        "profile": {
            "instanceId": instance_id,
            "ownId": own.user,
            "name": info.name,
            "status": info.status,
            "pictureUrl": info.picture_url,
        }
    })))
}

async fn qrcode(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.registry.get_or_create(&instance_id).await?;

    // A new session reports its first code shortly after connecting.
    let deadline = tokio::time::Instant::now() + state.qr_wait;
    while session.status().await == SessionStatus::Disconnected
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let code = session.current_qr().await?;
    let image = qr::png_data_url(&code)?;
    Ok(Json(json!({ "qrcode": image, "code": code })))
}

async fn status(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let status = match state.registry.get(&instance_id).await {
        Some(session) => session.status().await,
        None => SessionStatus::Disconnected,
    };
    let paired = state
        .registry
        .deps()
        .accounts
        .get(&instance_id)
        .await?
        .is_some();
    Ok(Json(json!({
        "instanceId": instance_id,
        "status": status,
        "paired": paired,
    })))
}
