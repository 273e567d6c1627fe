use actix_web::{web, Error, HttpResponse};
use futures::StreamExt;
use log::{error, info, warn};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::models::conversation::{AskRequest, CreateThreadRequest};
use crate::models::response::{ErrorResponse, ThreadTurnsResponse};
use crate::services::error::GatewayError;
use crate::services::gateway::StreamChunk;
use crate::services::query_executor::ReadOnlyDatabase;
use crate::services::{ChatGateway, ChatStoreTrait, SettingsProviderTrait};

fn error_json(status: u16, message: impl Into<String>) -> ErrorResponse {
    ErrorResponse {
        error: message.into(),
        status_code: status,
    }
}

fn gateway_error_response(e: &GatewayError) -> HttpResponse {
    if e.is_configuration() {
        return HttpResponse::ServiceUnavailable().json(error_json(503, e.user_message()));
    }
    match e {
        GatewayError::ThreadNotFound(_) => HttpResponse::NotFound().json(error_json(404, e.user_message())),
        _ => HttpResponse::InternalServerError().json(error_json(500, e.user_message())),
    }
}

fn thread_not_found(thread_id: Uuid) -> HttpResponse {
    HttpResponse::NotFound().json(error_json(404, format!("Thread {} not found", thread_id)))
}

fn storage_error(e: anyhow::Error) -> HttpResponse {
    error!("❌ Chat store error: {:#}", e);
    HttpResponse::InternalServerError().json(error_json(500, "Failed to access chat history"))
}

fn sse_event(event: Option<&str>, payload: &Value) -> web::Bytes {
    let mut frame = String::new();
    if let Some(event) = event {
        frame.push_str(&format!("event: {}\n", event));
    }
    frame.push_str(&format!("data: {}\n\n", payload));
    web::Bytes::from(frame)
}

/// Create a thread for a user
pub async fn create_thread<S, C, D>(
    request: web::Json<CreateThreadRequest>,
    gateway: web::Data<ChatGateway<S, C, D>>,
) -> Result<HttpResponse, Error>
where
    S: ChatStoreTrait + Clone,
    C: SettingsProviderTrait,
    D: ReadOnlyDatabase,
{
    let request = request.into_inner();
    if request.user_id.trim().is_empty() {
        return Ok(HttpResponse::BadRequest().json(error_json(400, "user_id is required")));
    }

    match gateway.store().create_thread(request.user_id.trim(), request.title).await {
        Ok(thread) => {
            info!("🧵 Created thread {} for {}", thread.id, thread.user_id);
            Ok(HttpResponse::Created().json(thread))
        }
        Err(e) => Ok(storage_error(e)),
    }
}

/// A thread with its turns, oldest first
pub async fn get_turns<S, C, D>(
    path: web::Path<Uuid>,
    gateway: web::Data<ChatGateway<S, C, D>>,
) -> Result<HttpResponse, Error>
where
    S: ChatStoreTrait + Clone,
    C: SettingsProviderTrait,
    D: ReadOnlyDatabase,
{
    let thread_id = path.into_inner();
    let thread = match gateway.store().get_thread(thread_id).await {
        Ok(Some(thread)) => thread,
        Ok(None) => return Ok(thread_not_found(thread_id)),
        Err(e) => return Ok(storage_error(e)),
    };

    match gateway.store().list_turns(thread_id).await {
        Ok(turns) => Ok(HttpResponse::Ok().json(ThreadTurnsResponse { thread, turns })),
        Err(e) => Ok(storage_error(e)),
    }
}

pub async fn delete_thread<S, C, D>(
    path: web::Path<Uuid>,
    gateway: web::Data<ChatGateway<S, C, D>>,
) -> Result<HttpResponse, Error>
where
    S: ChatStoreTrait + Clone,
    C: SettingsProviderTrait,
    D: ReadOnlyDatabase,
{
    let thread_id = path.into_inner();
    match gateway.store().delete_thread(thread_id).await {
        Ok(true) => Ok(HttpResponse::NoContent().finish()),
        Ok(false) => Ok(thread_not_found(thread_id)),
        Err(e) => Ok(storage_error(e)),
    }
}

/// Remove every turn of a thread, keeping the thread
pub async fn clear_turns<S, C, D>(
    path: web::Path<Uuid>,
    gateway: web::Data<ChatGateway<S, C, D>>,
) -> Result<HttpResponse, Error>
where
    S: ChatStoreTrait + Clone,
    C: SettingsProviderTrait,
    D: ReadOnlyDatabase,
{
    let thread_id = path.into_inner();
    match gateway.store().get_thread(thread_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Ok(thread_not_found(thread_id)),
        Err(e) => return Ok(storage_error(e)),
    }
    match gateway.store().clear_turns(thread_id).await {
        Ok(()) => Ok(HttpResponse::NoContent().finish()),
        Err(e) => Ok(storage_error(e)),
    }
}

/// Answer a question and return the persisted assistant turn
pub async fn ask<S, C, D>(
    path: web::Path<Uuid>,
    request: web::Json<AskRequest>,
    gateway: web::Data<ChatGateway<S, C, D>>,
) -> Result<HttpResponse, Error>
where
    S: ChatStoreTrait + Clone,
    C: SettingsProviderTrait,
    D: ReadOnlyDatabase,
{
    let thread_id = path.into_inner();
    let question = request.into_inner().question;
    if question.trim().is_empty() {
        return Ok(HttpResponse::BadRequest().json(error_json(400, "question must not be empty")));
    }

    match gateway.ask(thread_id, &question).await {
        Ok(turn) => Ok(HttpResponse::Ok().json(turn)),
        Err(e) => {
            error!("❌ [thread {}] ask failed: {}", thread_id, e);
            Ok(gateway_error_response(&e))
        }
    }
}

/// Answer a question as Server-Sent Events: `data: {"delta": ...}` frames, then an
/// `event: done` frame carrying the persisted turn
pub async fn ask_stream<S, C, D>(
    path: web::Path<Uuid>,
    request: web::Json<AskRequest>,
    gateway: web::Data<ChatGateway<S, C, D>>,
) -> Result<HttpResponse, Error>
where
    S: ChatStoreTrait + Clone,
    C: SettingsProviderTrait,
    D: ReadOnlyDatabase,
{
    let thread_id = path.into_inner();
    let question = request.into_inner().question;
    if question.trim().is_empty() {
        return Ok(HttpResponse::BadRequest().json(error_json(400, "question must not be empty")));
    }

    let answer = match gateway.ask_stream(thread_id, &question).await {
        Ok(answer) => Some(answer),
        Err(e) if e.is_configuration() || matches!(e, GatewayError::ThreadNotFound(_)) => {
            return Ok(gateway_error_response(&e));
        }
        Err(e) => {
            warn!("⚠️ [thread {}] stream could not be opened, answering in one piece: {}", thread_id, e);
            None
        }
    };

    let gateway = gateway.clone();
    let events = async_stream::stream! {
        if let Some(mut answer) = answer {
            while let Some(item) = answer.next().await {
                match item {
                    Ok(StreamChunk::Delta(text)) => {
                        yield Ok::<_, Error>(sse_event(None, &json!({ "delta": text })));
                    }
                    Ok(StreamChunk::Done(turn)) => {
                        yield Ok(sse_event(Some("done"), &json!({ "turn": turn })));
                        return;
                    }
                    Err(e) => {
                        // nothing was persisted for the aborted stream
                        warn!("⚠️ [thread {}] stream aborted, answering in one piece: {}", thread_id, e);
                        break;
                    }
                }
            }
        }

        match gateway.ask(thread_id, &question).await {
            Ok(turn) => yield Ok(sse_event(Some("done"), &json!({ "turn": turn }))),
            Err(e) => {
                error!("❌ [thread {}] fallback ask failed: {}", thread_id, e);
                yield Ok(sse_event(Some("error"), &json!({ "error": e.user_message() })));
            }
        }
    };

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(("Cache-Control", "no-cache"))
        .streaming(events))
}
