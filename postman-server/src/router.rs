use crate::subsystems::orchestrator::{Orchestrator, SessionError};
use crate::subsystems::poll::SessionDefaults;
use postman_core::ipc::{PostmanRequest, PostmanResponse};
use postman_core::Session;

/// Everything a control request may touch.
#[derive(Clone)]
pub struct ControlState {
    pub orchestrator: Orchestrator,
    pub defaults: SessionDefaults,
}

pub async fn handle_request(request: PostmanRequest, state: &ControlState) -> PostmanResponse {
    let orchestrator = &state.orchestrator;
    match request {
        PostmanRequest::Ping => PostmanResponse::pong(),
        PostmanRequest::Health => handle_health(orchestrator).await,
        PostmanRequest::ListSessions => match orchestrator.list_active().await {
            Ok(sessions) => PostmanResponse::ok(serde_json::json!({
                "count": sessions.len(),
                "sessions": sessions,
            })),
            Err(e) => error_response(e),
        },
        PostmanRequest::GetSession { id } => match get_session_with_pending(orchestrator, &id).await {
            Ok((session, pending)) => PostmanResponse::ok(serde_json::json!({
                "session": session,
                "pending_inbox": pending,
            })),
            Err(e) => error_response(e),
        },
        PostmanRequest::EndSession { id } => match orchestrator.end(&id).await {
            Ok(()) => PostmanResponse::ok(serde_json::json!({ "ended": true, "id": id })),
            Err(e) => error_response(e),
        },
        PostmanRequest::DeliverNext { id } => match orchestrator.deliver_next(&id).await {
            Ok(Some(msg)) => PostmanResponse::ok(serde_json::json!({
                "delivered": true,
                "message_id": msg.id,
            })),
            Ok(None) => PostmanResponse::ok(serde_json::json!({ "delivered": false })),
            Err(e) => error_response(e),
        },
        PostmanRequest::CreateSession {
            working_dir,
            model,
            prompt,
        } => {
            if prompt.trim().is_empty() {
                return PostmanResponse::err("prompt must not be empty");
            }
            let working_dir = working_dir
                .map(|d| shellexpand::tilde(&d).into_owned())
                .unwrap_or_else(|| state.defaults.working_dir.clone());
            let model = model.unwrap_or_else(|| state.defaults.model.clone());
            match orchestrator.create(&working_dir, &model, &prompt).await {
                Ok(session) => PostmanResponse::ok(serde_json::json!({
                    "created": true,
                    "id": session.id,
                    "runner_handle": session.runner_handle,
                })),
                Err(e) => error_response(e),
            }
        }
    }
}

async fn get_session_with_pending(orchestrator: &Orchestrator, id: &str) -> Result<(Session, i64), SessionError> {
    let session = orchestrator.get(id).await?;
    let pending = orchestrator.store().count_pending_inbox(id).await?;
    Ok((session, pending))
}

async fn handle_health(orchestrator: &Orchestrator) -> PostmanResponse {
    let store = orchestrator.store();
    let sqlite_ver = match postman_core::db::health_check(store.pool()).await {
        Ok(v) => v,
        Err(e) => return PostmanResponse::err(format!("DB Health Check failed: {}", e)),
    };
    let schema = match postman_core::db::schema_version(store.pool()).await {
        Ok(v) => v,
        Err(e) => return PostmanResponse::err(format!("Schema check failed: {}", e)),
    };
    let live = match orchestrator.list_active().await {
        Ok(s) => s.len(),
        Err(e) => return PostmanResponse::err(e.to_string()),
    };
    let deliverable = match store.list_deliverable_outbox().await {
        Ok(rows) => rows.len(),
        Err(e) => return PostmanResponse::err(format!("Outbox check failed: {}", e)),
    };
    PostmanResponse::ok(serde_json::json!({
        "sqlite": sqlite_ver,
        "schema_version": schema,
        "live_sessions": live,
        "deliverable_outbox": deliverable,
        "status": "healthy"
    }))
}

fn error_response(e: SessionError) -> PostmanResponse {
    match &e {
        SessionError::Store(_) | SessionError::Io(_) | SessionError::Terminal(_) => {
            tracing::error!("Control request failed: {}", e);
        }
        _ => tracing::debug!("Control request rejected: {}", e),
    }
    PostmanResponse::err(e.to_string())
}
