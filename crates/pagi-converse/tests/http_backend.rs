//! HttpAgentBackend against a local axum stub of the agent API.

use axum::extract::{Multipart, Path};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use pagi_converse::{
    AgentBackend, ConverseConfig, ConverseError, HttpAgentBackend, PlanRequest, Role,
};
use serde_json::{json, Value};
use std::net::SocketAddr;

async fn plan(Json(body): Json<Value>) -> Json<Value> {
    let message = body["message"].as_str().unwrap_or_default();
    if message == "explode" {
        return Json(json!({ "unexpected": true }));
    }
    let audio_path = match body["isVoiceMode"].as_bool() {
        Some(true) => json!("/audio/reply.mp3"),
        _ => Value::Null,
    };
    Json(json!({
        "answer": format!("echo: {}", message),
        "conversation": { "id": body["conversationId"].as_str().unwrap_or("c42") },
        "audioPath": audio_path,
    }))
}

async fn upload(mut multipart: Multipart) -> Result<Json<Value>, StatusCode> {
    while let Some(field) = multipart.next_field().await.map_err(|_| StatusCode::BAD_REQUEST)? {
        if field.name() != Some("image") {
            continue;
        }
        let mime = field.content_type().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
        return Ok(Json(json!({
            "id": "img-1",
            "artifactId": format!("art-{}", bytes.len()),
            "imageUrl": format!("/uploads/img-1?type={}", mime),
        })));
    }
    Err(StatusCode::BAD_REQUEST)
}

async fn conversation(Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    if id == "missing" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!([
        { "id": "m1", "role": "user", "content": format!("history of {}", id), "createdAt": "2024-05-01T10:00:00Z", "conversationId": id },
        { "id": "m2", "role": "assistant", "content": "hi!", "createdAt": "2024-05-01T10:00:02Z", "audioPath": "/audio/m2.mp3" }
    ])))
}

async fn serve() -> anyhow::Result<SocketAddr> {
    let app = Router::new()
        .route("/agent/plan", post(plan))
        .route("/agent/upload-image", post(upload))
        .route("/conversation/:id", get(conversation));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

fn backend(addr: SocketAddr) -> HttpAgentBackend {
    HttpAgentBackend::new(ConverseConfig {
        api_base_url: format!("http://{}", addr),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_plan_round_trip() -> anyhow::Result<()> {
    let backend = backend(serve().await?);

    let res = backend
        .plan(&PlanRequest {
            message: "plan my week".into(),
            conversation_id: None,
            artifact_id: None,
            is_voice_mode: Some(true),
        })
        .await?;
    assert_eq!(res.answer, "echo: plan my week");
    assert_eq!(res.resolved_conversation_id(), Some("c42"));
    assert_eq!(res.audio_path.as_deref(), Some("/audio/reply.mp3"));

    let res = backend
        .plan(&PlanRequest {
            message: "again".into(),
            conversation_id: Some("c7".into()),
            artifact_id: None,
            is_voice_mode: None,
        })
        .await?;
    assert_eq!(res.resolved_conversation_id(), Some("c7"));
    assert_eq!(res.audio_path, None);
    Ok(())
}

#[tokio::test]
async fn test_malformed_plan_reply_is_a_submission_failure() -> anyhow::Result<()> {
    let backend = backend(serve().await?);
    let err = backend
        .plan(&PlanRequest {
            message: "explode".into(),
            conversation_id: None,
            artifact_id: None,
            is_voice_mode: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ConverseError::SubmissionFailed(_)));
    Ok(())
}

#[tokio::test]
async fn test_image_upload_uses_image_field() -> anyhow::Result<()> {
    let backend = backend(serve().await?);
    let uploaded = backend
        .upload_image(vec![0u8; 32], "chart.png", "image/png")
        .await?;
    assert_eq!(uploaded.id, "img-1");
    assert_eq!(uploaded.artifact_id, "art-32");
    assert_eq!(uploaded.image_url, "/uploads/img-1?type=image/png");
    Ok(())
}

#[tokio::test]
async fn test_conversation_fetch() -> anyhow::Result<()> {
    let backend = backend(serve().await?);
    let turns = backend.fetch_conversation("c9").await?;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, Role::User);
    assert_eq!(turns[1].spoken_reply_ref.as_deref(), Some("/audio/m2.mp3"));

    let err = backend.fetch_conversation("missing").await.unwrap_err();
    assert!(matches!(err, ConverseError::Http(_)));
    Ok(())
}

#[tokio::test]
async fn test_conversation_id_is_sent_as_one_path_segment() -> anyhow::Result<()> {
    let backend = backend(serve().await?);
    let turns = backend.fetch_conversation("a/b?c#d").await?;
    assert_eq!(turns[0].text, "history of a/b?c#d");

    let turns = backend.fetch_conversation("c 9").await?;
    assert_eq!(turns[0].text, "history of c 9");
    Ok(())
}

#[tokio::test]
async fn test_unreachable_backend_fails_cleanly() {
    let backend = HttpAgentBackend::new(ConverseConfig {
        api_base_url: "http://127.0.0.1:9".to_string(),
        ..Default::default()
    });
    let err = backend
        .plan(&PlanRequest {
            message: "hello".into(),
            conversation_id: None,
            artifact_id: None,
            is_voice_mode: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ConverseError::SubmissionFailed(_)));
}
