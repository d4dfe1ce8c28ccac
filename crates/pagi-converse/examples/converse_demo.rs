//! Example: text conversation against the agent backend
//!
//! Reads lines from stdin and submits them as turns, printing replies,
//! thinking steps and navigation events as they arrive.
//!
//! ```bash
//! CONVERSE__API_BASE_URL=http://localhost:3000 cargo run -p pagi-converse --example converse_demo
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use pagi_converse::{
    ConverseConfig, ConverseError, ConverseEvent, ConverseResult, Conversation, CpalMicrophone,
    HttpAgentBackend, OpenedSession, RodioOutput, Role, SessionHandle, SessionRequest,
    VoiceTransport,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// This demo has no realtime voice provider wired in.
struct NoVoiceTransport;

#[async_trait]
impl VoiceTransport for NoVoiceTransport {
    async fn start(&self, _request: &SessionRequest) -> ConverseResult<OpenedSession> {
        Err(ConverseError::SessionStartFailed(
            "no voice provider configured for the demo".to_string(),
        ))
    }

    async fn end(&self, _handle: &SessionHandle) -> ConverseResult<()> {
        Ok(())
    }

    fn send_frame(&self, _handle: &SessionHandle, _frame: &[i16]) -> ConverseResult<()> {
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ConverseConfig::load()?;
    info!("💬 PAGI Converse demo");
    info!("   Backend: {}", config.api_base_url);

    let output = RodioOutput::new()?;
    let conversation = Conversation::new(
        config.clone(),
        Arc::new(HttpAgentBackend::new(config)),
        Arc::new(NoVoiceTransport),
        Arc::new(CpalMicrophone),
        Arc::new(output),
    );

    match conversation.connect_realtime().await {
        Ok(true) => info!("📡 Realtime events enabled"),
        Ok(false) => {}
        Err(e) => warn!("Realtime feed unavailable: {}", e),
    }

    let mut events = conversation.event_stream();
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                Ok(ConverseEvent::TurnAppended(turn)) if turn.role == Role::Assistant => {
                    println!("\n🤖 {}\n", turn.text);
                }
                Ok(ConverseEvent::ThinkingStep { step, .. }) => println!("   … {}", step),
                Ok(ConverseEvent::Navigate { conversation_id }) => {
                    println!("   (conversation {})", conversation_id)
                }
                Ok(ConverseEvent::Notice(message)) => println!("⚠️  {}", message),
                Ok(_) => {}
                Err(e) => warn!("Event stream lagged: {}", e),
            }
        }
    });

    println!("Type a message and press Enter (Ctrl+D to quit).");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match conversation.submit_text(&line).await {
            Ok(_) | Err(ConverseError::EmptyUtterance) => {}
            Err(e) => warn!("Send failed: {}", e),
        }
    }

    conversation.shutdown().await;
    Ok(())
}
