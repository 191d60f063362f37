use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wstether::prelude::*;

#[derive(Debug, Deserialize)]
struct ChatMessage {
    room: String,
    text: String,
}

async fn join_room(ctx: Context) -> Result<serde_json::Value> {
    let room = ctx
        .message
        .payload_str("room")
        .unwrap_or("lobby")
        .to_string();
    if !ctx.rooms().join(&room, &ctx.session)? {
        return Ok(json!({ "joined": false, "reason": "room is full" }));
    }
    ctx.broadcast_to_room(&room, "chat.joined", json!({ "session": ctx.session.id() }))?;
    Ok(json!({ "joined": true, "room": room, "members": ctx.rooms().get(&room).map(|r| r.member_count()) }))
}

async fn leave_room(ctx: Context) -> Result<serde_json::Value> {
    let room = ctx
        .message
        .payload_str("room")
        .unwrap_or("lobby")
        .to_string();
    let left = ctx.rooms().leave(&room, &ctx.session);
    Ok(json!({ "left": left }))
}

async fn send_message(ctx: Context) -> Result<()> {
    let msg: ChatMessage = ctx.bind()?;
    println!("💬 [{}] {}", msg.room, msg.text);
    ctx.broadcast_to_room(
        &msg.room,
        "chat.message",
        json!({ "from": ctx.session.id(), "text": msg.text }),
    )?;
    Ok(())
}

async fn stats(ctx: Context) -> Result<serde_json::Value> {
    Ok(json!({
        "sessions": ctx.sessions().count(),
        "rooms": ctx.rooms().all_ids(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::new()
        .host("127.0.0.1")
        .port(9000)
        .path("/ws")
        .heartbeat_interval(Duration::from_secs(15))
        .heartbeat_timeout(Duration::from_secs(5))
        .session_suspend_timeout(Duration::from_secs(120));

    let metrics = Arc::new(AtomicMetrics::new());
    let server = Server::new(config).metrics(metrics.clone()).shared();

    server.layer(LoggerMiddleware::new());
    server.layer(RateLimitMiddleware::new(60, Duration::from_secs(10)));

    server.on("chat.join", handler(join_room));
    server.on("chat.leave", handler(leave_room));
    server.register(
        Registration::new("chat.message", handler(send_message)).schema(
            Schema::new()
                .field("room", |v| v.as_str().is_some_and(|s| !s.is_empty()))
                .field("text", |v| v.as_str().is_some_and(|s| !s.is_empty())),
        ),
    );
    server.on("chat.stats", handler(stats));

    println!("💬 Chat server running on ws://127.0.0.1:9000/ws");
    println!("   Join:    {{ \"e\": \"chat.join\", \"p\": {{ \"room\": \"lobby\" }} }}");
    println!("   Message: {{ \"e\": \"chat.message\", \"p\": {{ \"room\": \"lobby\", \"text\": \"hi\" }} }}");
    println!("   Drop the socket and send sys.reconnect.request to pick the session back up.");

    server.listen().await
}
