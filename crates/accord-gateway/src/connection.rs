use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use accord_types::AccountId;
use accord_types::events::{GatewayCommand, RelayEvent};
use accord_types::models::AccountSnapshot;

use crate::dispatcher::{Dispatcher, Topic};

/// Server sends a Ping every 15 seconds; two missed Pongs drop the socket.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const IDENTIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Produces the authoritative state a client resynchronises from.
pub trait SnapshotSource: Send + Sync + 'static {
    fn snapshot(&self, account: AccountId) -> BoxFuture<'static, Option<AccountSnapshot>>;
}

/// Handle a socket whose token was already validated at the HTTP upgrade.
pub async fn handle_connection_authenticated(
    socket: WebSocket,
    dispatcher: Dispatcher,
    source: Arc<dyn SnapshotSource>,
    account_id: AccountId,
    username: String,
) {
    info!("{} ({}) connected to gateway (pre-authenticated)", username, account_id);
    let (sender, receiver) = socket.split();
    run_connection_loop(sender, receiver, dispatcher, source, account_id, username).await;
}

/// Handle a socket that must identify with a token in its first frame.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    source: Arc<dyn SnapshotSource>,
    jwt_secret: String,
) {
    let (sender, mut receiver) = socket.split();

    let Some((account_id, username)) = wait_for_identify(&mut receiver, &jwt_secret).await else {
        warn!("WebSocket client failed to identify, closing");
        return;
    };

    info!("{} ({}) connected to gateway", username, account_id);
    run_connection_loop(sender, receiver, dispatcher, source, account_id, username).await;
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    dispatcher: Dispatcher,
    source: Arc<dyn SnapshotSource>,
    account_id: AccountId,
    username: String,
) {
    // Subscribe before the snapshot so nothing published in between is lost.
    let mut subscription = dispatcher.receiver(Topic::Account(account_id.clone()));

    if !send_snapshot(&mut sender, source.as_ref(), &account_id).await {
        return;
    }

    let (resync_tx, mut resync_rx) = tokio::sync::mpsc::channel::<()>(4);

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received;

    let send_source = source.clone();
    let send_account = account_id.clone();
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = subscription.recv() => {
                    let Some(event) = event else { break };
                    if !send_event(&mut sender, &event).await {
                        break;
                    }
                }
                request = resync_rx.recv() => {
                    if request.is_none() {
                        break;
                    }
                    if !send_snapshot(&mut sender, send_source.as_ref(), &send_account).await {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let recv_account = account_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(GatewayCommand::Resync) => {
                        debug!("{} requested resync", recv_account);
                        if resync_tx.send(()).await.is_err() {
                            break;
                        }
                    }
                    Ok(GatewayCommand::Identify { .. }) => {}
                    Err(e) => {
                        warn!("{} bad command: {} -- raw: {}", recv_account, e, preview(&text));
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} ({}) disconnected from gateway", username, account_id);
}

async fn send_event(sender: &mut SplitSink<WebSocket, Message>, event: &RelayEvent) -> bool {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            warn!("Skipping unserializable {} event: {}", event.kind(), e);
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

/// A missing snapshot (store down, account gone) is skipped, not fatal:
/// the client polls again on its own schedule.
async fn send_snapshot(
    sender: &mut SplitSink<WebSocket, Message>,
    source: &dyn SnapshotSource,
    account: &AccountId,
) -> bool {
    match source.snapshot(account.clone()).await {
        Some(snapshot) => send_event(sender, &RelayEvent::Snapshot { snapshot }).await,
        None => {
            warn!("No snapshot available for {}", account);
            true
        }
    }
}

async fn wait_for_identify(
    receiver: &mut SplitStream<WebSocket>,
    jwt_secret: &str,
) -> Option<(AccountId, String)> {
    let identify = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if let Message::Text(text) = msg {
                if let Ok(GatewayCommand::Identify { token }) =
                    serde_json::from_str::<GatewayCommand>(&text)
                {
                    return decode_token(&token, jwt_secret);
                }
            }
        }
        None
    };

    tokio::time::timeout(IDENTIFY_TIMEOUT, identify).await.ok().flatten()
}

/// First 200 characters of a client frame, for logs.
fn preview(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Validates an identity-provider token and returns the account it names.
pub fn decode_token(token: &str, jwt_secret: &str) -> Option<(AccountId, String)> {
    use accord_types::api::Claims;
    use jsonwebtoken::{DecodingKey, Validation, decode};

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;

    if data.claims.sub.is_blank() {
        return None;
    }
    Some((data.claims.sub, data.claims.username))
}
