//! Websocket subscriptions for quote and proof state changes, speaking the
//! json-rpc framing of [Nut-17](https://github.com/cashubtc/nuts/blob/main/17.md).

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::mint::Mint;
use crate::pubsub::{
    NotificationPayload, Topic, MAX_FILTERS_PER_SUBSCRIPTION, MAX_SUBSCRIPTIONS_PER_CONNECTION,
};

#[derive(Debug, Deserialize)]
struct WsRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct SubscribeParams {
    kind: Topic,
    #[serde(rename = "subId")]
    sub_id: String,
    #[serde(default)]
    filters: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct UnsubscribeParams {
    #[serde(rename = "subId")]
    sub_id: String,
}

#[derive(Debug, Serialize)]
struct WsNotification<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: WsNotificationParams<'a>,
}

#[derive(Debug, Serialize)]
struct WsNotificationParams<'a> {
    #[serde(rename = "subId")]
    sub_id: &'a str,
    payload: &'a NotificationPayload,
}

pub async fn get_ws(State(mint): State<Mint>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(mint, socket))
}

fn result_frame(id: &Value, sub_id: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {"status": "OK", "subId": sub_id},
    })
    .to_string()
}

fn error_frame(id: &Value, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": -32000, "message": message},
    })
    .to_string()
}

async fn handle_socket(mint: Mint, mut socket: WebSocket) {
    let (outbound, mut outbound_rx) = mpsc::channel::<String>(64);
    let mut subscriptions: HashMap<String, JoinHandle<()>> = HashMap::new();

    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                let Some(Ok(message)) = incoming else { break };
                let Message::Text(text) = message else { continue };
                let Ok(request) = serde_json::from_str::<WsRequest>(&text) else {
                    let _ = socket
                        .send(Message::Text(error_frame(&Value::Null, "invalid request")))
                        .await;
                    continue;
                };

                let reply = handle_request(&mint, &outbound, &mut subscriptions, request).await;
                if socket.send(Message::Text(reply)).await.is_err() {
                    break;
                }
            }
        }
    }

    for (_, handle) in subscriptions {
        handle.abort();
    }
}

async fn handle_request(
    mint: &Mint,
    outbound: &mpsc::Sender<String>,
    subscriptions: &mut HashMap<String, JoinHandle<()>>,
    request: WsRequest,
) -> String {
    match request.method.as_str() {
        "subscribe" => {
            let params: SubscribeParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(_) => return error_frame(&request.id, "invalid subscribe params"),
            };
            if subscriptions.len() >= MAX_SUBSCRIPTIONS_PER_CONNECTION {
                return error_frame(&request.id, "too many subscriptions");
            }
            if params.filters.len() > MAX_FILTERS_PER_SUBSCRIPTION {
                return error_frame(&request.id, "too many filters");
            }
            if subscriptions.contains_key(&params.sub_id) {
                return error_frame(&request.id, "subId already in use");
            }

            let mut events = mint.pubsub.subscribe(params.kind);
            let sub_id = params.sub_id.clone();
            let filters = params.filters;
            let outbound = outbound.clone();
            let handle = tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(payload) => {
                            if !filters.is_empty()
                                && !filters.iter().any(|filter| filter == payload.filter_key())
                            {
                                continue;
                            }
                            let frame = WsNotification {
                                jsonrpc: "2.0",
                                method: "subscribe",
                                params: WsNotificationParams {
                                    sub_id: &sub_id,
                                    payload: &payload,
                                },
                            };
                            let Ok(frame) = serde_json::to_string(&frame) else {
                                continue;
                            };
                            if outbound.send(frame).await.is_err() {
                                return;
                            }
                        }
                        // a lagging subscriber drops old events instead of
                        // blocking the publisher
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(count)) => {
                            debug!("subscriber lagged, dropped {count} events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            });
            subscriptions.insert(params.sub_id.clone(), handle);
            result_frame(&request.id, &params.sub_id)
        }
        "unsubscribe" => {
            let params: UnsubscribeParams = match serde_json::from_value(request.params) {
                Ok(params) => params,
                Err(_) => return error_frame(&request.id, "invalid unsubscribe params"),
            };
            match subscriptions.remove(&params.sub_id) {
                Some(handle) => {
                    handle.abort();
                    result_frame(&request.id, &params.sub_id)
                }
                None => error_frame(&request.id, "unknown subId"),
            }
        }
        _ => error_frame(&request.id, "unknown method"),
    }
}
