//! The WebSocket endpoint.
//!
//! One path, JSON text frames, bearer token in the `Authorization` header
//! or the `token` query parameter. The connection task pumps frames both
//! ways and awaits each inbound frame's handling before reading the next,
//! which is what makes per-connection arrival order the submission order.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use easygrid_broker::Frame;
use easygrid_core::Error;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct SocketQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn socket_handler(
    State(state): State<AppState>,
    Query(query): Query<SocketQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(err) = state.authorize_upgrade(&headers, query.token.as_deref()) {
        return err.into_response();
    }
    ws.on_upgrade(move |socket| connection_loop(state, socket))
}

async fn connection_loop(state: AppState, socket: WebSocket) {
    let hub = state.hub.clone();
    let (conn, mut data_rx, mut control_rx) = hub.connect();
    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(hub.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => hub.handle_frame(&conn, frame).await,
                            Err(err) => Some(Frame::error(
                                "op",
                                &Error::operation_invalid(format!("malformed frame: {}", err)),
                            )),
                        };
                        if let Some(reply) = reply {
                            if send_frame(&mut sink, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => hub.touch(&conn),
                    Some(Ok(Message::Ping(payload))) => {
                        hub.touch(&conn);
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
            frame = data_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = control_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if send_frame(&mut sink, &frame).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }
    hub.disconnect(&conn);
}

async fn send_frame(
    sink: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin),
    frame: &Frame,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(frame).map_err(axum::Error::new)?;
    sink.send(Message::Text(text)).await
}
