//! Server-sent events: one-way delivery of broker frames for clients
//! that cannot hold a WebSocket. The stream opens with the subscription
//! snapshot, then carries the same outbound frames a socket subscriber
//! would see. Cleanup relies on the hub's silence sweep once the client
//! goes away.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use easygrid_broker::{action, Frame, Hub};
use easygrid_core::ConnectionId;

use crate::state::AppState;

#[derive(Deserialize)]
pub struct EventsQuery {
    /// Collection to subscribe in.
    pub c: String,
    /// Document id.
    pub d: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Drops the hub registration when the SSE stream is dropped.
struct DisconnectGuard {
    hub: Hub,
    conn: ConnectionId,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.hub.disconnect(&self.conn);
    }
}

pub async fn events_handler(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(err) = state.authorize_upgrade(&headers, query.token.as_deref()) {
        return err.into_response();
    }

    let hub = state.hub.clone();
    let (conn, data_rx, control_rx) = hub.connect();
    let _ = hub
        .handle_frame(
            &conn,
            Frame {
                a: action::HANDSHAKE.into(),
                ..Default::default()
            },
        )
        .await;
    let snapshot = hub
        .handle_frame(
            &conn,
            Frame {
                a: action::SUBSCRIBE.into(),
                c: Some(query.c),
                d: Some(query.d),
                ..Default::default()
            },
        )
        .await;

    let guard = DisconnectGuard {
        hub,
        conn,
    };
    let frames = stream::iter(snapshot)
        .chain(stream::select(
            ReceiverStream::new(data_rx),
            ReceiverStream::new(control_rx),
        ))
        .map(move |frame| {
            let _keepalive = &guard;
            Ok::<Event, Infallible>(to_event(&frame))
        });

    Sse::new(frames).keep_alive(KeepAlive::default()).into_response()
}

fn to_event(frame: &Frame) -> Event {
    let data = serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(frame.a.clone()).data(data)
}
