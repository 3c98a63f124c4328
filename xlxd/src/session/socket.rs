//! Pumps bytes between an upgraded websocket and a bound stream.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use super::{BoundStream, ControlMessage, SocketEnd, StdinChunk};

/// Drive `socket` until either side closes or the operation ends.
pub async fn splice(bound: BoundStream, socket: WebSocket) {
    let BoundStream {
        operation,
        stream,
        end,
        closed,
    } = bound;
    let (mut sink, mut incoming) = socket.split();

    match end {
        SocketEnd::Input(tx) => loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                msg = incoming.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if tx.send(StdinChunk::Data(data.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        if tx.send(StdinChunk::Data(text.as_str().as_bytes().to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        // A closed stdin socket means EOF, not kill
                        let _ = tx.send(StdinChunk::Eof).await;
                        break;
                    }
                },
            }
        },
        SocketEnd::Output(mut rx) => loop {
            tokio::select! {
                biased;
                chunk = rx.recv() => match chunk {
                    Some(data) => {
                        if sink.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                _ = closed.cancelled() => {
                    while let Ok(data) = rx.try_recv() {
                        if sink.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                msg = incoming.next() => {
                    if matches!(msg, Some(Ok(Message::Close(_))) | Some(Err(_)) | None) {
                        break;
                    }
                }
            }
        },
        SocketEnd::Control(tx) => loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                msg = incoming.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ControlMessage>(text.as_str()) {
                            Ok(control) => {
                                if tx.send(control).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!(operation = %operation, error = %e, "Ignoring malformed control message");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                },
            }
        },
    }

    let _ = sink.send(Message::Close(None)).await;
    debug!(operation = %operation, stream = %stream, "Websocket closed");
}
