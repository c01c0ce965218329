use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use reqwest::Url;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{RunnerError, RunnerStatusMessage};

pub(crate) type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Joins `path` onto the runner base url and attaches `params`.
pub fn runner_url(
    base: &str,
    path: &str,
    params: &[(&str, String)],
) -> Result<Url, RunnerError> {
    let mut url = Url::parse(base.trim()).map_err(|err| RunnerError::InvalidUrl {
        url: base.to_string(),
        reason: err.to_string(),
    })?;
    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(None);
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

/// Same as [`runner_url`] with the scheme switched to `ws`/`wss`.
pub fn websocket_url(
    base: &str,
    path: &str,
    params: &[(&str, String)],
) -> Result<Url, RunnerError> {
    let mut url = runner_url(base, path, params)?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(RunnerError::InvalidUrl {
                url: base.to_string(),
                reason: format!("unsupported scheme `{other}`"),
            })
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RunnerError::InvalidUrl {
            url: base.to_string(),
            reason: format!("cannot switch scheme to `{scheme}`"),
        })?;
    Ok(url)
}

/// Reads the next text payload. `None` means the peer closed normally.
async fn read_text_frame<S>(stream: &mut S) -> Option<Result<String, RunnerError>>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        let message = match stream.next().await {
            None | Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                return None
            }
            Some(Err(err)) => return Some(Err(err.into())),
            Some(Ok(message)) => message,
        };
        match message {
            Message::Text(text) => return Some(Ok(text)),
            Message::Binary(bytes) => return Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
            Message::Close(frame) => return close_outcome(frame),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        }
    }
}

fn close_outcome(frame: Option<CloseFrame<'_>>) -> Option<Result<String, RunnerError>> {
    match frame {
        Some(frame) if frame.code != CloseCode::Normal => Some(Err(RunnerError::AbnormalClose {
            code: u16::from(frame.code),
            reason: frame.reason.into_owned(),
        })),
        _ => None,
    }
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

/// Connection to the runner's task status endpoint.
pub struct StatusStream {
    socket: Socket,
}

impl StatusStream {
    pub(crate) fn new(socket: Socket) -> Self {
        Self { socket }
    }

    /// Splits the connection so the read half can move to its own task while
    /// the owner keeps the ability to close it.
    pub fn split(self) -> (StatusReader, SocketCloser) {
        let (sink, stream) = self.socket.split();
        (StatusReader { stream }, SocketCloser { sink })
    }
}

pub struct StatusReader {
    stream: SplitStream<Socket>,
}

impl StatusReader {
    pub async fn next_message(&mut self) -> Option<Result<RunnerStatusMessage, RunnerError>> {
        let text = match read_text_frame(&mut self.stream).await? {
            Ok(text) => text,
            Err(err) => return Some(Err(err)),
        };
        Some(serde_json::from_str(&text).map_err(RunnerError::from))
    }
}

pub struct SocketCloser {
    sink: SplitSink<Socket, Message>,
}

impl SocketCloser {
    /// Sends a normal-closure frame. Errors are ignored: the peer may already
    /// have gone away.
    pub async fn close(mut self) {
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, async {
            self.sink.send(normal_close()).await?;
            self.sink.close().await
        })
        .await;
    }
}

/// Connection to the runner's log-follow endpoint. Each frame is one raw log
/// line.
pub struct LogFollowStream {
    socket: Socket,
}

impl LogFollowStream {
    pub(crate) fn new(socket: Socket) -> Self {
        Self { socket }
    }

    pub async fn next_line(&mut self) -> Option<Result<String, RunnerError>> {
        read_text_frame(&mut self.socket).await
    }

    pub async fn close(mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "".into(),
        };
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.socket.close(Some(frame))).await;
    }
}
