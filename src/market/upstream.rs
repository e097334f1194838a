use crate::config::PriceFeedConfig;
use crate::error::{truncate_body, AppError};
use crate::market::sse::{SseDecoder, SseEvent};
use crate::market::types::{
    parse_feed_payload, parse_last_price_payload, FeedFrame, LastPriceQuote, Symbol,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Response, Url};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};

const WS_PATH: &str = "/api/prices/ws";
const SSE_PATH: &str = "/api/prices/stream";
const LAST_PRICE_PATH: &str = "/api/prices/last";
const CLOSE_GRACE_MS: u64 = 1_000;

pub type FeedWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
pub trait FeedConnection: Send {
    async fn next_frame(&mut self) -> Option<Result<FeedFrame, AppError>>;

    async fn close(&mut self);
}

#[async_trait]
pub trait PriceUpstream: Send + Sync + 'static {
    async fn open_push(&self, symbol: &Symbol) -> Result<Box<dyn FeedConnection>, AppError>;

    async fn open_event_stream(
        &self,
        symbol: &Symbol,
    ) -> Result<Box<dyn FeedConnection>, AppError>;

    async fn fetch_last_price(&self, symbol: &Symbol) -> Result<LastPriceQuote, AppError>;
}

fn endpoint(base_url: &Url, path: &str, symbol: &Symbol) -> Url {
    let mut url = base_url.clone();
    let prefix = url.path().trim_end_matches('/').to_string();
    url.set_path(&format!("{prefix}{path}"));
    url.query_pairs_mut()
        .clear()
        .append_pair("symbol", symbol.as_str());
    url
}

fn ws_endpoint(
    base_url: &Url,
    ws_url: Option<&Url>,
    symbol: &Symbol,
) -> Result<Url, AppError> {
    if let Some(explicit) = ws_url {
        let mut url = explicit.clone();
        url.query_pairs_mut().append_pair("symbol", symbol.as_str());
        return Ok(url);
    }

    let mut url = endpoint(base_url, WS_PATH, symbol);
    let scheme = match base_url.scheme() {
        "https" => "wss",
        _ => "ws",
    };
    url.set_scheme(scheme).map_err(|_| {
        AppError::InvalidArgument(format!("cannot derive websocket url from {base_url}"))
    })?;
    Ok(url)
}

fn sse_endpoint(base_url: &Url, symbol: &Symbol) -> Url {
    endpoint(base_url, SSE_PATH, symbol)
}

fn last_price_endpoint(base_url: &Url, symbol: &Symbol) -> Url {
    endpoint(base_url, LAST_PRICE_PATH, symbol)
}

#[derive(Debug, Serialize)]
struct SubscribeMessage<'a> {
    action: &'static str,
    symbol: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

fn subscribe_message(symbol: &Symbol, token: Option<&str>) -> Result<String, AppError> {
    let message = SubscribeMessage {
        action: "subscribe",
        symbol: symbol.as_str(),
        token,
    };
    Ok(simd_json::to_string(&message)?)
}

pub fn decode_push_payload(payload: &mut [u8]) -> FeedFrame {
    match parse_feed_payload(payload) {
        Ok(events) => FeedFrame::Events(events),
        Err(error) => FeedFrame::Malformed(error.to_string()),
    }
}

pub fn decode_sse_event(event: SseEvent) -> FeedFrame {
    if matches!(event.event.as_deref(), Some("ping") | Some("heartbeat")) {
        return FeedFrame::Heartbeat;
    }

    let mut payload = event.data.into_bytes();
    match parse_last_price_payload(payload.as_mut_slice()) {
        Ok(quote) => FeedFrame::Events(vec![quote.into_event()]),
        Err(error) => FeedFrame::Malformed(error.to_string()),
    }
}

fn content_type_of(response: &Response) -> String {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("<none>")
        .to_string()
}

async fn status_error(response: Response) -> AppError {
    let status = response.status().as_u16();
    let content_type = content_type_of(&response);
    let body = response.text().await.unwrap_or_default();
    AppError::UpstreamStatus {
        status,
        content_type,
        body: truncate_body(&body),
    }
}

async fn content_type_error(response: Response, content_type: String) -> AppError {
    let body = response.text().await.unwrap_or_default();
    AppError::UnexpectedContentType {
        content_type,
        body: truncate_body(&body),
    }
}

pub struct WsFeedConnection {
    stream: FeedWsStream,
}

#[async_trait]
impl FeedConnection for WsFeedConnection {
    async fn next_frame(&mut self) -> Option<Result<FeedFrame, AppError>> {
        let message = match self.stream.next().await? {
            Ok(message) => message,
            Err(error) => return Some(Err(error.into())),
        };

        let frame = match message {
            Message::Text(text_payload) => {
                let mut owned_payload = text_payload.into_bytes();
                decode_push_payload(owned_payload.as_mut_slice())
            }
            Message::Binary(mut binary_payload) => {
                decode_push_payload(binary_payload.as_mut_slice())
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|close| format!("{} {}", close.code, close.reason))
                    .unwrap_or_else(|| "close frame without reason".to_string());
                return Some(Err(AppError::TransportClosed(reason)));
            }
            _ => FeedFrame::Heartbeat,
        };
        Some(Ok(frame))
    }

    async fn close(&mut self) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: "unsubscribe".into(),
        };
        let closing = self.stream.close(Some(frame));
        if let Err(error) =
            tokio::time::timeout(Duration::from_millis(CLOSE_GRACE_MS), closing).await
        {
            tracing::debug!(error = %error, "websocket close handshake timed out");
        }
    }
}

pub struct SseFeedConnection {
    response: Response,
    decoder: SseDecoder,
    pending: VecDeque<FeedFrame>,
}

#[async_trait]
impl FeedConnection for SseFeedConnection {
    async fn next_frame(&mut self) -> Option<Result<FeedFrame, AppError>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Some(Ok(frame));
            }

            match self.response.chunk().await {
                Ok(Some(chunk)) => match self.decoder.push(&chunk) {
                    Ok(events) => self
                        .pending
                        .extend(events.into_iter().map(decode_sse_event)),
                    Err(error) => return Some(Err(error)),
                },
                Ok(None) => return None,
                Err(error) => return Some(Err(error.into())),
            }
        }
    }

    async fn close(&mut self) {
        // The body is released when the connection is dropped.
        self.pending.clear();
    }
}

#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    base_url: Option<Url>,
    ws_url: Option<Url>,
    auth_token: Option<String>,
    connect_timeout: Duration,
}

impl HttpUpstream {
    pub fn new(config: &PriceFeedConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &PriceFeedConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.clone(),
            ws_url: config.ws_url.clone(),
            auth_token: config.auth_token.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }

    fn base_url(&self) -> Result<&Url, AppError> {
        self.base_url
            .as_ref()
            .ok_or(AppError::MissingConfiguration("backend base url"))
    }
}

#[async_trait]
impl PriceUpstream for HttpUpstream {
    async fn open_push(&self, symbol: &Symbol) -> Result<Box<dyn FeedConnection>, AppError> {
        let url = ws_endpoint(self.base_url()?, self.ws_url.as_ref(), symbol)?;
        let ws_config = WebSocketConfig {
            max_message_size: Some(16 << 20),
            max_frame_size: Some(4 << 20),
            ..Default::default()
        };

        let connecting = connect_async_with_config(url.as_str(), Some(ws_config), true);
        let (mut stream, _) = tokio::time::timeout(self.connect_timeout, connecting)
            .await
            .map_err(|_| AppError::Timeout("opening websocket"))??;

        let handshake = subscribe_message(symbol, self.auth_token.as_deref())?;
        stream.send(Message::Text(handshake)).await?;

        Ok(Box::new(WsFeedConnection { stream }))
    }

    async fn open_event_stream(
        &self,
        symbol: &Symbol,
    ) -> Result<Box<dyn FeedConnection>, AppError> {
        let url = sse_endpoint(self.base_url()?, symbol);
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send();
        let response = tokio::time::timeout(self.connect_timeout, request)
            .await
            .map_err(|_| AppError::Timeout("opening event stream"))??;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let content_type = content_type_of(&response);
        if !content_type.starts_with("text/event-stream") {
            return Err(content_type_error(response, content_type).await);
        }

        Ok(Box::new(SseFeedConnection {
            response,
            decoder: SseDecoder::new(),
            pending: VecDeque::new(),
        }))
    }

    async fn fetch_last_price(&self, symbol: &Symbol) -> Result<LastPriceQuote, AppError> {
        let url = last_price_endpoint(self.base_url()?, symbol);
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .timeout(self.connect_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let content_type = content_type_of(&response);
        if !content_type.contains("json") {
            return Err(content_type_error(response, content_type).await);
        }

        let mut payload = response.bytes().await?.to_vec();
        parse_last_price_payload(payload.as_mut_slice())
    }
}
