use crate::error::AppError;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

pub const MIN_VALID_PRICE: f64 = 0.0;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        let normalized = raw.trim().to_ascii_uppercase();
        if normalized.is_empty() {
            return Err(AppError::InvalidArgument(
                "symbol must not be empty".to_string(),
            ));
        }

        if !normalized
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | ':' | '/'))
        {
            return Err(AppError::InvalidArgument(format!(
                "symbol '{normalized}' contains unsupported characters"
            )));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn normalize_symbols<I, S>(raw: I) -> Vec<Symbol>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut symbols: Vec<Symbol> = Vec::new();
    for candidate in raw {
        let candidate = candidate.as_ref();
        if candidate.trim().is_empty() {
            continue;
        }
        match Symbol::parse(candidate) {
            Ok(symbol) => {
                if !symbols.contains(&symbol) {
                    symbols.push(symbol);
                }
            }
            Err(error) => {
                tracing::warn!(raw = %candidate, error = %error, "skipping invalid symbol");
            }
        }
    }
    symbols
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Ws,
    Sse,
    Poll,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ws => "ws",
            Self::Sse => "sse",
            Self::Poll => "poll",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    Idle,
    Connecting,
    ConnectedWs,
    ConnectedSse,
    Polling,
    Error,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::ConnectedWs => "connected-ws",
            Self::ConnectedSse => "connected-sse",
            Self::Polling => "polling",
            Self::Error => "error",
        }
    }
}

pub fn is_valid_price(price: f64) -> bool {
    price.is_finite() && price > MIN_VALID_PRICE
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceTick {
    pub symbol: Symbol,
    pub price: f64,
    pub timestamp: i64,
    pub source: TransportKind,
    pub exchange_ts: Option<i64>,
}

impl PriceTick {
    pub fn new(
        symbol: Symbol,
        price: f64,
        timestamp: i64,
        source: TransportKind,
        exchange_ts: Option<i64>,
    ) -> Option<Self> {
        if !is_valid_price(price) {
            return None;
        }
        Some(Self {
            symbol,
            price,
            timestamp,
            source,
            exchange_ts,
        })
    }
}

/// What a single-symbol consumer sees.
///
/// `replayed` marks a snapshot whose price was re-emitted from the
/// last-known-good cache with a refreshed timestamp because the poll
/// endpoint returned nothing usable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PriceSnapshot {
    pub symbol: Symbol,
    pub price: Option<f64>,
    pub timestamp: Option<i64>,
    pub source: Option<TransportKind>,
    pub status: SessionStatus,
    pub replayed: bool,
    pub reason: Option<String>,
}

impl PriceSnapshot {
    pub fn idle(symbol: Symbol) -> Self {
        Self {
            symbol,
            price: None,
            timestamp: None,
            source: None,
            status: SessionStatus::Idle,
            replayed: false,
            reason: None,
        }
    }

    pub fn with_tick(&self, tick: &PriceTick, replayed: bool) -> Self {
        Self {
            symbol: self.symbol.clone(),
            price: Some(tick.price),
            timestamp: Some(tick.timestamp),
            source: Some(tick.source),
            status: self.status,
            replayed,
            reason: self.reason.clone(),
        }
    }

    pub fn with_status(&self, status: SessionStatus, reason: Option<String>) -> Self {
        Self {
            status,
            reason,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FeedEvent {
    Quote {
        bid: Option<f64>,
        ask: Option<f64>,
        last: Option<f64>,
        ts: Option<i64>,
    },
    Trade {
        price: Option<f64>,
        ts: Option<i64>,
    },
}

impl FeedEvent {
    pub fn exchange_ts(&self) -> Option<i64> {
        match self {
            Self::Quote { ts, .. } | Self::Trade { ts, .. } => *ts,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedFrame {
    Events(Vec<FeedEvent>),
    Malformed(String),
    Heartbeat,
}

/// Quote events may carry a single side; each one is merged into the previous book.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuoteBook {
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub last: Option<f64>,
}

impl QuoteBook {
    pub fn apply(self, event: &FeedEvent) -> (Self, Option<f64>) {
        match *event {
            FeedEvent::Trade { price, .. } => {
                let price = price.filter(|value| is_valid_price(*value));
                let next = Self {
                    last: price.or(self.last),
                    ..self
                };
                (next, price)
            }
            FeedEvent::Quote { bid, ask, last, .. } => {
                let bid = bid.filter(|value| is_valid_price(*value));
                let ask = ask.filter(|value| is_valid_price(*value));
                let last = last.filter(|value| is_valid_price(*value));
                if bid.is_none() && ask.is_none() && last.is_none() {
                    return (self, None);
                }
                let next = Self {
                    bid: bid.or(self.bid),
                    ask: ask.or(self.ask),
                    last: last.or(self.last),
                };
                let implied = last.or_else(|| next.mid()).or(next.bid).or(next.ask);
                (next, implied)
            }
        }
    }

    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireNumber {
    Number(f64),
    Text(String),
}

fn de_opt_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<WireNumber>::deserialize(deserializer)? {
        None => Ok(None),
        Some(WireNumber::Number(value)) => Ok(Some(value)),
        Some(WireNumber::Text(text)) => text
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

fn de_opt_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = de_opt_number(deserializer)?;
    Ok(value
        .filter(|ts| ts.is_finite() && *ts >= 0.0)
        .map(|ts| ts as i64))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum FeedEventWire {
    Quote {
        #[serde(default, deserialize_with = "de_opt_number")]
        bid: Option<f64>,
        #[serde(default, deserialize_with = "de_opt_number")]
        ask: Option<f64>,
        #[serde(default, deserialize_with = "de_opt_number")]
        last: Option<f64>,
        #[serde(default, deserialize_with = "de_opt_timestamp")]
        ts: Option<i64>,
    },
    Trade {
        #[serde(default, deserialize_with = "de_opt_number")]
        price: Option<f64>,
        #[serde(default, deserialize_with = "de_opt_timestamp")]
        ts: Option<i64>,
    },
    #[serde(other)]
    Other,
}

impl FeedEventWire {
    fn into_event(self) -> Option<FeedEvent> {
        match self {
            Self::Quote { bid, ask, last, ts } => Some(FeedEvent::Quote { bid, ask, last, ts }),
            Self::Trade { price, ts } => Some(FeedEvent::Trade { price, ts }),
            Self::Other => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedPayloadWire {
    Batch(Vec<FeedEventWire>),
    Single(FeedEventWire),
}

pub fn parse_feed_payload(payload: &mut [u8]) -> Result<Vec<FeedEvent>, AppError> {
    let wire: FeedPayloadWire = simd_json::serde::from_slice(payload)?;
    let events = match wire {
        FeedPayloadWire::Batch(batch) => batch
            .into_iter()
            .filter_map(FeedEventWire::into_event)
            .collect(),
        FeedPayloadWire::Single(single) => single.into_event().into_iter().collect(),
    };
    Ok(events)
}

#[derive(Debug, Deserialize)]
struct LastPriceEnvelopeWire {
    data: Option<LastPriceWire>,
}

#[derive(Debug, Deserialize)]
struct LastPriceWire {
    #[serde(default, deserialize_with = "de_opt_number")]
    price: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_timestamp")]
    ts: Option<i64>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LastPriceQuote {
    pub price: Option<f64>,
    pub ts: Option<i64>,
    pub source: Option<String>,
}

impl LastPriceQuote {
    pub fn valid_price(&self) -> Option<f64> {
        self.price.filter(|price| is_valid_price(*price))
    }

    pub fn into_event(self) -> FeedEvent {
        FeedEvent::Trade {
            price: self.price,
            ts: self.ts,
        }
    }
}

pub fn parse_last_price_payload(payload: &mut [u8]) -> Result<LastPriceQuote, AppError> {
    let wire: LastPriceEnvelopeWire = simd_json::serde::from_slice(payload)?;
    let data = wire
        .data
        .ok_or_else(|| AppError::InvalidPayload("missing 'data' object".to_string()))?;
    Ok(LastPriceQuote {
        price: data.price,
        ts: data.ts,
        source: data.source,
    })
}

pub(crate) fn now_unix_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}
