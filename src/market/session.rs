use crate::config::PriceFeedConfig;
use crate::error::AppError;
use crate::market::backoff::ReconnectState;
use crate::market::cache::{CachedPrice, PriceCache};
use crate::market::transport::{transition, TransportEvent, TransportState};
use crate::market::types::{
    now_unix_ms, FeedEvent, FeedFrame, LastPriceQuote, PriceSnapshot, PriceTick, QuoteBook,
    SessionStatus, Symbol, TransportKind,
};
use crate::market::upstream::{FeedConnection, PriceUpstream};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MISSING_BASE_URL_REASON: &str = "missing backend base url";

/// Live price feed for one symbol.
///
/// Owns a background task that walks the WebSocket → SSE → polling cascade.
/// Dropping the handle cancels the task; [`TransportSession::close`] also
/// waits for it, after which no snapshot, tick or cache write can happen.
pub struct TransportSession {
    symbol: Symbol,
    cancellation_token: CancellationToken,
    join_handle: Option<JoinHandle<()>>,
    snapshot_rx: watch::Receiver<PriceSnapshot>,
    cache: Arc<PriceCache>,
}

impl TransportSession {
    pub fn spawn(
        symbol: Symbol,
        config: Arc<PriceFeedConfig>,
        upstream: Arc<dyn PriceUpstream>,
        tick_tx: Option<mpsc::UnboundedSender<PriceTick>>,
    ) -> Self {
        let cancellation_token = CancellationToken::new();
        let cache = Arc::new(PriceCache::new());
        let (snapshot_tx, snapshot_rx) = watch::channel(PriceSnapshot::idle(symbol.clone()));

        let runtime = SessionRuntime {
            symbol: symbol.clone(),
            reconnect: ReconnectState::new(config.reconnect_policy),
            config,
            upstream,
            cache: Arc::clone(&cache),
            publisher: SnapshotPublisher {
                snapshot_tx,
                tick_tx,
                cancel_token: cancellation_token.clone(),
            },
            cancel_token: cancellation_token.clone(),
            state: TransportState::Idle,
            book: QuoteBook::default(),
            last_tick_ts: 0,
        };
        let join_handle = tokio::spawn(runtime.run());

        Self {
            symbol,
            cancellation_token,
            join_handle: Some(join_handle),
            snapshot_rx,
            cache,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn snapshot(&self) -> PriceSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PriceSnapshot> {
        self.snapshot_rx.clone()
    }

    pub fn last_known_good(&self) -> Option<CachedPrice> {
        self.cache.get(&self.symbol)
    }

    pub fn is_closed(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub async fn close(mut self) {
        self.cancellation_token.cancel();
        if let Some(handle) = self.join_handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Every outward write goes through here so a cancelled session stays silent.
struct SnapshotPublisher {
    snapshot_tx: watch::Sender<PriceSnapshot>,
    tick_tx: Option<mpsc::UnboundedSender<PriceTick>>,
    cancel_token: CancellationToken,
}

impl SnapshotPublisher {
    fn is_live(&self) -> bool {
        !self.cancel_token.is_cancelled()
    }

    fn publish_status(&self, status: SessionStatus, reason: Option<String>) {
        if !self.is_live() {
            return;
        }
        self.snapshot_tx
            .send_modify(|snapshot| *snapshot = snapshot.with_status(status, reason));
    }

    fn publish_tick(&self, cache: &PriceCache, tick: PriceTick, replayed: bool) {
        if !self.is_live() {
            return;
        }
        cache.record(&tick);
        self.snapshot_tx
            .send_modify(|snapshot| *snapshot = snapshot.with_tick(&tick, replayed));
        if let Some(tick_tx) = &self.tick_tx {
            let _ = tick_tx.send(tick);
        }
    }
}

struct SessionRuntime {
    symbol: Symbol,
    config: Arc<PriceFeedConfig>,
    upstream: Arc<dyn PriceUpstream>,
    cache: Arc<PriceCache>,
    publisher: SnapshotPublisher,
    cancel_token: CancellationToken,
    state: TransportState,
    reconnect: ReconnectState,
    book: QuoteBook,
    last_tick_ts: i64,
}

impl SessionRuntime {
    async fn run(mut self) {
        if self.config.base_url.is_none() {
            warn!(symbol = %self.symbol, "price session has no backend base url");
            self.apply(
                TransportEvent::MissingConfiguration,
                Some(MISSING_BASE_URL_REASON.to_string()),
            );
            self.cancel_token.cancelled().await;
            self.apply(TransportEvent::Unsubscribe, None);
            return;
        }

        self.apply(
            TransportEvent::Subscribe,
            Some("opening websocket stream".to_string()),
        );

        while !self.cancel_token.is_cancelled() {
            match self.state {
                TransportState::ConnectingPrimary => self.run_push(TransportKind::Ws).await,
                TransportState::FallingBackToSecondary => {
                    self.run_push(TransportKind::Sse).await
                }
                TransportState::FallingBackToTertiary => self.run_polling().await,
                TransportState::RetryPending => self.wait_for_retry().await,
                state => {
                    warn!(symbol = %self.symbol, state = ?state, "price session stopped in unexpected state");
                    break;
                }
            }
        }

        self.apply(TransportEvent::Unsubscribe, None);
        debug!(symbol = %self.symbol, "price session closed");
    }

    fn apply(&mut self, event: TransportEvent, reason: Option<String>) -> bool {
        let Some(next) = transition(self.state, event) else {
            debug!(symbol = %self.symbol, state = ?self.state, event = ?event, "ignoring transport event");
            return false;
        };

        if next != self.state {
            info!(
                symbol = %self.symbol,
                from = ?self.state,
                to = ?next,
                status = next.status().as_str(),
                "transport transition"
            );
        }
        self.state = next;
        if next != TransportState::Closed {
            self.publisher.publish_status(next.status(), reason);
        }
        true
    }

    fn opened(&mut self, kind: TransportKind) {
        self.reconnect.reset();
        self.apply(
            TransportEvent::Opened,
            Some(format!("{} connected", kind.as_str())),
        );
    }

    fn failed(&mut self, kind: TransportKind, error: &AppError) {
        if !self.publisher.is_live() {
            return;
        }
        warn!(
            symbol = %self.symbol,
            transport = kind.as_str(),
            class = error.failure_class().as_str(),
            error = %error,
            "price transport failed"
        );
        self.apply(
            TransportEvent::Failed,
            Some(format!("{} failed: {error}", kind.as_str())),
        );
    }

    async fn run_push(&mut self, kind: TransportKind) {
        let cancel_token = self.cancel_token.clone();
        let opening = match kind {
            TransportKind::Ws => self.upstream.open_push(&self.symbol),
            _ => self.upstream.open_event_stream(&self.symbol),
        };
        let opened = tokio::select! {
            _ = cancel_token.cancelled() => return,
            opened = opening => opened,
        };

        let mut connection = match opened {
            Ok(connection) => connection,
            Err(error) => {
                self.failed(kind, &error);
                return;
            }
        };
        if cancel_token.is_cancelled() {
            connection.close().await;
            return;
        }
        self.opened(kind);

        let failure = self.pump(kind, connection.as_mut(), &cancel_token).await;
        connection.close().await;
        if let Some(error) = failure {
            self.failed(kind, &error);
        }
    }

    async fn pump(
        &mut self,
        kind: TransportKind,
        connection: &mut dyn FeedConnection,
        cancel_token: &CancellationToken,
    ) -> Option<AppError> {
        loop {
            let next = tokio::select! {
                _ = cancel_token.cancelled() => return None,
                next = connection.next_frame() => next,
            };

            match next {
                None => {
                    return Some(AppError::TransportClosed(format!(
                        "{} stream ended",
                        kind.as_str()
                    )))
                }
                Some(Err(error)) => return Some(error),
                Some(Ok(FeedFrame::Events(events))) => {
                    for event in &events {
                        self.ingest_event(kind, event);
                    }
                }
                Some(Ok(FeedFrame::Malformed(reason))) => {
                    warn!(
                        symbol = %self.symbol,
                        transport = kind.as_str(),
                        reason = %reason,
                        "dropping malformed price payload"
                    );
                }
                Some(Ok(FeedFrame::Heartbeat)) => {}
            }
        }
    }

    async fn run_polling(&mut self) {
        let cancel_token = self.cancel_token.clone();
        let fetched = tokio::select! {
            _ = cancel_token.cancelled() => return,
            fetched = self.upstream.fetch_last_price(&self.symbol) => fetched,
        };
        match fetched {
            Ok(quote) => {
                if cancel_token.is_cancelled() {
                    return;
                }
                self.opened(TransportKind::Poll);
                self.ingest_poll(quote);
            }
            Err(error) => {
                self.failed(TransportKind::Poll, &error);
                return;
            }
        }

        let poll_interval = self.config.poll_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0_u32;

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let fetched = tokio::select! {
                _ = cancel_token.cancelled() => return,
                fetched = self.upstream.fetch_last_price(&self.symbol) => fetched,
            };

            match fetched {
                Ok(quote) => {
                    consecutive_failures = 0;
                    self.ingest_poll(quote);
                }
                Err(error) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    warn!(
                        symbol = %self.symbol,
                        class = error.failure_class().as_str(),
                        consecutive_failures,
                        error = %error,
                        "price poll failed"
                    );
                    self.replay_cached();
                    if consecutive_failures >= self.config.max_consecutive_poll_failures {
                        self.failed(TransportKind::Poll, &error);
                        return;
                    }
                }
            }
        }
    }

    async fn wait_for_retry(&mut self) {
        let attempt = self.reconnect.attempt();
        let delay = self.reconnect.record_failure();
        info!(
            symbol = %self.symbol,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "all price transports failed; backing off"
        );

        let cancel_token = self.cancel_token.clone();
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        self.apply(
            TransportEvent::RetryElapsed,
            Some(format!("retrying after {} ms", delay.as_millis())),
        );
    }

    fn ingest_event(&mut self, kind: TransportKind, event: &FeedEvent) {
        let (book, price) = self.book.apply(event);
        self.book = book;
        let Some(price) = price else {
            debug!(symbol = %self.symbol, transport = kind.as_str(), "event carried no usable price");
            return;
        };
        self.emit(price, kind, event.exchange_ts());
    }

    fn ingest_poll(&mut self, quote: LastPriceQuote) {
        match quote.valid_price() {
            Some(price) => {
                self.book.last = Some(price);
                self.emit(price, TransportKind::Poll, quote.ts);
            }
            None => {
                debug!(symbol = %self.symbol, price = ?quote.price, "poll returned unusable price");
                self.replay_cached();
            }
        }
    }

    fn emit(&mut self, price: f64, source: TransportKind, exchange_ts: Option<i64>) {
        let timestamp = self.next_timestamp();
        if let Some(tick) = PriceTick::new(self.symbol.clone(), price, timestamp, source, exchange_ts)
        {
            self.publisher.publish_tick(&self.cache, tick, false);
        }
    }

    fn replay_cached(&mut self) {
        if !self.publisher.is_live() {
            return;
        }
        let timestamp = self.next_timestamp();
        if let Some(tick) = self
            .cache
            .replay(&self.symbol, timestamp, TransportKind::Poll)
        {
            debug!(symbol = %self.symbol, price = tick.price, "replaying cached price");
            self.publisher.publish_tick(&self.cache, tick, true);
        }
    }

    fn next_timestamp(&mut self) -> i64 {
        self.last_tick_ts = monotonic_timestamp(self.last_tick_ts, now_unix_ms());
        self.last_tick_ts
    }
}

/// Wall clock can step backwards; tick timestamps within a session cannot.
fn monotonic_timestamp(previous: i64, wall_clock: i64) -> i64 {
    wall_clock.max(previous)
}
