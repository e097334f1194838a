use crate::config::PriceFeedConfig;
use crate::error::AppError;
use crate::market::cache::PriceCache;
use crate::market::types::{
    normalize_symbols, now_unix_ms, LastPriceQuote, PriceTick, SessionStatus, Symbol,
    TransportKind,
};
use crate::market::upstream::PriceUpstream;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceBoard {
    pub prices: BTreeMap<Symbol, f64>,
    pub status: SessionStatus,
    pub reason: Option<String>,
}

impl Default for PriceBoard {
    fn default() -> Self {
        Self {
            prices: BTreeMap::new(),
            status: SessionStatus::Idle,
            reason: None,
        }
    }
}

struct BoardWorker {
    cancellation_token: CancellationToken,
    join_handle: JoinHandle<()>,
}

pub struct MultiSymbolAggregator {
    config: Arc<PriceFeedConfig>,
    upstream: Arc<dyn PriceUpstream>,
    cache: Arc<PriceCache>,
    symbols: Vec<Symbol>,
    board_tx: Arc<watch::Sender<PriceBoard>>,
    board_rx: watch::Receiver<PriceBoard>,
    worker: Option<BoardWorker>,
}

impl MultiSymbolAggregator {
    pub fn spawn<I, S>(
        symbols: I,
        config: Arc<PriceFeedConfig>,
        upstream: Arc<dyn PriceUpstream>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let (board_tx, board_rx) = watch::channel(PriceBoard::default());
        let mut aggregator = Self {
            config,
            upstream,
            cache: Arc::new(PriceCache::new()),
            symbols: normalize_symbols(symbols),
            board_tx: Arc::new(board_tx),
            board_rx,
            worker: None,
        };
        aggregator.start_worker();
        aggregator
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn board(&self) -> PriceBoard {
        self.board_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PriceBoard> {
        self.board_rx.clone()
    }

    pub async fn set_symbols<I, S>(&mut self, symbols: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let symbols = normalize_symbols(symbols);
        if symbols == self.symbols {
            return;
        }

        self.stop_worker().await;
        self.cache.retain_symbols(&symbols);
        info!(
            previous = self.symbols.len(),
            next = symbols.len(),
            "price board symbol set changed"
        );
        self.symbols = symbols;
        self.start_worker();
    }

    pub async fn close(mut self) {
        self.stop_worker().await;
    }

    fn start_worker(&mut self) {
        let prices = self.cache.prices();

        if self.symbols.is_empty() {
            self.board_tx.send_replace(PriceBoard {
                prices,
                status: SessionStatus::Idle,
                reason: Some("no symbols".to_string()),
            });
            return;
        }

        if self.config.base_url.is_none() {
            warn!("price board has no backend base url");
            self.board_tx.send_replace(PriceBoard {
                prices,
                status: SessionStatus::Error,
                reason: Some("missing backend base url".to_string()),
            });
            return;
        }

        self.board_tx.send_replace(PriceBoard {
            prices,
            status: SessionStatus::Polling,
            reason: None,
        });

        let cancellation_token = CancellationToken::new();
        let join_handle = tokio::spawn(run_board(
            self.symbols.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.upstream),
            Arc::clone(&self.cache),
            Arc::clone(&self.board_tx),
            cancellation_token.clone(),
        ));
        self.worker = Some(BoardWorker {
            cancellation_token,
            join_handle,
        });
    }

    async fn stop_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.cancellation_token.cancel();
            let _ = worker.join_handle.await;
        }
    }
}

impl Drop for MultiSymbolAggregator {
    fn drop(&mut self) {
        if let Some(worker) = &self.worker {
            worker.cancellation_token.cancel();
        }
    }
}

async fn run_board(
    symbols: Vec<Symbol>,
    config: Arc<PriceFeedConfig>,
    upstream: Arc<dyn PriceUpstream>,
    cache: Arc<PriceCache>,
    board_tx: Arc<watch::Sender<PriceBoard>>,
    cancel_token: CancellationToken,
) {
    let poll_interval = config.poll_interval();

    loop {
        let fetches = symbols.iter().map(|symbol| {
            let upstream = Arc::clone(&upstream);
            async move {
                let result = upstream.fetch_last_price(symbol).await;
                (symbol.clone(), result)
            }
        });
        let results = tokio::select! {
            _ = cancel_token.cancelled() => return,
            results = join_all(fetches) => results,
        };

        if cancel_token.is_cancelled() {
            return;
        }
        if apply_fetch_results(&cache, results, now_unix_ms()) {
            let prices = cache.prices();
            board_tx.send_if_modified(|board| {
                if board.prices == prices {
                    return false;
                }
                board.prices = prices;
                true
            });
        }

        // The next round is timed from when this one settled.
        tokio::select! {
            _ = cancel_token.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

fn apply_fetch_results(
    cache: &PriceCache,
    results: Vec<(Symbol, Result<LastPriceQuote, AppError>)>,
    now_ms: i64,
) -> bool {
    let mut changed = false;
    for (symbol, result) in results {
        match result {
            Ok(quote) => {
                let Some(tick) = quote.valid_price().and_then(|price| {
                    PriceTick::new(symbol.clone(), price, now_ms, TransportKind::Poll, quote.ts)
                }) else {
                    debug!(symbol = %symbol, price = ?quote.price, "ignoring unusable board price");
                    continue;
                };
                changed |= cache.record(&tick);
            }
            Err(error) => {
                warn!(
                    symbol = %symbol,
                    class = error.failure_class().as_str(),
                    error = %error,
                    "board price fetch failed"
                );
            }
        }
    }
    changed
}
