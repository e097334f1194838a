pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod market;
pub mod state;

pub use config::{PriceFeedArgs, PriceFeedConfig};
pub use error::{AppError, FailureClass};
pub use market::aggregator::{MultiSymbolAggregator, PriceBoard};
pub use market::candles::{merge, Candle, CandleSeries, Timeframe, TimeframeUnit};
pub use market::session::TransportSession;
pub use market::types::{PriceSnapshot, PriceTick, SessionStatus, Symbol, TransportKind};
pub use market::upstream::{HttpUpstream, PriceUpstream};
pub use state::{FeedState, PriceSubscription};

use commands::price_stream::{board_updates, start_board, stop_board};
use logging::init_logging;
use tokio::sync::watch;
use tracing::{debug, info, warn};

async fn log_snapshots(mut updates: watch::Receiver<PriceSnapshot>, history_limit: usize) {
    let mut candles = CandleSeries::new(
        Timeframe::new(1, TimeframeUnit::Minute),
        Vec::new(),
        history_limit,
    );
    let mut last_timestamp = None;

    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        info!(
            symbol = %snapshot.symbol,
            status = snapshot.status.as_str(),
            price = ?snapshot.price,
            source = ?snapshot.source.map(TransportKind::as_str),
            replayed = snapshot.replayed,
            reason = ?snapshot.reason,
            "price update"
        );

        if let (Some(price), Some(timestamp)) = (snapshot.price, snapshot.timestamp) {
            if last_timestamp == Some(timestamp) {
                continue;
            }
            last_timestamp = Some(timestamp);
            let outcome = candles.apply_price(price, timestamp);
            if let Some(candle) = candles.last() {
                debug!(
                    symbol = %snapshot.symbol,
                    timeframe = %candles.timeframe().label(),
                    outcome = ?outcome,
                    open = candle.open,
                    high = candle.high,
                    low = candle.low,
                    close = candle.close,
                    "candle update"
                );
            }
        }
    }
}

async fn log_board(mut updates: watch::Receiver<PriceBoard>) {
    while updates.changed().await.is_ok() {
        let board = updates.borrow_and_update().clone();
        info!(
            status = board.status.as_str(),
            symbols = board.prices.len(),
            prices = ?board.prices,
            "board update"
        );
    }
}

pub async fn run() -> Result<(), AppError> {
    let config = PriceFeedArgs::from_env()?.normalize()?;
    init_logging(config.log_format);

    if config.base_url.is_none() {
        warn!("PRICE_FEED_BASE_URL is not set; sessions will report an error");
    }
    if config.symbols.is_empty() {
        warn!("PRICE_FEED_SYMBOLS is empty; nothing to stream");
    }
    info!(
        symbols = config.symbols.len(),
        poll_interval_ms = config.poll_interval_ms,
        "starting live price feed"
    );

    let state = FeedState::new(config)?;
    let subscriptions: Vec<PriceSubscription> = state
        .config
        .symbols
        .iter()
        .cloned()
        .map(|symbol| state.subscribe(symbol))
        .collect();
    let mut loggers: Vec<_> = subscriptions
        .iter()
        .map(|subscription| {
            tokio::spawn(log_snapshots(
                subscription.updates(),
                state.config.history_limit,
            ))
        })
        .collect();

    if state.config.symbols.len() > 1 {
        start_board(&state, None).await?;
        if let Some(updates) = board_updates(&state).await {
            loggers.push(tokio::spawn(log_board(updates)));
        }
    }

    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(error = %error, "failed to listen for ctrl-c; shutting down");
    }
    info!("shutting down live price feed");

    for subscription in subscriptions {
        subscription.unsubscribe().await;
    }
    stop_board(&state).await;
    for logger in loggers {
        let _ = logger.await;
    }
    Ok(())
}
