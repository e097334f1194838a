use crate::error::AppError;
use crate::market::aggregator::{MultiSymbolAggregator, PriceBoard};
use crate::market::types::{normalize_symbols, PriceSnapshot, Symbol};
use crate::state::{FeedState, PriceSubscription};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBoardArgs {
    pub symbols: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardSession {
    pub symbols: Vec<Symbol>,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardStopResult {
    pub stopped: bool,
}

pub fn subscribe_price(state: &FeedState, symbol: &str) -> Result<PriceSubscription, AppError> {
    let symbol = Symbol::parse(symbol)?;
    Ok(state.subscribe(symbol))
}

pub async fn unsubscribe_price(subscription: PriceSubscription) {
    subscription.unsubscribe().await;
}

pub fn price_snapshot(state: &FeedState, symbol: &str) -> Result<Option<PriceSnapshot>, AppError> {
    let symbol = Symbol::parse(symbol)?;
    Ok(state.sessions().snapshot(&symbol))
}

pub async fn start_board(
    state: &FeedState,
    args: Option<StartBoardArgs>,
) -> Result<BoardSession, AppError> {
    let symbols = match args.unwrap_or_default().symbols {
        Some(raw) => normalize_symbols(raw),
        None => state.config.symbols.clone(),
    };
    if symbols.is_empty() {
        return Err(AppError::InvalidArgument(
            "board needs at least one valid symbol".to_string(),
        ));
    }

    let existing = state.board.lock().await.take();
    if let Some(board) = existing {
        board.close().await;
    }

    let board = MultiSymbolAggregator::spawn(
        symbols.iter().map(Symbol::as_str),
        state.config.clone(),
        state.upstream(),
    );
    let session = BoardSession {
        symbols: board.symbols().to_vec(),
        poll_interval_ms: state.config.poll_interval_ms,
    };
    *state.board.lock().await = Some(board);

    Ok(session)
}

pub async fn set_board_symbols(
    state: &FeedState,
    symbols: Vec<String>,
) -> Result<BoardSession, AppError> {
    let mut slot = state.board.lock().await;
    let board = slot
        .as_mut()
        .ok_or_else(|| AppError::InvalidArgument("board is not running".to_string()))?;
    board.set_symbols(symbols).await;

    Ok(BoardSession {
        symbols: board.symbols().to_vec(),
        poll_interval_ms: state.config.poll_interval_ms,
    })
}

pub async fn stop_board(state: &FeedState) -> BoardStopResult {
    let existing = state.board.lock().await.take();
    let stopped = match existing {
        Some(board) => {
            board.close().await;
            true
        }
        None => false,
    };
    BoardStopResult { stopped }
}

pub async fn board_snapshot(state: &FeedState) -> Option<PriceBoard> {
    state.board.lock().await.as_ref().map(MultiSymbolAggregator::board)
}

pub async fn board_updates(state: &FeedState) -> Option<watch::Receiver<PriceBoard>> {
    state
        .board
        .lock()
        .await
        .as_ref()
        .map(MultiSymbolAggregator::subscribe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::testing::{test_config, FakeUpstream, PollScript};
    use std::sync::Arc;
    use std::time::Duration;

    fn state_with(upstream: Arc<FakeUpstream>) -> FeedState {
        FeedState::with_upstream(test_config().as_ref().clone(), upstream)
    }

    #[tokio::test]
    async fn rejects_invalid_symbols() {
        let state = state_with(Arc::new(FakeUpstream::default()));
        assert!(matches!(
            subscribe_price(&state, "  "),
            Err(AppError::InvalidArgument(_))
        ));
        assert!(matches!(
            price_snapshot(&state, "bad symbol"),
            Err(AppError::InvalidArgument(_))
        ));
        assert_eq!(
            price_snapshot(&state, "aapl").expect("symbol is valid"),
            None
        );
    }

    #[tokio::test]
    async fn board_requires_symbols() {
        let state = state_with(Arc::new(FakeUpstream::default()));
        let error = start_board(&state, None)
            .await
            .expect_err("no configured symbols");
        assert!(matches!(error, AppError::InvalidArgument(_)));
        assert!(set_board_symbols(&state, vec!["aapl".to_string()])
            .await
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn starts_replaces_and_stops_the_board() {
        let upstream = Arc::new(FakeUpstream::default());
        upstream.script_poll("AAPL", [PollScript::Price(Some(190.0))]);
        upstream.script_poll("MSFT", [PollScript::Price(Some(410.0))]);
        let state = state_with(upstream.clone());

        let session = start_board(
            &state,
            Some(StartBoardArgs {
                symbols: Some(vec!["aapl".to_string(), "AAPL".to_string()]),
            }),
        )
        .await
        .expect("board should start");
        assert_eq!(session.symbols.len(), 1);

        let session = start_board(
            &state,
            Some(StartBoardArgs {
                symbols: Some(vec!["msft".to_string()]),
            }),
        )
        .await
        .expect("board should restart");
        assert_eq!(session.poll_interval_ms, 2_000);

        let mut updates = board_updates(&state).await.expect("board is running");
        let board = tokio::time::timeout(
            Duration::from_secs(30),
            updates.wait_for(|board| !board.prices.is_empty()),
        )
        .await
        .expect("board should update")
        .expect("board should be live")
        .clone();
        assert_eq!(board.prices.keys().map(Symbol::as_str).collect::<Vec<_>>(), vec!["MSFT"]);

        let session = set_board_symbols(&state, vec!["msft".to_string(), "aapl".to_string()])
            .await
            .expect("symbols should update");
        assert_eq!(session.symbols.len(), 2);

        assert_eq!(stop_board(&state).await, BoardStopResult { stopped: true });
        assert_eq!(stop_board(&state).await, BoardStopResult { stopped: false });
        assert!(board_snapshot(&state).await.is_none());
    }
}
