use crate::state::FeedState;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub sessions: usize,
    pub board_symbols: usize,
    pub base_url_configured: bool,
}

pub async fn build_health_response(state: &FeedState) -> HealthResponse {
    let base_url_configured = state.config.base_url.is_some();
    let board_symbols = state
        .board
        .lock()
        .await
        .as_ref()
        .map(|board| board.symbols().len())
        .unwrap_or(0);

    HealthResponse {
        status: if base_url_configured { "ok" } else { "degraded" },
        uptime_ms: state.started_at.elapsed().as_millis(),
        sessions: state.sessions().len(),
        board_symbols,
        base_url_configured,
    }
}

pub async fn health(state: &FeedState) -> HealthResponse {
    build_health_response(state).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PriceFeedConfig;
    use crate::market::testing::{test_config, FakeUpstream};
    use std::sync::Arc;

    #[tokio::test]
    async fn health_reports_ok_status_and_counts() {
        let state = FeedState::with_upstream(
            test_config().as_ref().clone(),
            Arc::new(FakeUpstream::default()),
        );

        let response = health(&state).await;

        assert_eq!(response.status, "ok");
        assert!(response.base_url_configured);
        assert_eq!(response.sessions, 0);
        assert_eq!(response.board_symbols, 0);
        assert!(response.uptime_ms <= 1_000);
    }

    #[tokio::test]
    async fn health_is_degraded_without_base_url() {
        let state = FeedState::with_upstream(
            PriceFeedConfig::default(),
            Arc::new(FakeUpstream::default()),
        );

        let response = health(&state).await;
        assert_eq!(response.status, "degraded");
        assert!(!response.base_url_configured);
    }
}
