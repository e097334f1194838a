use crate::config::PriceFeedConfig;
use crate::error::AppError;
use crate::market::aggregator::MultiSymbolAggregator;
use crate::market::session::TransportSession;
use crate::market::types::{PriceSnapshot, Symbol};
use crate::market::upstream::{HttpUpstream, PriceUpstream};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex as AsyncMutex};

struct SessionEntry {
    session: TransportSession,
    subscribers: usize,
}

pub struct SessionRegistry {
    config: Arc<PriceFeedConfig>,
    upstream: Arc<dyn PriceUpstream>,
    sessions: Mutex<HashMap<Symbol, SessionEntry>>,
}

impl SessionRegistry {
    fn acquire(self: &Arc<Self>, symbol: Symbol) -> PriceSubscription {
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(symbol.clone()).or_insert_with(|| {
            tracing::info!(symbol = %symbol, "opening price session");
            SessionEntry {
                session: TransportSession::spawn(
                    symbol.clone(),
                    Arc::clone(&self.config),
                    Arc::clone(&self.upstream),
                    None,
                ),
                subscribers: 0,
            }
        });
        entry.subscribers += 1;

        PriceSubscription {
            symbol,
            snapshot_rx: entry.session.subscribe(),
            registry: Arc::clone(self),
            released: false,
        }
    }

    fn release(&self, symbol: &Symbol) -> Option<TransportSession> {
        let mut sessions = self.sessions.lock();
        let entry = sessions.get_mut(symbol)?;
        entry.subscribers = entry.subscribers.saturating_sub(1);
        if entry.subscribers > 0 {
            return None;
        }
        tracing::info!(symbol = %symbol, "closing price session");
        sessions.remove(symbol).map(|entry| entry.session)
    }

    pub fn snapshot(&self, symbol: &Symbol) -> Option<PriceSnapshot> {
        self.sessions
            .lock()
            .get(symbol)
            .map(|entry| entry.session.snapshot())
    }

    pub fn subscribers(&self, symbol: &Symbol) -> usize {
        self.sessions
            .lock()
            .get(symbol)
            .map(|entry| entry.subscribers)
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

/// A consumer's hold on a symbol's session.
///
/// [`PriceSubscription::unsubscribe`] is the silent teardown: when it returns
/// for the last subscriber the session task has been joined and nothing more
/// is published. Dropping instead only cancels the task, so on a
/// multi-threaded runtime one write already past its cancellation check may
/// still land.
pub struct PriceSubscription {
    symbol: Symbol,
    snapshot_rx: watch::Receiver<PriceSnapshot>,
    registry: Arc<SessionRegistry>,
    released: bool,
}

impl PriceSubscription {
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    pub fn snapshot(&self) -> PriceSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn updates(&self) -> watch::Receiver<PriceSnapshot> {
        self.snapshot_rx.clone()
    }

    pub async fn changed(&mut self) -> Option<PriceSnapshot> {
        self.snapshot_rx.changed().await.ok()?;
        Some(self.snapshot_rx.borrow_and_update().clone())
    }

    pub async fn unsubscribe(mut self) {
        self.released = true;
        if let Some(session) = self.registry.release(&self.symbol) {
            session.close().await;
        }
    }
}

impl Drop for PriceSubscription {
    fn drop(&mut self) {
        if !self.released {
            // Dropping the session cancels its task.
            drop(self.registry.release(&self.symbol));
        }
    }
}

pub struct FeedState {
    pub started_at: Instant,
    pub config: Arc<PriceFeedConfig>,
    upstream: Arc<dyn PriceUpstream>,
    registry: Arc<SessionRegistry>,
    pub board: AsyncMutex<Option<MultiSymbolAggregator>>,
}

impl FeedState {
    pub fn new(config: PriceFeedConfig) -> Result<Self, AppError> {
        let upstream = HttpUpstream::new(&config)?;
        Ok(Self::with_upstream(config, Arc::new(upstream)))
    }

    pub fn with_upstream(config: PriceFeedConfig, upstream: Arc<dyn PriceUpstream>) -> Self {
        let config = Arc::new(config);
        Self {
            started_at: Instant::now(),
            registry: Arc::new(SessionRegistry {
                config: Arc::clone(&config),
                upstream: Arc::clone(&upstream),
                sessions: Mutex::new(HashMap::new()),
            }),
            config,
            upstream,
            board: AsyncMutex::new(None),
        }
    }

    pub fn upstream(&self) -> Arc<dyn PriceUpstream> {
        Arc::clone(&self.upstream)
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn subscribe(&self, symbol: Symbol) -> PriceSubscription {
        self.registry.acquire(symbol)
    }
}
