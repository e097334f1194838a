use crate::config::PriceFeedConfig;
use crate::error::AppError;
use crate::market::types::{FeedFrame, LastPriceQuote, Symbol};
use crate::market::upstream::{FeedConnection, PriceUpstream};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Url;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

pub(crate) type FrameSender = mpsc::UnboundedSender<Result<FeedFrame, AppError>>;

pub(crate) fn test_config() -> Arc<PriceFeedConfig> {
    Arc::new(PriceFeedConfig {
        base_url: Some(Url::parse("http://feed.test").expect("test url should parse")),
        ..PriceFeedConfig::default()
    })
}

enum ConnectScript {
    Fail(&'static str),
    Connect(mpsc::UnboundedReceiver<Result<FeedFrame, AppError>>),
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum PollScript {
    Price(Option<f64>),
    Fail(&'static str),
}

#[derive(Default)]
struct PollQueue {
    pending: VecDeque<PollScript>,
    last: Option<PollScript>,
}

impl PollQueue {
    fn next(&mut self) -> Option<PollScript> {
        if let Some(script) = self.pending.pop_front() {
            self.last = Some(script);
        }
        self.last
    }
}

struct PollGate {
    after_calls: usize,
    open: watch::Receiver<bool>,
}

#[derive(Default)]
pub(crate) struct FakeUpstream {
    push: Mutex<VecDeque<ConnectScript>>,
    sse: Mutex<VecDeque<ConnectScript>>,
    polls: Mutex<HashMap<Symbol, PollQueue>>,
    gate: Mutex<Option<PollGate>>,
    calls_by_symbol: Mutex<HashMap<Symbol, usize>>,
    poll_delay: Mutex<Option<Duration>>,
    pub push_opens: AtomicUsize,
    pub sse_opens: AtomicUsize,
    pub poll_calls: AtomicUsize,
    pub closes: Arc<AtomicUsize>,
}

impl FakeUpstream {
    pub fn fail_push(&self, reason: &'static str) {
        self.push.lock().push_back(ConnectScript::Fail(reason));
    }

    pub fn fail_sse(&self, reason: &'static str) {
        self.sse.lock().push_back(ConnectScript::Fail(reason));
    }

    pub fn connect_push(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push.lock().push_back(ConnectScript::Connect(rx));
        tx
    }

    pub fn connect_sse(&self) -> FrameSender {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sse.lock().push_back(ConnectScript::Connect(rx));
        tx
    }

    pub fn script_poll<I>(&self, symbol: &str, scripts: I)
    where
        I: IntoIterator<Item = PollScript>,
    {
        let symbol = Symbol::parse(symbol).expect("test symbol should parse");
        self.polls
            .lock()
            .entry(symbol)
            .or_default()
            .pending
            .extend(scripts);
    }

    /// Holds every poll after the first `after_calls` until the returned
    /// sender flips to `true`.
    pub fn gate_polls_after(&self, after_calls: usize) -> watch::Sender<bool> {
        let (tx, rx) = watch::channel(false);
        *self.gate.lock() = Some(PollGate {
            after_calls,
            open: rx,
        });
        tx
    }

    pub fn delay_polls(&self, delay: Duration) {
        *self.poll_delay.lock() = Some(delay);
    }

    pub fn calls_for(&self, symbol: &str) -> usize {
        let symbol = Symbol::parse(symbol).expect("test symbol should parse");
        self.calls_by_symbol.lock().get(&symbol).copied().unwrap_or(0)
    }

    fn open(
        &self,
        queue: &Mutex<VecDeque<ConnectScript>>,
    ) -> Result<Box<dyn FeedConnection>, AppError> {
        match queue.lock().pop_front() {
            Some(ConnectScript::Connect(frames)) => Ok(Box::new(FakeConnection {
                frames,
                closes: Arc::clone(&self.closes),
            })),
            Some(ConnectScript::Fail(reason)) => {
                Err(AppError::TransportClosed(reason.to_string()))
            }
            None => Err(AppError::TransportClosed(
                "no scripted connection".to_string(),
            )),
        }
    }
}

#[async_trait]
impl PriceUpstream for FakeUpstream {
    async fn open_push(&self, _symbol: &Symbol) -> Result<Box<dyn FeedConnection>, AppError> {
        self.push_opens.fetch_add(1, Ordering::SeqCst);
        self.open(&self.push)
    }

    async fn open_event_stream(
        &self,
        _symbol: &Symbol,
    ) -> Result<Box<dyn FeedConnection>, AppError> {
        self.sse_opens.fetch_add(1, Ordering::SeqCst);
        self.open(&self.sse)
    }

    async fn fetch_last_price(&self, symbol: &Symbol) -> Result<LastPriceQuote, AppError> {
        let call = self.poll_calls.fetch_add(1, Ordering::SeqCst) + 1;
        *self.calls_by_symbol.lock().entry(symbol.clone()).or_default() += 1;
        let script = self
            .polls
            .lock()
            .get_mut(symbol)
            .and_then(PollQueue::next);

        let gate = self
            .gate
            .lock()
            .as_ref()
            .filter(|gate| call > gate.after_calls)
            .map(|gate| gate.open.clone());
        if let Some(mut open) = gate {
            let _ = open.wait_for(|open| *open).await;
        }
        let delay = *self.poll_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match script {
            Some(PollScript::Price(price)) => Ok(LastPriceQuote {
                price,
                ts: None,
                source: Some("fake".to_string()),
            }),
            Some(PollScript::Fail(reason)) => Err(AppError::UpstreamStatus {
                status: 503,
                content_type: "text/plain".to_string(),
                body: reason.to_string(),
            }),
            None => Err(AppError::InvalidPayload(format!(
                "no scripted price for {symbol}"
            ))),
        }
    }
}

struct FakeConnection {
    frames: mpsc::UnboundedReceiver<Result<FeedFrame, AppError>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl FeedConnection for FakeConnection {
    async fn next_frame(&mut self) -> Option<Result<FeedFrame, AppError>> {
        self.frames.recv().await
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.frames.close();
    }
}
