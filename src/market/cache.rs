use crate::market::types::{is_valid_price, PriceTick, Symbol, TransportKind};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedPrice {
    pub price: f64,
    pub timestamp: i64,
    pub source: TransportKind,
    pub exchange_ts: Option<i64>,
}

/// Only validated ticks are stored, so a read never yields a zero or non-finite price.
#[derive(Debug, Default)]
pub struct PriceCache {
    entries: RwLock<HashMap<Symbol, CachedPrice>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, tick: &PriceTick) -> bool {
        if !is_valid_price(tick.price) {
            return false;
        }

        let mut writable = self.entries.write();
        let previous = writable.insert(
            tick.symbol.clone(),
            CachedPrice {
                price: tick.price,
                timestamp: tick.timestamp,
                source: tick.source,
                exchange_ts: tick.exchange_ts,
            },
        );
        previous.map(|entry| entry.price != tick.price).unwrap_or(true)
    }

    pub fn get(&self, symbol: &Symbol) -> Option<CachedPrice> {
        self.entries.read().get(symbol).copied()
    }

    pub fn price(&self, symbol: &Symbol) -> Option<f64> {
        self.get(symbol).map(|entry| entry.price)
    }

    pub fn replay(&self, symbol: &Symbol, now_ms: i64, source: TransportKind) -> Option<PriceTick> {
        let cached = self.get(symbol)?;
        let timestamp = now_ms.max(cached.timestamp);
        let tick = PriceTick::new(
            symbol.clone(),
            cached.price,
            timestamp,
            source,
            cached.exchange_ts,
        )?;
        self.entries.write().insert(
            symbol.clone(),
            CachedPrice {
                timestamp,
                ..cached
            },
        );
        Some(tick)
    }

    pub fn remove(&self, symbol: &Symbol) -> Option<CachedPrice> {
        self.entries.write().remove(symbol)
    }

    pub fn retain_symbols(&self, keep: &[Symbol]) {
        self.entries
            .write()
            .retain(|symbol, _| keep.contains(symbol));
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn prices(&self) -> BTreeMap<Symbol, f64> {
        self.entries
            .read()
            .iter()
            .map(|(symbol, entry)| (symbol.clone(), entry.price))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(symbol: &str, price: f64, timestamp: i64) -> PriceTick {
        PriceTick {
            symbol: Symbol::parse(symbol).expect("symbol should parse"),
            price,
            timestamp,
            source: TransportKind::Ws,
            exchange_ts: None,
        }
    }

    #[test]
    fn never_stores_invalid_prices() {
        let cache = PriceCache::new();
        assert!(cache.record(&tick("AAPL", 190.0, 1)));
        assert!(!cache.record(&tick("AAPL", f64::NAN, 2)));
        assert!(!cache.record(&tick("AAPL", 0.0, 3)));

        let symbol = Symbol::parse("AAPL").expect("symbol should parse");
        let cached = cache.get(&symbol).expect("valid price should be retained");
        assert_eq!(cached.price, 190.0);
        assert_eq!(cached.timestamp, 1);
    }

    #[test]
    fn reports_whether_price_changed() {
        let cache = PriceCache::new();
        assert!(cache.record(&tick("MSFT", 410.0, 1)));
        assert!(!cache.record(&tick("MSFT", 410.0, 2)));
        assert!(cache.record(&tick("MSFT", 410.5, 3)));
    }

    #[test]
    fn replay_refreshes_timestamp_but_not_price() {
        let cache = PriceCache::new();
        cache.record(&tick("TSLA", 250.0, 1_000));
        let symbol = Symbol::parse("TSLA").expect("symbol should parse");

        let replayed = cache
            .replay(&symbol, 5_000, TransportKind::Poll)
            .expect("cached price should replay");
        assert_eq!(replayed.price, 250.0);
        assert_eq!(replayed.timestamp, 5_000);
        assert_eq!(replayed.source, TransportKind::Poll);

        let earlier = cache
            .replay(&symbol, 10, TransportKind::Poll)
            .expect("cached price should replay");
        assert_eq!(earlier.timestamp, 5_000);

        let missing = Symbol::parse("NVDA").expect("symbol should parse");
        assert!(cache.replay(&missing, 5_000, TransportKind::Poll).is_none());
    }

    #[test]
    fn retains_only_requested_symbols() {
        let cache = PriceCache::new();
        cache.record(&tick("AAPL", 1.0, 1));
        cache.record(&tick("MSFT", 2.0, 1));
        cache.record(&tick("TSLA", 3.0, 1));

        let keep = vec![Symbol::parse("MSFT").expect("symbol should parse")];
        cache.retain_symbols(&keep);

        let prices = cache.prices();
        assert_eq!(prices.len(), 1);
        assert_eq!(prices.get(&keep[0]), Some(&2.0));
    }
}
