use crate::market::types::PriceTick;
use serde::{Deserialize, Serialize};

pub const MIN_CANDLE_PRICE: f64 = 0.01;
pub const DEFAULT_HISTORY_LIMIT: usize = 5_000;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TimeframeUnit {
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimeframeUnit {
    /// Month and year are fixed 30 and 365 day spans, not calendar-aligned.
    pub fn width_ms(self) -> i64 {
        match self {
            Self::Minute => MINUTE_MS,
            Self::Hour => HOUR_MS,
            Self::Day => DAY_MS,
            Self::Week => 7 * DAY_MS,
            Self::Month => 30 * DAY_MS,
            Self::Year => 365 * DAY_MS,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Self::Minute => "m",
            Self::Hour => "h",
            Self::Day => "d",
            Self::Week => "w",
            Self::Month => "M",
            Self::Year => "y",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Timeframe {
    pub multiplier: u32,
    pub unit: TimeframeUnit,
}

impl Timeframe {
    pub fn new(multiplier: u32, unit: TimeframeUnit) -> Self {
        Self { multiplier, unit }
    }

    pub fn bucket_width_ms(&self) -> i64 {
        i64::from(self.multiplier).saturating_mul(self.unit.width_ms())
    }

    /// Lower-case `m` is minutes, upper-case `M` is months.
    pub fn parse_str(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let split_at = raw.find(|ch: char| !ch.is_ascii_digit())?;
        let (digits, suffix) = raw.split_at(split_at);
        let multiplier = if digits.is_empty() {
            1
        } else {
            digits.parse::<u32>().ok()?
        };
        if multiplier == 0 {
            return None;
        }

        let unit = match suffix {
            "m" | "min" | "minute" => TimeframeUnit::Minute,
            "h" | "H" | "hour" => TimeframeUnit::Hour,
            "d" | "D" | "day" => TimeframeUnit::Day,
            "w" | "W" | "week" => TimeframeUnit::Week,
            "M" | "mo" | "month" => TimeframeUnit::Month,
            "y" | "Y" | "year" => TimeframeUnit::Year,
            _ => return None,
        };
        Some(Self { multiplier, unit })
    }

    pub fn label(&self) -> String {
        format!("{}{}", self.multiplier, self.unit.suffix())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Candle {
    pub fn from_price(bucket_start: i64, price: f64) -> Self {
        Self {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }

    pub fn with_price(&self, price: f64) -> Self {
        let open = if self.open.is_finite() && self.open > 0.0 {
            self.open
        } else {
            price
        };
        Self {
            bucket_start: self.bucket_start,
            open,
            high: self.high.max(price),
            low: self.low.min(price),
            close: price,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Rejected,
    Late,
    Updated,
    Appended,
}

pub fn bucket_start_ms(now_ms: i64, bucket_width_ms: i64) -> Option<i64> {
    now_ms
        .checked_div_euclid(bucket_width_ms)?
        .checked_mul(bucket_width_ms)
}

/// Folds one price into the tail of `candles`, in place. Never touches
/// anything but the last candle and never inserts behind it.
pub fn merge_into(
    candles: &mut Vec<Candle>,
    price: f64,
    now_ms: i64,
    timeframe: Option<&Timeframe>,
) -> MergeOutcome {
    if !price.is_finite() || price <= MIN_CANDLE_PRICE {
        return MergeOutcome::Rejected;
    }
    let width = match timeframe.map(Timeframe::bucket_width_ms) {
        Some(width) if width > 0 => width,
        _ => return MergeOutcome::Rejected,
    };

    let Some(bucket_start) = bucket_start_ms(now_ms, width) else {
        return MergeOutcome::Rejected;
    };
    match candles.last_mut() {
        Some(last) if last.bucket_start == bucket_start => {
            *last = last.with_price(price);
            MergeOutcome::Updated
        }
        Some(last) if last.bucket_start > bucket_start => MergeOutcome::Late,
        _ => {
            candles.push(Candle::from_price(bucket_start, price));
            MergeOutcome::Appended
        }
    }
}

pub fn merge(
    candles: &[Candle],
    price: f64,
    now_ms: i64,
    timeframe: Option<&Timeframe>,
) -> Vec<Candle> {
    let mut next = candles.to_vec();
    merge_into(&mut next, price, now_ms, timeframe);
    next
}

#[derive(Debug, Clone)]
pub struct CandleSeries {
    timeframe: Timeframe,
    candles: Vec<Candle>,
    max_len: usize,
}

impl CandleSeries {
    pub fn new(timeframe: Timeframe, history: Vec<Candle>, max_len: usize) -> Self {
        let mut series = Self {
            timeframe,
            candles: history,
            max_len: max_len.max(1),
        };
        series.truncate();
        series
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn apply_tick(&mut self, tick: &PriceTick) -> MergeOutcome {
        self.apply_price(tick.price, tick.timestamp)
    }

    pub fn apply_price(&mut self, price: f64, now_ms: i64) -> MergeOutcome {
        let outcome = merge_into(&mut self.candles, price, now_ms, Some(&self.timeframe));
        if outcome == MergeOutcome::Appended {
            self.truncate();
        }
        outcome
    }

    fn truncate(&mut self) {
        if self.candles.len() > self.max_len {
            let overflow = self.candles.len() - self.max_len;
            self.candles.drain(0..overflow);
        }
    }
}
