pub mod aggregator;
pub mod backoff;
pub mod cache;
pub mod candles;
pub mod session;
pub mod sse;
pub mod transport;
pub mod types;
pub mod upstream;

#[cfg(test)]
pub(crate) mod testing;
