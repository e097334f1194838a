pub mod health;
pub mod price_stream;
