use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match live_price_feed_lib::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("live-price-feed: {error}");
            ExitCode::FAILURE
        }
    }
}
