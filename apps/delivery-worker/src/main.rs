//! Delivery Worker Service - Entry Point
//!
//! Background worker pool that dispatches queued email jobs.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    courier_delivery_worker::run().await
}
