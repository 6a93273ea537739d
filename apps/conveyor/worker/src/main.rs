//! Conveyor Worker Service - Entry Point
//!
//! Background worker that processes jobs from Redis queues.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    conveyor_worker::run().await
}
