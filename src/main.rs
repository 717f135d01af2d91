//! Thing Historian - Demo Binary
//!
//! Simulates one thing reporting a temperature and a pressure, and a
//! consumer reading one-second aggregates until Ctrl+C.

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use thing_historian::utils::now_millis;
use thing_historian::{AggregateFlags, Historian, HistorianConfig, HistorianResult, HistoryParameters};

const THING: &str = "demo-pump";

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> HistorianResult<()> {
    init_tracing();

    let historian = Historian::new(HistorianConfig::from_env())?;
    let stop = CancellationToken::new();
    {
        let stop = stop.clone();
        if let Err(e) = ctrlc::set_handler(move || stop.cancel()) {
            warn!(error = %e, "Failed to install Ctrl+C handler");
        }
    }

    let token = historian.register_consumer(
        THING,
        HistoryParameters::new()
            .with_sample_window(Duration::from_secs(1))
            .with_aggregates(AggregateFlags::ALL)
            .initial_values(),
        None,
    )?;
    info!(token = %token, thing = THING, "Consumer registered, press Ctrl+C to stop");

    let producer = {
        let historian = historian.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(200));
            let mut seq: u64 = 0;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        seq += 1;
                        let temp = 20.0 + (seq % 10) as f64 * 0.5;
                        historian.add_property_snapshot(THING, "Temp", json!(temp), now_millis(), seq);
                        if seq % 5 == 0 {
                            historian.add_property_snapshot(THING, "Pressure", json!(1.2), now_millis(), seq);
                        }
                    }
                }
            }
        })
    };

    while !stop.is_cancelled() {
        let Some(response) = historian
            .get_history(token, Some(100), 1, Some(Duration::from_secs(5)), &stop, true)
            .await
        else {
            warn!(token = %token, "Consumer token is no longer valid");
            break;
        };

        if response.data_loss_detected {
            warn!("Part of the history was compacted before it was read");
        }
        for item in &response.history_items {
            info!(
                seq = item.sequence_number,
                ts = item.timestamp,
                properties = %serde_json::to_string(&item.properties)?,
                "History item"
            );
        }
    }

    if let Err(e) = producer.await {
        warn!(error = %e, "Producer task failed");
    }
    historian.shutdown()?;
    info!(stats = ?historian.stats(), "Historian stopped");
    Ok(())
}
