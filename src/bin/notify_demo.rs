//! Demo that pushes a few synthetic alerts through the multiplexer (log only
//! unless DISCORD_WEBHOOK_URL / SLACK_WEBHOOK_URL are set).

use chrono::Utc;
use quake_watch::{AlertEvaluator, EventRecord, NotifierMux};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt().with_target(false).init();
    let mux = NotifierMux::from_env(30);
    let evaluator = AlertEvaluator::default();

    let seq = [
        (4.3, "MARMARA DENIZI"),
        (6.1, "ELBISTAN (KAHRAMANMARAS)"),
        (6.4, "YESILYURT (MALATYA)"),
        (7.1, "NURDAGI (GAZIANTEP)"),
    ];

    for (mag, place) in seq {
        let now = Utc::now();
        let rec = EventRecord::new(now, 38.0, 37.5, mag, now)?
            .with_depth(Some(10.0))
            .with_label(place);
        for intent in evaluator.evaluate(&[rec], 4.0) {
            let delivered = mux.notify(&intent).await;
            println!("{} -> {delivered} channel(s)", intent.severity);
        }
        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
    }

    println!("notify-demo done");
    Ok(())
}
