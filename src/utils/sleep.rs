use std::time::Duration;

/// Pause used between MQTT reconnect attempts and stats reports
pub async fn sleep_1s() {
    tokio::time::sleep(Duration::from_secs(1)).await;
}
