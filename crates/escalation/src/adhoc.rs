//! Reminders the device owner asked for at a specific time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::EscalationError;
use crate::messenger::Messenger;

/// Schedule every requested reminder whose time falls within `window` of
/// `now`. Reminders already past are sent without delay. Returns how many
/// were scheduled.
pub async fn poll_requested(
    messenger: &Arc<Messenger>,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Result<usize, EscalationError> {
    let records = messenger.store().get_tracked().await?;
    let mut scheduled = 0;

    for record in records.iter().filter(|r| !r.delay_sent) {
        let Some(delay_at) = record.delay_at else {
            continue;
        };
        let until = delay_at - now;
        let distance = if until < chrono::Duration::zero() { -until } else { until };
        if distance > window {
            continue;
        }

        let delay = until.to_std().unwrap_or_default();
        match messenger.schedule_requested(record, delay, now).await {
            Ok(true) => {
                debug!(serial = %record.serial_number, delay_secs = delay.as_secs(), "requested reminder scheduled");
                scheduled += 1;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(serial = %record.serial_number, error = %e, "could not schedule requested reminder");
            }
        }
    }
    Ok(scheduled)
}
