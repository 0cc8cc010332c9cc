//! Event sink that writes resilience events to `tracing`.

use resilience_core::event::{EventSink, EventType, ResilienceEvent};

/// Logs every event: rejections and state changes at `warn`, retries and
/// timeouts at `info`.
///
/// Useful as a default audit trail when no dedicated event collaborator is
/// wired in.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: ResilienceEvent) {
        let correlation_id = event.correlation_id.as_deref().unwrap_or("-");
        let metadata = format_metadata(&event);

        match event.event_type {
            EventType::CircuitStateChange | EventType::BulkheadRejection | EventType::RateLimitHit => {
                tracing::warn!(
                    event = %event.event_type,
                    service = %event.service_name,
                    correlation_id,
                    timestamp = %event.timestamp,
                    metadata = %metadata,
                    "Resilience event"
                );
            }
            EventType::RetryAttempt | EventType::Timeout => {
                tracing::info!(
                    event = %event.event_type,
                    service = %event.service_name,
                    correlation_id,
                    timestamp = %event.timestamp,
                    metadata = %metadata,
                    "Resilience event"
                );
            }
        }
    }
}

fn format_metadata(event: &ResilienceEvent) -> String {
    event
        .metadata
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use resilience_core::environment::Clock;
    use resilience_testing::{init_tracing, test_clock};

    #[test]
    fn test_metadata_is_sorted_key_value_pairs() {
        let event = ResilienceEvent::new(EventType::RetryAttempt, "svc", test_clock().now())
            .with_metadata("delay_ms", 200)
            .with_metadata("attempt", 1);
        assert_eq!(format_metadata(&event), "attempt=1 delay_ms=200");
    }

    #[test]
    fn test_emit_every_event_type() {
        init_tracing();
        let sink = TracingEventSink;
        for event_type in [
            EventType::RetryAttempt,
            EventType::RateLimitHit,
            EventType::CircuitStateChange,
            EventType::BulkheadRejection,
            EventType::Timeout,
        ] {
            sink.emit(
                ResilienceEvent::new(event_type, "svc", test_clock().now())
                    .with_correlation_id(Some("req-1")),
            );
        }
    }
}
