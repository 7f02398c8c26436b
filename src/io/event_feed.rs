//! JSONL feed of host callbacks for the agent binary
//!
//! One JSON object per line:
//! - `{"type":"fix","latitude":..,"longitude":..,"speed":..,"captured_at_ms":..}`
//!   raw fix routed through the simulated host (may yield enter/exit/position)
//! - `{"type":"enter","latitude":..,"longitude":..}` / `"exit"` - direct geofence callback
//! - `{"type":"position", ...same fields as fix}` - direct continuous update
//! - `{"type":"error","message":".."}` - failed callback
//!
//! Malformed lines are logged and skipped.

use crate::domain::geo::epoch_ms;
use crate::domain::types::{Coordinates, HostEvent, PositionSample};
use crate::io::location::SimulatedLocationProvider;
use serde::Deserialize;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FeedLine {
    Fix(FixLine),
    Enter { latitude: f64, longitude: f64 },
    Exit { latitude: f64, longitude: f64 },
    Position(FixLine),
    Error { message: String },
}

#[derive(Debug, Deserialize)]
struct FixLine {
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    speed: Option<f64>,
    #[serde(default)]
    captured_at_ms: Option<u64>,
}

impl FixLine {
    fn sample(&self) -> PositionSample {
        PositionSample {
            latitude: self.latitude,
            longitude: self.longitude,
            speed_mps: self.speed,
            captured_at_ms: self.captured_at_ms.unwrap_or_else(epoch_ms),
        }
    }
}

/// Translate one feed line into host callbacks
fn parse_line(line: &str, host: &SimulatedLocationProvider) -> Result<Vec<HostEvent>, String> {
    let parsed: FeedLine = serde_json::from_str(line).map_err(|e| e.to_string())?;

    Ok(match parsed {
        FeedLine::Fix(fix) => host.observe(fix.sample()),
        FeedLine::Enter { latitude, longitude } => {
            vec![HostEvent::Enter { at: Coordinates::new(latitude, longitude) }]
        }
        FeedLine::Exit { latitude, longitude } => {
            vec![HostEvent::Exit { at: Coordinates::new(latitude, longitude) }]
        }
        FeedLine::Position(fix) => vec![HostEvent::Position(fix.sample())],
        FeedLine::Error { message } => vec![HostEvent::Error(message)],
    })
}

/// Read the feed until EOF, forwarding callbacks to the session
///
/// Returns the number of callbacks forwarded. Stops early if the session's
/// receiver is gone.
pub async fn run_feed<R>(
    reader: R,
    host: Arc<SimulatedLocationProvider>,
    event_tx: mpsc::Sender<HostEvent>,
) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut forwarded = 0usize;
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        match parse_line(trimmed, &host) {
            Ok(events) => {
                debug!(line = %line_no, callbacks = %events.len(), "feed_line_parsed");
                for event in events {
                    if event_tx.send(event).await.is_err() {
                        info!(forwarded = %forwarded, "feed_receiver_closed");
                        return Ok(forwarded);
                    }
                    forwarded += 1;
                }
            }
            Err(e) => {
                warn!(line = %line_no, error = %e, "feed_line_invalid");
            }
        }
    }

    info!(lines = %line_no, forwarded = %forwarded, "feed_finished");
    Ok(forwarded)
}
