//! Listener port allocation

use std::ops::RangeInclusive;

use rand::Rng;
use tokio::net::TcpListener;
use tracing::debug;

use super::error::SetupError;

/// Pick a port uniformly from `range`
pub fn pick_port<R: Rng + ?Sized>(rng: &mut R, range: &RangeInclusive<u16>) -> u16 {
    rng.gen_range(range.clone())
}

/// Bind a listener on a random port from `range`, retrying on bind failure
pub async fn bind_random_port(
    host: &str,
    range: &RangeInclusive<u16>,
    attempts: usize,
) -> Result<(TcpListener, u16), SetupError> {
    if range.is_empty() {
        return Err(SetupError::Config(format!(
            "empty port range {}..={}",
            range.start(),
            range.end()
        )));
    }

    let mut last = String::from("no attempt made");
    for attempt in 1..=attempts {
        let port = pick_port(&mut rand::thread_rng(), range);
        match TcpListener::bind((host, port)).await {
            Ok(listener) => return Ok((listener, port)),
            Err(e) => {
                debug!(port, attempt, error = %e, "Port unavailable");
                last = format!("port {}: {}", port, e);
            }
        }
    }

    Err(SetupError::PortExhausted { attempts, last })
}
