use std::process;
use std::time::Duration;

/// Generate a random non-zero identifier for ICMP packets
pub fn generate_identifier() -> u16 {
    use rand::Rng;
    rand::thread_rng().gen_range(1..=65535)
}

/// Print error message and exit with error code
pub fn exit_with_error(message: &str, code: i32) -> ! {
    eprintln!("muxping: {}", message);
    process::exit(code);
}

/// Validate ping parameters
pub fn validate_ping_params(
    size: Option<u32>,
    count: Option<u32>,
    timeout: Option<u32>,
    interval: Option<u32>,
) -> anyhow::Result<()> {
    if let Some(size) = size {
        if size > 65500 {
            return Err(anyhow::anyhow!("payload size too large, maximum is 65500 bytes"));
        }
    }

    if let Some(count) = count {
        if count == 0 {
            return Err(anyhow::anyhow!("count must be greater than 0"));
        }
    }

    if let Some(timeout) = timeout {
        if timeout == 0 {
            return Err(anyhow::anyhow!("timeout must be greater than 0"));
        }
    }

    if let Some(interval) = interval {
        if interval == 0 {
            return Err(anyhow::anyhow!("interval must be greater than 0"));
        }
    }

    Ok(())
}

/// Format a round trip time for display
pub fn format_time(rtt: Duration) -> String {
    let ms = rtt.as_secs_f64() * 1000.0;
    if ms < 1.0 {
        "<1ms".to_string()
    } else {
        format!("{:.0}ms", ms)
    }
}

/// Handle Ctrl+C signal for graceful shutdown
pub fn setup_signal_handler() -> tokio::sync::watch::Receiver<bool> {
    let (tx, rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_is_never_zero() {
        for _ in 0..1000 {
            assert_ne!(generate_identifier(), 0);
        }
    }

    #[test]
    fn test_parameter_validation() {
        // Valid parameters
        assert!(validate_ping_params(Some(32), Some(4), Some(4000), Some(1000)).is_ok());

        // Invalid size
        assert!(validate_ping_params(Some(70000), None, None, None).is_err());

        // Invalid count
        assert!(validate_ping_params(None, Some(0), None, None).is_err());

        // Invalid timeout
        assert!(validate_ping_params(None, None, Some(0), None).is_err());

        // Invalid interval
        assert!(validate_ping_params(None, None, None, Some(0)).is_err());
    }

    #[test]
    fn test_time_formatting() {
        assert_eq!(format_time(Duration::from_micros(500)), "<1ms");
        assert_eq!(format_time(Duration::from_millis(1)), "1ms");
        assert_eq!(format_time(Duration::from_micros(15_700)), "16ms");
        assert_eq!(format_time(Duration::from_millis(100)), "100ms");
    }
}
