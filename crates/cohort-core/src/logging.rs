use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `default_filter`. With `json` set, events
/// are emitted as one JSON object per line. Returns `false` when a subscriber
/// was already installed (e.g. by a test harness or the host application).
pub fn init(default_filter: &str, json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let _ = init("debug", false);
        assert!(!init("info", true));
    }
}
