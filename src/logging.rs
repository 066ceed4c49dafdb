use tracing::Level;

/// Install the global fmt subscriber. `NETMARSHAL_LOG=debug` turns on
/// verbose wire logging; default level is info.
pub fn init() {
    let level = match std::env::var("NETMARSHAL_LOG").ok().as_deref() {
        Some("trace") => Level::TRACE,
        Some("debug") => Level::DEBUG,
        Some("warn") => Level::WARN,
        Some("error") => Level::ERROR,
        _ => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}
