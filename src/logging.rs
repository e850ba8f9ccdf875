use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// `AGENTBOX_LOG` value to a level; anything unrecognised means INFO.
pub(crate) fn parse_level(value: Option<&str>) -> Level {
    value
        .and_then(|v| v.trim().parse::<Level>().ok())
        .unwrap_or(Level::INFO)
}

/// Install the process-wide subscriber. Safe to call more than once.
pub(crate) fn init() {
    let level = parse_level(std::env::var("AGENTBOX_LOG").ok().as_deref());
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}
