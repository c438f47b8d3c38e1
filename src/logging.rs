//! Logging for the image volume driver.
//!
//! Every log line occurs in the context of an image reference, a mount
//! target path, or a volume id, so logs from concurrent Publish/Unpublish
//! calls can be told apart without reading the whole stream.

#[doc(hidden)]
pub use tracing::{event, Level};

/// Emit a log tagged with the relevant domain context.
#[macro_export]
macro_rules! log {
    ($level:expr, image: $image:expr, $($arg:tt)+) => {
        $crate::logging::event!($level, image = %$image, $($arg)+)
    };
    ($level:expr, target_path: $target:expr, $($arg:tt)+) => {
        $crate::logging::event!($level, target_path = %$target, $($arg)+)
    };
    ($level:expr, volume: $volume:expr, $($arg:tt)+) => {
        $crate::logging::event!($level, volume_id = %$volume, $($arg)+)
    };
    ($level:expr, $($arg:tt)+) => {
        $crate::logging::event!($level, $($arg)+)
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => { $crate::log!($crate::logging::Level::ERROR, $($arg)+) };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => { $crate::log!($crate::logging::Level::WARN, $($arg)+) };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => { $crate::log!($crate::logging::Level::INFO, $($arg)+) };
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)+) => { $crate::log!($crate::logging::Level::DEBUG, $($arg)+) };
}

/// Initializes the OpenTelemetry-backed tracing pipeline. Called once from
/// `main` before any other driver code runs.
///
/// Every `tracing` event is both rendered to stdout as JSON and bridged
/// into an OpenTelemetry log pipeline, matching the teacher's own
/// log-processor setup (`BatchLogProcessor` over a stdout exporter on the
/// Tokio OTEL runtime), adapted from its `log`-crate bridge to the
/// `tracing`-native one since this codebase logs through `tracing`
/// directly rather than through the `log` facade.
pub fn init() {
    use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
    use opentelemetry_sdk::logs::{BatchLogProcessor, LoggerProvider};
    use opentelemetry_sdk::runtime::Tokio as TokioOtelRuntime;
    use opentelemetry_stdout::LogExporter as StdoutLogExporter;
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_processor = BatchLogProcessor::builder(StdoutLogExporter::default(), TokioOtelRuntime).build();
    let logger_provider = LoggerProvider::builder().with_log_processor(log_processor).build();
    let otel_layer = OpenTelemetryTracingBridge::new(&logger_provider);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().json())
        .with(otel_layer)
        .init();
}
