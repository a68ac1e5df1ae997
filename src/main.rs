use clap::Parser;
use envbeacon::app::{self, Options};
use envbeacon::logging::BrokerLog;
use std::panic::{self, PanicHookInfo};
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

/// Local output on stdout, plus forwarding to the broker once the
/// configuration asks for it.
fn init_logging(verbose: bool, broker_log: &BrokerLog) {
    let default = if verbose { "envbeacon=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(broker_log.layer())
        .init();
}

#[tokio::main]
async fn main() {
    let options = Options::parse();
    let broker_log = BrokerLog::default();
    init_logging(options.verbose, &broker_log);

    // Task panics are caught by the runtime and reported per task; a panic on
    // the main thread means the process itself is broken. Process managers
    // (e.g., systemd) see a distinct exit status for it.
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        error!("panic: {}", info);
        if std::thread::current().name() == Some("main") {
            std::process::exit(EXIT_PANIC);
        }
    }));

    let code = match app::run(options, &broker_log).await {
        Ok(report) if report.is_clean() => {
            info!("shutdown complete");
            EXIT_SUCCESS
        }
        Ok(report) => {
            for fault in report.faults() {
                error!("{fault}");
            }
            EXIT_ERROR
        }
        Err(why) => {
            error!("{why}");
            EXIT_ERROR
        }
    };
    broker_log.close().await;
    std::process::exit(code);
}
