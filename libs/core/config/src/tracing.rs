use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Install color-eyre panic/error report handlers.
///
/// Call once at the top of `main`, before anything fallible.
pub fn install_color_eyre() {
    let _ = color_eyre::install();
}

/// Initialize the subscriber for a Courier process.
///
/// The format follows [`Environment::log_json`]: JSON with module targets
/// hidden when logs go to an aggregator, pretty output with targets shown
/// for local work. `RUST_LOG` overrides the defaults entirely; without it
/// the noisy dependency layers (tower_http, lettre, handlebars) are
/// pinned below the service's own level so dispatch logs stay readable.
///
/// Safe to call more than once; the first subscriber wins, which is the
/// normal situation in tests.
pub fn init_tracing(environment: &Environment) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if environment.log_json() {
            EnvFilter::new("info,tower_http=info,lettre=warn,handlebars=warn")
        } else {
            EnvFilter::new("debug,tower_http=debug,lettre=info,handlebars=info")
        }
    });

    let result = if environment.log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .pretty()
            .try_init()
    };

    match result {
        Ok(()) => {
            info!("Tracing initialized. Environment: {:?}", environment);
        }
        Err(_) => {
            debug!("Tracing already initialized, keeping the first subscriber");
        }
    }
}
