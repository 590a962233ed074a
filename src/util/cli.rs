use clap::Args;
use tracing::Level;

/// Logging flags shared by all binaries
#[derive(Args, Debug, Clone, Copy)]
pub struct Verbosity {
    #[clap(short, long, default_value_t = false)]
    pub verbose: bool,

    #[clap(long, default_value_t = false)]
    pub very_verbose: bool,
}

impl Verbosity {
    pub fn level(&self) -> Level {
        match (self.verbose, self.very_verbose) {
            (_, true) => Level::TRACE,
            (true, _) => Level::DEBUG,
            (false, false) => Level::INFO,
        }
    }

    pub fn init_logging(&self) {
        tracing_subscriber::fmt()
            .with_max_level(self.level())
            .try_init()
            .ok();
    }
}
