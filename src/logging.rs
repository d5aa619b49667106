use anyhow::{Result, anyhow};
use tracing_subscriber::{EnvFilter, fmt};

/// Environment variable holding an `EnvFilter` directive, e.g. `subspawn=debug`.
pub const LOG_ENV: &str = "SUBSPAWN_LOG";

fn default_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "subspawn=warn",
        1 => "subspawn=debug",
        _ => "subspawn=trace",
    }
}

/// Install the stderr subscriber. `SUBSPAWN_LOG` wins over `-v` flags.
pub fn init(verbosity: u8) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity)));

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("installing log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_level() {
        assert_eq!(default_directive(0), "subspawn=warn");
        assert_eq!(default_directive(1), "subspawn=debug");
        assert_eq!(default_directive(5), "subspawn=trace");
        for v in 0..3 {
            assert!(default_directive(v).parse::<EnvFilter>().is_ok());
        }
    }
}
