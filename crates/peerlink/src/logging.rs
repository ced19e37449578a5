//! Logging bootstrap

use tracing_subscriber::{fmt, EnvFilter};

/// Numeric verbosity accepted by [`PeerBuilder::debug`](crate::PeerBuilder::debug)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    #[default]
    Off,
    Errors,
    Warnings,
    All,
}

impl LogLevel {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => LogLevel::Off,
            1 => LogLevel::Errors,
            2 => LogLevel::Warnings,
            _ => LogLevel::All,
        }
    }

    fn directive(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Errors => "peerlink=error,peerlink_transport=error",
            LogLevel::Warnings => "peerlink=warn,peerlink_transport=warn",
            LogLevel::All => "peerlink=debug,peerlink_transport=debug,peerlink_core=debug",
        }
    }
}

/// Install a global fmt subscriber for `level`. `RUST_LOG` wins when set.
/// Does nothing if a subscriber is already installed.
pub fn init(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_level() {
        assert_eq!(LogLevel::from_level(0), LogLevel::Off);
        assert_eq!(LogLevel::from_level(2), LogLevel::Warnings);
        assert_eq!(LogLevel::from_level(9), LogLevel::All);
        assert!(LogLevel::Errors < LogLevel::All);
    }
}
