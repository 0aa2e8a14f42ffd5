//! Bus-wide configuration surface
//!
//! Each transport additionally owns its own configuration struct (connection
//! strings, credentials and the like) which lives next to the transport.

use crate::constants::DEFAULT_EMPTY_RESULTS_DELAY;
use crate::naming::NamingOptions;
use crate::registration::UnhandledErrorBehavior;
use serde::Deserialize;
use std::time::Duration;

/// Options applying to the bus as a whole
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfiguration {
    /// How event and consumer names are derived
    pub naming: NamingOptions,

    /// How long polling transports sleep after an empty receive
    pub empty_results_delay: Duration,

    /// Error handling applied to consumers that do not choose their own
    pub default_unhandled_error_behavior: UnhandledErrorBehavior,

    /// Whether transports may create missing broker entities on demand
    pub enable_entity_creation: bool,
}

impl Default for BusConfiguration {
    fn default() -> Self {
        Self {
            naming: NamingOptions::default(),
            empty_results_delay: DEFAULT_EMPTY_RESULTS_DELAY,
            default_unhandled_error_behavior: UnhandledErrorBehavior::Deadletter,
            enable_entity_creation: true,
        }
    }
}
