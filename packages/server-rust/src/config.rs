//! Dispatcher tuning: timeouts, channel sizes, and the registration and
//! handler-error policies.

use std::time::Duration;

/// How a session's expected service is matched against the registry at start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RegistrationMode {
    /// Scan every registry entry; the first entry whose (protocol, service)
    /// differs from the session's aborts start. A registry holding services
    /// for other protocols therefore fails dispatch. Protocol and service are
    /// compared separately, so `("ab", "c")` never stands in for `("a", "bc")`.
    #[default]
    Strict,
    /// Look up the session's own key directly and ignore unrelated entries.
    Lookup,
}

/// What happens to a call whose generic handler returned an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum HandlerErrorPolicy {
    /// Deliver the failure to the caller as an error-shaped reply.
    #[default]
    Reply,
    /// Log the failure and send nothing; the caller times out.
    Drop,
}

/// Dispatcher and session tuning.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How long a caller waits for its reply slot to be filled.
    pub call_timeout: Duration,
    /// Bounded request channel capacity per session.
    pub channel_capacity: usize,
    /// Handler invocations allowed in flight per session. `1` processes
    /// calls strictly one at a time in arrival order.
    pub max_concurrent_calls: usize,
    /// Upper bound on a single handler invocation. `None` waits indefinitely.
    pub handler_timeout: Option<Duration>,
    /// Maximum time `stop()` waits for in-flight calls before abandoning them.
    pub drain_timeout: Duration,
    pub registration_mode: RegistrationMode,
    pub handler_error_policy: HandlerErrorPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            max_concurrent_calls: 1,
            handler_timeout: None,
            drain_timeout: Duration::from_secs(30),
            registration_mode: RegistrationMode::Strict,
            handler_error_policy: HandlerErrorPolicy::Reply,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatcher_config_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.channel_capacity, 256);
        assert_eq!(config.max_concurrent_calls, 1);
        assert!(config.handler_timeout.is_none());
        assert_eq!(config.registration_mode, RegistrationMode::Strict);
        assert_eq!(config.handler_error_policy, HandlerErrorPolicy::Reply);
    }
}
