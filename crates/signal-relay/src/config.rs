use std::env;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Print endpoint `Log` frames; off outside development builds.
    pub dev_mode: bool,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let dev_mode = env::var("SIGNAL_RELAY_DEV")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(cfg!(debug_assertions));
        Self { dev_mode }
    }

    pub fn development() -> Self {
        Self { dev_mode: true }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            dev_mode: cfg!(debug_assertions),
        }
    }
}
