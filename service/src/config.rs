use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::LevelFilter;
use std::time::Duration;

const DEFAULT_INTERFACE: &str = "127.0.0.1";

/// Room for the initial `retry` frame, which is written before the body is polled.
const MIN_EVENT_BUFFER_BYTES: usize = 256;

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// A list of full CORS origin URLs that allowed to receive server responses.
    #[arg(
        long,
        env,
        value_delimiter = ',',
        use_value_delimiter = true,
        default_value = "http://localhost:3000,https://localhost:3000"
    )]
    pub allowed_origins: Vec<String>,

    /// The host interface to listen for incoming connections
    #[arg(short, long, env, default_value = DEFAULT_INTERFACE)]
    pub interface: Option<String>,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env, default_value_t = 4000)]
    pub port: u16,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env,
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap_or(LevelFilter::Info)),
        )]
    pub log_level_filter: LevelFilter,

    /// Seconds between keep-alive events sent to every open stream. 0 disables them.
    #[arg(long, env, default_value_t = 15)]
    pub keep_alive_secs: u64,

    /// Reconnection interval (milliseconds) announced to each client when its stream opens.
    /// 0 leaves the client on its own default.
    #[arg(long, env, default_value_t = 3000)]
    pub client_retry_ms: u64,

    /// Bytes buffered between an event stream's encoder and the HTTP response body
    #[arg(long, env, default_value_t = 64 * 1024)]
    pub event_buffer_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        // Load .env file first
        dotenv().ok();
        // Then parse the command line parameters and flags
        Config::parse()
    }

    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or(DEFAULT_INTERFACE)
    }

    /// Address the server binds to, e.g. `127.0.0.1:4000`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.interface(), self.port)
    }

    pub fn keep_alive_interval(&self) -> Option<Duration> {
        (self.keep_alive_secs > 0).then(|| Duration::from_secs(self.keep_alive_secs))
    }

    pub fn client_retry_ms(&self) -> Option<u64> {
        (self.client_retry_ms > 0).then_some(self.client_retry_ms)
    }

    pub fn event_buffer_bytes(&self) -> usize {
        self.event_buffer_bytes.max(MIN_EVENT_BUFFER_BYTES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let argv = std::iter::once("eventsource_rs").chain(args.iter().copied());
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);

        assert_eq!(config.keep_alive_interval(), Some(Duration::from_secs(15)));
        assert_eq!(config.client_retry_ms(), Some(3000));
        assert_eq!(config.event_buffer_bytes(), 64 * 1024);
    }

    #[test]
    fn test_listen_address_joins_interface_and_port() {
        let config = parse(&["--interface", "0.0.0.0", "--port", "8080"]);
        assert_eq!(config.listen_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_allowed_origins_are_comma_delimited() {
        let config = parse(&[
            "--allowed-origins",
            "https://a.example,https://b.example",
        ]);

        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );
    }

    #[test]
    fn test_zero_values_disable_keep_alive_and_retry() {
        let config = parse(&["--keep-alive-secs", "0", "--client-retry-ms", "0"]);

        assert_eq!(config.keep_alive_interval(), None);
        assert_eq!(config.client_retry_ms(), None);
    }

    #[test]
    fn test_log_level_filter_rejects_unknown_levels() {
        let argv = ["eventsource_rs", "--log-level-filter", "LOUD"];
        assert!(Config::try_parse_from(argv).is_err());

        let config = parse(&["--log-level-filter", "DEBUG"]);
        assert_eq!(config.log_level_filter, LevelFilter::Debug);
    }
}
