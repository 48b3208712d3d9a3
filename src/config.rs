use crate::session::SessionConfig;
use anyhow::{ bail, Context };
use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;

/// OSC-over-UDP bridge between an ESP32 button/encoder/motor board and a
/// virtual input device.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Config {
    /// ESP32 address (commands and address announcements go here)
    #[arg(long, env = "ESP32_CLIENT_ADDRESS", default_value = "192.168.45.30")]
    pub client_address: String,

    /// ESP32 OSC port
    #[arg(long, env = "ESP32_CLIENT_PORT", default_value_t = 9999)]
    pub client_port: u16,

    /// Listen address for inbound OSC
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// First candidate server port
    #[arg(long, default_value_t = 8888, value_parser = clap::value_parser!(u16).range(1..))]
    pub server_port_min: u16,

    /// End of the candidate server port range (exclusive)
    #[arg(long, default_value_t = 8898)]
    pub server_port_max: u16,

    /// UDP receive buffer size (SO_RCVBUF, 0 = OS default)
    #[arg(long, default_value_t = 256 * 1024)]
    pub recv_buf_size: usize,

    /// Seconds between address announcements
    #[arg(long, default_value_t = 5.0)]
    pub announce_interval_secs: f64,

    /// Interactive mode: announce only on connect and on request
    #[arg(long, default_value_t = false)]
    pub interactive: bool,

    /// Consumer tick rate in Hz
    #[arg(long, default_value_t = 60, value_parser = clap::value_parser!(u32).range(1..=1000))]
    pub tick_hz: u32,

    /// Stats logging interval in seconds (0 = disabled)
    #[arg(long, default_value_t = 5)]
    pub stats_interval_secs: u64,

    /// Read JSON commands from stdin and write state changes to stdout
    #[arg(long, default_value_t = false)]
    pub stdio: bool,
}

impl Config {
    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_hz))
    }

    pub fn session_config(&self) -> anyhow::Result<SessionConfig> {
        if self.server_port_min >= self.server_port_max {
            bail!("empty server port range {}..{}", self.server_port_min, self.server_port_max);
        }
        if !(self.announce_interval_secs.is_finite() && self.announce_interval_secs > 0.0) {
            bail!("announce interval must be positive, got {}", self.announce_interval_secs);
        }
        let listen_host: IpAddr = self.host
            .parse()
            .with_context(|| format!("invalid listen host {:?}", self.host))?;

        Ok(SessionConfig {
            client_address: self.client_address.clone(),
            client_port: self.client_port,
            server_ports: self.server_port_min..self.server_port_max,
            listen_host,
            recv_buf_size: self.recv_buf_size,
            announce_interval: Duration::from_secs_f64(self.announce_interval_secs),
            interactive: self.interactive,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("esp32-osc-bridge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults_match_session_defaults() {
        let config = parse(&[]);
        let session = config.session_config().unwrap();
        assert_eq!(session, SessionConfig::default());
        assert_eq!(config.tick_period(), Duration::from_secs_f64(1.0 / 60.0));
    }

    #[test]
    fn test_overrides() {
        let config = parse(&[
            "--client-address",
            "10.1.2.3",
            "--client-port",
            "7000",
            "--host",
            "127.0.0.1",
            "--server-port-min",
            "9000",
            "--server-port-max",
            "9002",
            "--announce-interval-secs",
            "0.5",
            "--interactive",
        ]);
        let session = config.session_config().unwrap();
        assert_eq!(session.client_address, "10.1.2.3");
        assert_eq!(session.client_port, 7000);
        assert_eq!(session.server_ports, 9000..9002);
        assert_eq!(session.listen_host.to_string(), "127.0.0.1");
        assert_eq!(session.announce_interval, Duration::from_millis(500));
        assert!(session.interactive);
    }

    #[test]
    fn test_rejects_bad_values() {
        let empty = parse(&["--server-port-min", "9000", "--server-port-max", "9000"]);
        assert!(empty.session_config().is_err());

        let host = parse(&["--host", "not-an-ip"]);
        assert!(host.session_config().is_err());

        let interval = parse(&["--announce-interval-secs", "0"]);
        assert!(interval.session_config().is_err());

        assert!(Config::try_parse_from(["esp32-osc-bridge", "--server-port-min", "0"]).is_err());
        assert!(Config::try_parse_from(["esp32-osc-bridge", "--tick-hz", "0"]).is_err());
    }
}
