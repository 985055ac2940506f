mod ini_file;
pub(crate) mod settings;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use rusty_duct::{StreamSettings, TlsSettings, UdsSettings, PROTOCOL_NAME};

use crate::config::ini_file::{get_parser, ConfigSection, HasConfigSection};
use crate::config::settings::ForwardSettings;
use crate::utils::logging::LoggerConfig;

pub(crate) struct Config {
    pub(crate) stream_settings: StreamSettings,
    pub(crate) forward_settings: ForwardSettings,
}

pub(crate) struct ConfigBuilder {
    config_file_path: Option<PathBuf>,
    listen: String,
    accept_proxy_header: bool,
    proxy_header_timeout: Duration,
    tls_certificate: Option<PathBuf>,
    tls_key: Option<PathBuf>,
    tls_alpn: Vec<String>,
    forward_destination: Option<SocketAddr>,
    forward_connect_timeout: Duration,
    forward_queue: usize,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            config_file_path: None,
            listen: String::new(),
            accept_proxy_header: false,
            proxy_header_timeout: Duration::from_secs(5),
            tls_certificate: None,
            tls_key: None,
            tls_alpn: Vec::new(),
            forward_destination: None,
            forward_connect_timeout: Duration::from_secs(5),
            forward_queue: 50,
        }
    }
}

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Options {
    /// Path to the ini configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Override the configured socket endpoint
    #[arg(short, long)]
    listen: Option<String>,
}

impl ConfigBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get_opts(mut self) -> Result<Self> {
        let args = Options::parse();
        #[cfg(debug_assertions)]
        {
            self.config_file_path = Some(
                args.config
                    .unwrap_or(PathBuf::from_str("resources/config/config.ini")?),
            );
        }
        #[cfg(not(debug_assertions))]
        {
            self.config_file_path = args.config;
        }
        if let Some(listen) = args.listen {
            self.listen = listen;
        }
        Ok(self)
    }

    // Also returns LoggerConfig so the logger comes up before build()
    pub(crate) fn get_ini_config(mut self) -> Result<(Self, LoggerConfig)> {
        let Some(config_file_path) = &self.config_file_path else {
            return Err(anyhow!("no configuration file given, pass one with --config"))
        };

        let default_section = "rusty-duct";
        let tls_section = "tls";
        let logger_section = "logger";

        let mut config_map = get_parser().load(config_file_path)
            .map_err(|e| anyhow!(e))?;
        let mut default_map = config_map.try_take_section(default_section)?;
        if self.listen.is_empty() {
            self.listen = default_map.take_value("listen")?;
        }
        if let Some(v) = default_map.take_opt_value("accept-proxy-header") {
            self.accept_proxy_header = v;
        }
        if let Some(v) = default_map.take_opt_value("proxy-header-timeout") {
            self.proxy_header_timeout = v;
        }
        self.forward_destination = default_map.take_opt_value("forward-destination");
        if let Some(v) = default_map.take_opt_value("forward-connect-timeout") {
            self.forward_connect_timeout = v;
        }
        if let Some(v) = default_map.take_opt_value("forward-queue") {
            self.forward_queue = v;
        }

        if let Some(mut tls_map) = config_map.take_section(tls_section) {
            self.tls_certificate = tls_map.take_opt_value("certificate");
            self.tls_key = tls_map.take_opt_value("key");
            self.tls_alpn = tls_map.take_multi_value("alpn")?;
        }

        // Default log config, overridden field by field if the section exists
        let mut log_config = LoggerConfig::default();
        if let Some(mut log_map) = config_map.take_section(logger_section) {
            log_config.log_path = log_map.take_opt_value("log-file");
            log_config.stdout_log = log_map.take_opt_value("print-log");
            if let Some(log_level) = log_map.take_opt_value("print-level") {
                log_config.print_level = log_level;
            }
            if let Some(log_level) = log_map.take_opt_value("logfile-level") {
                log_config.logfile_level = log_level;
            }
        };
        Ok((self, log_config))
    }

    pub(crate) fn build(self) -> Result<Config> {
        let tls = match (self.tls_certificate, self.tls_key) {
            (None, None) => None,
            (Some(certificate), Some(key)) => Some(TlsSettings {
                certificate,
                key,
                alpn: self.tls_alpn,
            }),
            _ => return Err(anyhow!("[tls] needs both 'certificate' and 'key'")),
        };
        let stream_settings = StreamSettings {
            protocol: PROTOCOL_NAME.to_owned(),
            uds: UdsSettings {
                listen: self.listen,
                accept_proxy_header: self.accept_proxy_header,
                proxy_header_timeout: self.proxy_header_timeout,
            },
            tls,
        };
        let forward_settings = ForwardSettings {
            destination: self
                .forward_destination
                .ok_or(anyhow!("'forward-destination' is required"))?,
            connect_timeout: self.forward_connect_timeout,
            queue: self.forward_queue,
        };
        Ok(Config {
            stream_settings,
            forward_settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder_with(listen: &str, destination: Option<&str>) -> ConfigBuilder {
        let mut builder = ConfigBuilder::new();
        builder.listen = listen.to_owned();
        builder.forward_destination = destination.map(|d| d.parse().expect("parsable destination"));
        builder
    }

    #[test]
    fn build_requires_a_destination() {
        assert!(builder_with("/run/test.sock", None).build().is_err());
        assert!(builder_with("/run/test.sock", Some("127.0.0.1:4000")).build().is_ok());
    }

    #[test]
    fn tls_needs_both_halves() {
        let mut builder = builder_with("/run/test.sock", Some("127.0.0.1:4000"));
        builder.tls_certificate = Some(PathBuf::from("cert.pem"));
        assert!(builder.build().is_err());
    }
}
