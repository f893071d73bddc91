use std::{
    net::{IpAddr, Ipv6Addr},
    path::PathBuf,
};

use clap::Parser;

// CLI configuration for the gateway.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct ApplicationConfig {
    /// Domain under which granted subdomains live.
    #[arg(long, value_parser = validate_domain, value_name = "DOMAIN")]
    pub base_domain: String,

    /// File path to the server's host key. Created if missing.
    #[arg(long, default_value_os = ".serverkey", value_name = "FILE")]
    pub host_key: PathBuf,

    /// Address to listen on for client connections.
    #[arg(
        long,
        default_value_t = IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        value_name = "ADDRESS"
    )]
    pub listen_address: IpAddr,

    /// Port to listen on for SSH connections.
    #[arg(long, default_value_t = 2222, value_name = "PORT")]
    pub ssh_port: u16,

    /// Port to listen on for HTTP (proxy) connections.
    #[arg(long, default_value_t = 2491, value_name = "PORT")]
    pub http_port: u16,

    /// File with authorized users. When absent, any connection is accepted.
    #[arg(long, value_name = "FILE")]
    pub users_file: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

fn validate_domain(value: &str) -> Result<String, String> {
    let domain = value.trim().trim_end_matches('.');
    if domain.is_empty() {
        return Err("base domain must not be empty".into());
    }
    let valid_label = |label: &str| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    };
    if !domain.split('.').all(valid_label) {
        return Err(format!("invalid base domain {value:?}"));
    }
    Ok(domain.to_string())
}
