use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};
use pathlink_proto::control::PeerIdentity;

use crate::{
    config::DEFAULT_PROXY_LISTEN,
    session_code::{SessionCodeError, SessionParams},
};

pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Multiplex local TCP connections to a remote device over a direct, hole-punched or relayed path
#[derive(Parser, Debug)]
#[command(name = "pathlink", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub session: SessionArgs,

    /// Address the local proxy listens on
    #[arg(short, long, default_value = DEFAULT_PROXY_LISTEN)]
    pub listen: SocketAddr,

    /// JSON file with tunables (timeouts, intervals, reliable stream settings)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log more (repeat for even more)
    #[arg(short, long, action = clap::ArgAction::Count, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a session code for the given session flags, to be passed later with --session-code
    EncodeSession {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct SessionArgs {
    /// Session code with every other session flag bundled in
    #[arg(long, conflicts_with_all = ["order_id", "device_token", "user_token"])]
    pub session_code: Option<String>,

    /// The device's LAN address, for direct connections
    #[arg(long)]
    pub direct: Option<SocketAddr>,

    /// The device's public address, for hole punching
    #[arg(long)]
    pub public: Option<SocketAddr>,

    /// Address of the relay server
    #[arg(long)]
    pub relay: Option<SocketAddr>,

    /// Address of the server that reports our public address
    #[arg(long)]
    pub probe: Option<SocketAddr>,

    #[arg(long)]
    pub order_id: Option<String>,

    #[arg(long)]
    pub device_token: Option<String>,

    #[arg(long)]
    pub user_token: Option<String>,

    /// Port sessions are opened to on the device
    #[arg(long)]
    pub target_port: Option<u16>,
}

#[derive(Debug)]
pub enum ArgumentsError {
    SessionCode(SessionCodeError),
    MissingIdentity(&'static str),
    NoPath,
}

impl std::fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SessionCode(error) => write!(f, "Invalid session code: {error}"),
            Self::MissingIdentity(flag) => write!(f, "Missing {flag} (or --session-code)"),
            Self::NoPath => write!(f, "No path to the device, give at least one of --direct, --public or --relay"),
        }
    }
}

impl SessionArgs {
    /// Builds the session parameters: from the session code if one was given, with any address
    /// flags overriding it, or from the individual flags otherwise.
    pub fn to_params(&self) -> Result<SessionParams, ArgumentsError> {
        let mut params = match &self.session_code {
            Some(code) => SessionParams::deserialize_from_str(code).map_err(ArgumentsError::SessionCode)?,
            None => {
                let required = |value: &Option<String>, flag| value.clone().ok_or(ArgumentsError::MissingIdentity(flag));
                SessionParams::new(PeerIdentity {
                    order_id: required(&self.order_id, "--order-id")?,
                    device_token: required(&self.device_token, "--device-token")?,
                    user_token: required(&self.user_token, "--user-token")?,
                })
            }
        };

        params.direct_addr = self.direct.or(params.direct_addr);
        params.public_addr = self.public.or(params.public_addr);
        params.relay_addr = self.relay.or(params.relay_addr);
        params.probe_addr = self.probe.or(params.probe_addr);
        if let Some(port) = self.target_port {
            params.target_port = port;
        }

        if params.direct_addr.is_none() && params.public_addr.is_none() && params.relay_addr.is_none() {
            return Err(ArgumentsError::NoPath);
        }

        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TARGET_PORT;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pathlink").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_flags() {
        let cli = parse(&[
            "--relay",
            "192.0.2.10:9000",
            "--order-id",
            "o",
            "--device-token",
            "d",
            "--user-token",
            "u",
            "-vv",
        ]);

        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.listen, DEFAULT_PROXY_LISTEN.parse().unwrap());

        let params = cli.session.to_params().unwrap();
        assert_eq!(params.relay_addr, Some("192.0.2.10:9000".parse().unwrap()));
        assert_eq!(params.identity.order_id, "o");
        assert_eq!(params.target_port, DEFAULT_TARGET_PORT);
    }

    #[test]
    fn test_session_code_with_override() {
        let mut params = SessionParams::new(PeerIdentity {
            order_id: "o".to_string(),
            device_token: "d".to_string(),
            user_token: "u".to_string(),
        });
        params.relay_addr = Some("192.0.2.10:9000".parse().unwrap());
        params.target_port = 22;
        let code = params.serialize_to_string().unwrap();

        let cli = parse(&["--session-code", code.as_str(), "--direct", "10.0.0.2:60006"]);
        let parsed = cli.session.to_params().unwrap();
        assert_eq!(parsed.identity, params.identity);
        assert_eq!(parsed.relay_addr, params.relay_addr);
        assert_eq!(parsed.direct_addr, Some("10.0.0.2:60006".parse().unwrap()));
        assert_eq!(parsed.target_port, 22);
    }

    #[test]
    fn test_missing_pieces() {
        let cli = parse(&["--relay", "192.0.2.10:9000", "--order-id", "o"]);
        assert!(matches!(cli.session.to_params(), Err(ArgumentsError::MissingIdentity("--device-token"))));

        let cli = parse(&["--order-id", "o", "--device-token", "d", "--user-token", "u"]);
        assert!(matches!(cli.session.to_params(), Err(ArgumentsError::NoPath)));
    }

    #[test]
    fn test_encode_session_subcommand() {
        let cli = parse(&["encode-session", "--relay", "192.0.2.10:9000", "--order-id", "o", "--device-token", "d", "--user-token", "u"]);
        let Some(Command::EncodeSession { session }) = cli.command else {
            panic!("expected the encode-session subcommand");
        };
        assert!(session.to_params().is_ok());
    }
}
