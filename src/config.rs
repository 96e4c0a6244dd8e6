//! Command-line surface

use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgAction, Parser, ValueEnum};

use crate::module::{xmpp::StartTls, Module, Passthrough};

#[derive(Debug, Parser)]
#[command(name = "mallory")]
#[command(version, about = "Transparent TCP/TLS interception proxy", long_about = None)]
pub struct Args {
    /// Listening port for non-TLS connections.
    #[arg(long = "tcp", value_name = "PORT", default_value_t = 6666)]
    pub tcp_port: u16,

    /// Listening port for TLS connections.
    #[arg(long = "tls", value_name = "PORT", default_value_t = 6443)]
    pub tls_port: u16,

    /// Listening port for the intercept editor and its control channel.
    #[arg(long = "editor", value_name = "PORT", default_value_t = 8080)]
    pub editor_port: u16,

    /// Path to the x509 certificate presented on TLS connections.
    #[arg(long = "x509", value_name = "PATH", default_value = "./certificate/mallory.cer")]
    pub cert_path: PathBuf,

    /// Path to the private key for the certificate.
    #[arg(long = "key", value_name = "PATH", default_value = "./certificate/mallory.key")]
    pub key_path: PathBuf,

    /// Show connection open and close messages.
    #[arg(long, default_value_t = true, action = ArgAction::Set, value_name = "BOOL")]
    pub show: bool,

    /// Data-processing module applied to proxied traffic.
    #[arg(long, value_enum, default_value_t = ModuleKind::Passthrough)]
    pub module: ModuleKind,
}

/// Selectable pipeline modules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModuleKind {
    /// Forward everything untouched, printing each chunk.
    Passthrough,
    /// Follow XMPP sessions through their STARTTLS upgrade.
    Xmpp,
}

impl ModuleKind {
    pub fn instantiate(self) -> Arc<dyn Module> {
        match self {
            ModuleKind::Passthrough => Arc::new(Passthrough),
            ModuleKind::Xmpp => Arc::new(StartTls),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_surface() {
        let args = Args::parse_from(["mallory"]);
        assert_eq!(args.tcp_port, 6666);
        assert_eq!(args.tls_port, 6443);
        assert_eq!(args.editor_port, 8080);
        assert!(args.show);
        assert_eq!(args.module, ModuleKind::Passthrough);
    }

    #[test]
    fn show_accepts_an_explicit_value() {
        let args = Args::parse_from(["mallory", "--show", "false"]);
        assert!(!args.show);
    }

    #[test]
    fn module_is_selectable() {
        let args = Args::parse_from(["mallory", "--module", "xmpp"]);
        assert_eq!(args.module, ModuleKind::Xmpp);
    }
}
