#![deny(
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::unwrap_used
)]
#![allow(clippy::print_stdout)]

//! Operator tool for debugging the sealed exchange.

use std::io::Read;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vaultkeep_api::tokens::CharsetPolicy;
use vk_crypto::SessionKey;

#[derive(Parser)]
#[command(name = "vk-ops", version, about = "VaultKeep operator utilities")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a fresh session key (base64url)
    GenKey,
    /// Seal a JSON payload under a session key
    Seal {
        /// Session key, base64url
        #[arg(short, long, env = "VK_SESSION_KEY")]
        key: String,
        /// JSON payload; read from stdin when omitted
        payload: Option<String>,
    },
    /// Open an envelope and print its JSON payload
    Open {
        #[arg(short, long, env = "VK_SESSION_KEY")]
        key: String,
        /// Envelope in wire form; read from stdin when omitted
        envelope: Option<String>,
    },
    /// Generate a backup passphrase
    Passphrase {
        #[arg(short, long, default_value_t = 40)]
        length: usize,
        /// Leave out symbols
        #[arg(long)]
        no_symbols: bool,
    },
}

fn input_or_stdin(arg: Option<String>) -> anyhow::Result<String> {
    if let Some(value) = arg {
        return Ok(value);
    }
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .context("failed to read stdin")?;
    Ok(buf.trim().to_string())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::GenKey => {
            println!("{}", SessionKey::generate().to_base64url());
        }
        Commands::Seal { key, payload } => {
            let key = SessionKey::from_base64url(&key).context("invalid session key")?;
            let payload: serde_json::Value = serde_json::from_str(&input_or_stdin(payload)?)
                .context("payload is not valid JSON")?;
            let wire = vk_crypto::encode_wire(&payload, &key)?;
            println!("{wire}");
        }
        Commands::Open { key, envelope } => {
            let key = SessionKey::from_base64url(&key).context("invalid session key")?;
            let payload: serde_json::Value =
                vk_crypto::decode_wire(&input_or_stdin(envelope)?, &key)?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Passphrase { length, no_symbols } => {
            let mut policy = CharsetPolicy::password(length);
            policy.symbols = !no_symbols;
            println!("{}", policy.generate()?);
        }
    }

    Ok(())
}
