//! Thin wrapper around the mint's json-rpc admin socket. Exits 0 on success
//! and 1 on any rpc error, so it can be scripted.

use std::path::PathBuf;
use std::process::exit;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(version, about = "nutmeg mint admin cli")]
struct Opts {
    /// Path to the mint's admin socket
    #[arg(long, env = "MINT_ADMIN_SOCKET_PATH", default_value = "/tmp/nutmeg-mint.sock")]
    socket: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone)]
enum Command {
    /// Total amount of ecash ever issued
    IssuedEcash,
    /// Total amount of ecash ever redeemed
    RedeemedEcash,
    /// Outstanding balance (issued minus redeemed)
    TotalBalance,
    /// All keysets with their active flag and fee
    ListKeysets,
    /// Generate a new active keyset
    RotateKeyset {
        /// Fee in ppk charged per input proof
        #[arg(long, default_value_t = 0)]
        input_fee_ppk: u64,
    },
}

impl Command {
    fn method(&self) -> &'static str {
        match self {
            Self::IssuedEcash => "issued_ecash",
            Self::RedeemedEcash => "redeemed_ecash",
            Self::TotalBalance => "total_balance",
            Self::ListKeysets => "list_keysets",
            Self::RotateKeyset { .. } => "rotate_keyset",
        }
    }

    fn params(&self) -> Value {
        match self {
            Self::RotateKeyset { input_fee_ppk } => json!({"input_fee_ppk": input_fee_ppk}),
            _ => Value::Null,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let request = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": opts.command.method(),
        "params": opts.command.params(),
    });

    let mut stream = UnixStream::connect(&opts.socket).await.map_err(|err| {
        anyhow::anyhow!("could not connect to {}: {err}", opts.socket.display())
    })?;
    let mut frame = request.to_string();
    frame.push('\n');
    stream.write_all(frame.as_bytes()).await?;

    let mut line = String::new();
    BufReader::new(&mut stream).read_line(&mut line).await?;
    let reply: Value = serde_json::from_str(&line)?;

    if let Some(error) = reply.get("error") {
        eprintln!("{}", serde_json::to_string_pretty(error)?);
        exit(1);
    }

    println!(
        "{}",
        serde_json::to_string_pretty(reply.get("result").unwrap_or(&Value::Null))?
    );
    Ok(())
}
