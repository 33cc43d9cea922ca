//! Management rpc on a unix-domain socket: line-delimited json-rpc 2.0,
//! only reachable from the local machine.

use std::path::PathBuf;

use nutmeg_core::keyset::{V1Keyset, V1Keysets};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info};

use crate::error::NutmegMintError;
use crate::mint::Mint;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Value,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RotateKeysetParams {
    input_fee_ppk: u64,
}

pub async fn run_admin_server(mint: Mint, socket_path: PathBuf) -> anyhow::Result<()> {
    // a stale socket file from a previous run blocks the bind
    let _ = std::fs::remove_file(&socket_path);
    let listener = UnixListener::bind(&socket_path)?;
    info!("admin rpc listening on {}", socket_path.display());

    loop {
        let (stream, _) = listener.accept().await?;
        let mint = mint.clone();
        tokio::spawn(async move {
            handle_connection(mint, stream).await;
        });
    }
}

async fn handle_connection(mint: Mint, stream: UnixStream) {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!("admin request: {line}");
        let mut reply = handle_line(&mint, &line).await;
        reply.push('\n');
        if writer.write_all(reply.as_bytes()).await.is_err() {
            break;
        }
    }
}

fn result_frame(id: &Value, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string()
}

fn error_frame(id: &Value, code: i64, message: &str) -> String {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}}).to_string()
}

async fn handle_line(mint: &Mint, line: &str) -> String {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(_) => return error_frame(&Value::Null, -32700, "parse error"),
    };

    match dispatch(mint, &request).await {
        Ok(result) => result_frame(&request.id, result),
        Err(DispatchError::UnknownMethod) => {
            error_frame(&request.id, -32601, "method not found")
        }
        Err(DispatchError::InvalidParams) => error_frame(&request.id, -32602, "invalid params"),
        Err(DispatchError::Mint(err)) => error_frame(&request.id, -32000, &err.to_string()),
    }
}

enum DispatchError {
    UnknownMethod,
    InvalidParams,
    Mint(NutmegMintError),
}

impl From<NutmegMintError> for DispatchError {
    fn from(err: NutmegMintError) -> Self {
        Self::Mint(err)
    }
}

async fn dispatch(mint: &Mint, request: &RpcRequest) -> Result<Value, DispatchError> {
    match request.method.as_str() {
        "issued_ecash" => Ok(json!({"issued": mint.issued_ecash().await?})),
        "redeemed_ecash" => Ok(json!({"redeemed": mint.redeemed_ecash().await?})),
        "total_balance" => Ok(json!({"balance": mint.total_balance().await?})),
        "list_keysets" => {
            let keysets = mint
                .keyset_infos()
                .await
                .iter()
                .map(V1Keyset::from)
                .collect::<Vec<_>>();
            Ok(json!(V1Keysets { keysets }))
        }
        "rotate_keyset" => {
            let params: RotateKeysetParams = serde_json::from_value(request.params.clone())
                .map_err(|_| DispatchError::InvalidParams)?;
            let info = mint.rotate_keyset(params.input_fee_ppk).await?;
            Ok(json!(V1Keyset::from(&info)))
        }
        _ => Err(DispatchError::UnknownMethod),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    use crate::config::MintConfig;
    use crate::database::memory::MemoryStore;
    use crate::lightning::fake::FakeLightning;
    use crate::lightning::LightningType;
    use crate::mint::Mint;

    async fn rpc_roundtrip(socket: &std::path::Path, request: Value) -> anyhow::Result<Value> {
        let mut stream = UnixStream::connect(socket).await?;
        let mut frame = request.to_string();
        frame.push('\n');
        stream.write_all(frame.as_bytes()).await?;

        let mut line = String::new();
        BufReader::new(&mut stream).read_line(&mut line).await?;
        Ok(serde_json::from_str(&line)?)
    }

    #[tokio::test]
    async fn test_admin_rpc() -> anyhow::Result<()> {
        let mint = Mint::init(
            Arc::new(FakeLightning::new()),
            LightningType::Fake,
            Arc::new(MemoryStore::new()),
            MintConfig::default(),
        )
        .await?;

        let dir = tempfile::tempdir()?;
        let socket_path = dir.path().join("admin.sock");
        {
            let mint = mint.clone();
            let socket_path = socket_path.clone();
            tokio::spawn(async move {
                let _ = super::run_admin_server(mint, socket_path).await;
            });
        }
        // wait for the listener to come up
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let reply = rpc_roundtrip(
            &socket_path,
            json!({"jsonrpc": "2.0", "id": 1, "method": "total_balance"}),
        )
        .await?;
        assert_eq!(reply["result"]["balance"], 0);

        let reply = rpc_roundtrip(
            &socket_path,
            json!({"jsonrpc": "2.0", "id": 2, "method": "list_keysets"}),
        )
        .await?;
        assert_eq!(reply["result"]["keysets"].as_array().unwrap().len(), 1);

        let reply = rpc_roundtrip(
            &socket_path,
            json!({"jsonrpc": "2.0", "id": 3, "method": "rotate_keyset", "params": {"input_fee_ppk": 100}}),
        )
        .await?;
        assert_eq!(reply["result"]["input_fee_ppk"], 100);
        assert_eq!(reply["result"]["active"], true);

        let reply = rpc_roundtrip(
            &socket_path,
            json!({"jsonrpc": "2.0", "id": 4, "method": "no_such_method"}),
        )
        .await?;
        assert_eq!(reply["error"]["code"], -32601);
        Ok(())
    }
}
