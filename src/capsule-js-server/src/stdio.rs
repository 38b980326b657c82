//! Line-delimited JSON-RPC over stdio: one frame per line, in and out.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use crate::ops::Service;
use crate::rpc::{self, RpcRequest, RpcResponse};

/// Serve frames from stdin until it closes.
pub async fn serve(service: Arc<Service>) -> anyhow::Result<()> {
    info!("stdio transport listening");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => rpc::dispatch(&service, request).await,
            Err(error) => RpcResponse::parse_error(error.to_string()),
        };
        let mut frame = serde_json::to_string(&response)?;
        frame.push('\n');
        stdout.write_all(frame.as_bytes()).await?;
        stdout.flush().await?;
    }
    info!("stdin closed, stdio transport stopping");
    Ok(())
}
