//! Line-oriented request loop over any async reader/writer pair.
//!
//! Each request runs on its own task so a `status` or `list_models` call is
//! answered while a generation holds the engine. Responses funnel through a
//! channel into a single writer task, so output lines never interleave.
//! Responses may therefore arrive out of request order; callers correlate
//! by `id`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::bridge::protocol::{parse_line, BridgeResponse, Operation};
use crate::error::AirlockError;
use crate::orchestrator::Orchestrator;

/// Responses buffered between request tasks and the writer.
const RESPONSE_BUFFER: usize = 64;

/// Serve requests from `input` until it reaches EOF, then wait for every
/// in-flight request to answer.
pub async fn serve<R, W>(orchestrator: Arc<Orchestrator>, input: R, output: W) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<BridgeResponse>(RESPONSE_BUFFER);

    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(response) = rx.recv().await {
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            output.write_all(&line).await?;
            output.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let mut lines = LinesStream::new(BufReader::new(input).lines());
    let mut in_flight = JoinSet::new();
    let mut received = 0u64;

    while let Some(line) = lines.next().await {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        received += 1;

        let orchestrator = orchestrator.clone();
        let tx = tx.clone();
        in_flight.spawn(async move {
            let response = handle_line(&orchestrator, &line).await;
            if tx.send(response).await.is_err() {
                warn!("Bridge writer closed; dropping response");
            }
        });

        // Reap finished tasks so the set does not grow without bound.
        while in_flight.try_join_next().is_some() {}
    }

    debug!(pending = in_flight.len(), "Bridge input closed");
    while in_flight.join_next().await.is_some() {}

    drop(tx);
    writer.await??;

    info!(requests = received, "Bridge finished");
    Ok(())
}

/// Decode, run and answer a single request line.
pub async fn handle_line(orchestrator: &Orchestrator, line: &str) -> BridgeResponse {
    let request = match parse_line(line) {
        Ok(request) => request,
        Err((id, err)) => {
            warn!("Rejected bridge request: {err}");
            return BridgeResponse::error(id, &err);
        }
    };

    debug!(op = request.op.name(), "Bridge request");
    match dispatch(orchestrator, request.op).await {
        Ok(result) => BridgeResponse::ok(request.id, result),
        Err(err) => BridgeResponse::error(request.id, &err),
    }
}

async fn dispatch(orchestrator: &Orchestrator, op: Operation) -> Result<Value, AirlockError> {
    match op {
        Operation::ListModels => encode(&orchestrator.list_models().await?),
        Operation::GenerateResponse(request) => encode(&orchestrator.generate(request).await?),
        Operation::Status => encode(&orchestrator.status()),
        Operation::Metrics => orchestrator
            .metrics()
            .render()
            .map(Value::String)
            .map_err(|e| AirlockError::Inference(format!("metrics unavailable: {e}"))),
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Value, AirlockError> {
    serde_json::to_value(value)
        .map_err(|e| AirlockError::Inference(format!("response encoding failed: {e}")))
}
