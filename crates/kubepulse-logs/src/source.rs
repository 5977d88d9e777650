use std::future::Future;

use anyhow::{Context, Result};
use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use kube::api::LogParams;
use tokio::sync::mpsc;

use crate::multiplexer::Ingest;

/// Upper bound on lines coalesced into one chunk when several are already buffered
const LINES_PER_CHUNK: usize = 256;

/// Parameters of one upstream follow connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRequest {
    pub target: String,
    pub namespace: String,
    pub container: Option<String>,
    pub tail_lines: i64,
}

/// Where an upstream connection delivers raw text chunks
#[derive(Clone)]
pub struct ChunkSink {
    target: String,
    stream_id: u64,
    tx: mpsc::UnboundedSender<Ingest>,
}

impl ChunkSink {
    pub(crate) fn new(target: String, stream_id: u64, tx: mpsc::UnboundedSender<Ingest>) -> Self {
        Self {
            target,
            stream_id,
            tx,
        }
    }

    /// Forward a chunk. Returns false once nobody is listening anymore.
    pub fn send(&self, chunk: String) -> bool {
        self.tx
            .send(Ingest::Chunk {
                target: self.target.clone(),
                stream_id: self.stream_id,
                chunk,
            })
            .is_ok()
    }

    pub(crate) fn close(&self, result: Result<()>) {
        let _ = self.tx.send(Ingest::Closed {
            target: self.target.clone(),
            stream_id: self.stream_id,
            error: result.err().map(|e| format!("{e:#}")),
        });
    }
}

/// An upstream that can follow a target's log output
pub trait LogSource: Send + Sync + 'static {
    /// Tail the most recent lines, then keep delivering chunks to `sink`.
    ///
    /// Resolves with `Ok(())` when the upstream ends on its own and with an
    /// error when it fails. The future is dropped to close the connection.
    fn follow(&self, request: LogRequest, sink: ChunkSink) -> impl Future<Output = Result<()>> + Send;
}

/// Follows pod logs through the Kubernetes API
#[derive(Clone)]
pub struct KubeLogSource {
    client: kube::Client,
}

impl KubeLogSource {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

impl LogSource for KubeLogSource {
    async fn follow(&self, request: LogRequest, sink: ChunkSink) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);
        let params = LogParams {
            follow: true,
            container: request.container.clone(),
            tail_lines: Some(request.tail_lines),
            ..Default::default()
        };

        let stream = api
            .log_stream(&request.target, &params)
            .await
            .context(format!("Failed to open log stream for pod {}", request.target))?;

        let mut batches = stream.lines().ready_chunks(LINES_PER_CHUNK);

        while let Some(batch) = batches.next().await {
            let mut chunk = String::new();
            let mut failure = None;

            for line in batch {
                match line {
                    Ok(line) => {
                        chunk.push_str(&line);
                        chunk.push('\n');
                    }
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }

            // Lines read before a failure still go out, in order
            if !chunk.is_empty() && !sink.send(chunk) {
                return Ok(());
            }
            if let Some(e) = failure {
                return Err(e).context(format!("Error reading log stream for pod {}", request.target));
            }
        }

        // Stream ended (pod terminated?)
        Ok(())
    }
}
