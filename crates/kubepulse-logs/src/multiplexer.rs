//! Log stream multiplexer
//!
//! One actor task owns every upstream log stream record. Reconcile requests,
//! chunks from reader tasks and upstream terminations all arrive as messages,
//! so the record table is only ever touched from that task.
//!
//! Records carry a stream id. Chunks or termination notices from a stream that
//! has since been torn down (and maybe reopened) are recognised by id and
//! ignored.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::lines::split_lines;
use crate::source::{ChunkSink, LogRequest, LogSource};
use crate::throttle::ThrottleGate;
use kubepulse_hub::TopicHub;
use kubepulse_types::{LogBatch, Topic};

#[derive(Clone, Debug)]
pub struct MultiplexerConfig {
    /// Namespace the log targets live in
    pub namespace: String,
    /// Container to follow; `None` lets the API pick the pod's only container
    pub container: Option<String>,
    /// Lines of history replayed when a stream opens
    pub tail_lines: i64,
    /// Minimum spacing between two batches on one topic
    pub min_emit_interval: Duration,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            container: None,
            tail_lines: 100,
            min_emit_interval: Duration::from_millis(500),
        }
    }
}

/// Targets opened and closed by one reconcile pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

pub(crate) enum Control {
    Reconcile {
        required: BTreeSet<String>,
        reply: oneshot::Sender<ReconcileReport>,
    },
    ActiveTargets {
        reply: oneshot::Sender<BTreeSet<String>>,
    },
}

/// Messages from reader tasks
pub(crate) enum Ingest {
    Chunk {
        target: String,
        stream_id: u64,
        chunk: String,
    },
    Closed {
        target: String,
        stream_id: u64,
        /// `None` for a normal end of stream
        error: Option<String>,
    },
}

/// Cloneable front end of the multiplexer actor
#[derive(Clone)]
pub struct MultiplexerHandle {
    pub(crate) tx: mpsc::UnboundedSender<Control>,
}

impl MultiplexerHandle {
    /// Open streams for targets in `required` that have none and tear down
    /// streams whose target is no longer required.
    pub async fn reconcile(&self, required: BTreeSet<String>) -> Result<ReconcileReport> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Control::Reconcile { required, reply })
            .ok()
            .context("log multiplexer has stopped")?;
        rx.await.context("log multiplexer has stopped")
    }

    /// Targets that currently have an upstream stream
    pub async fn active_targets(&self) -> Result<BTreeSet<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Control::ActiveTargets { reply })
            .ok()
            .context("log multiplexer has stopped")?;
        rx.await.context("log multiplexer has stopped")
    }
}

/// One live upstream stream and its pending lines
struct LogStream {
    stream_id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    buffer: Vec<String>,
    gate: ThrottleGate,
}

impl LogStream {
    fn stop(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

pub struct LogMultiplexer<S: LogSource> {
    source: Arc<S>,
    hub: Arc<TopicHub>,
    config: MultiplexerConfig,
    streams: HashMap<String, LogStream>,
    next_stream_id: u64,
    ingest_tx: mpsc::UnboundedSender<Ingest>,
    cancel: CancellationToken,
}

impl<S: LogSource> LogMultiplexer<S> {
    /// Start the actor. It runs until `cancel` fires or every handle is dropped,
    /// and tears down all of its streams on the way out.
    pub fn spawn(
        source: Arc<S>,
        hub: Arc<TopicHub>,
        config: MultiplexerConfig,
        cancel: CancellationToken,
    ) -> (MultiplexerHandle, JoinHandle<()>) {
        let (tx, control_rx) = mpsc::unbounded_channel();
        let (multiplexer, ingest_rx) = Self::new(source, hub, config, cancel);
        let task = tokio::spawn(multiplexer.run(control_rx, ingest_rx));
        (MultiplexerHandle { tx }, task)
    }

    fn new(
        source: Arc<S>,
        hub: Arc<TopicHub>,
        config: MultiplexerConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Ingest>) {
        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let multiplexer = Self {
            source,
            hub,
            config,
            streams: HashMap::new(),
            next_stream_id: 0,
            ingest_tx,
            cancel,
        };
        (multiplexer, ingest_rx)
    }

    async fn run(
        mut self,
        mut control_rx: mpsc::UnboundedReceiver<Control>,
        mut ingest_rx: mpsc::UnboundedReceiver<Ingest>,
    ) {
        // Buffers left behind by a quiet upstream are flushed on this tick
        let mut flush = tokio::time::interval(self.config.min_emit_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                control = control_rx.recv() => match control {
                    Some(control) => self.handle_control(control),
                    None => break,
                },

                Some(ingest) = ingest_rx.recv() => self.handle_ingest(ingest, Instant::now()),

                _ = flush.tick() => self.flush_due(Instant::now()),
            }
        }

        let remaining = self.streams.len();
        for (_, stream) in self.streams.drain() {
            stream.stop();
        }
        tracing::info!(streams = remaining, "log multiplexer stopped");
    }

    fn handle_control(&mut self, control: Control) {
        match control {
            Control::Reconcile { required, reply } => {
                let report = self.reconcile(&required);
                let _ = reply.send(report);
            }
            Control::ActiveTargets { reply } => {
                let _ = reply.send(self.streams.keys().cloned().collect());
            }
        }
    }

    fn reconcile(&mut self, required: &BTreeSet<String>) -> ReconcileReport {
        let active: BTreeSet<String> = self.streams.keys().cloned().collect();
        let mut report = ReconcileReport::default();

        for target in required.difference(&active) {
            self.open(target);
            report.opened.push(target.clone());
        }

        for target in active.difference(required) {
            if let Some(stream) = self.streams.remove(target) {
                tracing::info!(%target, "closing log stream, no viewers left");
                stream.stop();
                report.closed.push(target.clone());
            }
        }

        report
    }

    fn open(&mut self, target: &str) {
        self.next_stream_id += 1;
        let stream_id = self.next_stream_id;
        let cancel = self.cancel.child_token();

        let request = LogRequest {
            target: target.to_string(),
            namespace: self.config.namespace.clone(),
            container: self.config.container.clone(),
            tail_lines: self.config.tail_lines,
        };
        let sink = ChunkSink::new(target.to_string(), stream_id, self.ingest_tx.clone());
        let task = tokio::spawn(read_stream(
            Arc::clone(&self.source),
            request,
            sink,
            cancel.clone(),
        ));

        tracing::info!(%target, stream_id, "opening log stream");
        self.streams.insert(
            target.to_string(),
            LogStream {
                stream_id,
                cancel,
                task,
                buffer: Vec::new(),
                gate: ThrottleGate::new(self.config.min_emit_interval, Instant::now()),
            },
        );
    }

    fn handle_ingest(&mut self, ingest: Ingest, now: Instant) {
        match ingest {
            Ingest::Chunk {
                target,
                stream_id,
                chunk,
            } => {
                let Some(stream) = self.streams.get_mut(&target) else {
                    return;
                };
                if stream.stream_id != stream_id {
                    return;
                }
                stream.buffer.extend(split_lines(&chunk));
                emit_if_due(&self.hub, &target, stream, now);
            }
            Ingest::Closed {
                target,
                stream_id,
                error,
            } => {
                if self
                    .streams
                    .get(&target)
                    .is_none_or(|stream| stream.stream_id != stream_id)
                {
                    tracing::debug!(%target, stream_id, "ignoring end of a replaced log stream");
                    return;
                }
                if let Some(stream) = self.streams.remove(&target) {
                    match error {
                        Some(error) => tracing::warn!(%target, %error, "log stream failed"),
                        None => tracing::info!(%target, "log stream ended"),
                    }
                    stream.stop();
                }
            }
        }
    }

    fn flush_due(&mut self, now: Instant) {
        for (target, stream) in self.streams.iter_mut() {
            emit_if_due(&self.hub, target, stream, now);
        }
    }
}

/// Emit the buffered lines as one batch if the throttle allows it
fn emit_if_due(hub: &TopicHub, target: &str, stream: &mut LogStream, now: Instant) {
    if stream.buffer.is_empty() || !stream.gate.ready(now) {
        return;
    }

    let lines = std::mem::take(&mut stream.buffer);
    let count = lines.len();
    let viewers = hub.emit(&Topic::logs(target), &LogBatch::new(target.to_string(), lines));
    stream.gate.mark(now);
    tracing::trace!(%target, lines = count, viewers, "emitted log batch");
}

/// Reader task body: follow the upstream until it ends or the record is torn down
async fn read_stream<S: LogSource>(
    source: Arc<S>,
    request: LogRequest,
    sink: ChunkSink,
    cancel: CancellationToken,
) {
    let closer = sink.clone();
    let result = tokio::select! {
        _ = cancel.cancelled() => return,
        result = source.follow(request, sink) => result,
    };
    closer.close(result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use kubepulse_hub::{ServerMessage, ViewerConnection};
    use parking_lot::Mutex;

    #[derive(Clone, Copy)]
    enum FakeEvent {
        Chunk(&'static str),
        End,
        Fail,
    }

    /// Source whose streams are driven by the test
    #[derive(Default)]
    struct FakeSource {
        opened: Mutex<Vec<String>>,
        feeds: Mutex<HashMap<String, mpsc::UnboundedSender<FakeEvent>>>,
    }

    impl FakeSource {
        fn open_count(&self, target: &str) -> usize {
            self.opened.lock().iter().filter(|t| *t == target).count()
        }

        async fn feed(&self, target: &str, event: FakeEvent) {
            for _ in 0..200 {
                // A sender left over from an ended stream fails; wait for the new one
                if self
                    .feeds
                    .lock()
                    .get(target)
                    .is_some_and(|tx| tx.send(event).is_ok())
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            panic!("no stream was opened for {target}");
        }
    }

    impl LogSource for FakeSource {
        async fn follow(&self, request: LogRequest, sink: ChunkSink) -> Result<()> {
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.opened.lock().push(request.target.clone());
            self.feeds.lock().insert(request.target.clone(), tx);

            while let Some(event) = rx.recv().await {
                match event {
                    FakeEvent::Chunk(chunk) => {
                        sink.send(chunk.to_string());
                    }
                    FakeEvent::End => return Ok(()),
                    FakeEvent::Fail => bail!("connection reset"),
                }
            }
            Ok(())
        }
    }

    fn config() -> MultiplexerConfig {
        MultiplexerConfig {
            min_emit_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    fn targets(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn start(
        source: &Arc<FakeSource>,
        hub: &Arc<TopicHub>,
    ) -> (MultiplexerHandle, JoinHandle<()>, CancellationToken) {
        let cancel = CancellationToken::new();
        let (handle, task) =
            LogMultiplexer::spawn(Arc::clone(source), Arc::clone(hub), config(), cancel.clone());
        (handle, task, cancel)
    }

    async fn wait_until_inactive(handle: &MultiplexerHandle, target: &str) {
        for _ in 0..200 {
            if !handle.active_targets().await.unwrap().contains(target) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{target} still active");
    }

    async fn next_batch(viewer: &mut ViewerConnection) -> LogBatch {
        let frame = tokio::time::timeout(Duration::from_secs(2), viewer.frames.recv())
            .await
            .expect("timed out waiting for a batch")
            .expect("viewer queue closed");
        match serde_json::from_str::<ServerMessage>(&frame).unwrap() {
            ServerMessage::Update { data, .. } => serde_json::from_value(data).unwrap(),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reconcile_opens_and_closes() {
        let source = Arc::new(FakeSource::default());
        let hub = Arc::new(TopicHub::new());
        let (handle, _task, cancel) = start(&source, &hub);

        let report = handle.reconcile(targets(&["worker-1"])).await.unwrap();
        assert_eq!(report.opened, vec!["worker-1"]);
        assert!(report.closed.is_empty());
        assert_eq!(handle.active_targets().await.unwrap(), targets(&["worker-1"]));

        let report = handle.reconcile(BTreeSet::new()).await.unwrap();
        assert_eq!(report.closed, vec!["worker-1"]);
        assert!(handle.active_targets().await.unwrap().is_empty());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let source = Arc::new(FakeSource::default());
        let hub = Arc::new(TopicHub::new());
        let (handle, _task, cancel) = start(&source, &hub);

        handle.reconcile(targets(&["a", "b"])).await.unwrap();
        let report = handle.reconcile(targets(&["a", "b"])).await.unwrap();
        assert!(report.is_empty());

        // Let the reader tasks register before counting opens
        source.feed("a", FakeEvent::Chunk("")).await;
        source.feed("b", FakeEvent::Chunk("")).await;
        assert_eq!(source.open_count("a"), 1);
        assert_eq!(source.open_count("b"), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_active_matches_required_after_each_pass() {
        let source = Arc::new(FakeSource::default());
        let hub = Arc::new(TopicHub::new());
        let (handle, _task, cancel) = start(&source, &hub);

        for required in [
            targets(&["a"]),
            targets(&["a", "b", "c"]),
            targets(&["c"]),
            targets(&[]),
            targets(&["b", "d"]),
        ] {
            handle.reconcile(required.clone()).await.unwrap();
            assert_eq!(handle.active_targets().await.unwrap(), required);
        }

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_viewer_membership_drives_one_stream() {
        let source = Arc::new(FakeSource::default());
        let hub = Arc::new(TopicHub::new());
        let (handle, _task, cancel) = start(&source, &hub);
        let a = hub.connect(16);
        let b = hub.connect(16);

        hub.join(Topic::logs("worker-1"), a.id).unwrap();
        hub.join(Topic::logs("worker-1"), b.id).unwrap();
        let report = handle.reconcile(hub.log_targets()).await.unwrap();
        assert_eq!(report.opened, vec!["worker-1"]);

        hub.leave(&Topic::logs("worker-1"), a.id);
        let report = handle.reconcile(hub.log_targets()).await.unwrap();
        assert!(report.is_empty());

        hub.leave(&Topic::logs("worker-1"), b.id);
        let report = handle.reconcile(hub.log_targets()).await.unwrap();
        assert_eq!(report.closed, vec!["worker-1"]);
        assert!(handle.active_targets().await.unwrap().is_empty());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_lines_arrive_batched_and_in_order() {
        let source = Arc::new(FakeSource::default());
        let hub = Arc::new(TopicHub::new());
        let (handle, _task, cancel) = start(&source, &hub);
        let mut viewer = hub.connect(16);
        hub.join(Topic::logs("worker-1"), viewer.id).unwrap();

        handle.reconcile(hub.log_targets()).await.unwrap();
        source.feed("worker-1", FakeEvent::Chunk("one\ntwo\n")).await;
        source.feed("worker-1", FakeEvent::Chunk("three\r\n")).await;
        source.feed("worker-1", FakeEvent::Chunk("four\n")).await;

        let mut received = Vec::new();
        while received.len() < 4 {
            let batch = next_batch(&mut viewer).await;
            assert_eq!(batch.target_name, "worker-1");
            assert!(!batch.lines.is_empty());
            received.extend(batch.lines);
        }
        assert_eq!(received, vec!["one", "two", "three", "four"]);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_upstream_end_removes_record_then_reopens() {
        let source = Arc::new(FakeSource::default());
        let hub = Arc::new(TopicHub::new());
        let (handle, _task, cancel) = start(&source, &hub);

        handle.reconcile(targets(&["worker-1"])).await.unwrap();
        source.feed("worker-1", FakeEvent::End).await;
        wait_until_inactive(&handle, "worker-1").await;

        // Viewers are still there, so the next pass opens a fresh stream
        let report = handle.reconcile(targets(&["worker-1"])).await.unwrap();
        assert_eq!(report.opened, vec!["worker-1"]);

        source.feed("worker-1", FakeEvent::Fail).await;
        wait_until_inactive(&handle, "worker-1").await;
        assert_eq!(source.open_count("worker-1"), 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_stale_stream_end_is_ignored() {
        let source = Arc::new(FakeSource::default());
        let hub = Arc::new(TopicHub::new());
        let (mut multiplexer, _ingest_rx) =
            LogMultiplexer::new(source, hub, config(), CancellationToken::new());

        multiplexer.reconcile(&targets(&["worker-1"]));
        let first = multiplexer.streams["worker-1"].stream_id;
        multiplexer.reconcile(&targets(&[]));
        multiplexer.reconcile(&targets(&["worker-1"]));
        let second = multiplexer.streams["worker-1"].stream_id;
        assert_ne!(first, second);

        let now = Instant::now();
        multiplexer.handle_ingest(
            Ingest::Chunk {
                target: "worker-1".to_string(),
                stream_id: first,
                chunk: "old line\n".to_string(),
            },
            now,
        );
        multiplexer.handle_ingest(
            Ingest::Closed {
                target: "worker-1".to_string(),
                stream_id: first,
                error: None,
            },
            now,
        );

        let stream = &multiplexer.streams["worker-1"];
        assert_eq!(stream.stream_id, second);
        assert!(stream.buffer.is_empty());

        multiplexer.handle_ingest(
            Ingest::Closed {
                target: "worker-1".to_string(),
                stream_id: second,
                error: Some("gone".to_string()),
            },
            now,
        );
        assert!(multiplexer.streams.is_empty());
    }

    #[tokio::test]
    async fn test_throttle_holds_lines_until_interval() {
        let source = Arc::new(FakeSource::default());
        let hub = Arc::new(TopicHub::new());
        let mut viewer = hub.connect(16);
        hub.join(Topic::logs("worker-1"), viewer.id).unwrap();
        let (mut multiplexer, _ingest_rx) =
            LogMultiplexer::new(source, Arc::clone(&hub), config(), CancellationToken::new());

        multiplexer.reconcile(&targets(&["worker-1"]));
        let id = multiplexer.streams["worker-1"].stream_id;
        let opened = Instant::now();

        let chunk = |chunk: &str| Ingest::Chunk {
            target: "worker-1".to_string(),
            stream_id: id,
            chunk: chunk.to_string(),
        };

        // Inside the first interval nothing goes out
        multiplexer.handle_ingest(chunk("a\n"), opened);
        multiplexer.flush_due(opened + Duration::from_millis(10));
        assert!(viewer.frames.try_recv().is_err());

        // The flush tick releases the buffer once the interval has passed
        let later = opened + Duration::from_millis(60);
        multiplexer.handle_ingest(chunk("b\n"), opened + Duration::from_millis(20));
        multiplexer.flush_due(later);
        assert!(viewer.frames.try_recv().is_ok());

        multiplexer.handle_ingest(chunk("c\n"), later + Duration::from_millis(1));
        assert!(viewer.frames.try_recv().is_err());
        assert_eq!(multiplexer.streams["worker-1"].buffer, vec!["c"]);
    }
}
