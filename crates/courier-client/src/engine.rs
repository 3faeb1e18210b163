// Batch delivery over pooled connections with error attribution and resume.
//
// Each segment runs a writer task and an error-reader task on one connection.
// The writer streams frames in submission order; the reader blocks on the
// 6-byte error response. Once either side reaches a terminal outcome (or the
// grace period after the last write elapses) the other is cancelled, the
// connection is closed, and `reconcile` decides which notifications were
// handled and where the next segment starts.
use std::io;
use std::time::Duration;

use bytes::Bytes;
use courier_transport::{Connection, ConnectionReader, ConnectionWriter, Dial, TransportError};
use courier_wire::{ERROR_RESPONSE_LEN, ErrorResponse, ErrorStatus};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

use crate::config::ClientConfig;
use crate::notification::Notification;
use crate::pool::{ConnectionPool, PoolSettings};
use crate::{ClientError, ErrorHook, counters, notify_hook};

// Bound on waiting for a cancelled task before aborting it.
const CANCEL_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Pacing and payload rules for one batch.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub grace_period: Duration,
    pub packet_size: usize,
    pub max_payload_bytes: usize,
    /// Marker appended to truncated alerts; `None` disables truncation.
    pub truncate_marker: Option<String>,
    pub max_stalled_segments: u32,
}

impl From<&ClientConfig> for EngineSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            grace_period: config.grace_period,
            packet_size: config.packet_size,
            max_payload_bytes: config.max_payload_bytes,
            truncate_marker: config
                .truncate_alert
                .then(|| config.truncate_marker.clone()),
            max_stalled_segments: config.max_stalled_segments,
        }
    }
}

/// A notification the gateway rejected, or that was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedNotification {
    /// Position in the submitted batch.
    pub index: usize,
    pub id: u32,
    pub status: ErrorStatus,
}

/// Outcome of a batch. Every submitted notification is counted exactly once
/// across `delivered`, `failed` and `invalid`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: Vec<FailedNotification>,
    /// Indices rejected before transmission (payload too large).
    pub invalid: Vec<usize>,
    pub segments: usize,
}

impl DeliveryReport {
    pub fn total(&self) -> usize {
        self.delivered + self.failed.len() + self.invalid.len()
    }

    pub fn all_delivered(&self) -> bool {
        self.failed.is_empty() && self.invalid.is_empty()
    }
}

/// Drives one batch to completion. The engine owns its pool and tears it
/// down when the batch ends, successfully or not.
pub struct DeliveryEngine<D: Dial> {
    pool: ConnectionPool<D>,
    settings: EngineSettings,
    hook: Option<ErrorHook>,
}

impl<D: Dial> DeliveryEngine<D> {
    pub fn new(dialer: D, config: &ClientConfig, hook: Option<ErrorHook>) -> Self {
        Self::with_settings(dialer, PoolSettings::from(config), EngineSettings::from(config), hook)
    }

    pub fn with_settings(
        dialer: D,
        pool: PoolSettings,
        settings: EngineSettings,
        hook: Option<ErrorHook>,
    ) -> Self {
        Self {
            pool: ConnectionPool::new(dialer, pool, hook.clone()),
            settings,
            hook,
        }
    }

    /// Deliver `notifications` in order.
    ///
    /// Ids `0..n` are assigned first. `progress` receives a running count of
    /// processed notifications. Only pool exhaustion aborts the batch early,
    /// as [`ClientError::Aborted`] carrying the report gathered so far; every
    /// other failure is recorded on the notification and in the report.
    pub async fn deliver(
        self,
        notifications: &mut [Notification],
        mut on_progress: impl FnMut(usize) + Send,
    ) -> Result<DeliveryReport, ClientError> {
        let mut progress = Progress {
            callback: &mut on_progress,
            reported: 0,
        };
        let result = self.run(notifications, &mut progress).await;
        self.pool.drain_and_close().await;
        result
    }

    async fn run(
        &self,
        notifications: &mut [Notification],
        progress: &mut Progress<'_>,
    ) -> Result<DeliveryReport, ClientError> {
        let mut report = DeliveryReport::default();
        let mut queue = Vec::with_capacity(notifications.len());
        let mut frames = Vec::with_capacity(notifications.len());
        for (index, notification) in notifications.iter_mut().enumerate() {
            let id = u32::try_from(index)
                .map_err(|_| ClientError::Config("batch exceeds the identifier space".into()))?;
            notification.assign_id(id);
            notification.mark_as_unsent();
            match self.encode(notification) {
                Ok(frame) => {
                    queue.push(id);
                    frames.push(frame);
                }
                Err(err) => {
                    tracing::warn!(id, error = %err, "notification excluded from batch");
                    counters::record_invalid_payload();
                    notify_hook(self.hook.as_ref(), &err);
                    notification.mark_invalid(err.to_string());
                    report.invalid.push(index);
                }
            }
        }
        let mut processed = report.invalid.len();
        progress.advance(processed);
        if queue.is_empty() {
            return Ok(report);
        }

        self.pool.fill(self.pool.settings().size);
        let mut start = 0usize;
        let mut stalled = 0u32;
        while start < queue.len() {
            let connection = match self.pool.acquire().await {
                Ok(connection) => connection,
                Err(source) => {
                    return Err(ClientError::Aborted {
                        report,
                        source: Box::new(source),
                    });
                }
            };
            counters::record_segment(report.segments > 0);
            let segment = report.segments;
            report.segments += 1;

            let ids = &queue[start..];
            let outcome = self
                .run_segment(connection, segment, &frames[start..], processed, progress)
                .await;
            let resolution = reconcile(ids, outcome.attempted, outcome.reader.as_ref());
            tracing::debug!(
                segment,
                attempted = outcome.attempted,
                sent = resolution.sent,
                resume_from = resolution.resume_from,
                "segment reconciled"
            );

            for &id in &ids[..resolution.sent] {
                notifications[id as usize].mark_as_sent();
            }
            report.delivered += resolution.sent;
            if let Some(status) = resolution.failed {
                let id = ids[resolution.sent];
                notifications[id as usize].mark_failed(status);
                report.failed.push(FailedNotification {
                    index: id as usize,
                    id,
                    status,
                });
            }
            processed += resolution.resume_from;
            progress.advance(processed);

            if resolution.resume_from == 0 {
                stalled += 1;
                if stalled >= self.settings.max_stalled_segments.max(1) {
                    tracing::warn!(
                        stalled,
                        remaining = ids.len(),
                        "no progress across segments; abandoning the rest of the batch"
                    );
                    for &id in ids {
                        notifications[id as usize].mark_failed(ErrorStatus::Unknown);
                        report.failed.push(FailedNotification {
                            index: id as usize,
                            id,
                            status: ErrorStatus::Unknown,
                        });
                    }
                    progress.advance(notifications.len());
                    break;
                }
            } else {
                stalled = 0;
            }
            start += resolution.resume_from;
        }
        Ok(report)
    }

    fn encode(&self, notification: &Notification) -> Result<Bytes, ClientError> {
        let payload = notification.encode_payload(
            self.settings.max_payload_bytes,
            self.settings.truncate_marker.as_deref(),
        )?;
        Ok(notification.frame(payload).encode()?)
    }

    async fn run_segment(
        &self,
        connection: Connection,
        segment: usize,
        frames: &[Bytes],
        base: usize,
        progress: &mut Progress<'_>,
    ) -> SegmentOutcome {
        let conn_id = connection.id();
        let (reader, writer) = match connection.into_split() {
            Ok(halves) => halves,
            Err(err) => {
                notify_hook(self.hook.as_ref(), &ClientError::Transport(err));
                return SegmentOutcome {
                    attempted: 0,
                    reader: None,
                };
            }
        };
        tracing::debug!(segment, %conn_id, frames = frames.len(), "segment started");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut write_task = tokio::spawn(run_writer(
            writer,
            frames.to_vec(),
            self.settings.packet_size,
            cancel_rx.clone(),
            progress_tx,
        ));
        let mut read_task = tokio::spawn(run_reader(reader, cancel_rx));

        let mut writer_done = None;
        let mut reader_done = None;
        loop {
            tokio::select! {
                result = &mut read_task => {
                    reader_done = Some(reader_joined(result));
                    break;
                }
                result = &mut write_task => {
                    writer_done = Some(writer_joined(result));
                    break;
                }
                Some(written) = progress_rx.recv() => progress.advance(base + written),
            }
        }

        let (writer_outcome, reader_outcome) = match (writer_done, reader_done) {
            (Some(writer_outcome), _) => {
                while let Ok(written) = progress_rx.try_recv() {
                    progress.advance(base + written);
                }
                // No acknowledgment exists; silence for the grace period is
                // the only success signal.
                let reader = match tokio::time::timeout(self.settings.grace_period, &mut read_task)
                    .await
                {
                    Ok(result) => Some(reader_joined(result)),
                    Err(_) => {
                        let _ = cancel_tx.send(true);
                        join_cancelled(read_task).await;
                        None
                    }
                };
                (writer_outcome, reader)
            }
            (None, reader) => {
                let _ = cancel_tx.send(true);
                let writer_outcome =
                    match tokio::time::timeout(CANCEL_JOIN_TIMEOUT, &mut write_task).await {
                        Ok(result) => writer_joined(result),
                        Err(_) => {
                            write_task.abort();
                            WriterOutcome {
                                attempted: 0,
                                error: None,
                                writer: None,
                            }
                        }
                    };
                (writer_outcome, reader)
            }
        };

        let WriterOutcome {
            attempted,
            error,
            writer,
        } = writer_outcome;
        if let Some(mut writer) = writer {
            writer.shutdown().await;
        }
        if let Some(err) = error {
            tracing::warn!(segment, %conn_id, attempted, error = %err, "write failed");
            notify_hook(self.hook.as_ref(), &ClientError::Transport(err));
        }
        match &reader_outcome {
            Some(ReaderOutcome::Response(response)) => {
                counters::record_error_response(status_label(response.status));
                if response.status.is_shutdown() {
                    tracing::info!(
                        segment,
                        %conn_id,
                        id = response.identifier,
                        "gateway shutting down"
                    );
                } else {
                    tracing::warn!(
                        segment,
                        %conn_id,
                        id = response.identifier,
                        status = %response.status,
                        "error response"
                    );
                    notify_hook(
                        self.hook.as_ref(),
                        &ClientError::Rejected {
                            status: response.status,
                            identifier: response.identifier,
                        },
                    );
                }
            }
            Some(ReaderOutcome::Malformed(err)) => {
                tracing::warn!(segment, %conn_id, error = %err, "malformed error response");
                notify_hook(self.hook.as_ref(), &ClientError::Wire(err.clone()));
            }
            Some(ReaderOutcome::Failed(err)) => {
                tracing::warn!(segment, %conn_id, error = %err, "error read failed twice; replaying segment");
                notify_hook(
                    self.hook.as_ref(),
                    &ClientError::Transport(TransportError::ReadFailed(io::Error::new(
                        err.kind(),
                        err.to_string(),
                    ))),
                );
            }
            Some(ReaderOutcome::EndOfStream) => {
                tracing::debug!(segment, %conn_id, "gateway closed the connection");
            }
            Some(ReaderOutcome::Cancelled) | None => {}
        }
        tracing::debug!(segment, %conn_id, "connection retired");

        SegmentOutcome {
            attempted,
            reader: reader_outcome,
        }
    }
}

struct Progress<'a> {
    callback: &'a mut (dyn FnMut(usize) + Send),
    reported: usize,
}

impl Progress<'_> {
    // Resumed segments can rewind the written count; callers only see it grow.
    fn advance(&mut self, processed: usize) {
        if processed > self.reported {
            self.reported = processed;
            (self.callback)(processed);
        }
    }
}

struct SegmentOutcome {
    attempted: usize,
    reader: Option<ReaderOutcome>,
}

struct WriterOutcome {
    /// Frames handed to the socket, counting one whose write failed.
    attempted: usize,
    error: Option<TransportError>,
    writer: Option<ConnectionWriter>,
}

#[derive(Debug)]
pub(crate) enum ReaderOutcome {
    Response(ErrorResponse),
    Malformed(courier_wire::Error),
    EndOfStream,
    /// Two consecutive read failures.
    Failed(io::Error),
    Cancelled,
}

/// How a finished segment maps onto its notifications, relative to the
/// segment start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Resolution {
    /// Leading notifications that are delivered.
    pub(crate) sent: usize,
    /// Status for the notification right after the delivered prefix.
    pub(crate) failed: Option<ErrorStatus>,
    pub(crate) resume_from: usize,
}

/// Decide what a segment achieved. `ids` are the segment's identifiers in
/// submission order (ascending).
pub(crate) fn reconcile(
    ids: &[u32],
    attempted: usize,
    reader: Option<&ReaderOutcome>,
) -> Resolution {
    let attempted = attempted.min(ids.len());
    let after_attempted = Resolution {
        sent: attempted,
        failed: None,
        resume_from: attempted,
    };
    match reader {
        Some(ReaderOutcome::Response(response)) => match ids.binary_search(&response.identifier) {
            // The identifier names the last notification the gateway handled.
            Ok(position) if matches!(response.status, ErrorStatus::Shutdown | ErrorStatus::NoErrors) => {
                Resolution {
                    sent: position + 1,
                    failed: None,
                    resume_from: position + 1,
                }
            }
            Ok(position) => Resolution {
                sent: position,
                failed: Some(response.status),
                resume_from: position + 1,
            },
            Err(_) => after_attempted,
        },
        Some(ReaderOutcome::Failed(_)) => Resolution {
            sent: 0,
            failed: None,
            resume_from: 0,
        },
        Some(ReaderOutcome::Malformed(_))
        | Some(ReaderOutcome::EndOfStream)
        | Some(ReaderOutcome::Cancelled)
        | None => after_attempted,
    }
}

async fn run_writer(
    mut writer: ConnectionWriter,
    frames: Vec<Bytes>,
    packet_size: usize,
    mut cancel: watch::Receiver<bool>,
    progress: mpsc::UnboundedSender<usize>,
) -> WriterOutcome {
    let mut written = 0usize;
    for group in frames.chunks(packet_size.max(1)) {
        for frame in group {
            let result = tokio::select! {
                biased;
                _ = cancel.changed() => None,
                result = writer.write(frame) => Some(result),
            };
            match result {
                None => {
                    return WriterOutcome {
                        attempted: written,
                        error: None,
                        writer: Some(writer),
                    };
                }
                Some(Ok(())) => {
                    written += 1;
                    counters::record_frames_out(1, frame.len() as u64);
                }
                Some(Err(err)) => {
                    return WriterOutcome {
                        attempted: written + 1,
                        error: Some(err),
                        writer: Some(writer),
                    };
                }
            }
        }
        let _ = progress.send(written);
    }
    WriterOutcome {
        attempted: written,
        error: None,
        writer: Some(writer),
    }
}

async fn run_reader(mut reader: ConnectionReader, mut cancel: watch::Receiver<bool>) -> ReaderOutcome {
    let mut failures = 0u32;
    loop {
        let result = tokio::select! {
            biased;
            _ = cancel.changed() => return ReaderOutcome::Cancelled,
            result = reader.read(ERROR_RESPONSE_LEN) => result,
        };
        match result {
            Ok(None) => return ReaderOutcome::EndOfStream,
            Ok(Some(bytes)) => {
                return match ErrorResponse::decode(&bytes) {
                    Ok(response) => ReaderOutcome::Response(response),
                    Err(err) => ReaderOutcome::Malformed(err),
                };
            }
            Err(err) => {
                failures += 1;
                let source = match err {
                    TransportError::ReadFailed(source) => source,
                    other => io::Error::other(other.to_string()),
                };
                if failures > 1 {
                    return ReaderOutcome::Failed(source);
                }
                tracing::warn!(conn_id = %reader.id(), error = %source, "error read failed; retrying once");
            }
        }
    }
}

fn writer_joined(result: Result<WriterOutcome, JoinError>) -> WriterOutcome {
    result.unwrap_or_else(|err| {
        tracing::warn!(error = %err, "writer task ended abnormally");
        WriterOutcome {
            attempted: 0,
            error: None,
            writer: None,
        }
    })
}

fn reader_joined(result: Result<ReaderOutcome, JoinError>) -> ReaderOutcome {
    result.unwrap_or_else(|err| ReaderOutcome::Failed(io::Error::other(err.to_string())))
}

async fn join_cancelled<T>(mut task: JoinHandle<T>) {
    if tokio::time::timeout(CANCEL_JOIN_TIMEOUT, &mut task)
        .await
        .is_err()
    {
        task.abort();
    }
}

fn status_label(status: ErrorStatus) -> &'static str {
    match status {
        ErrorStatus::NoErrors => "no_errors",
        ErrorStatus::ProcessingError => "processing_error",
        ErrorStatus::MissingDeviceToken => "missing_device_token",
        ErrorStatus::MissingTopic => "missing_topic",
        ErrorStatus::MissingPayload => "missing_payload",
        ErrorStatus::InvalidTokenSize => "invalid_token_size",
        ErrorStatus::InvalidTopicSize => "invalid_topic_size",
        ErrorStatus::InvalidPayloadSize => "invalid_payload_size",
        ErrorStatus::InvalidToken => "invalid_token",
        ErrorStatus::Shutdown => "shutdown",
        ErrorStatus::Unknown => "unknown",
        ErrorStatus::Other(_) => "other",
    }
}
