// Drain of decommissioned-device records from the feedback endpoint.
use courier_transport::{Connection, Dial};
use courier_wire::{FEEDBACK_RECORD_LEN, FeedbackRecord};

use crate::{ClientError, counters};

/// Reads every pending [`FeedbackRecord`] over one connection.
///
/// The feedback service writes its records and hangs up; there is nothing to
/// send and no error correlation.
pub struct FeedbackReader<D: Dial> {
    dialer: D,
}

impl<D: Dial> FeedbackReader<D> {
    pub fn new(dialer: D) -> Self {
        Self { dialer }
    }

    /// Open a connection, read records until end of stream, then close it.
    pub async fn read_all(&self) -> Result<Vec<FeedbackRecord>, ClientError> {
        let mut connection = Connection::connect(&self.dialer).await?;
        let result = drain(&mut connection).await;
        connection.close().await;
        let records = result?;
        counters::record_feedback_records(records.len() as u64);
        tracing::debug!(
            endpoint = %self.dialer.endpoint(),
            records = records.len(),
            "feedback drained"
        );
        Ok(records)
    }

    /// Hex tokens of devices that no longer accept notifications.
    pub async fn unregistered_devices(&self) -> Result<Vec<String>, ClientError> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .map(|record| record.token.to_string())
            .collect())
    }
}

async fn drain(connection: &mut Connection) -> Result<Vec<FeedbackRecord>, ClientError> {
    let mut records = Vec::new();
    while let Some(bytes) = connection.read(FEEDBACK_RECORD_LEN).await? {
        if bytes.len() < FEEDBACK_RECORD_LEN {
            tracing::warn!(
                conn_id = %connection.id(),
                bytes = bytes.len(),
                "feedback stream ended inside a record"
            );
            break;
        }
        records.push(FeedbackRecord::decode(&bytes)?);
    }
    Ok(records)
}
