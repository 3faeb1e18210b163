// Public entry point: batches to the gateway, drains from the feedback service.
use std::sync::Arc;

use courier_transport::{Credentials, TlsDialer, tls};
use courier_wire::FeedbackRecord;

use crate::config::ClientConfig;
use crate::engine::{DeliveryEngine, DeliveryReport};
use crate::feedback::FeedbackReader;
use crate::notification::Notification;
use crate::{ClientError, ErrorHook};

/// Push client bound to one gateway and one feedback endpoint.
///
/// ```no_run
/// use courier_client::{Client, ClientConfig, Credentials, Notification};
///
/// # async fn run(pem: Vec<u8>) -> Result<(), courier_client::ClientError> {
/// let client = Client::new(ClientConfig::development(Credentials::new(pem)))?
///     .on_error(|err| eprintln!("push: {err}"));
/// let mut batch = vec![Notification::for_device("<ce8be627 2e43e855>").with_alert("Hi!")];
/// let report = client.push(&mut batch).await?;
/// for failed in &report.failed {
///     eprintln!("notification {} rejected: {}", failed.index, failed.status);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    config: ClientConfig,
    gateway: TlsDialer,
    feedback: TlsDialer,
    hook: Option<ErrorHook>,
}

impl Client {
    /// Validate `config` and prepare TLS for both endpoints. No connection is
    /// opened until the first batch or feedback read.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let tls = tls::client_config(&config.credentials)?;
        let gateway = TlsDialer::new(
            config.gateway.clone(),
            Arc::clone(&tls),
            config.connect_timeout,
        )?;
        let feedback = TlsDialer::new(config.feedback.clone(), tls, config.connect_timeout)?;
        tracing::debug!(
            gateway = %config.gateway,
            feedback = %config.feedback,
            pool_size = config.pool_size,
            "client ready"
        );
        Ok(Self {
            config,
            gateway,
            feedback,
            hook: None,
        })
    }

    pub fn development(credentials: Credentials) -> Result<Self, ClientError> {
        Self::new(ClientConfig::development(credentials))
    }

    pub fn production(credentials: Credentials) -> Result<Self, ClientError> {
        Self::new(ClientConfig::production(credentials))
    }

    /// Observe every failure a batch recovers from.
    pub fn on_error(mut self, hook: impl Fn(&ClientError) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn push(&self, notifications: &mut [Notification]) -> Result<DeliveryReport, ClientError> {
        self.push_with_progress(notifications, |_| {}).await
    }

    /// Like [`Client::push`], reporting the running count of processed
    /// notifications to `progress`.
    pub async fn push_with_progress(
        &self,
        notifications: &mut [Notification],
        progress: impl FnMut(usize) + Send,
    ) -> Result<DeliveryReport, ClientError> {
        let engine = DeliveryEngine::new(self.gateway.clone(), &self.config, self.hook.clone());
        engine.deliver(notifications, progress).await
    }

    pub async fn unregistered_devices(&self) -> Result<Vec<String>, ClientError> {
        FeedbackReader::new(self.feedback.clone())
            .unregistered_devices()
            .await
    }

    pub async fn unregistered_devices_with_timestamps(
        &self,
    ) -> Result<Vec<FeedbackRecord>, ClientError> {
        FeedbackReader::new(self.feedback.clone()).read_all().await
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("gateway", &self.config.gateway)
            .field("feedback", &self.config.feedback)
            .field("on_error", &self.hook.is_some())
            .finish()
    }
}
