//! Per-tenant mailbox polling and its supervision.
//!
//! Each connected tenant gets exactly one poller task. The task owns its
//! [`MailboxSource`] for its whole life, so a tenant's messages are always
//! handled sequentially; cross-tenant parallelism comes from having one
//! task per tenant. The [`MailboxSupervisor`] owns the task handles and is
//! the only place pollers are started or stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{ConfigError, Error, MailboxError, PipelineError, StoreError};
use crate::mailbox::{ApiMailbox, ImapMailbox, MailboxSource, TokenRefresher, imap::ImapConfig};
use crate::pipeline::processor::MessageProcessor;
use crate::store::{MailboxKind, MailboxRecord, TenantRecord, TicketStore};

/// Spawn the polling loop for one tenant. Returns the task handle and a
/// shutdown signal; notifying it stops the loop without waiting out the
/// rest of the interval, after which the task closes the mailbox session
/// and exits. A shutdown arriving mid-batch lets the batch finish first.
pub fn spawn_tenant_poller(
    tenant: TenantRecord,
    mut source: Box<dyn MailboxSource>,
    processor: Arc<MessageProcessor>,
    poll_interval: Duration,
) -> (JoinHandle<()>, Arc<Notify>) {
    let shutdown = Arc::new(Notify::new());
    let shutdown_signal = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            tenant = %tenant.id,
            interval_secs = poll_interval.as_secs(),
            "Mailbox poller started"
        );
        let mut tick = tokio::time::interval(poll_interval);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                _ = tick.tick() => {}
            }

            match source.poll().await {
                Ok(messages) if messages.is_empty() => {
                    debug!(tenant = %tenant.id, "Poll cycle: no new messages");
                }
                Ok(messages) => {
                    processor
                        .process_batch(&tenant, source.as_mut(), messages)
                        .await;
                }
                Err(e) => {
                    // Transport problems are per-cycle; the next tick
                    // retries with a fresh session.
                    error!(tenant = %tenant.id, error = %e, "Mailbox poll failed");
                }
            }
        }

        if let Err(e) = source.disconnect().await {
            warn!(tenant = %tenant.id, error = %e, "Error closing mailbox session");
        }
        info!(tenant = %tenant.id, "Mailbox poller stopped");
    });

    (handle, shutdown_signal)
}

struct PollerHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

/// Owns every running poller. Connect and disconnect are commands on this
/// type; nothing else starts or stops polling.
pub struct MailboxSupervisor {
    store: Arc<dyn TicketStore>,
    processor: Arc<MessageProcessor>,
    http: reqwest::Client,
    refresher: Option<Arc<TokenRefresher>>,
    config: PipelineConfig,
    pollers: Mutex<HashMap<Uuid, PollerHandle>>,
}

impl MailboxSupervisor {
    pub fn new(
        store: Arc<dyn TicketStore>,
        processor: Arc<MessageProcessor>,
        http: reqwest::Client,
        refresher: Option<Arc<TokenRefresher>>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            processor,
            http,
            refresher,
            config,
            pollers: Mutex::new(HashMap::new()),
        }
    }

    /// Start polling a tenant's mailbox. Validates credentials by opening a
    /// session first; only a successful connect marks the mailbox connected
    /// and spawns the poller. An existing poller for the tenant is stopped
    /// before the new one starts.
    pub async fn connect(&self, tenant_id: Uuid) -> Result<(), Error> {
        let tenant = self
            .store
            .get_tenant(tenant_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "tenant",
                id: tenant_id.to_string(),
            })?;
        let mailbox = self
            .store
            .get_mailbox(tenant_id)
            .await?
            .ok_or_else(|| PipelineError::NoMailbox {
                tenant_id: tenant_id.to_string(),
            })?;

        self.stop_poller(tenant_id).await;

        let mut source = self.build_source(&tenant, &mailbox)?;
        source.connect().await?;
        self.store.set_mailbox_connected(tenant_id, true).await?;

        let (handle, shutdown) = spawn_tenant_poller(
            tenant,
            source,
            Arc::clone(&self.processor),
            self.config.poll_interval,
        );
        self.pollers
            .lock()
            .await
            .insert(tenant_id, PollerHandle { handle, shutdown });

        info!(tenant = %tenant_id, kind = mailbox.kind.as_str(), "Mailbox connected");
        Ok(())
    }

    /// Stop polling a tenant's mailbox and mark it disconnected. Waits for
    /// the poller to finish its current cycle and close the session.
    pub async fn disconnect(&self, tenant_id: Uuid) -> Result<(), Error> {
        let stopped = self.stop_poller(tenant_id).await;
        self.store.set_mailbox_connected(tenant_id, false).await?;
        if stopped {
            info!(tenant = %tenant_id, "Mailbox disconnected");
        }
        Ok(())
    }

    /// Resume polling for every mailbox marked connected. Called once at
    /// startup; a tenant whose resume fails is logged and left disconnected
    /// rather than failing the boot.
    pub async fn resume_connected(&self) -> Result<usize, Error> {
        let mailboxes = self.store.list_connected_mailboxes().await?;
        let mut started = 0usize;
        for mailbox in mailboxes {
            match self.connect(mailbox.tenant_id).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!(tenant = %mailbox.tenant_id, error = %e, "Could not resume mailbox");
                    if let Err(e) = self
                        .store
                        .set_mailbox_connected(mailbox.tenant_id, false)
                        .await
                    {
                        warn!(tenant = %mailbox.tenant_id, error = %e, "Could not clear connected flag");
                    }
                }
            }
        }
        info!(started, "Mailbox pollers resumed");
        Ok(started)
    }

    /// Stop every poller and wait for all of them. Connection flags are
    /// left as they are so the next start resumes the same mailboxes.
    pub async fn shutdown_all(&self) {
        let handles: Vec<PollerHandle> = {
            let mut pollers = self.pollers.lock().await;
            pollers.drain().map(|(_, handle)| handle).collect()
        };
        if handles.is_empty() {
            return;
        }

        for poller in &handles {
            poller.shutdown.notify_one();
        }
        futures::future::join_all(handles.into_iter().map(|p| p.handle)).await;
        info!("All mailbox pollers stopped");
    }

    async fn stop_poller(&self, tenant_id: Uuid) -> bool {
        let poller = self.pollers.lock().await.remove(&tenant_id);
        match poller {
            Some(PollerHandle { handle, shutdown }) => {
                shutdown.notify_one();
                if let Err(e) = handle.await {
                    warn!(tenant = %tenant_id, error = %e, "Poller task panicked");
                }
                true
            }
            None => false,
        }
    }

    /// Build the backend named by the mailbox record. No I/O happens here;
    /// the caller connects the returned source.
    fn build_source(
        &self,
        tenant: &TenantRecord,
        mailbox: &MailboxRecord,
    ) -> Result<Box<dyn MailboxSource>, Error> {
        match mailbox.kind {
            MailboxKind::Imap => {
                // Fetching flags messages Seen, so the adapter itself must
                // honor the batch limit; overflow stays unseen for the next
                // cycle instead of being dropped.
                let config = ImapConfig::from_record(
                    mailbox,
                    &tenant.support_email,
                    self.config.batch_size,
                )?;
                Ok(Box::new(ImapMailbox::new(config)))
            }
            MailboxKind::Api => {
                let refresher = self.refresher.clone().ok_or_else(|| ConfigError::MissingKey {
                    key: "MAILDESK_OAUTH_TOKEN_URL".to_string(),
                })?;
                let base_url = mailbox.api_base_url.clone().ok_or_else(|| {
                    MailboxError::Protocol("mailbox record incomplete: missing api_base_url".into())
                })?;
                Ok(Box::new(ApiMailbox::new(
                    tenant.id,
                    base_url,
                    self.http.clone(),
                    refresher,
                )))
            }
        }
    }
}
