//! Wiring of configuration, transport and stores, plus the CLI commands.

use anyhow::{bail, Context};
use ephemeral_feeds::PresenceTracker;
use frontdesk_config_and_utils::{Config, Paths, SyncTimings};
use guest_record_store::{GuestRecordStore, Session};
use realtime_transport::{FileFlagStorage, FlagStorage, RestConfig, RestTransportFactory, TransportFactory};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use sync_client::{ConnectionMonitor, ReconnectEscalator, SyncClient, WriteOutcome};
use tracing::{info, info_span, warn, Instrument};

pub struct App {
    config: Config,
    paths: Paths,
    client: Arc<SyncClient>,
    escalator: Arc<ReconnectEscalator>,
}

impl App {
    /// Build the client context. Without a database URL the client stays
    /// uninitialised and every store call degrades to a no-op.
    pub async fn start(config: Config, paths: Paths) -> anyhow::Result<Self> {
        paths.ensure_dirs()?;
        let flags: Arc<dyn FlagStorage> = Arc::new(FileFlagStorage::new(paths.flags_file()));
        let timings = config.timings.clone();

        let (client, factory) = match config.database_url()? {
            None => {
                warn!("No database URL configured, running without a realtime client");
                (SyncClient::uninitialized(config.app_name.as_str()), None)
            }
            Some(url) => {
                let rest = RestConfig::new(url)
                    .with_auth(config.database_secret.clone())
                    .with_retry(
                        Duration::from_millis(timings.stream_retry_base_ms),
                        Duration::from_millis(timings.stream_retry_max_ms),
                    );
                let factory: Arc<dyn TransportFactory> =
                    Arc::new(RestTransportFactory::new(rest, flags.clone())?);
                let client = match SyncClient::connect(factory.as_ref(), &config.app_name).await {
                    Ok(client) => client,
                    Err(e) => {
                        warn!(error = %e, "Realtime client could not be created");
                        SyncClient::uninitialized(config.app_name.as_str())
                    }
                };
                (client, Some(factory))
            }
        };

        let escalator = Arc::new(ReconnectEscalator::new(
            client.clone(),
            factory,
            flags,
            timings,
        ));
        Ok(Self {
            config,
            paths,
            client,
            escalator,
        })
    }

    fn require_client(&self) -> anyhow::Result<()> {
        if !self.config.has_credentials() {
            bail!(
                "no database URL configured; set FRONTDESK_DATABASE_URL or edit {}",
                self.paths.config_file().display()
            );
        }
        Ok(())
    }

    /// Wait for the connected flag, escalating through the reconnect tiers
    /// if it does not come up in time.
    async fn ensure_connected(&self) -> bool {
        let monitor = ConnectionMonitor::new(self.client.clone());
        if monitor
            .wait_for_connected(self.config.timings.connect_timeout())
            .await
        {
            return true;
        }
        let outcome = self.escalator.recover().await;
        info!(outcome = ?outcome, "Connection recovery finished");
        monitor.is_connected()
    }

    pub async fn status(&self) -> anyhow::Result<()> {
        self.require_client()?;
        let connected = self.ensure_connected().await;
        println!(
            "{} ({}, generation {})",
            if connected { "connected" } else { "disconnected" },
            self.config.app_name,
            self.client.generation()
        );
        if !connected {
            bail!("realtime store unreachable");
        }
        Ok(())
    }

    pub async fn import(&self, file: &Path, force: bool) -> anyhow::Result<()> {
        self.require_client()?;
        let raw = std::fs::read_to_string(file)
            .with_context(|| format!("reading {}", file.display()))?;
        let mut session: Session = serde_json::from_str(&raw)
            .with_context(|| format!("parsing session from {}", file.display()))?;
        if session.id.is_empty() {
            bail!("session in {} has no id", file.display());
        }
        if session.last_modified == 0 {
            session.last_modified = chrono::Utc::now().timestamp_millis();
        }

        self.ensure_connected().await;
        let store = GuestRecordStore::new(self.client.clone());
        match store.sync_session(&session, force).await? {
            WriteOutcome::Written => {
                println!("imported {} ({} guests)", session.id, session.guests.len())
            }
            WriteOutcome::SkippedStale { local, remote } => println!(
                "skipped {}: remote copy is newer ({remote} > {local}); use --force to overwrite",
                session.id
            ),
            WriteOutcome::Skipped(reason) => bail!("import skipped: {reason}"),
        }
        Ok(())
    }

    pub async fn sessions(&self) -> anyhow::Result<()> {
        self.require_client()?;
        self.ensure_connected().await;
        let store = GuestRecordStore::new(self.client.clone());
        for summary in store.list_sessions().await? {
            println!(
                "{}\t{}\t{}\t{} guests",
                summary.id, summary.date, summary.label, summary.guest_count
            );
        }
        Ok(())
    }

    pub async fn watch(&self, session_id: &str, user: &str) -> anyhow::Result<()> {
        self.require_client()?;
        let mut config = self.config.clone();
        let had_device_id = config.device_id.is_some();
        let device_id = config.ensure_device_id();
        if !had_device_id {
            config.save(&self.paths)?;
        }

        let span = info_span!("watch", session_id, device_id = %device_id);
        self.watch_session(session_id, user, device_id, config.timings)
            .instrument(span)
            .await
    }

    async fn watch_session(
        &self,
        session_id: &str,
        user: &str,
        device_id: String,
        timings: SyncTimings,
    ) -> anyhow::Result<()> {
        self.ensure_connected().await;
        let watchdog = self.escalator.spawn_watchdog();
        let store = GuestRecordStore::new(self.client.clone());
        let presence = PresenceTracker::new(self.client.clone(), device_id, timings.clone());
        let joined = presence.join(session_id, user).await;
        joined.joined().clone().discard("watch_join");

        let mut guests = store.subscribe_guests(session_id);
        info!("Watching guest list");
        loop {
            tokio::select! {
                update = guests.recv() => {
                    let Some(list) = update else {
                        // The listener goes away with its client; pick up the rebuilt one.
                        if watchdog.is_finished() {
                            break;
                        }
                        tokio::time::sleep(timings.soft_reconnect_delay()).await;
                        guests = store.subscribe_guests(session_id);
                        continue;
                    };
                    println!("{} guests", list.len());
                    for guest in list {
                        println!(
                            "  {:<8} {:<24} room={} status={}",
                            guest.id,
                            guest.name,
                            guest.room.as_deref().unwrap_or("-"),
                            guest.room_status.as_deref().unwrap_or("-"),
                        );
                    }
                }
                _ = tokio::signal::ctrl_c() => break,
            }
        }

        joined.leave().await.discard("watch_leave");
        watchdog.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_credentials_leave_the_client_uninitialised() {
        let dir = tempdir().unwrap();
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        let app = App::start(Config::default(), paths).await.unwrap();

        assert!(!app.client.is_initialized());
        assert!(dir.path().join("logs").exists());

        let err = app.status().await.unwrap_err();
        assert!(err.to_string().contains("no database URL"));
    }

    #[tokio::test]
    async fn rejects_non_http_database_url() {
        let dir = tempdir().unwrap();
        let config = Config {
            database_url: Some("ftp://hotel.example.com".into()),
            ..Config::default()
        };
        let paths = Paths::with_base_dir(dir.path().to_path_buf());
        assert!(App::start(config, paths).await.is_err());
    }
}
