//! Integration tests for the batch manager's retry, skip, and precheck behavior.
//!
//! Transports are replaced with spy drivers so every property is checked
//! without network access or external tools.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arrakis_core::download::{
    AttemptOutcome, DriverTable, FetchContext, FetchRequest, NoopSink, RetryPolicy, TransportDriver,
};
use arrakis_core::{Credentials, DownloadItem, DownloadManager, EngineConfig, ProviderToken};
use async_trait::async_trait;
use tempfile::TempDir;

/// Scripted driver: returns the queued reasons as failures, then succeeds.
struct SpyDriver {
    name: &'static str,
    script: Mutex<Vec<&'static str>>,
    calls: Arc<AtomicUsize>,
}

impl SpyDriver {
    fn new(name: &'static str, failures: &[&'static str]) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut script = failures.to_vec();
        script.reverse();
        (
            Self {
                name,
                script: Mutex::new(script),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl TransportDriver for SpyDriver {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch(&self, request: &FetchRequest<'_>, _ctx: &FetchContext<'_>) -> AttemptOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.script.lock().unwrap().pop() {
            return AttemptOutcome::failed(self.name, reason);
        }
        if let Some(path) = request.dest_path() {
            std::fs::write(path, b"model bytes").unwrap();
        }
        AttemptOutcome::succeeded(self.name)
    }
}

fn no_credentials() -> Credentials {
    Credentials::new(ProviderToken::missing(), ProviderToken::missing())
}

fn manager_with(models: &TempDir, drivers: DriverTable, credentials: Credentials) -> DownloadManager {
    let config = EngineConfig::default().with_models_dir(models.path());
    DownloadManager::with_drivers(&config, credentials, drivers, Arc::new(NoopSink))
        .unwrap()
        .with_retry_policy(RetryPolicy::immediate(3))
}

#[tokio::test]
async fn test_existing_destination_never_invokes_a_driver() {
    let models = TempDir::new().unwrap();
    std::fs::create_dir_all(models.path().join("vae")).unwrap();
    std::fs::write(models.path().join("vae/ae.safetensors"), b"already here").unwrap();
    let (spy, calls) = SpyDriver::new("aria2c", &[]);
    let manager = manager_with(&models, DriverTable::new().with_generic(spy), no_credentials());

    let ok = manager
        .download_all(&[DownloadItem::new(
            "https://example.com/files/ae.safetensors?download=true",
            "vae",
            "",
        )])
        .await;

    assert!(ok);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let log = manager.attempt_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].method, "skip");
}

#[tokio::test]
async fn test_missing_civitai_token_fails_once_at_precheck() {
    let models = TempDir::new().unwrap();
    let (spy, calls) = SpyDriver::new("aria2c", &[]);
    let manager = manager_with(&models, DriverTable::new().with_generic(spy), no_credentials());

    let ok = manager
        .download_all(&[DownloadItem::new(
            "https://civitai.com/api/download/models/123",
            "loras",
            "",
        )])
        .await;

    assert!(!ok);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(manager.attempt_log().len(), 1);
    let failures = manager.failure_report();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].stage, "precheck");
    assert!(failures[0].reason.contains("CIVITAI_TOKEN is missing"));
}

#[tokio::test]
async fn test_auth_rejection_is_attempted_exactly_once() {
    let models = TempDir::new().unwrap();
    let (spy, calls) = SpyDriver::new("wget", &["wget_exit_6 | tail: auth_http_401"]);
    let manager = manager_with(&models, DriverTable::new().with_generic(spy), no_credentials());

    let ok = manager
        .download_all(&[DownloadItem::new("https://example.com/gated.bin", "checkpoints", "")])
        .await;

    assert!(!ok);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let failures = manager.failure_report();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].reason.contains("auth_http_401"));
}

#[tokio::test]
async fn test_transient_failure_is_attempted_three_times() {
    let models = TempDir::new().unwrap();
    let (spy, calls) = SpyDriver::new("wget", &["wget_exit_4", "wget_exit_4", "wget_exit_4"]);
    let manager = manager_with(&models, DriverTable::new().with_generic(spy), no_credentials());

    let report = manager
        .download_batch(&[DownloadItem::new("https://example.com/flaky.bin", "", "flaky.bin")])
        .await;

    assert!(!report.success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.stats.failed(), 1);
    assert_eq!(report.stats.retried(), 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].filename, "flaky.bin");
    assert_eq!(report.failures[0].reason, "wget_exit_4");
}

#[tokio::test]
async fn test_fallback_chain_reason_lists_every_link() {
    let models = TempDir::new().unwrap();
    let (aria2, _) = SpyDriver::new("aria2c", &["aria2c_exit_22 | tail: 404 Not Found"; 3]);
    let (wget, _) = SpyDriver::new("wget", &["wget_exit_8"; 3]);
    let drivers = DriverTable::new().with_generic(aria2).with_generic(wget);
    let manager = manager_with(&models, drivers, no_credentials());

    manager
        .download_all(&[DownloadItem::new("https://example.com/missing.bin", "", "")])
        .await;

    let failures = manager.failure_report();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].stage, "aria2c->wget");
    assert_eq!(failures[0].reason, "aria2c_exit_22 | tail: 404 Not Found ; wget_exit_8");
}

#[tokio::test]
async fn test_skip_and_transient_recovery_end_to_end() {
    let models = TempDir::new().unwrap();
    std::fs::create_dir_all(models.path().join("vae")).unwrap();
    std::fs::write(models.path().join("vae/a.safetensors"), b"present").unwrap();
    let (spy, calls) = SpyDriver::new("wget", &["wget_exit_4", "wget_exit_4"]);
    let manager = manager_with(&models, DriverTable::new().with_generic(spy), no_credentials());

    let item_a = DownloadItem::new("https://example.com/a.safetensors", "vae", "a.safetensors");
    let item_b = DownloadItem::new("https://example.com/b.safetensors", "unet", "b.safetensors");
    let report = manager.download_batch(&[item_a.clone(), item_b.clone()]).await;

    assert!(report.success);
    assert_eq!(report.stats.succeeded(), 2);
    assert_eq!(report.stats.skipped(), 1);
    assert_eq!(report.stats.completed(), 1);
    assert!(manager.failure_report().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let log = manager.attempt_log();
    assert_eq!(log.iter().filter(|r| r.url == item_a.url).count(), 1);
    assert_eq!(log.iter().filter(|r| r.url == item_b.url).count(), 3);
    assert!(models.path().join("unet/b.safetensors").exists());
}

#[tokio::test]
async fn test_next_batch_resets_reports() {
    let models = TempDir::new().unwrap();
    let (spy, _) = SpyDriver::new("wget", &["wget_exit_6 | tail: auth_http_403"]);
    let manager = manager_with(&models, DriverTable::new().with_generic(spy), no_credentials());
    let item = DownloadItem::new("https://example.com/x.bin", "", "");

    assert!(!manager.download_all(std::slice::from_ref(&item)).await);
    assert_eq!(manager.failure_report().len(), 1);

    assert!(manager.download_all(&[item]).await);
    assert!(manager.failure_report().is_empty());
    assert_eq!(manager.attempt_log().len(), 1);
}
