//! Service supervision tests
//!
//! Covers drift between the running server and the saved configuration,
//! explicit restarts, auto-start and the delete guards.

use reader_llm::engine::{catalog, ComputeConfig, GpuBackend, LaunchConfig};
use reader_llm::provision::ProvisionError;
use reader_llm::service::{ServiceController, ServiceError};
use reader_llm::settings::{DesiredConfig, JsonSettingsStore, SettingsStore};
use reader_llm::testing::{FakeLauncher, FakeModels, FakeRuntimes};
use std::sync::Arc;
use tempfile::TempDir;

struct Service {
    controller: ServiceController,
    launcher: Arc<FakeLauncher>,
    runtimes: Arc<FakeRuntimes>,
}

fn service() -> Service {
    let launcher = Arc::new(FakeLauncher::new());
    let runtimes = Arc::new(FakeRuntimes::with_installed(&[
        ComputeConfig::cpu(),
        ComputeConfig::hybrid(GpuBackend::Vulkan),
        ComputeConfig::gpu(GpuBackend::Cuda),
    ]));
    let models = Arc::new(FakeModels::with_installed(&[
        catalog::for_tier(1).id,
        catalog::for_tier(2).id,
    ]));
    let controller = ServiceController::new(runtimes.clone(), models, launcher.clone(), 4096);
    Service {
        controller,
        launcher,
        runtimes,
    }
}

fn launch(tier: u8, compute: ComputeConfig, layers: u32) -> LaunchConfig {
    LaunchConfig::new(catalog::for_tier(tier).id, compute, layers)
}

#[tokio::test]
async fn test_saved_config_change_is_reported_not_applied() {
    let temp = TempDir::new().unwrap();
    let settings = JsonSettingsStore::new(temp.path().join("settings.json"));
    let s = service();

    let running = launch(1, ComputeConfig::cpu(), 0);
    settings.save(&DesiredConfig::new(&running, true)).unwrap();
    s.controller.start(running.clone()).await.unwrap();

    // another writer switches the model
    let wanted = launch(2, ComputeConfig::cpu(), 0);
    settings.save(&DesiredConfig::new(&wanted, true)).unwrap();

    let desired = settings.load().unwrap().unwrap().launch_config();
    let state = s.controller.status(Some(&desired)).await;
    assert!(state.running);
    assert!(!state.running_this_model);
    assert!(state.config_changed);
    assert_eq!(state.started_config, Some(running));
    assert_eq!(s.launcher.launches(), 1);

    s.controller.apply_and_restart(desired.clone()).await.unwrap();
    let state = s.controller.status(Some(&desired)).await;
    assert!(state.running_this_model);
    assert!(!state.config_changed);
    assert_eq!(s.launcher.launches(), 2);
    assert_eq!(s.launcher.live(), 1);
}

#[tokio::test]
async fn test_layer_count_only_matters_in_hybrid_mode() {
    let s = service();

    s.controller
        .start(launch(1, ComputeConfig::gpu(GpuBackend::Cuda), 10))
        .await
        .unwrap();
    let other_layers = launch(1, ComputeConfig::gpu(GpuBackend::Cuda), 30);
    assert!(!s.controller.status(Some(&other_layers)).await.config_changed);

    s.controller
        .start(launch(1, ComputeConfig::hybrid(GpuBackend::Vulkan), 10))
        .await
        .unwrap();
    let other_layers = launch(1, ComputeConfig::hybrid(GpuBackend::Vulkan), 30);
    assert!(s.controller.status(Some(&other_layers)).await.config_changed);
    assert_eq!(s.launcher.live(), 1);
}

#[tokio::test]
async fn test_auto_start_only_when_stopped_and_enabled() {
    let s = service();
    let config = launch(1, ComputeConfig::cpu(), 0);

    let manual = DesiredConfig::new(&config, false);
    assert!(!s.controller.serve_if_stopped(&manual).await.unwrap());
    assert!(!s.controller.is_running().await);

    let auto = DesiredConfig::new(&config, true);
    assert!(s.controller.serve_if_stopped(&auto).await.unwrap());
    assert!(!s.controller.serve_if_stopped(&auto).await.unwrap());
    assert_eq!(s.launcher.launches(), 1);
}

#[tokio::test]
async fn test_start_checks_files_before_spawning() {
    let s = service();

    let missing_model = LaunchConfig::new("not_installed", ComputeConfig::cpu(), 0);
    assert!(matches!(
        s.controller.start(missing_model).await,
        Err(ServiceError::ModelMissing(_))
    ));

    let missing_runtime = launch(1, ComputeConfig::gpu(GpuBackend::Metal), 0);
    assert!(matches!(
        s.controller.start(missing_runtime).await,
        Err(ServiceError::RuntimeMissing(_))
    ));
    assert_eq!(s.launcher.launches(), 0);
}

#[tokio::test]
async fn test_failed_launch_leaves_service_stopped() {
    let s = service();
    s.launcher.fail("exit status: 1");

    let err = s
        .controller
        .start(launch(1, ComputeConfig::cpu(), 0))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Exited(_)));
    assert!(!s.controller.is_running().await);

    s.launcher.heal();
    s.controller
        .start(launch(1, ComputeConfig::cpu(), 0))
        .await
        .unwrap();
    assert!(s.controller.is_running().await);
}

#[tokio::test]
async fn test_delete_guards() {
    let s = service();
    let running = launch(1, ComputeConfig::hybrid(GpuBackend::Vulkan), 20);
    s.controller.start(running).await.unwrap();

    assert!(matches!(
        s.controller.delete_model(catalog::for_tier(1).id).await,
        Err(ProvisionError::InUse(_))
    ));
    s.controller
        .delete_model(catalog::for_tier(2).id)
        .await
        .unwrap();

    // removing an unrelated runtime keeps the server up
    s.controller
        .delete_runtime(&ComputeConfig::cpu())
        .await
        .unwrap();
    assert!(s.controller.is_running().await);

    // removing the one in use stops it first
    s.controller
        .delete_runtime(&ComputeConfig::gpu(GpuBackend::Vulkan))
        .await
        .unwrap();
    assert!(!s.controller.is_running().await);
    assert_eq!(s.launcher.live(), 0);
    assert!(!s
        .runtimes
        .is_installed(&ComputeConfig::hybrid(GpuBackend::Vulkan)));

    s.controller.stop().await;
}
