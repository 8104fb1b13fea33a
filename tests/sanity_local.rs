//! Run the sanity suite against a driver served from a fresh sandbox

use amlfs_csi::csi_grpc;
use amlfs_csi::meta_data::util;
use amlfs_csi::sanity::launcher::{self, PluginHandle};
use amlfs_csi::sanity::prepare::create_dir;
use amlfs_csi::sanity::sandbox::Sandbox;
use amlfs_csi::sanity::{self, CaseResult, SanityConfig, SanityReport};
use amlfs_csi::DriverOptions;
use grpcio::{Environment, ServerCredentials};
use std::collections::HashMap;
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn driver_options(enable_amlfs_mock_mount: bool) -> DriverOptions {
    DriverOptions {
        node_id: "fakeNodeID".to_owned(),
        driver_name: "fake".to_owned(),
        enable_amlfs_mock_mount,
    }
}

fn volume_parameters() -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert(
        util::VOLUME_CONTEXT_MDS_IP_ADDRESS.to_owned(),
        "127.0.0.1".to_owned(),
    );
    params.insert(util::VOLUME_CONTEXT_FS_NAME.to_owned(), "test".to_owned());
    params
}

fn sanity_config(sandbox: &Sandbox) -> SanityConfig {
    SanityConfig::new(
        sandbox.end_point(),
        sandbox.target_path(),
        sandbox.staging_path(),
    )
    .with_create_dir(create_dir)
    .with_volume_parameters(volume_parameters())
}

fn run_sanity(sandbox: &Sandbox, plugin: PluginHandle) -> anyhow::Result<SanityReport> {
    let config = sanity_config(sandbox);
    let mut report = SanityReport::new();
    sanity::test(&mut report, &config);
    plugin.stop()?;
    Ok(report)
}

#[test]
fn test_sanity_mock_mount() -> anyhow::Result<()> {
    init_logger();
    let sandbox = Sandbox::create()?;
    let plugin = launcher::launch(driver_options(true), sandbox.end_point())?;
    let report = run_sanity(&sandbox, plugin)?;

    report.assert_success();
    let (passed, _, _) = report.summary();
    assert!(passed > 0);
    assert!(!sandbox.socket_path().exists());
    sandbox.remove()?;
    Ok(())
}

#[test]
#[ignore = "needs root and a lustre client reachable at 127.0.0.1"]
fn test_sanity() -> anyhow::Result<()> {
    init_logger();
    let sandbox = Sandbox::create()?;
    let plugin = launcher::launch(driver_options(false), sandbox.end_point())?;
    let report = run_sanity(&sandbox, plugin)?;
    report.assert_success();
    Ok(())
}

#[test]
fn test_sanity_unimplemented_identity() -> anyhow::Result<()> {
    /// Identity service answering every call with `UNIMPLEMENTED`
    #[derive(Clone)]
    struct BrokenIdentity;
    impl csi_grpc::Identity for BrokenIdentity {}

    init_logger();
    let sandbox = Sandbox::create()?;
    let plugin = launcher::launch_server(sandbox.end_point(), |end_point| {
        let mut server = grpcio::ServerBuilder::new(Arc::new(Environment::new(1)))
            .register_service(csi_grpc::create_identity(BrokenIdentity))
            .build()?;
        let _ = server.add_listening_port(end_point, ServerCredentials::insecure())?;
        Ok(server)
    })?;
    let report = run_sanity(&sandbox, plugin)?;

    assert!(!report.is_success());
    let failed: Vec<&str> = report.failures().map(|c| c.name.as_str()).collect();
    assert!(failed.contains(&"Identity Probe succeeds"));
    assert!(failed.contains(&"discover capabilities"));
    assert!(!report
        .cases()
        .iter()
        .any(|c| c.result == CaseResult::Passed && c.name.starts_with("Identity")));
    sandbox.remove()?;
    Ok(())
}
