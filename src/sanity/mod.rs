//! A CSI sanity suite, it drives the identity, controller and node services
//! of a plugin through a unix socket and records protocol violations

mod cleanup;
mod controller;
mod identity;
pub mod launcher;
mod node;
pub mod prepare;
pub mod sandbox;

use anyhow::{anyhow, bail};
use grpcio::{CallOption, ChannelBuilder, EnvBuilder, RpcStatusCode};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use super::csi::*;
use super::csi_grpc::{ControllerClient, IdentityClient, NodeClient};
use cleanup::Cleanup;

/// The default size of volumes created by the suite, 10GB
pub const DEFAULT_TEST_VOLUME_SIZE: i64 = 10 * 1024 * 1024 * 1024;
/// The default max time to wait for the plugin socket to accept connections
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// The default deadline of each RPC
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
/// The default prefix of volume names created by the suite
pub const DEFAULT_TEST_VOLUME_PREFIX: &str = "sanity";

/// Creates a directory and returns the path to use
pub type CreateDirFn = Arc<dyn Fn(&Path) -> anyhow::Result<PathBuf> + Send + Sync>;
/// Removes a directory created by a `CreateDirFn`
pub type RemoveDirFn = Arc<dyn Fn(&Path) -> anyhow::Result<()> + Send + Sync>;

/// The configuration of one sanity run
#[derive(Clone)]
pub struct SanityConfig {
    /// The plugin end point, `unix://<path>`
    pub address: String,
    /// The directory to publish volumes under
    pub target_path: PathBuf,
    /// The directory to stage volumes under
    pub staging_path: PathBuf,
    /// Creates the target directory
    pub create_target_dir: CreateDirFn,
    /// Creates the staging directory
    pub create_staging_dir: CreateDirFn,
    /// Removes the target directory
    pub remove_target_path: RemoveDirFn,
    /// Removes the staging directory
    pub remove_staging_path: RemoveDirFn,
    /// Parameters passed to every `CreateVolume`
    pub test_volume_parameters: HashMap<String, String>,
    /// Required bytes of every `CreateVolume`
    pub test_volume_size: i64,
    /// Max time to wait for the plugin to accept connections
    pub dial_timeout: Duration,
    /// Deadline of each RPC
    pub rpc_timeout: Duration,
    /// Prefix of volume names
    pub test_volume_prefix: String,
}

impl fmt::Debug for SanityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SanityConfig")
            .field("address", &self.address)
            .field("target_path", &self.target_path)
            .field("staging_path", &self.staging_path)
            .field("test_volume_parameters", &self.test_volume_parameters)
            .field("test_volume_size", &self.test_volume_size)
            .field("dial_timeout", &self.dial_timeout)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("test_volume_prefix", &self.test_volume_prefix)
            .finish_non_exhaustive()
    }
}

impl SanityConfig {
    /// Create `SanityConfig` using `prepare::create_dir` and `prepare::remove_dir` for directories
    pub fn new(
        address: impl Into<String>,
        target_path: impl Into<PathBuf>,
        staging_path: impl Into<PathBuf>,
    ) -> Self {
        let create_dir: CreateDirFn = Arc::new(prepare::create_dir);
        let remove_dir: RemoveDirFn = Arc::new(prepare::remove_dir);
        Self {
            address: address.into(),
            target_path: target_path.into(),
            staging_path: staging_path.into(),
            create_target_dir: Arc::clone(&create_dir),
            create_staging_dir: create_dir,
            remove_target_path: Arc::clone(&remove_dir),
            remove_staging_path: remove_dir,
            test_volume_parameters: HashMap::new(),
            test_volume_size: DEFAULT_TEST_VOLUME_SIZE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            test_volume_prefix: DEFAULT_TEST_VOLUME_PREFIX.to_owned(),
        }
    }

    /// Use `f` to create both the target and the staging directory
    #[must_use]
    pub fn with_create_dir<F>(mut self, f: F) -> Self
    where
        F: Fn(&Path) -> anyhow::Result<PathBuf> + Send + Sync + 'static,
    {
        let create_dir: CreateDirFn = Arc::new(f);
        self.create_target_dir = Arc::clone(&create_dir);
        self.create_staging_dir = create_dir;
        self
    }

    /// Set the parameters passed to every `CreateVolume`
    #[must_use]
    pub fn with_volume_parameters(mut self, parameters: HashMap<String, String>) -> Self {
        self.test_volume_parameters = parameters;
        self
    }

    /// Set the size of volumes created by the suite
    #[must_use]
    pub fn with_volume_size(mut self, size: i64) -> Self {
        self.test_volume_size = size;
        self
    }
}

/// The result of one sanity case
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CaseResult {
    /// All assertions held
    Passed,
    /// An assertion failed or an RPC misbehaved
    Failed(String),
    /// The plugin lacks a capability the case needs
    Skipped(String),
}

/// The result of a named case
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaseReport {
    /// The case name
    pub name: String,
    /// The case result
    pub result: CaseResult,
}

/// The results of a sanity run in execution order
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SanityReport {
    /// Case results
    cases: Vec<CaseReport>,
}

impl SanityReport {
    /// Create an empty `SanityReport`
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a case result
    pub fn record(&mut self, name: &str, result: CaseResult) {
        match result {
            CaseResult::Passed => info!("[PASS] {}", name),
            CaseResult::Failed(ref msg) => error!("[FAIL] {}: {}", name, msg),
            CaseResult::Skipped(ref reason) => info!("[SKIP] {}: {}", name, reason),
        }
        self.cases.push(CaseReport {
            name: name.to_owned(),
            result,
        });
    }

    /// All recorded cases
    pub fn cases(&self) -> &[CaseReport] {
        &self.cases
    }

    /// The failed cases
    pub fn failures(&self) -> impl Iterator<Item = &CaseReport> {
        self.cases
            .iter()
            .filter(|c| matches!(c.result, CaseResult::Failed(_)))
    }

    /// Whether no case failed
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
    }

    /// Count of passed, failed and skipped cases
    pub fn summary(&self) -> (usize, usize, usize) {
        self.cases
            .iter()
            .fold((0, 0, 0), |(p, f, s), c| match c.result {
                CaseResult::Passed => (p + 1, f, s),
                CaseResult::Failed(_) => (p, f + 1, s),
                CaseResult::Skipped(_) => (p, f, s + 1),
            })
    }

    /// Panic with the failed cases if any case failed
    pub fn assert_success(&self) {
        if !self.is_success() {
            let failures: Vec<String> = self
                .failures()
                .map(|c| match c.result {
                    CaseResult::Failed(ref msg) => format!("{}: {}", c.name, msg),
                    _ => c.name.clone(),
                })
                .collect();
            panic!(
                "{} sanity case(s) failed:\n{}",
                failures.len(),
                failures.join("\n")
            );
        }
    }
}

/// A capability a case depends on
#[derive(Clone, Copy, Debug)]
enum Requirement {
    /// The plugin provides the controller service
    ControllerService,
    /// The controller supports an RPC
    Controller(ControllerServiceCapability_RPC_Type),
    /// The node supports an RPC
    Node(NodeServiceCapability_RPC_Type),
}

/// A sanity case
struct Case {
    /// The case name
    name: &'static str,
    /// The capability the case depends on
    requires: Option<Requirement>,
    /// Whether the case publishes or stages into the prepared directories
    uses_dirs: bool,
    /// The case body
    run: fn(&SanityContext<'_>, &mut Cleanup) -> anyhow::Result<()>,
}

/// Clients and discovered capabilities shared by all cases
struct SanityContext<'a> {
    /// The run configuration
    config: &'a SanityConfig,
    /// Identity client
    identity: IdentityClient,
    /// Controller client
    controller: ControllerClient,
    /// Node client
    node: NodeClient,
    /// Plugin capabilities
    plugin_caps: Vec<PluginCapability_Service_Type>,
    /// Controller capabilities
    controller_caps: Vec<ControllerServiceCapability_RPC_Type>,
    /// Node capabilities
    node_caps: Vec<NodeServiceCapability_RPC_Type>,
    /// The target path handed to `NodePublishVolume`
    target_path: PathBuf,
    /// The staging path handed to `NodeStageVolume`
    staging_path: PathBuf,
}

impl SanityContext<'_> {
    /// Call option with the configured deadline
    fn call_opt(&self) -> CallOption {
        CallOption::default().timeout(self.config.rpc_timeout)
    }

    /// Whether the plugin meets a requirement
    fn satisfies(&self, req: Requirement) -> bool {
        match req {
            Requirement::ControllerService => self
                .plugin_caps
                .contains(&PluginCapability_Service_Type::CONTROLLER_SERVICE),
            Requirement::Controller(rpc_type) => self.controller_caps.contains(&rpc_type),
            Requirement::Node(rpc_type) => self.node_caps.contains(&rpc_type),
        }
    }

    /// Whether the controller supports an RPC
    fn has_controller_cap(&self, rpc_type: ControllerServiceCapability_RPC_Type) -> bool {
        self.satisfies(Requirement::ControllerService)
            && self.satisfies(Requirement::Controller(rpc_type))
    }

    /// Whether the node supports an RPC
    fn has_node_cap(&self, rpc_type: NodeServiceCapability_RPC_Type) -> bool {
        self.satisfies(Requirement::Node(rpc_type))
    }

    /// A unique volume name
    fn unique_volume_name(&self, tag: &str) -> String {
        format!(
            "{}-{}-{}",
            self.config.test_volume_prefix,
            tag,
            uuid::Uuid::new_v4().simple()
        )
    }

    /// Discover plugin, controller and node capabilities
    fn discover(&mut self) -> anyhow::Result<()> {
        let plugin = self
            .identity
            .get_plugin_capabilities_opt(&GetPluginCapabilitiesRequest::new(), self.call_opt())?;
        self.plugin_caps = plugin
            .get_capabilities()
            .iter()
            .filter(|c| c.has_service())
            .map(|c| c.get_service().get_field_type())
            .collect();
        debug!("plugin capabilities: {:?}", self.plugin_caps);

        if self.satisfies(Requirement::ControllerService) {
            let controller = self.controller.controller_get_capabilities_opt(
                &ControllerGetCapabilitiesRequest::new(),
                self.call_opt(),
            )?;
            self.controller_caps = controller
                .get_capabilities()
                .iter()
                .filter(|c| c.has_rpc())
                .map(|c| c.get_rpc().get_field_type())
                .collect();
            debug!("controller capabilities: {:?}", self.controller_caps);
        }

        let node = self
            .node
            .node_get_capabilities_opt(&NodeGetCapabilitiesRequest::new(), self.call_opt())?;
        self.node_caps = node
            .get_capabilities()
            .iter()
            .filter(|c| c.has_rpc())
            .map(|c| c.get_rpc().get_field_type())
            .collect();
        debug!("node capabilities: {:?}", self.node_caps);
        Ok(())
    }

    /// Create the target and staging directories through the configured callbacks
    fn prepare_dirs(&mut self) -> anyhow::Result<()> {
        self.target_path = (self.config.create_target_dir)(&self.config.target_path.join("target"))
            .map_err(|e| e.context("failed to create target directory"))?;
        self.staging_path =
            (self.config.create_staging_dir)(&self.config.staging_path.join("staging"))
                .map_err(|e| e.context("failed to create staging directory"))?;
        Ok(())
    }

    /// Remove the target and staging directories through the configured callbacks
    fn remove_dirs(&self) {
        if let Err(e) = (self.config.remove_target_path)(&self.target_path) {
            warn!("failed to remove target path, the error is: {:?}", e);
        }
        if let Err(e) = (self.config.remove_staging_path)(&self.staging_path) {
            warn!("failed to remove staging path, the error is: {:?}", e);
        }
    }
}

/// Check that an RPC failed with `code`
fn expect_status<T: fmt::Debug>(
    res: grpcio::Result<T>,
    code: RpcStatusCode,
) -> anyhow::Result<()> {
    match res {
        Ok(r) => bail!("expected status {:?} but the call succeeded with {:?}", code, r),
        Err(grpcio::Error::RpcFailure(status)) if status.code() == code => Ok(()),
        Err(grpcio::Error::RpcFailure(status)) => bail!(
            "expected status {:?} but got {:?}: {}",
            code,
            status.code(),
            status.message()
        ),
        Err(e) => Err(anyhow!("expected status {:?} but got: {}", code, e)),
    }
}

/// Run the sanity suite against `config.address` and record results in `report`
pub fn test(report: &mut SanityReport, config: &SanityConfig) {
    info!("running sanity suite against {}", config.address);
    let env = Arc::new(EnvBuilder::new().name_prefix("csi-sanity").build());
    let channel = ChannelBuilder::new(env).connect(&config.address);
    if !futures::executor::block_on(channel.wait_for_connected(config.dial_timeout)) {
        report.record(
            "connect",
            CaseResult::Failed(format!(
                "failed to connect to {} within {:?}",
                config.address, config.dial_timeout
            )),
        );
        return;
    }

    let mut ctx = SanityContext {
        config,
        identity: IdentityClient::new(channel.clone()),
        controller: ControllerClient::new(channel.clone()),
        node: NodeClient::new(channel),
        plugin_caps: Vec::new(),
        controller_caps: Vec::new(),
        node_caps: Vec::new(),
        target_path: config.target_path.join("target"),
        staging_path: config.staging_path.join("staging"),
    };
    if let Err(e) = ctx.discover() {
        report.record(
            "discover capabilities",
            CaseResult::Failed(format!("{:#}", e)),
        );
    }

    let cases = identity::cases()
        .into_iter()
        .chain(controller::cases())
        .chain(node::cases());
    for case in cases {
        if let Some(req) = case.requires {
            if !ctx.satisfies(req) {
                report.record(case.name, CaseResult::Skipped(format!("{:?} unsupported", req)));
                continue;
            }
        }
        // Every case publishing or staging gets freshly created directories
        if case.uses_dirs {
            if let Err(e) = ctx.prepare_dirs() {
                report.record(case.name, CaseResult::Failed(format!("{:#}", e)));
                continue;
            }
        }
        debug!("running case {}", case.name);
        let mut cleanup = Cleanup::new();
        let res = (case.run)(&ctx, &mut cleanup);
        cleanup.run(&ctx);
        if case.uses_dirs {
            ctx.remove_dirs();
        }
        match res {
            Ok(()) => report.record(case.name, CaseResult::Passed),
            Err(e) => report.record(case.name, CaseResult::Failed(format!("{:#}", e))),
        }
    }

    let (passed, failed, skipped) = report.summary();
    info!(
        "sanity suite finished, passed={} failed={} skipped={}",
        passed, failed, skipped
    );
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_report() {
        let mut report = SanityReport::new();
        report.record("a", CaseResult::Passed);
        report.record("b", CaseResult::Skipped("no capability".to_owned()));
        assert!(report.is_success());
        report.assert_success();
        report.record("c", CaseResult::Failed("boom".to_owned()));
        assert!(!report.is_success());
        assert_eq!(report.summary(), (1, 1, 1));
        let failed: Vec<&str> = report.failures().map(|c| c.name.as_str()).collect();
        assert_eq!(failed, vec!["c"]);
    }

    #[test]
    #[should_panic(expected = "1 sanity case(s) failed")]
    fn test_report_assert_failure() {
        let mut report = SanityReport::new();
        report.record("c", CaseResult::Failed("boom".to_owned()));
        report.assert_success();
    }

    #[test]
    fn test_config_defaults() {
        let config = SanityConfig::new("unix:///tmp/csi.sock", "/tmp/target", "/tmp/staging");
        assert_eq!(config.test_volume_size, DEFAULT_TEST_VOLUME_SIZE);
        assert!(config.test_volume_parameters.is_empty());
        let mut params = HashMap::new();
        params.insert("fs-name".to_owned(), "test".to_owned());
        let config = config.with_volume_parameters(params).with_volume_size(1024);
        assert_eq!(config.test_volume_size, 1024);
        assert_eq!(config.test_volume_parameters.len(), 1);
    }

    #[test]
    fn test_config_with_create_dir() -> anyhow::Result<()> {
        let config = SanityConfig::new("unix:///tmp/csi.sock", "/tmp/target", "/tmp/staging")
            .with_create_dir(|p: &Path| Ok(p.join("created")));
        assert_eq!(
            (config.create_target_dir)(Path::new("/tmp/target"))?,
            Path::new("/tmp/target/created")
        );
        assert_eq!(
            (config.create_staging_dir)(Path::new("/tmp/staging"))?,
            Path::new("/tmp/staging/created")
        );
        Ok(())
    }

    #[test]
    fn test_unreachable_plugin() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let address = format!("unix://{}", dir.path().join("csi.sock").display());
        let mut config = SanityConfig::new(address, dir.path(), dir.path());
        config.dial_timeout = Duration::from_millis(200);
        let mut report = SanityReport::new();
        test(&mut report, &config);
        assert!(!report.is_success());
        assert_eq!(report.cases().len(), 1);
        Ok(())
    }
}
