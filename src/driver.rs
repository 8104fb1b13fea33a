//! The lustre CSI driver, wiring the identity, controller and node services

use anyhow::{anyhow, Context};
use grpcio::{Environment, Server, ServerCredentials};
use log::{debug, info};
use std::path::Path;
use std::sync::Arc;

use super::controller::ControllerImpl;
use super::csi_grpc;
use super::identity::IdentityImpl;
use super::meta_data::{util, MetaData};
use super::node::NodeImpl;

/// The options to build a driver
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriverOptions {
    /// The ID of the node this driver runs on
    pub node_id: String,
    /// The driver name reported by `GetPluginInfo`
    pub driver_name: String,
    /// Record mounts in memory instead of mounting lustre
    pub enable_amlfs_mock_mount: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            driver_name: util::CSI_PLUGIN_NAME.to_owned(),
            enable_amlfs_mock_mount: false,
        }
    }
}

/// The lustre CSI driver
#[derive(Debug)]
pub struct Driver {
    /// The driver version
    version: String,
    /// Meta data shared by controller and node services
    meta_data: Arc<MetaData>,
}

impl Driver {
    /// Create `Driver` from options
    pub fn new(options: &DriverOptions) -> Self {
        let meta_data = MetaData::new(
            options.driver_name.clone(),
            options.node_id.clone(),
            options.enable_amlfs_mock_mount,
        );
        Self {
            version: util::CSI_PLUGIN_VERSION.to_owned(),
            meta_data: Arc::new(meta_data),
        }
    }

    /// Build the CSI `gRPC` server listening on a unix socket end point
    pub fn build_server(&self, end_point: &str) -> anyhow::Result<Server> {
        let sock = socket_path(end_point)?;
        remove_socket_file(sock)?;

        let identity_service = csi_grpc::create_identity(IdentityImpl::new(
            self.meta_data.get_driver_name().to_owned(),
            self.version.clone(),
        ));
        let controller_service = csi_grpc::create_controller(ControllerImpl::new(
            Arc::<MetaData>::clone(&self.meta_data),
        ));
        let node_service =
            csi_grpc::create_node(NodeImpl::new(Arc::<MetaData>::clone(&self.meta_data)));

        let mut server = grpcio::ServerBuilder::new(Arc::new(Environment::new(1)))
            .register_service(identity_service)
            .register_service(controller_service)
            .register_service(node_service)
            .build()
            .context("failed to build CSI gRPC server")?;
        let _port = server
            .add_listening_port(end_point, ServerCredentials::insecure())
            .context(format!("failed to listen on {}", end_point))?;
        debug!(
            "CSI gRPC server of driver {} bound to {}",
            self.meta_data.get_driver_name(),
            end_point
        );
        Ok(server)
    }

    /// Run the driver on `end_point` until the process exits
    pub fn run(&self, end_point: &str) -> anyhow::Result<()> {
        let mut server = self.build_server(end_point)?;
        server.start();
        info!(
            "driver {} version {} listening on {}",
            self.meta_data.get_driver_name(),
            self.version,
            end_point
        );
        loop {
            std::thread::park();
        }
    }
}

/// Extract the socket file path from a `unix://` end point
pub fn socket_path(end_point: &str) -> anyhow::Result<&Path> {
    end_point
        .strip_prefix(util::UNIX_SOCKET_PREFIX)
        .filter(|p| !p.is_empty())
        .map(Path::new)
        .ok_or_else(|| {
            anyhow!(
                "end point {} is not of the form {}<path>",
                end_point,
                util::UNIX_SOCKET_PREFIX
            )
        })
}

/// Remove existing socket file before run CSI `gRPC` server
pub fn remove_socket_file(sock: &Path) -> anyhow::Result<()> {
    if sock.exists() {
        std::fs::remove_file(sock)
            .context(format!("failed to remove existing socket file {:?}", sock))?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_socket_path() -> anyhow::Result<()> {
        assert_eq!(
            socket_path("unix:///tmp/csi.sock")?,
            Path::new("/tmp/csi.sock")
        );
        assert!(socket_path("tcp://127.0.0.1:10000").is_err());
        assert!(socket_path("unix://").is_err());
        Ok(())
    }

    #[test]
    fn test_remove_socket_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let sock = dir.path().join("csi.sock");
        remove_socket_file(&sock)?;
        std::fs::write(&sock, b"")?;
        remove_socket_file(&sock)?;
        assert!(!sock.exists());
        Ok(())
    }

    #[test]
    fn test_build_server() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let end_point = format!("unix://{}", dir.path().join("csi.sock").display());
        let driver = Driver::new(&DriverOptions {
            node_id: "fakeNodeID".to_owned(),
            driver_name: "fake".to_owned(),
            enable_amlfs_mock_mount: true,
        });
        assert_eq!(driver.meta_data.get_driver_name(), "fake");
        let _server = driver.build_server(&end_point)?;
        assert!(driver.build_server("localhost:10000").is_err());
        Ok(())
    }
}
