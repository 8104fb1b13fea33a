//! Drive the lustre driver services through `gRPC` clients

use amlfs_csi::csi::*;
use amlfs_csi::csi_grpc::{ControllerClient, IdentityClient, NodeClient};
use amlfs_csi::meta_data::util;
use amlfs_csi::sanity::launcher::{self, PluginHandle};
use amlfs_csi::DriverOptions;
use grpcio::{ChannelBuilder, EnvBuilder, RpcStatusCode};
use protobuf::RepeatedField;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

const NODE_ID: &str = "fakeNodeID";
const DRIVER_NAME: &str = "fake";

/// A mock-mount driver served from a temporary directory
struct TestDriver {
    dir: TempDir,
    plugin: PluginHandle,
    channel: grpcio::Channel,
}

impl TestDriver {
    fn start() -> anyhow::Result<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir()?;
        let end_point = format!("unix://{}", dir.path().join("csi.sock").display());
        let plugin = launcher::launch(
            DriverOptions {
                node_id: NODE_ID.to_owned(),
                driver_name: DRIVER_NAME.to_owned(),
                enable_amlfs_mock_mount: true,
            },
            &end_point,
        )?;
        let env = Arc::new(EnvBuilder::new().build());
        let channel = ChannelBuilder::new(env).connect(&end_point);
        Ok(Self {
            dir,
            plugin,
            channel,
        })
    }

    fn identity(&self) -> IdentityClient {
        IdentityClient::new(self.channel.clone())
    }

    fn controller(&self) -> ControllerClient {
        ControllerClient::new(self.channel.clone())
    }

    fn node(&self) -> NodeClient {
        NodeClient::new(self.channel.clone())
    }

    fn path(&self, name: &str) -> String {
        self.dir.path().join(name).display().to_string()
    }

    fn stop(self) -> anyhow::Result<()> {
        self.plugin.stop()
    }
}

fn lustre_parameters() -> HashMap<String, String> {
    let mut params = HashMap::new();
    params.insert(
        util::VOLUME_CONTEXT_MDS_IP_ADDRESS.to_owned(),
        "127.0.0.1".to_owned(),
    );
    params.insert(util::VOLUME_CONTEXT_FS_NAME.to_owned(), "test".to_owned());
    params
}

fn mount_capability() -> VolumeCapability {
    let mut vc = VolumeCapability::new();
    vc.set_mount(VolumeCapability_MountVolume::new());
    vc.mut_access_mode()
        .set_mode(VolumeCapability_AccessMode_Mode::MULTI_NODE_MULTI_WRITER);
    vc
}

fn block_capability() -> VolumeCapability {
    let mut vc = VolumeCapability::new();
    vc.set_block(VolumeCapability_BlockVolume::new());
    vc.mut_access_mode()
        .set_mode(VolumeCapability_AccessMode_Mode::SINGLE_NODE_WRITER);
    vc
}

fn create_volume_request(name: &str, size: i64) -> CreateVolumeRequest {
    let mut req = CreateVolumeRequest::new();
    req.set_name(name.to_owned());
    req.set_volume_capabilities(RepeatedField::from_vec(vec![mount_capability()]));
    req.set_parameters(lustre_parameters());
    req.mut_capacity_range().set_required_bytes(size);
    req
}

fn status_code<T>(res: grpcio::Result<T>) -> Option<RpcStatusCode> {
    match res {
        Err(grpcio::Error::RpcFailure(status)) => Some(status.code()),
        _ => None,
    }
}

#[test]
fn test_identity_server() -> anyhow::Result<()> {
    let driver = TestDriver::start()?;
    let client = driver.identity();

    let info = client.get_plugin_info(&GetPluginInfoRequest::new())?;
    assert_eq!(info.get_name(), DRIVER_NAME);
    assert_eq!(info.get_vendor_version(), util::CSI_PLUGIN_VERSION);

    let caps = client.get_plugin_capabilities(&GetPluginCapabilitiesRequest::new())?;
    let service_types: Vec<_> = caps
        .get_capabilities()
        .iter()
        .map(|c| c.get_service().get_field_type())
        .collect();
    assert_eq!(
        service_types,
        vec![PluginCapability_Service_Type::CONTROLLER_SERVICE]
    );

    let probe = client.probe(&ProbeRequest::new())?;
    assert!(probe.get_ready().get_value());
    driver.stop()
}

#[test]
fn test_controller_server() -> anyhow::Result<()> {
    let driver = TestDriver::start()?;
    let client = driver.controller();

    let caps = client.controller_get_capabilities(&ControllerGetCapabilitiesRequest::new())?;
    let rpc_types: Vec<_> = caps
        .get_capabilities()
        .iter()
        .map(|c| c.get_rpc().get_field_type())
        .collect();
    assert_eq!(
        rpc_types,
        vec![
            ControllerServiceCapability_RPC_Type::CREATE_DELETE_VOLUME,
            ControllerServiceCapability_RPC_Type::LIST_VOLUMES,
        ]
    );

    let resp = client.create_volume(&create_volume_request("vol1", 1024))?;
    let vol = resp.get_volume();
    assert_eq!(vol.get_volume_id(), "vol1#127.0.0.1#test");
    assert_eq!(vol.get_capacity_bytes(), 1024);
    assert_eq!(vol.get_volume_context(), &lustre_parameters());

    // Same name and size is idempotent, different size conflicts
    let again = client.create_volume(&create_volume_request("vol1", 1024))?;
    assert_eq!(again.get_volume().get_volume_id(), vol.get_volume_id());
    let conflict = client.create_volume(&create_volume_request("vol1", 2048));
    assert_eq!(status_code(conflict), Some(RpcStatusCode::ALREADY_EXISTS));

    let mut no_params = create_volume_request("vol2", 0);
    no_params.clear_parameters();
    assert_eq!(
        status_code(client.create_volume(&no_params)),
        Some(RpcStatusCode::INVALID_ARGUMENT)
    );
    let mut block = create_volume_request("vol3", 0);
    block.set_volume_capabilities(RepeatedField::from_vec(vec![block_capability()]));
    assert_eq!(
        status_code(client.create_volume(&block)),
        Some(RpcStatusCode::INVALID_ARGUMENT)
    );
    assert_eq!(
        status_code(client.create_volume(&create_volume_request("bad#name", 0))),
        Some(RpcStatusCode::INVALID_ARGUMENT)
    );

    let mut validate = ValidateVolumeCapabilitiesRequest::new();
    validate.set_volume_id(vol.get_volume_id().to_owned());
    validate.set_volume_capabilities(RepeatedField::from_vec(vec![block_capability()]));
    let unconfirmed = client.validate_volume_capabilities(&validate)?;
    assert!(!unconfirmed.has_confirmed());
    assert!(!unconfirmed.get_message().is_empty());

    let list = client.list_volumes(&ListVolumesRequest::new())?;
    assert_eq!(list.get_entries().len(), 1);
    let mut bad_token = ListVolumesRequest::new();
    bad_token.set_starting_token("10".to_owned());
    assert_eq!(
        status_code(client.list_volumes(&bad_token)),
        Some(RpcStatusCode::ABORTED)
    );

    assert_eq!(
        status_code(client.get_capacity(&GetCapacityRequest::new())),
        Some(RpcStatusCode::UNIMPLEMENTED)
    );

    let mut delete = DeleteVolumeRequest::new();
    delete.set_volume_id(vol.get_volume_id().to_owned());
    let _ = client.delete_volume(&delete)?;
    let _ = client.delete_volume(&delete)?;
    let list = client.list_volumes(&ListVolumesRequest::new())?;
    assert!(list.get_entries().is_empty());
    driver.stop()
}

#[test]
fn test_node_server_publish_unpublish() -> anyhow::Result<()> {
    let driver = TestDriver::start()?;
    let client = driver.node();
    let vol_id = "vol1#127.0.0.1#test";
    let staging_path = driver.path("staging");
    let target_path = driver.path("target");

    let info = client.node_get_info(&NodeGetInfoRequest::new())?;
    assert_eq!(info.get_node_id(), NODE_ID);

    // Publish before stage is rejected
    let mut publish = NodePublishVolumeRequest::new();
    publish.set_volume_id(vol_id.to_owned());
    publish.set_staging_target_path(staging_path.clone());
    publish.set_target_path(target_path.clone());
    publish.set_volume_capability(mount_capability());
    assert_eq!(
        status_code(client.node_publish_volume(&publish)),
        Some(RpcStatusCode::FAILED_PRECONDITION)
    );

    // No volume context, the lustre source comes from the volume ID
    let mut stage = NodeStageVolumeRequest::new();
    stage.set_volume_id(vol_id.to_owned());
    stage.set_staging_target_path(staging_path.clone());
    stage.set_volume_capability(mount_capability());
    let _ = client.node_stage_volume(&stage)?;
    assert!(Path::new(&staging_path).is_dir());

    let _ = client.node_publish_volume(&publish)?;
    let _ = client.node_publish_volume(&publish)?;
    assert!(Path::new(&target_path).is_dir());

    let mut stats = NodeGetVolumeStatsRequest::new();
    stats.set_volume_id(vol_id.to_owned());
    stats.set_volume_path(target_path.clone());
    let usage = client.node_get_volume_stats(&stats)?;
    let units: Vec<_> = usage.get_usage().iter().map(VolumeUsage::get_unit).collect();
    assert_eq!(units, vec![VolumeUsage_Unit::BYTES, VolumeUsage_Unit::INODES]);

    let mut unpublish = NodeUnpublishVolumeRequest::new();
    unpublish.set_volume_id(vol_id.to_owned());
    unpublish.set_target_path(target_path.clone());
    let _ = client.node_unpublish_volume(&unpublish)?;
    assert!(!Path::new(&target_path).exists());
    let _ = client.node_unpublish_volume(&unpublish)?;

    let mut unstage = NodeUnstageVolumeRequest::new();
    unstage.set_volume_id(vol_id.to_owned());
    unstage.set_staging_target_path(staging_path);
    let _ = client.node_unstage_volume(&unstage)?;
    let _ = client.node_unstage_volume(&unstage)?;

    stats.set_volume_path(target_path);
    assert_eq!(
        status_code(client.node_get_volume_stats(&stats)),
        Some(RpcStatusCode::NOT_FOUND)
    );
    driver.stop()
}

#[test]
fn test_node_server_stage_without_lustre_source() -> anyhow::Result<()> {
    let driver = TestDriver::start()?;
    let client = driver.node();

    let mut stage = NodeStageVolumeRequest::new();
    stage.set_volume_id("not-a-lustre-volume".to_owned());
    stage.set_staging_target_path(driver.path("staging"));
    stage.set_volume_capability(mount_capability());
    assert_eq!(
        status_code(client.node_stage_volume(&stage)),
        Some(RpcStatusCode::INTERNAL)
    );

    stage.set_volume_capability(block_capability());
    assert_eq!(
        status_code(client.node_stage_volume(&stage)),
        Some(RpcStatusCode::INVALID_ARGUMENT)
    );
    driver.stop()
}
