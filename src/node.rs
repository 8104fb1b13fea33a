//! The implementation for CSI node service

use anyhow::Context;
use grpcio::*;
use log::{debug, error, info, warn};
use nix::sys::statvfs;
use protobuf::RepeatedField;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use super::csi::*;
use super::csi_grpc::Node;
use super::meta_data::{util, LustreVolume, MetaData};

/// for `NodeService` implementation
#[derive(Clone)]
pub struct NodeImpl {
    /// Node capabilities
    caps: Vec<NodeServiceCapability>,
    /// Volume meta data for this node
    meta_data: Arc<MetaData>,
}

impl NodeImpl {
    /// Create `NodeImpl`
    pub fn new(meta_data: Arc<MetaData>) -> Self {
        let cap_vec = vec![
            NodeServiceCapability_RPC_Type::STAGE_UNSTAGE_VOLUME,
            NodeServiceCapability_RPC_Type::GET_VOLUME_STATS,
        ];
        let caps = cap_vec
            .into_iter()
            .map(|rpc_type| {
                let mut csc = NodeServiceCapability::new();
                csc.mut_rpc().set_field_type(rpc_type);
                csc
            })
            .collect();
        Self { caps, meta_data }
    }

    /// Mount lustre at the staging path unless already mounted
    fn stage_volume(&self, req: &NodeStageVolumeRequest) -> anyhow::Result<()> {
        let staging_path = Path::new(req.get_staging_target_path());
        let mounter = self.meta_data.mounter();
        if mounter.is_mount_point(staging_path)? {
            info!(
                "volume ID={} already staged at {:?}",
                req.get_volume_id(),
                staging_path
            );
            return Ok(());
        }
        let source = LustreVolume::resolve_source(req.get_volume_id(), req.get_volume_context())?;
        fs::create_dir_all(staging_path)
            .context(format!("failed to create staging path={:?}", staging_path))?;
        let mount_flags = req.get_volume_capability().get_mount().get_mount_flags();
        mounter.mount(&source, staging_path, util::LUSTRE_FS_TYPE, mount_flags)
    }

    /// Un-mount the staging path when it is mounted
    fn unstage_volume(&self, req: &NodeUnstageVolumeRequest) -> anyhow::Result<()> {
        let staging_path = Path::new(req.get_staging_target_path());
        let mounter = self.meta_data.mounter();
        if mounter.is_mount_point(staging_path)? {
            mounter.unmount(staging_path)?;
        } else {
            debug!("staging path={:?} not mounted", staging_path);
        }
        Ok(())
    }

    /// Un-mount the target path and remove it
    fn unpublish_volume(&self, req: &NodeUnpublishVolumeRequest) -> anyhow::Result<()> {
        let target_path = Path::new(req.get_target_path());
        let mounter = self.meta_data.mounter();
        if mounter.is_mount_point(target_path)? {
            mounter.unmount(target_path)?;
        }
        // csi-sanity requires plugin to remove the target mount directory
        match fs::remove_dir(target_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("target path={:?} already removed", target_path);
                Ok(())
            }
            Err(e) => Err(e).context(format!(
                "failed to remove mount target path={:?}",
                target_path
            )),
        }
    }

    /// Collect byte and inode usage of a mounted path
    fn volume_usage(volume_path: &Path) -> anyhow::Result<Vec<VolumeUsage>> {
        let stat = statvfs::statvfs(volume_path)
            .context(format!("failed to statvfs {:?}", volume_path))?;
        let frag_size = u64::from(stat.fragment_size());
        let to_i64 = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
        let blocks = u64::from(stat.blocks());
        let blocks_free = u64::from(stat.blocks_free());
        let blocks_avail = u64::from(stat.blocks_available());
        let files = u64::from(stat.files());
        let files_free = u64::from(stat.files_free());

        let mut bytes = VolumeUsage::new();
        bytes.set_unit(VolumeUsage_Unit::BYTES);
        bytes.set_total(to_i64(blocks.saturating_mul(frag_size)));
        bytes.set_available(to_i64(blocks_avail.saturating_mul(frag_size)));
        bytes.set_used(to_i64(
            blocks.saturating_sub(blocks_free).saturating_mul(frag_size),
        ));

        let mut inodes = VolumeUsage::new();
        inodes.set_unit(VolumeUsage_Unit::INODES);
        inodes.set_total(to_i64(files));
        inodes.set_available(to_i64(files_free));
        inodes.set_used(to_i64(files.saturating_sub(files_free)));

        Ok(vec![bytes, inodes])
    }
}

impl Node for NodeImpl {
    fn node_stage_volume(
        &mut self,
        ctx: RpcContext,
        req: NodeStageVolumeRequest,
        sink: UnarySink<NodeStageVolumeResponse>,
    ) {
        debug!("node_stage_volume request: {:?}", req);

        // Check arguments
        let vol_id = req.get_volume_id();
        if vol_id.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume ID missing in request".to_owned(),
            );
        }
        if req.get_staging_target_path().is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "staging target path missing in request".to_owned(),
            );
        }
        if !req.has_volume_capability() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume capability missing in request".to_owned(),
            );
        }
        if req.get_volume_capability().has_block() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "block volume capability not supported".to_owned(),
            );
        }

        match self.stage_volume(&req) {
            Ok(()) => {
                let r = NodeStageVolumeResponse::new();
                util::success(&ctx, sink, r)
            }
            Err(e) => {
                error!("failed to stage volume ID={}, the error is: {:?}", vol_id, e);
                util::fail(&ctx, sink, RpcStatusCode::INTERNAL, format!("{:#}", e))
            }
        }
    }

    fn node_unstage_volume(
        &mut self,
        ctx: RpcContext,
        req: NodeUnstageVolumeRequest,
        sink: UnarySink<NodeUnstageVolumeResponse>,
    ) {
        debug!("node_unstage_volume request: {:?}", req);

        // Check arguments
        if req.get_volume_id().is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume ID missing in request".to_owned(),
            );
        }
        if req.get_staging_target_path().is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "staging target path missing in request".to_owned(),
            );
        }

        match self.unstage_volume(&req) {
            Ok(()) => {
                let r = NodeUnstageVolumeResponse::new();
                util::success(&ctx, sink, r)
            }
            Err(e) => util::fail(&ctx, sink, RpcStatusCode::INTERNAL, format!("{:#}", e)),
        }
    }

    fn node_publish_volume(
        &mut self,
        ctx: RpcContext,
        req: NodePublishVolumeRequest,
        sink: UnarySink<NodePublishVolumeResponse>,
    ) {
        debug!("node_publish_volume request: {:?}", req);

        if !req.has_volume_capability() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume capability missing in request".to_owned(),
            );
        }
        let vol_id = req.get_volume_id();
        if vol_id.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume ID missing in request".to_owned(),
            );
        }
        let target_dir = req.get_target_path();
        if target_dir.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "target path missing in request".to_owned(),
            );
        }
        let staging_dir = req.get_staging_target_path();
        if staging_dir.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::FAILED_PRECONDITION,
                "staging target path missing in request".to_owned(),
            );
        }

        let mounter = self.meta_data.mounter();
        let (target_path, staging_path) = (Path::new(target_dir), Path::new(staging_dir));
        match mounter.is_mount_point(staging_path) {
            Ok(true) => {}
            Ok(false) => {
                return util::fail(
                    &ctx,
                    sink,
                    RpcStatusCode::FAILED_PRECONDITION,
                    format!("volume ID={} is not staged at {}", vol_id, staging_dir),
                );
            }
            Err(e) => {
                return util::fail(&ctx, sink, RpcStatusCode::INTERNAL, format!("{:#}", e));
            }
        }
        match mounter.is_mount_point(target_path) {
            Ok(true) => {
                info!("volume ID={} already published at {}", vol_id, target_dir);
                let r = NodePublishVolumeResponse::new();
                return util::success(&ctx, sink, r);
            }
            Ok(false) => {}
            Err(e) => {
                return util::fail(&ctx, sink, RpcStatusCode::INTERNAL, format!("{:#}", e));
            }
        }

        if let Err(e) = fs::create_dir_all(target_path) {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INTERNAL,
                format!("failed to create target path={}, the error is: {}", target_dir, e),
            );
        }
        let read_only = req.get_readonly();
        match mounter.bind_mount(staging_path, target_path, read_only) {
            Ok(()) => {
                info!(
                    "volume ID={} published at {}, read only={}",
                    vol_id, target_dir, read_only,
                );
                let r = NodePublishVolumeResponse::new();
                util::success(&ctx, sink, r)
            }
            Err(e) => {
                error!("failed to publish volume ID={}, the error is: {:?}", vol_id, e);
                util::fail(&ctx, sink, RpcStatusCode::INTERNAL, format!("{:#}", e))
            }
        }
    }

    fn node_unpublish_volume(
        &mut self,
        ctx: RpcContext,
        req: NodeUnpublishVolumeRequest,
        sink: UnarySink<NodeUnpublishVolumeResponse>,
    ) {
        debug!("node_unpublish_volume request: {:?}", req);

        let vol_id = req.get_volume_id();
        if vol_id.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume ID missing in request".to_owned(),
            );
        }
        if req.get_target_path().is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "target path missing in request".to_owned(),
            );
        }

        match self.unpublish_volume(&req) {
            Ok(()) => {
                let r = NodeUnpublishVolumeResponse::new();
                util::success(&ctx, sink, r)
            }
            Err(e) => {
                warn!("failed to unpublish volume ID={}, the error is: {:?}", vol_id, e);
                util::fail(&ctx, sink, RpcStatusCode::INTERNAL, format!("{:#}", e))
            }
        }
    }

    fn node_get_volume_stats(
        &mut self,
        ctx: RpcContext,
        req: NodeGetVolumeStatsRequest,
        sink: UnarySink<NodeGetVolumeStatsResponse>,
    ) {
        debug!("node_get_volume_stats request: {:?}", req);

        if req.get_volume_id().is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume ID missing in request".to_owned(),
            );
        }
        let volume_path = Path::new(req.get_volume_path());
        if req.get_volume_path().is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume path missing in request".to_owned(),
            );
        }
        if !volume_path.exists() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::NOT_FOUND,
                format!("path {:?} does not exist", volume_path),
            );
        }

        match Self::volume_usage(volume_path) {
            Ok(usage) => {
                let mut r = NodeGetVolumeStatsResponse::new();
                r.set_usage(RepeatedField::from_vec(usage));
                util::success(&ctx, sink, r)
            }
            Err(e) => util::fail(&ctx, sink, RpcStatusCode::INTERNAL, format!("{:#}", e)),
        }
    }

    fn node_get_capabilities(
        &mut self,
        ctx: RpcContext,
        req: NodeGetCapabilitiesRequest,
        sink: UnarySink<NodeGetCapabilitiesResponse>,
    ) {
        debug!("node_get_capabilities request: {:?}", req);

        let mut r = NodeGetCapabilitiesResponse::new();
        r.set_capabilities(RepeatedField::from_vec(self.caps.clone()));
        util::success(&ctx, sink, r)
    }

    fn node_get_info(
        &mut self,
        ctx: RpcContext,
        req: NodeGetInfoRequest,
        sink: UnarySink<NodeGetInfoResponse>,
    ) {
        debug!("node_get_info request: {:?}", req);

        let mut r = NodeGetInfoResponse::new();
        r.set_node_id(self.meta_data.get_node_id().to_owned());
        util::success(&ctx, sink, r)
    }
}
