//! Sanity cases of the node service

use anyhow::{ensure, Context};
use grpcio::RpcStatusCode;
use std::collections::HashMap;

use super::super::csi::*;
use super::cleanup::Cleanup;
use super::controller::{create_volume, delete_volume, mount_capability};
use super::{expect_status, Case, Requirement, SanityContext};

/// The node cases in execution order
pub(super) fn cases() -> Vec<Case> {
    let stage = Some(Requirement::Node(
        NodeServiceCapability_RPC_Type::STAGE_UNSTAGE_VOLUME,
    ));
    let stats = Some(Requirement::Node(
        NodeServiceCapability_RPC_Type::GET_VOLUME_STATS,
    ));
    vec![
        Case {
            name: "Node GetCapabilities returns known capabilities",
            requires: None,
            uses_dirs: false,
            run: get_capabilities,
        },
        Case {
            name: "NodeGetInfo returns a node ID",
            requires: None,
            uses_dirs: false,
            run: get_info,
        },
        Case {
            name: "NodePublishVolume fails when no volume ID is provided",
            requires: None,
            uses_dirs: true,
            run: publish_missing_id,
        },
        Case {
            name: "NodePublishVolume fails when no target path is provided",
            requires: None,
            uses_dirs: true,
            run: publish_missing_target,
        },
        Case {
            name: "NodePublishVolume fails when no volume capability is provided",
            requires: None,
            uses_dirs: true,
            run: publish_missing_capability,
        },
        Case {
            name: "NodeUnpublishVolume fails when no volume ID is provided",
            requires: None,
            uses_dirs: true,
            run: unpublish_missing_id,
        },
        Case {
            name: "NodeUnpublishVolume fails when no target path is provided",
            requires: None,
            uses_dirs: true,
            run: unpublish_missing_target,
        },
        Case {
            name: "NodeStageVolume fails when no volume ID is provided",
            requires: stage,
            uses_dirs: true,
            run: stage_missing_id,
        },
        Case {
            name: "NodeStageVolume fails when no staging target path is provided",
            requires: stage,
            uses_dirs: true,
            run: stage_missing_staging_path,
        },
        Case {
            name: "NodeStageVolume fails when no volume capability is provided",
            requires: stage,
            uses_dirs: true,
            run: stage_missing_capability,
        },
        Case {
            name: "NodeUnstageVolume fails when no volume ID is provided",
            requires: stage,
            uses_dirs: true,
            run: unstage_missing_id,
        },
        Case {
            name: "NodeUnstageVolume fails when no staging target path is provided",
            requires: stage,
            uses_dirs: true,
            run: unstage_missing_staging_path,
        },
        Case {
            name: "NodeGetVolumeStats fails when no volume ID is provided",
            requires: stats,
            uses_dirs: false,
            run: stats_missing_id,
        },
        Case {
            name: "NodeGetVolumeStats fails when no volume path is provided",
            requires: stats,
            uses_dirs: false,
            run: stats_missing_path,
        },
        Case {
            name: "NodeGetVolumeStats fails for a non-existent volume path",
            requires: stats,
            uses_dirs: false,
            run: stats_path_not_found,
        },
        Case {
            name: "Node publishes and unpublishes a volume through its whole lifecycle",
            requires: None,
            uses_dirs: true,
            run: lifecycle,
        },
        Case {
            name: "Node stage and publish are idempotent",
            requires: None,
            uses_dirs: true,
            run: idempotent_lifecycle,
        },
    ]
}

/// A volume the node cases operate on
struct NodeVolume {
    /// Volume ID
    id: String,
    /// Volume context returned by `CreateVolume`
    context: HashMap<String, String>,
}

/// Create a volume through the controller, or make one up from the parameters
fn provision(
    ctx: &SanityContext<'_>,
    cleanup: &mut Cleanup,
    tag: &str,
) -> anyhow::Result<NodeVolume> {
    if ctx.has_controller_cap(ControllerServiceCapability_RPC_Type::CREATE_DELETE_VOLUME) {
        let vol = create_volume(ctx, cleanup, tag)?;
        Ok(NodeVolume {
            id: vol.get_volume_id().to_owned(),
            context: vol.get_volume_context().clone(),
        })
    } else {
        Ok(NodeVolume {
            id: ctx.unique_volume_name(tag),
            context: ctx.config.test_volume_parameters.clone(),
        })
    }
}

/// Release a volume provisioned by `provision`
fn unprovision(
    ctx: &SanityContext<'_>,
    cleanup: &mut Cleanup,
    vol: &NodeVolume,
) -> anyhow::Result<()> {
    if ctx.has_controller_cap(ControllerServiceCapability_RPC_Type::CREATE_DELETE_VOLUME) {
        delete_volume(ctx, cleanup, &vol.id)?;
    }
    Ok(())
}

/// Publish the volume on this node through the controller when supported
fn controller_publish(
    ctx: &SanityContext<'_>,
    vol: &NodeVolume,
) -> anyhow::Result<HashMap<String, String>> {
    if !ctx.has_controller_cap(ControllerServiceCapability_RPC_Type::PUBLISH_UNPUBLISH_VOLUME) {
        return Ok(HashMap::new());
    }
    let info = ctx
        .node
        .node_get_info_opt(&NodeGetInfoRequest::new(), ctx.call_opt())
        .context("NodeGetInfo failed")?;
    let mut req = ControllerPublishVolumeRequest::new();
    req.set_volume_id(vol.id.clone());
    req.set_node_id(info.get_node_id().to_owned());
    req.set_volume_capability(mount_capability());
    req.set_volume_context(vol.context.clone());
    let r = ctx
        .controller
        .controller_publish_volume_opt(&req, ctx.call_opt())
        .context(format!("ControllerPublishVolume of {} failed", vol.id))?;
    Ok(r.get_publish_context().clone())
}

/// Unpublish the volume from this node through the controller when supported
fn controller_unpublish(ctx: &SanityContext<'_>, vol: &NodeVolume) -> anyhow::Result<()> {
    if !ctx.has_controller_cap(ControllerServiceCapability_RPC_Type::PUBLISH_UNPUBLISH_VOLUME) {
        return Ok(());
    }
    let info = ctx
        .node
        .node_get_info_opt(&NodeGetInfoRequest::new(), ctx.call_opt())
        .context("NodeGetInfo failed")?;
    let mut req = ControllerUnpublishVolumeRequest::new();
    req.set_volume_id(vol.id.clone());
    req.set_node_id(info.get_node_id().to_owned());
    let _ = ctx
        .controller
        .controller_unpublish_volume_opt(&req, ctx.call_opt())
        .context(format!("ControllerUnpublishVolume of {} failed", vol.id))?;
    Ok(())
}

/// Build a `NodeStageVolumeRequest` for the prepared staging path
fn stage_request(
    ctx: &SanityContext<'_>,
    vol: &NodeVolume,
    publish_context: &HashMap<String, String>,
) -> NodeStageVolumeRequest {
    let mut req = NodeStageVolumeRequest::new();
    req.set_volume_id(vol.id.clone());
    req.set_staging_target_path(ctx.staging_path.display().to_string());
    req.set_volume_capability(mount_capability());
    req.set_volume_context(vol.context.clone());
    req.set_publish_context(publish_context.clone());
    req
}

/// Build a `NodePublishVolumeRequest` for the prepared target path
fn publish_request(
    ctx: &SanityContext<'_>,
    vol: &NodeVolume,
    publish_context: &HashMap<String, String>,
) -> NodePublishVolumeRequest {
    let mut req = NodePublishVolumeRequest::new();
    req.set_volume_id(vol.id.clone());
    req.set_target_path(ctx.target_path.display().to_string());
    if ctx.has_node_cap(NodeServiceCapability_RPC_Type::STAGE_UNSTAGE_VOLUME) {
        req.set_staging_target_path(ctx.staging_path.display().to_string());
    }
    req.set_volume_capability(mount_capability());
    req.set_volume_context(vol.context.clone());
    req.set_publish_context(publish_context.clone());
    req
}

/// Stage the volume when the node supports staging
fn stage(
    ctx: &SanityContext<'_>,
    cleanup: &mut Cleanup,
    vol: &NodeVolume,
    publish_context: &HashMap<String, String>,
) -> anyhow::Result<()> {
    if !ctx.has_node_cap(NodeServiceCapability_RPC_Type::STAGE_UNSTAGE_VOLUME) {
        return Ok(());
    }
    let req = stage_request(ctx, vol, publish_context);
    let _ = ctx
        .node
        .node_stage_volume_opt(&req, ctx.call_opt())
        .context(format!("NodeStageVolume of {} failed", vol.id))?;
    cleanup.volume_staged(&vol.id, &ctx.staging_path);
    Ok(())
}

/// Unstage the volume when the node supports staging
fn unstage(ctx: &SanityContext<'_>, cleanup: &mut Cleanup, vol: &NodeVolume) -> anyhow::Result<()> {
    if !ctx.has_node_cap(NodeServiceCapability_RPC_Type::STAGE_UNSTAGE_VOLUME) {
        return Ok(());
    }
    let mut req = NodeUnstageVolumeRequest::new();
    req.set_volume_id(vol.id.clone());
    req.set_staging_target_path(ctx.staging_path.display().to_string());
    let _ = ctx
        .node
        .node_unstage_volume_opt(&req, ctx.call_opt())
        .context(format!("NodeUnstageVolume of {} failed", vol.id))?;
    cleanup.volume_unstaged(&vol.id);
    Ok(())
}

/// Publish the volume at the prepared target path
fn publish(
    ctx: &SanityContext<'_>,
    cleanup: &mut Cleanup,
    vol: &NodeVolume,
    publish_context: &HashMap<String, String>,
) -> anyhow::Result<()> {
    let req = publish_request(ctx, vol, publish_context);
    let _ = ctx
        .node
        .node_publish_volume_opt(&req, ctx.call_opt())
        .context(format!("NodePublishVolume of {} failed", vol.id))?;
    cleanup.volume_published(&vol.id, &ctx.target_path);
    Ok(())
}

/// Unpublish the volume from the prepared target path
fn unpublish(ctx: &SanityContext<'_>, cleanup: &mut Cleanup, vol: &NodeVolume) -> anyhow::Result<()> {
    let mut req = NodeUnpublishVolumeRequest::new();
    req.set_volume_id(vol.id.clone());
    req.set_target_path(ctx.target_path.display().to_string());
    let _ = ctx
        .node
        .node_unpublish_volume_opt(&req, ctx.call_opt())
        .context(format!("NodeUnpublishVolume of {} failed", vol.id))?;
    cleanup.volume_unpublished(&vol.id);
    Ok(())
}

/// Check the stats of a published volume
fn check_stats(ctx: &SanityContext<'_>, vol: &NodeVolume) -> anyhow::Result<()> {
    if !ctx.has_node_cap(NodeServiceCapability_RPC_Type::GET_VOLUME_STATS) {
        return Ok(());
    }
    let mut req = NodeGetVolumeStatsRequest::new();
    req.set_volume_id(vol.id.clone());
    req.set_volume_path(ctx.target_path.display().to_string());
    let r = ctx
        .node
        .node_get_volume_stats_opt(&req, ctx.call_opt())
        .context(format!("NodeGetVolumeStats of {} failed", vol.id))?;
    ensure!(
        !r.get_usage().is_empty(),
        "NodeGetVolumeStats of {} returned no usage",
        vol.id
    );
    for usage in r.get_usage() {
        ensure!(
            usage.get_unit() != VolumeUsage_Unit::UNKNOWN,
            "volume usage {:?} has unknown unit",
            usage
        );
    }
    Ok(())
}

fn get_capabilities(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let r = ctx
        .node
        .node_get_capabilities_opt(&NodeGetCapabilitiesRequest::new(), ctx.call_opt())
        .context("NodeGetCapabilities failed")?;
    for cap in r.get_capabilities() {
        ensure!(cap.has_rpc(), "node capability {:?} has no RPC type", cap);
        ensure!(
            cap.get_rpc().get_field_type() != NodeServiceCapability_RPC_Type::UNKNOWN,
            "unknown node capability"
        );
    }
    Ok(())
}

fn get_info(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let r = ctx
        .node
        .node_get_info_opt(&NodeGetInfoRequest::new(), ctx.call_opt())
        .context("NodeGetInfo failed")?;
    ensure!(!r.get_node_id().is_empty(), "node ID is empty");
    Ok(())
}

/// A volume that was never created, for argument checks
fn fake_volume(ctx: &SanityContext<'_>) -> NodeVolume {
    NodeVolume {
        id: "id".to_owned(),
        context: ctx.config.test_volume_parameters.clone(),
    }
}

fn publish_missing_id(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = publish_request(ctx, &fake_volume(ctx), &HashMap::new());
    req.clear_volume_id();
    expect_status(
        ctx.node.node_publish_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn publish_missing_target(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = publish_request(ctx, &fake_volume(ctx), &HashMap::new());
    req.clear_target_path();
    expect_status(
        ctx.node.node_publish_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn publish_missing_capability(
    ctx: &SanityContext<'_>,
    _cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let mut req = publish_request(ctx, &fake_volume(ctx), &HashMap::new());
    req.clear_volume_capability();
    expect_status(
        ctx.node.node_publish_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn unpublish_missing_id(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = NodeUnpublishVolumeRequest::new();
    req.set_target_path(ctx.target_path.display().to_string());
    expect_status(
        ctx.node.node_unpublish_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn unpublish_missing_target(
    ctx: &SanityContext<'_>,
    _cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let mut req = NodeUnpublishVolumeRequest::new();
    req.set_volume_id("id".to_owned());
    expect_status(
        ctx.node.node_unpublish_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn stage_missing_id(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = stage_request(ctx, &fake_volume(ctx), &HashMap::new());
    req.clear_volume_id();
    expect_status(
        ctx.node.node_stage_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn stage_missing_staging_path(
    ctx: &SanityContext<'_>,
    _cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let mut req = stage_request(ctx, &fake_volume(ctx), &HashMap::new());
    req.clear_staging_target_path();
    expect_status(
        ctx.node.node_stage_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn stage_missing_capability(
    ctx: &SanityContext<'_>,
    _cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let mut req = stage_request(ctx, &fake_volume(ctx), &HashMap::new());
    req.clear_volume_capability();
    expect_status(
        ctx.node.node_stage_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn unstage_missing_id(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = NodeUnstageVolumeRequest::new();
    req.set_staging_target_path(ctx.staging_path.display().to_string());
    expect_status(
        ctx.node.node_unstage_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn unstage_missing_staging_path(
    ctx: &SanityContext<'_>,
    _cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let mut req = NodeUnstageVolumeRequest::new();
    req.set_volume_id("id".to_owned());
    expect_status(
        ctx.node.node_unstage_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn stats_missing_id(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = NodeGetVolumeStatsRequest::new();
    req.set_volume_path("/some/path".to_owned());
    expect_status(
        ctx.node.node_get_volume_stats_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn stats_missing_path(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = NodeGetVolumeStatsRequest::new();
    req.set_volume_id("id".to_owned());
    expect_status(
        ctx.node.node_get_volume_stats_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn stats_path_not_found(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let missing = ctx.config.target_path.join("no-such-volume-path");
    ensure!(!missing.exists(), "{:?} unexpectedly exists", missing);
    let mut req = NodeGetVolumeStatsRequest::new();
    req.set_volume_id("id".to_owned());
    req.set_volume_path(missing.display().to_string());
    expect_status(
        ctx.node.node_get_volume_stats_opt(&req, ctx.call_opt()),
        RpcStatusCode::NOT_FOUND,
    )
}

fn lifecycle(ctx: &SanityContext<'_>, cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let vol = provision(ctx, cleanup, "node")?;
    let publish_context = controller_publish(ctx, &vol)?;
    stage(ctx, cleanup, &vol, &publish_context)?;
    publish(ctx, cleanup, &vol, &publish_context)?;
    check_stats(ctx, &vol)?;
    unpublish(ctx, cleanup, &vol)?;
    unstage(ctx, cleanup, &vol)?;
    controller_unpublish(ctx, &vol)?;
    unprovision(ctx, cleanup, &vol)
}

fn idempotent_lifecycle(ctx: &SanityContext<'_>, cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let vol = provision(ctx, cleanup, "node-idempotent")?;
    let publish_context = controller_publish(ctx, &vol)?;
    stage(ctx, cleanup, &vol, &publish_context)?;
    stage(ctx, cleanup, &vol, &publish_context).context("repeated stage")?;
    publish(ctx, cleanup, &vol, &publish_context)?;
    publish(ctx, cleanup, &vol, &publish_context).context("repeated publish")?;
    unpublish(ctx, cleanup, &vol)?;
    unpublish(ctx, cleanup, &vol).context("repeated unpublish")?;
    unstage(ctx, cleanup, &vol)?;
    unstage(ctx, cleanup, &vol).context("repeated unstage")?;
    controller_unpublish(ctx, &vol)?;
    unprovision(ctx, cleanup, &vol)
}
