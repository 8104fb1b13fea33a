//! Sanity cases of the controller service

use anyhow::{ensure, Context};
use grpcio::RpcStatusCode;
use protobuf::RepeatedField;

use super::super::csi::*;
use super::cleanup::Cleanup;
use super::{expect_status, Case, Requirement, SanityContext};

/// Build a single-node-writer mount capability
pub(super) fn mount_capability() -> VolumeCapability {
    let mut cap = VolumeCapability::new();
    cap.set_mount(VolumeCapability_MountVolume::new());
    cap.mut_access_mode()
        .set_mode(VolumeCapability_AccessMode_Mode::SINGLE_NODE_WRITER);
    cap
}

/// Build a `CreateVolumeRequest` with the configured parameters and size
pub(super) fn create_volume_request(ctx: &SanityContext<'_>, name: &str) -> CreateVolumeRequest {
    let mut req = CreateVolumeRequest::new();
    req.set_name(name.to_owned());
    req.set_volume_capabilities(RepeatedField::from_vec(vec![mount_capability()]));
    req.set_parameters(ctx.config.test_volume_parameters.clone());
    if ctx.config.test_volume_size > 0 {
        req.mut_capacity_range()
            .set_required_bytes(ctx.config.test_volume_size);
    }
    req
}

/// Create a volume and track it for cleanup
pub(super) fn create_volume(
    ctx: &SanityContext<'_>,
    cleanup: &mut Cleanup,
    tag: &str,
) -> anyhow::Result<Volume> {
    let name = ctx.unique_volume_name(tag);
    let req = create_volume_request(ctx, &name);
    let r = ctx
        .controller
        .create_volume_opt(&req, ctx.call_opt())
        .context(format!("CreateVolume of {} failed", name))?;
    ensure!(r.has_volume(), "CreateVolume of {} returned no volume", name);
    let vol = r.get_volume().clone();
    ensure!(
        !vol.get_volume_id().is_empty(),
        "CreateVolume of {} returned an empty volume ID",
        name
    );
    cleanup.volume_created(vol.get_volume_id());
    Ok(vol)
}

/// Delete a volume and stop tracking it
pub(super) fn delete_volume(
    ctx: &SanityContext<'_>,
    cleanup: &mut Cleanup,
    vol_id: &str,
) -> anyhow::Result<()> {
    let mut req = DeleteVolumeRequest::new();
    req.set_volume_id(vol_id.to_owned());
    let _ = ctx
        .controller
        .delete_volume_opt(&req, ctx.call_opt())
        .context(format!("DeleteVolume of {} failed", vol_id))?;
    cleanup.volume_deleted(vol_id);
    Ok(())
}

/// The controller cases in execution order
pub(super) fn cases() -> Vec<Case> {
    let service = Some(Requirement::ControllerService);
    let create_delete = Some(Requirement::Controller(
        ControllerServiceCapability_RPC_Type::CREATE_DELETE_VOLUME,
    ));
    let list = Some(Requirement::Controller(
        ControllerServiceCapability_RPC_Type::LIST_VOLUMES,
    ));
    let publish = Some(Requirement::Controller(
        ControllerServiceCapability_RPC_Type::PUBLISH_UNPUBLISH_VOLUME,
    ));
    vec![
        Case {
            name: "Controller GetCapabilities returns known capabilities",
            requires: service,
            uses_dirs: false,
            run: get_capabilities,
        },
        Case {
            name: "CreateVolume fails when no name is provided",
            requires: create_delete,
            uses_dirs: false,
            run: create_volume_missing_name,
        },
        Case {
            name: "CreateVolume fails when no volume capabilities are provided",
            requires: create_delete,
            uses_dirs: false,
            run: create_volume_missing_capabilities,
        },
        Case {
            name: "CreateVolume returns the appropriate values",
            requires: create_delete,
            uses_dirs: false,
            run: create_volume_values,
        },
        Case {
            name: "CreateVolume is idempotent for the same name and capacity",
            requires: create_delete,
            uses_dirs: false,
            run: create_volume_idempotent,
        },
        Case {
            name: "CreateVolume fails for the same name with a different capacity",
            requires: create_delete,
            uses_dirs: false,
            run: create_volume_different_capacity,
        },
        Case {
            name: "DeleteVolume fails when no volume ID is provided",
            requires: create_delete,
            uses_dirs: false,
            run: delete_volume_missing_id,
        },
        Case {
            name: "DeleteVolume succeeds for an invalid volume ID",
            requires: create_delete,
            uses_dirs: false,
            run: delete_volume_invalid_id,
        },
        Case {
            name: "DeleteVolume returns the appropriate values",
            requires: create_delete,
            uses_dirs: false,
            run: delete_volume_values,
        },
        Case {
            name: "ValidateVolumeCapabilities fails when no volume ID is provided",
            requires: service,
            uses_dirs: false,
            run: validate_missing_id,
        },
        Case {
            name: "ValidateVolumeCapabilities fails when no volume capabilities are provided",
            requires: create_delete,
            uses_dirs: false,
            run: validate_missing_capabilities,
        },
        Case {
            name: "ValidateVolumeCapabilities returns the appropriate values",
            requires: create_delete,
            uses_dirs: false,
            run: validate_values,
        },
        Case {
            name: "ValidateVolumeCapabilities fails for a non-existent volume",
            requires: service,
            uses_dirs: false,
            run: validate_not_found,
        },
        Case {
            name: "ListVolumes returns the appropriate values",
            requires: list,
            uses_dirs: false,
            run: list_volumes_values,
        },
        Case {
            name: "ListVolumes fails for an invalid starting token",
            requires: list,
            uses_dirs: false,
            run: list_volumes_invalid_token,
        },
        Case {
            name: "ListVolumes pages through created volumes",
            requires: list,
            uses_dirs: false,
            run: list_volumes_pagination,
        },
        Case {
            name: "ControllerPublishVolume fails when no volume ID is provided",
            requires: publish,
            uses_dirs: false,
            run: controller_publish_missing_id,
        },
        Case {
            name: "ControllerUnpublishVolume fails when no volume ID is provided",
            requires: publish,
            uses_dirs: false,
            run: controller_unpublish_missing_id,
        },
    ]
}

fn get_capabilities(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let r = ctx
        .controller
        .controller_get_capabilities_opt(&ControllerGetCapabilitiesRequest::new(), ctx.call_opt())
        .context("ControllerGetCapabilities failed")?;
    for cap in r.get_capabilities() {
        ensure!(cap.has_rpc(), "controller capability {:?} has no RPC type", cap);
        ensure!(
            cap.get_rpc().get_field_type() != ControllerServiceCapability_RPC_Type::UNKNOWN,
            "unknown controller capability"
        );
    }
    Ok(())
}

fn create_volume_missing_name(
    ctx: &SanityContext<'_>,
    _cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let req = create_volume_request(ctx, "");
    expect_status(
        ctx.controller.create_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn create_volume_missing_capabilities(
    ctx: &SanityContext<'_>,
    cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let name = ctx.unique_volume_name("no-caps");
    let mut req = create_volume_request(ctx, &name);
    req.clear_volume_capabilities();
    let res = ctx.controller.create_volume_opt(&req, ctx.call_opt());
    if let Ok(ref r) = res {
        cleanup.volume_created(r.get_volume().get_volume_id());
    }
    expect_status(res, RpcStatusCode::INVALID_ARGUMENT)
}

fn create_volume_values(ctx: &SanityContext<'_>, cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let vol = create_volume(ctx, cleanup, "values")?;
    let requested = ctx.config.test_volume_size;
    let capacity = vol.get_capacity_bytes();
    ensure!(
        capacity == 0 || capacity >= requested,
        "volume capacity {} is less than the requested {}",
        capacity,
        requested
    );
    delete_volume(ctx, cleanup, vol.get_volume_id())
}

fn create_volume_idempotent(ctx: &SanityContext<'_>, cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let name = ctx.unique_volume_name("idempotent");
    let req = create_volume_request(ctx, &name);
    let first = ctx
        .controller
        .create_volume_opt(&req, ctx.call_opt())
        .context("first CreateVolume failed")?;
    cleanup.volume_created(first.get_volume().get_volume_id());
    let second = ctx
        .controller
        .create_volume_opt(&req, ctx.call_opt())
        .context("second CreateVolume with the same name failed")?;
    cleanup.volume_created(second.get_volume().get_volume_id());
    ensure!(
        first.get_volume().get_volume_id() == second.get_volume().get_volume_id(),
        "CreateVolume of the same name returned different IDs {} and {}",
        first.get_volume().get_volume_id(),
        second.get_volume().get_volume_id(),
    );
    ensure!(
        first.get_volume().get_capacity_bytes() == second.get_volume().get_capacity_bytes(),
        "CreateVolume of the same name returned different capacities"
    );
    delete_volume(ctx, cleanup, first.get_volume().get_volume_id())
}

fn create_volume_different_capacity(
    ctx: &SanityContext<'_>,
    cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let name = ctx.unique_volume_name("capacity");
    let mut req = create_volume_request(ctx, &name);
    let size = ctx.config.test_volume_size.max(1);
    req.mut_capacity_range().set_required_bytes(size);
    req.mut_capacity_range().set_limit_bytes(size);
    let first = ctx
        .controller
        .create_volume_opt(&req, ctx.call_opt())
        .context("first CreateVolume failed")?;
    cleanup.volume_created(first.get_volume().get_volume_id());

    let bigger = size.saturating_mul(2);
    req.mut_capacity_range().set_required_bytes(bigger);
    req.mut_capacity_range().set_limit_bytes(bigger);
    let res = ctx.controller.create_volume_opt(&req, ctx.call_opt());
    if let Ok(ref r) = res {
        cleanup.volume_created(r.get_volume().get_volume_id());
    }
    expect_status(res, RpcStatusCode::ALREADY_EXISTS)
}

fn delete_volume_missing_id(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    expect_status(
        ctx.controller
            .delete_volume_opt(&DeleteVolumeRequest::new(), ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn delete_volume_invalid_id(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = DeleteVolumeRequest::new();
    req.set_volume_id("reallyfakevolumeid".to_owned());
    let _ = ctx
        .controller
        .delete_volume_opt(&req, ctx.call_opt())
        .context("DeleteVolume of a non-existent volume must succeed")?;
    Ok(())
}

fn delete_volume_values(ctx: &SanityContext<'_>, cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let vol = create_volume(ctx, cleanup, "delete")?;
    delete_volume(ctx, cleanup, vol.get_volume_id())?;
    // A second delete of the same volume is a no-op
    delete_volume(ctx, cleanup, vol.get_volume_id())
}

fn validate_missing_id(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = ValidateVolumeCapabilitiesRequest::new();
    req.set_volume_capabilities(RepeatedField::from_vec(vec![mount_capability()]));
    expect_status(
        ctx.controller
            .validate_volume_capabilities_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn validate_missing_capabilities(
    ctx: &SanityContext<'_>,
    cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let vol = create_volume(ctx, cleanup, "validate-no-caps")?;
    let mut req = ValidateVolumeCapabilitiesRequest::new();
    req.set_volume_id(vol.get_volume_id().to_owned());
    expect_status(
        ctx.controller
            .validate_volume_capabilities_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )?;
    delete_volume(ctx, cleanup, vol.get_volume_id())
}

fn validate_values(ctx: &SanityContext<'_>, cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let vol = create_volume(ctx, cleanup, "validate")?;
    let mut req = ValidateVolumeCapabilitiesRequest::new();
    req.set_volume_id(vol.get_volume_id().to_owned());
    req.set_volume_context(vol.get_volume_context().clone());
    req.set_volume_capabilities(RepeatedField::from_vec(vec![mount_capability()]));
    req.set_parameters(ctx.config.test_volume_parameters.clone());
    let r = ctx
        .controller
        .validate_volume_capabilities_opt(&req, ctx.call_opt())
        .context("ValidateVolumeCapabilities failed")?;
    ensure!(
        r.has_confirmed(),
        "mount capability not confirmed: {}",
        r.get_message()
    );
    delete_volume(ctx, cleanup, vol.get_volume_id())
}

fn validate_not_found(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut req = ValidateVolumeCapabilitiesRequest::new();
    req.set_volume_id("some-vol-id".to_owned());
    req.set_volume_capabilities(RepeatedField::from_vec(vec![mount_capability()]));
    expect_status(
        ctx.controller
            .validate_volume_capabilities_opt(&req, ctx.call_opt()),
        RpcStatusCode::NOT_FOUND,
    )
}

fn list_volumes_values(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let r = ctx
        .controller
        .list_volumes_opt(&ListVolumesRequest::new(), ctx.call_opt())
        .context("ListVolumes failed")?;
    for entry in r.get_entries() {
        ensure!(entry.has_volume(), "ListVolumes entry without volume");
        ensure!(
            !entry.get_volume().get_volume_id().is_empty(),
            "ListVolumes entry with an empty volume ID"
        );
    }
    Ok(())
}

fn list_volumes_invalid_token(
    ctx: &SanityContext<'_>,
    _cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let mut req = ListVolumesRequest::new();
    req.set_starting_token("invalid-token".to_owned());
    expect_status(
        ctx.controller.list_volumes_opt(&req, ctx.call_opt()),
        RpcStatusCode::ABORTED,
    )
}

fn list_volumes_pagination(ctx: &SanityContext<'_>, cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let mut created = Vec::new();
    for idx in 0..3 {
        let vol = create_volume(ctx, cleanup, &format!("page{}", idx))?;
        created.push(vol.get_volume_id().to_owned());
    }

    let mut listed = Vec::new();
    let mut req = ListVolumesRequest::new();
    req.set_max_entries(2);
    loop {
        let r = ctx
            .controller
            .list_volumes_opt(&req, ctx.call_opt())
            .context("ListVolumes failed")?;
        ensure!(
            r.get_entries().len() <= 2,
            "ListVolumes returned {} entries, more than max entries 2",
            r.get_entries().len()
        );
        listed.extend(
            r.get_entries()
                .iter()
                .map(|e| e.get_volume().get_volume_id().to_owned()),
        );
        if r.get_next_token().is_empty() {
            break;
        }
        req.set_starting_token(r.get_next_token().to_owned());
    }
    for vol_id in &created {
        ensure!(
            listed.contains(vol_id),
            "volume {} missing from ListVolumes",
            vol_id
        );
    }
    for vol_id in &created {
        delete_volume(ctx, cleanup, vol_id)?;
    }
    Ok(())
}

fn controller_publish_missing_id(
    ctx: &SanityContext<'_>,
    _cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let mut req = ControllerPublishVolumeRequest::new();
    req.set_node_id("fakeNodeID".to_owned());
    req.set_volume_capability(mount_capability());
    expect_status(
        ctx.controller
            .controller_publish_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}

fn controller_unpublish_missing_id(
    ctx: &SanityContext<'_>,
    _cleanup: &mut Cleanup,
) -> anyhow::Result<()> {
    let mut req = ControllerUnpublishVolumeRequest::new();
    req.set_node_id("fakeNodeID".to_owned());
    expect_status(
        ctx.controller
            .controller_unpublish_volume_opt(&req, ctx.call_opt()),
        RpcStatusCode::INVALID_ARGUMENT,
    )
}
