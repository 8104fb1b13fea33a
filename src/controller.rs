//! The implementation for CSI controller service

use grpcio::*;
use log::{debug, error, info};
use protobuf::RepeatedField;
use std::sync::Arc;

use super::csi::*;
use super::csi_grpc::Controller;
use super::meta_data::{util, AddVolumeResult, LustreVolume, MetaData};

/// for `ControllerService` implmentation
#[derive(Clone)]
pub struct ControllerImpl {
    /// Controller capabilities
    caps: Vec<ControllerServiceCapability>,
    /// Volume meta data for controller
    meta_data: Arc<MetaData>,
}

impl ControllerImpl {
    /// Create `ControllerImpl`
    pub fn new(meta_data: Arc<MetaData>) -> Self {
        let cap_vec = vec![
            ControllerServiceCapability_RPC_Type::CREATE_DELETE_VOLUME,
            ControllerServiceCapability_RPC_Type::LIST_VOLUMES,
        ];
        let caps = cap_vec
            .into_iter()
            .map(|rpc_type| {
                let mut csc = ControllerServiceCapability::new();
                csc.mut_rpc().set_field_type(rpc_type);
                csc
            })
            .collect();

        Self { caps, meta_data }
    }

    /// Validate request with controller capabilities
    fn validate_request_capability(&self, rpc_type: ControllerServiceCapability_RPC_Type) -> bool {
        rpc_type == ControllerServiceCapability_RPC_Type::UNKNOWN
            || self
                .caps
                .iter()
                .any(|cap| cap.get_rpc().get_field_type() == rpc_type)
    }
}

impl Controller for ControllerImpl {
    fn create_volume(
        &mut self,
        ctx: RpcContext,
        req: CreateVolumeRequest,
        sink: UnarySink<CreateVolumeResponse>,
    ) {
        debug!("create_volume request: {:?}", req);

        let rpc_type = ControllerServiceCapability_RPC_Type::CREATE_DELETE_VOLUME;
        if !self.validate_request_capability(rpc_type) {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                format!("unsupported capability {:?}", rpc_type),
            );
        }

        let vol_name = req.get_name();
        if vol_name.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "name missing in request".to_owned(),
            );
        }

        let req_caps = req.get_volume_capabilities();
        if req_caps.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume capabilities missing in request".to_owned(),
            );
        }
        // Lustre is a file system, it can not be exposed as a raw block device
        if util::has_block_access(req_caps) {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "access type block not supported".to_owned(),
            );
        }

        let volume_size = req.get_capacity_range().get_required_bytes();
        if volume_size > util::MAX_VOLUME_STORAGE_CAPACITY {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::OUT_OF_RANGE,
                format!(
                    "requested size {} exceeds maximum allowed {}",
                    volume_size,
                    util::MAX_VOLUME_STORAGE_CAPACITY
                ),
            );
        }

        let vol = match LustreVolume::new(vol_name, req.get_parameters(), volume_size) {
            Ok(v) => v,
            Err(e) => {
                return util::fail(
                    &ctx,
                    sink,
                    RpcStatusCode::INVALID_ARGUMENT,
                    format!("{}", e),
                );
            }
        };

        match self.meta_data.add_volume(vol) {
            Ok(AddVolumeResult::Created(v)) | Ok(AddVolumeResult::Existed(v)) => {
                let r = util::build_create_volume_response(&req, &v);
                util::success(&ctx, sink, r)
            }
            Ok(AddVolumeResult::Conflict(pre_vol)) => util::fail(
                &ctx,
                sink,
                RpcStatusCode::ALREADY_EXISTS,
                format!(
                    "volume with the same name={} but with different size={} already exist",
                    vol_name, pre_vol.capacity_bytes,
                ),
            ),
            Err(e) => {
                error!("failed to add volume name={}, the error is: {:?}", vol_name, e);
                util::fail(&ctx, sink, RpcStatusCode::INTERNAL, format!("{}", e))
            }
        }
    }

    fn delete_volume(
        &mut self,
        ctx: RpcContext,
        req: DeleteVolumeRequest,
        sink: UnarySink<DeleteVolumeResponse>,
    ) {
        debug!("delete_volume request: {:?}", req);

        let vol_id = req.get_volume_id();
        if vol_id.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume ID missing in request".to_owned(),
            );
        }
        let rpc_type = ControllerServiceCapability_RPC_Type::CREATE_DELETE_VOLUME;
        if !self.validate_request_capability(rpc_type) {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                format!("invalid delete volume request: {:?}", req),
            );
        }

        match self.meta_data.delete_volume(vol_id) {
            Ok(Some(_)) => info!("successfully deleted volume ID={}", vol_id),
            // Deleting an unknown volume is a success per CSI
            Ok(None) => debug!("volume ID={} not found, nothing to delete", vol_id),
            Err(e) => {
                return util::fail(&ctx, sink, RpcStatusCode::INTERNAL, format!("{}", e));
            }
        }
        let r = DeleteVolumeResponse::new();
        util::success(&ctx, sink, r)
    }

    fn validate_volume_capabilities(
        &mut self,
        ctx: RpcContext,
        req: ValidateVolumeCapabilitiesRequest,
        sink: UnarySink<ValidateVolumeCapabilitiesResponse>,
    ) {
        debug!("validate_volume_capabilities request: {:?}", req);

        let vol_id = req.get_volume_id();
        if vol_id.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                "volume ID cannot be empty".to_owned(),
            );
        }
        let vol_caps = req.get_volume_capabilities();
        if vol_caps.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                format!("volume ID={} has no volume capabilities in request", vol_id),
            );
        }
        if let Err(e) = LustreVolume::parse_volume_id(vol_id) {
            return util::fail(&ctx, sink, RpcStatusCode::NOT_FOUND, format!("{}", e));
        }

        let mut r = ValidateVolumeCapabilitiesResponse::new();
        if util::has_block_access(vol_caps) {
            r.set_message("cannot have block access type for lustre volume".to_owned());
        } else {
            r.mut_confirmed()
                .set_volume_context(req.get_volume_context().clone());
            r.mut_confirmed()
                .set_volume_capabilities(RepeatedField::from_vec(vol_caps.to_vec()));
            r.mut_confirmed()
                .set_parameters(req.get_parameters().clone());
        }
        util::success(&ctx, sink, r)
    }

    fn list_volumes(
        &mut self,
        ctx: RpcContext,
        req: ListVolumesRequest,
        sink: UnarySink<ListVolumesResponse>,
    ) {
        debug!("list_volumes request: {:?}", req);

        let rpc_type = ControllerServiceCapability_RPC_Type::LIST_VOLUMES;
        if !self.validate_request_capability(rpc_type) {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::INVALID_ARGUMENT,
                format!("invalid list volume request: {:?}", req),
            );
        }

        let max_entries = match usize::try_from(req.get_max_entries()) {
            Ok(n) => n,
            Err(_) => {
                return util::fail(
                    &ctx,
                    sink,
                    RpcStatusCode::INVALID_ARGUMENT,
                    format!("invalid max entries={}", req.get_max_entries()),
                );
            }
        };
        let starting_token = req.get_starting_token();
        let starting_pos = if starting_token.is_empty() {
            0
        } else if let Ok(pos) = starting_token.parse::<usize>() {
            pos
        } else {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::ABORTED,
                format!("invalid starting position {}", starting_token),
            );
        };

        match self.meta_data.list_volumes(starting_pos, max_entries) {
            Ok((vols, next_token)) => {
                let r = util::build_list_volumes_response(&vols, next_token);
                util::success(&ctx, sink, r)
            }
            Err(e) => util::fail(&ctx, sink, RpcStatusCode::ABORTED, format!("{}", e)),
        }
    }

    fn controller_get_capabilities(
        &mut self,
        ctx: RpcContext,
        req: ControllerGetCapabilitiesRequest,
        sink: UnarySink<ControllerGetCapabilitiesResponse>,
    ) {
        debug!("controller_get_capabilities request: {:?}", req);

        let mut r = ControllerGetCapabilitiesResponse::new();
        r.set_capabilities(RepeatedField::from_vec(self.caps.clone()));
        util::success(&ctx, sink, r)
    }

    // RPCs without a matching capability keep the `UNIMPLEMENTED` trait defaults
}
