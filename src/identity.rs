//! The implementation for CSI identity service

use grpcio::*;
use log::debug;
use protobuf::well_known_types::BoolValue;
use protobuf::RepeatedField;

use super::csi::*;
use super::csi_grpc::Identity;
use super::meta_data::util;

/// for `IdentityService` implementation
#[derive(Clone)]
pub struct IdentityImpl {
    /// Plugin name
    name: String,
    /// Plugin version
    version: String,
    /// Plugin capabilities
    caps: Vec<PluginCapability>,
}

impl IdentityImpl {
    /// Create `IdentityImpl`
    pub fn new(name: String, version: String) -> Self {
        let caps = vec![PluginCapability_Service_Type::CONTROLLER_SERVICE]
            .into_iter()
            .map(|service_type| {
                let mut pc = PluginCapability::new();
                pc.mut_service().set_field_type(service_type);
                pc
            })
            .collect();
        Self {
            name,
            version,
            caps,
        }
    }
}

impl Identity for IdentityImpl {
    fn get_plugin_info(
        &mut self,
        ctx: RpcContext,
        req: GetPluginInfoRequest,
        sink: UnarySink<GetPluginInfoResponse>,
    ) {
        debug!("get_plugin_info request: {:?}", req);

        if self.name.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::UNAVAILABLE,
                "driver name not configured".to_owned(),
            );
        }
        if self.version.is_empty() {
            return util::fail(
                &ctx,
                sink,
                RpcStatusCode::UNAVAILABLE,
                "driver is missing version".to_owned(),
            );
        }

        let mut r = GetPluginInfoResponse::new();
        r.set_name(self.name.clone());
        r.set_vendor_version(self.version.clone());
        util::success(&ctx, sink, r)
    }

    fn get_plugin_capabilities(
        &mut self,
        ctx: RpcContext,
        req: GetPluginCapabilitiesRequest,
        sink: UnarySink<GetPluginCapabilitiesResponse>,
    ) {
        debug!("get_plugin_capabilities request: {:?}", req);

        let mut r = GetPluginCapabilitiesResponse::new();
        r.set_capabilities(RepeatedField::from_vec(self.caps.clone()));
        util::success(&ctx, sink, r)
    }

    fn probe(&mut self, ctx: RpcContext, req: ProbeRequest, sink: UnarySink<ProbeResponse>) {
        debug!("probe request: {:?}", req);

        let mut ready = BoolValue::new();
        ready.set_value(true);
        let mut r = ProbeResponse::new();
        r.set_ready(ready);
        util::success(&ctx, sink, r)
    }
}
