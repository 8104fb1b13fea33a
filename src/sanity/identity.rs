//! Sanity cases of the identity service

use anyhow::{ensure, Context};

use super::super::csi::*;
use super::super::meta_data::util;
use super::cleanup::Cleanup;
use super::{Case, SanityContext};

/// The identity cases in execution order
pub(super) fn cases() -> Vec<Case> {
    vec![
        Case {
            name: "Identity GetPluginInfo returns a valid name and version",
            requires: None,
            uses_dirs: false,
            run: get_plugin_info,
        },
        Case {
            name: "Identity GetPluginCapabilities returns known capabilities",
            requires: None,
            uses_dirs: false,
            run: get_plugin_capabilities,
        },
        Case {
            name: "Identity Probe succeeds",
            requires: None,
            uses_dirs: false,
            run: probe,
        },
    ]
}

fn get_plugin_info(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let r = ctx
        .identity
        .get_plugin_info_opt(&GetPluginInfoRequest::new(), ctx.call_opt())
        .context("GetPluginInfo failed")?;
    let name = r.get_name();
    ensure!(!name.is_empty(), "plugin name is empty");
    ensure!(
        name.len() <= util::MAX_PLUGIN_NAME_LEN,
        "plugin name {} is longer than {} characters",
        name,
        util::MAX_PLUGIN_NAME_LEN,
    );
    ensure!(
        !r.get_vendor_version().is_empty(),
        "vendor version of plugin {} is empty",
        name
    );
    Ok(())
}

fn get_plugin_capabilities(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let r = ctx
        .identity
        .get_plugin_capabilities_opt(&GetPluginCapabilitiesRequest::new(), ctx.call_opt())
        .context("GetPluginCapabilities failed")?;
    for cap in r.get_capabilities() {
        if cap.has_service() {
            let service_type = cap.get_service().get_field_type();
            ensure!(
                service_type != PluginCapability_Service_Type::UNKNOWN,
                "unknown plugin service capability"
            );
        } else if cap.has_volume_expansion() {
            let expansion_type = cap.get_volume_expansion().get_field_type();
            ensure!(
                expansion_type != PluginCapability_VolumeExpansion_Type::UNKNOWN,
                "unknown plugin volume expansion capability"
            );
        } else {
            anyhow::bail!("plugin capability {:?} has no type", cap);
        }
    }
    Ok(())
}

fn probe(ctx: &SanityContext<'_>, _cleanup: &mut Cleanup) -> anyhow::Result<()> {
    let r = ctx
        .identity
        .probe_opt(&ProbeRequest::new(), ctx.call_opt())
        .context("Probe failed")?;
    if r.has_ready() {
        ensure!(r.get_ready().get_value(), "plugin reported not ready");
    }
    Ok(())
}
