//! Azure managed lustre CSI `gRPC` service

#![deny(
    anonymous_parameters,
    bare_trait_objects,
    missing_docs,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces
)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use amlfs_csi::meta_data::util;
use amlfs_csi::{Driver, DriverOptions};
use anyhow::anyhow;
use clap::{App, Arg, ArgMatches};
use log::debug;

/// Argument name of end point
const END_POINT_ARG_NAME: &str = "endpoint";
/// Argument name of node ID
const NODE_ID_ARG_NAME: &str = "nodeid";
/// Argument name of driver name
const DRIVER_NAME_ARG_NAME: &str = "drivername";
/// Argument name of mock mount switch
const MOCK_MOUNT_ARG_NAME: &str = "enable-amlfs-mock-mount";

/// Parse command line arguments
fn parse_args() -> ArgMatches<'static> {
    App::new("amlfsplugin")
        .about("Azure Managed Lustre CSI driver")
        .version(util::CSI_PLUGIN_VERSION)
        .arg(
            Arg::with_name(END_POINT_ARG_NAME)
                .short("s")
                .long(END_POINT_ARG_NAME)
                .value_name("SOCKET_FILE")
                .takes_value(true)
                .help(&format!(
                    "Set the socket end point of CSI service, default as {}",
                    util::END_POINT,
                )),
        )
        .arg(
            Arg::with_name(NODE_ID_ARG_NAME)
                .short("n")
                .long(NODE_ID_ARG_NAME)
                .value_name("NODE ID")
                .takes_value(true)
                .required(true)
                .help(
                    "Set the name of the node, \
                        should be the kubernetes node name, \
                        required argument, no default value",
                ),
        )
        .arg(
            Arg::with_name(DRIVER_NAME_ARG_NAME)
                .short("d")
                .long(DRIVER_NAME_ARG_NAME)
                .value_name("DRIVER NAME")
                .takes_value(true)
                .help(&format!(
                    "Set the CSI driver name, default as {}",
                    util::CSI_PLUGIN_NAME,
                )),
        )
        .arg(
            Arg::with_name(MOCK_MOUNT_ARG_NAME)
                .long(MOCK_MOUNT_ARG_NAME)
                .help("Record mounts in memory instead of mounting lustre, for testing only"),
        )
        .get_matches()
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = parse_args();
    let end_point = match matches.value_of(END_POINT_ARG_NAME) {
        Some(s) => {
            if !s.starts_with(util::UNIX_SOCKET_PREFIX) {
                return Err(anyhow!(
                    "invalid socket end point: {}, should start with {}",
                    s,
                    util::UNIX_SOCKET_PREFIX,
                ));
            }
            s.to_owned()
        }
        None => util::END_POINT.to_owned(),
    };
    let options = DriverOptions {
        node_id: matches
            .value_of(NODE_ID_ARG_NAME)
            .map(ToOwned::to_owned)
            .unwrap_or_default(),
        driver_name: matches
            .value_of(DRIVER_NAME_ARG_NAME)
            .unwrap_or(util::CSI_PLUGIN_NAME)
            .to_owned(),
        enable_amlfs_mock_mount: matches.is_present(MOCK_MOUNT_ARG_NAME),
    };
    debug!(
        "{}={}, {}={}, {}={}, {}={}",
        END_POINT_ARG_NAME,
        end_point,
        NODE_ID_ARG_NAME,
        options.node_id,
        DRIVER_NAME_ARG_NAME,
        options.driver_name,
        MOCK_MOUNT_ARG_NAME,
        options.enable_amlfs_mock_mount,
    );

    Driver::new(&options).run(&end_point)
}
