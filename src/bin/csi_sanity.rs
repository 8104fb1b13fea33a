//! Run the CSI sanity suite against a running plugin

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

use amlfs_csi::sanity::{self, SanityConfig, SanityReport};
use anyhow::{anyhow, Context};
use clap::{App, Arg, ArgMatches};
use log::{debug, info};
use std::collections::HashMap;

/// Argument name of plugin end point
const END_POINT_ARG_NAME: &str = "csi.endpoint";
/// Argument name of target directory
const MOUNT_DIR_ARG_NAME: &str = "csi.mountdir";
/// Argument name of staging directory
const STAGING_DIR_ARG_NAME: &str = "csi.stagingdir";
/// Argument name of volume parameters
const VOLUME_PARAMETERS_ARG_NAME: &str = "csi.testvolumeparameters";
/// Argument name of volume size
const VOLUME_SIZE_ARG_NAME: &str = "csi.testvolumesize";
/// Default target directory
const DEFAULT_MOUNT_DIR: &str = "/tmp/csi-mount";
/// Default staging directory
const DEFAULT_STAGING_DIR: &str = "/tmp/csi-staging";

/// Parse command line arguments
fn parse_args() -> ArgMatches<'static> {
    App::new("csi-sanity")
        .about("CSI sanity suite")
        .arg(
            Arg::with_name(END_POINT_ARG_NAME)
                .long(END_POINT_ARG_NAME)
                .value_name("SOCKET_FILE")
                .takes_value(true)
                .required(true)
                .help("CSI end point of the plugin, of format unix:///path/to/csi.sock"),
        )
        .arg(
            Arg::with_name(MOUNT_DIR_ARG_NAME)
                .long(MOUNT_DIR_ARG_NAME)
                .value_name("DIR")
                .takes_value(true)
                .help(&format!(
                    "Directory to publish volumes under, default as {}",
                    DEFAULT_MOUNT_DIR,
                )),
        )
        .arg(
            Arg::with_name(STAGING_DIR_ARG_NAME)
                .long(STAGING_DIR_ARG_NAME)
                .value_name("DIR")
                .takes_value(true)
                .help(&format!(
                    "Directory to stage volumes under, default as {}",
                    DEFAULT_STAGING_DIR,
                )),
        )
        .arg(
            Arg::with_name(VOLUME_PARAMETERS_ARG_NAME)
                .long(VOLUME_PARAMETERS_ARG_NAME)
                .value_name("KEY=VALUE,KEY=VALUE")
                .takes_value(true)
                .help("Parameters passed to every CreateVolume"),
        )
        .arg(
            Arg::with_name(VOLUME_SIZE_ARG_NAME)
                .long(VOLUME_SIZE_ARG_NAME)
                .value_name("BYTES")
                .takes_value(true)
                .help(&format!(
                    "Size of volumes created by the suite, default as {}",
                    sanity::DEFAULT_TEST_VOLUME_SIZE,
                )),
        )
        .get_matches()
}

/// Parse `key=value,key=value` pairs
fn parse_parameters(s: &str) -> anyhow::Result<HashMap<String, String>> {
    s.split(',')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) if !k.is_empty() => Ok((k.to_owned(), v.to_owned())),
            _ => Err(anyhow!("invalid volume parameter {}, should be key=value", kv)),
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = parse_args();
    let end_point = matches
        .value_of(END_POINT_ARG_NAME)
        .ok_or_else(|| anyhow!("{} is required", END_POINT_ARG_NAME))?;
    let mut config = SanityConfig::new(
        end_point,
        matches.value_of(MOUNT_DIR_ARG_NAME).unwrap_or(DEFAULT_MOUNT_DIR),
        matches
            .value_of(STAGING_DIR_ARG_NAME)
            .unwrap_or(DEFAULT_STAGING_DIR),
    );
    if let Some(params) = matches.value_of(VOLUME_PARAMETERS_ARG_NAME) {
        config = config.with_volume_parameters(parse_parameters(params)?);
    }
    if let Some(size) = matches.value_of(VOLUME_SIZE_ARG_NAME) {
        let size = size
            .parse::<i64>()
            .context(format!("failed to parse {}={}", VOLUME_SIZE_ARG_NAME, size))?;
        config = config.with_volume_size(size);
    }
    debug!("sanity config: {:?}", config);

    let mut report = SanityReport::new();
    sanity::test(&mut report, &config);
    let (passed, failed, skipped) = report.summary();
    info!(
        "{} passed, {} failed, {} skipped",
        passed, failed, skipped
    );
    if !report.is_success() {
        for case in report.failures() {
            eprintln!("FAIL: {} {:?}", case.name, case.result);
        }
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_parameters() -> anyhow::Result<()> {
        let params = parse_parameters("mds-ip-address=127.0.0.1,fs-name=test")?;
        assert_eq!(params.len(), 2);
        assert_eq!(params.get("fs-name").map(String::as_str), Some("test"));
        assert!(parse_parameters("")?.is_empty());
        assert!(parse_parameters("novalue").is_err());
        assert!(parse_parameters("=x").is_err());
        Ok(())
    }
}
