//! Azure managed lustre (amlfs) CSI driver and the sanity harness to check it

#![deny(
    // The following are allowed by default lints according to
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    anonymous_parameters,
    bare_trait_objects,
    missing_copy_implementations,
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_extern_crates,
    unused_import_braces,
    variant_size_differences
)]
#![warn(
    missing_docs,
    single_use_lifetimes,
    trivial_casts,
    unused_qualifications,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
#![allow(
    // Some explicitly allowed Clippy lints, must have clear reason to allow
    clippy::module_name_repetitions, // repeation of module name in a struct name is not big deal
    clippy::multiple_crate_versions, // multi-version dependency crates is not able to fix
    clippy::needless_pass_by_value, // gRPC handlers take requests and sinks by value
)]

// Ignore format and lint to generated code
#[rustfmt::skip]
#[allow(
    missing_debug_implementations,
    missing_copy_implementations,
    variant_size_differences,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
pub mod csi;
// Ignore format and lint to generated code
#[rustfmt::skip]
#[allow(
    missing_debug_implementations,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
pub mod csi_grpc;

mod controller;
pub mod driver;
mod identity;
pub mod meta_data;
pub mod mount;
mod node;
pub mod sanity;

pub use driver::{Driver, DriverOptions};
