//! CSI v1 messages generated from `proto/csi.proto` by build.rs

#![allow(
    dead_code,
    missing_docs,
    non_camel_case_types,
    non_snake_case,
    non_upper_case_globals,
    trivial_casts,
    unsafe_code,
    unused_imports,
    unused_qualifications,
    unused_results,
    variant_size_differences,
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]

include!(concat!(env!("OUT_DIR"), "/csi.rs"));
