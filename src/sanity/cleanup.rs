//! Undo what a sanity case left behind on the plugin

use log::{debug, warn};
use std::path::{Path, PathBuf};

use super::super::csi::*;
use super::SanityContext;

/// A resource created by a case
#[derive(Clone, Debug)]
enum Resource {
    /// A volume created by `CreateVolume`
    Volume(String),
    /// A volume staged by `NodeStageVolume`
    Staged(String, PathBuf),
    /// A volume published by `NodePublishVolume`
    Published(String, PathBuf),
}

/// The resources of one case, released in reverse order of creation
#[derive(Debug, Default)]
pub(super) struct Cleanup {
    /// Resources in creation order
    resources: Vec<Resource>,
}

impl Cleanup {
    /// Create an empty `Cleanup`
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Track a created volume
    pub(super) fn volume_created(&mut self, vol_id: &str) {
        self.resources.push(Resource::Volume(vol_id.to_owned()));
    }

    /// Track a staged volume
    pub(super) fn volume_staged(&mut self, vol_id: &str, staging_path: &Path) {
        self.resources
            .push(Resource::Staged(vol_id.to_owned(), staging_path.to_owned()));
    }

    /// Track a published volume
    pub(super) fn volume_published(&mut self, vol_id: &str, target_path: &Path) {
        self.resources
            .push(Resource::Published(vol_id.to_owned(), target_path.to_owned()));
    }

    /// Forget a volume after the case deleted it itself
    pub(super) fn volume_deleted(&mut self, vol_id: &str) {
        self.resources
            .retain(|r| !matches!(r, Resource::Volume(id) if id == vol_id));
    }

    /// Forget a staging after the case unstaged it itself
    pub(super) fn volume_unstaged(&mut self, vol_id: &str) {
        self.resources
            .retain(|r| !matches!(r, Resource::Staged(id, _) if id == vol_id));
    }

    /// Forget a publish after the case unpublished it itself
    pub(super) fn volume_unpublished(&mut self, vol_id: &str) {
        self.resources
            .retain(|r| !matches!(r, Resource::Published(id, _) if id == vol_id));
    }

    /// Release every tracked resource, errors are only logged
    pub(super) fn run(self, ctx: &SanityContext<'_>) {
        for resource in self.resources.into_iter().rev() {
            debug!("cleaning up {:?}", resource);
            let res = match resource {
                Resource::Published(ref vol_id, ref target_path) => {
                    let mut req = NodeUnpublishVolumeRequest::new();
                    req.set_volume_id(vol_id.clone());
                    req.set_target_path(target_path.display().to_string());
                    ctx.node
                        .node_unpublish_volume_opt(&req, ctx.call_opt())
                        .map(|_| ())
                }
                Resource::Staged(ref vol_id, ref staging_path) => {
                    let mut req = NodeUnstageVolumeRequest::new();
                    req.set_volume_id(vol_id.clone());
                    req.set_staging_target_path(staging_path.display().to_string());
                    ctx.node
                        .node_unstage_volume_opt(&req, ctx.call_opt())
                        .map(|_| ())
                }
                Resource::Volume(ref vol_id) => {
                    let mut req = DeleteVolumeRequest::new();
                    req.set_volume_id(vol_id.clone());
                    ctx.controller
                        .delete_volume_opt(&req, ctx.call_opt())
                        .map(|_| ())
                }
            };
            if let Err(e) = res {
                warn!("failed to clean up {:?}, the error is: {}", resource, e);
            }
        }
    }
}
