//! The utilities of meta data management

use anyhow::{anyhow, Context};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::csi::*;
use super::mount::{FakeMounter, LustreMounter, Mounter};

/// Utility functions and const variables
pub mod util {
    use futures::prelude::*;
    use grpcio::{RpcContext, RpcStatus, RpcStatusCode, UnarySink};
    use log::error;
    use protobuf::RepeatedField;

    use super::super::csi::*;
    use super::LustreVolume;

    /// The default CSI plugin name
    pub const CSI_PLUGIN_NAME: &str = "amlfs.csi.azure.com";
    /// The CSI plugin version
    pub const CSI_PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");
    /// The socket file to communicate with K8S CSI sidecars
    pub const END_POINT: &str = "unix:///tmp/csi.sock";
    /// The prefix of unix socket end point
    pub const UNIX_SOCKET_PREFIX: &str = "unix://";
    /// Max storage capacity per volume,
    /// Default 100TB for a managed lustre file system
    pub const MAX_VOLUME_STORAGE_CAPACITY: i64 = 100 * 1024 * 1024 * 1024 * 1024;
    /// The key of MDS IP address in volume context
    pub const VOLUME_CONTEXT_MDS_IP_ADDRESS: &str = "mds-ip-address";
    /// The key of file system name in volume context
    pub const VOLUME_CONTEXT_FS_NAME: &str = "fs-name";
    /// The separator between fields of a volume ID
    pub const VOLUME_ID_SEPARATOR: char = '#';
    /// The file system type passed to mount
    pub const LUSTRE_FS_TYPE: &str = "lustre";
    /// The network type of lustre MGS NID
    pub const LUSTRE_NETWORK_TYPE: &str = "tcp";
    /// The max length of plugin name allowed by CSI
    pub const MAX_PLUGIN_NAME_LEN: usize = 63;

    /// Send successful `gRPC` response
    pub fn success<R>(ctx: &RpcContext, sink: UnarySink<R>, r: R) {
        let f = sink
            .success(r)
            .map_err(move |e| error!("failed to send response, the error is: {:?}", e))
            .map(|_| ());
        ctx.spawn(f)
    }

    /// Send failure `gRPC` response
    pub fn fail<R>(ctx: &RpcContext, sink: UnarySink<R>, rsc: RpcStatusCode, msg: String) {
        let rs = RpcStatus::with_message(rsc, msg);
        let f = sink
            .fail(rs)
            .map_err(move |e| error!("failed to send response, the error is: {:?}", e))
            .map(|_| ());
        ctx.spawn(f)
    }

    /// Build `CreateVolumeResponse`
    pub fn build_create_volume_response(
        req: &CreateVolumeRequest,
        vol: &LustreVolume,
    ) -> CreateVolumeResponse {
        let mut v = Volume::new();
        v.set_volume_id(vol.vol_id.clone());
        v.set_capacity_bytes(vol.capacity_bytes);
        v.set_volume_context(req.get_parameters().clone());
        let mut r = CreateVolumeResponse::new();
        r.set_volume(v);
        r
    }

    /// Build one `ListVolumesResponse` entry
    pub fn build_list_volumes_entry(vol: &LustreVolume) -> ListVolumesResponse_Entry {
        let mut entry = ListVolumesResponse_Entry::new();
        entry.mut_volume().set_volume_id(vol.vol_id.clone());
        entry.mut_volume().set_capacity_bytes(vol.capacity_bytes);
        entry.mut_volume().set_volume_context(vol.volume_context());
        entry
    }

    /// Build `ListVolumesResponse` from a page of volumes
    pub fn build_list_volumes_response(
        vols: &[LustreVolume],
        next_token: Option<usize>,
    ) -> ListVolumesResponse {
        let entries = vols.iter().map(build_list_volumes_entry).collect();
        let mut r = ListVolumesResponse::new();
        r.set_entries(RepeatedField::from_vec(entries));
        if let Some(token) = next_token {
            r.set_next_token(token.to_string());
        }
        r
    }

    /// Check whether any of the capabilities asks for block access
    pub fn has_block_access(caps: &[VolumeCapability]) -> bool {
        caps.iter().any(VolumeCapability::has_block)
    }

    /// Build the lustre mount source `<mds-ip>@tcp:/<fs-name>`
    pub fn lustre_source(mds_ip_address: &str, fs_name: &str) -> String {
        format!(
            "{}@{}:/{}",
            mds_ip_address, LUSTRE_NETWORK_TYPE, fs_name
        )
    }
}

/// A lustre volume provisioned on an existing managed lustre file system
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LustreVolume {
    /// Volume ID
    pub vol_id: String,
    /// Volume name
    pub vol_name: String,
    /// The IP address of lustre MDS
    pub mds_ip_address: String,
    /// The lustre file system name
    pub fs_name: String,
    /// Volume size in bytes
    pub capacity_bytes: i64,
}

impl LustreVolume {
    /// Create `LustreVolume` from the name and parameters of `CreateVolumeRequest`
    pub fn new(
        vol_name: &str,
        parameters: &HashMap<String, String>,
        capacity_bytes: i64,
    ) -> anyhow::Result<Self> {
        if vol_name.contains(util::VOLUME_ID_SEPARATOR) {
            return Err(anyhow!(
                "volume name={} must not contain {:?}",
                vol_name,
                util::VOLUME_ID_SEPARATOR,
            ));
        }
        let mds_ip_address = Self::context_value(parameters, util::VOLUME_CONTEXT_MDS_IP_ADDRESS)?;
        let fs_name = Self::context_value(parameters, util::VOLUME_CONTEXT_FS_NAME)?;
        let vol_id = [vol_name, mds_ip_address, fs_name].join(&util::VOLUME_ID_SEPARATOR.to_string());

        Ok(Self {
            vol_id,
            vol_name: vol_name.to_owned(),
            mds_ip_address: mds_ip_address.to_owned(),
            fs_name: fs_name.to_owned(),
            capacity_bytes,
        })
    }

    /// Parse a volume ID of the form `<name>#<mds-ip-address>#<fs-name>`
    pub fn parse_volume_id(vol_id: &str) -> anyhow::Result<Self> {
        let segments: Vec<&str> = vol_id.split(util::VOLUME_ID_SEPARATOR).collect();
        match segments.as_slice() {
            [vol_name, mds_ip_address, fs_name]
                if !vol_name.is_empty() && !mds_ip_address.is_empty() && !fs_name.is_empty() =>
            {
                Ok(Self {
                    vol_id: vol_id.to_owned(),
                    vol_name: (*vol_name).to_owned(),
                    mds_ip_address: (*mds_ip_address).to_owned(),
                    fs_name: (*fs_name).to_owned(),
                    capacity_bytes: 0,
                })
            }
            _ => Err(anyhow!("invalid volume ID={}", vol_id)),
        }
    }

    /// Resolve the lustre source of a volume, the volume context wins over the volume ID
    pub fn resolve_source(
        vol_id: &str,
        context: &HashMap<String, String>,
    ) -> anyhow::Result<String> {
        let mds_ip_address = context.get(util::VOLUME_CONTEXT_MDS_IP_ADDRESS);
        let fs_name = context.get(util::VOLUME_CONTEXT_FS_NAME);
        if let (Some(ip), Some(fs)) = (mds_ip_address, fs_name) {
            if !ip.is_empty() && !fs.is_empty() {
                return Ok(util::lustre_source(ip, fs));
            }
        }
        let vol = Self::parse_volume_id(vol_id).context(format!(
            "volume context of volume ID={} has no {} or {}",
            vol_id,
            util::VOLUME_CONTEXT_MDS_IP_ADDRESS,
            util::VOLUME_CONTEXT_FS_NAME,
        ))?;
        Ok(vol.source())
    }

    /// The lustre mount source of this volume
    pub fn source(&self) -> String {
        util::lustre_source(&self.mds_ip_address, &self.fs_name)
    }

    /// The volume context reported back to the CO
    pub fn volume_context(&self) -> HashMap<String, String> {
        let mut ctx = HashMap::new();
        ctx.insert(
            util::VOLUME_CONTEXT_MDS_IP_ADDRESS.to_owned(),
            self.mds_ip_address.clone(),
        );
        ctx.insert(util::VOLUME_CONTEXT_FS_NAME.to_owned(), self.fs_name.clone());
        ctx
    }

    /// Look up a required volume context value
    fn context_value<'a>(
        parameters: &'a HashMap<String, String>,
        key: &str,
    ) -> anyhow::Result<&'a str> {
        match parameters.get(key) {
            Some(v) if !v.is_empty() => Ok(v),
            _ => Err(anyhow!("{} must be provided in parameters", key)),
        }
    }
}

/// The outcome of adding a volume
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddVolumeResult {
    /// A new volume was recorded
    Created(LustreVolume),
    /// The same volume was recorded before
    Existed(LustreVolume),
    /// A volume with the same name but different attributes exists
    Conflict(LustreVolume),
}

/// The meta data shared by the controller and node services
pub struct MetaData {
    /// The plugin name
    driver_name: String,
    /// The node ID
    node_id: String,
    /// Volumes created by this plugin, keyed by volume name
    volumes: RwLock<HashMap<String, LustreVolume>>,
    /// The mounter to mount lustre and bind mount
    mounter: Arc<dyn Mounter>,
}

impl std::fmt::Debug for MetaData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaData")
            .field("driver_name", &self.driver_name)
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

impl MetaData {
    /// Create `MetaData`, use an in-memory mounter when mock mount is enabled
    pub fn new(driver_name: String, node_id: String, enable_mock_mount: bool) -> Self {
        let mounter: Arc<dyn Mounter> = if enable_mock_mount {
            info!("lustre mount is mocked on node ID={}", node_id);
            Arc::new(FakeMounter::new())
        } else {
            Arc::new(LustreMounter::new())
        };
        Self::with_mounter(driver_name, node_id, mounter)
    }

    /// Create `MetaData` with a given mounter
    pub fn with_mounter(driver_name: String, node_id: String, mounter: Arc<dyn Mounter>) -> Self {
        Self {
            driver_name,
            node_id,
            volumes: RwLock::new(HashMap::new()),
            mounter,
        }
    }

    /// The plugin name
    pub fn get_driver_name(&self) -> &str {
        &self.driver_name
    }

    /// The node ID
    pub fn get_node_id(&self) -> &str {
        &self.node_id
    }

    /// The mounter
    pub fn mounter(&self) -> &dyn Mounter {
        &*self.mounter
    }

    /// Record a volume, idempotent for the same name and capacity
    pub fn add_volume(&self, vol: LustreVolume) -> anyhow::Result<AddVolumeResult> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|e| anyhow!("volume table lock poisoned: {}", e))?;
        if let Some(pre_vol) = volumes.get(&vol.vol_name) {
            if *pre_vol == vol {
                debug!("volume name={} already exists", vol.vol_name);
                return Ok(AddVolumeResult::Existed(pre_vol.clone()));
            }
            return Ok(AddVolumeResult::Conflict(pre_vol.clone()));
        }
        let _ = volumes.insert(vol.vol_name.clone(), vol.clone());
        info!("volume ID={} created", vol.vol_id);
        Ok(AddVolumeResult::Created(vol))
    }

    /// Forget a volume, return the removed volume if any
    pub fn delete_volume(&self, vol_id: &str) -> anyhow::Result<Option<LustreVolume>> {
        let mut volumes = self
            .volumes
            .write()
            .map_err(|e| anyhow!("volume table lock poisoned: {}", e))?;
        let name = volumes
            .values()
            .find(|v| v.vol_id == vol_id)
            .map(|v| v.vol_name.clone());
        Ok(name.and_then(|n| volumes.remove(&n)))
    }

    /// List volumes ordered by ID, starting at `starting_token`
    pub fn list_volumes(
        &self,
        starting_token: usize,
        max_entries: usize,
    ) -> anyhow::Result<(Vec<LustreVolume>, Option<usize>)> {
        let volumes = self
            .volumes
            .read()
            .map_err(|e| anyhow!("volume table lock poisoned: {}", e))?;
        let mut all: Vec<LustreVolume> = volumes.values().cloned().collect();
        all.sort_by(|a, b| a.vol_id.cmp(&b.vol_id));
        if starting_token > all.len() {
            return Err(anyhow!(
                "starting token={} exceeds the number of volumes={}",
                starting_token,
                all.len(),
            ));
        }
        let rest = all.split_off(starting_token);
        if max_entries == 0 || rest.len() <= max_entries {
            return Ok((rest, None));
        }
        let page = rest.into_iter().take(max_entries).collect();
        Ok((page, Some(starting_token.saturating_add(max_entries))))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn lustre_parameters() -> HashMap<String, String> {
        let mut params = HashMap::new();
        params.insert(
            util::VOLUME_CONTEXT_MDS_IP_ADDRESS.to_owned(),
            "127.0.0.1".to_owned(),
        );
        params.insert(util::VOLUME_CONTEXT_FS_NAME.to_owned(), "test".to_owned());
        params
    }

    #[test]
    fn test_volume_id() -> anyhow::Result<()> {
        let vol = LustreVolume::new("vol1", &lustre_parameters(), 1024)?;
        assert_eq!(vol.vol_id, "vol1#127.0.0.1#test");
        assert_eq!(vol.source(), "127.0.0.1@tcp:/test");

        let parsed = LustreVolume::parse_volume_id(&vol.vol_id)?;
        assert_eq!(parsed.vol_name, "vol1");
        assert_eq!(parsed.mds_ip_address, "127.0.0.1");
        assert_eq!(parsed.fs_name, "test");

        assert!(LustreVolume::parse_volume_id("no-such-volume").is_err());
        assert!(LustreVolume::parse_volume_id("a##b").is_err());
        assert!(LustreVolume::new("bad#name", &lustre_parameters(), 0).is_err());
        assert!(LustreVolume::new("vol2", &HashMap::new(), 0).is_err());
        Ok(())
    }

    #[test]
    fn test_resolve_source() -> anyhow::Result<()> {
        let source = LustreVolume::resolve_source("whatever", &lustre_parameters())?;
        assert_eq!(source, "127.0.0.1@tcp:/test");
        let source = LustreVolume::resolve_source("vol#10.0.0.4#lustrefs", &HashMap::new())?;
        assert_eq!(source, "10.0.0.4@tcp:/lustrefs");
        assert!(LustreVolume::resolve_source("vol", &HashMap::new()).is_err());
        Ok(())
    }

    #[test]
    fn test_add_delete_list_volumes() -> anyhow::Result<()> {
        let md = MetaData::new("fake".to_owned(), "fakeNodeID".to_owned(), true);
        let params = lustre_parameters();

        let vol = LustreVolume::new("vol1", &params, 1024)?;
        assert!(matches!(md.add_volume(vol.clone())?, AddVolumeResult::Created(_)));
        assert!(matches!(md.add_volume(vol.clone())?, AddVolumeResult::Existed(_)));
        let bigger = LustreVolume::new("vol1", &params, 2048)?;
        assert!(matches!(md.add_volume(bigger)?, AddVolumeResult::Conflict(_)));

        for name in &["vol2", "vol3"] {
            let _ = md.add_volume(LustreVolume::new(name, &params, 0)?)?;
        }
        let (page, next) = md.list_volumes(0, 2)?;
        assert_eq!(page.len(), 2);
        assert_eq!(next, Some(2));
        let (page, next) = md.list_volumes(2, 2)?;
        assert_eq!(page.len(), 1);
        assert_eq!(next, None);
        assert!(md.list_volumes(4, 0).is_err());

        assert_eq!(md.delete_volume(&vol.vol_id)?, Some(vol.clone()));
        assert_eq!(md.delete_volume(&vol.vol_id)?, None);
        let (page, _) = md.list_volumes(0, 0)?;
        assert!(page.iter().all(|v| v.vol_id != vol.vol_id));
        Ok(())
    }
}
