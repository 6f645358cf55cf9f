use sdn_policy_controller_core::IpMode;

/// Holds cluster metadata.
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Recorded as the owning controller on every object this controller writes.
    pub controller_name: String,

    /// The IP families carried by the cluster network.
    pub ip_mode: IpMode,
}
