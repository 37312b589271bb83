//! Well-known labels, annotations and object names shared by the agent and
//! the controller.

/// Label on IPAMBlocks naming their IPPool
pub const IPPOOL_NAME_LABEL: &str = "ippool-name";

/// Label on IPAMBlocks carrying the IPPool type
pub const IPPOOL_TYPE_LABEL: &str = "ippool-type";

/// Label carrying the stable hash of the IPPool CIDR
pub const IPPOOL_ID_LABEL: &str = "ippool-id";

/// Label marking an IPPool as a default pool
pub const IPPOOL_DEFAULT_LABEL: &str = "ippool-default";

/// Finalizer held by the controller on every IPPool
pub const IPPOOL_FINALIZER: &str = "network.qingcloud.com/ippool";

/// IPPool annotation recording the spec the controller last accepted
pub const IPPOOL_APPLIED_SPEC_ANNOTATION: &str = "network.qingcloud.com/applied-spec";

/// Pod annotation requesting a VxNet
pub const ANNOTATION_VXNET: &str = "network.qingcloud.com/vxnet";

/// Pod annotation written back with the NIC id
pub const ANNOTATION_NIC: &str = "network.qingcloud.com/nic";

/// Pod annotation requesting (and reporting) the pod IP
pub const ANNOTATION_IP: &str = "network.qingcloud.com/ip";

/// Pod annotation selecting `dedicated` or `shared` NIC mode
pub const ANNOTATION_NIC_TYPE: &str = "network.qingcloud.com/type";

/// Pod annotation restricting IPAM to named IPPools (comma separated)
pub const ANNOTATION_IPPOOL: &str = "network.qingcloud.com/ippool";

/// Pod annotation restricting IPAM to named blocks (comma separated)
pub const ANNOTATION_BLOCKS: &str = "network.qingcloud.com/blocks";

/// Node label carrying the physical host id
pub const NODE_HOSTMACHINE_LABEL: &str = "topology.kubernetes.io/hostmachine";

/// Namespace of the IPAM ConfigMap
pub const IPAM_CONFIG_NAMESPACE: &str = "kube-system";

/// Name of the IPAM ConfigMap
pub const IPAM_CONFIG_NAME: &str = "hostnic-ipam-config";

/// ConfigMap key holding the namespace to subnet map
pub const IPAM_CONFIG_KEY: &str = "ipam";

/// ConfigMap key switching namespace auto-assignment on or off
pub const IPAM_AUTO_ASSIGN_KEY: &str = "autoAssign";

/// Namespace entry holding the default subnets
pub const IPAM_DEFAULT_NAMESPACE: &str = "Default";
