//! Resource kinds mirrored by the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Where a kind sits relative to its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scoping {
    /// One set per provider (CDN domains, inter-VPC networks, global VPCs).
    Provider,
    /// One set per provider and region.
    Region,
    /// Owned by a parent resource and only reconciled through a cascade.
    Parent,
}

/// Every resource kind the engine knows how to mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    AccessGroup,
    AccessGroupRule,
    App,
    AppEnvironment,
    BackupStorage,
    CdnDomain,
    CloudproviderQuota,
    DbInstance,
    DbInstanceParameter,
    DbInstanceSecgroup,
    Disk,
    ElasticCache,
    ElasticCacheSecgroup,
    GlobalVpc,
    Guest,
    GuestNetworkSecgroup,
    Host,
    InterVpcNetwork,
    InterVpcNetworkVpc,
    InterVpcNetworkRouteSet,
    Ipv6Gateway,
    LoadbalancerAcl,
    LoadbalancerCertificate,
    LoadbalancerCluster,
    LoadbalancerListener,
    ModelartsPoolSku,
    ProjectMapping,
    SecurityGroup,
    ServerSku,
    SnapshotPolicy,
    SslCertificate,
    StorageCache,
    Storage,
    Tablestore,
    WafInstance,
    WafIpSet,
    WafRegexSet,
    WafRuleGroup,
    WafRule,
}

impl ResourceKind {
    pub const ALL: &'static [ResourceKind] = &[
        ResourceKind::AccessGroup,
        ResourceKind::AccessGroupRule,
        ResourceKind::App,
        ResourceKind::AppEnvironment,
        ResourceKind::BackupStorage,
        ResourceKind::CdnDomain,
        ResourceKind::CloudproviderQuota,
        ResourceKind::DbInstance,
        ResourceKind::DbInstanceParameter,
        ResourceKind::DbInstanceSecgroup,
        ResourceKind::Disk,
        ResourceKind::ElasticCache,
        ResourceKind::ElasticCacheSecgroup,
        ResourceKind::GlobalVpc,
        ResourceKind::Guest,
        ResourceKind::GuestNetworkSecgroup,
        ResourceKind::Host,
        ResourceKind::InterVpcNetwork,
        ResourceKind::InterVpcNetworkVpc,
        ResourceKind::InterVpcNetworkRouteSet,
        ResourceKind::Ipv6Gateway,
        ResourceKind::LoadbalancerAcl,
        ResourceKind::LoadbalancerCertificate,
        ResourceKind::LoadbalancerCluster,
        ResourceKind::LoadbalancerListener,
        ResourceKind::ModelartsPoolSku,
        ResourceKind::ProjectMapping,
        ResourceKind::SecurityGroup,
        ResourceKind::ServerSku,
        ResourceKind::SnapshotPolicy,
        ResourceKind::SslCertificate,
        ResourceKind::StorageCache,
        ResourceKind::Storage,
        ResourceKind::Tablestore,
        ResourceKind::WafInstance,
        ResourceKind::WafIpSet,
        ResourceKind::WafRegexSet,
        ResourceKind::WafRuleGroup,
        ResourceKind::WafRule,
    ];

    /// Singular snake_case keyword, also used for row locks.
    pub fn keyword(self) -> &'static str {
        match self {
            ResourceKind::AccessGroup => "access_group",
            ResourceKind::AccessGroupRule => "access_group_rule",
            ResourceKind::App => "app",
            ResourceKind::AppEnvironment => "app_environment",
            ResourceKind::BackupStorage => "backup_storage",
            ResourceKind::CdnDomain => "cdn_domain",
            ResourceKind::CloudproviderQuota => "cloudprovider_quota",
            ResourceKind::DbInstance => "dbinstance",
            ResourceKind::DbInstanceParameter => "dbinstance_parameter",
            ResourceKind::DbInstanceSecgroup => "dbinstance_secgroup",
            ResourceKind::Disk => "disk",
            ResourceKind::ElasticCache => "elasticcache",
            ResourceKind::ElasticCacheSecgroup => "elasticcache_secgroup",
            ResourceKind::GlobalVpc => "globalvpc",
            ResourceKind::Guest => "guest",
            ResourceKind::GuestNetworkSecgroup => "guest_network_secgroup",
            ResourceKind::Host => "host",
            ResourceKind::InterVpcNetwork => "inter_vpc_network",
            ResourceKind::InterVpcNetworkVpc => "inter_vpc_network_vpc",
            ResourceKind::InterVpcNetworkRouteSet => "inter_vpc_network_route_set",
            ResourceKind::Ipv6Gateway => "ipv6_gateway",
            ResourceKind::LoadbalancerAcl => "loadbalancer_acl",
            ResourceKind::LoadbalancerCertificate => "loadbalancer_certificate",
            ResourceKind::LoadbalancerCluster => "loadbalancer_cluster",
            ResourceKind::LoadbalancerListener => "loadbalancer_listener",
            ResourceKind::ModelartsPoolSku => "modelarts_pool_sku",
            ResourceKind::ProjectMapping => "project_mapping",
            ResourceKind::SecurityGroup => "secgroup",
            ResourceKind::ServerSku => "server_sku",
            ResourceKind::SnapshotPolicy => "snapshot_policy",
            ResourceKind::SslCertificate => "ssl_certificate",
            ResourceKind::StorageCache => "storage_cache",
            ResourceKind::Storage => "storage",
            ResourceKind::Tablestore => "tablestore",
            ResourceKind::WafInstance => "waf_instance",
            ResourceKind::WafIpSet => "waf_ip_set",
            ResourceKind::WafRegexSet => "waf_regex_set",
            ResourceKind::WafRuleGroup => "waf_rule_group",
            ResourceKind::WafRule => "waf_rule",
        }
    }

    /// Lock class for scope locks: the plural noun, or a historical short name.
    pub fn lock_class(self) -> &'static str {
        match self {
            ResourceKind::AccessGroup => "access_groups",
            ResourceKind::AccessGroupRule => "access_group_rules",
            ResourceKind::App => "apps",
            ResourceKind::AppEnvironment => "app_environments",
            ResourceKind::BackupStorage => "backup_storages",
            ResourceKind::CdnDomain => "cdn_domains",
            ResourceKind::CloudproviderQuota => "quotas",
            ResourceKind::DbInstance => "dbinstances",
            ResourceKind::DbInstanceParameter => "dbinstance-parameters",
            ResourceKind::DbInstanceSecgroup => "dbinstance-secgroups",
            ResourceKind::Disk => "disks",
            ResourceKind::ElasticCache => "elasticcaches",
            ResourceKind::ElasticCacheSecgroup => "elasticcache-secgroups",
            ResourceKind::GlobalVpc => "globalvpcs",
            ResourceKind::Guest => "guests",
            ResourceKind::GuestNetworkSecgroup => "guest-network-secgroups",
            ResourceKind::Host => "hosts",
            ResourceKind::InterVpcNetwork => "inter_vpc_networks",
            ResourceKind::InterVpcNetworkVpc => "inter_vpc_network_vpcs",
            ResourceKind::InterVpcNetworkRouteSet => "inter_vpc_network_route_sets",
            ResourceKind::Ipv6Gateway => "ipv6_gateways",
            ResourceKind::LoadbalancerAcl => "loadbalancer_acls",
            ResourceKind::LoadbalancerCertificate => "loadbalancer_certificates",
            ResourceKind::LoadbalancerCluster => "loadbalancer_clusters",
            ResourceKind::LoadbalancerListener => "loadbalancer_listeners",
            ResourceKind::ModelartsPoolSku => "modelarts_pool_skus",
            ResourceKind::ProjectMapping => "project_mappings",
            ResourceKind::SecurityGroup => "secgroups",
            ResourceKind::ServerSku => "server_skus",
            ResourceKind::SnapshotPolicy => "snapshot_policies",
            ResourceKind::SslCertificate => "ssl_certificates",
            ResourceKind::StorageCache => "storage_caches",
            ResourceKind::Storage => "storages",
            ResourceKind::Tablestore => "tablestores",
            ResourceKind::WafInstance => "waf_instances",
            ResourceKind::WafIpSet => "waf_ip_sets",
            ResourceKind::WafRegexSet => "waf_regex_sets",
            ResourceKind::WafRuleGroup => "waf_rule_groups",
            ResourceKind::WafRule => "waf_rules",
        }
    }

    /// Prefix of the well-known task names (`WafDeleteTask`, `CDNDomainDeleteTask`).
    pub fn task_prefix(self) -> &'static str {
        match self {
            ResourceKind::AccessGroup => "AccessGroup",
            ResourceKind::AccessGroupRule => "AccessGroupRule",
            ResourceKind::App => "App",
            ResourceKind::AppEnvironment => "AppEnvironment",
            ResourceKind::BackupStorage => "BackupStorage",
            ResourceKind::CdnDomain => "CDNDomain",
            ResourceKind::CloudproviderQuota => "CloudproviderQuota",
            ResourceKind::DbInstance => "DBInstance",
            ResourceKind::DbInstanceParameter => "DBInstanceParameter",
            ResourceKind::DbInstanceSecgroup => "DBInstanceSecgroup",
            ResourceKind::Disk => "Disk",
            ResourceKind::ElasticCache => "ElasticCache",
            ResourceKind::ElasticCacheSecgroup => "ElasticCacheSecgroup",
            ResourceKind::GlobalVpc => "GlobalVpc",
            ResourceKind::Guest => "Guest",
            ResourceKind::GuestNetworkSecgroup => "GuestNetworkSecgroup",
            ResourceKind::Host => "Host",
            ResourceKind::InterVpcNetwork => "InterVpcNetwork",
            ResourceKind::InterVpcNetworkVpc => "InterVpcNetworkVpc",
            ResourceKind::InterVpcNetworkRouteSet => "InterVpcNetworkRouteSet",
            ResourceKind::Ipv6Gateway => "IPv6Gateway",
            ResourceKind::LoadbalancerAcl => "LoadbalancerAcl",
            ResourceKind::LoadbalancerCertificate => "LoadbalancerCertificate",
            ResourceKind::LoadbalancerCluster => "LoadbalancerCluster",
            ResourceKind::LoadbalancerListener => "LoadbalancerListener",
            ResourceKind::ModelartsPoolSku => "ModelartsPoolSku",
            ResourceKind::ProjectMapping => "ProjectMapping",
            ResourceKind::SecurityGroup => "SecurityGroup",
            ResourceKind::ServerSku => "ServerSku",
            ResourceKind::SnapshotPolicy => "SnapshotPolicy",
            ResourceKind::SslCertificate => "SSLCertificate",
            ResourceKind::StorageCache => "StorageCache",
            ResourceKind::Storage => "Storage",
            ResourceKind::Tablestore => "Tablestore",
            ResourceKind::WafInstance => "Waf",
            ResourceKind::WafIpSet => "WafIPSet",
            ResourceKind::WafRegexSet => "WafRegexSet",
            ResourceKind::WafRuleGroup => "WafRuleGroup",
            ResourceKind::WafRule => "WafRule",
        }
    }

    pub fn scoping(self) -> Scoping {
        match self {
            ResourceKind::BackupStorage
            | ResourceKind::CdnDomain
            | ResourceKind::GlobalVpc
            | ResourceKind::InterVpcNetwork
            | ResourceKind::ProjectMapping
            | ResourceKind::SslCertificate => Scoping::Provider,
            ResourceKind::AccessGroupRule
            | ResourceKind::AppEnvironment
            | ResourceKind::DbInstanceParameter
            | ResourceKind::DbInstanceSecgroup
            | ResourceKind::ElasticCacheSecgroup
            | ResourceKind::GuestNetworkSecgroup
            | ResourceKind::InterVpcNetworkVpc
            | ResourceKind::InterVpcNetworkRouteSet
            | ResourceKind::WafRule => Scoping::Parent,
            _ => Scoping::Region,
        }
    }

    /// Route-set-like children lock on `(parent class, parent id + "-records")`
    /// instead of `(child class, parent id)`.
    pub fn uses_records_lock(self) -> bool {
        matches!(self, ResourceKind::InterVpcNetworkRouteSet)
    }

    /// Children every standard deployment registers for this kind.
    pub fn default_children(self) -> &'static [ResourceKind] {
        match self {
            ResourceKind::AccessGroup => &[ResourceKind::AccessGroupRule],
            ResourceKind::App => &[ResourceKind::AppEnvironment],
            ResourceKind::DbInstance => &[
                ResourceKind::DbInstanceParameter,
                ResourceKind::DbInstanceSecgroup,
            ],
            ResourceKind::ElasticCache => &[ResourceKind::ElasticCacheSecgroup],
            ResourceKind::Guest => &[ResourceKind::GuestNetworkSecgroup],
            ResourceKind::InterVpcNetwork => &[
                ResourceKind::InterVpcNetworkVpc,
                ResourceKind::InterVpcNetworkRouteSet,
            ],
            ResourceKind::WafInstance => &[ResourceKind::WafRule, ResourceKind::WafRuleGroup],
            _ => &[],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Error)]
#[error("unknown resource kind: {0}")]
pub struct ParseKindError(pub String);

impl FromStr for ResourceKind {
    type Err = ParseKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.keyword() == s || k.lock_class() == s)
            .ok_or_else(|| ParseKindError(s.to_string()))
    }
}
