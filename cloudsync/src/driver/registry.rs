//! Driver lookup and the static parent -> child kind graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use super::error::RegistryError;
use super::onprem::OnPremDriver;
use super::Driver;
use crate::model::{ProviderKind, ResourceKind};

/// Directed acyclic graph of parent kind -> child kinds.
#[derive(Debug, Clone, Default)]
pub struct KindGraph {
    children: BTreeMap<ResourceKind, Vec<ResourceKind>>,
}

impl KindGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// The graph every standard deployment uses.
    pub fn standard() -> Self {
        let mut graph = Self::new();
        for kind in ResourceKind::ALL {
            for child in kind.default_children() {
                // The built-in table is acyclic.
                let _ = graph.add_edge(*kind, *child);
            }
        }
        graph
    }

    pub fn add_edge(
        &mut self,
        parent: ResourceKind,
        child: ResourceKind,
    ) -> Result<(), RegistryError> {
        if parent == child || self.reaches(child, parent) {
            return Err(RegistryError::Cycle { parent, child });
        }
        let entry = self.children.entry(parent).or_default();
        if !entry.contains(&child) {
            entry.push(child);
        }
        Ok(())
    }

    fn reaches(&self, from: ResourceKind, to: ResourceKind) -> bool {
        let mut stack = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(k) = stack.pop() {
            if k == to {
                return true;
            }
            if seen.insert(k) {
                stack.extend(self.children_of(k).iter().copied());
            }
        }
        false
    }

    pub fn children_of(&self, kind: ResourceKind) -> &[ResourceKind] {
        self.children.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn parents_of(&self, kind: ResourceKind) -> Vec<ResourceKind> {
        self.children
            .iter()
            .filter(|(_, cs)| cs.contains(&kind))
            .map(|(p, _)| *p)
            .collect()
    }

    /// Length of the longest parent chain above `kind`. Roots are depth 0,
    /// so a child's depth is always greater than each of its parents'.
    pub fn depth(&self, kind: ResourceKind) -> u32 {
        self.parents_of(kind)
            .into_iter()
            .map(|p| self.depth(p) + 1)
            .max()
            .unwrap_or(0)
    }
}

/// Maps `(provider kind, resource kind)` to a driver.
pub struct DriverRegistry {
    drivers: HashMap<(ProviderKind, ResourceKind), Arc<dyn Driver>>,
    on_prem: Arc<dyn Driver>,
    graph: KindGraph,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::with_graph(KindGraph::standard())
    }

    pub fn with_graph(graph: KindGraph) -> Self {
        Self {
            drivers: HashMap::new(),
            on_prem: Arc::new(OnPremDriver),
            graph,
        }
    }

    pub fn register(&mut self, provider: ProviderKind, kind: ResourceKind, driver: Arc<dyn Driver>) {
        debug!(provider = %provider, kind = %kind, driver = driver.name(), "Registered driver");
        self.drivers.insert((provider, kind), driver);
    }

    pub fn register_all(
        &mut self,
        provider: ProviderKind,
        kinds: &[ResourceKind],
        driver: Arc<dyn Driver>,
    ) {
        for kind in kinds {
            self.register(provider, *kind, Arc::clone(&driver));
        }
    }

    /// Declare that `child` is reconciled through a cascade from `parent`.
    pub fn add_child_kind(
        &mut self,
        parent: ResourceKind,
        child: ResourceKind,
    ) -> Result<(), RegistryError> {
        self.graph.add_edge(parent, child)
    }

    pub fn lookup(
        &self,
        provider: ProviderKind,
        kind: ResourceKind,
    ) -> Result<Arc<dyn Driver>, RegistryError> {
        if provider.is_on_premise() {
            return Ok(Arc::clone(&self.on_prem));
        }
        self.drivers
            .get(&(provider, kind))
            .cloned()
            .ok_or(RegistryError::NoDriver { provider, kind })
    }

    /// Kinds with a registered driver for `provider`, in a stable order.
    pub fn kinds_for(&self, provider: ProviderKind) -> Vec<ResourceKind> {
        let mut kinds: Vec<_> = self
            .drivers
            .keys()
            .filter(|(p, _)| *p == provider)
            .map(|(_, k)| *k)
            .collect();
        kinds.sort();
        kinds
    }

    pub fn graph(&self) -> &KindGraph {
        &self.graph
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryDriver;
    use crate::driver::MemoryCloud;

    #[test]
    fn test_standard_graph_depths() {
        let g = KindGraph::standard();
        assert_eq!(g.depth(ResourceKind::AccessGroup), 0);
        assert_eq!(g.depth(ResourceKind::AccessGroupRule), 1);
        assert_eq!(g.depth(ResourceKind::WafRuleGroup), 1);
        assert_eq!(
            g.children_of(ResourceKind::InterVpcNetwork),
            &[
                ResourceKind::InterVpcNetworkVpc,
                ResourceKind::InterVpcNetworkRouteSet
            ]
        );
    }

    #[test]
    fn test_cycle_rejected() {
        let mut g = KindGraph::new();
        g.add_edge(ResourceKind::App, ResourceKind::AppEnvironment).unwrap();
        g.add_edge(ResourceKind::AppEnvironment, ResourceKind::Disk).unwrap();
        assert_eq!(
            g.add_edge(ResourceKind::Disk, ResourceKind::App),
            Err(RegistryError::Cycle {
                parent: ResourceKind::Disk,
                child: ResourceKind::App
            })
        );
        assert!(g.add_edge(ResourceKind::Disk, ResourceKind::Disk).is_err());
        assert_eq!(g.depth(ResourceKind::Disk), 2);
    }

    #[test]
    fn test_lookup() {
        let mut reg = DriverRegistry::new();
        let cloud = Arc::new(MemoryCloud::new());
        reg.register_all(
            ProviderKind::Aws,
            &[ResourceKind::Disk, ResourceKind::AccessGroup],
            Arc::new(MemoryDriver::new(cloud)),
        );
        assert!(reg.lookup(ProviderKind::Aws, ResourceKind::Disk).is_ok());
        assert!(matches!(
            reg.lookup(ProviderKind::Aliyun, ResourceKind::Disk),
            Err(RegistryError::NoDriver { .. })
        ));
        let onprem = reg.lookup(ProviderKind::OnPremise, ResourceKind::Guest).unwrap();
        assert_eq!(onprem.name(), "on_premise");
        assert_eq!(
            reg.kinds_for(ProviderKind::Aws),
            vec![ResourceKind::AccessGroup, ResourceKind::Disk]
        );
    }
}
