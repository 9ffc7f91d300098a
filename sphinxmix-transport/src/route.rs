//! # Route Selection
//!
//! A route is the ordered list of mixes a packet traverses, destination last.
//! [`RandomRouteFactory`] draws a fresh route from the directory for every
//! message; [`CascadeRouteFactory`] always uses one fixed route.

use std::sync::{Arc, Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::packet::SphinxParams;
use crate::pki::MixPki;
use crate::sphinx::PathHop;
use crate::{MixError, NodeId, Result};

/// Ordered, non-empty list of hops, at most `max_hops` long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDescriptor {
    hops: Vec<NodeId>,
}

impl RouteDescriptor {
    /// Create a route, checking its length against `params`.
    pub fn new(hops: Vec<NodeId>, params: &SphinxParams) -> Result<Self> {
        if hops.is_empty() {
            return Err(MixError::InvalidRouteError("route cannot be empty".into()));
        }
        if hops.len() > params.max_hops {
            return Err(MixError::RouteTooLongError {
                hops: hops.len(),
                max: params.max_hops,
            });
        }
        Ok(Self { hops })
    }

    /// Hops in travel order.
    pub fn hops(&self) -> &[NodeId] {
        &self.hops
    }

    /// Entry mix.
    pub fn first_hop(&self) -> NodeId {
        self.hops[0]
    }

    /// Final mix.
    pub fn last_hop(&self) -> NodeId {
        self.hops[self.hops.len() - 1]
    }

    /// Number of hops.
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Always false; routes are never empty.
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// Look up each hop's public key.
    pub fn resolve(&self, pki: &dyn MixPki) -> Result<Vec<PathHop>> {
        self.hops
            .iter()
            .map(|id| {
                Ok(PathHop {
                    id: *id,
                    public_key: pki.get(id)?,
                })
            })
            .collect()
    }
}

/// Produces routes for outgoing messages.
pub trait RouteFactory: Send + Sync {
    /// Build a route ending at `destination`, or a route of any terminal mix
    /// when `destination` is `None`.
    fn build_route(&self, destination: Option<NodeId>) -> Result<RouteDescriptor>;
}

/// Random routes drawn without replacement from the directory.
pub struct RandomRouteFactory<R = StdRng> {
    params: SphinxParams,
    pki: Arc<dyn MixPki>,
    rng: Mutex<R>,
}

impl RandomRouteFactory<StdRng> {
    /// Factory seeded from the operating system.
    pub fn new(params: SphinxParams, pki: Arc<dyn MixPki>) -> Self {
        Self::with_rng(params, pki, StdRng::from_entropy())
    }
}

impl<R: RngCore + Send> RandomRouteFactory<R> {
    /// Factory drawing from `rng`.
    pub fn with_rng(params: SphinxParams, pki: Arc<dyn MixPki>, rng: R) -> Self {
        Self {
            params,
            pki,
            rng: Mutex::new(rng),
        }
    }
}

impl<R: RngCore + Send> RouteFactory for RandomRouteFactory<R> {
    fn build_route(&self, destination: Option<NodeId>) -> Result<RouteDescriptor> {
        self.params.validate()?;
        let needed = match destination {
            Some(_) => self.params.max_hops - 1,
            None => self.params.max_hops,
        };

        let candidates: Vec<NodeId> = self
            .pki
            .identities()
            .into_iter()
            .filter(|id| Some(*id) != destination)
            .collect();
        if candidates.len() < needed {
            return Err(MixError::InsufficientRoutePoolError {
                needed,
                available: candidates.len(),
            });
        }

        // Sorting on independent random keys gives a uniform permutation.
        let mut keyed: Vec<(u64, NodeId)> = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            candidates.into_iter().map(|id| (rng.gen::<u64>(), id)).collect()
        };
        keyed.sort_unstable_by_key(|(key, _)| *key);

        let mut hops: Vec<NodeId> = keyed.into_iter().take(needed).map(|(_, id)| id).collect();
        hops.extend(destination);
        RouteDescriptor::new(hops, &self.params)
    }
}

/// A fixed route shared by every message.
#[derive(Debug, Clone)]
pub struct CascadeRouteFactory {
    route: RouteDescriptor,
}

impl CascadeRouteFactory {
    /// Use `route` for every message.
    pub fn new(route: RouteDescriptor) -> Self {
        Self { route }
    }
}

impl RouteFactory for CascadeRouteFactory {
    fn build_route(&self, destination: Option<NodeId>) -> Result<RouteDescriptor> {
        match destination {
            Some(dest) if dest != self.route.last_hop() => Err(MixError::InvalidRouteError(format!(
                "cascade ends at {}, not {}",
                self.route.last_hop(),
                dest
            ))),
            _ => Ok(self.route.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pki::{MemoryPki, NodeAddr};
    use sphinxmix_crypto::KeyPair;
    use std::collections::HashSet;

    fn directory(n: usize) -> (Arc<MemoryPki>, Vec<NodeId>) {
        let pki = Arc::new(MemoryPki::new());
        let mut rng = rand::thread_rng();
        let mut ids = Vec::new();
        for i in 0..n {
            let id = NodeId::random_mix(&mut rng);
            let key = *KeyPair::generate(&mut rng).public_key();
            pki.set(id, key, NodeAddr::new("memory", format!("mix-{}", i))).unwrap();
            ids.push(id);
        }
        (pki, ids)
    }

    #[test]
    fn test_destination_only_at_end() {
        let params = SphinxParams::default();
        let (pki, ids) = directory(8);
        let factory = RandomRouteFactory::with_rng(params, pki, StdRng::seed_from_u64(7));

        for _ in 0..50 {
            let route = factory.build_route(Some(ids[3])).unwrap();
            assert_eq!(route.len(), params.max_hops);
            assert_eq!(route.last_hop(), ids[3]);
            assert!(!route.hops()[..route.len() - 1].contains(&ids[3]));

            let distinct: HashSet<_> = route.hops().iter().collect();
            assert_eq!(distinct.len(), route.len());
        }
    }

    #[test]
    fn test_routes_vary() {
        let params = SphinxParams::default();
        let (pki, ids) = directory(10);
        let factory = RandomRouteFactory::with_rng(params, pki, StdRng::seed_from_u64(1));

        let routes: HashSet<Vec<NodeId>> = (0..20)
            .map(|_| factory.build_route(Some(ids[0])).unwrap().hops().to_vec())
            .collect();
        assert!(routes.len() > 1);
    }

    #[test]
    fn test_without_destination() {
        let params = SphinxParams::new(3, 256).unwrap();
        let (pki, _ids) = directory(3);
        let factory = RandomRouteFactory::new(params, pki);

        assert_eq!(factory.build_route(None).unwrap().len(), 3);
    }

    #[test]
    fn test_insufficient_pool() {
        let params = SphinxParams::default();
        let (pki, ids) = directory(4);
        let factory = RandomRouteFactory::new(params, pki);

        // 4 identities minus the destination leaves 3, need 4.
        match factory.build_route(Some(ids[0])) {
            Err(MixError::InsufficientRoutePoolError { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 3);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_zero_hop_params_rejected() {
        let params: SphinxParams = serde_json::from_str(r#"{"max_hops": 0}"#).unwrap();
        let (pki, ids) = directory(3);
        let factory = RandomRouteFactory::new(params, pki);

        assert!(matches!(factory.build_route(Some(ids[0])), Err(MixError::ConfigError(_))));
        assert!(matches!(factory.build_route(None), Err(MixError::ConfigError(_))));
    }

    #[test]
    fn test_cascade_is_fixed() {
        let params = SphinxParams::default();
        let (_pki, ids) = directory(3);
        let route = RouteDescriptor::new(ids.clone(), &params).unwrap();
        let factory = CascadeRouteFactory::new(route.clone());

        assert_eq!(factory.build_route(None).unwrap(), route);
        assert_eq!(factory.build_route(Some(ids[2])).unwrap(), route);
        assert!(factory.build_route(Some(ids[0])).is_err());
    }

    #[test]
    fn test_descriptor_bounds() {
        let params = SphinxParams::new(2, 256).unwrap();
        let (_pki, ids) = directory(3);

        assert!(RouteDescriptor::new(vec![], &params).is_err());
        assert!(matches!(
            RouteDescriptor::new(ids, &params),
            Err(MixError::RouteTooLongError { hops: 3, max: 2 })
        ));
    }
}
