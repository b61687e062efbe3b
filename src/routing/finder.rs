//! Path selection for new routes

use crate::crypto::PubKey;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Chooses the nodes a route traverses
#[async_trait]
pub trait RouteFinder: Send + Sync {
    /// Hops from `src` to `dst`, excluding `src` and ending with `dst`
    async fn find_route(&self, src: &PubKey, dst: &PubKey) -> Result<Vec<PubKey>>;
}

/// [`RouteFinder`] over a fixed table of intermediates
///
/// Destinations without an entry are reached directly.
#[derive(Debug, Clone, Default)]
pub struct StaticRouteFinder {
    via: HashMap<PubKey, Vec<PubKey>>,
}

impl StaticRouteFinder {
    /// Finder that always routes directly
    pub fn direct() -> Self {
        Self::default()
    }

    /// Finder with the given destination to intermediates table
    pub fn new(via: HashMap<PubKey, Vec<PubKey>>) -> Self {
        Self { via }
    }

    /// Route to `dst` through `intermediates`
    pub fn add_route(&mut self, dst: PubKey, intermediates: Vec<PubKey>) {
        self.via.insert(dst, intermediates);
    }
}

#[async_trait]
impl RouteFinder for StaticRouteFinder {
    async fn find_route(&self, _src: &PubKey, dst: &PubKey) -> Result<Vec<PubKey>> {
        let mut hops = self.via.get(dst).cloned().unwrap_or_default();
        hops.push(*dst);
        Ok(hops)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_direct_and_static_routes() {
        let src = PubKey::from_bytes([1; 32]);
        let hop = PubKey::from_bytes([2; 32]);
        let dst = PubKey::from_bytes([3; 32]);
        let other = PubKey::from_bytes([4; 32]);

        let mut finder = StaticRouteFinder::direct();
        assert_eq!(finder.find_route(&src, &dst).await.unwrap(), vec![dst]);

        finder.add_route(dst, vec![hop]);
        assert_eq!(finder.find_route(&src, &dst).await.unwrap(), vec![hop, dst]);
        assert_eq!(finder.find_route(&src, &other).await.unwrap(), vec![other]);
    }
}
