//! Failover behavior over replicas of one cluster

mod common;

#[cfg(test)]
mod tests {
    use super::common::{Replica, as_pool, cluster};
    use etcd_router::{
        FailoverConfig, FailoverRouter, KvNode, NodeState, PutOptions, RouterError, ShardRouter,
    };
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;
    use std::time::Duration;

    const HOLDOFF: Duration = Duration::from_secs(120);

    fn balanced(replicas: &[Arc<Replica>], seed: u64) -> FailoverRouter {
        FailoverRouter::new(as_pool(replicas))
            .unwrap()
            .with_rng(StdRng::seed_from_u64(seed))
    }

    fn ordered(replicas: &[Arc<Replica>]) -> FailoverRouter {
        let config = FailoverConfig::default().with_balancing(false);
        FailoverRouter::with_config(as_pool(replicas), config).unwrap()
    }

    /// Keep calling until `endpoint` is quarantined
    async fn drive_into_quarantine(router: &FailoverRouter, endpoint: &str) {
        for _ in 0..1000 {
            router.get("probe").await.unwrap();
            let quarantined = router
                .health()
                .get(endpoint)
                .is_some_and(|h| h.state == NodeState::Quarantined);
            if quarantined {
                return;
            }
        }
        panic!("{} never got quarantined", endpoint);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quarantined_node_never_selected_under_balancing() {
        let (_store, replicas) = cluster(&["a:2379", "b:2379", "c:2379"]);
        let router = balanced(&replicas, 11);
        replicas[0].set_down(true);

        drive_into_quarantine(&router, "a:2379").await;
        assert_eq!(replicas[0].calls(), 3);

        for replica in &replicas {
            replica.reset_calls();
        }
        for i in 0..300 {
            let key = format!("key:{}", i);
            router.put(&key, b"v", PutOptions::new()).await.unwrap();
        }
        assert_eq!(replicas[0].calls(), 0);
        assert_eq!(replicas[1].calls() + replicas[2].calls(), 300);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_is_invisible_to_callers() {
        let (store, replicas) = cluster(&["a:2379", "b:2379"]);
        let router = ordered(&replicas);
        replicas[0].set_down(true);

        router.put("k", b"v", PutOptions::new()).await.unwrap();
        assert_eq!(router.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        let health = router.health();
        assert_eq!(health["a:2379"].consecutive_failures, 2);
        assert_eq!(health["a:2379"].state, NodeState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_after_holdoff() {
        let (_store, replicas) = cluster(&["a:2379", "b:2379"]);
        let router = ordered(&replicas);
        for replica in &replicas {
            replica.set_down(true);
        }

        // Three rounds quarantine both nodes
        for _ in 0..3 {
            assert!(router.get("k").await.is_err());
        }
        let health = router.health();
        assert!(health.values().all(|h| h.state == NodeState::Quarantined));

        for replica in &replicas {
            replica.set_down(false);
        }
        assert!(matches!(
            router.get("k").await,
            Err(RouterError::NoNodeAvailable(_))
        ));

        tokio::time::advance(HOLDOFF + Duration::from_millis(1)).await;
        assert_eq!(router.get("k").await.unwrap(), None);

        // The oldest quarantine was promoted and its counter reset by the success
        let health = router.health();
        assert_eq!(health["a:2379"].state, NodeState::Healthy);
        assert_eq!(health["a:2379"].consecutive_failures, 0);
        assert_eq!(health["b:2379"].state, NodeState::Quarantined);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_does_not_block() {
        let (_store, replicas) = cluster(&["a:2379", "b:2379", "c:2379"]);
        let router = balanced(&replicas, 3);
        for replica in &replicas {
            replica.set_down(true);
        }

        for _ in 0..3 {
            let err = router.get("k").await.unwrap_err();
            assert!(matches!(err, RouterError::NoNodeAvailable(_)));
        }
        let calls: usize = replicas.iter().map(|r| r.calls()).sum();
        assert_eq!(calls, 9);

        // Everything quarantined: fails at once without touching a node
        let result = tokio::time::timeout(Duration::from_secs(1), router.get("k")).await;
        assert!(matches!(result, Ok(Err(RouterError::NoNodeAvailable(_)))));
        let calls: usize = replicas.iter().map(|r| r.calls()).sum();
        assert_eq!(calls, 9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leases_fail_over() {
        let (store, replicas) = cluster(&["a:2379", "b:2379"]);
        let router = ordered(&replicas);

        let lease = router.grant_lease(30).await.unwrap();
        replicas[0].set_down(true);
        assert_eq!(router.refresh_lease(lease).await.unwrap(), 30);

        router
            .put("session", b"s1", PutOptions::new().with_lease(lease))
            .await
            .unwrap();
        router.revoke_lease(lease).await.unwrap();
        assert_eq!(store.get("session").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shards_of_failover_pools() {
        let (east_store, east) = cluster(&["east-1:2379", "east-2:2379"]);
        let (west_store, west) = cluster(&["west-1:2379", "west-2:2379"]);
        let pools: Vec<Arc<dyn KvNode>> = vec![
            Arc::new(ordered(&east)),
            Arc::new(ordered(&west)),
        ];
        let router = ShardRouter::new(pools).unwrap();
        assert_eq!(
            router.endpoint(None),
            "east-1:2379,east-2:2379-west-1:2379,west-2:2379"
        );

        east[0].set_down(true);
        west[0].set_down(true);

        for i in 0..40 {
            let key = format!("user:{}", i);
            router.put(&key, key.as_bytes(), PutOptions::new()).await.unwrap();
        }
        for i in 0..40 {
            let key = format!("user:{}", i);
            let in_east = east_store.get(&key).await.unwrap().is_some();
            let in_west = west_store.get(&key).await.unwrap().is_some();
            assert!(in_east != in_west, "{} stored on both or neither shard", key);
            assert_eq!(router.get(&key).await.unwrap(), Some(key.as_bytes().to_vec()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_inner_pool_is_transient_for_outer_router() {
        let (_store_a, pool_a) = cluster(&["a1:2379"]);
        let (store_b, pool_b) = cluster(&["b1:2379"]);
        let outer = FailoverRouter::with_config(
            vec![
                Arc::new(ordered(&pool_a)) as Arc<dyn KvNode>,
                Arc::new(ordered(&pool_b)) as Arc<dyn KvNode>,
            ],
            FailoverConfig::default().with_balancing(false),
        )
        .unwrap();

        pool_a[0].set_down(true);
        outer.put("k", b"v", PutOptions::new()).await.unwrap();
        assert_eq!(store_b.get("k").await.unwrap(), Some(b"v".to_vec()));
    }
}
