//! Conditional writes through routers

mod common;

#[cfg(test)]
mod tests {
    use super::common::{as_pool, cluster, memory_nodes};
    use etcd_router::{
        CasOutcome, CasRequest, CompareOp, CompareTarget, FailoverRouter, KvNode, MemoryNode,
        PutOptions, ShardRouter,
    };
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_put_if_absent_race_has_one_winner() {
        let (store, replicas) = cluster(&["a:2379", "b:2379", "c:2379"]);
        let router = Arc::new(FailoverRouter::new(as_pool(&replicas)).unwrap());

        let mut handles = Vec::new();
        for i in 0..32 {
            let router = Arc::clone(&router);
            handles.push(tokio::spawn(async move {
                let value = format!("owner-{}", i);
                let outcome = router
                    .put_if("lock", value.as_bytes(), None, true)
                    .await
                    .unwrap();
                (value, outcome)
            }));
        }

        let mut winners = Vec::new();
        let mut losers = Vec::new();
        for handle in handles {
            let (value, outcome) = handle.await.unwrap();
            if outcome.is_applied() {
                winners.push(value);
            } else {
                losers.push(outcome);
            }
        }

        assert_eq!(winners.len(), 1);
        let stored = store.get("lock").await.unwrap();
        assert_eq!(stored, Some(winners[0].as_bytes().to_vec()));
        for outcome in losers {
            assert_eq!(outcome, CasOutcome::RejectedWithCurrent(stored.clone()));
        }
    }

    #[tokio::test]
    async fn test_race_losers_without_current() {
        let router = ShardRouter::new(memory_nodes(&["a", "b", "c"])).unwrap();

        let first = router.put_if("job:1", b"w1", None, false).await.unwrap();
        let second = router.put_if("job:1", b"w2", None, false).await.unwrap();

        assert_eq!(first, CasOutcome::Applied);
        assert_eq!(second, CasOutcome::Rejected);
        assert_eq!(router.get("job:1").await.unwrap(), Some(b"w1".to_vec()));
    }

    #[tokio::test]
    async fn test_absent_compares_version_not_value() {
        let node = MemoryNode::new("a:2379");
        node.put("empty", b"", PutOptions::new()).await.unwrap();

        // An existing key holding "" is not absent
        for return_current in [false, true] {
            let outcome = node.put_if("empty", b"x", None, return_current).await.unwrap();
            assert!(!outcome.is_applied());
        }
        let outcome = node.put_if("empty", b"x", None, true).await.unwrap();
        assert_eq!(outcome, CasOutcome::RejectedWithCurrent(Some(Vec::new())));

        // ... but an empty expected value matches it
        let outcome = node.put_if("empty", b"x", Some(b"".as_slice()), false).await.unwrap();
        assert_eq!(outcome, CasOutcome::Applied);
    }

    #[tokio::test]
    async fn test_delete_if_absent_expectation() {
        let node = MemoryNode::new("a:2379");

        let outcome = node.delete_if("ghost", None, true).await.unwrap();
        assert_eq!(outcome, CasOutcome::Applied);

        node.put("k", b"v", PutOptions::new()).await.unwrap();
        let outcome = node.delete_if("k", None, true).await.unwrap();
        assert_eq!(outcome, CasOutcome::RejectedWithCurrent(Some(b"v".to_vec())));

        let outcome = node.delete_if("k", Some(b"v".as_slice()), false).await.unwrap();
        assert_eq!(outcome, CasOutcome::Applied);
        assert_eq!(node.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cas_on_mod_revision() {
        let node = MemoryNode::new("a:2379");
        node.put("config", b"v1", PutOptions::new()).await.unwrap();
        let revision = node.key_value("config").unwrap().mod_revision.to_string();

        let request = CasRequest::put_if("config", "v2", Some(revision.as_bytes()))
            .with_target(CompareTarget::ModRevision)
            .return_current(true);
        assert_eq!(node.cas(&request).await.unwrap(), CasOutcome::Applied);

        // Stale revision now
        let request = CasRequest::put_if("config", "v3", Some(revision.as_bytes()))
            .with_target(CompareTarget::ModRevision)
            .return_current(true);
        assert_eq!(
            node.cas(&request).await.unwrap(),
            CasOutcome::RejectedWithCurrent(Some(b"v2".to_vec()))
        );
    }

    #[tokio::test]
    async fn test_cas_guarded_by_other_key() {
        let node = MemoryNode::new("a:2379");
        node.put("leader", b"n1", PutOptions::new()).await.unwrap();

        let request = CasRequest::put_if("state", "from-n1", Some(b"n1".as_slice()))
            .compare_on("leader");
        assert!(node.cas(&request).await.unwrap().is_applied());

        let request = CasRequest::put_if("state", "from-n2", Some(b"n2".as_slice()))
            .compare_on("leader");
        assert!(!node.cas(&request).await.unwrap().is_applied());
        assert_eq!(node.get("state").await.unwrap(), Some(b"from-n1".to_vec()));
    }

    #[tokio::test]
    async fn test_greater_than_version() {
        let node = MemoryNode::new("a:2379");
        for value in ["1", "2", "3"] {
            node.put("counter", value.as_bytes(), PutOptions::new())
                .await
                .unwrap();
        }

        let request = CasRequest::delete_if("counter", Some(b"2".as_slice()))
            .with_target(CompareTarget::Version)
            .with_operator(CompareOp::Greater);
        assert!(node.cas(&request).await.unwrap().is_applied());
        assert_eq!(node.get("counter").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_end_to_end_three_nodes() {
        let router = ShardRouter::new(memory_nodes(&["A", "B", "C"])).unwrap();

        router.put("x", b"1", PutOptions::new()).await.unwrap();
        assert_eq!(
            router.put_if("x", b"2", Some(b"1".as_slice()), false).await.unwrap(),
            CasOutcome::Applied
        );
        assert_eq!(router.get("x").await.unwrap(), Some(b"2".to_vec()));
        assert_eq!(
            router.put_if("x", b"3", Some(b"1".as_slice()), false).await.unwrap(),
            CasOutcome::Rejected
        );
        assert_eq!(
            router.put_if("x", b"3", Some(b"1".as_slice()), true).await.unwrap(),
            CasOutcome::RejectedWithCurrent(Some(b"2".to_vec()))
        );
    }
}
