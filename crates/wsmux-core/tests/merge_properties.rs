//! Exactly-once, per-source-ordered delivery for both merge strategies.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;
use proptest::prelude::*;
use wsmux_core::MergeStrategy;

fn run_merge(strategy: MergeStrategy, sizes: &[usize]) -> BTreeMap<usize, Vec<usize>> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();

    rt.block_on(async {
        let merge = strategy.build::<(usize, usize)>();
        let mut merged = merge.merged().unwrap();
        for (src, &len) in sizes.iter().enumerate() {
            let items: Vec<_> = (0..len).map(|i| (src, i)).collect();
            merge.attach(futures::stream::iter(items).boxed());
        }

        let total: usize = sizes.iter().sum();
        let mut seen: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for _ in 0..total {
            let (src, i) = tokio::time::timeout(Duration::from_secs(5), merged.next())
                .await
                .expect("merged stream stalled")
                .expect("merged stream ended early");
            seen.entry(src).or_default().push(i);
        }

        // Nothing beyond the expected items shows up.
        let extra = tokio::time::timeout(Duration::from_millis(20), merged.next()).await;
        assert!(extra.is_err(), "unexpected extra item");

        merge.stop();
        seen
    })
}

fn strategy() -> impl Strategy<Value = MergeStrategy> {
    prop_oneof![Just(MergeStrategy::Queue), Just(MergeStrategy::Multiplexer)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_item_once_in_source_order(
        strategy in strategy(),
        sizes in prop::collection::vec(0usize..40, 1..8),
    ) {
        let seen = run_merge(strategy, &sizes);
        for (src, &len) in sizes.iter().enumerate() {
            let got = seen.get(&src).cloned().unwrap_or_default();
            prop_assert_eq!(got, (0..len).collect::<Vec<_>>());
        }
    }
}
