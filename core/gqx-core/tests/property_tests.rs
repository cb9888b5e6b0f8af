// 속성 기반 테스트 (proptest)

use arrow::array::{Int32Array, Int64Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use gqx_core::{
    AggregateFunction, AggregateMeasure, AggregateSpec, Collaborators, ExecutorConfig, OutputExpr,
    QueryContext, QuerySpec, RelationSource, SimulatedDevice,
};
use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

const ROWS: usize = 64;

fn relation(keys: &[i32], values: &[i64]) -> Arc<RecordBatch> {
    let schema = Arc::new(Schema::new(vec![
        Field::new("key", DataType::Int32, false),
        Field::new("value", DataType::Int64, false),
    ]));
    Arc::new(
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int32Array::from(keys.to_vec())),
                Arc::new(Int64Array::from(values.to_vec())),
            ],
        )
        .unwrap(),
    )
}

fn columns() -> impl Strategy<Value = (Vec<i32>, Vec<i64>)> {
    (
        prop::collection::vec(-8i32..8, ROWS),
        prop::collection::vec(-1_000i64..1_000, ROWS),
    )
}

fn index_vector() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(0..ROWS as i32, 0..48)
}

fn aggregate_spec() -> QuerySpec {
    QuerySpec::Aggregate(AggregateSpec::new(
        "key",
        vec![
            AggregateMeasure::new("sum", AggregateFunction::Sum, "value"),
            AggregateMeasure::count("n"),
            AggregateMeasure::new("min", AggregateFunction::Min, "value"),
        ],
    ))
}

proptest! {
    #[test]
    fn test_non_aggregate_output_is_bounded_prefix(
        (keys, values) in columns(),
        index in index_vector(),
        limit in 1usize..64,
        capacity in 1usize..16,
    ) {
        let sim = Arc::new(SimulatedDevice::new());
        let spec = QuerySpec::select(vec![OutputExpr::column("value")]);
        let config = ExecutorConfig::default()
            .with_result_limit(limit)
            .with_batch_capacity(capacity);
        let mut ctx = QueryContext::new(Arc::clone(&sim), &spec, config, Collaborators::simulated()).unwrap();
        let mut source = RelationSource::with_rows(relation(&keys, &values), index.clone());

        ctx.run(&mut source).unwrap();

        let expected: Vec<i32> = index.iter().copied().take(limit).collect();
        let ids: Vec<i32> = ctx.results().rows().iter().map(|r| r.row_id).collect();
        prop_assert_eq!(ids, expected);

        let stats = sim.stats();
        prop_assert_eq!(stats.host_allocs, stats.host_frees);
        prop_assert_eq!(stats.double_frees, 0);
        prop_assert!(stats.host_alloc_sizes.iter().all(|b| *b > 0 && b % 4 == 0 && *b <= capacity * 4));
    }

    #[test]
    fn test_aggregate_matches_host_grouping(
        (keys, values) in columns(),
        index in index_vector(),
        capacity in 1usize..16,
    ) {
        let sim = Arc::new(SimulatedDevice::new());
        let spec = aggregate_spec();
        let config = ExecutorConfig::default().with_batch_capacity(capacity);
        let mut ctx = QueryContext::new(Arc::clone(&sim), &spec, config, Collaborators::simulated()).unwrap();
        let mut source = RelationSource::with_rows(relation(&keys, &values), index.clone()).for_query(&spec);

        ctx.run(&mut source).unwrap();

        let mut expected: HashMap<i32, (i64, i64, i64)> = HashMap::new();
        for &row in &index {
            let (k, v) = (keys[row as usize], values[row as usize]);
            let e = expected.entry(k).or_insert((0, 0, i64::MAX));
            e.0 += v;
            e.1 += 1;
            e.2 = e.2.min(v);
        }

        let groups = ctx.results().groups();
        prop_assert_eq!(groups.len(), expected.len());
        for g in groups {
            let want = expected[&g.key];
            prop_assert_eq!((g.measures[0], g.measures[1], g.measures[2]), want);
        }
        prop_assert_eq!(sim.stats().live_host_buffers, 0);
    }

    #[test]
    fn test_batch_split_does_not_change_groups(
        (keys, values) in columns(),
        index in index_vector(),
        capacity in 1usize..16,
    ) {
        let spec = aggregate_spec();
        let run = |capacity: usize| {
            let sim = Arc::new(SimulatedDevice::new());
            let config = ExecutorConfig::default().with_batch_capacity(capacity);
            let mut ctx = QueryContext::new(sim, &spec, config, Collaborators::simulated()).unwrap();
            let mut source = RelationSource::with_rows(relation(&keys, &values), index.clone()).for_query(&spec);
            ctx.run(&mut source).unwrap();
            ctx.into_results().groups().to_vec()
        };

        prop_assert_eq!(run(capacity), run(ROWS));
    }
}
