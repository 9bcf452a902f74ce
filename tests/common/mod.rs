#![allow(dead_code, unused_imports)]

use std::sync::Arc;

use chrono::NaiveDate;

use batchdag::connections::ConnectionRegistry;
use batchdag::operators::{ExecutionContext, Operator, OperatorResult};
use batchdag::storage::MemoryObjectStore;
use batchdag::warehouse::{SqliteWarehouse, TableLocks, Warehouse};

pub use batchdag_test_utils::builders;
pub use batchdag_test_utils::fake_executor::FakeExecutor;
pub use batchdag_test_utils::{date, init_tracing, with_timeout};

/// In-memory warehouse with `ddl` applied.
pub fn warehouse_with(ddl: &str) -> Arc<SqliteWarehouse> {
    let wh = SqliteWarehouse::open_in_memory().expect("open in-memory warehouse");
    wh.execute_script(ddl).expect("apply test DDL");
    Arc::new(wh)
}

/// `warehouse` + `object-store` connections backed by the given handles.
pub fn connections(wh: &Arc<SqliteWarehouse>, store: &Arc<MemoryObjectStore>) -> ConnectionRegistry {
    ConnectionRegistry::new()
        .with_warehouse("warehouse", wh.clone())
        .with_object_store("object-store", store.clone())
}

/// Execute one operator for `date` outside of any scheduler.
pub fn execute(op: &impl Operator, connections: &ConnectionRegistry, date: NaiveDate) -> OperatorResult {
    let locks = TableLocks::new();
    let ctx = ExecutionContext {
        task_id: "under_test",
        logical_date: date,
        attempt: 1,
        connections,
        locks: &locks,
    };
    op.execute(&ctx)
}

/// `SELECT COUNT(*) FROM <table> [WHERE ...]` as an integer.
pub fn count(wh: &SqliteWarehouse, sql: &str) -> i64 {
    match wh.query_scalar(sql).expect("count query") {
        batchdag::warehouse::SqlValue::Integer(n) => n,
        other => panic!("expected integer count, got {other:?}"),
    }
}

/// One log event as a JSON line.
pub fn event_line(user_id: i64, song_id: Option<&str>, page: &str) -> String {
    serde_json::json!({
        "userId": user_id,
        "song": song_id.map(|s| format!("song {s}")),
        "songId": song_id,
        "page": page,
    })
    .to_string()
}
