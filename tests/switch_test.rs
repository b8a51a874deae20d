//! Tests for conditional dispatch through a switch join.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conflux::{App, EngineError, Join, Task};
use serde_json::{json, Value};

/// Returns its first argument unchanged.
struct Echo {
    name: &'static str,
}

#[async_trait]
impl Task for Echo {
    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    }
}

/// Records every argument list it is invoked with.
struct Record {
    name: &'static str,
    calls: Arc<Mutex<Vec<Vec<Value>>>>,
}

#[async_trait]
impl Task for Record {
    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        self.calls.lock().unwrap().push(args.clone());
        Ok(args.into_iter().next().unwrap_or(Value::Null))
    }
}

fn route_selector(value: &Value) -> Option<usize> {
    value.get("route").and_then(Value::as_u64).map(|n| n as usize)
}

struct Routed {
    app: App,
    source: conflux::TaskId,
    t0_calls: Arc<Mutex<Vec<Vec<Value>>>>,
    t1_calls: Arc<Mutex<Vec<Vec<Value>>>>,
}

fn routed_app() -> Routed {
    let mut app = App::new();
    let t0_calls = Arc::new(Mutex::new(Vec::new()));
    let t1_calls = Arc::new(Mutex::new(Vec::new()));

    let source = app.register(Echo { name: "source" });
    let t0 = app.register(Record {
        name: "t0",
        calls: t0_calls.clone(),
    });
    let t1 = app.register(Record {
        name: "t1",
        calls: t1_calls.clone(),
    });

    app.wire(Join::switch(&[source], &[t0, t1], route_selector))
        .unwrap();

    Routed {
        app,
        source,
        t0_calls,
        t1_calls,
    }
}

#[tokio::test]
async fn test_switch_routes_to_selected_target_only() {
    let mut routed = routed_app();

    routed
        .app
        .enq(routed.source, vec![json!({"route": 1, "id": 9})])
        .unwrap();
    routed.app.run().await.unwrap();

    assert!(routed.t0_calls.lock().unwrap().is_empty());
    assert_eq!(
        *routed.t1_calls.lock().unwrap(),
        vec![vec![json!({"route": 1, "id": 9})]]
    );
}

#[tokio::test]
async fn test_switch_routes_each_result_independently() {
    let mut routed = routed_app();

    routed
        .app
        .enq(routed.source, vec![json!({"route": 0})])
        .unwrap();
    routed
        .app
        .enq(routed.source, vec![json!({"route": 1})])
        .unwrap();
    routed
        .app
        .enq(routed.source, vec![json!({"route": 0})])
        .unwrap();
    routed.app.run().await.unwrap();

    assert_eq!(routed.t0_calls.lock().unwrap().len(), 2);
    assert_eq!(routed.t1_calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_switch_null_selection_is_a_noop() {
    let mut routed = routed_app();

    // No "route" key: the selector declines and the result is unconsumed.
    routed
        .app
        .enq(routed.source, vec![json!({"id": 3})])
        .unwrap();
    routed.app.run().await.unwrap();

    assert!(routed.t0_calls.lock().unwrap().is_empty());
    assert!(routed.t1_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_switch_out_of_range_index_raises() {
    let mut routed = routed_app();

    routed
        .app
        .enq(routed.source, vec![json!({"route": 7})])
        .unwrap();
    let err = routed.app.run().await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::SwitchIndexOutOfBounds {
            index: 7,
            targets: 2
        }
    ));
}
