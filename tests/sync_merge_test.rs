//! Tests for the synchronized merge: collect-then-fire, slot ordering,
//! collision detection, and reset behavior.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conflux::{App, EngineError, Join, Task};
use serde_json::{json, Value};

/// Always produces a fixed value.
struct Emit {
    name: &'static str,
    value: Value,
}

#[async_trait]
impl Task for Emit {
    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, _args: Vec<Value>) -> anyhow::Result<Value> {
        Ok(self.value.clone())
    }
}

/// Joins its string arguments with a comma, recording each invocation.
struct Concat {
    calls: Arc<Mutex<Vec<Vec<Value>>>>,
}

#[async_trait]
impl Task for Concat {
    fn name(&self) -> &str {
        "concat"
    }

    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        self.calls.lock().unwrap().push(args.clone());
        let joined = args
            .iter()
            .map(|v| v.as_str().unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",");
        Ok(json!(joined))
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

fn two_sources(app: &mut App) -> (conflux::TaskId, conflux::TaskId) {
    let a = app.register(Emit {
        name: "a",
        value: json!("a"),
    });
    let b = app.register(Emit {
        name: "b",
        value: json!("b"),
    });
    (a, b)
}

#[tokio::test]
async fn test_sync_fires_once_with_slot_ordered_args() {
    let mut app = App::new();
    let concat_calls = Arc::new(Mutex::new(Vec::new()));
    let sink_calls = Arc::new(Mutex::new(Vec::new()));

    let (a, b) = two_sources(&mut app);
    let concat = app.register(Concat {
        calls: concat_calls.clone(),
    });
    let sink = app.register(Record {
        name: "sink",
        calls: sink_calls.clone(),
    });

    app.wire(Join::sync(&[a, b], &[concat])).unwrap();
    app.wire(Join::sequence(&[concat], &[sink])).unwrap();

    app.enq(a, vec![]).unwrap();
    app.enq(b, vec![]).unwrap();
    app.run().await.unwrap();

    assert_eq!(
        *concat_calls.lock().unwrap(),
        vec![vec![json!("a"), json!("b")]]
    );
    assert_eq!(*sink_calls.lock().unwrap(), vec![vec![json!("a,b")]]);
}

#[tokio::test]
async fn test_slot_order_independent_of_firing_order() {
    let mut app = App::new();
    let concat_calls = Arc::new(Mutex::new(Vec::new()));

    let (a, b) = two_sources(&mut app);
    let concat = app.register(Concat {
        calls: concat_calls.clone(),
    });

    app.wire(Join::sync(&[a, b], &[concat])).unwrap();

    // b completes first; the argument list still follows registration order.
    app.enq(b, vec![]).unwrap();
    app.enq(a, vec![]).unwrap();
    app.run().await.unwrap();

    assert_eq!(
        *concat_calls.lock().unwrap(),
        vec![vec![json!("a"), json!("b")]]
    );
}

#[tokio::test]
async fn test_double_fill_raises_collision() {
    let mut app = App::new();
    let concat_calls = Arc::new(Mutex::new(Vec::new()));

    let (a, b) = two_sources(&mut app);
    let concat = app.register(Concat {
        calls: concat_calls.clone(),
    });

    app.wire(Join::sync(&[a, b], &[concat])).unwrap();

    // a laps b: its slot is still occupied when it completes again.
    app.enq(a, vec![]).unwrap();
    app.enq(a, vec![]).unwrap();
    let err = app.run().await.unwrap_err();

    assert!(matches!(
        err,
        EngineError::SynchronizeCollision { slot: 0, .. }
    ));
    assert!(concat_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_slots_reset_after_group_fires() {
    let mut app = App::new();
    let concat_calls = Arc::new(Mutex::new(Vec::new()));

    let (a, b) = two_sources(&mut app);
    let concat = app.register(Concat {
        calls: concat_calls.clone(),
    });

    app.wire(Join::sync(&[a, b], &[concat])).unwrap();

    app.enq(a, vec![]).unwrap();
    app.enq(b, vec![]).unwrap();
    app.run().await.unwrap();

    // A second round collects into fresh slots without a collision.
    app.enq(b, vec![]).unwrap();
    app.enq(a, vec![]).unwrap();
    app.run().await.unwrap();

    assert_eq!(
        *concat_calls.lock().unwrap(),
        vec![
            vec![json!("a"), json!("b")],
            vec![json!("a"), json!("b")],
        ]
    );
}

#[tokio::test]
async fn test_three_source_interleaving_preserves_registration_order() {
    let mut app = App::new();
    let concat_calls = Arc::new(Mutex::new(Vec::new()));

    let a = app.register(Emit {
        name: "a",
        value: json!("a"),
    });
    let b = app.register(Emit {
        name: "b",
        value: json!("b"),
    });
    let c = app.register(Emit {
        name: "c",
        value: json!("c"),
    });
    let concat = app.register(Concat {
        calls: concat_calls.clone(),
    });

    app.wire(Join::sync(&[a, b, c], &[concat])).unwrap();

    app.enq(c, vec![]).unwrap();
    app.enq(a, vec![]).unwrap();
    app.enq(b, vec![]).unwrap();
    app.run().await.unwrap();

    assert_eq!(
        *concat_calls.lock().unwrap(),
        vec![vec![json!("a"), json!("b"), json!("c")]]
    );
}
