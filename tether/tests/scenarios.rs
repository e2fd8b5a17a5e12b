//! End-to-end scenarios over an in-memory channel pair.
//!
//! Each test exposes an object graph on one port, wraps the other, and
//! drives the proxy the way an application would: navigation, calls,
//! constructors, callbacks, and release. Everything runs on a single
//! current-thread runtime inside a `LocalSet`.

use std::rc::Rc;

use serde_json::json;
use tether::{
    expose, proxy, wrap, CallError, HostFunction, HostObject, HostValue, MessageChannel,
    RemoteHandle,
};
use tokio::task::LocalSet;

fn counter_object() -> HostValue {
    HostObject::new()
        .with_data("counter", json!(0))
        .with_method("inc", |ctx| {
            let this = ctx
                .receiver
                .ok_or_else(|| HostValue::error("TypeError", "inc called without a receiver"))?;
            let next = this
                .member("counter")
                .and_then(|v| v.as_json().and_then(serde_json::Value::as_i64))
                .unwrap_or(0)
                + 1;
            this.set_member("counter", HostValue::Data(json!(next)));
            Ok(HostValue::Data(json!(next)))
        })
        .into_value()
}

/// Expose `value` on a fresh channel and hand back the wrapped other end.
fn connect(value: HostValue) -> RemoteHandle {
    let channel = MessageChannel::new();
    expose(value, Rc::new(channel.port1));
    wrap(Rc::new(channel.port2))
}

#[tokio::test]
async fn counter_increments_across_calls() {
    LocalSet::new()
        .run_until(async {
            let remote = connect(counter_object());
            for expected in 1..=3 {
                let value = remote.get("inc").call(vec![]).await.expect("inc");
                assert_eq!(value.as_json(), Some(&json!(expected)));
            }
        })
        .await;
}

#[tokio::test]
async fn remote_throw_surfaces_as_matching_error() {
    LocalSet::new()
        .run_until(async {
            let remote = connect(
                HostObject::new()
                    .with_method("throws", |_| Err(HostValue::error("RangeError", "nope")))
                    .into_value(),
            );

            let error = remote
                .get("throws")
                .call(vec![])
                .await
                .expect_err("must reject");
            let thrown = error.as_remote().expect("remote throw");
            assert_eq!(thrown.name(), Some("RangeError"));
            assert_eq!(thrown.message(), Some("nope"));
        })
        .await;
}

#[tokio::test]
async fn constructed_instances_come_back_proxied() {
    LocalSet::new()
        .run_until(async {
            let remote = connect(
                HostObject::new()
                    .with_constructor("Counter", |args| {
                        let start = args
                            .first()
                            .and_then(|v| v.as_json().and_then(serde_json::Value::as_i64))
                            .unwrap_or(0);
                        Ok(Rc::new(
                            HostObject::new()
                                .with_data("n", json!(start))
                                .with_method("inc", |ctx| {
                                    let this = ctx.receiver.ok_or_else(|| {
                                        HostValue::error("TypeError", "inc needs a receiver")
                                    })?;
                                    let next = this
                                        .member("n")
                                        .and_then(|v| {
                                            v.as_json().and_then(serde_json::Value::as_i64)
                                        })
                                        .unwrap_or(0)
                                        + 1;
                                    this.set_member("n", HostValue::Data(json!(next)));
                                    Ok(HostValue::Data(json!(next)))
                                }),
                        ))
                    })
                    .into_value(),
            );

            let instance = remote
                .get("Counter")
                .construct(vec![HostValue::Data(json!(10))])
                .await
                .expect("construct");

            // The instance rides its own sub-channel.
            assert_ne!(instance.endpoint_id(), remote.endpoint_id());

            let value = instance.get("inc").call(vec![]).await.expect("inc");
            assert_eq!(value.as_json(), Some(&json!(11)));
        })
        .await;
}

#[tokio::test]
async fn callbacks_reenter_the_calling_side() {
    LocalSet::new()
        .run_until(async {
            let remote = connect(
                HostObject::new()
                    .with_async_method("cb", |ctx| {
                        Box::pin(async move {
                            let callback = ctx.args.into_iter().next().ok_or_else(|| {
                                HostValue::error("TypeError", "cb needs an argument")
                            })?;
                            let HostValue::Remote(callback) = callback else {
                                return Err(HostValue::error(
                                    "TypeError",
                                    "cb expects a function proxy",
                                ));
                            };
                            callback
                                .call(vec![HostValue::Data(json!(21))])
                                .await
                                .map_err(|error| HostValue::error("Error", error.to_string()))
                        })
                    })
                    .into_value(),
            );

            let double = proxy(HostValue::Function(HostFunction::sync(|ctx| {
                let n = ctx.args[0]
                    .as_json()
                    .and_then(serde_json::Value::as_i64)
                    .ok_or_else(|| HostValue::error("TypeError", "expected a number"))?;
                Ok(HostValue::Data(json!(n * 2)))
            })));

            let value = remote.get("cb").call(vec![double]).await.expect("cb");
            assert_eq!(value.as_json(), Some(&json!(42)));
        })
        .await;
}

#[tokio::test]
async fn nested_navigation_reads_and_writes() {
    LocalSet::new()
        .run_until(async {
            let remote = connect(
                HostObject::new()
                    .with_data("obj", json!({"a": {"b": 5}}))
                    .into_value(),
            );

            let before = remote
                .get("obj")
                .get("a")
                .get("b")
                .fetch()
                .await
                .expect("read");
            assert_eq!(before.as_json(), Some(&json!(5)));

            remote
                .get("obj")
                .get("a")
                .set("b", HostValue::Data(json!(9)))
                .await
                .expect("write");

            let after = remote
                .get("obj")
                .get("a")
                .get("b")
                .fetch()
                .await
                .expect("read back");
            assert_eq!(after.as_json(), Some(&json!(9)));
        })
        .await;
}

#[tokio::test]
async fn release_runs_finalizer_once_and_poisons_the_proxy() {
    LocalSet::new()
        .run_until(async {
            let exposed = Rc::new(
                HostObject::new()
                    .with_data("cleanup", json!(0))
                    .with_finalizer(|this| {
                        let next = this
                            .member("cleanup")
                            .and_then(|v| v.as_json().and_then(serde_json::Value::as_i64))
                            .unwrap_or(0)
                            + 1;
                        this.set_member("cleanup", HostValue::Data(json!(next)));
                    }),
            );

            let channel = MessageChannel::new();
            expose(
                HostValue::Object(Rc::clone(&exposed)),
                Rc::new(channel.port1.clone()),
            );
            let remote = wrap(Rc::new(channel.port2));
            let leftover = remote.get("cleanup");

            remote.release().await.expect("release");

            assert_eq!(
                exposed
                    .member("cleanup")
                    .and_then(|v| v.as_json().cloned()),
                Some(json!(1))
            );
            assert!(channel.port1.is_closed());

            let error = leftover.fetch().await.expect_err("released proxy");
            assert!(matches!(error, CallError::Released));
        })
        .await;
}

#[tokio::test]
async fn whole_data_graph_clones_through_root_fetch() {
    LocalSet::new()
        .run_until(async {
            let remote = connect(
                HostObject::new()
                    .with_data("a", json!({"b": [1, 2, 3]}))
                    .with_data("s", json!("leaf"))
                    .into_value(),
            );
            let value = remote.fetch().await.expect("fetch root");
            assert_eq!(
                value.as_json(),
                Some(&json!({"a": {"b": [1, 2, 3]}, "s": "leaf"}))
            );
        })
        .await;
}

#[tokio::test]
async fn marked_member_fetches_as_independent_proxy() {
    LocalSet::new()
        .run_until(async {
            let remote = connect(
                HostObject::new()
                    .with_value(
                        "child",
                        proxy(
                            HostObject::new()
                                .with_method("ping", |_| Ok(HostValue::Data(json!("pong"))))
                                .into_value(),
                        ),
                    )
                    .into_value(),
            );

            let child = match remote.get("child").fetch().await.expect("fetch child") {
                HostValue::Remote(handle) => handle,
                other => panic!("expected a proxy, got {other:?}"),
            };
            assert_ne!(child.endpoint_id(), remote.endpoint_id());

            // The sub-channel outlives the parent proxy.
            remote.release().await.expect("release parent");
            let value = child.get("ping").call(vec![]).await.expect("ping");
            assert_eq!(value.as_json(), Some(&json!("pong")));
        })
        .await;
}

#[tokio::test]
async fn navigation_is_free_of_wire_traffic() {
    LocalSet::new()
        .run_until(async {
            use std::cell::RefCell;
            use tether::{Endpoint, MessageEvent};

            let channel = MessageChannel::new();
            let seen = Rc::new(RefCell::new(0u32));
            let sink = Rc::clone(&seen);
            channel.port1.listen(Rc::new(move |_event: &MessageEvent| {
                *sink.borrow_mut() += 1;
            }));
            channel.port1.start();

            let remote = wrap(Rc::new(channel.port2));
            let _deep = remote.get("a").get("b").get("c");
            tokio::task::yield_now().await;
            assert_eq!(*seen.borrow(), 0, "navigation must not hit the wire");
        })
        .await;
}
