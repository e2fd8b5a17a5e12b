//! The exposer: evaluates inbound requests against a host object graph.
//!
//! [`expose`] installs a persistent listener on an endpoint. Each inbound
//! message is handled on its own local task, so in-flight calls never order
//! against each other; correlation is purely by id. Messages that are not
//! requests, that fail the origin gate, or that carry an unknown operation
//! are dropped without a reply.
//!
//! Dispatch resolves the request path against the host graph (descending
//! both object members and nested JSON data), performs the operation, awaits
//! asynchronous results, and encodes the outcome. A throw at any stage
//! becomes a thrown-marker reply; a reply that itself fails to encode is
//! replaced by a synthetic `TypeError: Unserializable return value` so the
//! caller's future always settles.
//!
//! Requires a current-thread tokio runtime with a `LocalSet` (the engine is
//! single-threaded cooperative throughout).

use std::cell::Cell;
use std::rc::Rc;

use tether_core::message::{Operation, Reply, Request};
use tether_core::AllowedOrigins;

use crate::channel::{Endpoint, ListenerId, Message, MessageChannel, MessageEvent, MessagePort};
use crate::handlers::{from_wire, to_wire, transfer};
use crate::lifetime;
use crate::value::{CallContext, HostValue};
#[cfg(test)]
use crate::value::HostObject;

/// Configuration for an exposure.
#[derive(Debug, Clone, Default)]
pub struct ExposeOptions {
    /// Allow-list applied to inbound origins. Defaults to permit-all.
    pub allowed_origins: AllowedOrigins,
}

/// Expose a value on an endpoint with default options.
pub fn expose(value: HostValue, endpoint: Rc<dyn Endpoint>) {
    expose_with(value, endpoint, ExposeOptions::default());
}

/// Expose a value on an endpoint, gating inbound messages by origin.
pub fn expose_with(value: HostValue, endpoint: Rc<dyn Endpoint>, options: ExposeOptions) {
    let listener_slot: Rc<Cell<Option<ListenerId>>> = Rc::new(Cell::new(None));

    let listener = {
        let value = value.clone();
        let endpoint = Rc::clone(&endpoint);
        let listener_slot = Rc::clone(&listener_slot);
        Rc::new(move |event: &MessageEvent| {
            if !options.allowed_origins.allows(event.origin.as_deref()) {
                tracing::warn!(
                    endpoint = %endpoint.id(),
                    origin = ?event.origin,
                    "dropping message from disallowed origin"
                );
                return;
            }
            let Ok(request) = serde_json::from_value::<Request>(event.data.clone()) else {
                tracing::debug!(endpoint = %endpoint.id(), "ignoring non-request message");
                return;
            };
            let Some(op) = Operation::from_tag(&request.op) else {
                tracing::debug!(
                    endpoint = %endpoint.id(),
                    tag = ?request.op,
                    "ignoring unknown operation"
                );
                return;
            };
            // A numeric tag commits this endpoint to the legacy encoding.
            let legacy = request.op.is_legacy();
            if legacy {
                lifetime::mark_legacy(endpoint.id());
            }
            tokio::task::spawn_local(handle_request(
                value.clone(),
                Rc::clone(&endpoint),
                Rc::clone(&listener_slot),
                request,
                op,
                legacy,
                event.ports.clone(),
            ));
        })
    };

    let id = endpoint.listen(listener);
    listener_slot.set(Some(id));
    endpoint.start();
}

async fn handle_request(
    value: HostValue,
    endpoint: Rc<dyn Endpoint>,
    listener_slot: Rc<Cell<Option<ListenerId>>>,
    request: Request,
    op: Operation,
    legacy: bool,
    event_ports: Vec<MessagePort>,
) {
    let outcome = dispatch(&value, op, &request, &event_ports).await;
    let reply_value = match outcome {
        Ok(result) => result,
        Err(raised) => HostValue::Thrown(Box::new(raised)),
    };

    let (wire, ports) = match to_wire(reply_value, legacy) {
        Ok(encoded) => encoded,
        Err(error) => {
            tracing::warn!(endpoint = %endpoint.id(), %error, "reply failed to encode");
            let fallback =
                HostValue::Thrown(Box::new(HostValue::error("TypeError", "Unserializable return value")));
            match to_wire(fallback, legacy) {
                Ok(encoded) => encoded,
                Err(error) => {
                    tracing::error!(endpoint = %endpoint.id(), %error, "fallback reply failed");
                    return;
                }
            }
        }
    };

    let reply = Reply {
        id: request.id,
        value: wire,
    };
    match serde_json::to_value(&reply) {
        Ok(data) => {
            if let Err(error) = endpoint.post(Message { data, ports }) {
                tracing::warn!(endpoint = %endpoint.id(), %error, "reply not delivered");
            }
        }
        Err(error) => {
            tracing::error!(endpoint = %endpoint.id(), %error, "reply failed to serialize");
            return;
        }
    }

    if op == Operation::Release {
        if let Some(id) = listener_slot.take() {
            endpoint.unlisten(id);
        }
        if endpoint.closeable() {
            endpoint.close();
        }
        if let HostValue::Object(object) = &value
            && let Some(finalizer) = object.take_finalizer()
        {
            finalizer(object);
        }
    }
}

async fn dispatch(
    root: &HostValue,
    op: Operation,
    request: &Request,
    event_ports: &[MessagePort],
) -> Result<HostValue, HostValue> {
    match op {
        Operation::Get => {
            let resolved = resolve(root, &request.path)?;
            Ok(resolved.raw)
        }
        Operation::Set => {
            let wire = request
                .value
                .clone()
                .ok_or_else(|| type_error("SET carried no value"))?;
            let decoded = from_wire(wire, event_ports)
                .map_err(|error| type_error(error.to_string()))?;
            assign(root, &request.path, decoded)?;
            Ok(HostValue::Data(serde_json::Value::Bool(true)))
        }
        Operation::Apply => {
            let args = decode_arguments(request, event_ports)?;
            let resolved = resolve(root, &request.path)?;
            match resolved.raw {
                HostValue::Function(function) => {
                    function
                        .invoke(CallContext {
                            receiver: resolved.parent.as_object().cloned(),
                            args,
                        })
                        .await
                }
                _ => Err(type_error(format!(
                    "{} is not a function",
                    display_path(&request.path)
                ))),
            }
        }
        Operation::Construct => {
            let args = decode_arguments(request, event_ports)?;
            let resolved = resolve(root, &request.path)?;
            match resolved.raw {
                HostValue::Constructor(constructor) => {
                    let instance = constructor.construct(args)?;
                    instance.mark_proxied();
                    Ok(HostValue::Object(instance))
                }
                _ => Err(type_error(format!(
                    "{} is not a constructor",
                    display_path(&request.path)
                ))),
            }
        }
        Operation::Endpoint => {
            let channel = MessageChannel::new();
            expose(root.clone(), Rc::new(channel.port1.clone()));
            let port = channel.port2.clone();
            Ok(transfer(HostValue::Port(port), vec![channel.port2]))
        }
        Operation::Release => Ok(HostValue::null()),
    }
}

fn decode_arguments(
    request: &Request,
    event_ports: &[MessagePort],
) -> Result<Vec<HostValue>, HostValue> {
    request
        .argument_list
        .clone()
        .unwrap_or_default()
        .into_iter()
        .map(|wire| from_wire(wire, event_ports).map_err(|error| type_error(error.to_string())))
        .collect()
}

fn type_error(message: impl Into<String>) -> HostValue {
    HostValue::error("TypeError", message)
}

fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "<root>".to_string()
    } else {
        path.join(".")
    }
}

struct Resolved {
    parent: HostValue,
    raw: HostValue,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved").finish_non_exhaustive()
    }
}

/// Walk the host graph: `parent` is the value at the path minus its last
/// segment, `raw` the value at the full path.
fn resolve(root: &HostValue, path: &[String]) -> Result<Resolved, HostValue> {
    let Some((last, parents)) = path.split_last() else {
        return Ok(Resolved {
            parent: root.clone(),
            raw: root.clone(),
        });
    };
    let mut parent = root.clone();
    for key in parents {
        parent = step(&parent, key)?;
    }
    let raw = step(&parent, last)?;
    Ok(Resolved { parent, raw })
}

/// Descend one segment: object members first, then nested JSON data. Missing
/// members read as the empty value.
fn step(value: &HostValue, key: &str) -> Result<HostValue, HostValue> {
    match value {
        HostValue::Object(object) => Ok(object.member(key).unwrap_or_else(HostValue::null)),
        HostValue::Data(json) => Ok(HostValue::Data(json_get(json, key))),
        _ => Err(type_error(format!("cannot read {key:?} of a non-object"))),
    }
}

fn json_get(json: &serde_json::Value, key: &str) -> serde_json::Value {
    match json {
        serde_json::Value::Object(map) => map.get(key).cloned().unwrap_or(serde_json::Value::Null),
        serde_json::Value::Array(items) => key
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index).cloned())
            .unwrap_or(serde_json::Value::Null),
        _ => serde_json::Value::Null,
    }
}

/// Assign `value` under the last path segment. The walk stays on object
/// members as long as it can, then descends into a JSON member in place.
fn assign(root: &HostValue, path: &[String], value: HostValue) -> Result<(), HostValue> {
    let Some((last, parents)) = path.split_last() else {
        return Err(type_error("cannot assign to the root"));
    };
    let HostValue::Object(mut object) = root.clone() else {
        return Err(type_error("cannot assign into a non-object root"));
    };

    let mut index = 0;
    while index < parents.len() {
        let key = &parents[index];
        match object.member(key) {
            Some(HostValue::Object(next)) => {
                object = next;
                index += 1;
            }
            Some(HostValue::Data(_)) => break,
            Some(_) => return Err(type_error(format!("cannot assign through {key:?}"))),
            None => return Err(type_error(format!("no such property {key:?}"))),
        }
    }

    if index == parents.len() {
        object.set_member(last.clone(), value);
        return Ok(());
    }

    // The remaining segments live inside a JSON member; the assigned value
    // must itself be clone-safe data.
    let member_key = parents[index].clone();
    let tail = &parents[index + 1..];
    let json_value = value.clone_to_json().map_err(type_error)?;
    object
        .update_member(&member_key, |member| match member {
            HostValue::Data(json) => json_set(json, tail, last, json_value),
            _ => Err(type_error(format!("cannot assign through {member_key:?}"))),
        })
        .unwrap_or_else(|| Err(type_error(format!("no such property {member_key:?}"))))
}

fn json_set(
    json: &mut serde_json::Value,
    tail: &[String],
    last: &str,
    value: serde_json::Value,
) -> Result<(), HostValue> {
    let mut cursor = json;
    for key in tail {
        cursor = match cursor {
            serde_json::Value::Object(map) => map
                .get_mut(key)
                .ok_or_else(|| type_error(format!("no such property {key:?}")))?,
            serde_json::Value::Array(items) => {
                let index = key
                    .parse::<usize>()
                    .map_err(|_| type_error(format!("invalid index {key:?}")))?;
                items
                    .get_mut(index)
                    .ok_or_else(|| type_error(format!("index {index} out of bounds")))?
            }
            _ => return Err(type_error(format!("cannot descend into {key:?}"))),
        };
    }
    match cursor {
        serde_json::Value::Object(map) => {
            map.insert(last.to_string(), value);
            Ok(())
        }
        serde_json::Value::Array(items) => {
            let index = last
                .parse::<usize>()
                .map_err(|_| type_error(format!("invalid index {last:?}")))?;
            if index < items.len() {
                items[index] = value;
                Ok(())
            } else {
                Err(type_error(format!("index {index} out of bounds")))
            }
        }
        _ => Err(type_error("cannot assign a property of a non-object")),
    }
}
