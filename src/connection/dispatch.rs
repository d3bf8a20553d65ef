use std::rc::Rc;

use crate::fdo;
use crate::message::{Message, MessageType};
use crate::value::Value;
use crate::Result;

use super::inner::{ConnectionInner, PendingFailure};
use super::names;
use super::subscription::{self, Signal};

/// Route one fully-decoded inbound message: correlate replies, dispatch method calls to
/// collaborators, or fan signals out to matching subscriptions.
pub async fn route(inner: &Rc<ConnectionInner>, msg: Message) -> Result<()> {
    match msg.message_type() {
        MessageType::MethodReturn | MessageType::Error => route_reply(inner, msg),
        MessageType::Signal => route_signal(inner, msg).await,
        MessageType::MethodCall => route_call(inner, msg).await,
    }
}

fn route_reply(inner: &Rc<ConnectionInner>, msg: Message) -> Result<()> {
    let serial = match msg.reply_serial() {
        Some(s) => s,
        None => {
            tracing::trace!("dropping reply with no reply_serial");
            return Ok(());
        }
    };
    let tx = inner.pending_replies.borrow_mut().remove(&serial);
    let tx = match tx {
        Some(tx) => tx,
        None => {
            tracing::trace!(serial, "dropping reply with unknown serial");
            return Ok(());
        }
    };
    let reply = if msg.message_type() == MessageType::Error {
        let name = msg.error_name().unwrap_or("").to_owned();
        Err(PendingFailure::Remote { name, body: msg.body })
    } else {
        Ok(msg.body)
    };
    let _ = tx.try_send(reply);
    Ok(())
}

async fn route_signal(inner: &Rc<ConnectionInner>, msg: Message) -> Result<()> {
    if msg.interface() == Some(fdo::BUS_INTERFACE) {
        match msg.member() {
            Some(fdo::member::NAME_ACQUIRED) => {
                match msg.body.get(0).and_then(Value::as_str) {
                    Some(name) => names::on_name_acquired(inner, name),
                    None => tracing::warn!(
                        body = ?msg.body,
                        "protocol error: NameAcquired signal missing string argument"
                    ),
                }
            }
            Some(fdo::member::NAME_LOST) => {
                match msg.body.get(0).and_then(Value::as_str) {
                    Some(name) => names::on_name_lost(inner, name),
                    None => tracing::warn!(
                        body = ?msg.body,
                        "protocol error: NameLost signal missing string argument"
                    ),
                }
            }
            Some(fdo::member::NAME_OWNER_CHANGED) => {
                match (
                    msg.body.get(0).and_then(Value::as_str),
                    msg.body.get(2).and_then(Value::as_str),
                ) {
                    (Some(name), Some(new_owner)) => {
                        names::on_name_owner_changed(inner, name, new_owner)
                    }
                    _ => tracing::warn!(
                        body = ?msg.body,
                        "protocol error: NameOwnerChanged signal has unexpected shape"
                    ),
                }
            }
            _ => {}
        }
    }

    let signal = Signal {
        sender: msg.sender().map(str::to_owned),
        path: msg.path().map(str::to_owned),
        interface: msg.interface().map(str::to_owned),
        member: msg.member().map(str::to_owned),
        body: msg.body,
    };

    let subscriptions = inner.subscriptions.borrow().clone();
    for entry in subscriptions {
        let resolved_sender = entry
            .filter
            .sender
            .as_ref()
            .and_then(|s| inner.name_owners.borrow().get(s).cloned());
        if subscription::matches(&entry.filter, resolved_sender.as_deref(), &signal) {
            if entry.sender.try_send(signal.clone()).is_err() {
                tracing::warn!(rule = %entry.rule, "dropping signal: subscription channel full or closed");
            }
        }
    }
    Ok(())
}

async fn route_call(inner: &Rc<ConnectionInner>, msg: Message) -> Result<()> {
    let path = match msg.path() {
        Some(p) => p.to_owned(),
        None => {
            send_error(inner, &msg, fdo::error_name::UNKNOWN_OBJECT, "missing path").await?;
            return Ok(());
        }
    };
    let member = match msg.member() {
        Some(m) => m.to_owned(),
        None => {
            send_error(inner, &msg, fdo::error_name::UNKNOWN_METHOD, "missing member").await?;
            return Ok(());
        }
    };

    let result = match msg.interface() {
        Some(iface) if iface == fdo::INTROSPECTABLE_INTERFACE => {
            let tree = inner.objects.borrow();
            fdo::introspectable::handle(&tree, &path, &member, &msg.body)
        }
        Some(iface) if iface == fdo::PEER_INTERFACE => fdo::peer::handle(&member, &msg.body),
        Some(iface) if iface == fdo::PROPERTIES_INTERFACE => {
            fdo::properties::handle(&member, &msg.body)
        }
        _ => {
            let tree = inner.objects.borrow();
            match tree.lookup(&path) {
                Some(object) => match msg.interface() {
                    Some(iface) if iface != object.interface_name() => {
                        Err((fdo::error_name::UNKNOWN_INTERFACE.to_owned(), vec![]))
                    }
                    _ => object.handle_call(&member, &msg.body),
                },
                None => Err((fdo::error_name::UNKNOWN_OBJECT.to_owned(), vec![])),
            }
        }
    };

    if msg.no_reply_expected() {
        return Ok(());
    }
    match result {
        Ok(body) => {
            inner.send(Message::method_return(&msg, body)).await?;
        }
        Err((name, body)) => {
            inner.send(Message::method_error(&msg, &name, body)).await?;
        }
    }
    Ok(())
}

async fn send_error(inner: &Rc<ConnectionInner>, call: &Message, name: &str, detail: &str) -> Result<()> {
    if call.no_reply_expected() {
        return Ok(());
    }
    inner
        .send(Message::method_error(
            call,
            name,
            vec![Value::Str(detail.to_owned())],
        ))
        .await?;
    Ok(())
}
