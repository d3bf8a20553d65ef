use std::rc::Rc;

use enumflags2::bitflags;

use crate::fdo::{self, ReleaseNameReply, RequestNameReply};
use crate::message::Message;
use crate::value::Value;
use crate::{Error, Result};

use super::inner::ConnectionInner;

#[bitflags]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameFlags {
    AllowReplacement = 0x1,
    ReplaceExisting = 0x2,
    DoNotQueue = 0x4,
}

pub async fn request_name(
    inner: &Rc<ConnectionInner>,
    name: &str,
    flags: enumflags2::BitFlags<RequestNameFlags>,
) -> Result<RequestNameReply> {
    let msg = Message::method_call(
        fdo::BUS_PATH,
        Some(fdo::BUS_INTERFACE),
        Some(fdo::BUS_DESTINATION),
        fdo::member::REQUEST_NAME,
        vec![Value::Str(name.to_owned()), Value::U32(flags.bits() as u32)],
    );
    let (_, rx) = inner.send_with_reply(msg).await?;
    let reply = inner
        .recv(&rx)
        .await?
        .map_err(Error::from)?;
    let code = reply.get(0).and_then(Value::as_u32).ok_or_else(|| {
        tracing::warn!(body = ?reply, "protocol error: RequestName did not return a u32");
        Error::Protocol("RequestName did not return a u32".into())
    })?;
    let outcome = RequestNameReply::from_u32(code).ok_or_else(|| {
        tracing::warn!(code, "protocol error: unknown RequestName reply code");
        Error::Protocol(format!("unknown RequestName reply code {}", code))
    })?;
    if matches!(outcome, RequestNameReply::PrimaryOwner | RequestNameReply::AlreadyOwner) {
        inner.owned_names.borrow_mut().insert(name.to_owned());
    }
    Ok(outcome)
}

pub async fn release_name(inner: &Rc<ConnectionInner>, name: &str) -> Result<ReleaseNameReply> {
    let msg = Message::method_call(
        fdo::BUS_PATH,
        Some(fdo::BUS_INTERFACE),
        Some(fdo::BUS_DESTINATION),
        fdo::member::RELEASE_NAME,
        vec![Value::Str(name.to_owned())],
    );
    let (_, rx) = inner.send_with_reply(msg).await?;
    let reply = inner
        .recv(&rx)
        .await?
        .map_err(Error::from)?;
    let code = reply.get(0).and_then(Value::as_u32).ok_or_else(|| {
        tracing::warn!(body = ?reply, "protocol error: ReleaseName did not return a u32");
        Error::Protocol("ReleaseName did not return a u32".into())
    })?;
    let outcome = ReleaseNameReply::from_u32(code).ok_or_else(|| {
        tracing::warn!(code, "protocol error: unknown ReleaseName reply code");
        Error::Protocol(format!("unknown ReleaseName reply code {}", code))
    })?;
    inner.owned_names.borrow_mut().remove(name);
    Ok(outcome)
}

/// Handle an inbound `NameAcquired` signal: record the owner mapping, add to
/// `owned_names`, and publish to the `name_acquired` broadcast channel.
pub fn on_name_acquired(inner: &Rc<ConnectionInner>, name: &str) {
    if let Some(unique) = inner.unique_name.get() {
        inner
            .name_owners
            .borrow_mut()
            .insert(name.to_owned(), unique.clone());
    }
    inner.owned_names.borrow_mut().insert(name.to_owned());
    tracing::debug!(name, "NameAcquired");
    let _ = inner.name_acquired_tx.try_broadcast(name.to_owned());
}

/// Handle an inbound `NameLost` signal: evict the owner mapping and `owned_names` entry,
/// and publish to the `name_lost` broadcast channel.
pub fn on_name_lost(inner: &Rc<ConnectionInner>, name: &str) {
    inner.name_owners.borrow_mut().remove(name);
    inner.owned_names.borrow_mut().remove(name);
    tracing::debug!(name, "NameLost");
    let _ = inner.name_lost_tx.try_broadcast(name.to_owned());
}

/// Handle an inbound `NameOwnerChanged` signal: evict if `new_owner` is empty, otherwise
/// update the owner cache.
pub fn on_name_owner_changed(inner: &Rc<ConnectionInner>, name: &str, new_owner: &str) {
    if new_owner.is_empty() {
        inner.name_owners.borrow_mut().remove(name);
    } else {
        inner
            .name_owners
            .borrow_mut()
            .insert(name.to_owned(), new_owner.to_owned());
    }
}

pub async fn get_name_owner(inner: &Rc<ConnectionInner>, name: &str) -> Result<String> {
    if let Some(owner) = inner.name_owners.borrow().get(name) {
        return Ok(owner.clone());
    }
    let msg = Message::method_call(
        fdo::BUS_PATH,
        Some(fdo::BUS_INTERFACE),
        Some(fdo::BUS_DESTINATION),
        fdo::member::GET_NAME_OWNER,
        vec![Value::Str(name.to_owned())],
    );
    let (_, rx) = inner.send_with_reply(msg).await?;
    let reply = inner
        .recv(&rx)
        .await?
        .map_err(Error::from)?;
    let owner = reply
        .get(0)
        .and_then(Value::as_str)
        .ok_or_else(|| {
            tracing::warn!(body = ?reply, "protocol error: GetNameOwner did not return a string");
            Error::Protocol("GetNameOwner did not return a string".into())
        })?
        .to_owned();
    inner
        .name_owners
        .borrow_mut()
        .insert(name.to_owned(), owner.clone());
    Ok(owner)
}

/// Fire-and-forget cache warm-up: spawn nothing (there's no executor here), just attempt
/// a best-effort lookup and swallow errors -- callers must not block on this.
pub async fn prime_name_owner_cache(inner: &Rc<ConnectionInner>, name: &str) {
    if inner.name_owners.borrow().contains_key(name) {
        return;
    }
    if let Err(e) = get_name_owner(inner, name).await {
        tracing::debug!(name, error = %e, "name-owner cache priming failed (non-fatal)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use std::os::unix::net::UnixStream;

    fn test_inner() -> Rc<ConnectionInner> {
        let (a, _b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let target = Address::UnixPath("test".into());
        let socket = async_io::Async::new(a).unwrap();
        ConnectionInner::with_socket("test".into(), target, Some(socket))
    }

    #[test]
    fn name_acquired_then_lost_restores_state() {
        let inner = test_inner();
        inner.unique_name.set(":1.1".into()).unwrap();
        on_name_acquired(&inner, "org.example.Svc");
        assert!(inner.owned_names.borrow().contains("org.example.Svc"));
        assert_eq!(
            inner.name_owners.borrow().get("org.example.Svc").cloned(),
            Some(":1.1".into())
        );

        on_name_lost(&inner, "org.example.Svc");
        assert!(!inner.owned_names.borrow().contains("org.example.Svc"));
        assert!(!inner.name_owners.borrow().contains_key("org.example.Svc"));
    }

    #[test]
    fn name_owner_changed_with_empty_new_owner_evicts() {
        let inner = test_inner();
        inner
            .name_owners
            .borrow_mut()
            .insert("org.example.Svc".into(), ":1.2".into());
        on_name_owner_changed(&inner, "org.example.Svc", "");
        assert!(!inner.name_owners.borrow().contains_key("org.example.Svc"));
    }

    #[test]
    fn name_owner_changed_with_new_owner_updates_cache() {
        let inner = test_inner();
        on_name_owner_changed(&inner, "org.example.Svc", ":1.3");
        assert_eq!(
            inner.name_owners.borrow().get("org.example.Svc").cloned(),
            Some(":1.3".into())
        );
    }
}
