use std::rc::Rc;

use crate::fdo;
use crate::message::Message;
use crate::value::Value;
use crate::{Error, Result};

use super::inner::ConnectionInner;

/// Filter fields for a signal subscription. Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalFilter {
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub path: Option<String>,
    pub path_namespace: Option<String>,
}

impl SignalFilter {
    /// The bus match-rule string this filter derives, e.g.
    /// `type='signal',interface='org.example.Iface'`.
    pub fn match_rule(&self) -> String {
        let mut rule = String::from("type='signal'");
        if let Some(s) = &self.sender {
            rule.push_str(&format!(",sender='{}'", s));
        }
        if let Some(i) = &self.interface {
            rule.push_str(&format!(",interface='{}'", i));
        }
        if let Some(m) = &self.member {
            rule.push_str(&format!(",member='{}'", m));
        }
        if let Some(p) = &self.path {
            rule.push_str(&format!(",path='{}'", p));
        }
        if let Some(ns) = &self.path_namespace {
            rule.push_str(&format!(",path_namespace='{}'", ns));
        }
        rule
    }
}

/// A delivered signal: sender/path/interface/member plus its typed body.
#[derive(Debug, Clone)]
pub struct Signal {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub body: Vec<Value>,
}

pub struct SubscriptionEntry {
    pub filter: SignalFilter,
    pub rule: String,
    pub sender: async_channel::Sender<Signal>,
}

/// Handle returned to callers by `subscribe_signals`. Dropping it (without calling
/// [`cancel`](SignalSubscription::cancel)) still releases the match rule, just lazily --
/// the actual `RemoveMatch` call is queued and flushed the next time the connection is
/// driven.
pub struct SignalSubscription {
    pub(super) inner: Rc<ConnectionInner>,
    pub(super) entry: Rc<SubscriptionEntry>,
    pub(super) receiver: async_channel::Receiver<Signal>,
}

impl SignalSubscription {
    pub async fn recv(&self) -> Option<Signal> {
        self.inner.recv(&self.receiver).await.ok()
    }

    /// Cancel the subscription, synchronously issuing `RemoveMatch` if this was the last
    /// subscription sharing its rule.
    pub async fn cancel(self) -> Result<()> {
        let rule = remove_subscription(&self.inner, &self.entry);
        if let Some(rule) = rule {
            remove_match(&self.inner, &rule).await?;
        }
        Ok(())
    }
}

impl Drop for SignalSubscription {
    fn drop(&mut self) {
        if let Some(rule) = remove_subscription(&self.inner, &self.entry) {
            self.inner.pending_match_removals.borrow_mut().push(rule);
        }
    }
}

/// Remove `entry` from the subscription list and decrement its rule's refcount. Returns
/// the rule string if this was the last subscriber (refcount hit zero), signaling the
/// caller must issue `RemoveMatch`.
fn remove_subscription(inner: &Rc<ConnectionInner>, entry: &Rc<SubscriptionEntry>) -> Option<String> {
    inner
        .subscriptions
        .borrow_mut()
        .retain(|e| !Rc::ptr_eq(e, entry));

    let mut refs = inner.match_rule_refs.borrow_mut();
    match refs.get_mut(&entry.rule) {
        Some(count) if *count > 1 => {
            *count -= 1;
            None
        }
        Some(_) => {
            refs.remove(&entry.rule);
            Some(entry.rule.clone())
        }
        None => None,
    }
}

/// Register a new subscription for `filter`, issuing `AddMatch` if this is the first
/// subscriber for the derived rule.
pub async fn subscribe(
    inner: &Rc<ConnectionInner>,
    filter: SignalFilter,
) -> Result<SignalSubscription> {
    let rule = filter.match_rule();
    let is_first = {
        let mut refs = inner.match_rule_refs.borrow_mut();
        let count = refs.entry(rule.clone()).or_insert(0);
        *count += 1;
        *count == 1
    };
    if is_first {
        if let Err(e) = add_match(inner, &rule).await {
            let mut refs = inner.match_rule_refs.borrow_mut();
            refs.remove(&rule);
            return Err(e);
        }
    }

    let (tx, rx) = async_channel::bounded(64);
    let entry = Rc::new(SubscriptionEntry {
        filter,
        rule,
        sender: tx,
    });
    inner.subscriptions.borrow_mut().push(entry.clone());

    Ok(SignalSubscription {
        inner: inner.clone(),
        entry,
        receiver: rx,
    })
}

async fn add_match(inner: &Rc<ConnectionInner>, rule: &str) -> Result<()> {
    call_bus_match(inner, fdo::member::ADD_MATCH, rule).await
}

pub(super) async fn remove_match(inner: &Rc<ConnectionInner>, rule: &str) -> Result<()> {
    call_bus_match(inner, fdo::member::REMOVE_MATCH, rule).await
}

async fn call_bus_match(inner: &Rc<ConnectionInner>, member: &str, rule: &str) -> Result<()> {
    let msg = Message::method_call(
        fdo::BUS_PATH,
        Some(fdo::BUS_INTERFACE),
        Some(fdo::BUS_DESTINATION),
        member,
        vec![Value::Str(rule.to_owned())],
    );
    let (_, rx) = inner.send_with_reply(msg).await?;
    inner
        .recv(&rx)
        .await?
        .map(|_| ())
        .map_err(Error::from)
}

/// Flush any match rules queued for removal by a dropped (not explicitly cancelled)
/// subscription. Called opportunistically whenever the connection is driven.
pub async fn flush_pending_removals(inner: &Rc<ConnectionInner>) -> Result<()> {
    let rules: Vec<String> = inner.pending_match_removals.borrow_mut().drain(..).collect();
    for rule in rules {
        tracing::debug!(rule = %rule, "flushing queued RemoveMatch");
        remove_match(inner, &rule).await?;
    }
    Ok(())
}

/// Does `filter` match this inbound signal? `sender` has already been resolved from a
/// well-known name to a unique name by the caller when possible.
pub fn matches(filter: &SignalFilter, resolved_sender: Option<&str>, signal: &Signal) -> bool {
    if let Some(want) = &filter.sender {
        if resolved_sender.unwrap_or(want.as_str()) != signal.sender.as_deref().unwrap_or("") {
            return false;
        }
    }
    if let Some(want) = &filter.interface {
        if signal.interface.as_deref() != Some(want.as_str()) {
            return false;
        }
    }
    if let Some(want) = &filter.member {
        if signal.member.as_deref() != Some(want.as_str()) {
            return false;
        }
    }
    if let Some(want) = &filter.path {
        if signal.path.as_deref() != Some(want.as_str()) {
            return false;
        }
    }
    if let Some(ns) = &filter.path_namespace {
        match &signal.path {
            Some(path) if path == ns => {}
            Some(path) if path.starts_with(ns.as_str()) && path[ns.len()..].starts_with('/') => {}
            _ => return false,
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_rule_omits_unset_filters() {
        let filter = SignalFilter {
            interface: Some("org.example.Iface".into()),
            ..Default::default()
        };
        assert_eq!(filter.match_rule(), "type='signal',interface='org.example.Iface'");
    }

    #[test]
    fn match_rule_includes_all_set_filters_in_order() {
        let filter = SignalFilter {
            sender: Some(":1.1".into()),
            interface: Some("org.example.Iface".into()),
            member: Some("Tick".into()),
            path: Some("/o".into()),
            path_namespace: None,
        };
        assert_eq!(
            filter.match_rule(),
            "type='signal',sender=':1.1',interface='org.example.Iface',member='Tick',path='/o'"
        );
    }

    fn sample_signal() -> Signal {
        Signal {
            sender: Some(":1.9".into()),
            path: Some("/a/b".into()),
            interface: Some("org.example.Iface".into()),
            member: Some("Tick".into()),
            body: vec![],
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = SignalFilter::default();
        assert!(matches(&filter, None, &sample_signal()));
    }

    #[test]
    fn member_mismatch_fails() {
        let filter = SignalFilter {
            member: Some("Tock".into()),
            ..Default::default()
        };
        assert!(!matches(&filter, None, &sample_signal()));
    }

    #[test]
    fn path_namespace_matches_descendant() {
        let filter = SignalFilter {
            path_namespace: Some("/a".into()),
            ..Default::default()
        };
        assert!(matches(&filter, None, &sample_signal()));
    }

    #[test]
    fn path_namespace_does_not_match_sibling_prefix() {
        let filter = SignalFilter {
            path_namespace: Some("/a/bc".into()),
            ..Default::default()
        };
        assert!(!matches(&filter, None, &sample_signal()));
    }

    #[test]
    fn sender_filter_uses_resolved_unique_name() {
        let filter = SignalFilter {
            sender: Some("org.example.WellKnown".into()),
            ..Default::default()
        };
        assert!(matches(&filter, Some(":1.9"), &sample_signal()));
        assert!(!matches(&filter, Some(":1.999"), &sample_signal()));
    }
}
