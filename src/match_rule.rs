//! Match rules: subscription predicates for bus signals.
//!
//! A rule serializes to the comma-joined, single-quoted string the bus
//! accepts in `AddMatch`, and doubles as the in-process predicate the
//! dispatcher evaluates for local signal routing.

use thiserror::Error;

use crate::message::{
    Message, MessageType, MESSAGE_TYPE_ERROR, MESSAGE_TYPE_METHOD_CALL,
    MESSAGE_TYPE_METHOD_RETURN, MESSAGE_TYPE_SIGNAL,
};
use crate::types::{BasicValue, Value};

/// `argN` and `argNpath` accept N in 0..=63.
pub const MAX_ARG_INDEX: u8 = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MatchRuleError {
    #[error("arg index {0} is out of the 0..=63 range")]
    ArgIndexOutOfRange(u8),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchRule {
    msg_type: Option<MessageType>,
    sender: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    path: Option<String>,
    path_namespace: Option<String>,
    destination: Option<String>,
    args: Vec<(u8, String)>,
    arg_paths: Vec<(u8, String)>,
    arg0_namespace: Option<String>,
}

impl MatchRule {
    pub fn new() -> MatchRule {
        MatchRule::default()
    }

    pub fn msg_type(mut self, t: MessageType) -> MatchRule {
        self.msg_type = Some(t);
        self
    }

    pub fn sender(mut self, sender: &str) -> MatchRule {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn interface(mut self, interface: &str) -> MatchRule {
        self.interface = Some(interface.to_string());
        self
    }

    pub fn member(mut self, member: &str) -> MatchRule {
        self.member = Some(member.to_string());
        self
    }

    pub fn path(mut self, path: &str) -> MatchRule {
        self.path = Some(path.to_string());
        self
    }

    /// Match object paths equal to `ns` or descending under it.
    pub fn path_namespace(mut self, ns: &str) -> MatchRule {
        self.path_namespace = Some(ns.to_string());
        self
    }

    pub fn destination(mut self, destination: &str) -> MatchRule {
        self.destination = Some(destination.to_string());
        self
    }

    /// Require the n-th body element to be exactly this string.
    pub fn arg(mut self, n: u8, value: &str) -> Result<MatchRule, MatchRuleError> {
        if n > MAX_ARG_INDEX {
            return Err(MatchRuleError::ArgIndexOutOfRange(n));
        }
        self.args.push((n, value.to_string()));
        Ok(self)
    }

    /// Require the n-th body element to be path-prefix-related to `value`:
    /// equal, or one is a `/`-terminated prefix of the other.
    pub fn arg_path(mut self, n: u8, value: &str) -> Result<MatchRule, MatchRuleError> {
        if n > MAX_ARG_INDEX {
            return Err(MatchRuleError::ArgIndexOutOfRange(n));
        }
        self.arg_paths.push((n, value.to_string()));
        Ok(self)
    }

    /// Require the first body element to be a name inside this namespace.
    pub fn arg0_namespace(mut self, ns: &str) -> MatchRule {
        self.arg0_namespace = Some(ns.to_string());
        self
    }

    /// The wire form the bus accepts in AddMatch.
    pub fn serialize(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = self.msg_type {
            parts.push(format!("type={}", quote(type_name(t))));
        }
        if let Some(ref s) = self.sender {
            parts.push(format!("sender={}", quote(s)));
        }
        if let Some(ref s) = self.interface {
            parts.push(format!("interface={}", quote(s)));
        }
        if let Some(ref s) = self.member {
            parts.push(format!("member={}", quote(s)));
        }
        if let Some(ref s) = self.path {
            parts.push(format!("path={}", quote(s)));
        }
        if let Some(ref s) = self.path_namespace {
            parts.push(format!("path_namespace={}", quote(s)));
        }
        if let Some(ref s) = self.destination {
            parts.push(format!("destination={}", quote(s)));
        }
        for (n, v) in &self.args {
            parts.push(format!("arg{n}={}", quote(v)));
        }
        for (n, v) in &self.arg_paths {
            parts.push(format!("arg{n}path={}", quote(v)));
        }
        if let Some(ref s) = self.arg0_namespace {
            parts.push(format!("arg0namespace={}", quote(s)));
        }
        parts.join(",")
    }

    /// Evaluate the conjunction of all predicates against one message.
    pub fn matches(&self, msg: &Message) -> bool {
        if let Some(t) = self.msg_type {
            if msg.message_type != t {
                return false;
            }
        }
        if !opt_eq(&self.sender, msg.sender()) {
            return false;
        }
        if !opt_eq(&self.interface, msg.interface()) {
            return false;
        }
        if !opt_eq(&self.member, msg.member()) {
            return false;
        }
        if !opt_eq(&self.path, msg.path()) {
            return false;
        }
        if !opt_eq(&self.destination, msg.destination()) {
            return false;
        }
        if let Some(ref ns) = self.path_namespace {
            match msg.path() {
                Some(path) if path_in_namespace(ns, path) => {}
                _ => return false,
            }
        }

        if self.args.is_empty() && self.arg_paths.is_empty() && self.arg0_namespace.is_none() {
            return true;
        }
        let body = match msg.get_body() {
            Ok(Some(body)) => body,
            _ => return false,
        };
        for (n, expected) in &self.args {
            match body.get(*n as usize) {
                Some(Value::BasicValue(BasicValue::String(s))) if s == expected => {}
                _ => return false,
            }
        }
        for (n, expected) in &self.arg_paths {
            let actual = match body.get(*n as usize) {
                Some(Value::BasicValue(BasicValue::String(s))) => s.as_str(),
                Some(Value::BasicValue(BasicValue::ObjectPath(p))) => p.0.as_str(),
                _ => return false,
            };
            if !arg_path_related(expected, actual) {
                return false;
            }
        }
        if let Some(ref ns) = self.arg0_namespace {
            match body.first() {
                Some(Value::BasicValue(BasicValue::String(s)))
                    if s == ns || s.starts_with(&format!("{ns}.")) => {}
                _ => return false,
            }
        }
        true
    }
}

fn opt_eq(wanted: &Option<String>, actual: Option<&str>) -> bool {
    match *wanted {
        Some(ref w) => actual == Some(w.as_str()),
        None => true,
    }
}

fn type_name(t: MessageType) -> &'static str {
    match t {
        MESSAGE_TYPE_METHOD_CALL => "method_call",
        MESSAGE_TYPE_METHOD_RETURN => "method_return",
        MESSAGE_TYPE_ERROR => "error",
        MESSAGE_TYPE_SIGNAL => "signal",
        _ => "unknown",
    }
}

/// Single-quote a value; an embedded quote becomes `'\''`.
fn quote(v: &str) -> String {
    format!("'{}'", v.replace('\'', "'\\''"))
}

fn path_in_namespace(ns: &str, path: &str) -> bool {
    if ns == "/" || ns == path {
        return true;
    }
    path.strip_prefix(ns)
        .map(|rest| rest.starts_with('/'))
        .unwrap_or(false)
}

fn arg_path_related(a: &str, b: &str) -> bool {
    a == b
        || (a.ends_with('/') && b.starts_with(a))
        || (b.ends_with('/') && a.starts_with(b))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::message::create_signal;

    fn signal(path: &str, iface: &str, member: &str) -> Message {
        create_signal(path, iface, member).unwrap()
    }

    #[test]
    fn test_serialize() {
        let rule = MatchRule::new()
            .msg_type(MESSAGE_TYPE_SIGNAL)
            .sender("org.freedesktop.DBus")
            .interface("org.freedesktop.DBus")
            .member("NameOwnerChanged")
            .arg(0, "com.example")
            .unwrap();
        assert_eq!(
            rule.serialize(),
            "type='signal',sender='org.freedesktop.DBus',interface='org.freedesktop.DBus',\
             member='NameOwnerChanged',arg0='com.example'"
        );
    }

    #[test]
    fn test_serialize_quoting() {
        let rule = MatchRule::new().arg(0, "it's").unwrap();
        assert_eq!(rule.serialize(), r"arg0='it'\''s'");
    }

    #[test]
    fn test_arg_index_bound() {
        MatchRule::new().arg(63, "x").unwrap();
        assert_eq!(
            MatchRule::new().arg(64, "x").unwrap_err(),
            MatchRuleError::ArgIndexOutOfRange(64)
        );
        assert_eq!(
            MatchRule::new().arg_path(90, "/x").unwrap_err(),
            MatchRuleError::ArgIndexOutOfRange(90)
        );
    }

    #[test]
    fn test_basic_predicates() {
        let msg = signal("/org/example/Thing", "org.example.Iface", "Changed");
        assert!(MatchRule::new().matches(&msg));
        assert!(MatchRule::new()
            .msg_type(MESSAGE_TYPE_SIGNAL)
            .interface("org.example.Iface")
            .member("Changed")
            .path("/org/example/Thing")
            .matches(&msg));
        assert!(!MatchRule::new().member("Other").matches(&msg));
        assert!(!MatchRule::new()
            .msg_type(MESSAGE_TYPE_METHOD_CALL)
            .matches(&msg));
        assert!(!MatchRule::new().sender(":1.1").matches(&msg));
    }

    #[test]
    fn test_path_namespace() {
        let msg = signal("/org/example/Thing", "org.example.Iface", "Changed");
        assert!(MatchRule::new().path_namespace("/").matches(&msg));
        assert!(MatchRule::new().path_namespace("/org").matches(&msg));
        assert!(MatchRule::new()
            .path_namespace("/org/example/Thing")
            .matches(&msg));
        assert!(!MatchRule::new().path_namespace("/org/exam").matches(&msg));
        assert!(!MatchRule::new().path_namespace("/net").matches(&msg));
    }

    #[test]
    fn test_arg_matching() {
        let msg = signal("/x", "org.example.Iface", "Changed")
            .add_arg(&"com.example")
            .add_arg(&42u32)
            .add_arg(&"third");
        assert!(MatchRule::new().arg(0, "com.example").unwrap().matches(&msg));
        assert!(MatchRule::new().arg(2, "third").unwrap().matches(&msg));
        // A non-string argument never matches.
        assert!(!MatchRule::new().arg(1, "42").unwrap().matches(&msg));
        assert!(!MatchRule::new().arg(0, "com.other").unwrap().matches(&msg));
        assert!(!MatchRule::new().arg(9, "none").unwrap().matches(&msg));
    }

    #[test]
    fn test_arg0_namespace() {
        let msg = signal("/x", "org.example.Iface", "Changed").add_arg(&"com.example.backend");
        assert!(MatchRule::new().arg0_namespace("com.example").matches(&msg));
        assert!(MatchRule::new()
            .arg0_namespace("com.example.backend")
            .matches(&msg));
        assert!(!MatchRule::new().arg0_namespace("com.examp").matches(&msg));
    }

    #[test]
    fn test_arg_path() {
        let msg = signal("/x", "org.example.Iface", "Changed").add_arg(&"/aa/bb/");
        assert!(MatchRule::new().arg_path(0, "/aa/bb/").unwrap().matches(&msg));
        assert!(MatchRule::new()
            .arg_path(0, "/aa/bb/cc")
            .unwrap()
            .matches(&msg));
        assert!(MatchRule::new().arg_path(0, "/aa/").unwrap().matches(&msg));
        assert!(!MatchRule::new().arg_path(0, "/aa/b").unwrap().matches(&msg));
    }
}
