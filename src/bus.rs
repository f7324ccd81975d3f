//! Client for the message bus itself: the `org.freedesktop.DBus` calls and
//! the bookkeeping around acquired names.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{debug, warn};

use crate::address;
use crate::auth::AuthConfig;
use crate::connection::{Connection, SignalStream};
use crate::error::Error;
use crate::match_rule::MatchRule;
use crate::message::{create_method_call, Message, MESSAGE_TYPE_SIGNAL};
use crate::types::{BasicValue, TypeMismatch, Value};

pub const BUS_NAME: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

pub const NAME_FLAG_ALLOW_REPLACEMENT: u32 = 1;
pub const NAME_FLAG_REPLACE_EXISTING: u32 = 2;
pub const NAME_FLAG_DO_NOT_QUEUE: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestNameReply {
    PrimaryOwner,
    InQueue,
    Exists,
    AlreadyOwner,
    Unknown(u32),
}

impl From<u32> for RequestNameReply {
    fn from(x: u32) -> Self {
        match x {
            1 => RequestNameReply::PrimaryOwner,
            2 => RequestNameReply::InQueue,
            3 => RequestNameReply::Exists,
            4 => RequestNameReply::AlreadyOwner,
            other => RequestNameReply::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseNameReply {
    Released,
    NonExistent,
    NotOwner,
    Unknown(u32),
}

impl From<u32> for ReleaseNameReply {
    fn from(x: u32) -> Self {
        match x {
            1 => ReleaseNameReply::Released,
            2 => ReleaseNameReply::NonExistent,
            3 => ReleaseNameReply::NotOwner,
            other => ReleaseNameReply::Unknown(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartServiceReply {
    Started,
    AlreadyRunning,
    Unknown(u32),
}

impl From<u32> for StartServiceReply {
    fn from(x: u32) -> Self {
        match x {
            1 => StartServiceReply::Started,
            2 => StartServiceReply::AlreadyRunning,
            other => StartServiceReply::Unknown(other),
        }
    }
}

/// A connection attached to a message bus.  `Hello` has been exchanged and
/// the unique name is known; acquired well-known names are tracked from
/// `NameAcquired`/`NameLost`.
pub struct BusConnection {
    conn: Connection,
    unique_name: String,
    names: Arc<StdMutex<HashSet<String>>>,
}

impl BusConnection {
    /// Attach to the session bus (`DBUS_SESSION_BUS_ADDRESS`).
    pub async fn connect_session() -> Result<BusConnection, Error> {
        BusConnection::connect(&address::session_bus_address()).await
    }

    /// Attach to the system bus (`DBUS_SYSTEM_BUS_ADDRESS` or its default).
    pub async fn connect_system() -> Result<BusConnection, Error> {
        BusConnection::connect(&address::system_bus_address()).await
    }

    pub async fn connect(addresses: &str) -> Result<BusConnection, Error> {
        BusConnection::connect_with_config(addresses, &AuthConfig::default()).await
    }

    pub async fn connect_with_config(
        addresses: &str,
        config: &AuthConfig,
    ) -> Result<BusConnection, Error> {
        let conn = Connection::open_with_config(addresses, config).await?;
        BusConnection::with_connection(conn).await
    }

    /// Say `Hello` on an already-open connection and start name tracking.
    /// `Hello` must succeed before any other bus call.
    pub async fn with_connection(conn: Connection) -> Result<BusConnection, Error> {
        let acquired = conn.subscribe(
            MatchRule::new()
                .msg_type(MESSAGE_TYPE_SIGNAL)
                .interface(BUS_INTERFACE)
                .member("NameAcquired"),
        );
        let lost = conn.subscribe(
            MatchRule::new()
                .msg_type(MESSAGE_TYPE_SIGNAL)
                .interface(BUS_INTERFACE)
                .member("NameLost"),
        );

        let reply = conn
            .call(create_method_call(BUS_NAME, BUS_PATH, BUS_INTERFACE, "Hello")?)
            .await?;
        let unique_name = first_string(&body_of(&reply)?)?;
        debug!(%unique_name, "attached to message bus");

        let names = Arc::new(StdMutex::new(HashSet::new()));
        tokio::spawn(track_names(acquired, lost, names.clone()));

        Ok(BusConnection {
            conn,
            unique_name,
            names,
        })
    }

    /// The bus-assigned unique name, e.g. `:1.42`.
    pub fn unique_name(&self) -> &str {
        &self.unique_name
    }

    /// Well-known names currently held, per the bus's own signals.
    pub fn owned_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .names
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn close(&self) {
        self.conn.close().await;
    }

    async fn bus_call(&self, member: &str, args: &[Value]) -> Result<Vec<Value>, Error> {
        let mut msg = create_method_call(BUS_NAME, BUS_PATH, BUS_INTERFACE, member)?;
        for arg in args {
            msg = msg.add_arg(arg);
        }
        let reply = self.conn.call(msg).await?;
        body_of(&reply)
    }

    pub async fn request_name(
        &self,
        name: &str,
        flags: u32,
    ) -> Result<RequestNameReply, Error> {
        let body = self
            .bus_call("RequestName", &[Value::from(name), Value::from(flags)])
            .await?;
        Ok(RequestNameReply::from(first_u32(&body)?))
    }

    pub async fn release_name(&self, name: &str) -> Result<ReleaseNameReply, Error> {
        let body = self.bus_call("ReleaseName", &[Value::from(name)]).await?;
        Ok(ReleaseNameReply::from(first_u32(&body)?))
    }

    pub async fn start_service_by_name(
        &self,
        name: &str,
        flags: u32,
    ) -> Result<StartServiceReply, Error> {
        let body = self
            .bus_call("StartServiceByName", &[Value::from(name), Value::from(flags)])
            .await?;
        Ok(StartServiceReply::from(first_u32(&body)?))
    }

    pub async fn name_has_owner(&self, name: &str) -> Result<bool, Error> {
        let body = self.bus_call("NameHasOwner", &[Value::from(name)]).await?;
        first_bool(&body)
    }

    pub async fn list_names(&self) -> Result<Vec<String>, Error> {
        let body = self.bus_call("ListNames", &[]).await?;
        string_array(&body)
    }

    pub async fn list_activatable_names(&self) -> Result<Vec<String>, Error> {
        let body = self.bus_call("ListActivatableNames", &[]).await?;
        string_array(&body)
    }

    /// Fails with the bus's `NameHasNoOwner` error when nobody owns `name`.
    pub async fn get_name_owner(&self, name: &str) -> Result<String, Error> {
        let body = self.bus_call("GetNameOwner", &[Value::from(name)]).await?;
        first_string(&body)
    }

    pub async fn list_queued_owners(&self, name: &str) -> Result<Vec<String>, Error> {
        let body = self
            .bus_call("ListQueuedOwners", &[Value::from(name)])
            .await?;
        string_array(&body)
    }

    pub async fn add_match(&self, rule: &MatchRule) -> Result<(), Error> {
        self.bus_call("AddMatch", &[Value::from(rule.serialize())])
            .await?;
        Ok(())
    }

    pub async fn remove_match(&self, rule: &MatchRule) -> Result<(), Error> {
        self.bus_call("RemoveMatch", &[Value::from(rule.serialize())])
            .await?;
        Ok(())
    }

    /// Install `rule` on the bus and route the matching signals locally.
    pub async fn subscribe(&self, rule: MatchRule) -> Result<SignalStream, Error> {
        let stream = self.conn.subscribe(rule.clone());
        self.add_match(&rule).await?;
        Ok(stream)
    }

    pub async fn get_id(&self) -> Result<String, Error> {
        let body = self.bus_call("GetId", &[]).await?;
        first_string(&body)
    }

    pub async fn get_connection_unix_user(&self, name: &str) -> Result<u32, Error> {
        let body = self
            .bus_call("GetConnectionUnixUser", &[Value::from(name)])
            .await?;
        first_u32(&body)
    }

    pub async fn get_connection_unix_process_id(&self, name: &str) -> Result<u32, Error> {
        let body = self
            .bus_call("GetConnectionUnixProcessID", &[Value::from(name)])
            .await?;
        first_u32(&body)
    }
}

async fn track_names(
    mut acquired: SignalStream,
    mut lost: SignalStream,
    names: Arc<StdMutex<HashSet<String>>>,
) {
    loop {
        tokio::select! {
            sig = acquired.recv() => match sig {
                Some(msg) => {
                    if let Some(name) = signal_name_arg(&msg) {
                        debug!(%name, "name acquired");
                        names.lock().unwrap_or_else(|e| e.into_inner()).insert(name);
                    }
                }
                None => return,
            },
            sig = lost.recv() => match sig {
                Some(msg) => {
                    if let Some(name) = signal_name_arg(&msg) {
                        debug!(%name, "name lost");
                        names.lock().unwrap_or_else(|e| e.into_inner()).remove(&name);
                    }
                }
                None => return,
            },
        }
    }
}

fn signal_name_arg(msg: &Message) -> Option<String> {
    match msg.get_body() {
        Ok(Some(body)) => match body.into_iter().next() {
            Some(Value::BasicValue(BasicValue::String(s))) => Some(s),
            _ => {
                warn!("name signal with a non-string body");
                None
            }
        },
        _ => None,
    }
}

fn body_of(msg: &Message) -> Result<Vec<Value>, Error> {
    Ok(msg.get_body()?.unwrap_or_default())
}

fn mismatch(expected: &str, body: &[Value]) -> Error {
    Error::TypeMismatch(TypeMismatch::Mismatch {
        expected: expected.to_string(),
        found: body
            .iter()
            .map(|v| v.get_type().to_signature())
            .collect::<String>(),
    })
}

fn first_string(body: &[Value]) -> Result<String, Error> {
    match body.first() {
        Some(Value::BasicValue(BasicValue::String(s))) => Ok(s.clone()),
        _ => Err(mismatch("s", body)),
    }
}

fn first_u32(body: &[Value]) -> Result<u32, Error> {
    match body.first() {
        Some(Value::BasicValue(BasicValue::Uint32(x))) => Ok(*x),
        _ => Err(mismatch("u", body)),
    }
}

fn first_bool(body: &[Value]) -> Result<bool, Error> {
    match body.first() {
        Some(Value::BasicValue(BasicValue::Boolean(b))) => Ok(*b),
        _ => Err(mismatch("b", body)),
    }
}

fn string_array(body: &[Value]) -> Result<Vec<String>, Error> {
    match body.first() {
        Some(Value::Array(arr)) if arr.element_signature.0 == "s" => {
            let mut out = Vec::with_capacity(arr.objects.len());
            for v in &arr.objects {
                match *v {
                    Value::BasicValue(BasicValue::String(ref s)) => out.push(s.clone()),
                    _ => return Err(mismatch("as", body)),
                }
            }
            Ok(out)
        }
        _ => Err(mismatch("as", body)),
    }
}
