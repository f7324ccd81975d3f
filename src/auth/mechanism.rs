//! The SASL mechanisms: EXTERNAL, ANONYMOUS and DBUS_COOKIE_SHA1.

use rand::RngCore;
use sha1::{Digest, Sha1};

use super::cookie::Keyring;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechanismKind {
    External,
    Anonymous,
    CookieSha1,
}

impl MechanismKind {
    pub fn name(self) -> &'static str {
        match self {
            MechanismKind::External => "EXTERNAL",
            MechanismKind::Anonymous => "ANONYMOUS",
            MechanismKind::CookieSha1 => "DBUS_COOKIE_SHA1",
        }
    }

    pub fn from_name(name: &str) -> Option<MechanismKind> {
        match name {
            "EXTERNAL" => Some(MechanismKind::External),
            "ANONYMOUS" => Some(MechanismKind::Anonymous),
            "DBUS_COOKIE_SHA1" => Some(MechanismKind::CookieSha1),
            _ => None,
        }
    }
}

/// What the client mechanism wants sent next.
#[derive(Debug, PartialEq, Eq)]
pub enum MechMsg {
    /// Send this and stay in the data exchange.
    Continue(Vec<u8>),
    /// Send this and expect the server's OK.
    Ok(Vec<u8>),
    /// Report this to the server and stay.
    Error(String),
}

fn current_uid_bytes() -> Vec<u8> {
    nix::unistd::Uid::effective().as_raw().to_string().into_bytes()
}

fn random_hex_16() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `hex(SHA1(server_rand ":" client_rand ":" cookie))` — the proof both
/// sides compute.
pub fn cookie_sha1_digest(server_rand: &str, client_rand: &str, cookie: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(server_rand.as_bytes());
    hasher.update(b":");
    hasher.update(client_rand.as_bytes());
    hasher.update(b":");
    hasher.update(cookie.as_bytes());
    hex::encode(hasher.finalize())
}

/// Client half of a mechanism.  A closed set; the auth engine drives it
/// through `init` and `data`.
pub enum ClientMechanism {
    External,
    Anonymous,
    CookieSha1 { keyring: Keyring },
}

impl ClientMechanism {
    pub fn new(kind: MechanismKind) -> std::io::Result<ClientMechanism> {
        Ok(match kind {
            MechanismKind::External => ClientMechanism::External,
            MechanismKind::Anonymous => ClientMechanism::Anonymous,
            MechanismKind::CookieSha1 => ClientMechanism::CookieSha1 {
                keyring: Keyring::with_default_dir()?,
            },
        })
    }

    pub fn kind(&self) -> MechanismKind {
        match *self {
            ClientMechanism::External => MechanismKind::External,
            ClientMechanism::Anonymous => MechanismKind::Anonymous,
            ClientMechanism::CookieSha1 { .. } => MechanismKind::CookieSha1,
        }
    }

    /// Initial data for the AUTH line.
    pub fn init(&mut self) -> Option<Vec<u8>> {
        match *self {
            ClientMechanism::External => Some(current_uid_bytes()),
            ClientMechanism::Anonymous => Some(env!("CARGO_PKG_NAME").as_bytes().to_vec()),
            ClientMechanism::CookieSha1 { .. } => Some(current_uid_bytes()),
        }
    }

    /// React to a DATA challenge from the server.
    pub async fn data(&mut self, challenge: &[u8]) -> MechMsg {
        match *self {
            ClientMechanism::External | ClientMechanism::Anonymous => {
                MechMsg::Error("mechanism expects no data".to_string())
            }
            ClientMechanism::CookieSha1 { ref keyring } => {
                cookie_sha1_respond(keyring, challenge).await
            }
        }
    }
}

async fn cookie_sha1_respond(keyring: &Keyring, challenge: &[u8]) -> MechMsg {
    let text = match std::str::from_utf8(challenge) {
        Ok(t) => t,
        Err(_) => return MechMsg::Error("challenge is not UTF-8".to_string()),
    };
    let mut fields = text.split_whitespace();
    let (context, id, server_rand) = match (fields.next(), fields.next(), fields.next()) {
        (Some(c), Some(i), Some(r)) => (c, i, r),
        _ => return MechMsg::Error("challenge needs three fields".to_string()),
    };
    let id: u32 = match id.parse() {
        Ok(id) => id,
        Err(_) => return MechMsg::Error("challenge id is not numeric".to_string()),
    };
    let cookie = match keyring.lookup(context, id).await {
        Ok(Some(c)) => c,
        Ok(None) => return MechMsg::Error("no such cookie".to_string()),
        Err(e) => return MechMsg::Error(format!("keyring: {e}")),
    };
    let client_rand = random_hex_16();
    let digest = cookie_sha1_digest(server_rand, &client_rand, &cookie.value);
    MechMsg::Ok(format!("{client_rand} {digest}").into_bytes())
}

/// Result of one server-side mechanism step.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerStep {
    /// Authentication concluded; `uid` is the verified identity if the
    /// mechanism establishes one.
    Ok { uid: Option<u32> },
    /// Send this challenge and wait for more data.
    Challenge(Vec<u8>),
    /// The proof failed.
    Reject,
}

/// Server half of a mechanism.
pub enum ServerMechanism {
    External { peer_uid: Option<u32> },
    Anonymous,
    CookieSha1(CookieSha1Server),
}

pub struct CookieSha1Server {
    keyring: Keyring,
    pending: Option<CookiePending>,
}

struct CookiePending {
    uid: u32,
    server_rand: String,
    cookie: String,
}

impl ServerMechanism {
    pub fn new(kind: MechanismKind, peer_uid: Option<u32>) -> std::io::Result<ServerMechanism> {
        Ok(match kind {
            MechanismKind::External => ServerMechanism::External { peer_uid },
            MechanismKind::Anonymous => ServerMechanism::Anonymous,
            MechanismKind::CookieSha1 => ServerMechanism::CookieSha1(CookieSha1Server {
                keyring: Keyring::with_default_dir()?,
                pending: None,
            }),
        })
    }

    #[cfg(test)]
    pub fn cookie_sha1_with_keyring(keyring: Keyring) -> ServerMechanism {
        ServerMechanism::CookieSha1(CookieSha1Server {
            keyring,
            pending: None,
        })
    }

    /// Handle the initial data on the AUTH line.
    pub async fn initial(&mut self, data: Option<&[u8]>) -> ServerStep {
        match *self {
            ServerMechanism::External { peer_uid } => {
                let claimed = match data.and_then(parse_uid) {
                    Some(uid) => uid,
                    None => return ServerStep::Reject,
                };
                match peer_uid {
                    Some(actual) if actual == claimed => ServerStep::Ok { uid: Some(claimed) },
                    _ => ServerStep::Reject,
                }
            }
            // The optional trace string is ignored.
            ServerMechanism::Anonymous => ServerStep::Ok { uid: None },
            ServerMechanism::CookieSha1(ref mut srv) => {
                let uid = match data.and_then(parse_uid) {
                    Some(uid) => uid,
                    None => return ServerStep::Reject,
                };
                let cookie = match srv.keyring.get_or_create(super::cookie::DEFAULT_CONTEXT).await
                {
                    Ok(c) => c,
                    Err(_) => return ServerStep::Reject,
                };
                let server_rand = random_hex_16();
                let challenge = format!(
                    "{} {} {}",
                    super::cookie::DEFAULT_CONTEXT,
                    cookie.id,
                    server_rand
                );
                srv.pending = Some(CookiePending {
                    uid,
                    server_rand,
                    cookie: cookie.value,
                });
                ServerStep::Challenge(challenge.into_bytes())
            }
        }
    }

    /// Handle a DATA reply from the client.
    pub async fn data(&mut self, data: &[u8]) -> ServerStep {
        match *self {
            ServerMechanism::External { .. } | ServerMechanism::Anonymous => ServerStep::Reject,
            ServerMechanism::CookieSha1(ref mut srv) => {
                let pending = match srv.pending.take() {
                    Some(p) => p,
                    None => return ServerStep::Reject,
                };
                let text = match std::str::from_utf8(data) {
                    Ok(t) => t,
                    Err(_) => return ServerStep::Reject,
                };
                let mut fields = text.split_whitespace();
                let (client_rand, digest) = match (fields.next(), fields.next()) {
                    (Some(r), Some(d)) => (r, d),
                    _ => return ServerStep::Reject,
                };
                let expected = cookie_sha1_digest(&pending.server_rand, client_rand, &pending.cookie);
                if expected == digest {
                    ServerStep::Ok {
                        uid: Some(pending.uid),
                    }
                } else {
                    ServerStep::Reject
                }
            }
        }
    }
}

fn parse_uid(data: &[u8]) -> Option<u32> {
    std::str::from_utf8(data).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cookie_sha1_digest() {
        // The proof is hex(SHA1("<server>:<client>:<cookie>")).
        let server = "abcdef0123456789";
        let client = "00112233445566778899aabbccddeeff";
        let digest = cookie_sha1_digest(server, client, "c0ffee");
        let mut hasher = Sha1::new();
        hasher.update(format!("{server}:{client}:c0ffee").as_bytes());
        assert_eq!(digest, hex::encode(hasher.finalize()));
        assert_eq!(digest.len(), 40);
    }

    #[tokio::test]
    async fn test_cookie_sha1_exchange() {
        let tmp = tempfile::tempdir().unwrap();
        let server_keyring = Keyring::new(tmp.path().join("keyrings"));
        let client_keyring = Keyring::new(tmp.path().join("keyrings"));

        let mut server = ServerMechanism::cookie_sha1_with_keyring(server_keyring);
        let challenge = match server.initial(Some(b"1000")).await {
            ServerStep::Challenge(c) => c,
            other => panic!("expected a challenge, got {other:?}"),
        };

        let mut client = ClientMechanism::CookieSha1 {
            keyring: client_keyring,
        };
        let response = match client.data(&challenge).await {
            MechMsg::Ok(r) => r,
            other => panic!("expected a response, got {other:?}"),
        };

        assert_eq!(
            server.data(&response).await,
            ServerStep::Ok { uid: Some(1000) }
        );
    }

    #[tokio::test]
    async fn test_cookie_sha1_bad_proof() {
        let tmp = tempfile::tempdir().unwrap();
        let keyring = Keyring::new(tmp.path().join("keyrings"));
        let mut server = ServerMechanism::cookie_sha1_with_keyring(keyring);
        let _ = match server.initial(Some(b"1")).await {
            ServerStep::Challenge(c) => c,
            other => panic!("expected a challenge, got {other:?}"),
        };
        let bogus = format!("{} {}", "00".repeat(16), "11".repeat(20));
        assert_eq!(server.data(bogus.as_bytes()).await, ServerStep::Reject);
    }

    #[tokio::test]
    async fn test_external_verifies_peer() {
        let mut mech = ServerMechanism::External {
            peer_uid: Some(1000),
        };
        assert_eq!(
            mech.initial(Some(b"1000")).await,
            ServerStep::Ok { uid: Some(1000) }
        );

        let mut mech = ServerMechanism::External {
            peer_uid: Some(1000),
        };
        assert_eq!(mech.initial(Some(b"0")).await, ServerStep::Reject);
        assert_eq!(mech.initial(None).await, ServerStep::Reject);
        assert_eq!(mech.initial(Some(b"many")).await, ServerStep::Reject);
    }

    #[test]
    fn test_external_initial_data_is_uid() {
        let mut mech = ClientMechanism::External;
        let data = mech.init().unwrap();
        let uid: u32 = std::str::from_utf8(&data).unwrap().parse().unwrap();
        assert_eq!(uid, nix::unistd::Uid::effective().as_raw());
    }

    #[test]
    fn test_names() {
        for kind in [
            MechanismKind::External,
            MechanismKind::Anonymous,
            MechanismKind::CookieSha1,
        ] {
            assert_eq!(MechanismKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(MechanismKind::from_name("KERBEROS_V4"), None);
    }
}
