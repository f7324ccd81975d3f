//! The SASL-style line protocol that precedes any binary D-Bus traffic.
//!
//! Every line is ASCII and ends `\r\n`.  The connecting side first sends a
//! single NUL byte, then drives the client state machine; the accepting
//! side drives the server machine.  Lines are read one byte at a time so
//! that nothing past the final `BEGIN\r\n` is consumed: the first binary
//! message may already sit in the same kernel buffer.

pub mod cookie;
pub mod mechanism;

use std::collections::VecDeque;
use std::io;

use thiserror::Error;
use tracing::trace;

use crate::transport::Transport;
use mechanism::{ClientMechanism, MechMsg, MechanismKind, ServerMechanism, ServerStep};

pub const DEFAULT_MAX_LINE_LEN: usize = 16 * 1024;
pub const DEFAULT_MAX_REJECTS: u32 = 42;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("i/o during authentication: {0}")]
    Io(#[from] io::Error),
    #[error("authentication line exceeds the configured bound")]
    LineTooLong,
    #[error("authentication line is not ASCII")]
    NotAscii,
    #[error("malformed hex in an authentication exchange")]
    BadHex,
    #[error("peer sent `{0}` when it was not expected")]
    UnexpectedCommand(String),
    #[error("server rejected every offered mechanism")]
    Exhausted,
    #[error("malformed server GUID `{0}`")]
    BadGuid(String),
    #[error("peer exhausted the rejection budget")]
    TooManyRejects,
}

/// The 32-hex-character identity of a D-Bus server endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Guid(String);

impl Guid {
    pub fn new(s: &str) -> Result<Guid, AuthError> {
        if s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Guid(s.to_ascii_lowercase()))
        } else {
            Err(AuthError::BadGuid(s.to_string()))
        }
    }

    pub fn generate() -> Guid {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Guid(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capabilities negotiated after a successful handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub unix_fd: bool,
}

/// Client-side knobs.  The caps are inherited defaults, kept configurable.
pub struct AuthConfig {
    pub mechanisms: Vec<MechanismKind>,
    pub max_line_len: usize,
    pub negotiate_unix_fd: bool,
}

impl Default for AuthConfig {
    fn default() -> AuthConfig {
        AuthConfig {
            mechanisms: vec![
                MechanismKind::External,
                MechanismKind::CookieSha1,
                MechanismKind::Anonymous,
            ],
            max_line_len: DEFAULT_MAX_LINE_LEN,
            negotiate_unix_fd: true,
        }
    }
}

/// Server-side knobs.
pub struct ServerAuthConfig {
    pub guid: Guid,
    pub mechanisms: Vec<MechanismKind>,
    pub max_line_len: usize,
    pub max_rejects: u32,
    pub allow_unix_fd: bool,
}

impl ServerAuthConfig {
    pub fn new(guid: Guid) -> ServerAuthConfig {
        ServerAuthConfig {
            guid,
            mechanisms: vec![MechanismKind::External, MechanismKind::CookieSha1],
            max_line_len: DEFAULT_MAX_LINE_LEN,
            max_rejects: DEFAULT_MAX_REJECTS,
            allow_unix_fd: true,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ServerAuthOutcome {
    pub uid: Option<u32>,
    pub capabilities: Capabilities,
}

struct LineIo<'t> {
    transport: &'t Transport,
    max_line_len: usize,
}

impl<'t> LineIo<'t> {
    async fn send_line(&self, line: &str) -> Result<(), AuthError> {
        trace!(line, "auth >>");
        let mut out = Vec::with_capacity(line.len() + 2);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.transport.write_all(&out).await?;
        Ok(())
    }

    /// One byte at a time, so the line reader never consumes binary bytes
    /// that follow `BEGIN`.
    async fn recv_line(&self) -> Result<String, AuthError> {
        let mut line = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            self.transport.read_exact(&mut byte).await?;
            if byte[0] == b'\n' {
                break;
            }
            line.push(byte[0]);
            if line.len() > self.max_line_len {
                return Err(AuthError::LineTooLong);
            }
        }
        if line.last() != Some(&b'\r') {
            return Err(AuthError::UnexpectedCommand("<bare newline>".to_string()));
        }
        line.pop();
        if !line.is_ascii() {
            return Err(AuthError::NotAscii);
        }
        let line = String::from_utf8(line).map_err(|_| AuthError::NotAscii)?;
        trace!(%line, "auth <<");
        Ok(line)
    }
}

enum ServerReply {
    Rejected(Vec<String>),
    Ok(String),
    Data(Vec<u8>),
    Error(String),
    AgreeUnixFd,
    Other(String),
}

fn parse_server_reply(line: &str) -> Result<ServerReply, AuthError> {
    let (cmd, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r),
        None => (line, ""),
    };
    Ok(match cmd {
        "REJECTED" => ServerReply::Rejected(
            rest.split_whitespace().map(str::to_string).collect(),
        ),
        "OK" => ServerReply::Ok(rest.trim().to_string()),
        "DATA" => ServerReply::Data(hex::decode(rest.trim()).map_err(|_| AuthError::BadHex)?),
        "ERROR" => ServerReply::Error(rest.to_string()),
        "AGREE_UNIX_FD" => ServerReply::AgreeUnixFd,
        _ => ServerReply::Other(line.to_string()),
    })
}

#[derive(Clone, Copy)]
enum ClientState {
    WaitingForData,
    WaitingForOk,
    WaitingForReject,
}

/// Run the client half of the handshake.  On success the transport carries
/// binary D-Bus traffic from its very next byte.
pub async fn authenticate_client(
    transport: &Transport,
    config: &AuthConfig,
) -> Result<(Guid, Capabilities), AuthError> {
    // The spec requires a single NUL before any line traffic.
    transport.write_all(&[0]).await?;
    let io = LineIo {
        transport,
        max_line_len: config.max_line_len,
    };

    let mut queue: VecDeque<MechanismKind> = config.mechanisms.iter().copied().collect();
    'mechs: while let Some(kind) = queue.pop_front() {
        let mut mech = match ClientMechanism::new(kind) {
            Ok(m) => m,
            // A mechanism that cannot initialize is skipped.
            Err(_) => continue,
        };
        let auth_line = match mech.init() {
            Some(initial) => format!("AUTH {} {}", kind.name(), hex::encode(initial)),
            None => format!("AUTH {}", kind.name()),
        };
        io.send_line(&auth_line).await?;

        let mut state = ClientState::WaitingForData;
        loop {
            let reply = parse_server_reply(&io.recv_line().await?)?;
            match (state, reply) {
                (ClientState::WaitingForData | ClientState::WaitingForOk, ServerReply::Ok(guid)) => {
                    return finish_client(&io, transport, config, &guid).await;
                }
                (
                    ClientState::WaitingForData
                    | ClientState::WaitingForOk
                    | ClientState::WaitingForReject,
                    ServerReply::Rejected(offered),
                ) => {
                    retain_offered(&mut queue, &offered);
                    continue 'mechs;
                }
                (ClientState::WaitingForData, ServerReply::Data(d)) => match mech.data(&d).await {
                    MechMsg::Continue(r) => {
                        io.send_line(&format!("DATA {}", hex::encode(r))).await?;
                    }
                    MechMsg::Ok(r) => {
                        io.send_line(&format!("DATA {}", hex::encode(r))).await?;
                        state = ClientState::WaitingForOk;
                    }
                    MechMsg::Error(m) => {
                        io.send_line(&format!("ERROR {m}")).await?;
                    }
                },
                (ClientState::WaitingForData, _) | (ClientState::WaitingForOk, _) => {
                    io.send_line("CANCEL").await?;
                    state = ClientState::WaitingForReject;
                }
                (ClientState::WaitingForReject, reply) => {
                    return Err(AuthError::UnexpectedCommand(describe_reply(&reply)));
                }
            }
        }
    }
    Err(AuthError::Exhausted)
}

fn describe_reply(reply: &ServerReply) -> String {
    match reply {
        ServerReply::Rejected(_) => "REJECTED".to_string(),
        ServerReply::Ok(_) => "OK".to_string(),
        ServerReply::Data(_) => "DATA".to_string(),
        ServerReply::Error(m) => format!("ERROR {m}"),
        ServerReply::AgreeUnixFd => "AGREE_UNIX_FD".to_string(),
        ServerReply::Other(l) => l.clone(),
    }
}

fn retain_offered(queue: &mut VecDeque<MechanismKind>, offered: &[String]) {
    if offered.is_empty() {
        return;
    }
    queue.retain(|k| offered.iter().any(|name| name == k.name()));
}

async fn finish_client(
    io: &LineIo<'_>,
    transport: &Transport,
    config: &AuthConfig,
    guid: &str,
) -> Result<(Guid, Capabilities), AuthError> {
    let guid = Guid::new(guid)?;
    let mut caps = Capabilities::default();
    if config.negotiate_unix_fd && transport.supports_fd_passing() {
        io.send_line("NEGOTIATE_UNIX_FD").await?;
        match parse_server_reply(&io.recv_line().await?)? {
            ServerReply::AgreeUnixFd => caps.unix_fd = true,
            ServerReply::Error(_) => {}
            other => return Err(AuthError::UnexpectedCommand(describe_reply(&other))),
        }
    }
    io.send_line("BEGIN").await?;
    Ok((guid, caps))
}

enum ClientCommand {
    Auth {
        mech: Option<MechanismKind>,
        initial: Option<Vec<u8>>,
    },
    Cancel,
    Begin,
    Data(Vec<u8>),
    Error,
    NegotiateUnixFd,
    Unknown,
}

fn parse_client_command(line: &str) -> Result<ClientCommand, AuthError> {
    let (cmd, rest) = match line.split_once(' ') {
        Some((c, r)) => (c, r),
        None => (line, ""),
    };
    Ok(match cmd {
        "AUTH" => {
            let mut fields = rest.split_whitespace();
            let mech = fields.next().and_then(MechanismKind::from_name);
            let initial = match fields.next() {
                Some(h) => Some(hex::decode(h).map_err(|_| AuthError::BadHex)?),
                None => None,
            };
            ClientCommand::Auth { mech, initial }
        }
        "CANCEL" => ClientCommand::Cancel,
        "BEGIN" => ClientCommand::Begin,
        "DATA" => ClientCommand::Data(hex::decode(rest.trim()).map_err(|_| AuthError::BadHex)?),
        "ERROR" => ClientCommand::Error,
        "NEGOTIATE_UNIX_FD" => ClientCommand::NegotiateUnixFd,
        _ => ClientCommand::Unknown,
    })
}

enum ServerState {
    WaitingForAuth,
    WaitingForData(ServerMechanism),
    WaitingForBegin { uid: Option<u32> },
}

/// Run the accepting half of the handshake.  Returns once the client sends
/// `BEGIN`; the next bytes on the transport are binary D-Bus traffic.
pub async fn authenticate_server(
    transport: &Transport,
    config: &ServerAuthConfig,
) -> Result<ServerAuthOutcome, AuthError> {
    let mut nul = [0u8; 1];
    transport.read_exact(&mut nul).await?;
    if nul[0] != 0 {
        return Err(AuthError::UnexpectedCommand("<missing NUL>".to_string()));
    }
    let io = LineIo {
        transport,
        max_line_len: config.max_line_len,
    };
    let peer_uid = transport.peer_uid().ok();
    let mech_names = config
        .mechanisms
        .iter()
        .map(|m| m.name())
        .collect::<Vec<_>>()
        .join(" ");

    let mut rejects: u32 = 0;
    let mut caps = Capabilities::default();
    let mut state = ServerState::WaitingForAuth;
    loop {
        let command = parse_client_command(&io.recv_line().await?);

        // A malformed hex argument is an error reply, not a hangup.
        let command = match command {
            Ok(c) => c,
            Err(AuthError::BadHex) => {
                reject(&io, &mech_names, &mut rejects, config.max_rejects).await?;
                state = ServerState::WaitingForAuth;
                continue;
            }
            Err(e) => return Err(e),
        };

        state = match (state, command) {
            (ServerState::WaitingForAuth, ClientCommand::Auth { mech, initial }) => {
                let enabled = mech.filter(|m| config.mechanisms.contains(m));
                match enabled.and_then(|m| ServerMechanism::new(m, peer_uid).ok()) {
                    Some(mut mechanism) => match mechanism.initial(initial.as_deref()).await {
                        ServerStep::Ok { uid } => {
                            io.send_line(&format!("OK {}", config.guid)).await?;
                            ServerState::WaitingForBegin { uid }
                        }
                        ServerStep::Challenge(c) => {
                            io.send_line(&format!("DATA {}", hex::encode(c))).await?;
                            ServerState::WaitingForData(mechanism)
                        }
                        ServerStep::Reject => {
                            reject(&io, &mech_names, &mut rejects, config.max_rejects).await?;
                            ServerState::WaitingForAuth
                        }
                    },
                    None => {
                        reject(&io, &mech_names, &mut rejects, config.max_rejects).await?;
                        ServerState::WaitingForAuth
                    }
                }
            }
            (ServerState::WaitingForData(mut mechanism), ClientCommand::Data(d)) => {
                match mechanism.data(&d).await {
                    ServerStep::Ok { uid } => {
                        io.send_line(&format!("OK {}", config.guid)).await?;
                        ServerState::WaitingForBegin { uid }
                    }
                    ServerStep::Challenge(c) => {
                        io.send_line(&format!("DATA {}", hex::encode(c))).await?;
                        ServerState::WaitingForData(mechanism)
                    }
                    ServerStep::Reject => {
                        reject(&io, &mech_names, &mut rejects, config.max_rejects).await?;
                        ServerState::WaitingForAuth
                    }
                }
            }
            (ServerState::WaitingForData(_), ClientCommand::Cancel | ClientCommand::Error)
            | (ServerState::WaitingForBegin { .. }, ClientCommand::Cancel) => {
                reject(&io, &mech_names, &mut rejects, config.max_rejects).await?;
                ServerState::WaitingForAuth
            }
            (ServerState::WaitingForBegin { uid }, ClientCommand::Begin) => {
                return Ok(ServerAuthOutcome {
                    uid,
                    capabilities: caps,
                });
            }
            (ServerState::WaitingForBegin { uid }, ClientCommand::NegotiateUnixFd) => {
                if config.allow_unix_fd && transport.supports_fd_passing() {
                    caps.unix_fd = true;
                    io.send_line("AGREE_UNIX_FD").await?;
                } else {
                    io.send_line("ERROR unix fd passing is unavailable").await?;
                }
                ServerState::WaitingForBegin { uid }
            }
            (state, _) => {
                // Unknown or out-of-place commands burn the same budget as
                // failed mechanisms.
                rejects += 1;
                if rejects > config.max_rejects {
                    return Err(AuthError::TooManyRejects);
                }
                io.send_line("ERROR unexpected command").await?;
                state
            }
        };
    }
}

async fn reject(
    io: &LineIo<'_>,
    mech_names: &str,
    rejects: &mut u32,
    max_rejects: u32,
) -> Result<(), AuthError> {
    *rejects += 1;
    if *rejects > max_rejects {
        return Err(AuthError::TooManyRejects);
    }
    io.send_line(&format!("REJECTED {mech_names}")).await
}

#[cfg(test)]
mod test {
    use super::*;

    async fn raw_recv_line(t: &Transport) -> String {
        let io = LineIo {
            transport: t,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        };
        io.recv_line().await.unwrap()
    }

    async fn raw_send_line(t: &Transport, line: &str) {
        let io = LineIo {
            transport: t,
            max_line_len: DEFAULT_MAX_LINE_LEN,
        };
        io.send_line(line).await.unwrap();
    }

    fn external_only() -> AuthConfig {
        AuthConfig {
            mechanisms: vec![MechanismKind::External],
            ..AuthConfig::default()
        }
    }

    #[tokio::test]
    async fn test_client_external_handshake() {
        let (client, server) = Transport::pair();
        let guid = Guid::generate();

        let server_task = {
            let expected_guid = guid.clone();
            tokio::spawn(async move {
                let mut nul = [0u8; 1];
                server.read_exact(&mut nul).await.unwrap();
                assert_eq!(nul[0], 0);

                let line = raw_recv_line(&server).await;
                let uid = nix::unistd::Uid::effective().as_raw().to_string();
                assert_eq!(line, format!("AUTH EXTERNAL {}", hex::encode(uid)));

                raw_send_line(&server, &format!("OK {expected_guid}")).await;
                assert_eq!(raw_recv_line(&server).await, "BEGIN");
            })
        };

        let (got_guid, caps) = authenticate_client(&client, &external_only())
            .await
            .unwrap();
        assert_eq!(got_guid, guid);
        // The in-memory transport cannot pass fds, so none were negotiated.
        assert!(!caps.unix_fd);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_falls_back_after_reject() {
        let (client, server) = Transport::pair();
        let guid = Guid::generate();

        let server_task = {
            let guid = guid.clone();
            tokio::spawn(async move {
                let mut nul = [0u8; 1];
                server.read_exact(&mut nul).await.unwrap();

                let line = raw_recv_line(&server).await;
                assert!(line.starts_with("AUTH EXTERNAL"));
                raw_send_line(&server, "REJECTED ANONYMOUS").await;

                let line = raw_recv_line(&server).await;
                assert!(line.starts_with("AUTH ANONYMOUS"));
                raw_send_line(&server, &format!("OK {guid}")).await;
                assert_eq!(raw_recv_line(&server).await, "BEGIN");
            })
        };

        let config = AuthConfig {
            mechanisms: vec![MechanismKind::External, MechanismKind::Anonymous],
            ..AuthConfig::default()
        };
        let (got, _) = authenticate_client(&client, &config).await.unwrap();
        assert_eq!(got, guid);
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_exhausts_mechanisms() {
        let (client, server) = Transport::pair();
        let server_task = tokio::spawn(async move {
            let mut nul = [0u8; 1];
            server.read_exact(&mut nul).await.unwrap();
            let _ = raw_recv_line(&server).await;
            raw_send_line(&server, "REJECTED").await;
        });

        let err = authenticate_client(&client, &external_only())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Exhausted));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_cancels_on_server_error() {
        let (client, server) = Transport::pair();
        let server_task = tokio::spawn(async move {
            let mut nul = [0u8; 1];
            server.read_exact(&mut nul).await.unwrap();
            let _ = raw_recv_line(&server).await;
            raw_send_line(&server, "ERROR tea time").await;
            assert_eq!(raw_recv_line(&server).await, "CANCEL");
            raw_send_line(&server, "REJECTED").await;
        });

        let err = authenticate_client(&client, &external_only())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Exhausted));
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_anonymous_handshake() {
        let (client, server) = Transport::pair();
        let config = ServerAuthConfig {
            mechanisms: vec![MechanismKind::Anonymous],
            ..ServerAuthConfig::new(Guid::generate())
        };
        let guid = config.guid.clone();

        let client_task = tokio::spawn(async move {
            client.write_all(&[0]).await.unwrap();
            raw_send_line(&client, "AUTH ANONYMOUS 7472616365").await;
            let line = raw_recv_line(&client).await;
            assert_eq!(line, format!("OK {guid}"));
            raw_send_line(&client, "BEGIN").await;
        });

        let outcome = authenticate_server(&server, &config).await.unwrap();
        assert_eq!(outcome.uid, None);
        assert!(!outcome.capabilities.unix_fd);
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_reject_budget() {
        let (client, server) = Transport::pair();
        let config = ServerAuthConfig {
            max_rejects: 3,
            ..ServerAuthConfig::new(Guid::generate())
        };

        let client_task = tokio::spawn(async move {
            client.write_all(&[0]).await.unwrap();
            for _ in 0..4 {
                raw_send_line(&client, "AUTH KERBEROS_V4").await;
                let _ = raw_recv_line(&client).await;
            }
        });

        let err = authenticate_server(&server, &config).await.unwrap_err();
        assert!(matches!(err, AuthError::TooManyRejects));
        // Dropping our end unblocks the client task's final read.
        drop(server);
        let _ = client_task.await;
    }

    #[tokio::test]
    async fn test_oversize_line_rejected() {
        let (client, server) = Transport::pair();
        let config = AuthConfig {
            max_line_len: 64,
            ..external_only()
        };
        let server_task = tokio::spawn(async move {
            let mut nul = [0u8; 1];
            server.read_exact(&mut nul).await.unwrap();
            let _ = raw_recv_line(&server).await;
            let long = "X".repeat(65);
            raw_send_line(&server, &long).await;
        });

        let err = authenticate_client(&client, &config).await.unwrap_err();
        assert!(matches!(err, AuthError::LineTooLong));
        server_task.await.unwrap();
    }

    #[test]
    fn test_guid() {
        Guid::new("0123456789abcdef0123456789abcdef").unwrap();
        Guid::new("0123").unwrap_err();
        Guid::new("zz23456789abcdef0123456789abcdef").unwrap_err();
        assert_eq!(Guid::generate().as_str().len(), 32);
    }
}
