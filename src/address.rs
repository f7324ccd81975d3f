//! Parsing of D-Bus server address strings.
//!
//! An address is a semicolon-separated list of candidate endpoints, each of
//! the form `transport:key=value,key=value`.  Values are percent-decoded.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::str::Split;
use std::string;

use thiserror::Error;

/// Default system bus location when `DBUS_SYSTEM_BUS_ADDRESS` is unset.
pub const DEFAULT_SYSTEM_BUS_ADDRESS: &str = "unix:path=/var/run/dbus/system_bus_socket";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnescapeError {
    #[error("escape sequence cut short")]
    ShortEscapeSequence,
    #[error("escaped bytes are not UTF-8")]
    EscapeNotUtf8,
    #[error("escape sequence is not hex")]
    HexConversionError,
}

impl From<hex::FromHexError> for UnescapeError {
    fn from(_: hex::FromHexError) -> Self {
        UnescapeError::HexConversionError
    }
}

impl From<string::FromUtf8Error> for UnescapeError {
    fn from(_: string::FromUtf8Error) -> Self {
        UnescapeError::EscapeNotUtf8
    }
}

fn dbus_unescape(buf: &[u8]) -> Result<Vec<u8>, UnescapeError> {
    let mut out = Vec::with_capacity(buf.len());
    let mut i = buf.iter();
    while let Some(c) = i.next() {
        if *c == b'%' {
            let c1 = *i.next().ok_or(UnescapeError::ShortEscapeSequence)?;
            let c2 = *i.next().ok_or(UnescapeError::ShortEscapeSequence)?;
            let decoded = hex::decode([c1, c2])?;
            out.push(decoded[0]);
        } else {
            out.push(*c);
        }
    }
    Ok(out)
}

fn dbus_unescape_str(s: &str) -> Result<String, UnescapeError> {
    let vec = dbus_unescape(s.as_bytes())?;
    String::from_utf8(vec).map_err(From::from)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error(transparent)]
    Unescape(#[from] UnescapeError),
    #[error("entry has no `transport:` prefix: {0}")]
    BadTransportSeparator(String),
    #[error("malformed key=value pair: {0}")]
    MalformedKeyValue(String),
    #[error("unknown transport: {0}")]
    UnknownTransport(String),
    #[error("missing option `{0}`")]
    MissingOption(&'static str),
    #[error("conflicting options: {0}")]
    ConflictingOptions(&'static str),
    #[error("invalid value for option `{0}`")]
    InvalidOption(String),
    #[error("address contains no usable entry")]
    EmptyAddress,
}

/// Iterator over key value pairs of the form "key=val,key=val".
struct AddrKeyVals<'a> {
    str: Split<'a, char>,
}

impl<'a> AddrKeyVals<'a> {
    fn new(s: &'a str) -> Self {
        AddrKeyVals { str: s.split(',') }
    }

    fn get_next(&mut self) -> Option<&'a str> {
        loop {
            match self.str.next() {
                Some("") => continue,
                other => return other,
            }
        }
    }
}

impl<'a> Iterator for AddrKeyVals<'a> {
    type Item = Result<(String, String), AddressError>;

    fn next(&mut self) -> Option<Self::Item> {
        let kvs = self.get_next()?;
        let (key, val) = match kvs.split_once('=') {
            Some(pair) => pair,
            None => return Some(Err(AddressError::MalformedKeyValue(kvs.to_string()))),
        };
        let key = match dbus_unescape_str(key) {
            Ok(k) => k,
            Err(e) => return Some(Err(e.into())),
        };
        let val = match dbus_unescape_str(val) {
            Ok(v) => v,
            Err(e) => return Some(Err(e.into())),
        };
        Some(Ok((key, val)))
    }
}

/// A D-Bus Unix socket address.  An abstract socket is stored with its
/// leading NUL already in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnixAddress {
    path: PathBuf,
    tmpdir: Option<PathBuf>,
    /// Unrecognized keys, preserved but ignored.
    pub extra: Vec<(String, String)>,
}

impl UnixAddress {
    pub fn path(&self) -> &Path {
        self.path.as_path()
    }

    pub fn tmpdir(&self) -> Option<&Path> {
        self.tmpdir.as_deref()
    }
}

impl FromStr for UnixAddress {
    type Err = AddressError;

    /// Constructs a UnixAddress from a key=value option string.
    fn from_str(opts: &str) -> Result<Self, AddressError> {
        let mut path = None;
        let mut tmpdir = None;
        let mut abs = false;
        let mut extra = Vec::new();
        for kv in AddrKeyVals::new(opts) {
            let (key, val) = kv?;
            match key.as_ref() {
                "path" | "abstract" => {
                    if path.is_some() || tmpdir.is_some() {
                        return Err(AddressError::ConflictingOptions(
                            "path/abstract/tmpdir are mutually exclusive",
                        ));
                    }
                    abs = key == "abstract";
                    path = Some(val);
                }
                "tmpdir" => {
                    if path.is_some() || tmpdir.is_some() {
                        return Err(AddressError::ConflictingOptions(
                            "path/abstract/tmpdir are mutually exclusive",
                        ));
                    }
                    tmpdir = Some(PathBuf::from(val));
                }
                "guid" => {}
                _ => extra.push((key, val)),
            }
        }
        match (path, &tmpdir) {
            (Some(mut p), _) => {
                if abs {
                    p = "\0".to_string() + &p;
                }
                Ok(UnixAddress {
                    path: PathBuf::from(p),
                    tmpdir: None,
                    extra,
                })
            }
            (None, Some(_)) => Ok(UnixAddress {
                path: PathBuf::new(),
                tmpdir,
                extra,
            }),
            (None, None) => Err(AddressError::MissingOption("path")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFamily {
    Ipv4,
    Ipv6,
}

/// A D-Bus TCP address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpAddress {
    pub host: String,
    pub port: u16,
    pub family: Option<TcpFamily>,
    /// Unrecognized keys, preserved but ignored.
    pub extra: Vec<(String, String)>,
}

fn parse_tcp(opts: &str) -> Result<(TcpAddress, Option<PathBuf>), AddressError> {
    let mut host = None;
    let mut port = None;
    let mut family = None;
    let mut noncefile = None;
    let mut extra = Vec::new();
    for kv in AddrKeyVals::new(opts) {
        let (key, val) = kv?;
        match key.as_ref() {
            "host" => host = Some(val),
            "port" => {
                port = Some(
                    val.parse::<u16>()
                        .map_err(|_| AddressError::InvalidOption("port".to_string()))?,
                )
            }
            "family" => {
                family = Some(match val.as_ref() {
                    "ipv4" => TcpFamily::Ipv4,
                    "ipv6" => TcpFamily::Ipv6,
                    _ => return Err(AddressError::InvalidOption("family".to_string())),
                })
            }
            "noncefile" => noncefile = Some(PathBuf::from(val)),
            "guid" => {}
            _ => extra.push((key, val)),
        }
    }
    let addr = TcpAddress {
        host: host.ok_or(AddressError::MissingOption("host"))?,
        port: port.ok_or(AddressError::MissingOption("port"))?,
        family,
        extra,
    };
    Ok((addr, noncefile))
}

impl FromStr for TcpAddress {
    type Err = AddressError;

    fn from_str(opts: &str) -> Result<Self, AddressError> {
        Ok(parse_tcp(opts)?.0)
    }
}

/// A `nonce-tcp:` address: TCP plus the nonce file whose 16 bytes must be
/// the connection's first write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceTcpAddress {
    pub tcp: TcpAddress,
    pub noncefile: PathBuf,
}

impl FromStr for NonceTcpAddress {
    type Err = AddressError;

    fn from_str(opts: &str) -> Result<Self, AddressError> {
        let (tcp, noncefile) = parse_tcp(opts)?;
        Ok(NonceTcpAddress {
            tcp,
            noncefile: noncefile.ok_or(AddressError::MissingOption("noncefile"))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddress {
    Unix(UnixAddress),
    Tcp(TcpAddress),
    NonceTcp(NonceTcpAddress),
    Autolaunch,
}

impl FromStr for ServerAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (transport, opts) = s
            .split_once(':')
            .ok_or_else(|| AddressError::BadTransportSeparator(s.to_string()))?;
        match transport {
            "unix" => Ok(ServerAddress::Unix(UnixAddress::from_str(opts)?)),
            "tcp" => Ok(ServerAddress::Tcp(TcpAddress::from_str(opts)?)),
            "nonce-tcp" => Ok(ServerAddress::NonceTcp(NonceTcpAddress::from_str(opts)?)),
            "autolaunch" => Ok(ServerAddress::Autolaunch),
            _ => Err(AddressError::UnknownTransport(transport.to_string())),
        }
    }
}

/// Parse a semicolon-separated candidate list, in order.  Empty entries are
/// skipped.
pub fn parse_address_list(s: &str) -> Result<Vec<ServerAddress>, AddressError> {
    let mut out = Vec::new();
    for entry in s.split(';') {
        if entry.is_empty() {
            continue;
        }
        out.push(ServerAddress::from_str(entry)?);
    }
    if out.is_empty() {
        return Err(AddressError::EmptyAddress);
    }
    Ok(out)
}

/// The session bus address from the environment, falling back to
/// `autolaunch:`.
pub fn session_bus_address() -> String {
    env::var("DBUS_SESSION_BUS_ADDRESS").unwrap_or_else(|_| "autolaunch:".to_string())
}

/// The system bus address from the environment, falling back to the
/// documented default.
pub fn system_bus_address() -> String {
    env::var("DBUS_SYSTEM_BUS_ADDRESS").unwrap_or_else(|_| DEFAULT_SYSTEM_BUS_ADDRESS.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unescape() {
        assert_eq!(dbus_unescape(b"hello").unwrap(), b"hello");
        assert_eq!(dbus_unescape(b"\\").unwrap(), b"\\");
        assert_eq!(dbus_unescape(b"%61").unwrap(), b"a");
        assert_eq!(dbus_unescape(b"%5c").unwrap(), b"\\");
        assert_eq!(
            dbus_unescape(b"%").unwrap_err(),
            UnescapeError::ShortEscapeSequence
        );
        assert_eq!(
            dbus_unescape(b"%1").unwrap_err(),
            UnescapeError::ShortEscapeSequence
        );
        assert_eq!(
            dbus_unescape(b"%zz").unwrap_err(),
            UnescapeError::HexConversionError
        );
    }

    #[test]
    fn test_key_vals() {
        let mut a = AddrKeyVals::new("one=two").map(Result::unwrap);
        assert_eq!(a.next().unwrap(), ("one".to_string(), "two".to_string()));
        assert_eq!(a.next(), None);

        let mut a = AddrKeyVals::new("foo=bar,").map(Result::unwrap);
        assert_eq!(a.next().unwrap(), ("foo".to_string(), "bar".to_string()));
        assert_eq!(a.next(), None);

        let mut a = AddrKeyVals::new("foo=bar,a=b").map(Result::unwrap);
        assert_eq!(a.next().unwrap(), ("foo".to_string(), "bar".to_string()));
        assert_eq!(a.next().unwrap(), ("a".to_string(), "b".to_string()));
        assert_eq!(a.next(), None);

        let mut a = AddrKeyVals::new("foobar,a=b");
        assert_eq!(
            a.next().unwrap().unwrap_err(),
            AddressError::MalformedKeyValue("foobar".to_string())
        );
    }

    #[test]
    fn test_server_address() {
        assert_eq!(
            ServerAddress::from_str("unix").unwrap_err(),
            AddressError::BadTransportSeparator("unix".to_string())
        );
        ServerAddress::from_str("unix:path=/var/run/dbus/system_bus_socket").unwrap();
        assert_eq!(
            ServerAddress::from_str("unix:").unwrap_err(),
            AddressError::MissingOption("path")
        );
        assert_eq!(
            ServerAddress::from_str("floober:path=/x").unwrap_err(),
            AddressError::UnknownTransport("floober".to_string())
        );
    }

    #[test]
    fn test_unknown_keys_preserved() {
        let addr = UnixAddress::from_str("path=/run/bus,flavor=vanilla").unwrap();
        assert_eq!(addr.path(), Path::new("/run/bus"));
        assert_eq!(
            addr.extra,
            vec![("flavor".to_string(), "vanilla".to_string())]
        );
    }

    #[test]
    fn test_unix_abstract() {
        let addr = UnixAddress::from_str("abstract=/tmp/dbus-XYZ").unwrap();
        assert_eq!(addr.path().as_os_str().as_encoded_bytes()[0], 0);
        UnixAddress::from_str("path=/a,abstract=/b").unwrap_err();
        UnixAddress::from_str("path=/a,tmpdir=/b").unwrap_err();
        let addr = UnixAddress::from_str("tmpdir=/tmp").unwrap();
        assert_eq!(addr.tmpdir(), Some(Path::new("/tmp")));
    }

    #[test]
    fn test_unix_escaped_path() {
        let addr = UnixAddress::from_str("path=/run/user%2f1000/bus").unwrap();
        assert_eq!(addr.path(), Path::new("/run/user/1000/bus"));
    }

    #[test]
    fn test_tcp() {
        let addr = TcpAddress::from_str("host=localhost,port=12345,family=ipv4").unwrap();
        assert_eq!(addr.host, "localhost");
        assert_eq!(addr.port, 12345);
        assert_eq!(addr.family, Some(TcpFamily::Ipv4));

        assert_eq!(
            TcpAddress::from_str("host=localhost").unwrap_err(),
            AddressError::MissingOption("port")
        );
        assert_eq!(
            TcpAddress::from_str("host=h,port=many").unwrap_err(),
            AddressError::InvalidOption("port".to_string())
        );
        assert_eq!(
            TcpAddress::from_str("host=h,port=1,family=ipx").unwrap_err(),
            AddressError::InvalidOption("family".to_string())
        );
    }

    #[test]
    fn test_nonce_tcp() {
        let addr =
            NonceTcpAddress::from_str("host=h,port=99,noncefile=/tmp/nonce").unwrap();
        assert_eq!(addr.tcp.port, 99);
        assert_eq!(addr.noncefile, PathBuf::from("/tmp/nonce"));
        assert_eq!(
            NonceTcpAddress::from_str("host=h,port=99").unwrap_err(),
            AddressError::MissingOption("noncefile")
        );
    }

    #[test]
    fn test_address_list() {
        let list = parse_address_list(
            "unix:path=/run/user/1000/bus;tcp:host=localhost,port=1;autolaunch:",
        )
        .unwrap();
        assert_eq!(list.len(), 3);
        assert!(matches!(list[0], ServerAddress::Unix(_)));
        assert!(matches!(list[1], ServerAddress::Tcp(_)));
        assert!(matches!(list[2], ServerAddress::Autolaunch));

        // Empty entries are skipped.
        let list = parse_address_list("unix:path=/x;;").unwrap();
        assert_eq!(list.len(), 1);

        assert_eq!(
            parse_address_list(";").unwrap_err(),
            AddressError::EmptyAddress
        );
    }
}
