//! KRPC messages ([BEP-5]) and their bencode representation.
//!
//! A datagram is classified by its `y` key into a request (`q`), a response (`r`) or an error
//! (`e`). Responses don't name the query they answer; the transaction manager recovers that
//! from the transaction id.
//!
//! [BEP-5]: http://bittorrent.org/beps/bep_0005.html

use crate::{
    bencode::{self, Dictionary, ErrorKind, Value},
    compact::{self, CompactError},
    id::{InfoHash, NodeId},
    routing::NodeHandle,
};
use std::{convert::TryFrom, fmt, net::SocketAddr};
use thiserror::Error;

/// Client version sent in the `v` key of every message.
pub const CLIENT_VERSION: &[u8] = b"PN01";

const PING: &[u8] = b"ping";
const FIND_NODE: &[u8] = b"find_node";
const GET_PEERS: &[u8] = b"get_peers";
const ANNOUNCE_PEER: &[u8] = b"announce_peer";

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct Message {
    pub transaction_id: Vec<u8>,
    pub version: Option<Vec<u8>>,
    pub body: MessageBody,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) enum MessageBody {
    Request(Request),
    Response(Response),
    Error(Error),
    /// A dictionary with a `y` we don't recognize.
    Unknown { kind: Vec<u8>, payload: Dictionary },
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum MessageType {
    Query,
    Response,
    Error,
    Unknown,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum QueryType {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
    None,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) enum Request {
    Ping(PingRequest),
    FindNode(FindNodeRequest),
    GetPeers(GetPeersRequest),
    AnnouncePeer(AnnouncePeerRequest),
    /// A method we don't implement. Answered with a 204 error.
    Unknown(UnknownRequest),
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct PingRequest {
    pub id: NodeId,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct FindNodeRequest {
    pub id: NodeId,
    pub target: NodeId,
    pub want: Option<Want>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct GetPeersRequest {
    pub id: NodeId,
    pub info_hash: InfoHash,
    pub want: Option<Want>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct AnnouncePeerRequest {
    pub id: NodeId,
    pub info_hash: InfoHash,
    /// `None` means `implied_port`: the sender's source port is the one to store.
    pub port: Option<u16>,
    pub token: Vec<u8>,
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct UnknownRequest {
    pub method: Vec<u8>,
    pub id: Option<NodeId>,
}

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub(crate) enum Want {
    // The peer wants only ipv4 contacts
    V4,
    // The peer wants only ipv6 contacts
    V6,
    // The peer wants both ipv4 and ipv6 contacts
    Both,
}

/// Reply to any of the queries. Which fields are present depends on the query.
#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct Response {
    pub id: NodeId,
    pub nodes_v4: Vec<NodeHandle>,
    pub nodes_v6: Vec<NodeHandle>,
    pub values: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
}

impl Response {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            nodes_v4: Vec::new(),
            nodes_v6: Vec::new(),
            values: Vec::new(),
            token: None,
        }
    }
}

#[derive(Clone, Eq, PartialEq, Debug)]
pub(crate) struct Error {
    pub code: i64,
    pub message: String,
}

pub mod error_code {
    // some of these codes are not used in this crate but we still list them here for completeness.
    #![allow(unused)]

    pub const GENERIC_ERROR: i64 = 201;
    pub const SERVER_ERROR: i64 = 202;
    pub const PROTOCOL_ERROR: i64 = 203;
    pub const METHOD_UNKNOWN: i64 = 204;
}

#[derive(Debug, Error)]
pub(crate) enum DecodeError {
    #[error("{0}")]
    Encoding(#[from] bencode::Error),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid field `{0}`")]
    InvalidField(&'static str),
    /// The datagram is a well formed query but its arguments are not. Unlike the other errors,
    /// the sender gets an error reply.
    #[error("invalid query argument `{field}`")]
    InvalidArguments {
        transaction_id: Vec<u8>,
        field: &'static str,
    },
}

impl DecodeError {
    /// Is this a resource limit rejection rather than a malformed datagram?
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Encoding(error) if error.kind() == ErrorKind::Unsupported)
    }
}

impl Message {
    pub fn request(transaction_id: Vec<u8>, request: Request) -> Self {
        Self {
            transaction_id,
            version: Some(CLIENT_VERSION.to_vec()),
            body: MessageBody::Request(request),
        }
    }

    pub fn response(transaction_id: Vec<u8>, response: Response) -> Self {
        Self {
            transaction_id,
            version: Some(CLIENT_VERSION.to_vec()),
            body: MessageBody::Response(response),
        }
    }

    pub fn error(transaction_id: Vec<u8>, code: i64, message: impl Into<String>) -> Self {
        Self {
            transaction_id,
            version: Some(CLIENT_VERSION.to_vec()),
            body: MessageBody::Error(Error {
                code,
                message: message.into(),
            }),
        }
    }

    /// Decode a datagram.
    ///
    /// Anything that doesn't start with a dictionary is rejected before any parsing.
    pub fn decode(input: &[u8]) -> Result<Self, DecodeError> {
        let dict = bencode::decode_dictionary(input)?;
        Self::from_dictionary(dict)
    }

    /// Encode the message into bencode.
    pub fn encode(&self) -> Vec<u8> {
        self.to_dictionary().encode()
    }

    pub fn message_type(&self) -> MessageType {
        match self.body {
            MessageBody::Request(_) => MessageType::Query,
            MessageBody::Response(_) => MessageType::Response,
            MessageBody::Error(_) => MessageType::Error,
            MessageBody::Unknown { .. } => MessageType::Unknown,
        }
    }

    /// Query type of a request. Responses and errors report `None`.
    pub fn query_type(&self) -> QueryType {
        match &self.body {
            MessageBody::Request(request) => request.query_type(),
            _ => QueryType::None,
        }
    }

    /// Does the sender run a client compatible with `version`? Only the first two bytes, the
    /// client identifier, are compared.
    pub fn is_similar_to(&self, version: &[u8]) -> bool {
        match &self.version {
            Some(own) => own.len() >= 2 && version.len() >= 2 && own[..2] == version[..2],
            None => false,
        }
    }

    /// Id of the sending node, if the message carries one.
    pub fn sender_id(&self) -> Option<NodeId> {
        match &self.body {
            MessageBody::Request(request) => request.sender_id(),
            MessageBody::Response(response) => Some(response.id),
            _ => None,
        }
    }

    fn from_dictionary(dict: Dictionary) -> Result<Self, DecodeError> {
        let transaction_id = dict
            .get_bytes(b"t")
            .ok_or(DecodeError::MissingField("t"))?
            .to_vec();
        let kind = dict.get(b"y").ok_or(DecodeError::MissingField("y"))?;
        let kind = kind.as_bytes().ok_or(DecodeError::InvalidField("y"))?;
        let version = dict.get_bytes(b"v").map(|v| v.to_vec());

        let body = match kind {
            b"q" => MessageBody::Request(Request::decode(&dict, &transaction_id)?),
            b"r" => {
                let reply = dict.get(b"r").ok_or(DecodeError::MissingField("r"))?;
                let reply = reply.as_dict().ok_or(DecodeError::InvalidField("r"))?;
                MessageBody::Response(Response::decode(reply)?)
            }
            b"e" => {
                let error = dict.get(b"e").ok_or(DecodeError::MissingField("e"))?;
                let error = error.as_list().ok_or(DecodeError::InvalidField("e"))?;
                MessageBody::Error(Error::decode(error)?)
            }
            _ => MessageBody::Unknown {
                kind: kind.to_vec(),
                payload: dict.clone(),
            },
        };

        Ok(Self {
            transaction_id,
            version,
            body,
        })
    }

    /// Build the bencode dictionary of the message. Keys are inserted in sorted order, so the
    /// output is canonical.
    pub fn to_dictionary(&self) -> Dictionary {
        let builder = Dictionary::builder();

        let builder = match &self.body {
            MessageBody::Request(request) => builder
                .insert("a", request.arguments())
                .insert("q", request.method()),
            MessageBody::Response(response) => builder.insert("r", response.to_dictionary()),
            MessageBody::Error(error) => builder.insert(
                "e",
                vec![
                    Value::Integer(error.code),
                    Value::from(error.message.as_bytes()),
                ],
            ),
            MessageBody::Unknown { payload, .. } => {
                // Re-emit whatever else the dictionary had, minus the keys written below.
                payload
                    .iter()
                    .filter(|(key, _)| !matches!(*key, b"t" | b"v" | b"y"))
                    .fold(builder, |builder, (key, value)| {
                        builder.insert(key, value.clone())
                    })
            }
        };

        let kind: &[u8] = match &self.body {
            MessageBody::Request(_) => b"q",
            MessageBody::Response(_) => b"r",
            MessageBody::Error(_) => b"e",
            MessageBody::Unknown { kind, .. } => kind,
        };

        builder
            .insert("t", self.transaction_id.as_slice())
            .insert_opt("v", self.version.as_deref())
            .insert("y", kind)
            .build()
    }
}

impl Request {
    pub fn query_type(&self) -> QueryType {
        match self {
            Self::Ping(_) => QueryType::Ping,
            Self::FindNode(_) => QueryType::FindNode,
            Self::GetPeers(_) => QueryType::GetPeers,
            Self::AnnouncePeer(_) => QueryType::AnnouncePeer,
            Self::Unknown(_) => QueryType::None,
        }
    }

    pub fn sender_id(&self) -> Option<NodeId> {
        match self {
            Self::Ping(r) => Some(r.id),
            Self::FindNode(r) => Some(r.id),
            Self::GetPeers(r) => Some(r.id),
            Self::AnnouncePeer(r) => Some(r.id),
            Self::Unknown(r) => r.id,
        }
    }

    fn method(&self) -> &[u8] {
        match self {
            Self::Ping(_) => PING,
            Self::FindNode(_) => FIND_NODE,
            Self::GetPeers(_) => GET_PEERS,
            Self::AnnouncePeer(_) => ANNOUNCE_PEER,
            Self::Unknown(r) => &r.method,
        }
    }

    fn arguments(&self) -> Dictionary {
        let builder = Dictionary::builder();

        match self {
            Self::Ping(r) => builder.insert("id", r.id.as_bytes()),
            Self::FindNode(r) => builder
                .insert("id", r.id.as_bytes())
                .insert("target", r.target.as_bytes())
                .insert_opt("want", r.want.map(encode_want)),
            Self::GetPeers(r) => builder
                .insert("id", r.id.as_bytes())
                .insert("info_hash", r.info_hash.as_bytes())
                .insert_opt("want", r.want.map(encode_want)),
            Self::AnnouncePeer(r) => builder
                .insert("id", r.id.as_bytes())
                .insert_opt("implied_port", r.port.is_none().then_some(1i64))
                .insert("info_hash", r.info_hash.as_bytes())
                .insert_opt("port", r.port.map(i64::from))
                .insert("token", r.token.as_slice()),
            Self::Unknown(r) => builder.insert_opt("id", r.id.as_ref().map(NodeId::as_bytes)),
        }
        .build()
    }

    fn decode(dict: &Dictionary, transaction_id: &[u8]) -> Result<Self, DecodeError> {
        let method = dict.get(b"q").ok_or(DecodeError::MissingField("q"))?;
        let method = method.as_bytes().ok_or(DecodeError::InvalidField("q"))?;
        let args = dict.get(b"a").ok_or(DecodeError::MissingField("a"))?;
        let args = args.as_dict().ok_or(DecodeError::InvalidField("a"))?;

        let invalid = |field| DecodeError::InvalidArguments {
            transaction_id: transaction_id.to_vec(),
            field,
        };
        let get_id = |field: &'static str| {
            args.get_bytes(field.as_bytes())
                .and_then(|bytes| NodeId::try_from(bytes).ok())
                .ok_or_else(|| invalid(field))
        };

        let request = match method {
            PING => Self::Ping(PingRequest { id: get_id("id")? }),
            FIND_NODE => Self::FindNode(FindNodeRequest {
                id: get_id("id")?,
                target: get_id("target")?,
                want: decode_want(args),
            }),
            GET_PEERS => Self::GetPeers(GetPeersRequest {
                id: get_id("id")?,
                info_hash: get_id("info_hash")?,
                want: decode_want(args),
            }),
            ANNOUNCE_PEER => {
                let implied_port = args.get_integer(b"implied_port").unwrap_or(0) > 0;
                let port = if implied_port {
                    None
                } else {
                    let port = args.get_integer(b"port").ok_or_else(|| invalid("port"))?;
                    match u16::try_from(port) {
                        Ok(port) if port != 0 => Some(port),
                        _ => return Err(invalid("port")),
                    }
                };

                Self::AnnouncePeer(AnnouncePeerRequest {
                    id: get_id("id")?,
                    info_hash: get_id("info_hash")?,
                    port,
                    token: args
                        .get_bytes(b"token")
                        .ok_or_else(|| invalid("token"))?
                        .to_vec(),
                })
            }
            // Mainline extension: unknown methods carrying a target are served as `find_node`.
            _ => {
                let id = get_id("id").ok();
                let target = get_id("target").or_else(|_| get_id("info_hash")).ok();

                match (id, target) {
                    (Some(id), Some(target)) => Self::FindNode(FindNodeRequest {
                        id,
                        target,
                        want: decode_want(args),
                    }),
                    (id, _) => Self::Unknown(UnknownRequest {
                        method: method.to_vec(),
                        id,
                    }),
                }
            }
        };

        Ok(request)
    }
}

impl Response {
    fn to_dictionary(&self) -> Dictionary {
        Dictionary::builder()
            .insert("id", self.id.as_bytes())
            .insert_opt(
                "nodes",
                (!self.nodes_v4.is_empty()).then(|| compact::encode_nodes_v4(&self.nodes_v4)),
            )
            .insert_opt(
                "nodes6",
                (!self.nodes_v6.is_empty()).then(|| compact::encode_nodes_v6(&self.nodes_v6)),
            )
            .insert_opt("token", self.token.as_deref())
            .insert_opt(
                "values",
                (!self.values.is_empty()).then(|| compact::encode_values(&self.values)),
            )
            .build()
    }

    fn decode(dict: &Dictionary) -> Result<Self, DecodeError> {
        let id = dict.get(b"id").ok_or(DecodeError::MissingField("id"))?;
        let id = id
            .as_bytes()
            .and_then(|bytes| NodeId::try_from(bytes).ok())
            .ok_or(DecodeError::InvalidField("id"))?;

        let nodes_v4 = match dict.get(b"nodes") {
            Some(nodes) => nodes
                .as_bytes()
                .ok_or(DecodeError::InvalidField("nodes"))
                .and_then(|bytes| compact_field("nodes", compact::decode_nodes_v4(bytes)))?,
            None => Vec::new(),
        };

        let nodes_v6 = match dict.get(b"nodes6") {
            Some(nodes) => nodes
                .as_bytes()
                .ok_or(DecodeError::InvalidField("nodes6"))
                .and_then(|bytes| compact_field("nodes6", compact::decode_nodes_v6(bytes)))?,
            None => Vec::new(),
        };

        let values = match dict.get(b"values") {
            Some(values) => values
                .as_list()
                .ok_or(DecodeError::InvalidField("values"))
                .and_then(|list| compact_field("values", compact::decode_values(list)))?,
            None => Vec::new(),
        };

        let token = match dict.get(b"token") {
            Some(token) => Some(
                token
                    .as_bytes()
                    .ok_or(DecodeError::InvalidField("token"))?
                    .to_vec(),
            ),
            None => None,
        };

        Ok(Self {
            id,
            nodes_v4,
            nodes_v6,
            values,
            token,
        })
    }
}

impl Error {
    fn decode(list: &[Value]) -> Result<Self, DecodeError> {
        match list {
            [code, message] => Ok(Self {
                code: code.as_integer().ok_or(DecodeError::InvalidField("e"))?,
                message: String::from_utf8_lossy(
                    message.as_bytes().ok_or(DecodeError::InvalidField("e"))?,
                )
                .into_owned(),
            }),
            _ => Err(DecodeError::InvalidField("e")),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message)
    }
}

fn compact_field<T>(
    field: &'static str,
    result: Result<T, CompactError>,
) -> Result<T, DecodeError> {
    result.map_err(|error| {
        log::trace!("Invalid `{}` in response: {}", field, error);
        DecodeError::InvalidField(field)
    })
}

fn encode_want(want: Want) -> Value {
    let list = match want {
        Want::V4 => vec![Value::from("n4")],
        Want::V6 => vec![Value::from("n6")],
        Want::Both => vec![Value::from("n4"), Value::from("n6")],
    };

    Value::List(list)
}

fn decode_want(args: &Dictionary) -> Option<Want> {
    let mut value = None;

    for item in args.get_list(b"want")? {
        let item = match item.as_bytes() {
            Some(item) => item.to_ascii_lowercase(),
            None => continue,
        };

        value = match (value, item.as_slice()) {
            (None, b"n4") => Some(Want::V4),
            (None, b"n6") => Some(Want::V6),
            (Some(Want::V4), b"n6") => Some(Want::Both),
            (Some(Want::V6), b"n4") => Some(Want::Both),
            (_, _) => value,
        }
    }

    value
}
