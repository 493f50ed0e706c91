//! KRPC envelope types: the typed query/response/error shapes carried
//! inside a bencoded dictionary, per `spec.md` §4.B.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::bencode::{self, Value};
use crate::node::{self, Node, NodeId};

pub const ERR_GENERIC: i64 = 201;
pub const ERR_SERVER: i64 = 202;
pub const ERR_PROTOCOL: i64 = 203;
pub const ERR_UNKNOWN_METHOD: i64 = 204;

/// Transaction id: 1-8 opaque bytes, compared by value.
pub type TransactionId = Vec<u8>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("malformed krpc envelope: {0}")]
    Malformed(String),
    #[error("unknown query method {0:?}")]
    UnknownMethod(Vec<u8>),
    #[error("bencode decode failed: {0}")]
    Decode(#[from] bencode::DecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        target: NodeId,
    },
    GetPeers {
        id: NodeId,
        info_hash: NodeId,
    },
    /// A syntactically valid query this node doesn't implement.
    /// `spec.md` §4.B requires replying with error 204.
    Unknown {
        method: Vec<u8>,
    },
}

impl Query {
    pub fn id(&self) -> Option<&NodeId> {
        match self {
            Query::Ping { id } | Query::FindNode { id, .. } | Query::GetPeers { id, .. } => {
                Some(id)
            }
            Query::Unknown { .. } => None,
        }
    }

    pub fn method_name(&self) -> &[u8] {
        match self {
            Query::Ping { .. } => b"ping",
            Query::FindNode { .. } => b"find_node",
            Query::GetPeers { .. } => b"get_peers",
            Query::Unknown { method } => method,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ping {
        id: NodeId,
    },
    FindNode {
        id: NodeId,
        /// Concatenation of compact 26-byte node entries.
        nodes: Vec<u8>,
    },
    GetPeersValues {
        id: NodeId,
        token: Vec<u8>,
        /// Compact 6-byte peer endpoints.
        values: Vec<[u8; 6]>,
    },
    GetPeersNodes {
        id: NodeId,
        token: Vec<u8>,
        nodes: Vec<u8>,
    },
}

impl Response {
    pub fn id(&self) -> &NodeId {
        match self {
            Response::Ping { id }
            | Response::FindNode { id, .. }
            | Response::GetPeersValues { id, .. }
            | Response::GetPeersNodes { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPayload {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KrpcMessage {
    Query { t: TransactionId, query: Query },
    Response { t: TransactionId, response: Response },
    Error { t: TransactionId, error: ErrorPayload },
}

impl KrpcMessage {
    pub fn transaction_id(&self) -> &TransactionId {
        match self {
            KrpcMessage::Query { t, .. }
            | KrpcMessage::Response { t, .. }
            | KrpcMessage::Error { t, .. } => t,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let value = self.to_value();
        // Every KrpcMessage we build encodes to a Dict, which is total.
        bencode::encode(&value).expect("krpc envelope always encodes")
    }

    pub fn to_value(&self) -> Value {
        let mut top = BTreeMap::new();
        top.insert(b"t".to_vec(), Value::bytes(self.transaction_id().clone()));
        match self {
            KrpcMessage::Query { query, .. } => {
                top.insert(b"y".to_vec(), Value::bytes(*b"q"));
                top.insert(b"q".to_vec(), Value::bytes(query.method_name().to_vec()));
                top.insert(b"a".to_vec(), Value::Dict(query_args(query)));
            }
            KrpcMessage::Response { response, .. } => {
                top.insert(b"y".to_vec(), Value::bytes(*b"r"));
                top.insert(b"r".to_vec(), Value::Dict(response_fields(response)));
            }
            KrpcMessage::Error { error, .. } => {
                top.insert(b"y".to_vec(), Value::bytes(*b"e"));
                top.insert(
                    b"e".to_vec(),
                    Value::List(vec![
                        Value::Int(error.code),
                        Value::bytes(error.message.clone().into_bytes()),
                    ]),
                );
            }
        }
        Value::Dict(top)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<KrpcMessage, MessageError> {
        let value = bencode::decode(bytes)?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<KrpcMessage, MessageError> {
        let dict = value
            .as_dict()
            .ok_or_else(|| MessageError::Malformed("top-level value is not a dict".into()))?;
        let t = get_bytes(dict, b"t")?.to_vec();
        let y = get_bytes(dict, b"y")?;
        match y {
            b"q" => {
                let method = get_bytes(dict, b"q")?.to_vec();
                let args = get_dict(dict, b"a")?;
                let query = parse_query(&method, args)?;
                Ok(KrpcMessage::Query { t, query })
            }
            b"r" => {
                let fields = get_dict(dict, b"r")?;
                let response = parse_response(fields)?;
                Ok(KrpcMessage::Response { t, response })
            }
            b"e" => {
                let items = dict
                    .get(b"e".as_slice())
                    .and_then(Value::as_list)
                    .ok_or_else(|| MessageError::Malformed("missing e list".into()))?;
                if items.len() != 2 {
                    return Err(MessageError::Malformed("e list must have 2 items".into()));
                }
                let code = items[0]
                    .as_int()
                    .ok_or_else(|| MessageError::Malformed("e code not an int".into()))?;
                let message = items[1]
                    .as_bytes()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .ok_or_else(|| MessageError::Malformed("e message not bytes".into()))?;
                Ok(KrpcMessage::Error {
                    t,
                    error: ErrorPayload { code, message },
                })
            }
            other => Err(MessageError::Malformed(format!(
                "unknown message class {:?}",
                other
            ))),
        }
    }
}

fn query_args(query: &Query) -> BTreeMap<Vec<u8>, Value> {
    let mut args = BTreeMap::new();
    match query {
        Query::Ping { id } => {
            args.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
        }
        Query::FindNode { id, target } => {
            args.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            args.insert(b"target".to_vec(), Value::bytes(target.as_bytes().to_vec()));
        }
        Query::GetPeers { id, info_hash } => {
            args.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            args.insert(
                b"info_hash".to_vec(),
                Value::bytes(info_hash.as_bytes().to_vec()),
            );
        }
        Query::Unknown { .. } => {}
    }
    args
}

fn response_fields(response: &Response) -> BTreeMap<Vec<u8>, Value> {
    let mut fields = BTreeMap::new();
    match response {
        Response::Ping { id } => {
            fields.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
        }
        Response::FindNode { id, nodes } => {
            fields.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            fields.insert(b"nodes".to_vec(), Value::bytes(nodes.clone()));
        }
        Response::GetPeersValues { id, token, values } => {
            fields.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            fields.insert(b"token".to_vec(), Value::bytes(token.clone()));
            let list = values.iter().map(|v| Value::bytes(v.to_vec())).collect();
            fields.insert(b"values".to_vec(), Value::List(list));
        }
        Response::GetPeersNodes { id, token, nodes } => {
            fields.insert(b"id".to_vec(), Value::bytes(id.as_bytes().to_vec()));
            fields.insert(b"token".to_vec(), Value::bytes(token.clone()));
            fields.insert(b"nodes".to_vec(), Value::bytes(nodes.clone()));
        }
    }
    fields
}

fn parse_query(method: &[u8], args: &BTreeMap<Vec<u8>, Value>) -> Result<Query, MessageError> {
    match method {
        b"ping" => Ok(Query::Ping {
            id: get_node_id(args, b"id")?,
        }),
        b"find_node" => Ok(Query::FindNode {
            id: get_node_id(args, b"id")?,
            target: get_node_id(args, b"target")?,
        }),
        b"get_peers" => Ok(Query::GetPeers {
            id: get_node_id(args, b"id")?,
            info_hash: get_node_id(args, b"info_hash")?,
        }),
        other => Ok(Query::Unknown {
            method: other.to_vec(),
        }),
    }
}

fn parse_response(fields: &BTreeMap<Vec<u8>, Value>) -> Result<Response, MessageError> {
    let id = get_node_id(fields, b"id")?;
    if let Some(nodes) = fields.get(b"nodes".as_slice()) {
        let nodes = nodes
            .as_bytes()
            .ok_or_else(|| MessageError::Malformed("nodes not bytes".into()))?
            .to_vec();
        if let Some(token) = fields.get(b"token".as_slice()) {
            let token = token
                .as_bytes()
                .ok_or_else(|| MessageError::Malformed("token not bytes".into()))?
                .to_vec();
            return Ok(Response::GetPeersNodes { id, token, nodes });
        }
        return Ok(Response::FindNode { id, nodes });
    }
    if let Some(values) = fields.get(b"values".as_slice()) {
        let token = get_bytes(fields, b"token")?.to_vec();
        let items = values
            .as_list()
            .ok_or_else(|| MessageError::Malformed("values not a list".into()))?;
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            let raw = item
                .as_bytes()
                .ok_or_else(|| MessageError::Malformed("value entry not bytes".into()))?;
            if raw.len() != 6 {
                return Err(MessageError::Malformed("value entry not 6 bytes".into()));
            }
            let mut entry = [0u8; 6];
            entry.copy_from_slice(raw);
            out.push(entry);
        }
        return Ok(Response::GetPeersValues {
            id,
            token,
            values: out,
        });
    }
    Ok(Response::Ping { id })
}

fn get_bytes<'a>(
    dict: &'a BTreeMap<Vec<u8>, Value>,
    key: &'static [u8],
) -> Result<&'a [u8], MessageError> {
    dict.get(key)
        .and_then(Value::as_bytes)
        .ok_or_else(|| MessageError::Malformed(format!("missing/bad key {:?}", key)))
}

fn get_dict<'a>(
    dict: &'a BTreeMap<Vec<u8>, Value>,
    key: &'static [u8],
) -> Result<&'a BTreeMap<Vec<u8>, Value>, MessageError> {
    dict.get(key)
        .and_then(Value::as_dict)
        .ok_or_else(|| MessageError::Malformed(format!("missing/bad dict key {:?}", key)))
}

fn get_node_id(
    dict: &BTreeMap<Vec<u8>, Value>,
    key: &'static [u8],
) -> Result<NodeId, MessageError> {
    let bytes = get_bytes(dict, key)?;
    NodeId::from_slice(bytes).ok_or_else(|| MessageError::Malformed(format!("bad id length for {:?}", key)))
}

fn gen_token() -> Vec<u8> {
    use rand::RngCore;
    let mut token = vec![0u8; 10];
    rand::thread_rng().fill_bytes(&mut token);
    token
}

/// Binds a self-id and a monotone, process-wide transaction counter to
/// produce outgoing KRPC queries and responses, per `spec.md` §4.B.
pub struct KrpcBuilder {
    self_id: NodeId,
    counter: AtomicU32,
}

impl KrpcBuilder {
    pub fn new(self_id: NodeId) -> Self {
        KrpcBuilder {
            self_id,
            counter: AtomicU32::new(0),
        }
    }

    pub fn self_id(&self) -> NodeId {
        self.self_id
    }

    fn next_transaction_id(&self) -> TransactionId {
        let value = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        value.to_be_bytes().to_vec()
    }

    pub fn ping(&self) -> KrpcMessage {
        KrpcMessage::Query {
            t: self.next_transaction_id(),
            query: Query::Ping { id: self.self_id },
        }
    }

    pub fn find_node(&self, target: NodeId) -> KrpcMessage {
        KrpcMessage::Query {
            t: self.next_transaction_id(),
            query: Query::FindNode {
                id: self.self_id,
                target,
            },
        }
    }

    pub fn get_peers(&self, info_hash: NodeId) -> KrpcMessage {
        KrpcMessage::Query {
            t: self.next_transaction_id(),
            query: Query::GetPeers {
                id: self.self_id,
                info_hash,
            },
        }
    }

    pub fn ping_response(&self, t: TransactionId) -> KrpcMessage {
        KrpcMessage::Response {
            t,
            response: Response::Ping { id: self.self_id },
        }
    }

    pub fn find_node_response(&self, t: TransactionId, closest: &[Node]) -> KrpcMessage {
        let nodes = node::compact_node_list(closest, 8);
        KrpcMessage::Response {
            t,
            response: Response::FindNode {
                id: self.self_id,
                nodes,
            },
        }
    }

    pub fn get_peers_response_values(&self, t: TransactionId, values: Vec<[u8; 6]>) -> KrpcMessage {
        KrpcMessage::Response {
            t,
            response: Response::GetPeersValues {
                id: self.self_id,
                token: gen_token(),
                values,
            },
        }
    }

    pub fn get_peers_response_nodes(&self, t: TransactionId, closest: &[Node]) -> KrpcMessage {
        let nodes = node::compact_node_list(closest, 8);
        KrpcMessage::Response {
            t,
            response: Response::GetPeersNodes {
                id: self.self_id,
                token: gen_token(),
                nodes,
            },
        }
    }

    pub fn error(&self, t: TransactionId, code: i64, message: impl Into<String>) -> KrpcMessage {
        KrpcMessage::Error {
            t,
            error: ErrorPayload {
                code,
                message: message.into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_transaction_ids() {
        let builder = KrpcBuilder::new(NodeId::random());
        let first = builder.next_transaction_id();
        let second = builder.next_transaction_id();
        assert_eq!(first, vec![0, 0, 0, 1]);
        assert_eq!(second, vec![0, 0, 0, 2]);
    }

    #[test]
    fn ping_round_trip() {
        let builder = KrpcBuilder::new(NodeId::random());
        let msg = builder.ping();
        let bytes = msg.to_bytes();
        let decoded = KrpcMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn find_node_round_trip() {
        let builder = KrpcBuilder::new(NodeId::random());
        let target = NodeId::random();
        let msg = builder.find_node(target);
        let bytes = msg.to_bytes();
        let decoded = KrpcMessage::from_bytes(&bytes).unwrap();
        match decoded {
            KrpcMessage::Query {
                query: Query::FindNode { target: t, .. },
                ..
            } => assert_eq!(t, target),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn get_peers_query_round_trip() {
        let builder = KrpcBuilder::new(NodeId::random());
        let info_hash = NodeId::random();
        let msg = builder.get_peers(info_hash);
        let bytes = msg.to_bytes();
        let decoded = KrpcMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn get_peers_response_values_round_trip() {
        let builder = KrpcBuilder::new(NodeId::random());
        let values = vec![[127, 0, 0, 1, 0x1a, 0xe1], [10, 0, 0, 2, 0x1a, 0xe2]];
        let msg = builder.get_peers_response_values(vec![9, 9, 9, 9], values.clone());
        let bytes = msg.to_bytes();
        let decoded = KrpcMessage::from_bytes(&bytes).unwrap();
        match decoded {
            KrpcMessage::Response {
                response: Response::GetPeersValues { id, token, values: decoded_values },
                ..
            } => {
                assert_eq!(id, builder.self_id());
                assert_eq!(decoded_values, values);
                assert_eq!(token.len(), 10);
            }
            other => panic!("expected GetPeersValues, got {other:?}"),
        }
    }

    #[test]
    fn get_peers_response_nodes_round_trip() {
        let builder = KrpcBuilder::new(NodeId::random());
        let closest = vec![
            Node::new(NodeId::random(), "127.0.0.1:6881".parse().unwrap()),
            Node::new(NodeId::random(), "127.0.0.1:6882".parse().unwrap()),
        ];
        let msg = builder.get_peers_response_nodes(vec![1, 2, 3, 4], &closest);
        let bytes = msg.to_bytes();
        let decoded = KrpcMessage::from_bytes(&bytes).unwrap();
        match decoded {
            KrpcMessage::Response {
                response: Response::GetPeersNodes { id, token, nodes },
                ..
            } => {
                assert_eq!(id, builder.self_id());
                assert_eq!(token.len(), 10);
                let parsed = node::parse_compact_nodes(&nodes);
                let ids: Vec<NodeId> = parsed.iter().map(|n| n.id).collect();
                let expected: Vec<NodeId> = closest.iter().map(|n| n.id).collect();
                assert_eq!(ids, expected);
            }
            other => panic!("expected GetPeersNodes, got {other:?}"),
        }
    }

    #[test]
    fn unknown_method_parses_and_replies_error() {
        let builder = KrpcBuilder::new(NodeId::random());
        let raw = b"d1:ad2:id20:aaaaaaaaaaaaaaaaaaaae1:q9:announce1:t2:aa1:y1:qe";
        let decoded = KrpcMessage::from_bytes(raw).unwrap();
        match decoded {
            KrpcMessage::Query {
                t,
                query: Query::Unknown { method },
            } => {
                assert_eq!(method, b"announce");
                let err = builder.error(t, ERR_UNKNOWN_METHOD, "unknown method");
                assert!(matches!(err, KrpcMessage::Error { .. }));
            }
            _ => panic!("expected unknown query"),
        }
    }

    #[test]
    fn error_round_trip() {
        let builder = KrpcBuilder::new(NodeId::random());
        let msg = builder.error(vec![1, 2, 3, 4], ERR_PROTOCOL, "bad token");
        let bytes = msg.to_bytes();
        let decoded = KrpcMessage::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
