pub mod message;

pub use message::{
    ErrorPayload, KrpcBuilder, KrpcMessage, MessageError, Query, Response, TransactionId,
    ERR_GENERIC, ERR_PROTOCOL, ERR_SERVER, ERR_UNKNOWN_METHOD,
};
