//! Wire-stable error taxonomy for the parameter server.
//!
//! Every variant here carries a fixed numeric discriminant (`code()`) that is
//! the value transmitted in a [`ReplyHeader`](../ps_wire/struct.ReplyHeader.html)'s
//! `error_code` field. The discriminants must never be renumbered once
//! shipped, since callers across process/version boundaries match on them.

use thiserror::Error;

/// Result alias used throughout the parameter server.
pub type PsResult<T> = std::result::Result<T, PsError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PsError {
    // --- Serialization (1-7) ---
    #[error("failed to serialize request: {0}")]
    SerializeRequest(String),
    #[error("failed to serialize reply: {0}")]
    SerializeReply(String),
    #[error("failed to deserialize request: {0}")]
    DeserializeRequest(String),
    #[error("failed to deserialize reply: {0}")]
    DeserializeReply(String),
    #[error("unsupported compress type: {0}")]
    UnSupportCompressType(u8),
    #[error("snappy compress failed: {0}")]
    SnappyCompress(String),
    #[error("snappy uncompress failed: {0}")]
    SnappyUncompress(String),

    // --- Routing (8-10) ---
    #[error("unregistered rpc function: {0}")]
    UnRegisterFunc(u32),
    #[error("request routed to the wrong node (owner is {owner})")]
    RouteWrongNode { owner: u64 },
    #[error("router version mismatch: caller has {caller}, node has {node}")]
    RouterVersionMismatch { caller: u64, node: u64 },

    // --- Concurrency / lifecycle (11-13) ---
    #[error("node status {status:#04x} is inappropriate for this operation")]
    NodeStatusInappropriate { status: u8 },
    #[error("rpc timed out")]
    TimeoutError,
    #[error("unsupported event: {0}")]
    UnSupportEvent(String),

    // --- Model / table (14-21) ---
    #[error("model has not been initialized")]
    ModelNotInitialized,
    #[error("model has already been created")]
    ModelAlreadyCreate,
    #[error("table {0} has already been created")]
    TableAlreadyCreate(u64),
    #[error("table {0} does not exist")]
    TableNotExist(u64),
    #[error("dense table {0} is incompatible with the given value")]
    DenseTableUnCompatible(u64),
    #[error("sparse table {0} is incompatible with the given value")]
    SparseTableUnCompatible(u64),
    #[error("sparse dimension mismatch: expected {expected}, got {actual}")]
    SparseDimensionError { expected: i64, actual: i64 },
    #[error("gradient is incompatible with the target value")]
    GradientUnCompatible,

    // --- Optim / init (22-23) ---
    #[error("unsupported optimizer type: {0}")]
    UnSupportOptimType(String),
    #[error("unsupported initializer type: {0}")]
    UnSupportInitializerType(String),

    // --- Ambient (24-25): not part of spec's wire taxonomy, used internally
    // for filesystem/process-boundary failures (checkpoint I/O, binding a
    // listen socket) that never cross the RPC wire as a typed code.
    #[error("io error: {0}")]
    Io(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl PsError {
    /// The stable wire discriminant for this error. Never renumber these.
    pub fn code(&self) -> i32 {
        use PsError::*;
        match self {
            SerializeRequest(_) => 1,
            SerializeReply(_) => 2,
            DeserializeRequest(_) => 3,
            DeserializeReply(_) => 4,
            UnSupportCompressType(_) => 5,
            SnappyCompress(_) => 6,
            SnappyUncompress(_) => 7,
            UnRegisterFunc(_) => 8,
            RouteWrongNode { .. } => 9,
            RouterVersionMismatch { .. } => 10,
            NodeStatusInappropriate { .. } => 11,
            TimeoutError => 12,
            UnSupportEvent(_) => 13,
            ModelNotInitialized => 14,
            ModelAlreadyCreate => 15,
            TableAlreadyCreate(_) => 16,
            TableNotExist(_) => 17,
            DenseTableUnCompatible(_) => 18,
            SparseTableUnCompatible(_) => 19,
            SparseDimensionError { .. } => 20,
            GradientUnCompatible => 21,
            UnSupportOptimType(_) => 22,
            UnSupportInitializerType(_) => 23,
            Io(_) => 24,
            Internal(_) => 25,
        }
    }

    /// Reconstruct a (message-less) error from a wire code, for the client
    /// side of an RPC that only received a `ReplyHeader`.
    pub fn from_code(code: i32) -> PsError {
        use PsError::*;
        match code {
            1 => SerializeRequest("remote error".into()),
            2 => SerializeReply("remote error".into()),
            3 => DeserializeRequest("remote error".into()),
            4 => DeserializeReply("remote error".into()),
            5 => UnSupportCompressType(0),
            6 => SnappyCompress("remote error".into()),
            7 => SnappyUncompress("remote error".into()),
            8 => UnRegisterFunc(0),
            9 => RouteWrongNode { owner: 0 },
            10 => RouterVersionMismatch { caller: 0, node: 0 },
            11 => NodeStatusInappropriate { status: 0 },
            12 => TimeoutError,
            13 => UnSupportEvent("remote error".into()),
            14 => ModelNotInitialized,
            15 => ModelAlreadyCreate,
            16 => TableAlreadyCreate(0),
            17 => TableNotExist(0),
            18 => DenseTableUnCompatible(0),
            19 => SparseTableUnCompatible(0),
            20 => SparseDimensionError { expected: 0, actual: 0 },
            21 => GradientUnCompatible,
            22 => UnSupportOptimType("remote error".into()),
            23 => UnSupportInitializerType("remote error".into()),
            24 => Io("remote error".into()),
            _ => Internal(format!("unknown remote error code {code}")),
        }
    }

    /// True if a worker should refresh its cached [`Router`] and retry the
    /// single request that produced this error, rather than propagating it.
    pub fn is_retryable_routing_error(&self) -> bool {
        matches!(
            self,
            PsError::RouteWrongNode { .. } | PsError::RouterVersionMismatch { .. }
        )
    }
}

impl From<std::io::Error> for PsError {
    fn from(e: std::io::Error) -> Self {
        PsError::Io(e.to_string())
    }
}

impl From<bincode::Error> for PsError {
    fn from(e: bincode::Error) -> Self {
        PsError::DeserializeRequest(e.to_string())
    }
}

impl From<serde_json::Error> for PsError {
    fn from(e: serde_json::Error) -> Self {
        PsError::Io(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_round_trips_through_discriminant_only() {
        let errs = [
            PsError::RouteWrongNode { owner: 7 },
            PsError::TableNotExist(42),
            PsError::TimeoutError,
            PsError::ModelNotInitialized,
        ];
        for e in errs {
            let code = e.code();
            let back = PsError::from_code(code);
            assert_eq!(back.code(), code);
        }
    }

    #[test]
    fn retryable_routing_errors_are_flagged() {
        assert!(PsError::RouteWrongNode { owner: 1 }.is_retryable_routing_error());
        assert!(PsError::RouterVersionMismatch { caller: 1, node: 2 }.is_retryable_routing_error());
        assert!(!PsError::TimeoutError.is_retryable_routing_error());
    }
}
