#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// A logical error that must never be retried: bad user input, a
    /// disallowed mutation, a missing required field. Surfaced as an event
    /// and/or a status update, never bubbled as a hard failure.
    #[error("invalid input: {0}")]
    UserInput(String),

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// A condition the caller should treat as transient: re-enqueue rather
    /// than mutate status. Used for races the reconciler cannot resolve in
    /// one pass (e.g. resuming while the predecessor pod is still deleting).
    #[error("transient: {0}")]
    Transient(String),

    #[error("grpc error: {source}")]
    Grpc {
        #[from]
        source: tonic::Status,
    },

    #[error("grpc transport error: {source}")]
    Transport {
        #[from]
        source: tonic::transport::Error,
    },
}

impl Error {
    /// Whether the caller should back off and re-enqueue rather than treat
    /// this as a logical failure to surface on status.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transient(_) | Error::Grpc { .. } | Error::Transport { .. } => true,
            Error::Kube { source: kube::Error::Api(ae) } => ae.code != 404,
            Error::Kube { .. } => true,
            Error::UserInput(_) | Error::Json { .. } => false,
        }
    }
}
