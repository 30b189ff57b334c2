/// Failure conditions that callers need to tell apart. Everything else travels as a plain
///  `anyhow::Error`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// no data arrived (or no window credit became available) before the deadline
    #[error("timed out")]
    Timeout,

    /// the transport was stopped, or the peer closed the channel
    #[error("channel closed")]
    Closed,

    #[error("malformed data: {0}")]
    Malformed(String),
}

/// The peer answered a command with an error status line. The text is the status line's
///  message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("server error: {0}")]
pub struct ServerError(pub String);

pub fn is_timeout(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<TransportError>(), Some(TransportError::Timeout))
}

pub fn is_closed(e: &anyhow::Error) -> bool {
    matches!(e.downcast_ref::<TransportError>(), Some(TransportError::Closed))
}


#[cfg(test)]
mod tests {
    use anyhow::Context;
    use super::*;

    #[test]
    fn test_classification_survives_context() {
        let e = Err::<(), _>(TransportError::Timeout)
            .context("reading next command")
            .unwrap_err();
        assert!(is_timeout(&e));
        assert!(!is_closed(&e));

        let e = anyhow::Error::from(TransportError::Closed);
        assert!(is_closed(&e));
        assert!(!is_timeout(&e));

        let e = anyhow::anyhow!("disk full");
        assert!(!is_timeout(&e));
        assert!(!is_closed(&e));
    }
}
