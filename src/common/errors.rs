use std::io;

/// 연결 에러인지 확인하는 헬퍼 함수
pub fn is_connection_error(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
    )
}

/// Errors a peer produces simply by going away mid-stream.
///
/// These are normal churn on pooled and public sockets and are only ever
/// logged at debug level.
pub fn is_peer_churn(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::TimedOut | io::ErrorKind::BrokenPipe
    )
}

pub fn is_connection_refused(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::ConnectionRefused
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_and_timeout_are_churn() {
        assert!(is_peer_churn(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_peer_churn(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_peer_churn(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn refused_is_a_connection_error_but_not_churn() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(is_connection_error(&refused));
        assert!(is_connection_refused(&refused));
        assert!(!is_peer_churn(&refused));
    }
}
