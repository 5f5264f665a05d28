//! Shared-secret authentication performed once per accepted connection.

use std::path::Path;

use tokio::io::AsyncRead;
use tracing::{debug, warn};

use super::error::AuthenticationFailure;
use super::frame::read_frame;
use crate::config::CodingSystem;

/// Read the first line of the secret file.
///
/// A missing file means no secret is required. A file that exists but cannot
/// be read is an error: the connection must not proceed unauthenticated.
pub fn load_secret(path: Option<&Path>) -> Result<Option<String>, AuthenticationFailure> {
    let Some(path) = path else {
        return Ok(None);
    };
    if !path.exists() {
        return Ok(None);
    }
    match std::fs::read_to_string(path) {
        Ok(content) => Ok(Some(content.lines().next().unwrap_or_default().to_string())),
        Err(source) => Err(AuthenticationFailure::UnreadableSecret {
            path: path.display().to_string(),
            source,
        }),
    }
}

/// When a secret is configured, the first framed message must be that exact
/// string. Nothing is read when no secret is configured.
pub async fn authenticate<R: AsyncRead + Unpin>(
    reader: &mut R,
    secret: Option<&str>,
    coding: CodingSystem,
) -> Result<(), AuthenticationFailure> {
    let Some(secret) = secret else {
        return Ok(());
    };

    let presented = read_frame(reader, coding).await?;
    if presented.as_str() == Some(secret) {
        debug!("Client authenticated");
        Ok(())
    } else {
        warn!("Client presented an invalid secret");
        Err(AuthenticationFailure::Mismatch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::encode;
    use crate::protocol::sexp::Sexp;

    fn framed(msg: &Sexp) -> Vec<u8> {
        encode(msg, CodingSystem::Utf8Unix).expect("encode")
    }

    #[test]
    fn missing_secret_file_requires_nothing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(".slime-secret");
        assert!(load_secret(Some(&path)).expect("load").is_none());
        assert!(load_secret(None).expect("load").is_none());
    }

    #[test]
    fn secret_is_the_first_line() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join(".slime-secret");
        std::fs::write(&path, "abc\nignored\n").expect("write secret");
        assert_eq!(load_secret(Some(&path)).expect("load").as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn matching_secret_is_accepted() {
        let bytes = framed(&Sexp::string("abc"));
        let mut reader = bytes.as_slice();
        authenticate(&mut reader, Some("abc"), CodingSystem::Utf8Unix)
            .await
            .expect("authenticate");
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let bytes = framed(&Sexp::string("nope"));
        let mut reader = bytes.as_slice();
        assert!(matches!(
            authenticate(&mut reader, Some("abc"), CodingSystem::Utf8Unix).await,
            Err(AuthenticationFailure::Mismatch)
        ));
    }

    #[tokio::test]
    async fn non_string_secret_is_rejected() {
        let bytes = framed(&Sexp::symbol("abc"));
        let mut reader = bytes.as_slice();
        assert!(matches!(
            authenticate(&mut reader, Some("abc"), CodingSystem::Utf8Unix).await,
            Err(AuthenticationFailure::Mismatch)
        ));
    }

    #[tokio::test]
    async fn closed_stream_fails_authentication() {
        let mut reader: &[u8] = b"";
        assert!(matches!(
            authenticate(&mut reader, Some("abc"), CodingSystem::Utf8Unix).await,
            Err(AuthenticationFailure::Framing(_))
        ));
    }

    #[tokio::test]
    async fn no_secret_reads_nothing() {
        let bytes = framed(&Sexp::string("abc"));
        let mut reader = bytes.as_slice();
        authenticate(&mut reader, None, CodingSystem::Utf8Unix)
            .await
            .expect("authenticate");
        assert_eq!(reader.len(), bytes.len());
    }
}
