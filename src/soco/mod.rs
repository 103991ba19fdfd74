use std::env;

use async_trait::async_trait;
use tracing::info;

mod dispatcher;
mod speaker;
mod supervisor;

pub use dispatcher::{CommandDispatcher, DispatchError};
pub use supervisor::{ProcessSupervisor, StartupPolicy, SupervisorConfig, SupervisorError};

/// The part of the supervisor the dispatcher depends on.
#[async_trait]
pub trait ServerControl: Send + Sync {
    fn server_url(&self) -> String;

    /// Best effort; callers that need a guarantee check the server afterwards.
    async fn ensure_running(&self);
}

/// Flattens an error and its `source()` chain into one line.
pub(crate) fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = inner.source();
    }
    message
}

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("url cannot take path segments")]
    NotABase,
    #[error("path segment {0:?} would be collapsed by url normalization")]
    DotSegment(String),
}

/// Appends each segment percent-encoded, in order.
///
/// `.` and `..` are rejected: a URL cannot carry them as literal segments, even
/// as `%2E`, so sending them would silently shift every later segment.
pub(crate) fn append_segments<'a>(
    url: &mut url::Url,
    segments: impl IntoIterator<Item = &'a str>,
) -> Result<(), PathError> {
    let segments: Vec<&str> = segments.into_iter().collect();
    if let Some(dot) = segments.iter().find(|segment| matches!(**segment, "." | "..")) {
        return Err(PathError::DotSegment((*dot).to_string()));
    }
    url.path_segments_mut()
        .map_err(|()| PathError::NotABase)?
        .pop_if_empty()
        .extend(segments);
    Ok(())
}

fn debug_urls_enabled() -> bool {
    env::var("DEBUG_URLS")
        .map(|value| value.trim() == "1")
        .unwrap_or(false)
}

pub(crate) fn log_outbound(url: &url::Url) {
    if debug_urls_enabled() {
        info!(curl = %format!("curl -X GET '{}'", url.as_str().replace('\'', r"'\''")), "sending request");
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;

    use async_trait::async_trait;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::ServerControl;

    pub async fn serve(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        addr
    }

    /// An address nothing listens on.
    pub async fn closed_addr() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    pub struct FixedServer {
        url: String,
        pub ensured: AtomicUsize,
    }

    impl FixedServer {
        pub fn new(addr: SocketAddr) -> Self {
            Self {
                url: format!("http://{addr}"),
                ensured: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ServerControl for FixedServer {
        fn server_url(&self) -> String {
            self.url.clone()
        }

        async fn ensure_running(&self) {
            self.ensured.fetch_add(1, Ordering::SeqCst);
        }
    }
}
