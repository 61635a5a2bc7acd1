/// Run-completion webhook
///
/// A single POST of `{run_id, status, completed_at}` to the run's
/// notification URL, bounded by a request timeout. Delivery is at most once:
/// failures are logged and dropped.

use crate::error::{CymphonyError, Result};
use crate::workflow::state::RunStatus;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunNotification {
    pub run_id: i64,
    pub status: RunStatus,
    pub completed_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    client: reqwest::Client,
}

impl Notifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CymphonyError::Notification(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn send(&self, url: &str, notification: &RunNotification) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(notification)
            .send()
            .await
            .map_err(|e| CymphonyError::Notification(e.to_string()))?;
        if !response.status().is_success() {
            return Err(CymphonyError::Notification(format!(
                "{} answered {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }

    /// Send once; a failure is logged at warn and swallowed.
    pub async fn deliver(&self, url: &str, notification: &RunNotification) {
        match self.send(url, notification).await {
            Ok(()) => tracing::info!(run_id = notification.run_id, "📣 completion webhook delivered"),
            Err(e) => tracing::warn!(run_id = notification.run_id, "completion webhook dropped: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn posts_the_notification_once() {
        let received: Arc<Mutex<Vec<RunNotification>>> = Arc::default();
        let app = Router::new()
            .route(
                "/hook",
                post(
                    |State(store): State<Arc<Mutex<Vec<RunNotification>>>>, Json(body): Json<RunNotification>| async move {
                        store.lock().await.push(body);
                    },
                ),
            )
            .with_state(Arc::clone(&received));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let notifier = Notifier::new(Duration::from_secs(5)).unwrap();
        let note = RunNotification {
            run_id: 3,
            status: RunStatus::Completed,
            completed_at: Some(10),
        };
        notifier.send(&format!("http://{}/hook", addr), &note).await.unwrap();
        assert_eq!(received.lock().await.as_slice(), &[note]);
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_notification_error() {
        let notifier = Notifier::new(Duration::from_millis(200)).unwrap();
        let note = RunNotification {
            run_id: 1,
            status: RunStatus::Completed,
            completed_at: None,
        };
        let err = notifier.send("http://127.0.0.1:9/hook", &note).await.unwrap_err();
        assert!(matches!(err, CymphonyError::Notification(_)));
        // deliver never fails
        notifier.deliver("http://127.0.0.1:9/hook", &note).await;
    }
}
