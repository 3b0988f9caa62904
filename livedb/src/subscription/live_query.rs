use super::{Observer, QuerySubscriptionPool, Unsubscribe};
use crate::error::{LiveDbError, Result};
use crate::query::{Query, QueryResultSet};
use std::sync::Arc;
use tokio::sync::mpsc;

/// A live query as an async stream of result sets.
///
/// ```no_run
/// # async fn demo(db: livedb::Database, query: livedb::Query) -> livedb::Result<()> {
/// let mut live = db.subscribe(query)?;
/// while let Some(result) = live.recv().await {
///     println!("{} threads", result?.count());
/// }
/// # Ok(())
/// # }
/// ```
///
/// Dropping it unsubscribes.
pub struct LiveQuery {
    receiver: mpsc::UnboundedReceiver<Result<Arc<QueryResultSet>>>,
    unsubscribe: Unsubscribe,
}

impl LiveQuery {
    pub(crate) fn open(pool: &Arc<QuerySubscriptionPool>, query: Query) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let errors = sender.clone();
        let observer = Observer::new(move |set| {
            let _ = sender.send(Ok(set));
        })
        .on_error(move |error| {
            let _ = errors.send(Err(LiveDbError::Other(error.to_string())));
        });
        let unsubscribe = pool.add(query, observer)?;
        Ok(LiveQuery {
            receiver,
            unsubscribe,
        })
    }

    /// The next result set, or the next fetch error. `None` once the
    /// subscription is gone.
    pub async fn recv(&mut self) -> Option<Result<Arc<QueryResultSet>>> {
        self.receiver.recv().await
    }

    /// Like `recv`, but skips straight to the newest queued result.
    pub async fn latest(&mut self) -> Option<Result<Arc<QueryResultSet>>> {
        let mut latest = self.receiver.recv().await?;
        while let Ok(next) = self.receiver.try_recv() {
            latest = next;
        }
        Some(latest)
    }

    pub fn signature(&self) -> &str {
        self.unsubscribe.signature()
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        self.unsubscribe.unsubscribe();
    }
}
