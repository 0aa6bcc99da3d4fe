use futures::future::{select_all, BoxFuture};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use floe_core::error::{FloeError, Result};

/// Bounded FIFO queue between two participants.
///
/// `emit` suspends while the queue holds `capacity` items and `fetch`
/// suspends while it is empty. Nothing is ever dropped: a full queue
/// always shows up as suspension on the producer side.
pub struct Floe<T> {
    name: String,
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    closed: CancellationToken,
}

impl<T: Send> Floe<T> {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    /// Number of items currently queued.
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Close the floe. Pending items can still be fetched; new emits fail.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub async fn emit(&self, item: T) -> Result<()> {
        if self.is_closed() {
            return Err(FloeError::EdgeClosed(self.name.clone()));
        }
        tokio::select! {
            res = self.tx.send(item) => res.map_err(|_| FloeError::EdgeClosed(self.name.clone())),
            _ = self.closed.cancelled() => Err(FloeError::EdgeClosed(self.name.clone())),
        }
    }

    pub async fn fetch(&self) -> Result<T> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            biased;
            item = rx.recv() => item.ok_or_else(|| FloeError::EdgeClosed(self.name.clone())),
            _ = self.closed.cancelled() => Err(FloeError::EdgeClosed(self.name.clone())),
        }
    }

    /// Like [`emit`](Self::emit), but a cancelled token releases the waiter
    /// with `FloeError::Cancelled`.
    pub async fn emit_or_cancel(&self, item: T, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FloeError::Cancelled),
            res = self.emit(item) => res,
        }
    }

    pub async fn fetch_or_cancel(&self, cancel: &CancellationToken) -> Result<T> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FloeError::Cancelled),
            res = self.fetch() => res,
        }
    }

    /// Fetch from whichever floe has an item first. Returns the index of the
    /// floe that produced it.
    pub async fn fetch_any(floes: &[&Floe<T>]) -> Result<(usize, T)> {
        if floes.is_empty() {
            return Err(FloeError::EdgeClosed("no upstream edges".into()));
        }
        let futs: Vec<BoxFuture<'_, Result<T>>> =
            floes.iter().map(|f| Box::pin(f.fetch()) as BoxFuture<'_, Result<T>>).collect();
        let (res, index, _rest) = select_all(futs).await;
        res.map(|item| (index, item))
    }

    pub async fn fetch_any_or_cancel(
        floes: &[&Floe<T>],
        cancel: &CancellationToken,
    ) -> Result<(usize, T)> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FloeError::Cancelled),
            res = Self::fetch_any(floes) => res,
        }
    }
}

impl<T> std::fmt::Debug for Floe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Floe")
            .field("name", &self.name)
            .field("capacity", &self.tx.max_capacity())
            .field("depth", &(self.tx.max_capacity() - self.tx.capacity()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_emit_suspends_at_capacity() {
        let floe = Arc::new(Floe::new("a->b", 2));
        floe.emit(1).await.unwrap();
        floe.emit(2).await.unwrap();
        assert_eq!(floe.depth(), 2);

        // The third emit must wait for a fetch.
        let blocked = tokio::time::timeout(Duration::from_millis(50), floe.emit(3)).await;
        assert!(blocked.is_err());
        assert_eq!(floe.depth(), 2);

        let producer = {
            let floe = floe.clone();
            tokio::spawn(async move { floe.emit(3).await })
        };
        tokio::task::yield_now().await;
        assert!(!producer.is_finished());

        assert_eq!(floe.fetch().await.unwrap(), 1);
        producer.await.unwrap().unwrap();
        assert_eq!(floe.fetch().await.unwrap(), 2);
        assert_eq!(floe.fetch().await.unwrap(), 3);
        assert_eq!(floe.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_suspends_when_empty() {
        let floe: Floe<u32> = Floe::new("a->b", 1);
        let res = tokio::time::timeout(Duration::from_millis(50), floe.fetch()).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_cancel_releases_waiters() {
        let floe: Floe<u32> = Floe::new("a->b", 1);
        let token = CancellationToken::new();
        token.cancel();
        let err = floe.fetch_or_cancel(&token).await.unwrap_err();
        assert!(matches!(err, FloeError::Cancelled));

        floe.emit(1).await.unwrap();
        let err = floe.emit_or_cancel(2, &token).await.unwrap_err();
        assert!(matches!(err, FloeError::Cancelled));
        assert_eq!(floe.depth(), 1);
    }

    #[tokio::test]
    async fn test_close_drains_then_errors() {
        let floe: Floe<u32> = Floe::new("a->b", 4);
        floe.emit(7).await.unwrap();
        floe.close();
        assert!(matches!(floe.emit(8).await, Err(FloeError::EdgeClosed(_))));
        assert_eq!(floe.fetch().await.unwrap(), 7);
        assert!(matches!(floe.fetch().await, Err(FloeError::EdgeClosed(_))));
    }

    #[tokio::test]
    async fn test_fetch_any_returns_ready_floe() {
        let a: Floe<&str> = Floe::new("a", 1);
        let b: Floe<&str> = Floe::new("b", 1);
        b.emit("from-b").await.unwrap();
        let (idx, item) = Floe::fetch_any(&[&a, &b]).await.unwrap();
        assert_eq!(idx, 1);
        assert_eq!(item, "from-b");
    }
}
