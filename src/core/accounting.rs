use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info};

/// Cumulative byte totals of one connection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TrafficSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Read and write totals behind one lock; both relay directions update it.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    totals: Mutex<TrafficSnapshot>,
}

impl TrafficCounters {
    fn add_read(&self, n: usize) -> u64 {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.bytes_read += n as u64;
        totals.bytes_read
    }

    fn add_written(&self, n: usize) -> u64 {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.bytes_written += n as u64;
        totals.bytes_written
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        *self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pass-through stream that counts the bytes actually moved in each direction.
pub struct AccountingConn<S> {
    inner: S,
    label: String,
    counters: Arc<TrafficCounters>,
}

impl<S> AccountingConn<S> {
    pub fn new(inner: S, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            counters: Arc::new(TrafficCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<TrafficCounters> {
        self.counters.clone()
    }

    /// Shuts the transport down, logs the totals and hands them back.
    pub async fn close(mut self) -> TrafficSnapshot
    where
        S: AsyncWrite + Unpin,
    {
        if let Err(e) = self.inner.shutdown().await {
            debug!(target_addr = %self.label, "shutdown after relay: {}", e);
        }
        let totals = self.counters.snapshot();
        info!(
            target_addr = %self.label,
            bytes_read = totals.bytes_read,
            bytes_written = totals.bytes_written,
            "connection closed"
        );
        totals
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AccountingConn<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            if n > 0 {
                let total = this.counters.add_read(n);
                debug!(target_addr = %this.label, "read {} bytes (total: {} bytes)", n, total);
            }
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AccountingConn<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let res = Pin::new(&mut this.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res
            && n > 0
        {
            let total = this.counters.add_written(n);
            debug!(target_addr = %this.label, "wrote {} bytes (total: {} bytes)", n, total);
        }
        res
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
