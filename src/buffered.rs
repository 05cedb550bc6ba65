//! Rate-limited buffered sink for the migration byte stream
//!
//! Adapts an upstream byte producer to a downstream async sink under a
//! configured bandwidth cap. Bytes are batched into a growable buffer and
//! drained opportunistically; a periodic tick (every 100 ms) opens a new
//! rate window and retries a frozen drain.

use thiserror::Error;

/// Length of the rate window serviced by [`BufferedSink::tick`]
pub const TICK_INTERVAL_MS: u64 = 100;

/// Extra capacity reserved beyond each append
const BUFFER_SLACK: usize = 1024;

/// Downstream errors surfaced by a [`MigrationSink`]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The sink cannot accept data right now; retry after the next tick.
    #[error("sink would block")]
    WouldBlock,
    /// The sink failed permanently.
    #[error("sink failed: {0}")]
    Failed(String),
}

/// Answer to a rate-limit query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimit {
    /// The producer may keep sending.
    Ready,
    /// Throttled or frozen; wait for a tick.
    Throttled,
    /// A fatal downstream error is pending.
    Error,
}

/// Async byte sink the buffered writer drains into
pub trait MigrationSink {
    /// Try to write; returns the number of bytes accepted.
    fn put_buffer(&mut self, buf: &[u8]) -> Result<usize, SinkError>;

    /// Block until the sink is writable again. Only called from
    /// [`BufferedSink::close`], which must drain the remaining bytes.
    fn wait_for_unfreeze(&mut self);

    /// The stream can accept more data; poke the producer.
    fn put_ready(&mut self);

    /// Close the downstream channel.
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Bandwidth-shaped buffered writer over a [`MigrationSink`]
pub struct BufferedSink<S: MigrationSink> {
    sink: S,
    buffer: Vec<u8>,
    /// Bytes sent downstream in the current rate window
    bytes_xfer: usize,
    /// Bytes allowed per window (bandwidth / 10)
    xfer_limit: usize,
    freeze_output: bool,
    error: Option<SinkError>,
}

impl<S: MigrationSink> BufferedSink<S> {
    /// Create a sink shaped to `bandwidth_limit` bytes per second.
    pub fn new(sink: S, bandwidth_limit: u64) -> Self {
        BufferedSink {
            sink,
            buffer: Vec::new(),
            bytes_xfer: 0,
            xfer_limit: (bandwidth_limit / 10) as usize,
            freeze_output: false,
            error: None,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Bytes currently buffered and not yet drained.
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes drained in the current rate window.
    pub fn bytes_xfer(&self) -> usize {
        self.bytes_xfer
    }

    pub fn is_frozen(&self) -> bool {
        self.freeze_output
    }

    fn append(&mut self, data: &[u8]) {
        if self.buffer.capacity() - self.buffer.len() < data.len() {
            log::debug!(
                "increasing buffer capacity from {} by {}",
                self.buffer.capacity(),
                data.len() + BUFFER_SLACK
            );
            self.buffer.reserve(data.len() + BUFFER_SLACK);
        }
        self.buffer.extend_from_slice(data);
    }

    /// Drain as much as the window and the sink allow. Undrained bytes
    /// stay at the front of the buffer.
    fn flush(&mut self) {
        if self.error.is_some() {
            log::debug!("flush with error pending, bailing");
            return;
        }

        let mut offset = 0;
        while self.bytes_xfer < self.xfer_limit && offset < self.buffer.len() {
            // Never offer more than the window has left, so the shaped
            // rate holds no matter how much the sink accepts per call.
            let want = (self.xfer_limit - self.bytes_xfer).min(self.buffer.len() - offset);
            match self.sink.put_buffer(&self.buffer[offset..offset + want]) {
                Ok(0) => {
                    self.error = Some(SinkError::Failed("sink made no progress".to_string()));
                    break;
                }
                Ok(n) => {
                    offset += n;
                    self.bytes_xfer += n;
                }
                Err(SinkError::WouldBlock) => {
                    log::debug!("sink not ready, freezing");
                    self.freeze_output = true;
                    break;
                }
                Err(e) => {
                    log::warn!("error flushing data: {}", e);
                    self.error = Some(e);
                    break;
                }
            }
        }

        log::debug!("flushed {} of {} byte(s)", offset, self.buffer.len());
        self.buffer.drain(..offset);
    }

    /// Append `data` and attempt a drain. An empty slice only drains
    /// pending bytes and, when the stream has headroom, notifies the
    /// producer through `put_ready`.
    pub fn put_buffer(&mut self, data: &[u8]) -> Result<usize, SinkError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }

        self.freeze_output = false;

        if !data.is_empty() {
            log::debug!("buffering {} bytes", data.len());
            self.append(data);
        }

        self.flush();

        if data.is_empty() && !self.freeze_output && self.bytes_xfer < self.xfer_limit {
            self.sink.put_ready();
        }

        Ok(data.len())
    }

    /// 100 ms periodic tick: open a new rate window and retry the drain.
    /// With a fatal error pending, tear the stream down instead.
    pub fn tick(&mut self) {
        if self.error.is_some() {
            let _ = self.close_internal();
            return;
        }

        if self.freeze_output {
            return;
        }

        self.bytes_xfer = 0;
        let _ = self.put_buffer(&[]);
    }

    /// May the producer keep sending?
    pub fn rate_limit(&self) -> RateLimit {
        if self.error.is_some() {
            return RateLimit::Error;
        }
        if self.freeze_output {
            return RateLimit::Throttled;
        }
        if self.bytes_xfer >= self.xfer_limit {
            return RateLimit::Throttled;
        }
        RateLimit::Ready
    }

    /// Reshape to a new bandwidth in bytes per second; returns the
    /// resulting per-window limit.
    pub fn set_rate_limit(&mut self, bandwidth: u64) -> usize {
        if self.error.is_none() {
            self.xfer_limit = (bandwidth / 10) as usize;
        }
        self.xfer_limit
    }

    pub fn get_rate_limit(&self) -> usize {
        self.xfer_limit
    }

    fn close_internal(&mut self) -> Result<(), SinkError> {
        log::debug!("closing, {} byte(s) still buffered", self.buffer.len());

        // Rate limiting no longer applies; push everything out, yielding
        // to the sink whenever it blocks.
        self.xfer_limit = usize::MAX;
        while self.error.is_none() && !self.buffer.is_empty() {
            self.flush();
            if self.freeze_output {
                self.sink.wait_for_unfreeze();
                self.freeze_output = false;
            }
        }

        let ret = self.sink.close();
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        ret
    }

    /// Drain everything and close the downstream channel.
    pub fn close(mut self) -> Result<(), SinkError> {
        self.close_internal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct SinkState {
        accepts: Vec<Result<usize, SinkError>>,
        written: Vec<u8>,
        ready_calls: usize,
        unfreeze_calls: usize,
        closed: bool,
    }

    /// Sink that accepts a scripted number of bytes per call and then
    /// everything; state is shared so tests can inspect it after close.
    #[derive(Clone)]
    struct ScriptedSink(Rc<RefCell<SinkState>>);

    impl ScriptedSink {
        fn new(accepts: Vec<Result<usize, SinkError>>) -> Self {
            ScriptedSink(Rc::new(RefCell::new(SinkState {
                accepts,
                ..SinkState::default()
            })))
        }
    }

    impl MigrationSink for ScriptedSink {
        fn put_buffer(&mut self, buf: &[u8]) -> Result<usize, SinkError> {
            let mut state = self.0.borrow_mut();
            let step = if state.accepts.is_empty() {
                Ok(buf.len())
            } else {
                state.accepts.remove(0)
            };
            match step {
                Ok(n) => {
                    let n = n.min(buf.len());
                    let chunk = buf[..n].to_vec();
                    state.written.extend_from_slice(&chunk);
                    Ok(n)
                }
                Err(e) => Err(e),
            }
        }

        fn wait_for_unfreeze(&mut self) {
            self.0.borrow_mut().unfreeze_calls += 1;
        }

        fn put_ready(&mut self) {
            self.0.borrow_mut().ready_calls += 1;
        }

        fn close(&mut self) -> Result<(), SinkError> {
            self.0.borrow_mut().closed = true;
            Ok(())
        }
    }

    #[test]
    fn test_appends_and_drains() {
        let sink = ScriptedSink::new(vec![]);
        let mut buffered = BufferedSink::new(sink.clone(), 10_000_000);
        buffered.put_buffer(b"hello world").unwrap();
        assert_eq!(sink.0.borrow().written, b"hello world");
        assert_eq!(buffered.buffered_bytes(), 0);
    }

    #[test]
    fn test_would_block_freezes_and_keeps_remainder() {
        let sink = ScriptedSink::new(vec![Ok(4), Err(SinkError::WouldBlock)]);
        let mut buffered = BufferedSink::new(sink.clone(), 10_000_000);
        buffered.put_buffer(b"abcdefgh").unwrap();
        assert!(buffered.is_frozen());
        assert_eq!(sink.0.borrow().written, b"abcd");
        assert_eq!(buffered.buffered_bytes(), 4);
        assert_eq!(buffered.rate_limit(), RateLimit::Throttled);

        // the tick skips the drain while frozen
        buffered.tick();
        assert_eq!(buffered.buffered_bytes(), 4);

        // the next put unfreezes and retries
        buffered.put_buffer(&[]).unwrap();
        assert_eq!(sink.0.borrow().written, b"abcdefgh");
        assert_eq!(buffered.buffered_bytes(), 0);
    }

    #[test]
    fn test_window_limit_stops_drain() {
        let sink = ScriptedSink::new(vec![]);
        let mut buffered = BufferedSink::new(sink.clone(), 40); // 4 bytes per window
        buffered.put_buffer(b"abcdefgh").unwrap();
        assert_eq!(buffered.bytes_xfer(), 4);
        assert_eq!(buffered.buffered_bytes(), 4);
        assert_eq!(buffered.rate_limit(), RateLimit::Throttled);

        buffered.tick();
        assert_eq!(buffered.buffered_bytes(), 0);
        assert_eq!(sink.0.borrow().written, b"abcdefgh");
    }

    #[test]
    fn test_fatal_error_reported_on_next_put() {
        let sink = ScriptedSink::new(vec![Err(SinkError::Failed("boom".to_string()))]);
        let mut buffered = BufferedSink::new(sink, 10_000_000);
        buffered.put_buffer(b"abc").unwrap();
        assert_eq!(buffered.rate_limit(), RateLimit::Error);
        assert!(buffered.put_buffer(b"more").is_err());
    }

    #[test]
    fn test_close_drains_through_freeze() {
        let sink = ScriptedSink::new(vec![
            Err(SinkError::WouldBlock),
            Err(SinkError::WouldBlock),
        ]);
        let mut buffered = BufferedSink::new(sink.clone(), 10);
        buffered.put_buffer(b"payload").unwrap();
        assert!(buffered.is_frozen());

        buffered.close().unwrap();
        let state = sink.0.borrow();
        assert_eq!(state.written, b"payload");
        assert_eq!(state.unfreeze_calls, 1);
        assert!(state.closed);
    }

    #[test]
    fn test_put_ready_notified_when_drained() {
        let sink = ScriptedSink::new(vec![]);
        let mut buffered = BufferedSink::new(sink.clone(), 10_000_000);
        buffered.put_buffer(b"data").unwrap();
        buffered.tick();
        assert!(sink.0.borrow().ready_calls >= 1);
    }
}
