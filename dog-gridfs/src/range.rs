//! Bounded, seekable reads over stored objects.

use bytes::Bytes;
use std::future::Future;
use std::io::SeekFrom;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tracing::debug;

use crate::receipt::{OpenedRange, ResolvedRange};
use crate::store::GridStore;
use crate::{ByteRange, ByteStream, FileId, GridError, GridResult};

type LoadingFuture = Pin<Box<dyn Future<Output = std::io::Result<Bytes>> + Send + 'static>>;

/// Opens stored objects for range reads
#[derive(Clone)]
pub struct ObjectReader {
    store: Arc<dyn GridStore>,
}

impl ObjectReader {
    pub fn new(store: Arc<dyn GridStore>) -> Self {
        Self { store }
    }

    /// Open bytes `start..=end` (`end` defaults to the last byte and is clamped)
    pub async fn open_range(&self, id: &FileId, start: u64, end: Option<u64>) -> GridResult<OpenedRange> {
        let object = self
            .store
            .get_file(id)
            .await?
            .ok_or_else(|| GridError::not_found(id.as_str()))?;

        let requested = ByteRange::new(start, end);
        let range = match ResolvedRange::resolve(&requested, object.length) {
            Some(range) => range,
            None if start >= object.length => {
                return Err(GridError::OutOfRange {
                    start,
                    length: object.length,
                })
            }
            None => {
                return Err(GridError::invalid(format!(
                    "range end {:?} precedes start {}",
                    end, start
                )))
            }
        };

        debug!(file_id = %id, start = range.start, end = range.end, "opened range");
        let reader = RangeReader::new(self.store.clone(), object.id.clone(), object.chunk_size, range);
        Ok(OpenedRange { object, range, reader })
    }

    /// Open a whole object, or the part named by an HTTP `Range` header
    pub async fn open(&self, id: &FileId, range_header: Option<&str>) -> GridResult<OpenedRange> {
        let Some(header) = range_header else {
            return self.open_range(id, 0, None).await;
        };
        let object = self
            .store
            .get_file(id)
            .await?
            .ok_or_else(|| GridError::not_found(id.as_str()))?;
        let range = parse_range_header(header, object.length)?;
        self.open_range(id, range.start, range.end).await
    }
}

/// Read-only view over `range` of one object, seekable within the range.
///
/// Positions are relative to the start of the range. Sub-chunks are loaded
/// one at a time as the read position reaches them.
pub struct RangeReader {
    store: Arc<dyn GridStore>,
    files_id: FileId,
    chunk_size: u64,
    range: ResolvedRange,
    position: u64,
    current: Option<(u64, Bytes)>,
    loading: Option<(u64, LoadingFuture)>,
    pending_seek: Option<u64>,
}

impl RangeReader {
    pub(crate) fn new(store: Arc<dyn GridStore>, files_id: FileId, chunk_size: u64, range: ResolvedRange) -> Self {
        Self {
            store,
            files_id,
            chunk_size,
            range,
            position: 0,
            current: None,
            loading: None,
            pending_seek: None,
        }
    }

    pub fn range(&self) -> ResolvedRange {
        self.range
    }

    pub fn len(&self) -> u64 {
        self.range.content_length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current position relative to the range start
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Convert into a byte stream
    pub fn into_stream(self) -> ByteStream {
        Box::pin(tokio_util::io::ReaderStream::new(self))
    }

    fn seek_target(&self, seek: SeekFrom) -> std::io::Result<u64> {
        let len = self.len() as i128;
        let target = match seek {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
            SeekFrom::End(delta) => len + delta as i128,
        };
        if target < 0 || target > len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("seek target {} out of range [0, {}]", target, len),
            ));
        }
        Ok(target as u64)
    }

    fn start_loading(&mut self, n: u64) {
        let store = self.store.clone();
        let files_id = self.files_id.clone();
        self.loading = Some((
            n,
            Box::pin(async move {
                match store.read_chunk(&files_id, n).await {
                    Ok(Some(data)) => Ok(data),
                    Ok(None) => Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("sub-chunk {} of {} is missing", n, files_id),
                    )),
                    Err(e) => Err(std::io::Error::other(e)),
                }
            }),
        ));
    }
}

impl AsyncRead for RangeReader {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();

        if this.pending_seek.is_some() {
            return Poll::Ready(Err(std::io::Error::other(
                "seek in progress, call poll_complete before read",
            )));
        }

        loop {
            if this.position >= this.len() || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }
            let absolute = this.range.start + this.position;
            let n = absolute / this.chunk_size;

            if let Some((loaded, data)) = &this.current {
                if *loaded == n {
                    let offset = (absolute - n * this.chunk_size) as usize;
                    if offset >= data.len() {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!("sub-chunk {} is shorter than expected", n),
                        )));
                    }
                    let left_in_range = (this.len() - this.position) as usize;
                    let take = (data.len() - offset).min(left_in_range).min(buf.remaining());
                    buf.put_slice(&data[offset..offset + take]);
                    this.position += take as u64;
                    return Poll::Ready(Ok(()));
                }
            }

            match this.loading.as_mut() {
                Some((loading, fut)) if *loading == n => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(data)) => {
                        this.loading = None;
                        this.current = Some((n, data));
                    }
                    Poll::Ready(Err(err)) => {
                        this.loading = None;
                        return Poll::Ready(Err(err));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                _ => this.start_loading(n),
            }
        }
    }
}

impl AsyncSeek for RangeReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        let this = self.get_mut();
        let target = this.seek_target(position)?;
        this.pending_seek = Some(target);
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        let this = self.get_mut();
        if let Some(target) = this.pending_seek.take() {
            this.position = target;
        }
        Poll::Ready(Ok(this.position))
    }
}

/// Parse an HTTP `Range` header against an object of `total_size` bytes.
///
/// Supports `bytes=a-b`, `bytes=a-` and the suffix form `bytes=-n`; multiple
/// ranges are rejected.
pub fn parse_range_header(header: &str, total_size: u64) -> GridResult<ByteRange> {
    let invalid = || GridError::invalid(format!("unsupported range header {:?}", header));
    let ranges = header.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
    if ranges.contains(',') {
        return Err(invalid());
    }
    let (first, last) = ranges.split_once('-').ok_or_else(invalid)?;
    let (first, last) = (first.trim(), last.trim());

    if first.is_empty() {
        let suffix: u64 = last.parse().map_err(|_| invalid())?;
        if suffix == 0 {
            return Err(invalid());
        }
        return Ok(ByteRange::new(total_size.saturating_sub(suffix), None));
    }

    let start: u64 = first.parse().map_err(|_| invalid())?;
    let end = if last.is_empty() {
        None
    } else {
        Some(last.parse::<u64>().map_err(|_| invalid())?)
    };
    if end.is_some_and(|end| end < start) {
        return Err(invalid());
    }
    Ok(ByteRange::new(start, end))
}
