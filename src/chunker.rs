use futures_util::Stream;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

/// Splits `stream` into chunks of exactly `chunk_size` bytes.
///
/// Only the final chunk may be shorter. An empty stream yields no chunks,
/// and short reads from the underlying reader are coalesced.
pub fn fixed_chunks(
    chunk_size: usize,
    mut stream: impl AsyncRead + Unpin,
) -> impl Stream<Item = Result<Vec<u8>, Error>> {
    async_stream::try_stream! {
        let mut exhausted = chunk_size == 0;

        while !exhausted {
            let mut data = Vec::with_capacity(chunk_size);
            let chunk_len = (&mut stream)
                .take(chunk_size as u64)
                .read_to_end(&mut data)
                .await?;

            exhausted = chunk_len < chunk_size;
            if chunk_len > 0 {
                yield data;
            }
        }
    }
}
