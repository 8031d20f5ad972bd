//! Operations related to TAR archives

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;
use tokio_stream::Stream;
use tokio_tar::{Builder, Header};

/// Spawn a task that packs a single source file into a streamable tar
/// archive, for injection into a sandbox container's working directory.
///
/// The entry is a regular file named `name` with mode `0777` and the given
/// payload. Returns the archive stream to read from and the join handle to
/// the packing task.
pub fn stream_source_file(
    name: String,
    contents: Bytes,
) -> (
    impl Stream<Item = Result<BytesMut, std::io::Error>> + 'static,
    JoinHandle<Result<(), std::io::Error>>,
) {
    let (pipe_recv, pipe_send) = tokio::io::duplex(8192);
    let read_codec = tokio_util::codec::BytesCodec::new();
    let frame = tokio_util::codec::FramedRead::new(pipe_send, read_codec);

    let packing = tokio::spawn(async move {
        let mut tar = Builder::new(pipe_recv);
        let mut header = Header::new_gnu();
        header.set_path(&name)?;
        header.set_mode(0o777);
        header.set_size(contents.len() as u64);
        header.set_cksum();
        tar.append(&header, &*contents).await?;
        tar.finish().await
    });

    (frame, packing)
}
